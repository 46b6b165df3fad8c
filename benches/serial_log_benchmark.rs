//! Serial log benchmarks.
//!
//! Measures:
//! - Raw record append throughput by payload size
//! - Commit latency through the full database path
//! - Recovery time after a crash

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use serialdb::storage::wal::record::{DataUpdate, LogRecord};
use serialdb::storage::wal::{SerialLog, SerialLogConfig};
use serialdb::storage::TableSpaceManager;
use serialdb::{Database, DatabaseConfig};
use tempfile::TempDir;

fn bench_config() -> DatabaseConfig {
    DatabaseConfig {
        log: SerialLogConfig {
            sync_writes: false,
            ..SerialLogConfig::default()
        },
        checkpoint_interval: Some(Duration::from_secs(1)),
        ..DatabaseConfig::default()
    }
}

/// Benchmark appending data records without flushing
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial_log_append");

    for size in &[64usize, 512, 2048] {
        let temp_dir = TempDir::new().expect("create temp dir");
        let spaces = Arc::new(TableSpaceManager::create(temp_dir.path(), 64).expect("create table spaces"));
        let log = SerialLog::open(
            temp_dir.path(),
            SerialLogConfig {
                sync_writes: false,
                ..SerialLogConfig::default()
            },
            spaces,
        )
        .expect("open log");
        log.initialize().expect("initialize log");

        let record = LogRecord::DataUpdate(DataUpdate {
            table_space_id: 0,
            transaction_id: 1,
            section_id: 4,
            record_number: 0,
            data: vec![0xAB; *size],
        });

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(log.append(&record).expect("append")));
        });
    }

    group.finish();
}

/// Benchmark a single-row insert and commit
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial_log_commit");

    let temp_dir = TempDir::new().expect("create temp dir");
    let db = Database::create(temp_dir.path(), bench_config()).expect("create database");
    let setup = db.begin();
    let section = db.create_section(&setup, 0).expect("create section");
    db.commit(&setup).expect("commit");

    group.throughput(Throughput::Elements(1));
    group.bench_function("insert_and_commit", |b| {
        b.iter(|| {
            let txn = db.begin();
            let record = db.insert_record(&txn, 0, section, b"benchmark row").expect("insert");
            db.commit(&txn).expect("commit");
            // Keep the gopher backlog and the section bounded.
            let cleanup = db.begin();
            db.delete_record(&cleanup, 0, section, record).expect("delete");
            db.commit(&cleanup).expect("commit");
            black_box(record)
        });
    });

    group.finish();
}

/// Benchmark recovery of committed inserts after a crash
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("serial_log_recovery");
    group.sample_size(10);

    for transactions in &[100u32, 1000] {
        group.throughput(Throughput::Elements(u64::from(*transactions)));
        group.bench_with_input(
            BenchmarkId::from_parameter(transactions),
            transactions,
            |b, &transactions| {
                b.iter_batched(
                    || {
                        let temp_dir = TempDir::new().expect("create temp dir");
                        let config = DatabaseConfig {
                            checkpoint_interval: None,
                            ..bench_config()
                        };
                        let db = Database::create(temp_dir.path(), config).expect("create database");
                        let setup = db.begin();
                        let section = db.create_section(&setup, 0).expect("create section");
                        db.commit(&setup).expect("commit");
                        for i in 0..transactions {
                            let txn = db.begin();
                            db.insert_record(&txn, 0, section, &i.to_le_bytes()).expect("insert");
                            db.commit(&txn).expect("commit");
                        }
                        // Crash: nothing but the log reaches disk.
                        drop(db);
                        temp_dir
                    },
                    |temp_dir| {
                        let db = Database::open(temp_dir.path(), bench_config()).expect("recover");
                        black_box(db.recovery_summary().map(|s| s.transactions_committed));
                        drop(db);
                        temp_dir
                    },
                    BatchSize::PerIteration,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_append, bench_commit, bench_recovery);
criterion_main!(benches);
