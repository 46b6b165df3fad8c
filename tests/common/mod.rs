//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use serialdb::storage::wal::SerialLogConfig;
use serialdb::{Database, DatabaseConfig};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Small caches, no background checkpoints, no fsync.
pub fn test_config() -> DatabaseConfig {
    DatabaseConfig {
        page_cache_pages: 256,
        log: SerialLogConfig {
            sync_writes: false,
            ..SerialLogConfig::default()
        },
        checkpoint_interval: None,
        debug_recovery: true,
    }
}

/// A config whose log uses tiny windows and blocks, so records straddle
/// blocks and the writer moves between windows and files quickly.
pub fn small_log_config() -> DatabaseConfig {
    DatabaseConfig {
        log: SerialLogConfig {
            window_size: 4096,
            max_block_size: 256,
            window_buffers: 2,
            sync_writes: false,
            ..SerialLogConfig::default()
        },
        ..test_config()
    }
}

pub fn create_db(path: &Path, config: DatabaseConfig) -> Database {
    init_tracing();
    Database::create(path, config).expect("create database")
}

pub fn reopen_db(path: &Path, config: DatabaseConfig) -> Database {
    init_tracing();
    Database::open(path, config).expect("reopen database")
}

/// Drops the database without closing it: workers stop, nothing is flushed.
pub fn crash(db: Database) {
    drop(db);
}
