//! Crash and recovery scenarios.
//!
//! A "crash" drops the database without closing it: page caches are lost
//! and only what the serial log made durable survives.

mod common;

use common::{crash, create_db, reopen_db, small_log_config, test_config};
use serialdb::SerialDbError;
use tempfile::TempDir;

// =============================================================================
// Durability of committed work
// =============================================================================

mod durability_tests {
    use super::*;

    #[test]
    fn test_committed_insert_survives_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (section, record) = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            let record = db
                .insert_record(&txn, 0, section, b"alice")
                .expect("insert");
            db.commit(&txn).expect("commit");
            crash(db);
            (section, record)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(
            db.fetch_record(0, section, record).expect("fetch"),
            Some(b"alice".to_vec())
        );
        let summary = db.recovery_summary().expect("recovered");
        assert_eq!(summary.transactions_committed, 1);
        assert_eq!(summary.limbo_transactions, 0);
    }

    #[test]
    fn test_uncommitted_and_rolled_back_work_is_discarded() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (section, kept, rolled_back, unfinished) = {
            let db = create_db(temp_dir.path(), test_config());
            let setup = db.begin();
            let section = db.create_section(&setup, 0).expect("create section");
            let kept = db.insert_record(&setup, 0, section, b"kept").expect("insert");
            db.commit(&setup).expect("commit");

            let txn = db.begin();
            let rolled_back = db.insert_record(&txn, 0, section, b"undone").expect("insert");
            db.rollback(&txn).expect("rollback");
            db.wait_for_completion().expect("complete transactions");

            let open = db.begin();
            let unfinished = db.insert_record(&open, 0, section, b"pending").expect("insert");
            db.update_record(&open, 0, section, kept, b"overwritten")
                .expect("update");

            // Make the open transaction's records durable without committing it.
            let closer = db.begin();
            db.insert_record(&closer, 0, section, b"closer").expect("insert");
            db.commit(&closer).expect("commit");
            crash(db);
            (section, kept, rolled_back, unfinished)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(
            db.fetch_record(0, section, kept).expect("fetch"),
            Some(b"kept".to_vec())
        );
        if rolled_back != unfinished {
            assert_eq!(db.fetch_record(0, section, rolled_back).expect("fetch"), None);
        }
        assert_eq!(db.fetch_record(0, section, unfinished).expect("fetch"), None);
        assert!(db.recovery_summary().expect("recovered").transactions_rolled_back >= 1);
    }

    #[test]
    fn test_last_write_in_transaction_wins() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (section, record) = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            let record = db.insert_record(&txn, 0, section, b"v1").expect("insert");
            db.update_record(&txn, 0, section, record, b"v2").expect("update");
            db.commit(&txn).expect("commit");
            crash(db);
            (section, record)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(
            db.fetch_record(0, section, record).expect("fetch"),
            Some(b"v2".to_vec())
        );
    }

    #[test]
    fn test_committed_delete_and_batch_survive_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (section, first, second, third) = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            let first = db.insert_record(&txn, 0, section, b"one").expect("insert");
            let second = db.insert_record(&txn, 0, section, b"two").expect("insert");
            db.commit(&txn).expect("commit");

            let txn = db.begin();
            let third = db.reserve_record(&txn, 0, section).expect("reserve");
            db.update_records(
                &txn,
                vec![
                    serialdb::storage::wal::record::RecordUpdate {
                        table_space_id: 0,
                        section_id: section,
                        record_number: first,
                        inserted: false,
                        data: None,
                    },
                    serialdb::storage::wal::record::RecordUpdate {
                        table_space_id: 0,
                        section_id: section,
                        record_number: third,
                        inserted: true,
                        data: Some(b"three".to_vec()),
                    },
                ],
            )
            .expect("update records");
            db.delete_record(&txn, 0, section, second).expect("delete");
            db.commit(&txn).expect("commit");
            crash(db);
            (section, first, second, third)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(db.fetch_record(0, section, first).expect("fetch"), None);
        assert_eq!(db.fetch_record(0, section, second).expect("fetch"), None);
        assert_eq!(
            db.fetch_record(0, section, third).expect("fetch"),
            Some(b"three".to_vec())
        );
    }

    #[test]
    fn test_straddling_records_survive_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let payloads: Vec<Vec<u8>> = (0..12u8).map(|i| vec![i; 100 + 90 * usize::from(i)]).collect();
        let (section, records) = {
            let db = create_db(temp_dir.path(), small_log_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            let records: Vec<_> = payloads
                .iter()
                .map(|p| db.insert_record(&txn, 0, section, p).expect("insert"))
                .collect();
            db.commit(&txn).expect("commit");
            crash(db);
            (section, records)
        };

        let db = reopen_db(temp_dir.path(), small_log_config());
        for (record, payload) in records.iter().zip(&payloads) {
            assert_eq!(
                db.fetch_record(0, section, *record).expect("fetch").as_ref(),
                Some(payload)
            );
        }
    }

    #[test]
    fn test_early_written_blob_survives_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let blob: Vec<u8> = (0..3 * serialdb::EARLY_WRITE_THRESHOLD).map(|i| (i % 251) as u8).collect();
        let (section, record) = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            db.insert_record(&txn, 0, section, b"small").expect("insert");
            let record = db.reserve_record(&txn, 0, section).expect("reserve");
            db.update_blob(&txn, 0, section, record, &blob).expect("store blob");
            db.commit(&txn).expect("commit");
            crash(db);
            (section, record)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(db.fetch_record(0, section, record).expect("fetch"), Some(blob));
    }

    #[test]
    fn test_sequences_and_indexes_survive_crash() {
        use serialdb::storage::page::IndexPage;

        let temp_dir = TempDir::new().expect("create temp dir");
        let image = IndexPage {
            index_id: 0,
            level: 0,
            parent: 0,
            prior: 0,
            next: 0,
            data: b"key-1|key-2".to_vec(),
        };
        let (index_id, root) = {
            let db = create_db(temp_dir.path(), test_config());
            assert_eq!(db.next_sequence_value(0, 3, 2).expect("sequence"), 2);
            assert_eq!(db.next_sequence_value(0, 3, 3).expect("sequence"), 5);

            let txn = db.begin();
            let (index_id, root) = db.create_index(&txn, 0).expect("create index");
            let image = IndexPage { index_id, ..image.clone() };
            db.write_index_page(0, root, &image).expect("write index page");
            db.commit(&txn).expect("commit");
            crash(db);
            (index_id, root)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(db.next_sequence_value(0, 3, 0).expect("sequence"), 5);
        assert_eq!(db.index_root(0, index_id).expect("index root"), Some(root));
        let page = db.read_index_page(0, root).expect("read index page");
        assert_eq!(page.data, image.data);
        assert_eq!(page.index_id, index_id);
    }

    #[test]
    fn test_committed_drop_section_survives_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (dropped, kept) = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let dropped = db.create_section(&txn, 0).expect("create section");
            let kept = db.create_section(&txn, 0).expect("create section");
            db.insert_record(&txn, 0, dropped, b"gone").expect("insert");
            db.insert_record(&txn, 0, kept, b"stays").expect("insert");
            db.commit(&txn).expect("commit");

            let txn = db.begin();
            db.drop_section(&txn, 0, dropped).expect("drop section");
            db.commit(&txn).expect("commit");
            crash(db);
            (dropped, kept)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert!(db.fetch_record(0, dropped, 0).is_err());
        assert_eq!(db.fetch_record(0, kept, 0).expect("fetch"), Some(b"stays".to_vec()));
    }
}

// =============================================================================
// Checkpoints and replay
// =============================================================================

mod checkpoint_tests {
    use super::*;
    use serialdb::storage::wal::SerialLog;
    use serialdb::storage::TableSpaceManager;
    use std::sync::Arc;

    #[test]
    fn test_clean_close_leaves_nothing_to_redo() {
        let temp_dir = TempDir::new().expect("create temp dir");
        {
            let mut db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            db.insert_record(&txn, 0, section, b"row").expect("insert");
            db.commit(&txn).expect("commit");
            db.close().expect("close");
        }

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(db.redo_stats(0).expect("redo stats").total(), 0);
        assert!(db.recovery_summary().expect("recovered").last_checkpoint > 0);
    }

    #[test]
    fn test_crash_without_checkpoint_replays_page_images() {
        let temp_dir = TempDir::new().expect("create temp dir");
        {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            db.insert_record(&txn, 0, section, b"row").expect("insert");
            db.commit(&txn).expect("commit");
            crash(db);
        }

        let db = reopen_db(temp_dir.path(), test_config());
        let stats = db.redo_stats(0).expect("redo stats");
        assert!(stats.structural_pages > 0);
        assert_eq!(stats.sections_created, 1);
    }

    #[test]
    fn test_work_before_checkpoint_is_not_replayed() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (first, second) = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let first = db.create_section(&txn, 0).expect("create section");
            db.insert_record(&txn, 0, first, b"before").expect("insert");
            db.commit(&txn).expect("commit");
            db.wait_for_completion().expect("complete transactions");
            db.checkpoint().expect("checkpoint");

            let txn = db.begin();
            let second = db.create_section(&txn, 0).expect("create section");
            db.insert_record(&txn, 0, second, b"after").expect("insert");
            db.commit(&txn).expect("commit");
            crash(db);
            (first, second)
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(db.redo_stats(0).expect("redo stats").sections_created, 1);
        assert_eq!(db.fetch_record(0, first, 0).expect("fetch"), Some(b"before".to_vec()));
        assert_eq!(db.fetch_record(0, second, 0).expect("fetch"), Some(b"after".to_vec()));
    }

    #[test]
    fn test_replaying_onto_flushed_pages_is_idempotent() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let section = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            db.insert_record(&txn, 0, section, b"first").expect("insert");
            db.insert_record(&txn, 0, section, b"second").expect("insert");
            db.commit(&txn).expect("commit");
            crash(db);
            section
        };

        // Recover and write the pages back without a checkpoint, twice. The
        // second replay runs over pages that already hold its effects and
        // must leave the table space file byte for byte unchanged.
        let space_path = temp_dir.path().join("tablespace_0.db");
        let mut images = Vec::new();
        for _ in 0..2 {
            let spaces = Arc::new(TableSpaceManager::open(temp_dir.path(), 64).expect("open spaces"));
            let log = SerialLog::open(temp_dir.path(), test_config().log, Arc::clone(&spaces))
                .expect("open log");
            log.recover(false).expect("recover");
            spaces.flush_all().expect("flush pages");
            drop(log);
            drop(spaces);
            images.push(std::fs::read(&space_path).expect("read table space"));
        }
        assert_eq!(images[0].len(), images[1].len());
        assert!(images[0] == images[1], "second recovery changed the table space file");

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(db.fetch_record(0, section, 0).expect("fetch"), Some(b"first".to_vec()));
        assert_eq!(db.fetch_record(0, section, 1).expect("fetch"), Some(b"second".to_vec()));
    }

    #[test]
    fn test_transaction_ids_keep_increasing_across_restarts() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let last_id = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            db.create_section(&txn, 0).expect("create section");
            db.commit(&txn).expect("commit");
            let id = txn.id();
            crash(db);
            id
        };

        let db = reopen_db(temp_dir.path(), test_config());
        assert!(db.begin().id() > last_id);
    }
}

// =============================================================================
// Damaged and recycled log files
// =============================================================================

mod log_file_tests {
    use super::*;
    use serialdb::storage::wal::record::{DataUpdate, LogRecord};
    use std::fs;

    fn log_path(dir: &TempDir, index: usize) -> std::path::PathBuf {
        dir.path().join(serialdb::storage::wal::LOG_FILE_NAMES[index])
    }

    #[test]
    fn test_torn_tail_block_is_ignored() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let (section, durable, torn) = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            let durable = db.insert_record(&txn, 0, section, b"durable").expect("insert");
            db.commit(&txn).expect("commit");

            let txn = db.begin();
            let torn = db.insert_record(&txn, 0, section, b"torn").expect("insert");
            db.commit(&txn).expect("commit");
            crash(db);
            (section, durable, torn)
        };

        // Lose the trailer of the last block written.
        let path = log_path(&temp_dir, 0);
        let mut bytes = fs::read(&path).expect("read log");
        let last = bytes.len() - 1;
        bytes[last] = 0;
        fs::write(&path, &bytes).expect("write log");

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(
            db.fetch_record(0, section, durable).expect("fetch"),
            Some(b"durable".to_vec())
        );
        assert_ne!(db.fetch_record(0, section, torn).ok().flatten(), Some(b"torn".to_vec()));
        assert_eq!(db.recovery_summary().expect("recovered").transactions_committed, 1);
    }

    #[test]
    fn test_torn_straddling_record_is_ignored() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let payload = vec![0x5a; 1500];
        let (section, durable, torn) = {
            let db = create_db(temp_dir.path(), small_log_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            let durable = db.insert_record(&txn, 0, section, b"durable").expect("insert");
            db.commit(&txn).expect("commit");

            let txn = db.begin();
            let torn = db.insert_record(&txn, 0, section, &payload).expect("insert");
            db.commit(&txn).expect("commit");
            crash(db);
            (section, durable, torn)
        };

        // The long record spans several blocks; lose the last one.
        let path = log_path(&temp_dir, 0);
        let mut bytes = fs::read(&path).expect("read log");
        let last = bytes.len() - 1;
        bytes[last] = 0;
        fs::write(&path, &bytes).expect("write log");

        let later = {
            let db = reopen_db(temp_dir.path(), small_log_config());
            let summary = db.recovery_summary().expect("recovered");
            assert!(summary.torn_record_block.is_some());
            assert_eq!(summary.transactions_committed, 1);
            assert_eq!(
                db.fetch_record(0, section, durable).expect("fetch"),
                Some(b"durable".to_vec())
            );
            assert_ne!(db.fetch_record(0, section, torn).ok().flatten(), Some(payload.clone()));

            // The log stays usable: new work lands where the torn record was.
            let txn = db.begin();
            let later = db.insert_record(&txn, 0, section, b"later").expect("insert");
            db.commit(&txn).expect("commit");
            crash(db);
            later
        };

        let db = reopen_db(temp_dir.path(), small_log_config());
        assert_eq!(db.recovery_summary().expect("recovered").torn_record_block, None);
        assert_eq!(
            db.fetch_record(0, section, durable).expect("fetch"),
            Some(b"durable".to_vec())
        );
        assert_eq!(
            db.fetch_record(0, section, later).expect("fetch"),
            Some(b"later".to_vec())
        );
    }

    #[test]
    fn test_unknown_record_type_fails_recovery() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let payload = b"needle-payload-0123456789".to_vec();
        let encoded = {
            let db = create_db(temp_dir.path(), test_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            let record = db.insert_record(&txn, 0, section, &payload).expect("insert");
            db.commit(&txn).expect("commit");
            let encoded = LogRecord::DataUpdate(DataUpdate {
                table_space_id: 0,
                transaction_id: txn.id(),
                section_id: section,
                record_number: record,
                data: payload.clone(),
            })
            .to_bytes();
            crash(db);
            encoded
        };

        let path = log_path(&temp_dir, 0);
        let mut bytes = fs::read(&path).expect("read log");
        let at = bytes
            .windows(encoded.len())
            .position(|w| w == encoded.as_slice())
            .expect("record is in the log");
        // Tag 50 is not a record type.
        bytes[at] = 0x80 | 50;
        fs::write(&path, &bytes).expect("write log");

        let result = serialdb::Database::open(temp_dir.path(), test_config());
        match result {
            Err(SerialDbError::Recovery { block_number, message }) => {
                assert!(block_number > 0);
                assert!(!message.is_empty());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("recovery accepted an unknown record type"),
        }
    }

    #[test]
    fn test_writer_alternates_log_files() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let mut expected = Vec::new();
        let section = {
            let db = create_db(temp_dir.path(), small_log_config());
            let txn = db.begin();
            let section = db.create_section(&txn, 0).expect("create section");
            db.commit(&txn).expect("commit");

            for round in 0..6u8 {
                for i in 0..8u8 {
                    let txn = db.begin();
                    let data = vec![round * 8 + i; 64];
                    let record = db.insert_record(&txn, 0, section, &data).expect("insert");
                    db.commit(&txn).expect("commit");
                    expected.push((record, data));
                }
                db.wait_for_completion().expect("complete transactions");
                db.checkpoint().expect("checkpoint");
            }
            crash(db);
            section
        };

        assert!(fs::metadata(log_path(&temp_dir, 0)).expect("fl1").len() > 0);
        assert!(fs::metadata(log_path(&temp_dir, 1)).expect("fl2").len() > 0);

        let db = reopen_db(temp_dir.path(), small_log_config());
        for (record, data) in &expected {
            assert_eq!(
                db.fetch_record(0, section, *record).expect("fetch").as_ref(),
                Some(data)
            );
        }
    }
}

// =============================================================================
// Two-phase commit
// =============================================================================

mod xa_tests {
    use super::*;
    use serialdb::Xid;

    fn prepare_and_crash(dir: &TempDir, xid: &Xid) -> (u32, u32) {
        let db = create_db(dir.path(), test_config());
        let setup = db.begin();
        let section = db.create_section(&setup, 0).expect("create section");
        db.commit(&setup).expect("commit");

        let txn = db.begin();
        let record = db.insert_record(&txn, 0, section, b"in doubt").expect("insert");
        db.prepare(&txn, xid).expect("prepare");
        crash(db);
        (section, record)
    }

    #[test]
    fn test_prepared_transaction_is_in_limbo_after_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let xid = Xid::from("branch-1");
        prepare_and_crash(&temp_dir, &xid);

        let db = reopen_db(temp_dir.path(), test_config());
        let limbo = db.limbo_transactions();
        assert_eq!(limbo.len(), 1);
        assert_eq!(limbo[0].1, xid);
        assert_eq!(db.recover_limbo_transactions(), 1);
        assert_eq!(db.recover_get_next_limbo(0), Some((1, xid)));
        assert_eq!(db.recover_get_next_limbo(1), None);
        assert_eq!(db.recovery_summary().expect("recovered").limbo_transactions, 1);
    }

    #[test]
    fn test_commit_by_xid_applies_recovered_transaction() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let xid = Xid::from("branch-2");
        let (section, record) = prepare_and_crash(&temp_dir, &xid);

        let db = reopen_db(temp_dir.path(), test_config());
        assert_eq!(db.fetch_record(0, section, record).expect("fetch"), None);
        assert!(db.commit_by_xid(&xid).expect("commit by xid"));
        db.wait_for_completion().expect("complete transactions");

        assert_eq!(
            db.fetch_record(0, section, record).expect("fetch"),
            Some(b"in doubt".to_vec())
        );
        assert!(db.limbo_transactions().is_empty());
        assert!(!db.commit_by_xid(&xid).expect("second commit by xid"));
    }

    #[test]
    fn test_rollback_by_xid_discards_recovered_transaction() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let xid = Xid::from("branch-3");
        let (section, record) = prepare_and_crash(&temp_dir, &xid);

        let db = reopen_db(temp_dir.path(), test_config());
        assert!(db.rollback_by_xid(&xid).expect("rollback by xid"));
        db.wait_for_completion().expect("complete transactions");

        assert_eq!(db.fetch_record(0, section, record).expect("fetch"), None);
        assert!(db.limbo_transactions().is_empty());
    }

    #[test]
    fn test_limbo_decision_survives_second_crash() {
        let temp_dir = TempDir::new().expect("create temp dir");
        let xid = Xid::from("branch-4");
        let (section, record) = prepare_and_crash(&temp_dir, &xid);

        {
            let db = reopen_db(temp_dir.path(), test_config());
            assert!(db.commit_by_xid(&xid).expect("commit by xid"));
            crash(db);
        }

        let db = reopen_db(temp_dir.path(), test_config());
        assert!(db.limbo_transactions().is_empty());
        assert_eq!(
            db.fetch_record(0, section, record).expect("fetch"),
            Some(b"in doubt".to_vec())
        );
    }
}

// =============================================================================
// Property tests
// =============================================================================

mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn prop_committed_rows_survive_crash(
            ops in prop::collection::vec((any::<bool>(), prop::collection::vec(any::<u8>(), 1..600)), 1..16)
        ) {
            let temp_dir = TempDir::new().expect("create temp dir");
            let mut expected: HashMap<u32, Option<Vec<u8>>> = HashMap::new();
            let section = {
                let db = create_db(temp_dir.path(), small_log_config());
                let setup = db.begin();
                let section = db.create_section(&setup, 0).expect("create section");
                db.commit(&setup).expect("commit");

                for (commit, data) in &ops {
                    let txn = db.begin();
                    let record = db.insert_record(&txn, 0, section, data).expect("insert");
                    if *commit {
                        db.commit(&txn).expect("commit");
                        expected.insert(record, Some(data.clone()));
                    } else {
                        db.rollback(&txn).expect("rollback");
                        expected.entry(record).or_insert(None);
                    }
                }
                crash(db);
                section
            };

            let db = reopen_db(temp_dir.path(), small_log_config());
            for (record, data) in &expected {
                prop_assert_eq!(&db.fetch_record(0, section, *record).expect("fetch"), data);
            }
        }
    }
}
