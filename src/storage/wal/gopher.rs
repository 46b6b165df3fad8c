//! Background completion of committed and rolled back transactions.
//!
//! A commit only appends a `Commit` record and flushes it. The gopher later
//! replays the transaction's own records from the log and applies their
//! effects to the table spaces (or discards them for a rollback), off the
//! commit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{Result, SerialDbError};
use crate::storage::wal::control::SerialLogControl;
use crate::storage::wal::serial_log::SerialLog;
use crate::storage::wal::transaction::{LogTransactionState, SerialLogTransaction};

const IDLE_WAIT: Duration = Duration::from_millis(100);

/// The completion worker.
pub struct Gopher {
    log: Arc<SerialLog>,
    /// Whether the worker should exit.
    shutdown: AtomicBool,
    /// Finish every ripe transaction before exiting.
    drain: AtomicBool,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Gopher {
    /// Creates a stopped gopher for `log`.
    #[must_use]
    pub fn new(log: Arc<SerialLog>) -> Arc<Self> {
        Arc::new(Self {
            log,
            shutdown: AtomicBool::new(false),
            drain: AtomicBool::new(false),
            thread_handle: Mutex::new(None),
        })
    }

    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("serialdb-gopher".to_string())
            .spawn(move || this.run())
            .map_err(|e| SerialDbError::StorageError(format!("Failed to spawn gopher thread: {e}")))?;
        *self.thread_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stops the worker. With `drain`, ripe transactions are completed first.
    ///
    /// # Errors
    ///
    /// Returns `ThreadPanic` if the worker panicked.
    pub fn stop(&self, drain: bool) -> Result<()> {
        self.drain.store(drain, Ordering::SeqCst);
        self.shutdown.store(true, Ordering::SeqCst);
        self.log.notify_transactions();

        if let Some(handle) = self.thread_handle.lock().take() {
            handle
                .join()
                .map_err(|_| SerialDbError::ThreadPanic("gopher".into()))?;
        }
        Ok(())
    }

    /// Returns true while the worker thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread_handle.lock().is_some()
    }

    fn run(&self) {
        debug!("gopher started");
        while let Some(transaction) = self.next_action() {
            let state = transaction.state();
            match Self::do_action(&self.log, &transaction) {
                Ok(()) => self.finish(&transaction, state),
                Err(e) => {
                    error!(transaction_id = transaction.id(), ?state, error = %e, "failed to complete transaction");
                    self.fail(transaction, &e);
                }
            }
        }
        self.log.unblock_updates();
        debug!("gopher stopped");
    }

    /// Waits for the oldest ripe transaction, or `None` at shutdown.
    fn next_action(&self) -> Option<Arc<SerialLogTransaction>> {
        let log = &self.log;
        let max_transactions = log.config().max_transactions;
        let mut lists = log.lock_transactions();
        loop {
            let high_water = log.high_water();
            let ripe = lists.pending.iter().position(|t| t.is_ripe(high_water));

            if self.shutdown.load(Ordering::SeqCst) && (!self.drain.load(Ordering::SeqCst) || ripe.is_none()) {
                return None;
            }
            if let Some(transaction) = ripe.and_then(|index| lists.pending.remove(index)) {
                lists.in_flight += 1;
                if lists.pending.len() > max_transactions {
                    log.block_updates();
                }
                return Some(transaction);
            }
            // Nothing ripe: release stalled writers.
            log.unblock_updates();
            log.wait_transactions(&mut lists, IDLE_WAIT);
        }
    }

    /// Replays one transaction's records through their `commit` or `rollback` actions.
    pub(crate) fn do_action(log: &SerialLog, transaction: &SerialLogTransaction) -> Result<()> {
        let Some(start) = transaction.start() else {
            return Ok(());
        };
        let id = transaction.id();
        let committed = transaction.state() == LogTransactionState::Committed;

        let mut control = SerialLogControl::new(log);
        control.set_completing(id);
        control.set_position(&start)?;
        while !control.is_finished() {
            let Some(record) = control.next_record()? else {
                break;
            };
            if record.transaction_id() != id {
                continue;
            }
            if committed {
                record.commit(&mut control)?;
            } else {
                record.rollback(&mut control)?;
            }
        }
        Ok(())
    }

    fn finish(&self, transaction: &Arc<SerialLogTransaction>, state: LogTransactionState) {
        let log = &self.log;
        let mut lists = log.lock_transactions();
        transaction.set_finished();
        lists.inactions.push(Arc::clone(transaction));
        lists.in_flight = lists.in_flight.saturating_sub(1);
        log.stats_counters().completed(state);
        log.notify_transactions();
    }

    /// Parks a transaction that could not be applied. It is never finished,
    /// so checkpoints keep its blocks readable.
    fn fail(&self, transaction: Arc<SerialLogTransaction>, err: &SerialDbError) {
        let log = &self.log;
        let mut lists = log.lock_transactions();
        lists.failed.push((transaction, err.to_string()));
        lists.in_flight = lists.in_flight.saturating_sub(1);
        log.notify_transactions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::{Commit, DataUpdate, LogRecord, Rollback};
    use crate::storage::wal::SerialLogConfig;
    use crate::storage::TableSpaceManager;
    use tempfile::TempDir;

    fn create_test_log() -> (Arc<SerialLog>, TempDir) {
        create_test_log_with(SerialLogConfig::default())
    }

    fn create_test_log_with(config: SerialLogConfig) -> (Arc<SerialLog>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let spaces = Arc::new(TableSpaceManager::create(temp_dir.path(), 64).unwrap());
        let log = SerialLog::open(temp_dir.path(), config, spaces).unwrap();
        log.initialize().unwrap();
        (Arc::new(log), temp_dir)
    }

    fn update(transaction_id: u32, data: &[u8]) -> LogRecord {
        LogRecord::DataUpdate(DataUpdate {
            table_space_id: 0,
            transaction_id,
            section_id: 4,
            record_number: 0,
            data: data.to_vec(),
        })
    }

    #[test]
    fn test_committed_transaction_is_applied() {
        let (log, _dir) = create_test_log();
        let space = log.table_space(0).unwrap();
        space.create_section(4, 1).unwrap();
        assert_eq!(space.insert_stub(4).unwrap(), 0);

        let gopher = Gopher::new(Arc::clone(&log));
        gopher.start().unwrap();

        log.append(&update(2, b"first")).unwrap();
        log.append(&update(2, b"second")).unwrap();
        let block = log.append(&LogRecord::Commit(Commit { transaction_id: 2 })).unwrap();
        log.flush(false, block).unwrap();
        log.end_transaction(2, LogTransactionState::Committed).unwrap();

        log.wait_for_completion().unwrap();
        assert_eq!(space.fetch_record(4, 0).unwrap(), Some(b"second".to_vec()));
        assert_eq!(log.stats().commits_completed, 1);
        assert!(log.find_transaction(2).unwrap().is_finished());

        gopher.stop(true).unwrap();
        assert!(!gopher.is_running());
    }

    #[test]
    fn test_rolled_back_transaction_is_discarded() {
        let (log, _dir) = create_test_log();
        let space = log.table_space(0).unwrap();
        space.create_section(4, 1).unwrap();
        space.insert_stub(4).unwrap();

        log.append(&update(3, b"never")).unwrap();
        log.append(&LogRecord::Rollback(Rollback { transaction_id: 3 })).unwrap();
        log.end_transaction(3, LogTransactionState::RolledBack).unwrap();

        let gopher = Gopher::new(Arc::clone(&log));
        gopher.start().unwrap();
        log.wait_for_completion().unwrap();
        gopher.stop(false).unwrap();

        assert_eq!(space.fetch_record(4, 0).unwrap(), None);
        assert_eq!(log.stats().rollbacks_completed, 1);
    }

    fn commit(log: &SerialLog, transaction_id: u32, record: LogRecord) {
        log.append(&record).unwrap();
        let block = log.append(&LogRecord::Commit(Commit { transaction_id })).unwrap();
        log.flush(false, block).unwrap();
        log.end_transaction(transaction_id, LogTransactionState::Committed).unwrap();
    }

    #[test]
    fn test_commit_backlog_stalls_writers_until_drained() {
        let config = SerialLogConfig {
            max_transactions: 2,
            ..SerialLogConfig::default()
        };
        let (log, _dir) = create_test_log_with(config);
        let space = log.table_space(0).unwrap();
        space.create_section(4, 1).unwrap();
        space.insert_stub(4).unwrap();

        for transaction_id in 2..5 {
            commit(&log, transaction_id, update(transaction_id, b"row"));
        }
        assert_eq!(log.pending_count(), 3);
        assert!(log.updates_blocked());

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let log = Arc::clone(&log);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                log.pre_update();
                done.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        let gopher = Gopher::new(Arc::clone(&log));
        gopher.start().unwrap();
        writer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
        assert!(log.stats().backlog_stalls >= 1);

        log.wait_for_completion().unwrap();
        assert_eq!(log.stats().commits_completed, 3);
        gopher.stop(true).unwrap();
        assert!(!log.updates_blocked());
    }

    #[test]
    fn test_failed_transaction_is_reported_and_pinned() {
        let (log, _dir) = create_test_log();
        let gopher = Gopher::new(Arc::clone(&log));
        gopher.start().unwrap();

        let missing_space = LogRecord::DataUpdate(DataUpdate {
            table_space_id: 9,
            transaction_id: 2,
            section_id: 4,
            record_number: 0,
            data: b"lost".to_vec(),
        });
        commit(&log, 2, missing_space);

        let result = log.wait_for_completion();
        assert!(matches!(result, Err(SerialDbError::CompletionFailed { transaction_id: 2, .. })));

        let transaction = log.find_transaction(2).unwrap();
        assert!(!transaction.is_finished());
        assert_eq!(log.stats().commits_completed, 0);

        log.checkpoint().unwrap();
        assert_eq!(log.read_block_number(), transaction.min_block().unwrap());

        gopher.stop(false).unwrap();
    }
}
