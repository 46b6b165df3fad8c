//! `TransactionManager` - hands out transactions and ends them through the log.
//!
//! The transaction manager:
//! - Assigns transaction ids above anything the log or table spaces remember
//! - Pools transaction objects and recycles them once the gopher is done
//! - Writes the `Commit`, `Rollback` and `Prepare` records
//! - Resolves limbo transactions by XID

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SerialDbError};
use crate::storage::wal::record::{Commit, LogRecord, Prepare, Rollback};
use crate::storage::wal::{LogTransactionState, SerialLog};
use crate::transaction::{Transaction, TransactionState};
use crate::types::{TransId, Xid};

/// Spare transaction objects allocated whenever the pool runs dry.
const EXTRA_TRANSACTIONS: usize = 10;

/// Counts of transaction objects by state, plus lifetime totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionSummary {
    pub available: usize,
    pub active: usize,
    pub limbo: usize,
    pub committed: usize,
    pub rolled_back: usize,
    pub started: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub reused: u64,
}

/// Manages transactions on behalf of a database.
pub struct TransactionManager {
    log: Arc<SerialLog>,
    /// Next transaction id.
    next_id: AtomicU32,
    /// Every transaction object, in use or not.
    transactions: Mutex<Vec<Arc<Transaction>>>,
    started: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    reused: AtomicU64,
}

impl TransactionManager {
    /// Creates a manager whose first id follows every id the log or the
    /// table space headers have seen.
    #[must_use]
    pub fn new(log: Arc<SerialLog>) -> Self {
        let next_id = log
            .table_spaces()
            .next_transaction_id()
            .max(log.max_transaction_id() + 1)
            .max(1);
        debug!(next_id, "transaction manager ready");
        Self {
            log,
            next_id: AtomicU32::new(next_id),
            transactions: Mutex::new(Vec::new()),
            started: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Id the next transaction will get.
    #[must_use]
    pub fn next_transaction_id(&self) -> TransId {
        self.next_id.load(Ordering::Acquire)
    }

    /// Starts a transaction.
    pub fn start_transaction(&self) -> Arc<Transaction> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.log.note_next_transaction_id(id + 1);
        self.started.fetch_add(1, Ordering::Relaxed);

        let mut transactions = self.transactions.lock();
        for transaction in transactions.iter() {
            if Arc::strong_count(transaction) == 1 && transaction.claim(id) {
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(transaction);
            }
        }

        let transaction = Arc::new(Transaction::new(id, TransactionState::Active));
        transactions.push(Arc::clone(&transaction));
        transactions.extend(
            (0..EXTRA_TRANSACTIONS).map(|_| Arc::new(Transaction::new(0, TransactionState::Available))),
        );
        transaction
    }

    /// Commits a transaction: its `Commit` record is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if the transaction is not active or in
    /// limbo, or an error if the log cannot be written.
    pub fn commit(&self, transaction: &Transaction) -> Result<()> {
        let from = Self::open_state(transaction)?;
        let id = transaction.id();
        if transaction.has_updates() {
            self.log.pre_update();
            let block = self
                .log
                .append(&LogRecord::Commit(Commit { transaction_id: id }))?;
            self.log.flush(false, block)?;
            self.log.end_transaction(id, LogTransactionState::Committed)?;
            transaction.set_write_pending(true);
        }
        transaction.transition(from, TransactionState::Committed)?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(transaction_id = id, "committed");
        Ok(())
    }

    /// Rolls a transaction back. Its changes are discarded by the gopher.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if the transaction is not active or in
    /// limbo, or an error if the log cannot be written.
    pub fn rollback(&self, transaction: &Transaction) -> Result<()> {
        let from = Self::open_state(transaction)?;
        let id = transaction.id();
        if transaction.has_updates() {
            self.log
                .append(&LogRecord::Rollback(Rollback { transaction_id: id }))?;
            self.log.end_transaction(id, LogTransactionState::RolledBack)?;
            transaction.set_write_pending(true);
        }
        transaction.transition(from, TransactionState::RolledBack)?;
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        debug!(transaction_id = id, "rolled back");
        Ok(())
    }

    /// Prepares a transaction for two-phase commit under `xid`.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if the transaction is not active, or an
    /// error if the log cannot be written.
    pub fn prepare(&self, transaction: &Transaction, xid: &Xid) -> Result<()> {
        transaction.check_active()?;
        let id = transaction.id();
        self.log.pre_update();
        let block = self.log.append(&LogRecord::Prepare(Prepare {
            transaction_id: id,
            xid: xid.clone(),
        }))?;
        self.log.flush(false, block)?;
        self.log.prepare_transaction(id, xid)?;
        transaction.mark_updated();
        transaction.set_xid(xid.clone());
        transaction.transition(TransactionState::Active, TransactionState::Limbo)?;
        info!(transaction_id = id, %xid, "prepared");
        Ok(())
    }

    /// Commits the limbo transaction prepared under `xid`.
    ///
    /// Returns false if no such transaction exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    pub fn commit_by_xid(&self, xid: &Xid) -> Result<bool> {
        if let Some(transaction) = self.find_limbo(xid) {
            self.commit(&transaction)?;
            return Ok(true);
        }
        let Some(transaction) = self.log.find_limbo(xid) else {
            return Ok(false);
        };
        let id = transaction.id();
        let block = self
            .log
            .append(&LogRecord::Commit(Commit { transaction_id: id }))?;
        self.log.flush(false, block)?;
        self.log.end_transaction(id, LogTransactionState::Committed)?;
        self.commits.fetch_add(1, Ordering::Relaxed);
        info!(transaction_id = id, %xid, "committed recovered limbo transaction");
        Ok(true)
    }

    /// Rolls back the limbo transaction prepared under `xid`.
    ///
    /// Returns false if no such transaction exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    pub fn rollback_by_xid(&self, xid: &Xid) -> Result<bool> {
        if let Some(transaction) = self.find_limbo(xid) {
            self.rollback(&transaction)?;
            return Ok(true);
        }
        let Some(transaction) = self.log.find_limbo(xid) else {
            return Ok(false);
        };
        let id = transaction.id();
        self.log
            .append(&LogRecord::Rollback(Rollback { transaction_id: id }))?;
        self.log.end_transaction(id, LogTransactionState::RolledBack)?;
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        info!(transaction_id = id, %xid, "rolled back recovered limbo transaction");
        Ok(true)
    }

    /// Returns finished transactions to the pool once the gopher has
    /// applied them and no caller holds them. Returns how many were freed.
    pub fn purge_transactions(&self) -> usize {
        let transactions = self.transactions.lock();
        let mut purged = 0;
        for transaction in transactions.iter() {
            let state = transaction.state();
            if !state.is_terminal() {
                continue;
            }
            if transaction.is_write_pending() {
                let done = self
                    .log
                    .find_transaction(transaction.id())
                    .map_or(true, |t| t.is_finished());
                if !done {
                    continue;
                }
                transaction.set_write_pending(false);
            }
            if Arc::strong_count(transaction) == 1 && transaction.transition(state, TransactionState::Available).is_ok() {
                purged += 1;
            }
        }
        purged
    }

    /// Counts transactions by state.
    #[must_use]
    pub fn summary(&self) -> TransactionSummary {
        let mut summary = TransactionSummary {
            started: self.started.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            ..TransactionSummary::default()
        };
        for transaction in self.transactions.lock().iter() {
            match transaction.state() {
                TransactionState::Available | TransactionState::Initializing => summary.available += 1,
                TransactionState::Active => summary.active += 1,
                TransactionState::Limbo => summary.limbo += 1,
                TransactionState::Committed => summary.committed += 1,
                TransactionState::RolledBack => summary.rolled_back += 1,
            }
        }
        summary
    }

    fn find_limbo(&self, xid: &Xid) -> Option<Arc<Transaction>> {
        self.transactions
            .lock()
            .iter()
            .find(|t| t.state() == TransactionState::Limbo && t.xid().as_ref() == Some(xid))
            .cloned()
    }

    fn open_state(transaction: &Transaction) -> Result<TransactionState> {
        match transaction.state() {
            state @ (TransactionState::Active | TransactionState::Limbo) => Ok(state),
            state => Err(SerialDbError::TransactionError(format!(
                "transaction {} is {state:?}",
                transaction.id()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::DataUpdate;
    use crate::storage::wal::SerialLogConfig;
    use crate::storage::TableSpaceManager;
    use tempfile::TempDir;

    fn create_test_manager() -> (TransactionManager, Arc<SerialLog>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let spaces = Arc::new(TableSpaceManager::create(temp_dir.path(), 16).unwrap());
        let log = Arc::new(SerialLog::open(temp_dir.path(), SerialLogConfig::default(), spaces).unwrap());
        log.initialize().unwrap();
        (TransactionManager::new(Arc::clone(&log)), log, temp_dir)
    }

    fn log_update(log: &SerialLog, transaction: &Transaction) {
        log.append(&LogRecord::DataUpdate(DataUpdate {
            table_space_id: 0,
            transaction_id: transaction.id(),
            section_id: 4,
            record_number: 0,
            data: b"row".to_vec(),
        }))
        .unwrap();
        transaction.mark_updated();
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let (manager, _log, _dir) = create_test_manager();
        let first = manager.start_transaction();
        let second = manager.start_transaction();
        assert!(second.id() > first.id());
        assert_eq!(first.state(), TransactionState::Active);
        assert_eq!(manager.summary().available, EXTRA_TRANSACTIONS - 1);
    }

    #[test]
    fn test_read_only_commit_logs_nothing() {
        let (manager, log, _dir) = create_test_manager();
        let transaction = manager.start_transaction();
        manager.commit(&transaction).unwrap();
        assert_eq!(transaction.state(), TransactionState::Committed);
        assert!(!transaction.is_write_pending());
        assert!(log.find_transaction(transaction.id()).is_none());
        assert!(manager.commit(&transaction).is_err());
    }

    #[test]
    fn test_commit_queues_log_transaction() {
        let (manager, log, _dir) = create_test_manager();
        let transaction = manager.start_transaction();
        log_update(&log, &transaction);
        manager.commit(&transaction).unwrap();

        assert!(transaction.is_write_pending());
        assert_eq!(log.pending_count(), 1);
        assert!(log.high_water() >= log.find_transaction(transaction.id()).unwrap().max_block());
    }

    #[test]
    fn test_finished_transactions_are_reused() {
        let (manager, _log, _dir) = create_test_manager();
        let transaction = manager.start_transaction();
        let old_id = transaction.id();
        manager.rollback(&transaction).unwrap();
        drop(transaction);

        assert_eq!(manager.purge_transactions(), 1);
        let next = manager.start_transaction();
        assert!(next.id() > old_id);
        assert_eq!(manager.summary().reused, 1);
        assert_eq!(manager.summary().started, 2);
    }

    #[test]
    fn test_prepare_then_commit_by_xid() {
        let (manager, log, _dir) = create_test_manager();
        let transaction = manager.start_transaction();
        log_update(&log, &transaction);
        let xid = Xid::from("global-1");
        manager.prepare(&transaction, &xid).unwrap();

        assert_eq!(transaction.state(), TransactionState::Limbo);
        assert_eq!(log.limbo_transactions(), vec![(transaction.id(), Some(xid.clone()))]);

        assert!(!manager.commit_by_xid(&Xid::from("other")).unwrap());
        assert!(manager.commit_by_xid(&xid).unwrap());
        assert_eq!(transaction.state(), TransactionState::Committed);
        assert!(log.limbo_transactions().is_empty());
    }
}
