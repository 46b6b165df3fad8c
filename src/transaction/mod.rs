//! Transactions as seen by callers of the database.
//!
//! A [`Transaction`] is the handle a caller holds while changing records.
//! Its log-side counterpart is a
//! [`SerialLogTransaction`](crate::storage::wal::SerialLogTransaction),
//! which tracks where the transaction's records sit in the serial log
//! until the gopher has applied them.

mod manager;
mod state;

pub use manager::{TransactionManager, TransactionSummary};
pub use state::{AtomicTransactionState, TransactionState};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, SerialDbError};
use crate::types::{TransId, Xid};

/// A caller's transaction.
///
/// Transaction objects are pooled by the [`TransactionManager`]: once a
/// transaction has finished and its log records have been applied, the
/// object is returned to the `Available` state and handed out again under
/// a new id.
#[derive(Debug)]
pub struct Transaction {
    id: AtomicU32,
    state: AtomicTransactionState,
    xid: Mutex<Option<Xid>>,
    /// Set once any record has been logged on behalf of this transaction.
    has_updates: AtomicBool,
    /// Committed or rolled back, but the gopher has not finished with it.
    write_pending: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(id: TransId, state: TransactionState) -> Self {
        Self {
            id: AtomicU32::new(id),
            state: AtomicTransactionState::new(state),
            xid: Mutex::new(None),
            has_updates: AtomicBool::new(false),
            write_pending: AtomicBool::new(false),
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TransId {
        self.id.load(Ordering::Acquire)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    /// XID assigned at prepare time.
    #[must_use]
    pub fn xid(&self) -> Option<Xid> {
        self.xid.lock().clone()
    }

    /// Returns true if anything was logged for this transaction.
    #[must_use]
    pub fn has_updates(&self) -> bool {
        self.has_updates.load(Ordering::Acquire)
    }

    /// Returns true while the gopher still owes work for this transaction.
    #[must_use]
    pub fn is_write_pending(&self) -> bool {
        self.write_pending.load(Ordering::Acquire)
    }

    /// Notes that a record was logged for this transaction.
    pub fn mark_updated(&self) {
        self.has_updates.store(true, Ordering::Release);
    }

    /// Fails unless the transaction can still log changes.
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if the transaction is not active.
    pub fn check_active(&self) -> Result<()> {
        match self.state() {
            TransactionState::Active => Ok(()),
            state => Err(SerialDbError::TransactionError(format!(
                "transaction {} is {state:?}, not active",
                self.id()
            ))),
        }
    }

    pub(crate) fn transition(&self, from: TransactionState, to: TransactionState) -> Result<()> {
        self.state.transition(from, to)
    }

    /// Claims an available object for a new transaction `id`.
    pub(crate) fn claim(&self, id: TransId) -> bool {
        if !self
            .state
            .try_transition(TransactionState::Available, TransactionState::Initializing)
        {
            return false;
        }
        self.id.store(id, Ordering::Release);
        *self.xid.lock() = None;
        self.has_updates.store(false, Ordering::Release);
        self.write_pending.store(false, Ordering::Release);
        self.state
            .try_transition(TransactionState::Initializing, TransactionState::Active)
    }

    pub(crate) fn set_xid(&self, xid: Xid) {
        *self.xid.lock() = Some(xid);
    }

    pub(crate) fn set_write_pending(&self, pending: bool) {
        self.write_pending.store(pending, Ordering::Release);
    }
}
