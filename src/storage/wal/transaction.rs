//! Log-side view of a transaction.
//!
//! A `SerialLogTransaction` exists from the first record a transaction
//! appends until a checkpoint no longer needs its records. It remembers
//! where its records start so the gopher can replay them, the block range
//! they span, and the outcome recorded in the log.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::wal::window::SerialLogWindow;
use crate::types::{TransId, Xid};

const NO_BLOCK: u64 = u64::MAX;

/// Outcome of a transaction as far as the log knows.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTransactionState {
    /// No outcome record seen yet.
    #[default]
    Unknown = 0,
    /// Prepared for two-phase commit; waiting for the coordinator.
    Prepared = 1,
    Committed = 2,
    RolledBack = 3,
}

impl LogTransactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LogTransactionState::Prepared,
            2 => LogTransactionState::Committed,
            3 => LogTransactionState::RolledBack,
            _ => LogTransactionState::Unknown,
        }
    }

    /// Returns true for committed or rolled back.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, LogTransactionState::Committed | LogTransactionState::RolledBack)
    }
}

/// Start of a record in the log.
#[derive(Clone)]
pub struct LogPosition {
    pub window: Arc<SerialLogWindow>,
    pub block_number: u64,
    /// Offset of the record within the block's data area.
    pub offset: usize,
}

impl fmt::Debug for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogPosition")
            .field("block_number", &self.block_number)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Per-transaction log state.
pub struct SerialLogTransaction {
    id: TransId,
    state: AtomicU8,
    xid: Mutex<Option<Xid>>,
    start: Mutex<Option<LogPosition>>,
    min_block: AtomicU64,
    max_block: AtomicU64,
    finished: AtomicBool,
    flushing: AtomicBool,
}

impl SerialLogTransaction {
    /// Creates a transaction with no records yet.
    #[must_use]
    pub fn new(id: TransId) -> Self {
        Self {
            id,
            state: AtomicU8::new(LogTransactionState::Unknown as u8),
            xid: Mutex::new(None),
            start: Mutex::new(None),
            min_block: AtomicU64::new(NO_BLOCK),
            max_block: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TransId {
        self.id
    }

    /// Outcome recorded so far.
    #[must_use]
    pub fn state(&self) -> LogTransactionState {
        LogTransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Records an outcome.
    pub fn set_state(&self, state: LogTransactionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// XID given at prepare time.
    #[must_use]
    pub fn xid(&self) -> Option<Xid> {
        self.xid.lock().clone()
    }

    pub fn set_xid(&self, xid: Xid) {
        *self.xid.lock() = Some(xid);
    }

    /// Returns true if this transaction was prepared with `xid`.
    #[must_use]
    pub fn has_xid(&self, xid: &Xid) -> bool {
        self.xid.lock().as_ref() == Some(xid)
    }

    /// Position of the first record.
    #[must_use]
    pub fn start(&self) -> Option<LogPosition> {
        self.start.lock().clone()
    }

    /// Records the position of the first record, keeping an earlier one.
    pub fn set_start(&self, position: LogPosition) {
        let mut start = self.start.lock();
        if start.is_none() {
            *start = Some(position);
        }
    }

    /// Widens the block range to include `block_number`.
    pub fn note_block(&self, block_number: u64) {
        self.min_block.fetch_min(block_number, Ordering::AcqRel);
        self.max_block.fetch_max(block_number, Ordering::AcqRel);
    }

    /// First block holding a record of this transaction.
    #[must_use]
    pub fn min_block(&self) -> Option<u64> {
        let block = self.min_block.load(Ordering::Acquire);
        (block != NO_BLOCK).then_some(block)
    }

    /// Last block holding a record of this transaction.
    #[must_use]
    pub fn max_block(&self) -> u64 {
        self.max_block.load(Ordering::Acquire)
    }

    /// Returns true once the gopher has replayed this transaction's records.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Returns true once a checkpoint has started flushing this transaction's pages.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    /// Ready for the gopher: rolled back, or committed with its records on disk.
    #[must_use]
    pub fn is_ripe(&self, high_water: u64) -> bool {
        match self.state() {
            LogTransactionState::RolledBack => true,
            LogTransactionState::Committed => self.max_block() <= high_water,
            _ => false,
        }
    }
}

impl fmt::Debug for SerialLogTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLogTransaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("min_block", &self.min_block())
            .field("max_block", &self.max_block())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}
