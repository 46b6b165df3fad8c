//! Serial write-ahead log and crash recovery.
//!
//! Every change to a table space is appended to the serial log before it
//! reaches the page cache, and a transaction counts as committed once its
//! `Commit` record is on disk.
//!
//! # Architecture
//!
//! The log consists of:
//! - Two alternating files (`serial.fl1`, `serial.fl2`) holding numbered blocks
//! - Windows: in-memory buffers over a run of consecutive blocks of one file
//! - Self-delimiting varint-encoded records that may straddle blocks
//! - Log transactions tracking where each transaction's records are
//!
//! # Recovery Process
//!
//! On startup:
//! 1. Find the newest valid block chain and the read block it records
//! 2. Pass 1: count object incarnations and classify transactions
//! 3. Pass 2: redo current page images written after the last checkpoint
//! 4. Redo committed row changes, roll back the rest, keep prepared ones in limbo

mod block;
mod checkpointer;
mod control;
mod file;
mod gopher;
mod recovery;
mod recovery_objects;
mod serial_log;
mod transaction;
mod varint;
mod window;

pub mod record;

pub use block::{BlockHeader, BLOCK_HEADER_SIZE, BLOCK_MARKER_SIZE, BLOCK_TRAILER_SIZE, MIN_BLOCK_SIZE};
pub use checkpointer::Checkpointer;
pub use control::SerialLogControl;
pub use file::SerialLogFile;
pub use gopher::Gopher;
pub use recovery::RecoverySummary;
pub use recovery_objects::RecoveryObjects;
pub use serial_log::{SerialLog, SerialLogStats, SerialLogStatsSnapshot, LOG_FILE_NAMES};
pub use transaction::{LogPosition, LogTransactionState, SerialLogTransaction};
pub use varint::{LogInput, LogOutput, SliceInput};
pub use window::{ActiveWindow, SerialLogWindow};

/// First protocol version whose records carry table space ids.
pub const SRL_VERSION_TABLESPACES: u32 = 2;

/// Protocol version written by this build.
pub const SRL_CURRENT_VERSION: u32 = SRL_VERSION_TABLESPACES;

/// Default bytes per window.
pub const SRL_WINDOW_SIZE: usize = 1024 * 1024;

/// Serial log tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialLogConfig {
    /// Bytes per window buffer.
    pub window_size: usize,
    /// Largest block the writer builds. Small values force records to
    /// straddle blocks.
    pub max_block_size: usize,
    /// Alignment of blocks within a window and of windows within a file.
    pub sector_size: usize,
    /// Window buffers kept resident before inactive ones are dropped.
    pub window_buffers: usize,
    /// Gopher backlog above which new updates wait.
    pub max_transactions: usize,
    /// Sync log files on every flush.
    pub sync_writes: bool,
}

impl Default for SerialLogConfig {
    fn default() -> Self {
        Self {
            window_size: SRL_WINDOW_SIZE,
            max_block_size: SRL_WINDOW_SIZE,
            sector_size: 512,
            window_buffers: 10,
            max_transactions: 10,
            sync_writes: true,
        }
    }
}

impl SerialLogConfig {
    /// Clamps the settings into a usable range.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.sector_size = self.sector_size.max(1);
        self.window_size = self.window_size.max(block::round_up(MIN_BLOCK_SIZE + 16, self.sector_size));
        self.max_block_size = self.max_block_size.clamp(MIN_BLOCK_SIZE + 16, self.window_size);
        self.window_buffers = self.window_buffers.max(2);
        self
    }
}
