//! Read cursor over the serial log.
//!
//! A `SerialLogControl` walks the block stream in block-number order and
//! decodes one record at a time. Record fields may continue into the next
//! block; the cursor follows them there and reports `LogOverrun` when the
//! log ends first. During recovery a record cut off by the end of the block
//! chain is a torn tail: the cursor stops before it and remembers where it
//! started.

use std::sync::Arc;

use tracing::warn;

use crate::error::{Result, SerialDbError};
use crate::storage::wal::block::{read_marker, BLOCK_MARKER_SIZE};
use crate::storage::wal::record::{LogRecord, RecordType};
use crate::storage::wal::serial_log::SerialLog;
use crate::storage::wal::transaction::{LogPosition, SerialLogTransaction};
use crate::storage::wal::varint::LogInput;
use crate::storage::wal::window::SerialLogWindow;
use crate::storage::wal::SRL_CURRENT_VERSION;
use crate::types::TransId;

/// Cursor over the records of a [`SerialLog`].
pub struct SerialLogControl<'a> {
    log: &'a SerialLog,
    window: Option<Arc<SerialLogWindow>>,
    block_number: u64,
    /// Data area of the current block, marker included.
    data: Vec<u8>,
    offset: usize,
    version: u32,
    record_start: Option<LogPosition>,
    last_checkpoint: u64,
    completing: Option<TransId>,
    finished: bool,
    /// Set when a read ran off the last block of the chain.
    hit_end: bool,
    torn_record: Option<LogPosition>,
}

impl<'a> SerialLogControl<'a> {
    /// Creates an unpositioned cursor.
    #[must_use]
    pub fn new(log: &'a SerialLog) -> Self {
        Self {
            log,
            window: None,
            block_number: 0,
            data: Vec::new(),
            offset: 0,
            version: SRL_CURRENT_VERSION,
            record_start: None,
            last_checkpoint: 0,
            completing: None,
            finished: false,
            hit_end: false,
            torn_record: None,
        }
    }

    /// The log being read.
    #[must_use]
    pub fn log(&self) -> &'a SerialLog {
        self.log
    }

    /// Block the cursor is reading.
    #[must_use]
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// Position of the record most recently returned by [`next_record`](Self::next_record).
    #[must_use]
    pub fn record_start(&self) -> Option<&LogPosition> {
        self.record_start.as_ref()
    }

    fn load(&mut self, block_number: u64) -> Result<bool> {
        match self.log.read_block_data(block_number)? {
            Some((window, data)) => {
                let (version, _) = read_marker(&data, block_number)?;
                self.version = version;
                self.window = Some(window);
                self.block_number = block_number;
                self.data = data;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start of a record that the end of the log cut off, found during recovery.
    #[must_use]
    pub fn torn_record(&self) -> Option<&LogPosition> {
        self.torn_record.as_ref()
    }

    /// Positions the cursor on the first record that starts in `block_number`,
    /// skipping the tail of a record continued from the previous block.
    ///
    /// Returns false if the block is not in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the block cannot be read or has no marker.
    pub fn set_block(&mut self, block_number: u64) -> Result<bool> {
        if !self.load(block_number)? {
            return Ok(false);
        }
        let (_, skip) = read_marker(&self.data, block_number)?;
        self.offset = BLOCK_MARKER_SIZE + skip;
        Ok(true)
    }

    /// Positions the cursor on a record recorded earlier.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the block is no longer in the log.
    pub fn set_position(&mut self, position: &LogPosition) -> Result<()> {
        if !self.load(position.block_number)? {
            return Err(SerialDbError::LogError(format!(
                "block {} is no longer in the serial log",
                position.block_number
            )));
        }
        self.offset = position.offset;
        Ok(())
    }

    fn advance(&mut self, at_record_boundary: bool) -> Result<bool> {
        let next = self.block_number + 1;
        if !self.load(next)? {
            return Ok(false);
        }
        self.offset = BLOCK_MARKER_SIZE;
        if at_record_boundary {
            let (_, skip) = read_marker(&self.data, next)?;
            self.offset += skip;
        }
        Ok(true)
    }

    /// Decodes the next record, or returns `None` at the end of the log.
    ///
    /// While the log is recovering, a record that runs off the end of the
    /// block chain also ends the log; [`torn_record`](Self::torn_record)
    /// then names where it started.
    ///
    /// # Errors
    ///
    /// Returns `LogError` for an unknown tag, `LogOverrun` when a record is cut
    /// off by the end of the log, or `DataOverrun` for a bad length.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>> {
        if self.data.is_empty() || self.torn_record.is_some() {
            return Ok(None);
        }
        loop {
            if self.offset >= self.data.len() {
                if !self.advance(true)? {
                    return Ok(None);
                }
                continue;
            }

            let start = LogPosition {
                window: self.current_window()?,
                block_number: self.block_number,
                offset: self.offset,
            };
            self.hit_end = false;
            match self.decode_one() {
                Ok(Some(record)) => {
                    self.record_start = Some(start);
                    return Ok(Some(record));
                }
                Ok(None) => continue,
                Err(e) if self.hit_end && self.log.is_recovering() => {
                    warn!(
                        block = start.block_number,
                        offset = start.offset,
                        error = %e,
                        "serial log ends inside a record, ignoring the torn tail"
                    );
                    self.torn_record = Some(start);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Decodes one record, or `None` for an end or version marker.
    fn decode_one(&mut self) -> Result<Option<LogRecord>> {
        let tag = self.get_int()?;
        if tag == RecordType::End as i32 {
            return Ok(None);
        }
        if tag == RecordType::Version as i32 {
            self.version = self.get_int()? as u32;
            self.get_length()?;
            return Ok(None);
        }
        LogRecord::decode(tag, self).map(Some)
    }

    fn current_window(&self) -> Result<Arc<SerialLogWindow>> {
        self.window
            .clone()
            .ok_or_else(|| SerialDbError::InvariantViolation("log cursor has no window".into()))
    }

    // ------------------------------------------------------------------
    // Replay context used by the record kinds.
    // ------------------------------------------------------------------

    /// Registers the transaction of the record just read, widening its block
    /// range and remembering where its first record starts.
    pub fn register_transaction(&mut self, transaction_id: TransId) -> Arc<SerialLogTransaction> {
        let transaction = self.log.get_transaction(transaction_id);
        if let Some(start) = &self.record_start {
            transaction.note_block(start.block_number);
            transaction.set_start(start.clone());
        }
        transaction.note_block(self.block_number);
        transaction
    }

    /// Finds or creates the log transaction `transaction_id`.
    pub fn get_transaction(&self, transaction_id: TransId) -> Arc<SerialLogTransaction> {
        self.log.get_transaction(transaction_id)
    }

    /// Notes a checkpoint record seen during pass 1.
    pub fn have_checkpoint(&mut self, block_number: u64) {
        self.last_checkpoint = self.last_checkpoint.max(block_number);
    }

    /// Block of the newest checkpoint seen so far.
    #[must_use]
    pub fn last_checkpoint(&self) -> u64 {
        self.last_checkpoint
    }

    /// Carries the checkpoint found by an earlier pass.
    pub fn set_last_checkpoint(&mut self, block_number: u64) {
        self.last_checkpoint = block_number;
    }

    /// Returns true if the current block was written after the last
    /// checkpoint flushed the page caches.
    #[must_use]
    pub fn is_post_flush(&self) -> bool {
        self.block_number > self.last_checkpoint
    }

    /// Marks the cursor as replaying `transaction_id` for the gopher.
    pub fn set_completing(&mut self, transaction_id: TransId) {
        self.completing = Some(transaction_id);
        self.finished = false;
    }

    /// Stops the replay once the completing transaction's outcome record is reached.
    pub fn finish_if_completing(&mut self, transaction_id: TransId) {
        if self.completing == Some(transaction_id) {
            self.finished = true;
        }
    }

    /// Returns true once the completing transaction's outcome record was replayed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl LogInput for SerialLogControl<'_> {
    fn get_byte(&mut self) -> Result<u8> {
        loop {
            if let Some(&byte) = self.data.get(self.offset) {
                self.offset += 1;
                return Ok(byte);
            }
            if !self.advance(false)? {
                self.hit_end = true;
                return Err(SerialDbError::LogOverrun {
                    block_number: self.block_number,
                });
            }
        }
    }

    fn get_data(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(length.min(self.data.len()));
        while data.len() < length {
            if self.offset >= self.data.len() {
                if !self.advance(false)? {
                    self.hit_end = true;
                    return Err(SerialDbError::DataOverrun {
                        block_number: self.block_number,
                        requested: length as i64,
                    });
                }
                continue;
            }
            let take = (length - data.len()).min(self.data.len() - self.offset);
            data.extend_from_slice(&self.data[self.offset..self.offset + take]);
            self.offset += take;
        }
        Ok(data)
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn block_number(&self) -> u64 {
        self.block_number
    }
}
