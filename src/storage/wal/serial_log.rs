//! The serial log: writer, window ring, log transactions and checkpoints.
//!
//! # Locking
//!
//! The write state (`ws`) guards the open block and the blocks closed but
//! not yet written. Locks are always taken in this order:
//!
//! ```text
//! table space structure -> ws -> flush_io
//!                          ws -> transactions
//!                          ws -> windows
//! transactions -> updates_blocked
//! ```
//!
//! Nothing takes `ws` while holding `transactions`, `windows` or `flush_io`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

use crate::error::{Result, SerialDbError};
use crate::storage::wal::block::{
    patch_skip, round_up, write_marker, BlockHeader, BLOCK_HEADER_SIZE, BLOCK_MARKER_SIZE,
    BLOCK_TRAILER, BLOCK_TRAILER_SIZE, MIN_BLOCK_SIZE,
};
use crate::storage::wal::file::SerialLogFile;
use crate::storage::wal::record::{Checkpoint, LogRecord};
use crate::storage::wal::recovery_objects::RecoveryObjects;
use crate::storage::wal::transaction::{LogPosition, LogTransactionState, SerialLogTransaction};
use crate::storage::wal::window::SerialLogWindow;
use crate::storage::wal::{SerialLogConfig, SRL_CURRENT_VERSION};
use crate::storage::{PageJournal, StructureLocks, TableSpace, TableSpaceManager};
use crate::types::{IndexId, ObjectState, PageNumber, SectionId, TableSpaceId, TransId, Xid};
use crate::util::DenseArray;

/// Names of the two alternating log files.
pub const LOG_FILE_NAMES: [&str; 2] = ["serial.fl1", "serial.fl2"];

const NO_BLOCK: u64 = u64::MAX;
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Serial log activity counters.
#[derive(Debug, Default)]
pub struct SerialLogStats {
    windows_read: AtomicU64,
    windows_written: AtomicU64,
    blocks_written: AtomicU64,
    commits_completed: AtomicU64,
    rollbacks_completed: AtomicU64,
    backlog_stalls: AtomicU64,
    records_appended: AtomicU64,
}

/// Point-in-time copy of [`SerialLogStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialLogStatsSnapshot {
    /// Windows whose buffer was read back from disk.
    pub windows_read: u64,
    /// Write calls issued, one per run of contiguous blocks.
    pub windows_written: u64,
    pub blocks_written: u64,
    /// Committed transactions completed by the gopher.
    pub commits_completed: u64,
    /// Rolled back transactions completed by the gopher.
    pub rollbacks_completed: u64,
    /// Updates that waited for the gopher backlog to drain.
    pub backlog_stalls: u64,
    pub records_appended: u64,
}

impl SerialLogStats {
    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn completed(&self, state: LogTransactionState) {
        match state {
            LogTransactionState::RolledBack => Self::add(&self.rollbacks_completed, 1),
            _ => Self::add(&self.commits_completed, 1),
        }
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> SerialLogStatsSnapshot {
        SerialLogStatsSnapshot {
            windows_read: self.windows_read.load(Ordering::Relaxed),
            windows_written: self.windows_written.load(Ordering::Relaxed),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            commits_completed: self.commits_completed.load(Ordering::Relaxed),
            rollbacks_completed: self.rollbacks_completed.load(Ordering::Relaxed),
            backlog_stalls: self.backlog_stalls.load(Ordering::Relaxed),
            records_appended: self.records_appended.load(Ordering::Relaxed),
        }
    }
}

/// The block currently being filled.
struct OpenBlock {
    number: u64,
    offset: usize,
    write_ptr: usize,
    /// Where the trailer goes once the block is full.
    limit: usize,
    /// The block began inside a record that has not ended yet.
    continued: bool,
}

/// A finished block waiting for the next flush.
struct ClosedBlock {
    window: Arc<SerialLogWindow>,
    number: u64,
    offset: usize,
    length: usize,
}

struct WriteState {
    window: Arc<SerialLogWindow>,
    block: Option<OpenBlock>,
    next_block_number: u64,
    closed: Vec<ClosedBlock>,
    /// Windows the writer has left whose blocks may not be on disk yet.
    retiring: Vec<Arc<SerialLogWindow>>,
    force_new_window: bool,
}

/// Log transactions by lifecycle stage.
#[derive(Default)]
pub(crate) struct TransactionLists {
    /// Writing records, outcome not yet logged.
    pub(crate) running: BTreeMap<TransId, Arc<SerialLogTransaction>>,
    /// Outcome logged, waiting for the gopher.
    pub(crate) pending: VecDeque<Arc<SerialLogTransaction>>,
    /// Completed, pages not yet flushed by a checkpoint.
    pub(crate) inactions: Vec<Arc<SerialLogTransaction>>,
    /// Prepared, waiting for an XA decision.
    pub(crate) limbo: BTreeMap<TransId, Arc<SerialLogTransaction>>,
    /// Transactions the gopher took off `pending` and is still applying.
    pub(crate) in_flight: usize,
    /// Transactions whose changes could not be applied, with the reason.
    /// They are never finished, so their blocks stay readable.
    pub(crate) failed: Vec<(Arc<SerialLogTransaction>, String)>,
}

impl TransactionLists {
    fn find(&self, transaction_id: TransId) -> Option<&Arc<SerialLogTransaction>> {
        self.running
            .get(&transaction_id)
            .or_else(|| self.limbo.get(&transaction_id))
            .or_else(|| self.pending.iter().find(|t| t.id() == transaction_id))
            .or_else(|| self.inactions.iter().find(|t| t.id() == transaction_id))
            .or_else(|| self.failed.iter().map(|(t, _)| t).find(|t| t.id() == transaction_id))
    }

    fn live(&self) -> impl Iterator<Item = &Arc<SerialLogTransaction>> {
        self.running
            .values()
            .chain(self.limbo.values())
            .chain(self.pending.iter())
            .chain(self.inactions.iter())
            .chain(self.failed.iter().map(|(t, _)| t))
    }

    fn take_open(&mut self, transaction_id: TransId) -> Option<Arc<SerialLogTransaction>> {
        self.running
            .remove(&transaction_id)
            .or_else(|| self.limbo.remove(&transaction_id))
    }
}

/// Write-ahead log shared by every table space of a database.
pub struct SerialLog {
    config: SerialLogConfig,
    table_spaces: Arc<TableSpaceManager>,
    files: [Arc<SerialLogFile>; 2],
    creation_time: AtomicU32,

    ws: Mutex<Option<WriteState>>,
    writing_block: AtomicU64,
    flush_io: Mutex<()>,
    flushing_through: AtomicU64,
    high_water: AtomicU64,
    write_failed: AtomicBool,
    windows: Mutex<Vec<Arc<SerialLogWindow>>>,

    transactions: Mutex<TransactionLists>,
    transactions_changed: Condvar,
    next_transaction_id: AtomicU32,

    checkpoint_block: AtomicU64,
    checkpoint_lock: Mutex<()>,

    recovering: AtomicBool,
    pass1: AtomicBool,
    pages: Mutex<RecoveryObjects>,
    sections: Mutex<RecoveryObjects>,
    indexes: Mutex<RecoveryObjects>,
    section_use: Mutex<HashMap<TableSpaceId, DenseArray<i32>>>,

    updates_blocked: Mutex<bool>,
    updates_unblocked: Condvar,

    stats: SerialLogStats,
}

impl SerialLog {
    /// Opens (creating if needed) the log files in `directory`.
    ///
    /// The log is not writable until [`initialize`](Self::initialize) or
    /// recovery starts the writer.
    ///
    /// # Errors
    ///
    /// Returns an error if a log file cannot be opened.
    pub fn open(directory: &Path, config: SerialLogConfig, table_spaces: Arc<TableSpaceManager>) -> Result<Self> {
        let config = config.normalized();
        let files = [
            Arc::new(SerialLogFile::open(&directory.join(LOG_FILE_NAMES[0]), 0)?),
            Arc::new(SerialLogFile::open(&directory.join(LOG_FILE_NAMES[1]), 1)?),
        ];
        Ok(Self {
            config,
            table_spaces,
            files,
            creation_time: AtomicU32::new(0),
            ws: Mutex::new(None),
            writing_block: AtomicU64::new(NO_BLOCK),
            flush_io: Mutex::new(()),
            flushing_through: AtomicU64::new(0),
            high_water: AtomicU64::new(0),
            write_failed: AtomicBool::new(false),
            windows: Mutex::new(Vec::new()),
            transactions: Mutex::new(TransactionLists::default()),
            transactions_changed: Condvar::new(),
            next_transaction_id: AtomicU32::new(0),
            checkpoint_block: AtomicU64::new(0),
            checkpoint_lock: Mutex::new(()),
            recovering: AtomicBool::new(false),
            pass1: AtomicBool::new(false),
            pages: Mutex::new(RecoveryObjects::new()),
            sections: Mutex::new(RecoveryObjects::new()),
            indexes: Mutex::new(RecoveryObjects::new()),
            section_use: Mutex::new(HashMap::new()),
            updates_blocked: Mutex::new(false),
            updates_unblocked: Condvar::new(),
            stats: SerialLogStats::default(),
        })
    }

    /// Starts an empty log for a new database, discarding old file contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be truncated.
    pub fn initialize(&self) -> Result<()> {
        for file in &self.files {
            file.zap()?;
        }
        self.set_creation_time(now_seconds());
        self.start_writer(0, 0, 1)?;
        info!(creation_time = self.creation_time(), "initialized serial log");
        Ok(())
    }

    /// Log tuning in effect.
    #[must_use]
    pub fn config(&self) -> &SerialLogConfig {
        &self.config
    }

    /// Returns the activity counters.
    #[must_use]
    pub fn stats(&self) -> SerialLogStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_counters(&self) -> &SerialLogStats {
        &self.stats
    }

    /// Creation time stamped in every block header.
    #[must_use]
    pub fn creation_time(&self) -> u32 {
        self.creation_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_creation_time(&self, creation_time: u32) {
        self.creation_time.store(creation_time, Ordering::Release);
    }

    pub(crate) fn files(&self) -> &[Arc<SerialLogFile>; 2] {
        &self.files
    }

    /// Highest block known to be on disk.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water.load(Ordering::Acquire)
    }

    /// Block currently being filled, if any.
    #[must_use]
    pub fn writing_block(&self) -> Option<u64> {
        let block = self.writing_block.load(Ordering::Acquire);
        (block != NO_BLOCK).then_some(block)
    }

    /// Block through which the last checkpoint flushed the page caches.
    #[must_use]
    pub fn checkpoint_block(&self) -> u64 {
        self.checkpoint_block.load(Ordering::Acquire)
    }

    /// Looks up a table space.
    ///
    /// # Errors
    ///
    /// Returns `TableSpaceNotFound` for an unknown id.
    pub fn table_space(&self, table_space_id: TableSpaceId) -> Result<Arc<TableSpace>> {
        self.table_spaces.get(table_space_id)
    }

    /// The table spaces this log protects.
    #[must_use]
    pub fn table_spaces(&self) -> &Arc<TableSpaceManager> {
        &self.table_spaces
    }

    /// Returns true while recovery is replaying the log.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    pub(crate) fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Writer.
    // ------------------------------------------------------------------

    /// Opens a fresh write window and makes the log writable.
    pub(crate) fn start_writer(&self, file_index: usize, origin: u64, next_block_number: u64) -> Result<()> {
        let file = Arc::clone(&self.files[file_index % 2]);
        let window = Arc::new(SerialLogWindow::for_writing(file, origin, self.config.window_size));
        self.windows.lock().push(Arc::clone(&window));
        *self.ws.lock() = Some(WriteState {
            window,
            block: None,
            next_block_number,
            closed: Vec::new(),
            retiring: Vec::new(),
            force_new_window: false,
        });
        let last = next_block_number.saturating_sub(1);
        self.high_water.fetch_max(last, Ordering::AcqRel);
        self.flushing_through.fetch_max(last, Ordering::AcqRel);
        debug!(file = file_index, origin, next_block_number, "started serial log writer");
        Ok(())
    }

    /// Makes the log writable again at a record cut off by a crash.
    ///
    /// The block holding the start of the record is reopened under its own
    /// number at its own place in the file, keeping only the bytes before
    /// the record. The partial record is overwritten by the next flush.
    pub(crate) fn resume_writer(&self, position: &LogPosition) -> Result<()> {
        let window = &position.window;
        let block_number = position.block_number;
        let block_offset = window.block_offset(block_number).ok_or_else(|| {
            SerialDbError::InvariantViolation(format!("block {block_number} is not in its recovery window"))
        })?;
        let prefix = {
            let (active, _) = window.activate()?;
            let mut data = active.block_data(block_number, None)?;
            if data.len() < position.offset || position.offset < BLOCK_MARKER_SIZE {
                return Err(SerialDbError::LogError(format!(
                    "torn record offset {} is outside block {block_number}",
                    position.offset
                )));
            }
            data.truncate(position.offset);
            data
        };

        self.start_writer(window.file().index(), window.origin() + block_offset as u64, block_number)?;
        let mut guard = self.ws.lock();
        let ws = guard.as_mut().ok_or_else(Self::not_writable)?;
        self.open_block(ws, false)?;
        let block = ws.block.as_mut().ok_or_else(Self::not_writable)?;
        let start = block.offset + BLOCK_HEADER_SIZE;
        {
            let (active, _) = ws.window.activate()?;
            active.with_buffer_mut(|buf| buf[start..start + prefix.len()].copy_from_slice(&prefix))?;
        }
        block.write_ptr = start + prefix.len();
        info!(block_number, offset = position.offset, "resumed serial log writer before a torn record");
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.write_failed.load(Ordering::Acquire) {
            Err(SerialDbError::LogWriteFailed)
        } else {
            Ok(())
        }
    }

    fn not_writable() -> SerialDbError {
        SerialDbError::LogError("serial log is not open for writing".into())
    }

    /// Appends one record and returns the block holding its last byte.
    ///
    /// A record with a transaction id registers the transaction, its first
    /// record position and its block range.
    ///
    /// # Errors
    ///
    /// Returns `LogWriteFailed` after an earlier write error, or an error if
    /// the log is not writable.
    pub fn append(&self, record: &LogRecord) -> Result<u64> {
        let mut bytes = Vec::with_capacity(32);
        record.encode(&mut bytes, SRL_CURRENT_VERSION);
        let transaction_id = record.transaction_id();

        let mut guard = self.ws.lock();
        self.check_writable()?;
        let ws = guard.as_mut().ok_or_else(Self::not_writable)?;
        self.start_record(ws)?;

        let transaction = if transaction_id == 0 {
            None
        } else {
            let block = ws.block.as_ref().ok_or_else(Self::not_writable)?;
            let transaction = self.get_transaction(transaction_id);
            transaction.note_block(block.number);
            transaction.set_start(LogPosition {
                window: Arc::clone(&ws.window),
                block_number: block.number,
                offset: block.write_ptr - block.offset - BLOCK_HEADER_SIZE,
            });
            Some(transaction)
        };

        self.put_data(ws, &bytes)?;
        let block_number = self.end_record(ws)?;
        if let Some(transaction) = transaction {
            transaction.note_block(block_number);
        }
        drop(guard);

        SerialLogStats::add(&self.stats.records_appended, 1);
        trace!(block_number, transaction_id, "appended {record}");
        Ok(block_number)
    }

    fn start_record(&self, ws: &mut WriteState) -> Result<()> {
        let has_room = ws.block.as_ref().is_some_and(|b| b.write_ptr < b.limit);
        if !has_room {
            self.close_block(ws)?;
            self.open_block(ws, false)?;
        }
        Ok(())
    }

    fn put_data(&self, ws: &mut WriteState, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let (start, room) = match ws.block.as_ref() {
                Some(block) => (block.write_ptr, block.limit - block.write_ptr),
                None => return Err(Self::not_writable()),
            };
            if room == 0 {
                self.close_block(ws)?;
                self.open_block(ws, true)?;
                continue;
            }
            let n = room.min(data.len());
            let (active, _) = ws.window.activate()?;
            active.with_buffer_mut(|buf| buf[start..start + n].copy_from_slice(&data[..n]))?;
            drop(active);
            if let Some(block) = ws.block.as_mut() {
                block.write_ptr += n;
            }
            data = &data[n..];
        }
        Ok(())
    }

    fn end_record(&self, ws: &mut WriteState) -> Result<u64> {
        let block = ws.block.as_mut().ok_or_else(Self::not_writable)?;
        if block.continued {
            let skip = block.write_ptr - block.offset - BLOCK_HEADER_SIZE - BLOCK_MARKER_SIZE;
            let marker = block.offset + BLOCK_HEADER_SIZE;
            let (active, _) = ws.window.activate()?;
            active.with_buffer_mut(|buf| patch_skip(&mut buf[marker..], skip as i32))?;
            block.continued = false;
        }
        Ok(block.number)
    }

    fn open_block(&self, ws: &mut WriteState, continued: bool) -> Result<()> {
        let sector = self.config.sector_size;
        let mut offset = round_up(ws.window.current_length(), sector);
        if ws.force_new_window || offset + MIN_BLOCK_SIZE + 1 > ws.window.size() {
            self.new_window(ws);
            offset = 0;
        }

        let size = self.config.max_block_size.min(ws.window.size() - offset);
        let number = ws.next_block_number;
        let data_start = offset + BLOCK_HEADER_SIZE + BLOCK_MARKER_SIZE;
        {
            let (active, _) = ws.window.activate()?;
            active.with_buffer_mut(|buf| {
                write_marker(&mut buf[offset + BLOCK_HEADER_SIZE..], SRL_CURRENT_VERSION, 0);
            })?;
        }
        ws.window.add_block(number, offset);
        ws.window.set_current_length(data_start);
        ws.next_block_number += 1;
        ws.block = Some(OpenBlock {
            number,
            offset,
            write_ptr: data_start,
            limit: offset + size - BLOCK_TRAILER_SIZE,
            continued,
        });
        self.writing_block.store(number, Ordering::Release);
        Ok(())
    }

    /// Finishes the open block: skip count, trailer and header.
    fn close_block(&self, ws: &mut WriteState) -> Result<()> {
        let Some(block) = ws.block.take() else {
            return Ok(());
        };
        let read_block_number = self.read_block_number().min(block.number);
        let length = block.write_ptr + BLOCK_TRAILER_SIZE - block.offset;
        let header = BlockHeader {
            block_number: block.number,
            read_block_number,
            length: length as u32,
            creation_time: self.creation_time(),
            version: SRL_CURRENT_VERSION as u16,
        };
        {
            let (active, _) = ws.window.activate()?;
            active.with_buffer_mut(|buf| {
                if block.continued {
                    let skip = block.write_ptr - block.offset - BLOCK_HEADER_SIZE - BLOCK_MARKER_SIZE;
                    patch_skip(&mut buf[block.offset + BLOCK_HEADER_SIZE..], skip as i32);
                }
                buf[block.write_ptr] = BLOCK_TRAILER;
                header.encode(&mut buf[block.offset..]);
            })?;
        }
        ws.window.set_current_length(block.offset + length);
        ws.closed.push(ClosedBlock {
            window: Arc::clone(&ws.window),
            number: block.number,
            offset: block.offset,
            length,
        });
        self.writing_block.store(NO_BLOCK, Ordering::Release);
        Ok(())
    }

    /// Moves the writer to a new window, alternating files when the other
    /// file holds nothing the log still needs.
    fn new_window(&self, ws: &mut WriteState) {
        let read_block = self.read_block_number();
        let old = Arc::clone(&ws.window);
        let window = {
            let mut windows = self.windows.lock();
            Self::release_dead_windows(&mut windows, read_block);

            let other = 1 - old.file().index();
            let other_live = windows.iter().any(|w| w.file().index() == other);
            let (file, origin) = if other_live {
                let origin = old.origin() + round_up(old.current_length(), self.config.sector_size) as u64;
                (Arc::clone(old.file()), origin)
            } else {
                (Arc::clone(&self.files[other]), 0)
            };
            let window = Arc::new(SerialLogWindow::for_writing(file, origin, self.config.window_size));
            windows.push(Arc::clone(&window));
            window
        };
        debug!(
            file = window.file().index(),
            origin = window.origin(),
            read_block,
            "moved serial log writer to a new window"
        );
        ws.retiring.push(old);
        ws.window = window;
        ws.force_new_window = false;
        self.evict_buffers();
    }

    /// Makes every record appended so far durable through `commit_block`.
    ///
    /// Returns at once if `commit_block` is already on disk, waits for an
    /// in-progress write that covers it, and otherwise closes the open block
    /// and writes every closed block. A `commit_block` of 0 flushes
    /// everything. Returns the highest block on disk.
    ///
    /// # Errors
    ///
    /// Returns the write error, or `LogWriteFailed` after an earlier one.
    pub fn flush(&self, force_new_window: bool, commit_block: u64) -> Result<u64> {
        let mut guard = self.ws.lock();
        loop {
            self.check_writable()?;
            if commit_block != 0 && commit_block <= self.high_water() {
                return Ok(self.high_water());
            }
            if commit_block != 0 && commit_block <= self.flushing_through.load(Ordering::Acquire) {
                drop(guard);
                drop(self.flush_io.lock());
                guard = self.ws.lock();
                continue;
            }
            break;
        }

        let ws = guard.as_mut().ok_or_else(Self::not_writable)?;
        self.close_block(ws)?;
        if force_new_window {
            ws.force_new_window = true;
        }
        let blocks = std::mem::take(&mut ws.closed);
        let io = self.flush_io.lock();
        let Some(through) = blocks.last().map(|b| b.number) else {
            return Ok(self.high_water());
        };
        self.flushing_through.fetch_max(through, Ordering::AcqRel);
        drop(guard);

        if let Err(e) = self.write_blocks(&blocks) {
            self.write_failed.store(true, Ordering::Release);
            error!(error = %e, through, "serial log write failed");
            return Err(e);
        }
        self.high_water.fetch_max(through, Ordering::AcqRel);
        drop(io);
        drop(blocks);

        self.retire_windows(through);
        self.wake_gopher();
        Ok(through)
    }

    fn write_blocks(&self, blocks: &[ClosedBlock]) -> Result<()> {
        let sector = self.config.sector_size;
        let mut touched = HashSet::new();
        let mut i = 0;
        while i < blocks.len() {
            let window = &blocks[i].window;
            let start = blocks[i].offset;
            let mut end = start + blocks[i].length;
            let mut j = i + 1;
            while j < blocks.len()
                && Arc::ptr_eq(&blocks[j].window, window)
                && blocks[j].offset == round_up(end, sector)
            {
                end = blocks[j].offset + blocks[j].length;
                j += 1;
            }

            let bytes = {
                let (active, _) = window.activate()?;
                active.read_range(start, end - start)?
            };
            window.file().write(window.origin() + start as u64, &bytes)?;
            touched.insert(window.file().index());
            SerialLogStats::add(&self.stats.windows_written, 1);
            SerialLogStats::add(&self.stats.blocks_written, (j - i) as u64);
            i = j;
        }
        if self.config.sync_writes {
            for index in touched {
                self.files[index].sync()?;
            }
        }
        Ok(())
    }

    fn retire_windows(&self, through: u64) {
        if let Some(ws) = self.ws.lock().as_mut() {
            ws.retiring.retain(|window| {
                let written = window.last_block_number().map_or(true, |last| last <= through);
                if written {
                    window.set_writing(false);
                }
                !written
            });
        }
        self.evict_buffers();
    }

    // ------------------------------------------------------------------
    // Windows and readers.
    // ------------------------------------------------------------------

    /// Oldest block recovery would need: the block after the last
    /// checkpoint, or the first block of the oldest live log transaction.
    #[must_use]
    pub fn read_block_number(&self) -> u64 {
        let mut read_block = self.checkpoint_block() + 1;
        let lists = self.transactions.lock();
        for transaction in lists.live() {
            if let Some(first) = transaction.min_block() {
                read_block = read_block.min(first);
            }
        }
        read_block.max(1)
    }

    fn release_dead_windows(windows: &mut Vec<Arc<SerialLogWindow>>, read_block: u64) {
        windows.retain(|window| {
            let before_read = window.last_block_number().map_or(true, |last| last < read_block);
            !(before_read && Arc::strong_count(window) == 1 && !window.is_writing())
        });
    }

    /// Drops windows nothing needs any more.
    pub fn release_windows(&self) {
        let read_block = self.read_block_number();
        let mut windows = self.windows.lock();
        let before = windows.len();
        Self::release_dead_windows(&mut windows, read_block);
        if windows.len() != before {
            debug!(released = before - windows.len(), read_block, "released serial log windows");
        }
    }

    /// Number of windows still holding needed blocks.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.lock().len()
    }

    /// Index of the file the writer is currently filling.
    #[must_use]
    pub fn current_file(&self) -> Option<usize> {
        self.ws.lock().as_ref().map(|ws| ws.window.file().index())
    }

    pub(crate) fn install_windows(&self, windows: Vec<Arc<SerialLogWindow>>) {
        *self.windows.lock() = windows;
        self.evict_buffers();
    }

    fn find_window(&self, block_number: u64) -> Option<Arc<SerialLogWindow>> {
        self.windows
            .lock()
            .iter()
            .rev()
            .find(|w| w.contains_block(block_number))
            .cloned()
    }

    fn evict_buffers(&self) {
        let windows = self.windows.lock();
        let mut resident = windows.iter().filter(|w| w.has_buffer()).count();
        for window in windows.iter() {
            if resident <= self.config.window_buffers {
                break;
            }
            if window.release_buffer() {
                resident -= 1;
            }
        }
    }

    /// Copies the data area (marker included) of `block_number`.
    ///
    /// The block being written is read up to the last appended byte.
    /// Returns `None` if the block is not in the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the window cannot be read back.
    pub fn read_block_data(&self, block_number: u64) -> Result<Option<(Arc<SerialLogWindow>, Vec<u8>)>> {
        {
            let guard = self.ws.lock();
            if let Some(ws) = guard.as_ref() {
                if let Some(block) = ws.block.as_ref().filter(|b| b.number == block_number) {
                    let start = block.offset + BLOCK_HEADER_SIZE;
                    let (active, _) = ws.window.activate()?;
                    let data = active.read_range(start, block.write_ptr - start)?;
                    return Ok(Some((Arc::clone(&ws.window), data)));
                }
            }
        }

        let Some(window) = self.find_window(block_number) else {
            return Ok(None);
        };
        let (data, loaded) = {
            let (active, loaded) = window.activate()?;
            (active.block_data(block_number, None)?, loaded)
        };
        if loaded {
            SerialLogStats::add(&self.stats.windows_read, 1);
            self.evict_buffers();
        }
        Ok(Some((window, data)))
    }

    // ------------------------------------------------------------------
    // Log transactions.
    // ------------------------------------------------------------------

    /// Finds or creates the log transaction `transaction_id`.
    pub fn get_transaction(&self, transaction_id: TransId) -> Arc<SerialLogTransaction> {
        let mut lists = self.transactions.lock();
        if let Some(transaction) = lists.find(transaction_id) {
            return Arc::clone(transaction);
        }
        let transaction = Arc::new(SerialLogTransaction::new(transaction_id));
        lists.running.insert(transaction_id, Arc::clone(&transaction));
        transaction
    }

    /// Finds the log transaction `transaction_id`.
    #[must_use]
    pub fn find_transaction(&self, transaction_id: TransId) -> Option<Arc<SerialLogTransaction>> {
        self.transactions.lock().find(transaction_id).cloned()
    }

    /// Records a transaction's outcome and queues it for the gopher.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction` if the transaction has no log records or
    /// already has an outcome.
    pub fn end_transaction(&self, transaction_id: TransId, state: LogTransactionState) -> Result<()> {
        let mut lists = self.transactions.lock();
        let transaction = lists
            .take_open(transaction_id)
            .ok_or(SerialDbError::UnknownTransaction(transaction_id))?;
        transaction.set_state(state);
        lists.pending.push_back(transaction);
        if lists.pending.len() > self.config.max_transactions {
            self.block_updates();
        }
        self.transactions_changed.notify_all();
        Ok(())
    }

    /// Moves a running transaction to limbo after its `Prepare` record is durable.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransaction` if the transaction is not running.
    pub fn prepare_transaction(&self, transaction_id: TransId, xid: &Xid) -> Result<()> {
        let mut lists = self.transactions.lock();
        let transaction = lists
            .running
            .remove(&transaction_id)
            .ok_or(SerialDbError::UnknownTransaction(transaction_id))?;
        transaction.set_xid(xid.clone());
        transaction.set_state(LogTransactionState::Prepared);
        lists.limbo.insert(transaction_id, transaction);
        Ok(())
    }

    /// Limbo transactions in id order.
    #[must_use]
    pub fn limbo_transactions(&self) -> Vec<(TransId, Option<Xid>)> {
        self.transactions
            .lock()
            .limbo
            .values()
            .map(|t| (t.id(), t.xid()))
            .collect()
    }

    /// Finds a limbo transaction by XID.
    #[must_use]
    pub fn find_limbo(&self, xid: &Xid) -> Option<Arc<SerialLogTransaction>> {
        self.transactions
            .lock()
            .limbo
            .values()
            .find(|t| t.has_xid(xid))
            .cloned()
    }

    /// Highest transaction id the log has seen.
    #[must_use]
    pub fn max_transaction_id(&self) -> TransId {
        let lists = self.transactions.lock();
        lists.live().map(|t| t.id()).max().unwrap_or(0)
    }

    /// Remembers the next unused transaction id for the next checkpoint.
    pub fn note_next_transaction_id(&self, next: TransId) {
        self.next_transaction_id.fetch_max(next, Ordering::AcqRel);
    }

    pub(crate) fn lock_transactions(&self) -> MutexGuard<'_, TransactionLists> {
        self.transactions.lock()
    }

    /// Waits on the transaction lists for at most `timeout`.
    pub(crate) fn wait_transactions(&self, lists: &mut MutexGuard<'_, TransactionLists>, timeout: Duration) {
        self.transactions_changed.wait_for(lists, timeout);
    }

    pub(crate) fn notify_transactions(&self) {
        self.transactions_changed.notify_all();
    }

    fn wake_gopher(&self) {
        let _lists = self.transactions.lock();
        self.transactions_changed.notify_all();
    }

    /// Blocks until the gopher has completed every queued transaction.
    ///
    /// # Errors
    ///
    /// Returns `CompletionFailed` for the first transaction the gopher
    /// could not apply.
    pub fn wait_for_completion(&self) -> Result<()> {
        let mut lists = self.transactions.lock();
        while !lists.pending.is_empty() || lists.in_flight > 0 {
            self.transactions_changed.wait_for(&mut lists, WAIT_SLICE);
        }
        match lists.failed.first() {
            Some((transaction, message)) => Err(SerialDbError::CompletionFailed {
                transaction_id: transaction.id(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Number of transactions queued for the gopher or being applied.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let lists = self.transactions.lock();
        lists.pending.len() + lists.in_flight
    }

    // ------------------------------------------------------------------
    // Backpressure.
    // ------------------------------------------------------------------

    /// Stalls new updates until the gopher drains its backlog.
    pub fn block_updates(&self) {
        let mut blocked = self.updates_blocked.lock();
        if !*blocked {
            *blocked = true;
            debug!(max_transactions = self.config.max_transactions, "blocking updates");
        }
    }

    /// Releases stalled updates.
    pub fn unblock_updates(&self) {
        let mut blocked = self.updates_blocked.lock();
        if *blocked {
            *blocked = false;
            self.updates_unblocked.notify_all();
            debug!("unblocking updates");
        }
    }

    /// Returns true while updates are stalled.
    #[must_use]
    pub fn updates_blocked(&self) -> bool {
        *self.updates_blocked.lock()
    }

    /// Waits while updates are blocked. Called before every logged update.
    pub fn pre_update(&self) {
        let mut blocked = self.updates_blocked.lock();
        if *blocked {
            SerialLogStats::add(&self.stats.backlog_stalls, 1);
            while *blocked {
                self.updates_unblocked.wait_for(&mut blocked, WAIT_SLICE);
            }
        }
    }

    // ------------------------------------------------------------------
    // Incarnations and object activity.
    // ------------------------------------------------------------------

    pub(crate) fn set_pass1(&self, pass1: bool) {
        self.pass1.store(pass1, Ordering::Release);
    }

    pub(crate) fn reset_recovery_objects(&self) {
        self.pages.lock().reset();
        self.sections.lock().reset();
        self.indexes.lock().reset();
    }

    pub(crate) fn clear_recovery_objects(&self) {
        self.pages.lock().clear();
        self.sections.lock().clear();
        self.indexes.lock().clear();
    }

    /// Counts a page state change. In pass 1 a page seen for the first time
    /// is reserved in its table space's inventory.
    ///
    /// # Errors
    ///
    /// Returns an error if the table space is unknown or the inventory fails.
    pub fn bump_page_incarnation(
        &self,
        page_number: PageNumber,
        table_space_id: TableSpaceId,
        state: ObjectState,
    ) -> Result<bool> {
        let pass1 = self.pass1.load(Ordering::Acquire);
        let current = self.pages.lock().bump(table_space_id, page_number, state, pass1);
        if pass1 && current {
            self.table_space(table_space_id)?.realloc_page(page_number)?;
        }
        Ok(current)
    }

    /// Counts a section state change.
    ///
    /// # Errors
    ///
    /// Never fails today; shares the signature of the page variant.
    pub fn bump_section_incarnation(
        &self,
        section_id: SectionId,
        table_space_id: TableSpaceId,
        state: ObjectState,
    ) -> Result<bool> {
        let pass1 = self.pass1.load(Ordering::Acquire);
        Ok(self.sections.lock().bump(table_space_id, section_id, state, pass1))
    }

    /// Counts an index state change.
    ///
    /// # Errors
    ///
    /// Never fails today; shares the signature of the page variant.
    pub fn bump_index_incarnation(
        &self,
        index_id: IndexId,
        table_space_id: TableSpaceId,
        state: ObjectState,
    ) -> Result<bool> {
        let pass1 = self.pass1.load(Ordering::Acquire);
        Ok(self.indexes.lock().bump(table_space_id, index_id, state, pass1))
    }

    #[must_use]
    pub fn is_section_active(&self, section_id: SectionId, table_space_id: TableSpaceId) -> bool {
        self.sections.lock().is_object_active(table_space_id, section_id)
    }

    pub fn set_section_active(&self, section_id: SectionId, table_space_id: TableSpaceId) {
        self.sections.lock().set_active(table_space_id, section_id);
    }

    pub fn set_section_inactive(&self, section_id: SectionId, table_space_id: TableSpaceId) {
        self.sections.lock().set_inactive(table_space_id, section_id);
    }

    #[must_use]
    pub fn is_index_active(&self, index_id: IndexId, table_space_id: TableSpaceId) -> bool {
        self.indexes.lock().is_object_active(table_space_id, index_id)
    }

    pub fn set_index_active(&self, index_id: IndexId, table_space_id: TableSpaceId) {
        self.indexes.lock().set_active(table_space_id, index_id);
    }

    pub fn set_index_inactive(&self, index_id: IndexId, table_space_id: TableSpaceId) {
        self.indexes.lock().set_inactive(table_space_id, index_id);
    }

    /// Adjusts the count of logged but uncompleted updates against a section.
    pub fn update_section_use_vector(&self, section_id: SectionId, table_space_id: TableSpaceId, delta: i32) {
        if self.is_recovering() {
            return;
        }
        let mut uses = self.section_use.lock();
        *uses.entry(table_space_id).or_default().get_mut(section_id) += delta;
    }

    /// Returns true while a section has updates the gopher has not completed.
    #[must_use]
    pub fn section_in_use(&self, section_id: SectionId, table_space_id: TableSpaceId) -> bool {
        self.section_use
            .lock()
            .get(&table_space_id)
            .is_some_and(|uses| uses.get(section_id) > 0)
    }

    // ------------------------------------------------------------------
    // Checkpoints.
    // ------------------------------------------------------------------

    /// Flushes every page cache and records the point recovery can start from.
    ///
    /// Returns the block through which pages are now on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or a table space cannot be flushed.
    pub fn checkpoint(&self) -> Result<u64> {
        let _serial = self.checkpoint_lock.lock();
        {
            let lists = self.transactions.lock();
            for transaction in &lists.inactions {
                transaction.set_flushing(true);
            }
        }

        let next_transaction_id = self.next_transaction_id.load(Ordering::Acquire);
        if next_transaction_id > 0 {
            self.table_spaces.set_next_transaction_id(next_transaction_id)?;
        }

        let spaces = self.table_spaces.all();
        let (block, pages) = {
            let _locks = StructureLocks::acquire(&spaces);
            let block = self.flush(false, 0)?;
            let mut pages = 0;
            for space in &spaces {
                pages += space.flush()?;
            }
            (block, pages)
        };

        self.append(&LogRecord::Checkpoint(Checkpoint { block_number: block }))?;
        self.flush(false, 0)?;
        let released = self.page_cache_flushed(block);
        self.release_windows();
        info!(block, pages, released, "checkpoint complete");
        Ok(block)
    }

    /// Forgets completed transactions whose pages reached disk before `block`.
    fn page_cache_flushed(&self, block: u64) -> usize {
        let mut lists = self.transactions.lock();
        let before = lists.inactions.len();
        lists
            .inactions
            .retain(|t| !(t.is_flushing() && t.max_block() < block));
        self.checkpoint_block.fetch_max(block, Ordering::AcqRel);
        before - lists.inactions.len()
    }

    pub(crate) fn set_checkpoint_block(&self, block: u64) {
        self.checkpoint_block.store(block, Ordering::Release);
    }
}

impl PageJournal for SerialLog {
    fn log_page_change(&self, record: LogRecord) -> Result<()> {
        if self.is_recovering() {
            return Ok(());
        }
        self.append(&record).map(drop)
    }

    fn flush_journal(&self) -> Result<()> {
        if self.is_recovering() {
            return Ok(());
        }
        self.flush(false, 0).map(drop)
    }
}

pub(crate) fn now_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |d| d.as_secs() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::control::SerialLogControl;
    use crate::storage::wal::record::{Commit, DataUpdate};
    use tempfile::TempDir;

    fn create_test_log(config: SerialLogConfig) -> (SerialLog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let spaces = Arc::new(TableSpaceManager::create(temp_dir.path(), 16).unwrap());
        let log = SerialLog::open(temp_dir.path(), config, spaces).unwrap();
        log.initialize().unwrap();
        (log, temp_dir)
    }

    fn update(transaction_id: TransId, record_number: u32, data: &[u8]) -> LogRecord {
        LogRecord::DataUpdate(DataUpdate {
            table_space_id: 0,
            transaction_id,
            section_id: 3,
            record_number,
            data: data.to_vec(),
        })
    }

    fn read_all(log: &SerialLog) -> Vec<LogRecord> {
        let mut control = SerialLogControl::new(log);
        assert!(control.set_block(1).unwrap());
        let mut records = Vec::new();
        while let Some(record) = control.next_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_append_and_read_back() {
        let (log, _dir) = create_test_log(SerialLogConfig::default());
        let first = log.append(&update(5, 1, b"one")).unwrap();
        log.append(&update(5, 2, b"two")).unwrap();
        let commit = log
            .append(&LogRecord::Commit(Commit { transaction_id: 5 }))
            .unwrap();
        assert_eq!(first, 1);

        // The open block is readable before it is flushed.
        assert_eq!(read_all(&log).len(), 3);

        assert_eq!(log.flush(false, commit).unwrap(), 1);
        assert_eq!(log.high_water(), 1);
        assert_eq!(log.writing_block(), None);
        assert_eq!(log.flush(false, commit).unwrap(), 1);

        let records = read_all(&log);
        assert_eq!(records[1], update(5, 2, b"two"));
        assert_eq!(log.stats().records_appended, 3);
        assert_eq!(log.stats().blocks_written, 1);
    }

    #[test]
    fn test_records_straddle_blocks() {
        let config = SerialLogConfig {
            max_block_size: 96,
            ..SerialLogConfig::default()
        };
        let (log, _dir) = create_test_log(config);
        let big = vec![0xab; 500];
        log.append(&update(9, 1, b"small")).unwrap();
        let last = log.append(&update(9, 2, &big)).unwrap();
        log.append(&update(9, 3, b"after")).unwrap();
        assert!(last > 5, "a 500 byte record spans several 96 byte blocks");
        log.flush(false, 0).unwrap();

        let records = read_all(&log);
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], update(9, 2, &big));

        // Starting mid-record skips the continued bytes.
        let mut control = SerialLogControl::new(&log);
        assert!(control.set_block(3).unwrap());
        assert_eq!(control.next_record().unwrap(), Some(update(9, 3, b"after")));

        let transaction = log.find_transaction(9).unwrap();
        assert_eq!(transaction.min_block(), Some(1));
        assert!(transaction.max_block() >= last);
        assert_eq!(transaction.start().unwrap().block_number, 1);
    }

    #[test]
    fn test_read_block_follows_live_transactions() {
        let (log, _dir) = create_test_log(SerialLogConfig::default());
        assert_eq!(log.read_block_number(), 1);
        log.append(&update(4, 1, b"x")).unwrap();
        log.flush(false, 0).unwrap();
        log.checkpoint().unwrap();
        // Transaction 4 has no outcome yet, so its block stays needed.
        assert_eq!(log.read_block_number(), 1);

        log.end_transaction(4, LogTransactionState::RolledBack).unwrap();
        assert!(log.end_transaction(4, LogTransactionState::RolledBack).is_err());
        {
            let mut lists = log.lock_transactions();
            let done = lists.pending.pop_front().unwrap();
            lists.inactions.push(done);
        }
        let block = log.checkpoint().unwrap();
        log.checkpoint().unwrap();
        assert!(log.find_transaction(4).is_none());
        assert!(log.read_block_number() > block);
    }

    #[test]
    fn test_writer_alternates_files() {
        let config = SerialLogConfig {
            window_size: 4096,
            max_block_size: 512,
            ..SerialLogConfig::default()
        };
        let (log, _dir) = create_test_log(config);
        assert_eq!(log.current_file(), Some(0));
        let payload = vec![7u8; 300];
        let mut files = Vec::new();
        for i in 0..8 {
            log.append(&update(0, i, &payload)).unwrap();
            log.flush(true, 0).unwrap();
            log.checkpoint().unwrap();
            files.push(log.current_file().unwrap());
        }
        assert!(files.contains(&1));
        assert!(files.iter().skip_while(|&&f| f == 0).any(|&f| f == 0));
        assert!(log.window_count() <= 4);
    }

    #[test]
    fn test_backpressure_flag() {
        let (log, _dir) = create_test_log(SerialLogConfig::default());
        log.pre_update();
        log.block_updates();
        assert!(log.updates_blocked());

        std::thread::scope(|scope| {
            scope.spawn(|| log.pre_update());
            std::thread::sleep(Duration::from_millis(20));
            log.unblock_updates();
        });
        assert!(!log.updates_blocked());
        assert_eq!(log.stats().backlog_stalls, 1);
    }

    #[test]
    fn test_section_use_vector() {
        let (log, _dir) = create_test_log(SerialLogConfig::default());
        log.update_section_use_vector(8, 0, 1);
        log.update_section_use_vector(8, 0, 1);
        assert!(log.section_in_use(8, 0));
        log.update_section_use_vector(8, 0, -2);
        assert!(!log.section_in_use(8, 0));
        assert!(!log.section_in_use(8, 1));

        log.set_section_inactive(8, 0);
        assert!(!log.is_section_active(8, 0));
        log.set_section_active(8, 0);
        assert!(log.is_section_active(8, 0));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        #[test]
        fn prop_straddled_records_decode_unchanged(
            sizes in proptest::collection::vec(0usize..700, 1..8),
            block_size in 64usize..300,
        ) {
            let config = SerialLogConfig {
                max_block_size: block_size,
                sync_writes: false,
                ..SerialLogConfig::default()
            };
            let (log, _dir) = create_test_log(config);
            let written: Vec<LogRecord> = sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| update(7, i as u32, &vec![i as u8; size]))
                .collect();
            for record in &written {
                log.append(record).unwrap();
            }
            log.flush(false, 0).unwrap();

            proptest::prop_assert_eq!(read_all(&log), written);
        }
    }
}
