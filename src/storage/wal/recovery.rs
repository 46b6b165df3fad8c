//! Crash recovery.
//!
//! Recovery finds the newest readable block chain across the two log
//! files, starts at the read block recorded in the last valid block, and
//! drives every record through three passes:
//!
//! 1. `pass1` counts object incarnations and classifies transactions.
//! 2. `pass2` redoes page images that are current and after the last checkpoint.
//! 3. `redo` applies committed row changes and discards the rest.
//!
//! Transactions left prepared are kept in limbo for an XA coordinator.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::error::{Result, SerialDbError};
use crate::storage::wal::block::{round_up, validate_block, BlockHeader, BLOCK_HEADER_SIZE, MIN_BLOCK_SIZE};
use crate::storage::wal::control::SerialLogControl;
use crate::storage::wal::file::SerialLogFile;
use crate::storage::wal::record::LogRecord;
use crate::storage::wal::serial_log::{now_seconds, SerialLog};
use crate::storage::wal::transaction::{LogPosition, LogTransactionState};
use crate::storage::wal::window::SerialLogWindow;

/// Outcome of [`SerialLog::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// First block replayed, or 0 for an empty log.
    pub read_block: u64,
    /// Last valid block found, or 0 for an empty log.
    pub last_block: u64,
    /// Block recorded by the newest checkpoint.
    pub last_checkpoint: u64,
    pub pass1_records: usize,
    pub pass2_records: usize,
    pub redo_records: usize,
    pub transactions_committed: usize,
    pub transactions_rolled_back: usize,
    /// Prepared transactions awaiting an XA decision.
    pub limbo_transactions: usize,
    /// Block where a record cut off by the end of the log starts. The
    /// writer resumes there, overwriting the partial record.
    pub torn_record_block: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pass1,
    Pass2,
    Redo,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Pass1 => "pass 1",
            Phase::Pass2 => "pass 2",
            Phase::Redo => "redo",
        }
    }
}

struct PhaseOutcome {
    records: usize,
    last_checkpoint: u64,
    torn_record: Option<LogPosition>,
}

/// Reads the first block of a log file, if it holds a valid one.
fn probe(file: &SerialLogFile, window_size: usize) -> Result<Option<BlockHeader>> {
    let mut head = [0u8; BLOCK_HEADER_SIZE];
    file.read(0, &mut head)?;
    let header = BlockHeader::decode(&head)?;
    let length = header.length as usize;
    if header.block_number == 0 || length < MIN_BLOCK_SIZE || length > window_size {
        return Ok(None);
    }
    let mut block = vec![0u8; length];
    file.read(0, &mut block)?;
    Ok(validate_block(&block, header.creation_time, None))
}

impl SerialLog {
    /// Scans the block chain of `file` from offset 0, one window at a time.
    fn scan_file(
        &self,
        file: &Arc<SerialLogFile>,
        creation_time: u32,
        first_block: u64,
    ) -> Result<Vec<Arc<SerialLogWindow>>> {
        let window_size = self.config().window_size;
        let sector = self.config().sector_size;
        let mut windows = Vec::new();
        let mut origin = 0u64;
        let mut expected = Some(first_block);
        loop {
            let window = Arc::new(SerialLogWindow::new(Arc::clone(file), origin, window_size));
            if window.scan(creation_time, sector, expected)? == 0 {
                break;
            }
            origin += round_up(window.current_length(), sector) as u64;
            expected = window.last_block_number().map(|n| n + 1);
            windows.push(window);
        }
        debug!(
            file = file.index(),
            windows = windows.len(),
            first = first_block,
            last = expected.map_or(0, |n| n - 1),
            "scanned serial log file"
        );
        Ok(windows)
    }

    /// Replays the log into the table spaces after a crash or a clean close.
    ///
    /// On return the log is writable again, positioned after the last valid
    /// block. An empty log starts fresh.
    ///
    /// # Errors
    ///
    /// Returns a `Recovery` error naming the block being processed if any
    /// record cannot be decoded or replayed. The database must not be used
    /// after a failed recovery.
    pub fn recover(&self, trace_records: bool) -> Result<RecoverySummary> {
        let window_size = self.config().window_size;
        let files = self.files().clone();
        let probes = [probe(&files[0], window_size)?, probe(&files[1], window_size)?];

        let (primary, primary_header) = match (&probes[0], &probes[1]) {
            (Some(a), Some(b)) if b.block_number > a.block_number => (1, *b),
            (Some(a), _) => (0, *a),
            (None, Some(b)) => (1, *b),
            (None, None) => {
                info!("serial log is empty, starting a new one");
                self.set_creation_time(now_seconds());
                self.start_writer(0, 0, 1)?;
                return Ok(RecoverySummary::default());
            }
        };
        let creation_time = primary_header.creation_time;
        self.set_creation_time(creation_time);

        let mut windows = self.scan_file(&files[primary], creation_time, primary_header.block_number)?;
        let last_window = windows
            .last()
            .cloned()
            .ok_or_else(|| SerialDbError::CorruptedDatabase("first serial log block vanished during scan".into()))?;
        let last_block = last_window.last_block_number().unwrap_or(primary_header.block_number);
        let last_header = {
            let offset = last_window.block_offset(last_block).unwrap_or(0);
            let (active, _) = last_window.activate()?;
            BlockHeader::decode(&active.read_range(offset, BLOCK_HEADER_SIZE)?)?
        };
        let read_block = last_header.read_block_number.max(1);

        if read_block < primary_header.block_number {
            let secondary = 1 - primary;
            let mut older = match &probes[secondary] {
                Some(header) if header.creation_time == creation_time => {
                    self.scan_file(&files[secondary], creation_time, header.block_number)?
                }
                _ => Vec::new(),
            };
            let joins = older
                .last()
                .and_then(|w| w.last_block_number())
                .is_some_and(|last| last + 1 == primary_header.block_number);
            if !joins {
                older.clear();
            }
            older.append(&mut windows);
            windows = older;
        }
        if !windows.iter().any(|w| w.contains_block(read_block)) {
            return Err(SerialDbError::Recovery {
                block_number: read_block,
                message: format!("read block {read_block} is missing from the serial log"),
            });
        }

        info!(read_block, last_block, primary_file = primary, "recovering serial log");
        self.install_windows(windows);
        self.set_recovering(true);

        let result = self.replay(read_block, trace_records);
        let (summary, torn) = match result {
            Ok((mut summary, torn)) => {
                summary.read_block = read_block;
                summary.last_block = last_block;
                summary.torn_record_block = torn.as_ref().map(|p| p.block_number);
                (summary, torn)
            }
            Err(e) => {
                self.set_pass1(false);
                self.clear_recovery_objects();
                return Err(e);
            }
        };

        self.clear_recovery_objects();
        self.set_recovering(false);
        self.set_checkpoint_block(summary.last_checkpoint);
        self.note_next_transaction_id(
            self.table_spaces()
                .next_transaction_id()
                .max(self.max_transaction_id() + 1),
        );

        match torn {
            Some(position) => self.resume_writer(&position)?,
            None => {
                let origin =
                    last_window.origin() + round_up(last_window.current_length(), self.config().sector_size) as u64;
                self.start_writer(last_window.file().index(), origin, last_block + 1)?;
            }
        }
        self.release_windows();

        info!(
            committed = summary.transactions_committed,
            rolled_back = summary.transactions_rolled_back,
            limbo = summary.limbo_transactions,
            "recovery complete"
        );
        Ok(summary)
    }

    /// Runs the three passes. Also returns where a torn final record starts.
    fn replay(&self, read_block: u64, trace_records: bool) -> Result<(RecoverySummary, Option<LogPosition>)> {
        let mut summary = RecoverySummary::default();

        self.set_pass1(true);
        let pass1 = self.run_phase(Phase::Pass1, read_block, 0, trace_records)?;
        self.set_pass1(false);
        summary.pass1_records = pass1.records;
        summary.last_checkpoint = pass1.last_checkpoint;
        let last_checkpoint = pass1.last_checkpoint;

        self.reset_recovery_objects();
        summary.pass2_records = self.run_phase(Phase::Pass2, read_block, last_checkpoint, trace_records)?.records;

        self.reset_recovery_objects();
        self.roll_back_unknown();
        summary.redo_records = self.run_phase(Phase::Redo, read_block, last_checkpoint, trace_records)?.records;

        let (committed, rolled_back, limbo) = self.settle_recovered();
        summary.transactions_committed = committed;
        summary.transactions_rolled_back = rolled_back;
        summary.limbo_transactions = limbo;
        Ok((summary, pass1.torn_record))
    }

    fn run_phase(
        &self,
        phase: Phase,
        read_block: u64,
        last_checkpoint: u64,
        trace_records: bool,
    ) -> Result<PhaseOutcome> {
        let mut control = SerialLogControl::new(self);
        control.set_last_checkpoint(last_checkpoint);
        if !control.set_block(read_block).map_err(|e| e.during_recovery(read_block))? {
            return Err(SerialDbError::Recovery {
                block_number: read_block,
                message: "read block is not in the serial log".into(),
            });
        }

        let mut records = 0;
        loop {
            let record = control
                .next_record()
                .map_err(|e| e.during_recovery(control.block_number()))?;
            let Some(record) = record else {
                break;
            };
            if trace_records {
                trace!(phase = phase.name(), block = control.block_number(), "{record}");
            }
            Self::apply(phase, &record, &mut control).map_err(|e| e.during_recovery(control.block_number()))?;
            records += 1;
        }

        info!(
            phase = phase.name(),
            first_block = read_block,
            last_block = control.block_number(),
            records,
            "recovery phase complete"
        );
        Ok(PhaseOutcome {
            records,
            last_checkpoint: control.last_checkpoint(),
            torn_record: control.torn_record().cloned(),
        })
    }

    fn apply(phase: Phase, record: &LogRecord, control: &mut SerialLogControl<'_>) -> Result<()> {
        match phase {
            Phase::Pass1 => record.pass1(control),
            Phase::Pass2 => record.pass2(control),
            Phase::Redo => record.redo(control),
        }
    }

    /// Transactions with no outcome record died with the crash.
    fn roll_back_unknown(&self) {
        let lists = self.lock_transactions();
        for transaction in lists.running.values() {
            if transaction.state() == LogTransactionState::Unknown {
                transaction.set_state(LogTransactionState::RolledBack);
            }
        }
    }

    /// Moves recovered transactions to their post-recovery lists.
    fn settle_recovered(&self) -> (usize, usize, usize) {
        let mut lists = self.lock_transactions();
        let running = std::mem::take(&mut lists.running);
        let (mut committed, mut rolled_back) = (0, 0);
        for (id, transaction) in running {
            match transaction.state() {
                LogTransactionState::Prepared => {
                    lists.limbo.insert(id, transaction);
                }
                state => {
                    if state == LogTransactionState::Committed {
                        committed += 1;
                    } else {
                        rolled_back += 1;
                    }
                    transaction.set_finished();
                    transaction.set_flushing(true);
                    lists.inactions.push(transaction);
                }
            }
        }
        if !lists.limbo.is_empty() {
            warn!(limbo = lists.limbo.len(), "prepared transactions await resolution");
        }
        (committed, rolled_back, lists.limbo.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::{Commit, CreateSection, DataUpdate};
    use crate::storage::wal::SerialLogConfig;
    use crate::storage::TableSpaceManager;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir, create: bool) -> SerialLog {
        let spaces = if create {
            TableSpaceManager::create(dir.path(), 64).unwrap()
        } else {
            TableSpaceManager::open(dir.path(), 64).unwrap()
        };
        SerialLog::open(dir.path(), SerialLogConfig::default(), Arc::new(spaces)).unwrap()
    }

    #[test]
    fn test_empty_log_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir, true);
        let summary = log.recover(false).unwrap();
        assert_eq!(summary, RecoverySummary::default());
        assert!(log.creation_time() > 0);
        assert_eq!(log.append(&LogRecord::Commit(Commit { transaction_id: 0 })).unwrap(), 1);
    }

    #[test]
    fn test_recover_classifies_transactions() {
        let dir = TempDir::new().unwrap();
        {
            let log = open_log(&dir, true);
            log.initialize().unwrap();
            log.append(&LogRecord::CreateSection(CreateSection {
                table_space_id: 0,
                transaction_id: 1,
                section_id: 7,
            }))
            .unwrap();
            log.append(&LogRecord::Commit(Commit { transaction_id: 1 })).unwrap();
            log.append(&LogRecord::DataUpdate(DataUpdate {
                table_space_id: 0,
                transaction_id: 2,
                section_id: 7,
                record_number: 0,
                data: b"lost".to_vec(),
            }))
            .unwrap();
            log.flush(false, 0).unwrap();
        }

        let log = open_log(&dir, false);
        let summary = log.recover(true).unwrap();
        assert_eq!(summary.read_block, 1);
        assert_eq!(summary.last_block, 1);
        assert_eq!(summary.pass1_records, 3);
        assert_eq!(summary.redo_records, 3);
        assert_eq!(summary.transactions_committed, 1);
        assert_eq!(summary.transactions_rolled_back, 1);
        assert_eq!(summary.limbo_transactions, 0);
        assert!(!log.is_recovering());

        // The writer continues after the recovered blocks.
        let next = log.append(&LogRecord::Commit(Commit { transaction_id: 0 })).unwrap();
        assert_eq!(next, 2);
    }
}
