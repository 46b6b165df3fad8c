//! serialdb - serial write-ahead log and crash recovery for a page-based
//! storage engine.
//!
//! Every change is appended to a shared serial log before it touches a
//! table space. A transaction is durable once its `Commit` record is on
//! disk; a background gopher applies the committed changes to the page
//! caches afterwards, and checkpoints bound how much of the log recovery
//! has to replay.
//!
//! ```no_run
//! use serialdb::{Database, DatabaseConfig};
//!
//! # fn main() -> serialdb::Result<()> {
//! let mut db = Database::create(std::path::Path::new("/tmp/db"), DatabaseConfig::default())?;
//! let txn = db.begin();
//! let section = db.create_section(&txn, 0)?;
//! let record = db.insert_record(&txn, 0, section, b"hello")?;
//! db.commit(&txn)?;
//! db.wait_for_completion()?;
//! assert_eq!(db.fetch_record(0, section, record)?, Some(b"hello".to_vec()));
//! db.close()?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod util;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use error::{Result, SerialDbError};
pub use types::{IndexId, PageNumber, RecordNumber, SectionId, SequenceId, TableSpaceId, TransId, Xid};

use storage::page::{IndexPage, PAGE_SIZE};
use storage::wal::record::{BlobUpdate, DataUpdate, Delete, DeleteIndex, DropTable, LogRecord, RecordStub, RecordUpdate, UpdateBlob, UpdateRecords};
use storage::wal::{Checkpointer, Gopher, RecoverySummary, SerialLog, SerialLogConfig, SerialLogStatsSnapshot};
use storage::{PageJournal, RedoStatsSnapshot, TableSpace, TableSpaceManager};
use tracing::{debug, info, warn};
use transaction::{Transaction, TransactionManager, TransactionSummary};

/// Blobs at least this large are written to disk ahead of commit.
pub const EARLY_WRITE_THRESHOLD: usize = PAGE_SIZE;

/// Configuration for opening or creating a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Pages kept resident per table space before clean pages are dropped (default: 4096).
    pub page_cache_pages: usize,
    /// Serial log tuning.
    pub log: SerialLogConfig,
    /// Background checkpoint period; `None` disables the thread (default: 30s).
    pub checkpoint_interval: Option<Duration>,
    /// Trace every record replayed by recovery (default: false).
    pub debug_recovery: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            page_cache_pages: 4096,
            log: SerialLogConfig::default(),
            checkpoint_interval: Some(Duration::from_secs(30)),
            debug_recovery: false,
        }
    }
}

/// A database directory: its table spaces, serial log and background workers.
///
/// Record reads see committed images only, and only once the gopher has
/// applied them; [`wait_for_completion`](Self::wait_for_completion) waits
/// for that.
///
/// Dropping a `Database` without [`close`](Self::close) stops the workers
/// but writes nothing, exactly like a crash.
pub struct Database {
    directory: PathBuf,
    config: DatabaseConfig,
    table_spaces: Arc<TableSpaceManager>,
    log: Arc<SerialLog>,
    transactions: TransactionManager,
    gopher: Arc<Gopher>,
    checkpointer: Arc<Checkpointer>,
    /// Present when the database was opened through recovery.
    recovery: Option<RecoverySummary>,
    closed: bool,
}

impl Database {
    /// Creates a new database in `path`, replacing any log files there.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or its files cannot be created.
    pub fn create(path: &Path, config: DatabaseConfig) -> Result<Self> {
        let table_spaces = Arc::new(TableSpaceManager::create(path, config.page_cache_pages)?);
        let log = Arc::new(SerialLog::open(path, config.log.clone(), Arc::clone(&table_spaces))?);
        log.initialize()?;
        Self::attach_journal(&table_spaces, &log);

        let db = Self::assemble(path, config, table_spaces, log, None)?;
        info!(directory = %path.display(), "created database");
        Ok(db)
    }

    /// Opens an existing database, recovering from the serial log.
    ///
    /// # Errors
    ///
    /// Returns an error if the table spaces are missing or damaged, or
    /// `Recovery` if the log cannot be replayed.
    pub fn open(path: &Path, config: DatabaseConfig) -> Result<Self> {
        let table_spaces = Arc::new(TableSpaceManager::open(path, config.page_cache_pages)?);
        let log = Arc::new(SerialLog::open(path, config.log.clone(), Arc::clone(&table_spaces))?);
        Self::attach_journal(&table_spaces, &log);

        let summary = log.recover(config.debug_recovery)?;
        log.checkpoint()?;

        let db = Self::assemble(path, config, table_spaces, log, Some(summary))?;
        info!(
            directory = %path.display(),
            next_transaction_id = db.transactions.next_transaction_id(),
            "opened database"
        );
        Ok(db)
    }

    fn attach_journal(table_spaces: &TableSpaceManager, log: &Arc<SerialLog>) {
        let journal: Arc<dyn PageJournal> = Arc::clone(log) as Arc<dyn PageJournal>;
        table_spaces.set_journal(Arc::downgrade(&journal));
    }

    fn assemble(
        path: &Path,
        config: DatabaseConfig,
        table_spaces: Arc<TableSpaceManager>,
        log: Arc<SerialLog>,
        recovery: Option<RecoverySummary>,
    ) -> Result<Self> {
        let transactions = TransactionManager::new(Arc::clone(&log));
        let gopher = Gopher::new(Arc::clone(&log));
        gopher.start()?;
        let checkpointer = Arc::new(Checkpointer::new());
        if let Some(interval) = config.checkpoint_interval {
            checkpointer.start(Arc::clone(&log), interval)?;
        }
        Ok(Self {
            directory: path.to_path_buf(),
            config,
            table_spaces,
            log,
            transactions,
            gopher,
            checkpointer,
            recovery,
            closed: false,
        })
    }

    /// Drains the gopher, checkpoints and stops the background workers.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker panicked or the final checkpoint fails.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.checkpointer.stop()?;
        self.gopher.stop(true)?;
        self.checkpointer.checkpoint(&self.log)?;
        info!(directory = %self.directory.display(), "closed database");
        Ok(())
    }

    /// Database directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Configuration in effect.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The shared serial log.
    #[must_use]
    pub fn log(&self) -> &Arc<SerialLog> {
        &self.log
    }

    /// The table space registry.
    #[must_use]
    pub fn table_spaces(&self) -> &Arc<TableSpaceManager> {
        &self.table_spaces
    }

    fn table_space(&self, table_space_id: TableSpaceId) -> Result<Arc<TableSpace>> {
        self.table_spaces.get(table_space_id)
    }

    /// Creates table space `table_space_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if it exists already or its file cannot be created.
    pub fn create_table_space(&self, table_space_id: TableSpaceId) -> Result<()> {
        self.table_spaces.create_table_space(table_space_id).map(drop)
    }

    // ---------------------------------------------------------------
    // Transactions.
    // ---------------------------------------------------------------

    /// Starts a transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        self.transactions.start_transaction()
    }

    /// Commits a transaction. The commit is durable when this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not open or the log write fails.
    pub fn commit(&self, transaction: &Transaction) -> Result<()> {
        self.transactions.commit(transaction)
    }

    /// Rolls back a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not open or the log write fails.
    pub fn rollback(&self, transaction: &Transaction) -> Result<()> {
        self.transactions.rollback(transaction)
    }

    /// Prepares a transaction for two-phase commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the log write fails.
    pub fn prepare(&self, transaction: &Transaction, xid: &Xid) -> Result<()> {
        self.transactions.prepare(transaction, xid)
    }

    /// Commits the limbo transaction prepared under `xid`. Returns false if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails.
    pub fn commit_by_xid(&self, xid: &Xid) -> Result<bool> {
        self.transactions.commit_by_xid(xid)
    }

    /// Rolls back the limbo transaction prepared under `xid`. Returns false if there is none.
    ///
    /// # Errors
    ///
    /// Returns an error if the log write fails.
    pub fn rollback_by_xid(&self, xid: &Xid) -> Result<bool> {
        self.transactions.rollback_by_xid(xid)
    }

    /// Prepared transactions awaiting an XA decision, in id order.
    #[must_use]
    pub fn limbo_transactions(&self) -> Vec<(TransId, Xid)> {
        self.log
            .limbo_transactions()
            .into_iter()
            .filter_map(|(id, xid)| xid.map(|xid| (id, xid)))
            .collect()
    }

    /// Number of limbo transactions an XA coordinator can iterate.
    #[must_use]
    pub fn recover_limbo_transactions(&self) -> usize {
        self.limbo_transactions().len()
    }

    /// XID of the limbo transaction at `position`, with the next position.
    #[must_use]
    pub fn recover_get_next_limbo(&self, position: usize) -> Option<(usize, Xid)> {
        self.limbo_transactions()
            .into_iter()
            .nth(position)
            .map(|(_, xid)| (position + 1, xid))
    }

    // ---------------------------------------------------------------
    // Sections and records.
    // ---------------------------------------------------------------

    /// Creates a section with the next free id and returns it.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the section
    /// directory is full.
    pub fn create_section(&self, transaction: &Transaction, table_space_id: TableSpaceId) -> Result<SectionId> {
        let space = self.table_space(table_space_id)?;
        let section_id = space.next_section_id()?;
        self.create_section_with_id(transaction, table_space_id, section_id)?;
        Ok(section_id)
    }

    /// Creates section `section_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the section exists.
    pub fn create_section_with_id(
        &self,
        transaction: &Transaction,
        table_space_id: TableSpaceId,
        section_id: SectionId,
    ) -> Result<()> {
        transaction.check_active()?;
        self.log.pre_update();
        let space = self.table_space(table_space_id)?;
        space.create_section(section_id, transaction.id())?;
        transaction.mark_updated();
        self.log.set_section_active(section_id, table_space_id);
        debug!(table_space = table_space_id, section_id, transaction_id = transaction.id(), "created section");
        Ok(())
    }

    /// Drops a section when `transaction` commits.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the log write fails.
    pub fn drop_section(&self, transaction: &Transaction, table_space_id: TableSpaceId, section_id: SectionId) -> Result<()> {
        self.log_change(
            transaction,
            &LogRecord::DropTable(DropTable {
                table_space_id,
                transaction_id: transaction.id(),
                section_id,
            }),
        )
    }

    /// Reserves a record number and logs its stub. The record reads as
    /// absent until data for it commits; a rollback releases the number.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the section
    /// does not exist.
    pub fn reserve_record(
        &self,
        transaction: &Transaction,
        table_space_id: TableSpaceId,
        section_id: SectionId,
    ) -> Result<RecordNumber> {
        transaction.check_active()?;
        self.log.pre_update();
        let record_number = self.table_space(table_space_id)?.insert_stub(section_id)?;
        self.log.append(&LogRecord::RecordStub(RecordStub {
            table_space_id,
            transaction_id: transaction.id(),
            section_id,
            record_number,
        }))?;
        transaction.mark_updated();
        Ok(record_number)
    }

    /// Inserts a record and returns its number.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active, the section does
    /// not exist or the log write fails.
    pub fn insert_record(
        &self,
        transaction: &Transaction,
        table_space_id: TableSpaceId,
        section_id: SectionId,
        data: &[u8],
    ) -> Result<RecordNumber> {
        let record_number = self.reserve_record(transaction, table_space_id, section_id)?;
        self.update_record(transaction, table_space_id, section_id, record_number, data)?;
        Ok(record_number)
    }

    /// Replaces the image of a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the log write fails.
    pub fn update_record(
        &self,
        transaction: &Transaction,
        table_space_id: TableSpaceId,
        section_id: SectionId,
        record_number: RecordNumber,
        data: &[u8],
    ) -> Result<()> {
        self.log_row_change(
            transaction,
            table_space_id,
            section_id,
            &LogRecord::DataUpdate(DataUpdate {
                table_space_id,
                transaction_id: transaction.id(),
                section_id,
                record_number,
                data: data.to_vec(),
            }),
        )
    }

    /// Deletes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the log write fails.
    pub fn delete_record(
        &self,
        transaction: &Transaction,
        table_space_id: TableSpaceId,
        section_id: SectionId,
        record_number: RecordNumber,
    ) -> Result<()> {
        self.log_row_change(
            transaction,
            table_space_id,
            section_id,
            &LogRecord::Delete(Delete {
                table_space_id,
                transaction_id: transaction.id(),
                section_id,
                record_number,
            }),
        )
    }

    /// Logs a batch of record changes as one record. Entries marked
    /// `inserted` must name numbers from [`reserve_record`](Self::reserve_record).
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the log write fails.
    pub fn update_records(&self, transaction: &Transaction, updates: Vec<RecordUpdate>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        transaction.check_active()?;
        self.log.pre_update();
        for update in &updates {
            self.table_space(update.table_space_id)?;
            self.log
                .update_section_use_vector(update.section_id, update.table_space_id, 1);
        }
        self.log.append(&LogRecord::UpdateRecords(UpdateRecords {
            transaction_id: transaction.id(),
            updates,
        }))?;
        transaction.mark_updated();
        Ok(())
    }

    /// Stores a large record image. Images of at least
    /// [`EARLY_WRITE_THRESHOLD`] bytes go to disk before commit and only
    /// their location is logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active, a page write
    /// fails or the log write fails.
    pub fn update_blob(
        &self,
        transaction: &Transaction,
        table_space_id: TableSpaceId,
        section_id: SectionId,
        record_number: RecordNumber,
        data: &[u8],
    ) -> Result<()> {
        if data.len() < EARLY_WRITE_THRESHOLD {
            return self.log_row_change(
                transaction,
                table_space_id,
                section_id,
                &LogRecord::UpdateBlob(UpdateBlob {
                    table_space_id,
                    transaction_id: transaction.id(),
                    section_id,
                    record_number,
                    data: data.to_vec(),
                }),
            );
        }

        transaction.check_active()?;
        self.log.pre_update();
        let location = self
            .table_space(table_space_id)?
            .store_blob(section_id, record_number, data)?;
        self.log.append(&LogRecord::BlobUpdate(BlobUpdate {
            table_space_id,
            transaction_id: transaction.id(),
            section_id,
            record_number,
            locator_page: location.locator_page,
            locator_line: location.locator_line,
            data_page: location.data_page,
            data_line: location.data_line,
        }))?;
        transaction.mark_updated();
        debug!(table_space = table_space_id, section_id, record_number, len = data.len(), "early-wrote blob");
        Ok(())
    }

    /// Reads the applied image of a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the section does not exist or a page is damaged.
    pub fn fetch_record(
        &self,
        table_space_id: TableSpaceId,
        section_id: SectionId,
        record_number: RecordNumber,
    ) -> Result<Option<Vec<u8>>> {
        self.table_space(table_space_id)?
            .fetch_record(section_id, record_number)
    }

    fn log_row_change(
        &self,
        transaction: &Transaction,
        table_space_id: TableSpaceId,
        section_id: SectionId,
        record: &LogRecord,
    ) -> Result<()> {
        transaction.check_active()?;
        self.table_space(table_space_id)?;
        self.log.pre_update();
        self.log.append(record)?;
        self.log
            .update_section_use_vector(section_id, table_space_id, 1);
        transaction.mark_updated();
        Ok(())
    }

    fn log_change(&self, transaction: &Transaction, record: &LogRecord) -> Result<()> {
        transaction.check_active()?;
        self.log.pre_update();
        self.log.append(record)?;
        transaction.mark_updated();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Sequences and indexes.
    // ---------------------------------------------------------------

    /// Adds `delta` to a sequence and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the sequence id is out of range.
    pub fn next_sequence_value(&self, table_space_id: TableSpaceId, sequence_id: SequenceId, delta: i64) -> Result<i64> {
        self.table_space(table_space_id)?
            .next_sequence_value(sequence_id, delta)
    }

    /// Creates an index and returns its id and root page.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the index
    /// directory is full.
    pub fn create_index(&self, transaction: &Transaction, table_space_id: TableSpaceId) -> Result<(IndexId, PageNumber)> {
        transaction.check_active()?;
        self.log.pre_update();
        let created = self.table_space(table_space_id)?.create_index(transaction.id())?;
        transaction.mark_updated();
        self.log.set_index_active(created.0, table_space_id);
        Ok(created)
    }

    /// Deletes an index when `transaction` commits.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is not active or the log write fails.
    pub fn delete_index(&self, transaction: &Transaction, table_space_id: TableSpaceId, index_id: IndexId) -> Result<()> {
        self.log_change(
            transaction,
            &LogRecord::DeleteIndex(DeleteIndex {
                table_space_id,
                transaction_id: transaction.id(),
                index_id,
            }),
        )
    }

    /// Root page of an index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index directory cannot be read.
    pub fn index_root(&self, table_space_id: TableSpaceId, index_id: IndexId) -> Result<Option<PageNumber>> {
        self.table_space(table_space_id)?.index_root(index_id)
    }

    /// Replaces the image of an index page.
    ///
    /// # Errors
    ///
    /// Returns an error if the image does not fit a page.
    pub fn write_index_page(&self, table_space_id: TableSpaceId, page_number: PageNumber, image: &IndexPage) -> Result<()> {
        self.log.pre_update();
        self.table_space(table_space_id)?
            .write_index_page(page_number, image)
    }

    /// Reads an index page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not an index page.
    pub fn read_index_page(&self, table_space_id: TableSpaceId, page_number: PageNumber) -> Result<IndexPage> {
        self.table_space(table_space_id)?
            .read_index_page(page_number)
    }

    // ---------------------------------------------------------------
    // Maintenance and statistics.
    // ---------------------------------------------------------------

    /// Waits until the gopher has applied every committed or rolled back
    /// transaction, then recycles finished transaction objects.
    ///
    /// # Errors
    ///
    /// Returns [`SerialDbError::CompletionFailed`] if the gopher could not
    /// apply a transaction. That transaction stays pinned in the log.
    pub fn wait_for_completion(&self) -> Result<()> {
        self.log.wait_for_completion()?;
        self.transactions.purge_transactions();
        Ok(())
    }

    /// Runs a checkpoint now and returns its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the log or a table space cannot be flushed.
    pub fn checkpoint(&self) -> Result<u64> {
        self.checkpointer.checkpoint(&self.log)
    }

    /// Redo work recovery applied to a table space.
    ///
    /// # Errors
    ///
    /// Returns `TableSpaceNotFound` for an unknown id.
    pub fn redo_stats(&self, table_space_id: TableSpaceId) -> Result<RedoStatsSnapshot> {
        Ok(self.table_space(table_space_id)?.redo_stats())
    }

    /// Serial log activity counters.
    #[must_use]
    pub fn log_stats(&self) -> SerialLogStatsSnapshot {
        self.log.stats()
    }

    /// What recovery found, if the database was opened through it.
    #[must_use]
    pub fn recovery_summary(&self) -> Option<&RecoverySummary> {
        self.recovery.as_ref()
    }

    /// Transaction counts by state.
    #[must_use]
    pub fn transaction_summary(&self) -> TransactionSummary {
        self.transactions.summary()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Stop the workers without flushing anything.
        if let Err(e) = self.checkpointer.stop() {
            warn!(error = %e, "checkpoint thread failed");
        }
        if let Err(e) = self.gopher.stop(false) {
            warn!(error = %e, "gopher failed");
        }
    }
}
