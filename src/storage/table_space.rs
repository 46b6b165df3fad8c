//! A table space: one database file with its sections, indexes and sequences.
//!
//! Fixed pages:
//! ```text
//! 0  header (TableSpaceHeader)
//! 1  page inventory
//! 2  section directory
//! 3  index directory
//! 4  sequences
//! ```
//!
//! Structural changes are journaled to the serial log through a
//! [`PageJournal`] before the pages they touch can reach disk. The
//! `redo_*` methods replay those records during recovery and must leave a
//! page unchanged when it already reflects the record.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SerialDbError};
use crate::storage::page::{
    DataPage, DirectoryPage, DiskManager, IndexPage, InventoryPage, LocatorEntry, LocatorState,
    Page, PageId, PageType, RecordLocatorPage, SectionPage, SequencePage, FIRST_ALLOCATABLE_PAGE,
    HEADER_PAGE, INDEX_DIRECTORY_PAGE, INVENTORY_PAGE, SECTION_DIRECTORY_PAGE, SEQUENCE_PAGE,
};
use crate::storage::page_cache::{PageCache, PageCacheStats};
use crate::storage::section::{split_record, Section};
use crate::storage::wal::record::{self, LogRecord};
use crate::storage::{PageJournal, TableSpaceHeader};
use crate::types::{IndexId, PageNumber, RecordNumber, SectionId, SequenceId, TableSpaceId, TransId};

/// Where an early-written blob landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobLocation {
    pub locator_page: PageNumber,
    pub locator_line: u32,
    pub data_page: PageNumber,
    pub data_line: u32,
}

/// Counters of recovery work applied to a table space.
#[derive(Debug, Default)]
pub struct RedoStats {
    structural_pages: AtomicU64,
    lines_removed: AtomicU64,
    pages_freed: AtomicU64,
    sections_created: AtomicU64,
    sections_dropped: AtomicU64,
    indexes_created: AtomicU64,
    indexes_deleted: AtomicU64,
    blobs_relinked: AtomicU64,
    sequences: AtomicU64,
}

/// Point-in-time copy of [`RedoStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedoStatsSnapshot {
    /// Section, locator, data and index page records replayed.
    pub structural_pages: u64,
    /// Section lines removed by replay.
    pub lines_removed: u64,
    /// Pages returned to the inventory by replay.
    pub pages_freed: u64,
    pub sections_created: u64,
    pub sections_dropped: u64,
    pub indexes_created: u64,
    pub indexes_deleted: u64,
    pub blobs_relinked: u64,
    pub sequences: u64,
}

impl RedoStatsSnapshot {
    /// Total number of replayed structural changes.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.structural_pages
            + self.lines_removed
            + self.pages_freed
            + self.sections_created
            + self.sections_dropped
            + self.indexes_created
            + self.indexes_deleted
            + self.blobs_relinked
            + self.sequences
    }
}

impl RedoStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counter values.
    #[must_use]
    pub fn snapshot(&self) -> RedoStatsSnapshot {
        RedoStatsSnapshot {
            structural_pages: self.structural_pages.load(Ordering::Relaxed),
            lines_removed: self.lines_removed.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            sections_created: self.sections_created.load(Ordering::Relaxed),
            sections_dropped: self.sections_dropped.load(Ordering::Relaxed),
            indexes_created: self.indexes_created.load(Ordering::Relaxed),
            indexes_deleted: self.indexes_deleted.load(Ordering::Relaxed),
            blobs_relinked: self.blobs_relinked.load(Ordering::Relaxed),
            sequences: self.sequences.load(Ordering::Relaxed),
        }
    }
}

/// File name of table space `id` inside a database directory.
#[must_use]
pub fn table_space_file_name(id: TableSpaceId) -> String {
    format!("tablespace_{id}.db")
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// One table space file behind a page cache.
pub struct TableSpace {
    id: TableSpaceId,
    path: PathBuf,
    cache: PageCache,
    header: Mutex<TableSpaceHeader>,
    /// Held across every page change; a checkpoint holds it while it flushes.
    structure: Mutex<()>,
    journal: RwLock<Option<Weak<dyn PageJournal>>>,
    stats: RedoStats,
}

impl TableSpace {
    /// Creates and formats a new table space file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn create(directory: &Path, id: TableSpaceId, database_id: Uuid, cache_pages: usize) -> Result<Self> {
        let path = directory.join(table_space_file_name(id));
        if path.exists() {
            return Err(SerialDbError::StorageError(format!(
                "table space file {} already exists",
                path.display()
            )));
        }
        let disk_manager = DiskManager::new(&path, id)?;
        let cache = PageCache::new(cache_pages, disk_manager, id);
        let header = TableSpaceHeader::new(id, database_id, now_seconds());

        cache.put(header.to_page(cache.page_id(HEADER_PAGE))?);
        cache.put(InventoryPage::new(0..FIRST_ALLOCATABLE_PAGE).to_page(cache.page_id(INVENTORY_PAGE)));
        cache.put(
            DirectoryPage::new(PageType::SectionDirectory)
                .to_page(cache.page_id(SECTION_DIRECTORY_PAGE)),
        );
        cache.put(
            DirectoryPage::new(PageType::IndexDirectory).to_page(cache.page_id(INDEX_DIRECTORY_PAGE)),
        );
        cache.put(SequencePage::default().to_page(cache.page_id(SEQUENCE_PAGE)));
        cache.flush_all()?;

        info!(table_space = id, path = %path.display(), "created table space");
        Ok(Self::assemble(id, path, cache, header))
    }

    /// Opens an existing table space file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, was written by a newer
    /// version, or does not belong to table space `id`.
    pub fn open(path: &Path, id: TableSpaceId, cache_pages: usize) -> Result<Self> {
        if !path.exists() {
            return Err(SerialDbError::InvalidDatabaseFile(format!(
                "table space file {} not found",
                path.display()
            )));
        }
        let disk_manager = DiskManager::new(path, id)?;
        let cache = PageCache::new(cache_pages, disk_manager, id);
        let header = TableSpaceHeader::from_page(&cache.fetch(HEADER_PAGE)?)?;
        if header.table_space_id != id {
            return Err(SerialDbError::CorruptedDatabase(format!(
                "{} holds table space {}, expected {id}",
                path.display(),
                header.table_space_id
            )));
        }
        debug!(table_space = id, next_transaction_id = header.next_transaction_id, "opened table space");
        Ok(Self::assemble(id, path.to_path_buf(), cache, header))
    }

    fn assemble(id: TableSpaceId, path: PathBuf, cache: PageCache, header: TableSpaceHeader) -> Self {
        Self {
            id,
            path,
            cache,
            header: Mutex::new(header),
            structure: Mutex::new(()),
            journal: RwLock::new(None),
            stats: RedoStats::default(),
        }
    }

    /// Returns the table space id.
    #[must_use]
    pub fn id(&self) -> TableSpaceId {
        self.id
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the database id stamped in the header.
    #[must_use]
    pub fn database_id(&self) -> Uuid {
        self.header.lock().database_id
    }

    /// Returns the next transaction id recorded at the last checkpoint.
    #[must_use]
    pub fn next_transaction_id(&self) -> TransId {
        self.header.lock().next_transaction_id
    }

    /// Records the next transaction id in the header page.
    ///
    /// # Errors
    ///
    /// Returns an error if the header cannot be serialized.
    pub fn set_next_transaction_id(&self, next: TransId) -> Result<()> {
        let mut header = self.header.lock();
        header.next_transaction_id = next;
        header.update_checksum();
        self.cache.put(header.to_page(self.page_id(HEADER_PAGE))?);
        Ok(())
    }

    /// Attaches the journal that receives structural page records.
    pub fn set_journal(&self, journal: Weak<dyn PageJournal>) {
        *self.journal.write() = Some(journal);
    }

    /// Blocks every page change until the guard is dropped.
    pub fn lock_structure(&self) -> MutexGuard<'_, ()> {
        self.structure.lock()
    }

    /// Writes every dirty page and syncs the file.
    ///
    /// # Errors
    ///
    /// Returns an error if a write or the sync fails.
    pub fn flush(&self) -> Result<usize> {
        let written = self.cache.flush_all()?;
        debug!(table_space = self.id, pages = written, "flushed page cache");
        Ok(written)
    }

    /// Returns page cache statistics.
    #[must_use]
    pub fn cache_stats(&self) -> PageCacheStats {
        self.cache.stats()
    }

    /// Returns the recovery work counters.
    #[must_use]
    pub fn redo_stats(&self) -> RedoStatsSnapshot {
        self.stats.snapshot()
    }

    // ---------------------------------------------------------------
    // Page plumbing shared with `Section`.
    // ---------------------------------------------------------------

    pub(crate) fn page_id(&self, page_number: PageNumber) -> PageId {
        self.cache.page_id(page_number)
    }

    pub(crate) fn fetch_page(&self, page_number: PageNumber) -> Result<Page> {
        self.cache.fetch(page_number)
    }

    pub(crate) fn put_page(&self, page: Page) {
        self.cache.put(page);
    }

    pub(crate) fn write_through(&self, page: Page) -> Result<()> {
        self.cache.write_through(page)
    }

    pub(crate) fn journal(&self, record: LogRecord) -> Result<()> {
        let journal = self.journal.read().as_ref().and_then(Weak::upgrade);
        match journal {
            Some(journal) => journal.log_page_change(record),
            None => Ok(()),
        }
    }

    pub(crate) fn flush_journal(&self) -> Result<()> {
        let journal = self.journal.read().as_ref().and_then(Weak::upgrade);
        match journal {
            Some(journal) => journal.flush_journal(),
            None => Ok(()),
        }
    }

    fn inventory(&self) -> Result<InventoryPage> {
        InventoryPage::from_page(&self.fetch_page(INVENTORY_PAGE)?)
    }

    fn put_inventory(&self, inventory: &InventoryPage) {
        self.put_page(inventory.to_page(self.page_id(INVENTORY_PAGE)));
    }

    /// Takes the first free page from the inventory.
    ///
    /// Allocation itself is not logged; recovery re-marks every page it
    /// sees in the log.
    pub(crate) fn allocate_page(&self) -> Result<PageNumber> {
        let mut inventory = self.inventory()?;
        let page_number = inventory
            .first_free(FIRST_ALLOCATABLE_PAGE)
            .ok_or_else(|| {
                SerialDbError::PageError(format!("table space {} is out of pages", self.id))
            })?;
        inventory.set(page_number, true);
        self.put_inventory(&inventory);
        Ok(page_number)
    }

    /// Marks a page allocated after recovery saw it in use.
    ///
    /// # Errors
    ///
    /// Returns an error if the inventory page cannot be read.
    pub fn realloc_page(&self, page_number: PageNumber) -> Result<()> {
        if page_number < FIRST_ALLOCATABLE_PAGE {
            return Ok(());
        }
        let _structure = self.structure.lock();
        self.mark_allocated(page_number)
    }

    fn mark_allocated(&self, page_number: PageNumber) -> Result<()> {
        let mut inventory = self.inventory()?;
        if !inventory.is_set(page_number) {
            inventory.set(page_number, true);
            self.put_inventory(&inventory);
        }
        Ok(())
    }

    /// Returns a page to the inventory and journals the release.
    pub(crate) fn free_page(&self, page_number: PageNumber) -> Result<()> {
        self.journal(LogRecord::FreePage(record::FreePage {
            table_space_id: self.id,
            page_number,
        }))?;
        self.release_page(page_number)
    }

    fn release_page(&self, page_number: PageNumber) -> Result<()> {
        if page_number < FIRST_ALLOCATABLE_PAGE {
            return Ok(());
        }
        let mut inventory = self.inventory()?;
        if inventory.is_set(page_number) {
            inventory.set(page_number, false);
            self.put_inventory(&inventory);
        }
        Ok(())
    }

    fn directory(&self, page_number: PageNumber, kind: PageType) -> Result<DirectoryPage> {
        DirectoryPage::from_page(&self.fetch_page(page_number)?, kind)
    }

    fn put_directory(&self, page_number: PageNumber, directory: &DirectoryPage) {
        self.put_page(directory.to_page(self.page_id(page_number)));
    }

    fn section(&self, section_id: SectionId) -> Result<Option<Section<'_>>> {
        let directory = self.directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)?;
        Ok(directory
            .root(section_id)
            .map(|root| Section::new(self, section_id, root)))
    }

    fn existing_section(&self, section_id: SectionId) -> Result<Section<'_>> {
        self.section(section_id)?.ok_or_else(|| {
            SerialDbError::SectionError(format!(
                "section {section_id} does not exist in table space {}",
                self.id
            ))
        })
    }

    // ---------------------------------------------------------------
    // Sections and records.
    // ---------------------------------------------------------------

    /// Returns true if the section directory has a root for `section_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn section_exists(&self, section_id: SectionId) -> Result<bool> {
        let _structure = self.structure.lock();
        Ok(self.section(section_id)?.is_some())
    }

    /// Picks the first unused section id.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is full.
    pub fn next_section_id(&self) -> Result<SectionId> {
        let _structure = self.structure.lock();
        self.directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)?
            .first_unused(1)
            .ok_or_else(|| SerialDbError::SectionError("section directory is full".into()))
    }

    /// Creates the root page of a section and journals it.
    ///
    /// # Errors
    ///
    /// Returns an error if the section already exists or no page is free.
    pub fn create_section(&self, section_id: SectionId, transaction_id: TransId) -> Result<PageNumber> {
        let _structure = self.structure.lock();
        let mut directory = self.directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)?;
        if directory.root(section_id).is_some() {
            return Err(SerialDbError::SectionError(format!(
                "section {section_id} already exists in table space {}",
                self.id
            )));
        }
        let root = self.allocate_page()?;
        self.journal(LogRecord::SectionPage(record::SectionPage {
            table_space_id: self.id,
            parent_page: 0,
            page_number: root,
            slot: section_id,
            section_id,
            sequence: 0,
            level: 0,
        }))?;
        self.journal(LogRecord::CreateSection(record::CreateSection {
            table_space_id: self.id,
            transaction_id,
            section_id,
        }))?;
        self.put_page(SectionPage::new(section_id, 0).to_page(self.page_id(root)));
        directory.set_root(section_id, root)?;
        self.put_directory(SECTION_DIRECTORY_PAGE, &directory);
        debug!(table_space = self.id, section_id, root, "created section");
        Ok(root)
    }

    /// Frees every page of a section. Runs when its drop commits.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or freed.
    pub fn drop_section(&self, section_id: SectionId, transaction_id: TransId) -> Result<()> {
        let _structure = self.structure.lock();
        let freed = self.remove_section(section_id, true)?;
        debug!(table_space = self.id, section_id, transaction_id, freed, "dropped section");
        Ok(())
    }

    fn remove_section(&self, section_id: SectionId, journaled: bool) -> Result<usize> {
        let Some(section) = self.section(section_id)? else {
            return Ok(0);
        };
        let pages = section.owned_pages()?;
        for &page_number in &pages {
            if journaled {
                self.free_page(page_number)?;
            } else {
                self.release_page(page_number)?;
            }
        }
        let mut directory = self.directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)?;
        directory.set_root(section_id, 0)?;
        self.put_directory(SECTION_DIRECTORY_PAGE, &directory);
        Ok(pages.len())
    }

    /// Reserves a record number for an insert.
    ///
    /// # Errors
    ///
    /// Returns an error if the section does not exist or is full.
    pub fn insert_stub(&self, section_id: SectionId) -> Result<RecordNumber> {
        let _structure = self.structure.lock();
        self.existing_section(section_id)?.insert_stub()
    }

    /// Reserves `record_number` again during recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn reinsert_stub(&self, section_id: SectionId, record_number: RecordNumber) -> Result<()> {
        let _structure = self.structure.lock();
        match self.section(section_id)? {
            Some(section) => section.reinsert_stub(record_number),
            None => Ok(()),
        }
    }

    /// Stores a committed record image, or deletes the record on `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the section does not exist or no page is free.
    pub fn update_record(
        &self,
        section_id: SectionId,
        record_number: RecordNumber,
        data: Option<&[u8]>,
        transaction_id: TransId,
    ) -> Result<()> {
        let _structure = self.structure.lock();
        let section = self.existing_section(section_id)?;
        tracing::trace!(
            table_space = self.id,
            section_id,
            record_number,
            transaction_id,
            deleted = data.is_none(),
            "applying record"
        );
        section.update(record_number, data)
    }

    /// Removes a record and releases its number.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn expunge_record(
        &self,
        section_id: SectionId,
        record_number: RecordNumber,
        transaction_id: TransId,
    ) -> Result<()> {
        let _structure = self.structure.lock();
        tracing::trace!(table_space = self.id, section_id, record_number, transaction_id, "expunging record");
        match self.section(section_id)? {
            Some(section) => section.expunge(record_number),
            None => Ok(()),
        }
    }

    /// Reads the committed image of a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the section does not exist or a page is damaged.
    pub fn fetch_record(&self, section_id: SectionId, record_number: RecordNumber) -> Result<Option<Vec<u8>>> {
        let _structure = self.structure.lock();
        self.existing_section(section_id)?.fetch(record_number)
    }

    /// Writes a large record image straight to disk ahead of commit.
    ///
    /// The caller logs the matching `BlobUpdate` record.
    ///
    /// # Errors
    ///
    /// Returns an error if the section does not exist or a write fails.
    pub fn store_blob(&self, section_id: SectionId, record_number: RecordNumber, data: &[u8]) -> Result<BlobLocation> {
        let _structure = self.structure.lock();
        self.existing_section(section_id)?
            .store_blob(record_number, data)
    }

    // ---------------------------------------------------------------
    // Sequences.
    // ---------------------------------------------------------------

    fn sequences(&self) -> Result<SequencePage> {
        SequencePage::from_page(&self.fetch_page(SEQUENCE_PAGE)?)
    }

    fn check_sequence(sequence_id: SequenceId) -> Result<usize> {
        let slot = sequence_id as usize;
        if slot >= crate::storage::page::SEQUENCE_SLOTS {
            return Err(SerialDbError::PageError(format!(
                "sequence {sequence_id} is outside the sequence page"
            )));
        }
        Ok(slot)
    }

    /// Advances a sequence by `delta` and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is out of range.
    pub fn next_sequence_value(&self, sequence_id: SequenceId, delta: i64) -> Result<i64> {
        let slot = Self::check_sequence(sequence_id)?;
        let _structure = self.structure.lock();
        let mut sequences = self.sequences()?;
        let value = sequences.values[slot] + delta;
        self.journal(LogRecord::Sequence(record::Sequence {
            table_space_id: self.id,
            sequence_id,
            value,
        }))?;
        sequences.values[slot] = value;
        self.put_page(sequences.to_page(self.page_id(SEQUENCE_PAGE)));
        Ok(value)
    }

    /// Current value of a sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is out of range.
    pub fn sequence_value(&self, sequence_id: SequenceId) -> Result<i64> {
        let slot = Self::check_sequence(sequence_id)?;
        let _structure = self.structure.lock();
        Ok(self.sequences()?.values[slot])
    }

    // ---------------------------------------------------------------
    // Indexes.
    // ---------------------------------------------------------------

    /// Allocates an index with an empty root page.
    ///
    /// # Errors
    ///
    /// Returns an error if the index directory is full or no page is free.
    pub fn create_index(&self, transaction_id: TransId) -> Result<(IndexId, PageNumber)> {
        let _structure = self.structure.lock();
        let mut directory = self.directory(INDEX_DIRECTORY_PAGE, PageType::IndexDirectory)?;
        let index_id = directory
            .first_unused(1)
            .ok_or_else(|| SerialDbError::PageError("index directory is full".into()))?;
        let root = self.allocate_page()?;
        let image = IndexPage::empty_root(index_id);
        self.journal(index_page_record(self.id, root, &image))?;
        self.journal(LogRecord::CreateIndex(record::CreateIndex {
            table_space_id: self.id,
            transaction_id,
            index_id,
            root_page: root,
        }))?;
        self.put_page(image.to_page(self.page_id(root))?);
        directory.set_root(index_id, root)?;
        self.put_directory(INDEX_DIRECTORY_PAGE, &directory);
        Ok((index_id, root))
    }

    /// Root page of an index, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn index_root(&self, index_id: IndexId) -> Result<Option<PageNumber>> {
        let _structure = self.structure.lock();
        Ok(self
            .directory(INDEX_DIRECTORY_PAGE, PageType::IndexDirectory)?
            .root(index_id))
    }

    /// Replaces the image of an index page, journaling it first.
    ///
    /// # Errors
    ///
    /// Returns an error if the image does not fit a page.
    pub fn write_index_page(&self, page_number: PageNumber, image: &IndexPage) -> Result<()> {
        let _structure = self.structure.lock();
        let page = image.to_page(self.page_id(page_number))?;
        self.journal(index_page_record(self.id, page_number, image))?;
        self.put_page(page);
        Ok(())
    }

    /// Reads an index page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not an index page.
    pub fn read_index_page(&self, page_number: PageNumber) -> Result<IndexPage> {
        let _structure = self.structure.lock();
        IndexPage::from_page(&self.fetch_page(page_number)?)
    }

    /// Frees an index. Runs when its deletion commits.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read or freed.
    pub fn delete_index(&self, index_id: IndexId, transaction_id: TransId) -> Result<()> {
        let _structure = self.structure.lock();
        let freed = self.remove_index(index_id, true)?;
        debug!(table_space = self.id, index_id, transaction_id, freed, "deleted index");
        Ok(())
    }

    fn remove_index(&self, index_id: IndexId, journaled: bool) -> Result<usize> {
        let mut directory = self.directory(INDEX_DIRECTORY_PAGE, PageType::IndexDirectory)?;
        let Some(root) = directory.root(index_id) else {
            return Ok(0);
        };
        let mut pages = vec![root];
        let mut next = root;
        loop {
            let page = self.fetch_page(next)?;
            if page.page_type() != Some(PageType::Index) || page.owner() != index_id {
                break;
            }
            next = IndexPage::from_page(&page)?.next;
            if next == 0 || pages.contains(&next) {
                break;
            }
            pages.push(next);
        }
        for &page_number in &pages {
            if journaled {
                self.free_page(page_number)?;
            } else {
                self.release_page(page_number)?;
            }
        }
        directory.set_root(index_id, 0)?;
        self.put_directory(INDEX_DIRECTORY_PAGE, &directory);
        Ok(pages.len())
    }

    // ---------------------------------------------------------------
    // Recovery.
    // ---------------------------------------------------------------

    /// Links a section tree page into its parent, formatting it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn redo_section_page(
        &self,
        parent_page: PageNumber,
        page_number: PageNumber,
        slot: u32,
        section_id: SectionId,
        sequence: u32,
        level: u32,
    ) -> Result<()> {
        let _structure = self.structure.lock();
        self.mark_allocated(page_number)?;
        let page = self.fetch_page(page_number)?;
        if page.page_type() != Some(PageType::Section) || page.owner() != section_id {
            self.put_page(SectionPage::new(section_id, level).to_page(self.page_id(page_number)));
        }

        if parent_page == 0 {
            let mut directory = self.directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)?;
            if directory.root(slot) != Some(page_number) {
                directory.set_root(slot, page_number)?;
                self.put_directory(SECTION_DIRECTORY_PAGE, &directory);
            }
        } else {
            let parent = self.fetch_page(parent_page)?;
            if parent.page_type() == Some(PageType::Section) && parent.owner() == section_id {
                let mut parent = SectionPage::from_page(&parent)?;
                if let Some(entry) = parent.slots.get_mut(slot as usize) {
                    *entry = page_number;
                    self.put_page(parent.to_page(self.page_id(parent_page)));
                }
            }
        }
        debug!(table_space = self.id, section_id, page_number, sequence, "redo section page");
        RedoStats::bump(&self.stats.structural_pages);
        Ok(())
    }

    /// Formats a record locator page and links it into its section root.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn redo_record_locator_page(&self, section_id: SectionId, sequence: u32, page_number: PageNumber) -> Result<()> {
        let _structure = self.structure.lock();
        self.mark_allocated(page_number)?;
        let page = self.fetch_page(page_number)?;
        if !RecordLocatorPage::is_locator_for(&page, section_id, sequence) {
            self.put_page(RecordLocatorPage::new(section_id, sequence).to_page(self.page_id(page_number)));
        }

        let directory = self.directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)?;
        if let Some(root_page) = directory.root(section_id) {
            let root = self.fetch_page(root_page)?;
            if root.page_type() == Some(PageType::Section) && root.owner() == section_id {
                let mut root = SectionPage::from_page(&root)?;
                if let Some(slot) = root.slots.get_mut(sequence as usize) {
                    if *slot != page_number {
                        *slot = page_number;
                        self.put_page(root.to_page(self.page_id(root_page)));
                    }
                }
            }
        }
        RedoStats::bump(&self.stats.structural_pages);
        Ok(())
    }

    /// Formats an empty data page unless it already serves `locator_page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be read.
    pub fn redo_data_page(&self, section_id: SectionId, page_number: PageNumber, locator_page: PageNumber) -> Result<()> {
        let _structure = self.structure.lock();
        self.mark_allocated(page_number)?;
        let page = self.fetch_page(page_number)?;
        if !DataPage::is_data_page_for(&page, section_id, locator_page) {
            self.put_page(DataPage::new(section_id, locator_page, false).to_page(self.page_id(page_number)));
        }
        RedoStats::bump(&self.stats.structural_pages);
        Ok(())
    }

    /// Removes a line from a data page.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be read.
    pub fn redo_section_line(&self, page_number: PageNumber, line: u16) -> Result<()> {
        let _structure = self.structure.lock();
        let page = self.fetch_page(page_number)?;
        if page.page_type() != Some(PageType::Data) {
            return Ok(());
        }
        let mut data_page = DataPage::from_page(&page)?;
        if data_page.remove_line(line).is_some() {
            self.put_page(data_page.to_page(self.page_id(page_number)));
            RedoStats::bump(&self.stats.lines_removed);
        }
        Ok(())
    }

    /// Returns a page to the inventory.
    ///
    /// # Errors
    ///
    /// Returns an error if the inventory cannot be read.
    pub fn redo_free_page(&self, page_number: PageNumber) -> Result<()> {
        let _structure = self.structure.lock();
        self.release_page(page_number)?;
        RedoStats::bump(&self.stats.pages_freed);
        Ok(())
    }

    /// Writes a logged index page image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image does not fit a page.
    pub fn redo_index_page(&self, page_number: PageNumber, image: &IndexPage) -> Result<()> {
        let _structure = self.structure.lock();
        self.mark_allocated(page_number)?;
        self.put_page(image.to_page(self.page_id(page_number))?);
        RedoStats::bump(&self.stats.structural_pages);
        Ok(())
    }

    /// Points a locator entry at an early-written blob.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn redo_blob_update(
        &self,
        section_id: SectionId,
        record_number: RecordNumber,
        locator_page: PageNumber,
        data_page: PageNumber,
        data_line: u16,
    ) -> Result<()> {
        let (sequence, index) = split_record(record_number)?;
        let _structure = self.structure.lock();
        let page = self.fetch_page(locator_page)?;
        if !RecordLocatorPage::is_locator_for(&page, section_id, sequence) {
            return Ok(());
        }
        let mut locator = RecordLocatorPage::from_page(&page)?;
        let entry = LocatorEntry {
            data_page,
            line: data_line,
            state: LocatorState::InUse,
        };
        if locator.entries[index] != entry {
            locator.entries[index] = entry;
            self.put_page(locator.to_page(self.page_id(locator_page)));
        }

        let page = self.fetch_page(data_page)?;
        if DataPage::is_data_page_for(&page, section_id, locator_page) {
            let mut blob_page = DataPage::from_page(&page)?;
            if !blob_page.blob {
                blob_page.blob = true;
                self.put_page(blob_page.to_page(self.page_id(data_page)));
            }
        }
        RedoStats::bump(&self.stats.blobs_relinked);
        Ok(())
    }

    /// Unlinks an early-written blob, removing its line when `remove_line` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn redo_blob_delete(
        &self,
        section_id: SectionId,
        record_number: RecordNumber,
        locator_page: PageNumber,
        data_page: PageNumber,
        data_line: u16,
        remove_line: bool,
    ) -> Result<()> {
        let (sequence, index) = split_record(record_number)?;
        let _structure = self.structure.lock();
        let page = self.fetch_page(locator_page)?;
        if RecordLocatorPage::is_locator_for(&page, section_id, sequence) {
            let mut locator = RecordLocatorPage::from_page(&page)?;
            let entry = locator.entries[index];
            if entry.data_page == data_page && entry.line == data_line {
                locator.entries[index] = LocatorEntry::default();
                self.put_page(locator.to_page(self.page_id(locator_page)));
            }
        }

        if remove_line {
            let page = self.fetch_page(data_page)?;
            if DataPage::is_data_page_for(&page, section_id, locator_page) {
                let mut blob_page = DataPage::from_page(&page)?;
                if blob_page.remove_line(data_line).is_some() {
                    self.put_page(blob_page.to_page(self.page_id(data_page)));
                    RedoStats::bump(&self.stats.lines_removed);
                }
            }
        }
        Ok(())
    }

    /// Creates a section root if the directory has none.
    ///
    /// # Errors
    ///
    /// Returns an error if no page is free.
    pub fn redo_create_section(&self, section_id: SectionId) -> Result<()> {
        let _structure = self.structure.lock();
        let mut directory = self.directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)?;
        if directory.root(section_id).is_none() {
            let root = self.allocate_page()?;
            self.put_page(SectionPage::new(section_id, 0).to_page(self.page_id(root)));
            directory.set_root(section_id, root)?;
            self.put_directory(SECTION_DIRECTORY_PAGE, &directory);
        }
        RedoStats::bump(&self.stats.sections_created);
        Ok(())
    }

    /// Frees a dropped section if its root is still in the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn redo_drop_section(&self, section_id: SectionId) -> Result<()> {
        let _structure = self.structure.lock();
        if self.remove_section(section_id, false)? > 0 {
            RedoStats::bump(&self.stats.sections_dropped);
        }
        Ok(())
    }

    /// Registers an index root unless the directory already has one.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn redo_create_index(&self, index_id: IndexId, root_page: PageNumber) -> Result<()> {
        let _structure = self.structure.lock();
        self.mark_allocated(root_page)?;
        let mut directory = self.directory(INDEX_DIRECTORY_PAGE, PageType::IndexDirectory)?;
        if directory.root(index_id).is_none() {
            directory.set_root(index_id, root_page)?;
            self.put_directory(INDEX_DIRECTORY_PAGE, &directory);
        }
        let page = self.fetch_page(root_page)?;
        if page.page_type() != Some(PageType::Index) || page.owner() != index_id {
            self.put_page(IndexPage::empty_root(index_id).to_page(self.page_id(root_page))?);
        }
        RedoStats::bump(&self.stats.indexes_created);
        Ok(())
    }

    /// Frees a deleted index if it is still in the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a page cannot be read.
    pub fn redo_delete_index(&self, index_id: IndexId) -> Result<()> {
        let _structure = self.structure.lock();
        if self.remove_index(index_id, false)? > 0 {
            RedoStats::bump(&self.stats.indexes_deleted);
        }
        Ok(())
    }

    /// Raises a sequence to at least `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is out of range.
    pub fn redo_sequence(&self, sequence_id: SequenceId, value: i64) -> Result<()> {
        let slot = Self::check_sequence(sequence_id)?;
        let _structure = self.structure.lock();
        let mut sequences = self.sequences()?;
        if sequences.values[slot] < value {
            sequences.values[slot] = value;
            self.put_page(sequences.to_page(self.page_id(SEQUENCE_PAGE)));
        }
        RedoStats::bump(&self.stats.sequences);
        Ok(())
    }
}

fn index_page_record(table_space_id: TableSpaceId, page_number: PageNumber, image: &IndexPage) -> LogRecord {
    LogRecord::IndexPage(record::IndexPage {
        table_space_id,
        index_id: image.index_id,
        page_number,
        level: image.level,
        parent: image.parent,
        prior: image.prior,
        next: image.next,
        data: image.data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_space() -> (TableSpace, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let space = TableSpace::create(temp_dir.path(), 0, Uuid::new_v4(), 64).unwrap();
        (space, temp_dir)
    }

    #[test]
    fn test_records_survive_flush_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let long: Vec<u8> = (0..9000u32).map(|n| (n % 251) as u8).collect();
        {
            let space = TableSpace::create(temp_dir.path(), 0, Uuid::new_v4(), 64).unwrap();
            space.create_section(1, 0).unwrap();
            let first = space.insert_stub(1).unwrap();
            let second = space.insert_stub(1).unwrap();
            assert_ne!(first, second);
            space.update_record(1, first, Some(b"short"), 5).unwrap();
            space.update_record(1, second, Some(&long), 5).unwrap();
            space.flush().unwrap();
        }

        let path = temp_dir.path().join(table_space_file_name(0));
        let space = TableSpace::open(&path, 0, 64).unwrap();
        assert_eq!(space.fetch_record(1, 0).unwrap().as_deref(), Some(&b"short"[..]));
        assert_eq!(space.fetch_record(1, 1).unwrap(), Some(long));
    }

    #[test]
    fn test_update_replaces_and_delete_clears() {
        let (space, _temp) = create_test_space();
        space.create_section(2, 0).unwrap();
        let record = space.insert_stub(2).unwrap();
        assert_eq!(space.fetch_record(2, record).unwrap(), None);

        space.update_record(2, record, Some(b"one"), 1).unwrap();
        space.update_record(2, record, Some(b"two"), 2).unwrap();
        assert_eq!(space.fetch_record(2, record).unwrap().as_deref(), Some(&b"two"[..]));

        space.update_record(2, record, None, 3).unwrap();
        assert_eq!(space.fetch_record(2, record).unwrap(), None);
        // The record number is free again.
        assert_eq!(space.insert_stub(2).unwrap(), record);
    }

    #[test]
    fn test_dropped_section_returns_pages() {
        let (space, _temp) = create_test_space();
        space.create_section(3, 0).unwrap();
        for n in 0..20u8 {
            let record = space.insert_stub(3).unwrap();
            space.update_record(3, record, Some(&[n; 700]), 1).unwrap();
        }
        let before = space.inventory().unwrap().allocated();
        space.drop_section(3, 1).unwrap();
        let after = space.inventory().unwrap().allocated();
        assert!(after < before);
        assert!(!space.section_exists(3).unwrap());
        assert!(space.insert_stub(3).is_err());
    }

    #[test]
    fn test_redo_is_idempotent() {
        let (space, _temp) = create_test_space();
        space.redo_create_section(4).unwrap();
        let root = space
            .directory(SECTION_DIRECTORY_PAGE, PageType::SectionDirectory)
            .unwrap()
            .root(4)
            .unwrap();
        space.redo_record_locator_page(4, 0, 40).unwrap();
        space.redo_record_locator_page(4, 0, 40).unwrap();
        space.update_record(4, 3, Some(b"payload"), 1).unwrap();

        // Replaying the locator again must not wipe its entries.
        space.redo_record_locator_page(4, 0, 40).unwrap();
        assert_eq!(space.fetch_record(4, 3).unwrap().as_deref(), Some(&b"payload"[..]));
        let root_page = SectionPage::from_page(&space.fetch_page(root).unwrap()).unwrap();
        assert_eq!(root_page.slots[0], 40);

        space.redo_sequence(1, 10).unwrap();
        space.redo_sequence(1, 7).unwrap();
        assert_eq!(space.sequence_value(1).unwrap(), 10);
        assert_eq!(space.redo_stats().sequences, 2);
    }

    #[test]
    fn test_index_lifecycle() {
        let (space, _temp) = create_test_space();
        let (index_id, root) = space.create_index(9).unwrap();
        assert_eq!(space.index_root(index_id).unwrap(), Some(root));

        let mut image = space.read_index_page(root).unwrap();
        image.data = b"keys".to_vec();
        space.write_index_page(root, &image).unwrap();
        assert_eq!(space.read_index_page(root).unwrap().data, b"keys");

        space.delete_index(index_id, 9).unwrap();
        assert_eq!(space.index_root(index_id).unwrap(), None);
    }

    #[test]
    fn test_sequences_and_header_hint() {
        let temp_dir = TempDir::new().unwrap();
        {
            let space = TableSpace::create(temp_dir.path(), 0, Uuid::new_v4(), 16).unwrap();
            assert_eq!(space.next_sequence_value(2, 5).unwrap(), 5);
            assert_eq!(space.next_sequence_value(2, 5).unwrap(), 10);
            space.set_next_transaction_id(44).unwrap();
            space.flush().unwrap();
        }
        let space = TableSpace::open(&temp_dir.path().join(table_space_file_name(0)), 0, 16).unwrap();
        assert_eq!(space.sequence_value(2).unwrap(), 10);
        assert_eq!(space.next_transaction_id(), 44);
        assert!(TableSpace::open(&temp_dir.path().join(table_space_file_name(0)), 1, 16).is_err());
    }
}
