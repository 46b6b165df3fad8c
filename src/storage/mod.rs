//! Storage layer for serialdb.
//!
//! This module provides:
//! - Page layouts and file I/O ([`page`])
//! - The no-steal page cache of each table space ([`page_cache`])
//! - Table spaces with their sections, indexes and sequences ([`TableSpace`])
//! - The serial log and crash recovery ([`wal`])

mod section;
mod table_space;
mod table_space_manager;

pub mod page;
pub mod page_cache;
pub mod wal;

pub use page::{DiskManager, Page, PageId, PageType, PAGE_SIZE};
pub use page_cache::{PageCache, PageCacheStats};
pub use table_space::{table_space_file_name, BlobLocation, RedoStats, RedoStatsSnapshot, TableSpace};
pub use table_space_manager::{StructureLocks, TableSpaceManager};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SerialDbError};
use crate::storage::wal::record::LogRecord;
use crate::types::{TableSpaceId, TransId};

/// Magic bytes for table space file identification.
pub const MAGIC_BYTES: &[u8; 8] = b"SRLDBTS\0";

/// Current table space format version.
pub const CURRENT_VERSION: u32 = 1;

/// Offset of the serialized header length within page 0.
const HEADER_LENGTH_OFFSET: usize = page::PAGE_HEADER_SIZE;
const HEADER_DATA_OFFSET: usize = HEADER_LENGTH_OFFSET + 4;

/// Sink for the structural log records a table space emits while it
/// changes pages.
///
/// The serial log implements this; a table space without a journal
/// (or whose journal has been dropped) changes pages silently.
pub trait PageJournal: Send + Sync {
    /// Appends a page-change record to the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be appended.
    fn log_page_change(&self, record: LogRecord) -> Result<()>;

    /// Forces every appended record to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written.
    fn flush_journal(&self) -> Result<()>;
}

/// Table space header stored in page 0.
///
/// This header contains:
/// - File format identification (magic bytes)
/// - Format version for compatibility
/// - The table space id and the id of the database it belongs to
/// - A hint for the next transaction id, written at every checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpaceHeader {
    /// Magic bytes for file identification ("SRLDBTS\0").
    pub magic: [u8; 8],
    /// Table space format version.
    pub version: u32,
    /// Id of this table space.
    pub table_space_id: TableSpaceId,
    /// Unique database identifier shared by all table spaces of a database.
    pub database_id: Uuid,
    /// Creation time in seconds since the Unix epoch.
    pub creation_time: u64,
    /// Lowest transaction id never handed out as of the last checkpoint.
    pub next_transaction_id: TransId,
    /// CRC32 checksum of the header (excluding this field).
    pub checksum: u32,
}

impl TableSpaceHeader {
    /// Creates a header for a new table space.
    #[must_use]
    pub fn new(table_space_id: TableSpaceId, database_id: Uuid, creation_time: u64) -> Self {
        let mut header = Self {
            magic: *MAGIC_BYTES,
            version: CURRENT_VERSION,
            table_space_id,
            database_id,
            creation_time,
            next_transaction_id: 1,
            checksum: 0,
        };
        header.update_checksum();
        header
    }

    /// Validates magic bytes, version and checksum.
    ///
    /// # Errors
    ///
    /// Returns an error if the header does not describe a readable table space.
    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC_BYTES {
            return Err(SerialDbError::InvalidDatabaseFile(
                "invalid table space magic bytes".into(),
            ));
        }

        if self.version > CURRENT_VERSION {
            return Err(SerialDbError::UnsupportedVersion {
                version: self.version,
                max_supported: CURRENT_VERSION,
            });
        }

        if !self.verify_checksum() {
            return Err(SerialDbError::ChecksumError(format!(
                "table space {} header",
                self.table_space_id
            )));
        }

        Ok(())
    }

    /// Computes the checksum for this header.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut header_copy = self.clone();
        header_copy.checksum = 0;

        bincode::serialize(&header_copy).map_or(0, |bytes| crc32fast::hash(&bytes))
    }

    /// Updates the checksum field.
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Verifies the header checksum.
    #[must_use]
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Writes the header into a formatted page 0.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_page(&self, page_id: PageId) -> Result<Page> {
        let bytes = bincode::serialize(self).map_err(|e| {
            SerialDbError::StorageError(format!("failed to serialize table space header: {e}"))
        })?;
        let mut page = Page::new(page_id);
        page.format(PageType::Header, self.table_space_id, 0);
        page.write_u32(HEADER_LENGTH_OFFSET, bytes.len() as u32);
        page.data[HEADER_DATA_OFFSET..HEADER_DATA_OFFSET + bytes.len()].copy_from_slice(&bytes);
        Ok(page)
    }

    /// Reads and validates the header from page 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not a table space header.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Header)
            .map_err(|e| SerialDbError::InvalidDatabaseFile(e.to_string()))?;
        let len = page.read_u32(HEADER_LENGTH_OFFSET) as usize;
        let bytes = page
            .data
            .get(HEADER_DATA_OFFSET..HEADER_DATA_OFFSET + len)
            .ok_or_else(|| {
                SerialDbError::CorruptedDatabase(format!("header length {len} exceeds page 0"))
            })?;
        let header: Self = bincode::deserialize(bytes).map_err(|e| {
            SerialDbError::CorruptedDatabase(format!("failed to deserialize table space header: {e}"))
        })?;
        header.validate()?;
        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_validation() {
        let header = TableSpaceHeader::new(3, Uuid::new_v4(), 1_700_000_000);
        assert!(header.validate().is_ok());

        let mut bad_magic = header.clone();
        bad_magic.magic = [0u8; 8];
        bad_magic.update_checksum();
        assert!(matches!(
            bad_magic.validate(),
            Err(SerialDbError::InvalidDatabaseFile(_))
        ));

        let mut future = header.clone();
        future.version = CURRENT_VERSION + 1;
        future.update_checksum();
        assert!(matches!(
            future.validate(),
            Err(SerialDbError::UnsupportedVersion { .. })
        ));

        let mut tampered = header;
        tampered.next_transaction_id = 99;
        assert!(matches!(tampered.validate(), Err(SerialDbError::ChecksumError(_))));
    }

    #[test]
    fn test_header_page_round_trip() {
        let mut header = TableSpaceHeader::new(0, Uuid::new_v4(), 1_700_000_000);
        header.next_transaction_id = 812;
        header.update_checksum();

        let page = header.to_page(PageId::new(0, 0)).unwrap();
        let restored = TableSpaceHeader::from_page(&page).unwrap();
        assert_eq!(restored.database_id, header.database_id);
        assert_eq!(restored.next_transaction_id, 812);

        let blank = Page::new(PageId::new(0, 0));
        assert!(TableSpaceHeader::from_page(&blank).is_err());
    }
}
