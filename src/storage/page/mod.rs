//! Page-level storage primitives.
//!
//! This module defines the core page abstractions:
//! - `PageId`: Unique identifier for a page
//! - `Page`: Fixed-size data block (4KB) with a 16-byte sealed header
//! - `DiskManager`: File I/O abstraction
//! - `PageType`: Type discriminator for different page layouts
//! - Typed page layouts: section, record locator, data, overflow, index and
//!   the fixed system pages of a table space

mod data_page;
mod disk_manager;
mod page_id;
mod section_page;
mod system_pages;

pub use data_page::{DataLine, DataPage, OverflowPage, DATA_LINE_OVERHEAD, INLINE_LIMIT, OVERFLOW_CAPACITY};
pub use disk_manager::DiskManager;
pub use page_id::PageId;
pub use section_page::{
    LocatorEntry, LocatorState, RecordLocatorPage, SectionPage, RECORDS_PER_LOCATOR, SECTION_SLOTS,
};
pub use system_pages::{
    DirectoryPage, IndexPage, InventoryPage, SequencePage, DIRECTORY_SLOTS, INDEX_PAGE_CAPACITY,
    INVENTORY_CAPACITY, SEQUENCE_SLOTS,
};

use crate::error::{Result, SerialDbError};
use crate::types::PageNumber;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Page header layout (16 bytes):
/// - Offset 0: `page_type` (u32)
/// - Offset 4: owner (section, index or sequence number) (u32)
/// - Offset 8: auxiliary value, meaning depends on the page type (u32)
/// - Offset 12: checksum (u32)
pub const PAGE_HEADER_SIZE: usize = 16;

/// Table space header page.
pub const HEADER_PAGE: PageNumber = 0;
/// Page allocation bitmap.
pub const INVENTORY_PAGE: PageNumber = 1;
/// Section id to root page directory.
pub const SECTION_DIRECTORY_PAGE: PageNumber = 2;
/// Index id to root page directory.
pub const INDEX_DIRECTORY_PAGE: PageNumber = 3;
/// Sequence values.
pub const SEQUENCE_PAGE: PageNumber = 4;
/// First page number handed out by the inventory.
pub const FIRST_ALLOCATABLE_PAGE: PageNumber = 5;

/// A fixed-size page of data.
#[derive(Clone)]
pub struct Page {
    /// Unique identifier for this page.
    pub id: PageId,
    /// Raw page data.
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    /// Creates a new empty page with the given ID.
    #[must_use]
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Creates a page from existing data.
    #[must_use]
    pub fn from_data(id: PageId, data: [u8; PAGE_SIZE]) -> Self {
        Self { id, data }
    }

    /// Returns a read-only view of the page data.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a mutable view of the page data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Raw page type field; zero for a page that was never formatted.
    #[must_use]
    pub fn raw_type(&self) -> u32 {
        self.read_u32(0)
    }

    /// Decoded page type, if the page is formatted with a known type.
    #[must_use]
    pub fn page_type(&self) -> Option<PageType> {
        PageType::from_u32(self.raw_type())
    }

    /// Owner field of the header.
    #[must_use]
    pub fn owner(&self) -> u32 {
        self.read_u32(4)
    }

    /// Auxiliary field of the header.
    #[must_use]
    pub fn aux(&self) -> u32 {
        self.read_u32(8)
    }

    /// Clears the page and writes a fresh header.
    pub fn format(&mut self, page_type: PageType, owner: u32, aux: u32) {
        self.data = [0u8; PAGE_SIZE];
        self.write_u32(0, page_type as u32);
        self.write_u32(4, owner);
        self.write_u32(8, aux);
    }

    fn combined_checksum(&self) -> u32 {
        crc32fast::hash(&self.data[0..12]) ^ crc32fast::hash(&self.data[16..])
    }

    /// Stores the header checksum. Called before a page goes to disk.
    pub fn seal(&mut self) {
        let checksum = self.combined_checksum();
        self.write_u32(12, checksum);
    }

    /// Checks the header checksum of a formatted page.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumError` if a formatted page does not match its seal.
    pub fn verify(&self) -> Result<()> {
        if self.raw_type() == 0 {
            return Ok(());
        }
        let stored = self.read_u32(12);
        let computed = self.combined_checksum();
        if stored == computed {
            Ok(())
        } else {
            Err(SerialDbError::ChecksumError(format!(
                "{}: stored {stored:#010x}, computed {computed:#010x}",
                self.id
            )))
        }
    }

    /// Fails unless the page is formatted as `expected`.
    ///
    /// # Errors
    ///
    /// Returns `PageError` on a type mismatch.
    pub fn expect_type(&self, expected: PageType) -> Result<()> {
        match self.page_type() {
            Some(t) if t == expected => Ok(()),
            _ => Err(SerialDbError::PageError(format!(
                "{} has type {}, expected {expected:?}",
                self.id,
                self.raw_type()
            ))),
        }
    }

    fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.data[offset..offset + N]);
        bytes
    }

    /// Reads a little-endian u16.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    /// Reads a little-endian u32.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.read_array(offset))
    }

    /// Reads a little-endian i64.
    #[must_use]
    pub fn read_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.read_array(offset))
    }

    /// Writes a little-endian u16.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian u32.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian i64.
    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("type", &self.page_type())
            .field("owner", &self.owner())
            .finish()
    }
}

/// Type of page content.
///
/// Stored at offset 0 in each page header as a u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PageType {
    /// Table space header.
    Header = 1,
    /// Page allocation bitmap.
    Inventory = 2,
    /// Section root directory.
    SectionDirectory = 3,
    /// Index root directory.
    IndexDirectory = 4,
    /// Sequence values.
    Sequences = 5,
    /// Section root page listing record locator pages.
    Section = 6,
    /// Record number to (data page, line) map.
    RecordLocator = 7,
    /// Record data lines.
    Data = 8,
    /// Continuation of a long record.
    Overflow = 9,
    /// Index page image.
    Index = 10,
}

impl PageType {
    /// Converts from u32 to `PageType`.
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(PageType::Header),
            2 => Some(PageType::Inventory),
            3 => Some(PageType::SectionDirectory),
            4 => Some(PageType::IndexDirectory),
            5 => Some(PageType::Sequences),
            6 => Some(PageType::Section),
            7 => Some(PageType::RecordLocator),
            8 => Some(PageType::Data),
            9 => Some(PageType::Overflow),
            10 => Some(PageType::Index),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_creation() {
        let id = PageId::new(0, 0);
        let page = Page::new(id);

        assert_eq!(page.id, id);
        assert!(page.data.iter().all(|&b| b == 0));
        assert!(page.page_type().is_none());
        assert!(page.verify().is_ok());
    }

    #[test]
    fn test_seal_detects_corruption() {
        let mut page = Page::new(PageId::new(0, 9));
        page.format(PageType::Data, 7, 12);
        page.data[200] = 0xAB;
        page.seal();
        assert!(page.verify().is_ok());

        page.data[300] = 1;
        assert!(matches!(page.verify(), Err(SerialDbError::ChecksumError(_))));
    }

    #[test]
    fn test_header_fields() {
        let mut page = Page::new(PageId::new(1, 5));
        page.format(PageType::RecordLocator, 7, 3);
        assert_eq!(page.page_type(), Some(PageType::RecordLocator));
        assert_eq!(page.owner(), 7);
        assert_eq!(page.aux(), 3);
        assert!(page.expect_type(PageType::RecordLocator).is_ok());
        assert!(page.expect_type(PageType::Data).is_err());
    }
}
