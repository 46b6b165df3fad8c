//! Fixed system pages of a table space plus the index page image.

use crate::error::{Result, SerialDbError};
use crate::storage::page::{Page, PageId, PageType, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::types::{IndexId, PageNumber};

/// Number of pages one inventory bitmap can track.
pub const INVENTORY_CAPACITY: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) * 8;

/// Number of entries in a section or index directory page.
pub const DIRECTORY_SLOTS: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 4;

/// Number of sequences a table space holds.
pub const SEQUENCE_SLOTS: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 8;

const INDEX_META_SIZE: usize = 14;

/// Bytes of index data one index page holds.
pub const INDEX_PAGE_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE - INDEX_META_SIZE;

/// Page allocation bitmap. Bit `n` set means page `n` is in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryPage {
    bits: Vec<u8>,
}

impl InventoryPage {
    /// Creates an inventory with only the given pages marked in use.
    #[must_use]
    pub fn new(reserved: impl IntoIterator<Item = PageNumber>) -> Self {
        let mut inventory = Self {
            bits: vec![0; PAGE_SIZE - PAGE_HEADER_SIZE],
        };
        for page in reserved {
            inventory.set(page, true);
        }
        inventory
    }

    /// Returns whether `page` is marked in use.
    #[must_use]
    pub fn is_set(&self, page: PageNumber) -> bool {
        let page = page as usize;
        page < INVENTORY_CAPACITY && self.bits[page / 8] & (1 << (page % 8)) != 0
    }

    /// Marks `page` in use or free. Pages past the capacity are ignored.
    pub fn set(&mut self, page: PageNumber, in_use: bool) {
        let page = page as usize;
        if page >= INVENTORY_CAPACITY {
            return;
        }
        if in_use {
            self.bits[page / 8] |= 1 << (page % 8);
        } else {
            self.bits[page / 8] &= !(1 << (page % 8));
        }
    }

    /// Finds the first free page at or after `from`.
    #[must_use]
    pub fn first_free(&self, from: PageNumber) -> Option<PageNumber> {
        (from as usize..INVENTORY_CAPACITY)
            .find(|&n| self.bits[n / 8] & (1 << (n % 8)) == 0)
            .map(|n| n as PageNumber)
    }

    /// Number of pages marked in use.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Serializes this page to a raw `Page`.
    #[must_use]
    pub fn to_page(&self, page_id: PageId) -> Page {
        let mut page = Page::new(page_id);
        page.format(PageType::Inventory, 0, 0);
        page.data[PAGE_HEADER_SIZE..].copy_from_slice(&self.bits);
        page
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not an inventory page.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Inventory)?;
        Ok(Self {
            bits: page.data[PAGE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Directory mapping section or index ids to root page numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPage {
    pub kind: PageType,
    pub entries: Vec<PageNumber>,
}

impl DirectoryPage {
    /// Creates an empty directory of the given kind.
    #[must_use]
    pub fn new(kind: PageType) -> Self {
        Self {
            kind,
            entries: vec![0; DIRECTORY_SLOTS],
        }
    }

    /// Root page for `id`, or `None` if unassigned.
    #[must_use]
    pub fn root(&self, id: u32) -> Option<PageNumber> {
        self.entries
            .get(id as usize)
            .copied()
            .filter(|&root| root != 0)
    }

    /// Assigns the root page for `id`.
    ///
    /// # Errors
    ///
    /// Returns `SectionError` if `id` is outside the directory.
    pub fn set_root(&mut self, id: u32, root: PageNumber) -> Result<()> {
        let slot = self.entries.get_mut(id as usize).ok_or_else(|| {
            SerialDbError::SectionError(format!(
                "id {id} exceeds the {DIRECTORY_SLOTS} slots of the {:?} page",
                self.kind
            ))
        })?;
        *slot = root;
        Ok(())
    }

    /// First unassigned id at or above `from`.
    #[must_use]
    pub fn first_unused(&self, from: u32) -> Option<u32> {
        (from as usize..DIRECTORY_SLOTS)
            .find(|&n| self.entries[n] == 0)
            .map(|n| n as u32)
    }

    /// Serializes this page to a raw `Page`.
    #[must_use]
    pub fn to_page(&self, page_id: PageId) -> Page {
        let mut page = Page::new(page_id);
        page.format(self.kind, 0, 0);
        for (n, root) in self.entries.iter().enumerate() {
            page.write_u32(PAGE_HEADER_SIZE + n * 4, *root);
        }
        page
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not a directory of kind `kind`.
    pub fn from_page(page: &Page, kind: PageType) -> Result<Self> {
        page.expect_type(kind)?;
        Ok(Self {
            kind,
            entries: (0..DIRECTORY_SLOTS)
                .map(|n| page.read_u32(PAGE_HEADER_SIZE + n * 4))
                .collect(),
        })
    }
}

/// Current values of the table space sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencePage {
    pub values: Vec<i64>,
}

impl Default for SequencePage {
    fn default() -> Self {
        Self {
            values: vec![0; SEQUENCE_SLOTS],
        }
    }
}

impl SequencePage {
    /// Serializes this page to a raw `Page`.
    #[must_use]
    pub fn to_page(&self, page_id: PageId) -> Page {
        let mut page = Page::new(page_id);
        page.format(PageType::Sequences, 0, 0);
        for (n, value) in self.values.iter().enumerate() {
            page.write_i64(PAGE_HEADER_SIZE + n * 8, *value);
        }
        page
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not a sequence page.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Sequences)?;
        Ok(Self {
            values: (0..SEQUENCE_SLOTS)
                .map(|n| page.read_i64(PAGE_HEADER_SIZE + n * 8))
                .collect(),
        })
    }
}

/// Index page image as carried by index page log records.
///
/// Layout:
/// ```text
/// [0..16)  header (type, index id, level, checksum)
/// [16..20) parent page
/// [20..24) prior sibling
/// [24..28) next sibling
/// [28..30) data length
/// [30..)   index data
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPage {
    pub index_id: IndexId,
    pub level: u32,
    pub parent: PageNumber,
    pub prior: PageNumber,
    pub next: PageNumber,
    pub data: Vec<u8>,
}

impl IndexPage {
    /// Creates an empty root page for an index.
    #[must_use]
    pub fn empty_root(index_id: IndexId) -> Self {
        Self {
            index_id,
            level: 0,
            parent: 0,
            prior: 0,
            next: 0,
            data: Vec::new(),
        }
    }

    /// Serializes this page to a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns `PageError` if the data does not fit.
    pub fn to_page(&self, page_id: PageId) -> Result<Page> {
        if self.data.len() > INDEX_PAGE_CAPACITY {
            return Err(SerialDbError::PageError(format!(
                "index page image of {} bytes exceeds {INDEX_PAGE_CAPACITY}",
                self.data.len()
            )));
        }
        let mut page = Page::new(page_id);
        page.format(PageType::Index, self.index_id, self.level);
        page.write_u32(16, self.parent);
        page.write_u32(20, self.prior);
        page.write_u32(24, self.next);
        page.write_u16(28, self.data.len() as u16);
        let start = PAGE_HEADER_SIZE + INDEX_META_SIZE;
        page.data[start..start + self.data.len()].copy_from_slice(&self.data);
        Ok(page)
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not an index page.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Index)?;
        let start = PAGE_HEADER_SIZE + INDEX_META_SIZE;
        let len = usize::from(page.read_u16(28)).min(INDEX_PAGE_CAPACITY);
        Ok(Self {
            index_id: page.owner(),
            level: page.aux(),
            parent: page.read_u32(16),
            prior: page.read_u32(20),
            next: page.read_u32(24),
            data: page.data[start..start + len].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inventory_allocation_bits() {
        let mut inventory = InventoryPage::new(0..5);
        assert_eq!(inventory.first_free(0), Some(5));
        inventory.set(5, true);
        inventory.set(7, true);
        assert_eq!(inventory.first_free(5), Some(6));
        inventory.set(5, false);
        assert_eq!(inventory.first_free(0), Some(5));
        assert_eq!(inventory.allocated(), 6);

        let page = inventory.to_page(PageId::new(0, 1));
        assert_eq!(InventoryPage::from_page(&page).unwrap(), inventory);
    }

    #[test]
    fn test_directory_roots() {
        let mut directory = DirectoryPage::new(PageType::SectionDirectory);
        directory.set_root(7, 42).unwrap();
        assert_eq!(directory.root(7), Some(42));
        assert_eq!(directory.root(8), None);
        assert_eq!(directory.first_unused(7), Some(8));
        assert!(directory.set_root(DIRECTORY_SLOTS as u32, 1).is_err());

        let page = directory.to_page(PageId::new(0, 2));
        assert!(DirectoryPage::from_page(&page, PageType::IndexDirectory).is_err());
        assert_eq!(
            DirectoryPage::from_page(&page, PageType::SectionDirectory).unwrap(),
            directory
        );
    }

    #[test]
    fn test_index_page_capacity() {
        let mut index = IndexPage::empty_root(3);
        index.data = vec![9; INDEX_PAGE_CAPACITY];
        let page = index.to_page(PageId::new(0, 50)).unwrap();
        assert_eq!(IndexPage::from_page(&page).unwrap(), index);

        index.data.push(1);
        assert!(index.to_page(PageId::new(0, 50)).is_err());
    }
}
