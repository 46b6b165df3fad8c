//! Section root and record locator page layouts.
//!
//! A section owns one root `SectionPage` whose slot `n` holds the page
//! number of the record locator page covering records
//! `n * RECORDS_PER_LOCATOR ..`. A locator entry maps a record number to a
//! line on a data page.

use crate::error::Result;
use crate::storage::page::{Page, PageId, PageType, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::types::{PageNumber, SectionId};

/// Number of locator page slots in a section root page.
pub const SECTION_SLOTS: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / 4;

const LOCATOR_ENTRY_SIZE: usize = 8;

/// Number of records addressed by one record locator page.
pub const RECORDS_PER_LOCATOR: usize = (PAGE_SIZE - PAGE_HEADER_SIZE) / LOCATOR_ENTRY_SIZE;

/// Section root page.
///
/// Layout:
/// ```text
/// [0..16)  header (type, section id, level, checksum)
/// [16..)   slots: u32 locator page number per sequence, 0 = none
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPage {
    pub section_id: SectionId,
    pub level: u32,
    pub slots: Vec<PageNumber>,
}

impl SectionPage {
    /// Creates an empty root page.
    #[must_use]
    pub fn new(section_id: SectionId, level: u32) -> Self {
        Self {
            section_id,
            level,
            slots: vec![0; SECTION_SLOTS],
        }
    }

    /// Serializes this page to a raw `Page`.
    #[must_use]
    pub fn to_page(&self, page_id: PageId) -> Page {
        let mut page = Page::new(page_id);
        page.format(PageType::Section, self.section_id, self.level);
        for (n, slot) in self.slots.iter().enumerate() {
            page.write_u32(PAGE_HEADER_SIZE + n * 4, *slot);
        }
        page
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not a section page.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Section)?;
        let slots = (0..SECTION_SLOTS)
            .map(|n| page.read_u32(PAGE_HEADER_SIZE + n * 4))
            .collect();
        Ok(Self {
            section_id: page.owner(),
            level: page.aux(),
            slots,
        })
    }
}

/// State of one record locator entry.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocatorState {
    /// Record number unused.
    #[default]
    Empty = 0,
    /// Record stored at (`data_page`, `line`).
    InUse = 1,
    /// Record number reserved by an uncommitted insert.
    Stub = 2,
}

impl LocatorState {
    fn from_u16(value: u16) -> Self {
        match value {
            1 => LocatorState::InUse,
            2 => LocatorState::Stub,
            _ => LocatorState::Empty,
        }
    }
}

/// One record locator entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocatorEntry {
    pub data_page: PageNumber,
    pub line: u16,
    pub state: LocatorState,
}

/// Record locator page.
///
/// Layout:
/// ```text
/// [0..16)  header (type, section id, sequence, checksum)
/// [16..)   entries: data_page u32, line u16, state u16
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocatorPage {
    pub section_id: SectionId,
    pub sequence: u32,
    pub entries: Vec<LocatorEntry>,
}

impl RecordLocatorPage {
    /// Creates an empty locator page.
    #[must_use]
    pub fn new(section_id: SectionId, sequence: u32) -> Self {
        Self {
            section_id,
            sequence,
            entries: vec![LocatorEntry::default(); RECORDS_PER_LOCATOR],
        }
    }

    /// Returns true if `page` is formatted as the locator for (`section_id`, `sequence`).
    #[must_use]
    pub fn is_locator_for(page: &Page, section_id: SectionId, sequence: u32) -> bool {
        page.page_type() == Some(PageType::RecordLocator)
            && page.owner() == section_id
            && page.aux() == sequence
    }

    /// Serializes this page to a raw `Page`.
    #[must_use]
    pub fn to_page(&self, page_id: PageId) -> Page {
        let mut page = Page::new(page_id);
        page.format(PageType::RecordLocator, self.section_id, self.sequence);
        for (n, entry) in self.entries.iter().enumerate() {
            let offset = PAGE_HEADER_SIZE + n * LOCATOR_ENTRY_SIZE;
            page.write_u32(offset, entry.data_page);
            page.write_u16(offset + 4, entry.line);
            page.write_u16(offset + 6, entry.state as u16);
        }
        page
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not a record locator page.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::RecordLocator)?;
        let entries = (0..RECORDS_PER_LOCATOR)
            .map(|n| {
                let offset = PAGE_HEADER_SIZE + n * LOCATOR_ENTRY_SIZE;
                LocatorEntry {
                    data_page: page.read_u32(offset),
                    line: page.read_u16(offset + 4),
                    state: LocatorState::from_u16(page.read_u16(offset + 6)),
                }
            })
            .collect();
        Ok(Self {
            section_id: page.owner(),
            sequence: page.aux(),
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_page_layout() {
        let mut locator = RecordLocatorPage::new(7, 2);
        locator.entries[1] = LocatorEntry {
            data_page: 40,
            line: 3,
            state: LocatorState::InUse,
        };
        locator.entries[RECORDS_PER_LOCATOR - 1].state = LocatorState::Stub;

        let page = locator.to_page(PageId::new(0, 12));
        assert!(RecordLocatorPage::is_locator_for(&page, 7, 2));
        assert!(!RecordLocatorPage::is_locator_for(&page, 7, 1));

        let decoded = RecordLocatorPage::from_page(&page).unwrap();
        assert_eq!(decoded, locator);
    }

    #[test]
    fn test_section_page_rejects_other_types() {
        let mut section = SectionPage::new(3, 0);
        section.slots[0] = 17;
        let page = section.to_page(PageId::new(0, 6));
        assert_eq!(SectionPage::from_page(&page).unwrap().slots[0], 17);

        let locator = RecordLocatorPage::new(3, 0).to_page(PageId::new(0, 6));
        assert!(SectionPage::from_page(&locator).is_err());
    }
}
