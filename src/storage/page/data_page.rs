//! Data and overflow page layouts.

use crate::error::{Result, SerialDbError};
use crate::storage::page::{Page, PageId, PageType, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::types::{PageNumber, RecordNumber, SectionId};

const DATA_META_SIZE: usize = 4;
const DATA_START: usize = PAGE_HEADER_SIZE + DATA_META_SIZE;

/// Bytes a present line costs beyond its data.
pub const DATA_LINE_OVERHEAD: usize = 1 + 4 + 4 + 2;

/// Longest record prefix stored on a data page; the rest goes to overflow pages.
pub const INLINE_LIMIT: usize = 1024;

const OVERFLOW_START: usize = PAGE_HEADER_SIZE + 2;

/// Bytes of record data one overflow page holds.
pub const OVERFLOW_CAPACITY: usize = PAGE_SIZE - OVERFLOW_START;

const FLAG_BLOB: u16 = 1;

/// One stored record line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLine {
    pub record_number: RecordNumber,
    /// First overflow page of the record tail, 0 if none.
    pub overflow_page: PageNumber,
    pub data: Vec<u8>,
}

/// Data page holding record lines for one record locator page.
///
/// Layout:
/// ```text
/// [0..16)  header (type, section id, locator page, checksum)
/// [16..18) line count: u16
/// [18..20) flags: u16 (bit 0 = dedicated blob page)
/// [20..)   lines: present u8, then record u32, overflow u32, len u16, data
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPage {
    pub section_id: SectionId,
    pub locator_page: PageNumber,
    pub blob: bool,
    pub lines: Vec<Option<DataLine>>,
}

impl DataPage {
    /// Creates an empty data page.
    #[must_use]
    pub fn new(section_id: SectionId, locator_page: PageNumber, blob: bool) -> Self {
        Self {
            section_id,
            locator_page,
            blob,
            lines: Vec::new(),
        }
    }

    /// Returns true if `page` is a data page of `section_id` serving `locator_page`.
    #[must_use]
    pub fn is_data_page_for(page: &Page, section_id: SectionId, locator_page: PageNumber) -> bool {
        page.page_type() == Some(PageType::Data)
            && page.owner() == section_id
            && page.aux() == locator_page
    }

    fn used_bytes(&self) -> usize {
        self.lines
            .iter()
            .map(|line| match line {
                Some(l) => DATA_LINE_OVERHEAD + l.data.len(),
                None => 1,
            })
            .sum()
    }

    /// Bytes still free on the page.
    #[must_use]
    pub fn free_space(&self) -> usize {
        (PAGE_SIZE - DATA_START).saturating_sub(self.used_bytes())
    }

    /// Returns true if a line of `length` bytes fits.
    #[must_use]
    pub fn can_fit(&self, length: usize) -> bool {
        let reuses_slot = self.lines.iter().any(Option::is_none);
        let needed = DATA_LINE_OVERHEAD + length - usize::from(reuses_slot);
        needed <= self.free_space()
    }

    /// Stores a line in the first free slot and returns its line number.
    ///
    /// # Errors
    ///
    /// Returns `PageError` if the line does not fit.
    pub fn insert_line(&mut self, line: DataLine) -> Result<u16> {
        if !self.can_fit(line.data.len()) {
            return Err(SerialDbError::PageError(format!(
                "data page for section {} has no room for {} bytes",
                self.section_id,
                line.data.len()
            )));
        }
        let slot = match self.lines.iter().position(Option::is_none) {
            Some(slot) => {
                self.lines[slot] = Some(line);
                slot
            }
            None => {
                self.lines.push(Some(line));
                self.lines.len() - 1
            }
        };
        Ok(slot as u16)
    }

    /// Removes a line, returning it if present.
    pub fn remove_line(&mut self, line: u16) -> Option<DataLine> {
        let removed = self.lines.get_mut(usize::from(line)).and_then(Option::take);
        while matches!(self.lines.last(), Some(None)) {
            self.lines.pop();
        }
        removed
    }

    /// Returns a line if present.
    #[must_use]
    pub fn line(&self, line: u16) -> Option<&DataLine> {
        self.lines.get(usize::from(line)).and_then(Option::as_ref)
    }

    /// Number of present lines.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.lines.iter().flatten().count()
    }

    /// Serializes this page to a raw `Page`.
    #[must_use]
    pub fn to_page(&self, page_id: PageId) -> Page {
        let mut page = Page::new(page_id);
        page.format(PageType::Data, self.section_id, self.locator_page);
        page.write_u16(PAGE_HEADER_SIZE, self.lines.len() as u16);
        page.write_u16(PAGE_HEADER_SIZE + 2, if self.blob { FLAG_BLOB } else { 0 });

        let mut offset = DATA_START;
        for line in &self.lines {
            match line {
                None => {
                    page.data[offset] = 0;
                    offset += 1;
                }
                Some(line) => {
                    page.data[offset] = 1;
                    page.write_u32(offset + 1, line.record_number);
                    page.write_u32(offset + 5, line.overflow_page);
                    page.write_u16(offset + 9, line.data.len() as u16);
                    let start = offset + DATA_LINE_OVERHEAD;
                    page.data[start..start + line.data.len()].copy_from_slice(&line.data);
                    offset = start + line.data.len();
                }
            }
        }
        page
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not a data page or its lines run off the page.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Data)?;
        let count = usize::from(page.read_u16(PAGE_HEADER_SIZE));
        let flags = page.read_u16(PAGE_HEADER_SIZE + 2);
        let corrupt = || {
            SerialDbError::CorruptedDatabase(format!("data page {} has malformed lines", page.id))
        };

        let mut lines = Vec::with_capacity(count);
        let mut offset = DATA_START;
        for _ in 0..count {
            match page.data.get(offset) {
                Some(0) => {
                    lines.push(None);
                    offset += 1;
                }
                Some(_) => {
                    if offset + DATA_LINE_OVERHEAD > PAGE_SIZE {
                        return Err(corrupt());
                    }
                    let len = usize::from(page.read_u16(offset + 9));
                    let start = offset + DATA_LINE_OVERHEAD;
                    let data = page.data.get(start..start + len).ok_or_else(corrupt)?.to_vec();
                    lines.push(Some(DataLine {
                        record_number: page.read_u32(offset + 1),
                        overflow_page: page.read_u32(offset + 5),
                        data,
                    }));
                    offset = start + len;
                }
                None => return Err(corrupt()),
            }
        }

        Ok(Self {
            section_id: page.owner(),
            locator_page: page.aux(),
            blob: flags & FLAG_BLOB != 0,
            lines,
        })
    }
}

/// Overflow page carrying part of a long record.
///
/// Layout:
/// ```text
/// [0..16)  header (type, section id, next overflow page, checksum)
/// [16..18) data length: u16
/// [18..)   data
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowPage {
    pub section_id: SectionId,
    pub next: PageNumber,
    pub data: Vec<u8>,
}

impl OverflowPage {
    /// Serializes this page to a raw `Page`.
    #[must_use]
    pub fn to_page(&self, page_id: PageId) -> Page {
        let mut page = Page::new(page_id);
        page.format(PageType::Overflow, self.section_id, self.next);
        page.write_u16(PAGE_HEADER_SIZE, self.data.len() as u16);
        page.data[OVERFLOW_START..OVERFLOW_START + self.data.len()].copy_from_slice(&self.data);
        page
    }

    /// Deserializes a raw `Page`.
    ///
    /// # Errors
    ///
    /// Returns an error if the page is not an overflow page.
    pub fn from_page(page: &Page) -> Result<Self> {
        page.expect_type(PageType::Overflow)?;
        let len = usize::from(page.read_u16(PAGE_HEADER_SIZE)).min(OVERFLOW_CAPACITY);
        Ok(Self {
            section_id: page.owner(),
            next: page.aux(),
            data: page.data[OVERFLOW_START..OVERFLOW_START + len].to_vec(),
        })
    }
}
