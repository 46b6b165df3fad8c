//! Record placement within one section.
//!
//! A section is a root [`SectionPage`] whose slots point at record
//! locator pages. Each locator entry names the data page and line that
//! hold a record. Records longer than [`INLINE_LIMIT`] keep their tail on
//! a chain of overflow pages.
//!
//! Every method here expects the caller to hold the table space
//! structure lock.

use std::collections::BTreeSet;

use crate::error::{Result, SerialDbError};
use crate::storage::page::{
    DataLine, DataPage, LocatorEntry, LocatorState, OverflowPage, Page, PageType,
    RecordLocatorPage, SectionPage, INLINE_LIMIT, OVERFLOW_CAPACITY, RECORDS_PER_LOCATOR,
    SECTION_SLOTS,
};
use crate::storage::table_space::{BlobLocation, TableSpace};
use crate::storage::wal::record::{self, LogRecord};
use crate::types::{PageNumber, RecordNumber, SectionId};

/// Splits a record number into its locator sequence and entry index.
pub(crate) fn split_record(record_number: RecordNumber) -> Result<(u32, usize)> {
    let sequence = record_number as usize / RECORDS_PER_LOCATOR;
    if sequence >= SECTION_SLOTS {
        return Err(SerialDbError::SectionError(format!(
            "record number {record_number} is beyond the last locator page"
        )));
    }
    Ok((sequence as u32, record_number as usize % RECORDS_PER_LOCATOR))
}

/// A section of a table space, bound to its root page.
pub(crate) struct Section<'a> {
    space: &'a TableSpace,
    section_id: SectionId,
    root_page: PageNumber,
}

impl<'a> Section<'a> {
    /// Binds to a section whose root page is already known.
    pub(crate) fn new(space: &'a TableSpace, section_id: SectionId, root_page: PageNumber) -> Self {
        Self {
            space,
            section_id,
            root_page,
        }
    }

    fn root(&self) -> Result<SectionPage> {
        SectionPage::from_page(&self.space.fetch_page(self.root_page)?)
    }

    /// Finds the locator page for `sequence`, creating it when `create` is set.
    fn locator(&self, sequence: u32, create: bool) -> Result<Option<(PageNumber, RecordLocatorPage)>> {
        let mut root = self.root()?;
        let slot = root.slots[sequence as usize];
        if slot != 0 {
            let page = self.space.fetch_page(slot)?;
            if RecordLocatorPage::is_locator_for(&page, self.section_id, sequence) {
                return Ok(Some((slot, RecordLocatorPage::from_page(&page)?)));
            }
        }
        if !create {
            return Ok(None);
        }

        let page_number = self.space.allocate_page()?;
        self.space.journal(LogRecord::RecordLocator(record::RecordLocator {
            table_space_id: self.space.id(),
            section_id: self.section_id,
            sequence,
            page_number,
        }))?;
        let locator = RecordLocatorPage::new(self.section_id, sequence);
        self.space.put_page(locator.to_page(self.space.page_id(page_number)));
        root.slots[sequence as usize] = page_number;
        self.space.put_page(root.to_page(self.space.page_id(self.root_page)));
        Ok(Some((page_number, locator)))
    }

    fn put_locator(&self, page_number: PageNumber, locator: &RecordLocatorPage) {
        self.space
            .put_page(locator.to_page(self.space.page_id(page_number)));
    }

    /// Reserves the first unused record number.
    pub(crate) fn insert_stub(&self) -> Result<RecordNumber> {
        for sequence in 0..SECTION_SLOTS as u32 {
            let Some((page_number, mut locator)) = self.locator(sequence, true)? else {
                continue;
            };
            let Some(index) = locator
                .entries
                .iter()
                .position(|e| e.state == LocatorState::Empty)
            else {
                continue;
            };
            locator.entries[index].state = LocatorState::Stub;
            self.put_locator(page_number, &locator);
            return Ok(sequence * RECORDS_PER_LOCATOR as u32 + index as u32);
        }
        Err(SerialDbError::SectionError(format!(
            "section {} has no free record numbers",
            self.section_id
        )))
    }

    /// Marks `record_number` reserved again unless it already holds data.
    pub(crate) fn reinsert_stub(&self, record_number: RecordNumber) -> Result<()> {
        let (sequence, index) = split_record(record_number)?;
        if let Some((page_number, mut locator)) = self.locator(sequence, true)? {
            if locator.entries[index].state == LocatorState::Empty {
                locator.entries[index].state = LocatorState::Stub;
                self.put_locator(page_number, &locator);
            }
        }
        Ok(())
    }

    /// Stores a new image of a record, or removes it when `data` is `None`.
    pub(crate) fn update(&self, record_number: RecordNumber, data: Option<&[u8]>) -> Result<()> {
        let (sequence, index) = split_record(record_number)?;
        let Some((page_number, mut locator)) = self.locator(sequence, data.is_some())? else {
            return Ok(());
        };
        self.remove_stored(page_number, record_number, index, locator.entries[index])?;
        locator.entries[index] = match data {
            Some(data) => {
                let (data_page, line) = self.place(page_number, &locator, record_number, data)?;
                LocatorEntry {
                    data_page,
                    line,
                    state: LocatorState::InUse,
                }
            }
            None => LocatorEntry::default(),
        };
        self.put_locator(page_number, &locator);
        Ok(())
    }

    /// Removes a record and frees its record number.
    pub(crate) fn expunge(&self, record_number: RecordNumber) -> Result<()> {
        let (sequence, index) = split_record(record_number)?;
        let Some((page_number, mut locator)) = self.locator(sequence, false)? else {
            return Ok(());
        };
        self.remove_stored(page_number, record_number, index, locator.entries[index])?;
        if locator.entries[index] != LocatorEntry::default() {
            locator.entries[index] = LocatorEntry::default();
            self.put_locator(page_number, &locator);
        }
        Ok(())
    }

    /// Reads the current image of a record.
    pub(crate) fn fetch(&self, record_number: RecordNumber) -> Result<Option<Vec<u8>>> {
        let (sequence, index) = split_record(record_number)?;
        let Some((page_number, locator)) = self.locator(sequence, false)? else {
            return Ok(None);
        };
        let entry = locator.entries[index];
        if entry.state != LocatorState::InUse {
            return Ok(None);
        }

        let page = self.space.fetch_page(entry.data_page)?;
        let missing = || {
            SerialDbError::CorruptedDatabase(format!(
                "section {} record {record_number} points at missing line {}/{}",
                self.section_id, entry.data_page, entry.line
            ))
        };
        if !DataPage::is_data_page_for(&page, self.section_id, page_number) {
            return Err(missing());
        }
        let data_page = DataPage::from_page(&page)?;
        let line = data_page
            .line(entry.line)
            .filter(|l| l.record_number == record_number)
            .ok_or_else(missing)?;

        let mut data = line.data.clone();
        let mut next = line.overflow_page;
        while next != 0 {
            let overflow = OverflowPage::from_page(&self.space.fetch_page(next)?)?;
            data.extend_from_slice(&overflow.data);
            next = overflow.next;
        }
        Ok(Some(data))
    }

    /// Writes a record image to a dedicated blob page and links it in.
    ///
    /// The locator, data and overflow pages go to disk before this
    /// returns, after the log records describing them.
    pub(crate) fn store_blob(&self, record_number: RecordNumber, data: &[u8]) -> Result<BlobLocation> {
        let (sequence, index) = split_record(record_number)?;
        let (locator_page, mut locator) = self
            .locator(sequence, true)?
            .ok_or_else(|| SerialDbError::SectionError("locator page not created".into()))?;
        self.remove_stored(locator_page, record_number, index, locator.entries[index])?;

        let data_page_number = self.space.allocate_page()?;
        self.space.journal(LogRecord::DataPage(record::DataPage {
            table_space_id: self.space.id(),
            section_id: self.section_id,
            page_number: data_page_number,
            locator_page,
        }))?;
        let (inline, tail) = data.split_at(data.len().min(INLINE_LIMIT));
        let overflow = self.write_overflow(tail)?;
        let mut data_page = DataPage::new(self.section_id, locator_page, true);
        let data_line = data_page.insert_line(DataLine {
            record_number,
            overflow_page: overflow.first().copied().unwrap_or(0),
            data: inline.to_vec(),
        })?;
        locator.entries[index] = LocatorEntry {
            data_page: data_page_number,
            line: data_line,
            state: LocatorState::InUse,
        };

        self.space.flush_journal()?;
        for &page_number in &overflow {
            self.space.write_through(self.space.fetch_page(page_number)?)?;
        }
        self.space
            .write_through(data_page.to_page(self.space.page_id(data_page_number)))?;
        self.space
            .write_through(locator.to_page(self.space.page_id(locator_page)))?;

        Ok(BlobLocation {
            locator_page,
            locator_line: index as u32,
            data_page: data_page_number,
            data_line: u32::from(data_line),
        })
    }

    /// Every page the section owns: root, locators, data and overflow pages.
    pub(crate) fn owned_pages(&self) -> Result<BTreeSet<PageNumber>> {
        let mut pages = BTreeSet::from([self.root_page]);
        let root = self.root()?;
        for (sequence, &slot) in root.slots.iter().enumerate() {
            if slot == 0 {
                continue;
            }
            let page = self.space.fetch_page(slot)?;
            if !RecordLocatorPage::is_locator_for(&page, self.section_id, sequence as u32) {
                continue;
            }
            pages.insert(slot);
            let locator = RecordLocatorPage::from_page(&page)?;
            for entry in &locator.entries {
                if entry.state != LocatorState::InUse || pages.contains(&entry.data_page) {
                    continue;
                }
                let page = self.space.fetch_page(entry.data_page)?;
                if !DataPage::is_data_page_for(&page, self.section_id, slot) {
                    continue;
                }
                pages.insert(entry.data_page);
                for line in DataPage::from_page(&page)?.lines.iter().flatten() {
                    pages.extend(self.overflow_chain(line.overflow_page)?);
                }
            }
        }
        Ok(pages)
    }

    fn overflow_chain(&self, first: PageNumber) -> Result<Vec<PageNumber>> {
        let mut chain = Vec::new();
        let mut next = first;
        while next != 0 && !chain.contains(&next) {
            let page = self.space.fetch_page(next)?;
            if page.page_type() != Some(PageType::Overflow) || page.owner() != self.section_id {
                break;
            }
            chain.push(next);
            next = page.aux();
        }
        Ok(chain)
    }

    /// Removes the stored line of a record, if the entry still points at it.
    fn remove_stored(
        &self,
        locator_page: PageNumber,
        record_number: RecordNumber,
        index: usize,
        entry: LocatorEntry,
    ) -> Result<()> {
        if entry.state != LocatorState::InUse || entry.data_page == 0 {
            return Ok(());
        }
        let page = self.space.fetch_page(entry.data_page)?;
        if !DataPage::is_data_page_for(&page, self.section_id, locator_page) {
            return Ok(());
        }
        let mut data_page = DataPage::from_page(&page)?;
        let overflow_page = match data_page.line(entry.line) {
            Some(line) if line.record_number == record_number => line.overflow_page,
            _ => return Ok(()),
        };
        data_page.remove_line(entry.line);

        if data_page.blob {
            self.space.journal(LogRecord::BlobDelete(record::BlobDelete {
                table_space_id: self.space.id(),
                section_id: self.section_id,
                record_number,
                locator_page,
                locator_line: index as u32,
                data_page: entry.data_page,
                data_line: u32::from(entry.line),
            }))?;
        } else {
            self.space.journal(LogRecord::SectionLine(record::SectionLine {
                table_space_id: self.space.id(),
                section_id: self.section_id,
                page_number: entry.data_page,
                line: u32::from(entry.line),
            }))?;
        }

        let emptied_blob = data_page.blob && data_page.line_count() == 0;
        self.space
            .put_page(data_page.to_page(self.space.page_id(entry.data_page)));
        for page_number in self.overflow_chain(overflow_page)? {
            self.space.free_page(page_number)?;
        }
        if emptied_blob {
            self.space.free_page(entry.data_page)?;
        }
        Ok(())
    }

    /// Stores a record on a data page of `locator_page` and returns (page, line).
    fn place(
        &self,
        locator_page: PageNumber,
        locator: &RecordLocatorPage,
        record_number: RecordNumber,
        data: &[u8],
    ) -> Result<(PageNumber, u16)> {
        let (inline, tail) = data.split_at(data.len().min(INLINE_LIMIT));
        let overflow = self.write_overflow(tail)?;
        let line = DataLine {
            record_number,
            overflow_page: overflow.first().copied().unwrap_or(0),
            data: inline.to_vec(),
        };

        let candidates: BTreeSet<PageNumber> = locator
            .entries
            .iter()
            .filter(|e| e.state == LocatorState::InUse && e.data_page != 0)
            .map(|e| e.data_page)
            .collect();
        for candidate in candidates {
            let page = self.space.fetch_page(candidate)?;
            if !DataPage::is_data_page_for(&page, self.section_id, locator_page) {
                continue;
            }
            let mut data_page = DataPage::from_page(&page)?;
            if data_page.blob || !data_page.can_fit(line.data.len()) {
                continue;
            }
            let slot = data_page.insert_line(line)?;
            self.space
                .put_page(data_page.to_page(self.space.page_id(candidate)));
            return Ok((candidate, slot));
        }

        let page_number = self.space.allocate_page()?;
        self.space.journal(LogRecord::DataPage(record::DataPage {
            table_space_id: self.space.id(),
            section_id: self.section_id,
            page_number,
            locator_page,
        }))?;
        let mut data_page = DataPage::new(self.section_id, locator_page, false);
        let slot = data_page.insert_line(line)?;
        self.space
            .put_page(data_page.to_page(self.space.page_id(page_number)));
        Ok((page_number, slot))
    }

    /// Writes a record tail to new overflow pages, first page first.
    fn write_overflow(&self, tail: &[u8]) -> Result<Vec<PageNumber>> {
        if tail.is_empty() {
            return Ok(Vec::new());
        }
        let chunks: Vec<&[u8]> = tail.chunks(OVERFLOW_CAPACITY).collect();
        let pages = (0..chunks.len())
            .map(|_| self.space.allocate_page())
            .collect::<Result<Vec<_>>>()?;
        self.space.journal(LogRecord::OverflowPages(record::OverflowPages {
            table_space_id: self.space.id(),
            pages: pages.clone(),
        }))?;

        for (n, chunk) in chunks.iter().enumerate() {
            let overflow = OverflowPage {
                section_id: self.section_id,
                next: pages.get(n + 1).copied().unwrap_or(0),
                data: chunk.to_vec(),
            };
            let page: Page = overflow.to_page(self.space.page_id(pages[n]));
            self.space.put_page(page);
        }
        Ok(pages)
    }
}
