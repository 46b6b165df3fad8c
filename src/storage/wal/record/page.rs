//! Structural page records.
//!
//! These describe physical changes to section trees, locator and data
//! pages. They carry no transaction and are only acted on by recovery
//! pass 2, for blocks after the last completed checkpoint.

use std::fmt;

use crate::error::Result;
use crate::storage::wal::control::SerialLogControl;
use crate::storage::wal::record::{get_table_space, put_table_space, Replay};
use crate::storage::wal::varint::{LogInput, LogOutput};
use crate::types::{IndexId, ObjectState, PageNumber, SectionId, TableSpaceId};

fn bump_page(
    control: &SerialLogControl<'_>,
    page_number: PageNumber,
    table_space_id: TableSpaceId,
    state: ObjectState,
) -> Result<bool> {
    if page_number == 0 {
        return Ok(false);
    }
    control
        .log()
        .bump_page_incarnation(page_number, table_space_id, state)
}

/// A section tree page was linked into its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionPage {
    pub table_space_id: TableSpaceId,
    pub parent_page: PageNumber,
    pub page_number: PageNumber,
    pub slot: u32,
    pub section_id: SectionId,
    pub sequence: u32,
    pub level: u32,
}

impl SectionPage {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.parent_page);
        out.put_u32(self.page_number);
        out.put_u32(self.slot);
        out.put_u32(self.section_id);
        out.put_u32(self.sequence);
        out.put_u32(self.level);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            parent_page: input.get_u32()?,
            page_number: input.get_u32()?,
            slot: input.get_u32()?,
            section_id: input.get_u32()?,
            sequence: input.get_u32()?,
            level: input.get_u32()?,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        bump_page(control, self.parent_page, self.table_space_id, ObjectState::InUse)?;
        bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse)
    }
}

impl Replay for SectionPage {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump(control)? && control.is_post_flush() {
            control.log().table_space(self.table_space_id)?.redo_section_page(
                self.parent_page,
                self.page_number,
                self.slot,
                self.section_id,
                self.sequence,
                self.level,
            )?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }
}

impl fmt::Display for SectionPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SectionPage: table space {}, section {}, page {} in parent {} slot {}, level {}",
            self.table_space_id, self.section_id, self.page_number, self.parent_page, self.slot, self.level
        )
    }
}

/// A record locator page was created for a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLocator {
    pub table_space_id: TableSpaceId,
    pub section_id: SectionId,
    pub sequence: u32,
    pub page_number: PageNumber,
}

impl RecordLocator {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.section_id);
        out.put_u32(self.sequence);
        out.put_u32(self.page_number);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            section_id: input.get_u32()?,
            sequence: input.get_u32()?,
            page_number: input.get_u32()?,
        })
    }
}

impl Replay for RecordLocator {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse)?
            && control.is_post_flush()
        {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_record_locator_page(self.section_id, self.sequence, self.page_number)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse).map(drop)
    }
}

impl fmt::Display for RecordLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecordLocator: table space {}, section {}, sequence {}, page {}",
            self.table_space_id, self.section_id, self.sequence, self.page_number
        )
    }
}

/// A data page was allocated for a section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPage {
    pub table_space_id: TableSpaceId,
    pub section_id: SectionId,
    pub page_number: PageNumber,
    pub locator_page: PageNumber,
}

impl DataPage {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.section_id);
        out.put_u32(self.page_number);
        out.put_u32(self.locator_page);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            section_id: input.get_u32()?,
            page_number: input.get_u32()?,
            locator_page: input.get_u32()?,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        bump_page(control, self.locator_page, self.table_space_id, ObjectState::InUse)?;
        bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse)
    }
}

impl Replay for DataPage {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump(control)? && control.is_post_flush() {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_data_page(self.section_id, self.page_number, self.locator_page)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }
}

impl fmt::Display for DataPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataPage: table space {}, section {}, page {}, locator {}",
            self.table_space_id, self.section_id, self.page_number, self.locator_page
        )
    }
}

/// A line was removed from a data page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionLine {
    pub table_space_id: TableSpaceId,
    pub section_id: SectionId,
    pub page_number: PageNumber,
    pub line: u32,
}

impl SectionLine {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.section_id);
        out.put_u32(self.page_number);
        out.put_u32(self.line);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            section_id: input.get_u32()?,
            page_number: input.get_u32()?,
            line: input.get_u32()?,
        })
    }
}

impl Replay for SectionLine {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse)?
            && control.is_post_flush()
        {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_section_line(self.page_number, self.line as u16)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse).map(drop)
    }
}

impl fmt::Display for SectionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SectionLine: table space {}, section {}, page {} line {}",
            self.table_space_id, self.section_id, self.page_number, self.line
        )
    }
}

/// A page was returned to the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreePage {
    pub table_space_id: TableSpaceId,
    pub page_number: PageNumber,
}

impl FreePage {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.page_number);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            page_number: input.get_u32()?,
        })
    }
}

impl Replay for FreePage {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_page(control, self.page_number, self.table_space_id, ObjectState::Deleted).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if bump_page(control, self.page_number, self.table_space_id, ObjectState::Deleted)? {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_free_page(self.page_number)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_page(control, self.page_number, self.table_space_id, ObjectState::Deleted).map(drop)
    }
}

impl fmt::Display for FreePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreePage: table space {}, page {}", self.table_space_id, self.page_number)
    }
}

/// Overflow pages were allocated for a long record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowPages {
    pub table_space_id: TableSpaceId,
    pub pages: Vec<PageNumber>,
}

impl OverflowPages {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_int(self.pages.len() as i32);
        for &page in &self.pages {
            out.put_u32(page);
        }
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        let table_space_id = get_table_space(input)?;
        let count = input.get_length()?;
        let pages = (0..count)
            .map(|_| input.get_u32())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            table_space_id,
            pages,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<()> {
        for &page in &self.pages {
            bump_page(control, page, self.table_space_id, ObjectState::InUse)?;
        }
        Ok(())
    }
}

impl Replay for OverflowPages {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control)
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control)
    }
}

impl fmt::Display for OverflowPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OverflowPages: table space {}, pages {:?}",
            self.table_space_id, self.pages
        )
    }
}

/// Full image of an index page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPage {
    pub table_space_id: TableSpaceId,
    pub index_id: IndexId,
    pub page_number: PageNumber,
    pub level: u32,
    pub parent: PageNumber,
    pub prior: PageNumber,
    pub next: PageNumber,
    pub data: Vec<u8>,
}

impl IndexPage {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.index_id);
        out.put_u32(self.page_number);
        out.put_u32(self.level);
        out.put_u32(self.parent);
        out.put_u32(self.prior);
        out.put_u32(self.next);
        out.put_bytes(&self.data);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            index_id: input.get_u32()?,
            page_number: input.get_u32()?,
            level: input.get_u32()?,
            parent: input.get_u32()?,
            prior: input.get_u32()?,
            next: input.get_u32()?,
            data: input.get_bytes()?,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        bump_page(control, self.parent, self.table_space_id, ObjectState::InUse)?;
        bump_page(control, self.page_number, self.table_space_id, ObjectState::InUse)
    }
}

impl Replay for IndexPage {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump(control)? && control.is_post_flush() {
            let image = crate::storage::page::IndexPage {
                index_id: self.index_id,
                level: self.level,
                parent: self.parent,
                prior: self.prior,
                next: self.next,
                data: self.data.clone(),
            };
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_index_page(self.page_number, &image)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }
}

impl fmt::Display for IndexPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IndexPage: table space {}, index {}, page {}, level {}, parent {}, prior {}, next {}, length {}",
            self.table_space_id,
            self.index_id,
            self.page_number,
            self.level,
            self.parent,
            self.prior,
            self.next,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::LogRecord;
    use crate::storage::wal::varint::SliceInput;

    fn reread(record: &LogRecord, version: u32) -> LogRecord {
        let mut bytes = Vec::new();
        record.encode(&mut bytes, version);
        let mut input = SliceInput::new(&bytes, version);
        let tag = input.get_int().unwrap();
        let decoded = LogRecord::decode(tag, &mut input).unwrap();
        assert!(input.is_empty());
        decoded
    }

    #[test]
    fn test_overflow_pages_list() {
        let record = LogRecord::OverflowPages(OverflowPages {
            table_space_id: 3,
            pages: vec![100, 101, 4000],
        });
        assert_eq!(reread(&record, 2), record);
        assert_eq!(record.transaction_id(), 0);
    }

    #[test]
    fn test_section_page_fields_in_order() {
        let record = SectionPage {
            table_space_id: 0,
            parent_page: 9,
            page_number: 10,
            slot: 1,
            section_id: 2,
            sequence: 3,
            level: 0,
        };
        let mut bytes = Vec::new();
        record.encode(&mut bytes, 2);
        assert_eq!(bytes, vec![0x80, 0x89, 0x8A, 0x81, 0x82, 0x83, 0x80]);
    }

    #[test]
    fn test_version_one_index_page() {
        let record = LogRecord::IndexPage(IndexPage {
            table_space_id: 0,
            index_id: 4,
            page_number: 50,
            level: 1,
            parent: 0,
            prior: 49,
            next: 51,
            data: vec![1, 2, 3],
        });
        assert_eq!(reread(&record, 1), record);
    }
}
