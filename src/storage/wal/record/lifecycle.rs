//! Section, index and sequence lifecycle records.

use std::fmt;

use crate::error::Result;
use crate::storage::wal::control::SerialLogControl;
use crate::storage::wal::record::{get_table_space, put_table_space, Replay};
use crate::storage::wal::varint::{LogInput, LogOutput};
use crate::types::{IndexId, ObjectState, PageNumber, SectionId, SequenceId, TableSpaceId, TransId};

/// A section was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSection {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub section_id: SectionId,
}

impl CreateSection {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.section_id);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            section_id: input.get_u32()?,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        control
            .log()
            .bump_section_incarnation(self.section_id, self.table_space_id, ObjectState::InUse)
    }
}

impl Replay for CreateSection {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump(control)? && control.is_post_flush() {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_create_section(self.section_id)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }
}

impl fmt::Display for CreateSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CreateSection: transaction {}, table space {}, section {}",
            self.transaction_id, self.table_space_id, self.section_id
        )
    }
}

/// A section was dropped. Takes effect when its transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTable {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub section_id: SectionId,
}

impl DropTable {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.section_id);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            section_id: input.get_u32()?,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        control
            .log()
            .bump_section_incarnation(self.section_id, self.table_space_id, ObjectState::Deleted)
    }
}

impl Replay for DropTable {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump(control)? {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_drop_section(self.section_id)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let log = control.log();
        log.set_section_inactive(self.section_id, self.table_space_id);
        log.table_space(self.table_space_id)?
            .drop_section(self.section_id, self.transaction_id)
    }
}

impl fmt::Display for DropTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DropTable: transaction {}, table space {}, section {}",
            self.transaction_id, self.table_space_id, self.section_id
        )
    }
}

/// An index was created with an empty root page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIndex {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub index_id: IndexId,
    pub root_page: PageNumber,
}

impl CreateIndex {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.index_id);
        out.put_u32(self.root_page);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            index_id: input.get_u32()?,
            root_page: input.get_u32()?,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        control
            .log()
            .bump_index_incarnation(self.index_id, self.table_space_id, ObjectState::InUse)
    }
}

impl Replay for CreateIndex {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump(control)? && control.is_post_flush() {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_create_index(self.index_id, self.root_page)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }
}

impl fmt::Display for CreateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CreateIndex: transaction {}, table space {}, index {}, root {}",
            self.transaction_id, self.table_space_id, self.index_id, self.root_page
        )
    }
}

/// An index was deleted. Takes effect when its transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteIndex {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub index_id: IndexId,
}

impl DeleteIndex {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.index_id);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            index_id: input.get_u32()?,
        })
    }

    fn bump(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        control
            .log()
            .bump_index_incarnation(self.index_id, self.table_space_id, ObjectState::Deleted)
    }
}

impl Replay for DeleteIndex {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump(control)? {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_delete_index(self.index_id)?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump(control).map(drop)
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let log = control.log();
        log.table_space(self.table_space_id)?
            .delete_index(self.index_id, self.transaction_id)?;
        log.set_index_inactive(self.index_id, self.table_space_id);
        Ok(())
    }
}

impl fmt::Display for DeleteIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeleteIndex: transaction {}, table space {}, index {}",
            self.transaction_id, self.table_space_id, self.index_id
        )
    }
}

/// New value of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub table_space_id: TableSpaceId,
    pub sequence_id: SequenceId,
    pub value: i64,
}

impl Sequence {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.sequence_id);
        out.put_int64(self.value);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            sequence_id: input.get_u32()?,
            value: input.get_int64()?,
        })
    }
}

impl Replay for Sequence {
    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if control.is_post_flush() {
            control
                .log()
                .table_space(self.table_space_id)?
                .redo_sequence(self.sequence_id, self.value)?;
        }
        Ok(())
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sequence: table space {}, sequence {} = {}",
            self.table_space_id, self.sequence_id, self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::LogRecord;
    use crate::storage::wal::varint::SliceInput;

    #[test]
    fn test_sequence_keeps_large_values() {
        let record = LogRecord::Sequence(Sequence {
            table_space_id: 1,
            sequence_id: 2,
            value: 1 << 40,
        });
        let bytes = record.to_bytes();
        let mut input = SliceInput::new(&bytes, 2);
        let tag = input.get_int().unwrap();
        assert_eq!(LogRecord::decode(tag, &mut input).unwrap(), record);
        assert!(input.is_empty());
    }

    #[test]
    fn test_lifecycle_transactions() {
        let drop_table = LogRecord::DropTable(DropTable {
            table_space_id: 0,
            transaction_id: 17,
            section_id: 4,
        });
        let create_index = LogRecord::CreateIndex(CreateIndex {
            table_space_id: 0,
            transaction_id: 18,
            index_id: 1,
            root_page: 33,
        });
        assert_eq!(drop_table.transaction_id(), 17);
        assert_eq!(create_index.transaction_id(), 18);
        assert!(create_index.to_string().contains("root 33"));
    }
}
