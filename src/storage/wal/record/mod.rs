//! Serial log record kinds.
//!
//! Every record starts with its type tag as a varint, followed by the
//! fields of its kind in a fixed order. Records written with protocol
//! version 1 carry no table space id; readers substitute table space 0.
//!
//! Replay behavior lives on the [`Replay`] trait: recovery drives
//! `pass1`, `pass2` and `redo`, and the gopher drives `commit` and
//! `rollback` over a transaction's own records.

mod data;
mod lifecycle;
mod page;
mod transaction;

pub use data::{BlobDelete, BlobUpdate, DataUpdate, Delete, RecordStub, RecordUpdate, UpdateBlob, UpdateRecords};
pub use lifecycle::{CreateIndex, CreateSection, DeleteIndex, DropTable, Sequence};
pub use page::{DataPage, FreePage, IndexPage, OverflowPages, RecordLocator, SectionLine, SectionPage};
pub use transaction::{Checkpoint, Commit, Prepare, Rollback};

use std::fmt;

use crate::error::{Result, SerialDbError};
use crate::storage::wal::control::SerialLogControl;
use crate::storage::wal::transaction::LogTransactionState;
use crate::storage::wal::varint::{LogInput, LogOutput};
use crate::storage::wal::SRL_VERSION_TABLESPACES;
use crate::types::{TableSpaceId, TransId};

/// Record type tags. The numbering is part of the on-disk format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    End = 0,
    Commit = 2,
    Prepare = 3,
    DataUpdate = 4,
    RecordStub = 7,
    Checkpoint = 8,
    Sequence = 9,
    BlobUpdate = 10,
    Rollback = 11,
    Delete = 12,
    DropTable = 13,
    CreateSection = 14,
    SectionPage = 15,
    FreePage = 16,
    RecordLocator = 17,
    DataPage = 18,
    IndexPage = 21,
    CreateIndex = 23,
    DeleteIndex = 24,
    Version = 25,
    UpdateRecords = 26,
    SectionLine = 30,
    OverflowPages = 31,
    BlobDelete = 34,
    UpdateBlob = 35,
}

impl TryFrom<i32> for RecordType {
    type Error = SerialDbError;

    fn try_from(value: i32) -> Result<Self> {
        Ok(match value {
            0 => RecordType::End,
            2 => RecordType::Commit,
            3 => RecordType::Prepare,
            4 => RecordType::DataUpdate,
            7 => RecordType::RecordStub,
            8 => RecordType::Checkpoint,
            9 => RecordType::Sequence,
            10 => RecordType::BlobUpdate,
            11 => RecordType::Rollback,
            12 => RecordType::Delete,
            13 => RecordType::DropTable,
            14 => RecordType::CreateSection,
            15 => RecordType::SectionPage,
            16 => RecordType::FreePage,
            17 => RecordType::RecordLocator,
            18 => RecordType::DataPage,
            21 => RecordType::IndexPage,
            23 => RecordType::CreateIndex,
            24 => RecordType::DeleteIndex,
            25 => RecordType::Version,
            26 => RecordType::UpdateRecords,
            30 => RecordType::SectionLine,
            31 => RecordType::OverflowPages,
            34 => RecordType::BlobDelete,
            35 => RecordType::UpdateBlob,
            other => {
                return Err(SerialDbError::LogError(format!(
                    "unknown serial log record type {other}"
                )))
            }
        })
    }
}

/// Per-phase replay behavior of a record kind. Kinds override only the
/// phases they take part in.
pub trait Replay {
    /// First recovery pass: registers transactions, notes checkpoints and
    /// counts incarnations.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn pass1(&self, _control: &mut SerialLogControl<'_>) -> Result<()> {
        Ok(())
    }

    /// Second recovery pass: physical page redo.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn pass2(&self, _control: &mut SerialLogControl<'_>) -> Result<()> {
        Ok(())
    }

    /// Third recovery pass: logical redo of committed work.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn redo(&self, _control: &mut SerialLogControl<'_>) -> Result<()> {
        Ok(())
    }

    /// Applies the record on behalf of its committed transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn commit(&self, _control: &mut SerialLogControl<'_>) -> Result<()> {
        Ok(())
    }

    /// Undoes the record on behalf of its rolled back transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    fn rollback(&self, _control: &mut SerialLogControl<'_>) -> Result<()> {
        Ok(())
    }
}

/// A decoded serial log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    Commit(Commit),
    Rollback(Rollback),
    Prepare(Prepare),
    Checkpoint(Checkpoint),
    DataUpdate(DataUpdate),
    Delete(Delete),
    RecordStub(RecordStub),
    UpdateRecords(UpdateRecords),
    UpdateBlob(UpdateBlob),
    BlobUpdate(BlobUpdate),
    BlobDelete(BlobDelete),
    CreateSection(CreateSection),
    DropTable(DropTable),
    SectionPage(SectionPage),
    RecordLocator(RecordLocator),
    DataPage(DataPage),
    SectionLine(SectionLine),
    FreePage(FreePage),
    OverflowPages(OverflowPages),
    IndexPage(IndexPage),
    CreateIndex(CreateIndex),
    DeleteIndex(DeleteIndex),
    Sequence(Sequence),
}

macro_rules! dispatch {
    ($record:expr, $inner:ident => $body:expr) => {
        match $record {
            LogRecord::Commit($inner) => $body,
            LogRecord::Rollback($inner) => $body,
            LogRecord::Prepare($inner) => $body,
            LogRecord::Checkpoint($inner) => $body,
            LogRecord::DataUpdate($inner) => $body,
            LogRecord::Delete($inner) => $body,
            LogRecord::RecordStub($inner) => $body,
            LogRecord::UpdateRecords($inner) => $body,
            LogRecord::UpdateBlob($inner) => $body,
            LogRecord::BlobUpdate($inner) => $body,
            LogRecord::BlobDelete($inner) => $body,
            LogRecord::CreateSection($inner) => $body,
            LogRecord::DropTable($inner) => $body,
            LogRecord::SectionPage($inner) => $body,
            LogRecord::RecordLocator($inner) => $body,
            LogRecord::DataPage($inner) => $body,
            LogRecord::SectionLine($inner) => $body,
            LogRecord::FreePage($inner) => $body,
            LogRecord::OverflowPages($inner) => $body,
            LogRecord::IndexPage($inner) => $body,
            LogRecord::CreateIndex($inner) => $body,
            LogRecord::DeleteIndex($inner) => $body,
            LogRecord::Sequence($inner) => $body,
        }
    };
}

impl LogRecord {
    /// Type tag of this record.
    #[must_use]
    pub fn record_type(&self) -> RecordType {
        match self {
            LogRecord::Commit(_) => RecordType::Commit,
            LogRecord::Rollback(_) => RecordType::Rollback,
            LogRecord::Prepare(_) => RecordType::Prepare,
            LogRecord::Checkpoint(_) => RecordType::Checkpoint,
            LogRecord::DataUpdate(_) => RecordType::DataUpdate,
            LogRecord::Delete(_) => RecordType::Delete,
            LogRecord::RecordStub(_) => RecordType::RecordStub,
            LogRecord::UpdateRecords(_) => RecordType::UpdateRecords,
            LogRecord::UpdateBlob(_) => RecordType::UpdateBlob,
            LogRecord::BlobUpdate(_) => RecordType::BlobUpdate,
            LogRecord::BlobDelete(_) => RecordType::BlobDelete,
            LogRecord::CreateSection(_) => RecordType::CreateSection,
            LogRecord::DropTable(_) => RecordType::DropTable,
            LogRecord::SectionPage(_) => RecordType::SectionPage,
            LogRecord::RecordLocator(_) => RecordType::RecordLocator,
            LogRecord::DataPage(_) => RecordType::DataPage,
            LogRecord::SectionLine(_) => RecordType::SectionLine,
            LogRecord::FreePage(_) => RecordType::FreePage,
            LogRecord::OverflowPages(_) => RecordType::OverflowPages,
            LogRecord::IndexPage(_) => RecordType::IndexPage,
            LogRecord::CreateIndex(_) => RecordType::CreateIndex,
            LogRecord::DeleteIndex(_) => RecordType::DeleteIndex,
            LogRecord::Sequence(_) => RecordType::Sequence,
        }
    }

    /// Transaction the record belongs to, or 0 for non-transactional records.
    #[must_use]
    pub fn transaction_id(&self) -> TransId {
        match self {
            LogRecord::Commit(r) => r.transaction_id,
            LogRecord::Rollback(r) => r.transaction_id,
            LogRecord::Prepare(r) => r.transaction_id,
            LogRecord::DataUpdate(r) => r.transaction_id,
            LogRecord::Delete(r) => r.transaction_id,
            LogRecord::RecordStub(r) => r.transaction_id,
            LogRecord::UpdateRecords(r) => r.transaction_id,
            LogRecord::UpdateBlob(r) => r.transaction_id,
            LogRecord::BlobUpdate(r) => r.transaction_id,
            LogRecord::CreateSection(r) => r.transaction_id,
            LogRecord::DropTable(r) => r.transaction_id,
            LogRecord::CreateIndex(r) => r.transaction_id,
            LogRecord::DeleteIndex(r) => r.transaction_id,
            _ => 0,
        }
    }

    /// Appends the tag and fields using protocol `version`.
    pub fn encode(&self, out: &mut Vec<u8>, version: u32) {
        out.put_int(i32::from(self.record_type() as u8));
        dispatch!(self, r => r.encode(out, version));
    }

    /// Encodes with the current protocol version.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        self.encode(&mut out, crate::storage::wal::SRL_CURRENT_VERSION);
        out
    }

    /// Decodes the fields of a record whose tag has already been read.
    ///
    /// # Errors
    ///
    /// Returns `LogError` for an unknown or non-record tag, or any input error.
    pub fn decode(tag: i32, input: &mut impl LogInput) -> Result<Self> {
        Ok(match RecordType::try_from(tag)? {
            RecordType::Commit => LogRecord::Commit(Commit::decode(input)?),
            RecordType::Rollback => LogRecord::Rollback(Rollback::decode(input)?),
            RecordType::Prepare => LogRecord::Prepare(Prepare::decode(input)?),
            RecordType::Checkpoint => LogRecord::Checkpoint(Checkpoint::decode(input)?),
            RecordType::DataUpdate => LogRecord::DataUpdate(DataUpdate::decode(input)?),
            RecordType::Delete => LogRecord::Delete(Delete::decode(input)?),
            RecordType::RecordStub => LogRecord::RecordStub(RecordStub::decode(input)?),
            RecordType::UpdateRecords => LogRecord::UpdateRecords(UpdateRecords::decode(input)?),
            RecordType::UpdateBlob => LogRecord::UpdateBlob(UpdateBlob::decode(input)?),
            RecordType::BlobUpdate => LogRecord::BlobUpdate(BlobUpdate::decode(input)?),
            RecordType::BlobDelete => LogRecord::BlobDelete(BlobDelete::decode(input)?),
            RecordType::CreateSection => LogRecord::CreateSection(CreateSection::decode(input)?),
            RecordType::DropTable => LogRecord::DropTable(DropTable::decode(input)?),
            RecordType::SectionPage => LogRecord::SectionPage(SectionPage::decode(input)?),
            RecordType::RecordLocator => LogRecord::RecordLocator(RecordLocator::decode(input)?),
            RecordType::DataPage => LogRecord::DataPage(DataPage::decode(input)?),
            RecordType::SectionLine => LogRecord::SectionLine(SectionLine::decode(input)?),
            RecordType::FreePage => LogRecord::FreePage(FreePage::decode(input)?),
            RecordType::OverflowPages => LogRecord::OverflowPages(OverflowPages::decode(input)?),
            RecordType::IndexPage => LogRecord::IndexPage(IndexPage::decode(input)?),
            RecordType::CreateIndex => LogRecord::CreateIndex(CreateIndex::decode(input)?),
            RecordType::DeleteIndex => LogRecord::DeleteIndex(DeleteIndex::decode(input)?),
            RecordType::Sequence => LogRecord::Sequence(Sequence::decode(input)?),
            RecordType::End | RecordType::Version => {
                return Err(SerialDbError::LogError(format!(
                    "framing tag {tag} where a record was expected"
                )))
            }
        })
    }

    /// Recovery pass 1. Also registers the record's transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let transaction_id = self.transaction_id();
        if transaction_id != 0 {
            control.register_transaction(transaction_id);
        }
        dispatch!(self, r => r.pass1(control))
    }

    /// Recovery pass 2.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        dispatch!(self, r => r.pass2(control))
    }

    /// Recovery pass 3.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        dispatch!(self, r => r.redo(control))
    }

    /// Gopher commit action.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        dispatch!(self, r => r.commit(control))
    }

    /// Gopher rollback action.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layer fails.
    pub fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        dispatch!(self, r => r.rollback(control))
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        dispatch!(self, r => fmt::Display::fmt(r, f))
    }
}

/// Reads a table space id, defaulting to 0 for version 1 input.
pub(crate) fn get_table_space(input: &mut impl LogInput) -> Result<TableSpaceId> {
    if input.version() >= SRL_VERSION_TABLESPACES {
        input.get_u32()
    } else {
        Ok(0)
    }
}

/// Writes a table space id if `version` carries one.
pub(crate) fn put_table_space(out: &mut Vec<u8>, version: u32, table_space_id: TableSpaceId) {
    if version >= SRL_VERSION_TABLESPACES {
        out.put_u32(table_space_id);
    }
}

/// Returns true if the log transaction `transaction_id` is known to have committed.
pub(crate) fn is_committed(control: &SerialLogControl<'_>, transaction_id: TransId) -> bool {
    control
        .log()
        .find_transaction(transaction_id)
        .is_some_and(|t| t.state() == LogTransactionState::Committed)
}

/// State of the log transaction `transaction_id`, `Unknown` if never seen.
pub(crate) fn transaction_state(control: &SerialLogControl<'_>, transaction_id: TransId) -> LogTransactionState {
    control
        .log()
        .find_transaction(transaction_id)
        .map_or(LogTransactionState::Unknown, |t| t.state())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::varint::SliceInput;
    use crate::types::Xid;

    fn decode_all(bytes: &[u8], version: u32) -> LogRecord {
        let mut input = SliceInput::new(bytes, version);
        let tag = input.get_int().unwrap();
        let record = LogRecord::decode(tag, &mut input).unwrap();
        assert!(input.is_empty(), "trailing bytes after {record}");
        record
    }

    #[test]
    fn test_data_update_field_order() {
        let record = LogRecord::DataUpdate(DataUpdate {
            table_space_id: 0,
            transaction_id: 42,
            section_id: 7,
            record_number: 1,
            data: b"hello".to_vec(),
        });
        let bytes = record.to_bytes();
        // tag, ts, txn, section, record, length, data
        let mut expected = vec![0x84, 0x80, 0x80 | 42, 0x87, 0x81, 0x85];
        expected.extend_from_slice(b"hello");
        assert_eq!(bytes, expected);
        assert_eq!(decode_all(&bytes, 2), record);
    }

    #[test]
    fn test_version_one_has_no_table_space() {
        let record = LogRecord::Delete(Delete {
            table_space_id: 0,
            transaction_id: 9,
            section_id: 3,
            record_number: 4,
        });
        let mut v1 = Vec::new();
        record.encode(&mut v1, 1);
        let v2 = record.to_bytes();
        assert_eq!(v1.len() + 1, v2.len());
        assert_eq!(decode_all(&v1, 1), record);
    }

    #[test]
    fn test_unknown_tag_is_an_error() {
        let mut input = SliceInput::new(&[], 2);
        assert!(matches!(LogRecord::decode(99, &mut input), Err(SerialDbError::LogError(_))));
        assert!(LogRecord::decode(RecordType::Version as i32, &mut input).is_err());
    }

    #[test]
    fn test_transaction_ids() {
        let prepare = LogRecord::Prepare(Prepare {
            transaction_id: 5,
            xid: Xid::from("xa-1"),
        });
        assert_eq!(prepare.transaction_id(), 5);
        assert_eq!(decode_all(&prepare.to_bytes(), 2), prepare);

        let free = LogRecord::FreePage(FreePage {
            table_space_id: 1,
            page_number: 77,
        });
        assert_eq!(free.transaction_id(), 0);
        assert_eq!(free.record_type(), RecordType::FreePage);
        assert!(free.to_string().contains("77"));
    }
}
