//! Logical record changes made by transactions.
//!
//! These records are applied by the gopher after commit, and by recovery
//! pass 3 for transactions known to have committed.

use std::fmt;

use crate::error::{Result, SerialDbError};
use crate::storage::wal::control::SerialLogControl;
use crate::storage::wal::record::{get_table_space, is_committed, put_table_space, transaction_state, Replay};
use crate::storage::wal::transaction::LogTransactionState;
use crate::storage::wal::varint::{LogInput, LogOutput, SliceInput};
use crate::types::{ObjectState, PageNumber, RecordNumber, SectionId, TableSpaceId, TransId};

fn bump_section(control: &SerialLogControl<'_>, section_id: SectionId, table_space_id: TableSpaceId) -> Result<bool> {
    control
        .log()
        .bump_section_incarnation(section_id, table_space_id, ObjectState::InUse)
}

/// Narrows a logged data page line to a line slot.
fn page_line(data_line: u32) -> Result<u16> {
    u16::try_from(data_line)
        .map_err(|_| SerialDbError::LogError(format!("data line {data_line} is outside a data page")))
}

/// Applies a record image (or deletion) if the section is still live.
fn apply_committed(
    control: &SerialLogControl<'_>,
    table_space_id: TableSpaceId,
    section_id: SectionId,
    record_number: RecordNumber,
    data: Option<&[u8]>,
    transaction_id: TransId,
) -> Result<()> {
    let log = control.log();
    if log.is_section_active(section_id, table_space_id) {
        log.table_space(table_space_id)?
            .update_record(section_id, record_number, data, transaction_id)?;
    }
    log.update_section_use_vector(section_id, table_space_id, -1);
    Ok(())
}

/// New image of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUpdate {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub section_id: SectionId,
    pub record_number: RecordNumber,
    pub data: Vec<u8>,
}

impl DataUpdate {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.section_id);
        out.put_u32(self.record_number);
        out.put_bytes(&self.data);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            section_id: input.get_u32()?,
            record_number: input.get_u32()?,
            data: input.get_bytes()?,
        })
    }
}

impl Replay for DataUpdate {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if bump_section(control, self.section_id, self.table_space_id)?
            && is_committed(control, self.transaction_id)
        {
            control.log().table_space(self.table_space_id)?.update_record(
                self.section_id,
                self.record_number,
                Some(&self.data),
                self.transaction_id,
            )?;
        }
        Ok(())
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        apply_committed(
            control,
            self.table_space_id,
            self.section_id,
            self.record_number,
            Some(&self.data),
            self.transaction_id,
        )
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control
            .log()
            .update_section_use_vector(self.section_id, self.table_space_id, -1);
        Ok(())
    }
}

impl fmt::Display for DataUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DataUpdate: transaction {}, table space {}, section {}/{}, length {}",
            self.transaction_id,
            self.table_space_id,
            self.section_id,
            self.record_number,
            self.data.len()
        )
    }
}

/// Record deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delete {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub section_id: SectionId,
    pub record_number: RecordNumber,
}

impl Delete {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.section_id);
        out.put_u32(self.record_number);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            section_id: input.get_u32()?,
            record_number: input.get_u32()?,
        })
    }
}

impl Replay for Delete {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if bump_section(control, self.section_id, self.table_space_id)?
            && is_committed(control, self.transaction_id)
        {
            control.log().table_space(self.table_space_id)?.update_record(
                self.section_id,
                self.record_number,
                None,
                self.transaction_id,
            )?;
        }
        Ok(())
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        apply_committed(
            control,
            self.table_space_id,
            self.section_id,
            self.record_number,
            None,
            self.transaction_id,
        )
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control
            .log()
            .update_section_use_vector(self.section_id, self.table_space_id, -1);
        Ok(())
    }
}

impl fmt::Display for Delete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Delete: transaction {}, table space {}, section {}/{}",
            self.transaction_id, self.table_space_id, self.section_id, self.record_number
        )
    }
}

/// Record number reserved by an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordStub {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub section_id: SectionId,
    pub record_number: RecordNumber,
}

impl RecordStub {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.section_id);
        out.put_u32(self.record_number);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            section_id: input.get_u32()?,
            record_number: input.get_u32()?,
        })
    }
}

impl Replay for RecordStub {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if !bump_section(control, self.section_id, self.table_space_id)? {
            return Ok(());
        }
        let space = control.log().table_space(self.table_space_id)?;
        match transaction_state(control, self.transaction_id) {
            LogTransactionState::Committed | LogTransactionState::Prepared => {
                space.reinsert_stub(self.section_id, self.record_number)
            }
            _ => space.expunge_record(self.section_id, self.record_number, self.transaction_id),
        }
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let log = control.log();
        if log.is_section_active(self.section_id, self.table_space_id) {
            log.table_space(self.table_space_id)?.expunge_record(
                self.section_id,
                self.record_number,
                self.transaction_id,
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for RecordStub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecordStub: transaction {}, table space {}, section {}/{}",
            self.transaction_id, self.table_space_id, self.section_id, self.record_number
        )
    }
}

/// One entry of an `UpdateRecords` batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub table_space_id: TableSpaceId,
    pub section_id: SectionId,
    pub record_number: RecordNumber,
    /// The record number was newly assigned by this transaction.
    pub inserted: bool,
    /// New image, `None` for a delete.
    pub data: Option<Vec<u8>>,
}

/// Batch of record changes by one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecords {
    pub transaction_id: TransId,
    pub updates: Vec<RecordUpdate>,
}

impl UpdateRecords {
    fn encode_updates(&self, version: u32) -> Vec<u8> {
        let mut body = Vec::new();
        for update in &self.updates {
            put_table_space(&mut body, version, update.table_space_id);
            // Inserted records carry the section as -(id + 1).
            let section = i64::from(update.section_id);
            body.put_int64(if update.inserted { -section - 1 } else { section });
            body.put_u32(update.record_number);
            match &update.data {
                Some(data) => body.put_bytes(data),
                None => body.put_int(-1),
            }
        }
        body
    }

    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        out.put_u32(self.transaction_id);
        out.put_bytes(&self.encode_updates(version));
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        let transaction_id = input.get_u32()?;
        let body = input.get_bytes()?;
        let mut body_input = SliceInput::new(&body, input.version());

        let mut updates = Vec::new();
        while !body_input.is_empty() {
            let table_space_id = get_table_space(&mut body_input)?;
            let section = body_input.get_int64()?;
            let (section, inserted) = if section < 0 { (-(section + 1), true) } else { (section, false) };
            let section_id = SectionId::try_from(section)
                .map_err(|_| SerialDbError::LogError(format!("section {section} in a record batch is out of range")))?;
            let record_number = body_input.get_u32()?;
            let length = body_input.get_int()?;
            let data = if length < 0 {
                None
            } else {
                Some(body_input.get_data(length as usize)?)
            };
            updates.push(RecordUpdate {
                table_space_id,
                section_id,
                record_number,
                inserted,
                data,
            });
        }

        Ok(Self {
            transaction_id,
            updates,
        })
    }
}

impl Replay for UpdateRecords {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        for update in &self.updates {
            bump_section(control, update.section_id, update.table_space_id)?;
        }
        Ok(())
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.pass1(control)
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let committed = is_committed(control, self.transaction_id);
        for update in &self.updates {
            if bump_section(control, update.section_id, update.table_space_id)? && committed {
                control.log().table_space(update.table_space_id)?.update_record(
                    update.section_id,
                    update.record_number,
                    update.data.as_deref(),
                    self.transaction_id,
                )?;
            }
        }
        Ok(())
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        for update in &self.updates {
            apply_committed(
                control,
                update.table_space_id,
                update.section_id,
                update.record_number,
                update.data.as_deref(),
                self.transaction_id,
            )?;
        }
        Ok(())
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        for update in &self.updates {
            control
                .log()
                .update_section_use_vector(update.section_id, update.table_space_id, -1);
        }
        Ok(())
    }
}

impl fmt::Display for UpdateRecords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UpdateRecords: transaction {}, {} records",
            self.transaction_id,
            self.updates.len()
        )
    }
}

/// Small blob stored through the log like a record image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBlob {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub section_id: SectionId,
    pub record_number: RecordNumber,
    pub data: Vec<u8>,
}

impl UpdateBlob {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        put_table_space(out, version, self.table_space_id);
        out.put_u32(self.transaction_id);
        out.put_u32(self.section_id);
        out.put_u32(self.record_number);
        out.put_bytes(&self.data);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            table_space_id: get_table_space(input)?,
            transaction_id: input.get_u32()?,
            section_id: input.get_u32()?,
            record_number: input.get_u32()?,
            data: input.get_bytes()?,
        })
    }
}

impl Replay for UpdateBlob {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        bump_section(control, self.section_id, self.table_space_id).map(drop)
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if bump_section(control, self.section_id, self.table_space_id)?
            && is_committed(control, self.transaction_id)
        {
            control.log().table_space(self.table_space_id)?.update_record(
                self.section_id,
                self.record_number,
                Some(&self.data),
                self.transaction_id,
            )?;
        }
        Ok(())
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        apply_committed(
            control,
            self.table_space_id,
            self.section_id,
            self.record_number,
            Some(&self.data),
            self.transaction_id,
        )
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control
            .log()
            .update_section_use_vector(self.section_id, self.table_space_id, -1);
        Ok(())
    }
}

impl fmt::Display for UpdateBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UpdateBlob: transaction {}, table space {}, section {}/{}, length {}",
            self.transaction_id,
            self.table_space_id,
            self.section_id,
            self.record_number,
            self.data.len()
        )
    }
}

/// Large blob written to its pages ahead of commit; the record links it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobUpdate {
    pub table_space_id: TableSpaceId,
    pub transaction_id: TransId,
    pub section_id: SectionId,
    pub record_number: RecordNumber,
    pub locator_page: PageNumber,
    pub locator_line: u32,
    pub data_page: PageNumber,
    pub data_line: u32,
}

fn encode_blob_fields(out: &mut Vec<u8>, version: u32, blob: &BlobUpdate) {
    put_table_space(out, version, blob.table_space_id);
    out.put_u32(blob.transaction_id);
    out.put_u32(blob.section_id);
    out.put_u32(blob.record_number);
    out.put_u32(blob.locator_page);
    out.put_u32(blob.locator_line);
    out.put_u32(blob.data_page);
    out.put_u32(blob.data_line);
}

fn decode_blob_fields(input: &mut impl LogInput) -> Result<BlobUpdate> {
    Ok(BlobUpdate {
        table_space_id: get_table_space(input)?,
        transaction_id: input.get_u32()?,
        section_id: input.get_u32()?,
        record_number: input.get_u32()?,
        locator_page: input.get_u32()?,
        locator_line: input.get_u32()?,
        data_page: input.get_u32()?,
        data_line: input.get_u32()?,
    })
}

impl BlobUpdate {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        encode_blob_fields(out, version, self);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        decode_blob_fields(input)
    }

    fn bump_pages(&self, control: &SerialLogControl<'_>) -> Result<bool> {
        let log = control.log();
        let locator = log.bump_page_incarnation(self.locator_page, self.table_space_id, ObjectState::InUse)?;
        let data = log.bump_page_incarnation(self.data_page, self.table_space_id, ObjectState::InUse)?;
        Ok(locator && data)
    }
}

impl Replay for BlobUpdate {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump_pages(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump_pages(control)? && control.is_post_flush() {
            control.log().table_space(self.table_space_id)?.redo_blob_update(
                self.section_id,
                self.record_number,
                self.locator_page,
                self.data_page,
                page_line(self.data_line)?,
            )?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        if self.bump_pages(control)?
            && transaction_state(control, self.transaction_id) == LogTransactionState::RolledBack
        {
            control.log().table_space(self.table_space_id)?.expunge_record(
                self.section_id,
                self.record_number,
                self.transaction_id,
            )?;
        }
        Ok(())
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let log = control.log();
        if log.is_section_active(self.section_id, self.table_space_id) {
            log.table_space(self.table_space_id)?.expunge_record(
                self.section_id,
                self.record_number,
                self.transaction_id,
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for BlobUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlobUpdate: transaction {}, table space {}, section {}/{}, locator {}/{}, data {}/{}",
            self.transaction_id,
            self.table_space_id,
            self.section_id,
            self.record_number,
            self.locator_page,
            self.locator_line,
            self.data_page,
            self.data_line
        )
    }
}

/// Early-written blob unlinked from its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDelete {
    pub table_space_id: TableSpaceId,
    pub section_id: SectionId,
    pub record_number: RecordNumber,
    pub locator_page: PageNumber,
    pub locator_line: u32,
    pub data_page: PageNumber,
    pub data_line: u32,
}

impl BlobDelete {
    pub(super) fn encode(&self, out: &mut Vec<u8>, version: u32) {
        let fields = BlobUpdate {
            table_space_id: self.table_space_id,
            transaction_id: 0,
            section_id: self.section_id,
            record_number: self.record_number,
            locator_page: self.locator_page,
            locator_line: self.locator_line,
            data_page: self.data_page,
            data_line: self.data_line,
        };
        encode_blob_fields(out, version, &fields);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        let fields = decode_blob_fields(input)?;
        Ok(Self {
            table_space_id: fields.table_space_id,
            section_id: fields.section_id,
            record_number: fields.record_number,
            locator_page: fields.locator_page,
            locator_line: fields.locator_line,
            data_page: fields.data_page,
            data_line: fields.data_line,
        })
    }

    fn bump_pages(&self, control: &SerialLogControl<'_>) -> Result<(bool, bool)> {
        let log = control.log();
        let locator = log.bump_page_incarnation(self.locator_page, self.table_space_id, ObjectState::InUse)?;
        let data = log.bump_page_incarnation(self.data_page, self.table_space_id, ObjectState::InUse)?;
        Ok((locator, data))
    }
}

impl Replay for BlobDelete {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump_pages(control).map(drop)
    }

    fn pass2(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let (locator_current, data_current) = self.bump_pages(control)?;
        if locator_current && control.is_post_flush() {
            control.log().table_space(self.table_space_id)?.redo_blob_delete(
                self.section_id,
                self.record_number,
                self.locator_page,
                self.data_page,
                page_line(self.data_line)?,
                data_current,
            )?;
        }
        Ok(())
    }

    fn redo(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        self.bump_pages(control).map(drop)
    }
}

impl fmt::Display for BlobDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlobDelete: table space {}, section {}/{}, locator {}/{}, data {}/{}",
            self.table_space_id,
            self.section_id,
            self.record_number,
            self.locator_page,
            self.locator_line,
            self.data_page,
            self.data_line
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::record::LogRecord;

    #[test]
    fn test_update_records_batch_encoding() {
        let batch = UpdateRecords {
            transaction_id: 11,
            updates: vec![
                RecordUpdate {
                    table_space_id: 0,
                    section_id: 7,
                    record_number: 1,
                    inserted: true,
                    data: Some(b"new".to_vec()),
                },
                RecordUpdate {
                    table_space_id: 2,
                    section_id: 0,
                    record_number: 9,
                    inserted: false,
                    data: None,
                },
            ],
        };
        let record = LogRecord::UpdateRecords(batch.clone());
        let bytes = record.to_bytes();

        let mut input = SliceInput::new(&bytes, 2);
        let tag = input.get_int().unwrap();
        assert_eq!(LogRecord::decode(tag, &mut input).unwrap(), record);

        // Inserted section 7 is written as -8.
        let mut expected = Vec::new();
        expected.put_int(-8);
        assert_eq!(batch.encode_updates(2)[1], expected[0]);
    }

    #[test]
    fn test_blob_delete_drops_transaction_field() {
        let delete = LogRecord::BlobDelete(BlobDelete {
            table_space_id: 0,
            section_id: 3,
            record_number: 12,
            locator_page: 20,
            locator_line: 12,
            data_page: 40,
            data_line: 0,
        });
        assert_eq!(delete.transaction_id(), 0);
        let bytes = delete.to_bytes();
        let mut input = SliceInput::new(&bytes, 2);
        let tag = input.get_int().unwrap();
        assert_eq!(LogRecord::decode(tag, &mut input).unwrap(), delete);
    }

    #[test]
    fn test_update_records_high_section_ids() {
        let high = 0x8000_0005;
        let batch = UpdateRecords {
            transaction_id: 4,
            updates: vec![
                RecordUpdate {
                    table_space_id: 0,
                    section_id: high,
                    record_number: 2,
                    inserted: true,
                    data: Some(b"x".to_vec()),
                },
                RecordUpdate {
                    table_space_id: 0,
                    section_id: u32::MAX,
                    record_number: 3,
                    inserted: false,
                    data: Some(b"y".to_vec()),
                },
            ],
        };
        let record = LogRecord::UpdateRecords(batch);
        let bytes = record.to_bytes();

        let mut input = SliceInput::new(&bytes, 2);
        let tag = input.get_int().unwrap();
        assert_eq!(LogRecord::decode(tag, &mut input).unwrap(), record);
    }

    #[test]
    fn test_data_line_must_fit_a_page() {
        assert_eq!(page_line(12).unwrap(), 12);
        assert_eq!(page_line(u32::from(u16::MAX)).unwrap(), u16::MAX);
        assert!(matches!(page_line(70_000), Err(SerialDbError::LogError(_))));
    }
}
