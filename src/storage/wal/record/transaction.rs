//! Transaction outcome and checkpoint records.

use std::fmt;

use crate::error::Result;
use crate::storage::wal::control::SerialLogControl;
use crate::storage::wal::record::Replay;
use crate::storage::wal::transaction::LogTransactionState;
use crate::storage::wal::varint::{LogInput, LogOutput};
use crate::types::{TransId, Xid};

/// Transaction committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub transaction_id: TransId,
}

impl Commit {
    pub(super) fn encode(&self, out: &mut Vec<u8>, _version: u32) {
        out.put_u32(self.transaction_id);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            transaction_id: input.get_u32()?,
        })
    }
}

impl Replay for Commit {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control
            .get_transaction(self.transaction_id)
            .set_state(LogTransactionState::Committed);
        Ok(())
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control.finish_if_completing(self.transaction_id);
        Ok(())
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control.finish_if_completing(self.transaction_id);
        Ok(())
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commit: transaction {}", self.transaction_id)
    }
}

/// Transaction rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollback {
    pub transaction_id: TransId,
}

impl Rollback {
    pub(super) fn encode(&self, out: &mut Vec<u8>, _version: u32) {
        out.put_u32(self.transaction_id);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            transaction_id: input.get_u32()?,
        })
    }
}

impl Replay for Rollback {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control
            .get_transaction(self.transaction_id)
            .set_state(LogTransactionState::RolledBack);
        Ok(())
    }

    fn commit(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control.finish_if_completing(self.transaction_id);
        Ok(())
    }

    fn rollback(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control.finish_if_completing(self.transaction_id);
        Ok(())
    }
}

impl fmt::Display for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rollback: transaction {}", self.transaction_id)
    }
}

/// First phase of a two-phase commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    pub transaction_id: TransId,
    pub xid: Xid,
}

impl Prepare {
    pub(super) fn encode(&self, out: &mut Vec<u8>, _version: u32) {
        out.put_u32(self.transaction_id);
        out.put_bytes(self.xid.as_bytes());
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            transaction_id: input.get_u32()?,
            xid: Xid::new(input.get_bytes()?),
        })
    }
}

impl Replay for Prepare {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        let transaction = control.get_transaction(self.transaction_id);
        transaction.set_xid(self.xid.clone());
        transaction.set_state(LogTransactionState::Prepared);
        Ok(())
    }
}

impl fmt::Display for Prepare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Prepare: transaction {}, xid {}", self.transaction_id, self.xid)
    }
}

/// Pages were flushed through `block_number`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub block_number: u64,
}

impl Checkpoint {
    pub(super) fn encode(&self, out: &mut Vec<u8>, _version: u32) {
        out.put_int64(self.block_number as i64);
    }

    pub(super) fn decode(input: &mut impl LogInput) -> Result<Self> {
        Ok(Self {
            block_number: input.get_int64()? as u64,
        })
    }
}

impl Replay for Checkpoint {
    fn pass1(&self, control: &mut SerialLogControl<'_>) -> Result<()> {
        control.have_checkpoint(self.block_number);
        Ok(())
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checkpoint: block {}", self.block_number)
    }
}
