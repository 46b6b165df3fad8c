//! Identifier types shared by the storage, log and transaction layers.

use std::fmt;

/// Transaction identifier. Zero means "no transaction".
pub type TransId = u32;

/// Table space identifier. Table space 0 always exists.
pub type TableSpaceId = u32;

/// Section (table) identifier within a table space.
pub type SectionId = u32;

/// Index identifier within a table space.
pub type IndexId = u32;

/// Page number within a table space file.
pub type PageNumber = u32;

/// Record number within a section.
pub type RecordNumber = u32;

/// Sequence identifier within a table space.
pub type SequenceId = u32;

/// Last known state of a page, section or index during recovery.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectState {
    /// Not yet seen.
    #[default]
    Unknown = 0,
    /// Allocated and live.
    InUse = 1,
    /// Freed or dropped.
    Deleted = 2,
}

/// External (XA) transaction identifier used for two-phase commit.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Xid(Vec<u8>);

impl Xid {
    /// Creates an XID from raw bytes.
    #[must_use]
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw XID bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the XID length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for a zero-length XID.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({self})")
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<&str> for Xid {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}
