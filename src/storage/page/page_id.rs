//! Page identifier type.

use serde::{Deserialize, Serialize};

use crate::types::{PageNumber, TableSpaceId};

/// Unique identifier for a page in the database.
///
/// A page is identified by:
/// - `table_space_id`: Which table space file the page belongs to
/// - `page_number`: The page number within that file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Table space identifier (0 for the default table space).
    pub table_space_id: TableSpaceId,
    /// Page number within the table space file.
    pub page_number: PageNumber,
}

impl PageId {
    /// Creates a new page ID.
    #[must_use]
    pub const fn new(table_space_id: TableSpaceId, page_number: PageNumber) -> Self {
        Self {
            table_space_id,
            page_number,
        }
    }

    /// Returns the byte offset of this page within its file.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        (self.page_number as u64) * (super::PAGE_SIZE as u64)
    }

    /// Returns true if this is the table space header page.
    #[must_use]
    pub const fn is_header(&self) -> bool {
        self.page_number == 0
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Page({}/{})", self.table_space_id, self.page_number)
    }
}
