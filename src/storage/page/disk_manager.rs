//! Disk manager for page-level I/O on one table space file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SerialDbError};
use crate::storage::page::{Page, PageId, PAGE_SIZE};
use crate::types::{PageNumber, TableSpaceId};

/// Reads and writes fixed-size pages of a single table space file.
///
/// Allocation is not tracked here; the table space inventory page decides
/// which page numbers are live. Writing past the end extends the file.
pub struct DiskManager {
    path: PathBuf,
    file: File,
    table_space_id: TableSpaceId,
}

impl DiskManager {
    /// Opens or creates a table space file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn new(path: &Path, table_space_id: TableSpaceId) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                SerialDbError::StorageError(format!(
                    "Failed to open table space file {}: {e}",
                    path.display()
                ))
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            table_space_id,
        })
    }

    /// Returns the path to the table space file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of whole pages currently in the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn num_pages(&self) -> Result<PageNumber> {
        Ok(self.file_size()?.div_ceil(PAGE_SIZE as u64) as PageNumber)
    }

    /// Reads a page from disk.
    ///
    /// A page beyond the end of the file reads as zeroes.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_page(&mut self, page_number: PageNumber) -> Result<Page> {
        let page_id = PageId::new(self.table_space_id, page_number);

        self.file
            .seek(SeekFrom::Start(page_id.offset()))
            .map_err(|e| SerialDbError::StorageError(format!("Failed to seek to page: {e}")))?;

        let mut data = [0u8; PAGE_SIZE];
        match self.file.read_exact(&mut data) {
            Ok(()) => Ok(Page::from_data(page_id, data)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(Page::new(page_id)),
            Err(e) => Err(SerialDbError::StorageError(format!(
                "Failed to read page {page_id}: {e}"
            ))),
        }
    }

    /// Writes a page to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(page.id.offset()))
            .map_err(|e| SerialDbError::StorageError(format!("Failed to seek to page: {e}")))?;

        self.file
            .write_all(&page.data)
            .map_err(|e| SerialDbError::StorageError(format!("Failed to write page {}: {e}", page.id)))
    }

    /// Flushes all buffered writes to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| SerialDbError::StorageError(format!("Failed to sync file: {e}")))
    }

    /// Returns the size of the file in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn file_size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| SerialDbError::StorageError(format!("Failed to get file size: {e}")))
    }
}
