//! One of the two alternating serial log files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Result, SerialDbError};

/// Positional reader/writer over `serial.fl1` or `serial.fl2`.
pub struct SerialLogFile {
    path: PathBuf,
    file: Mutex<File>,
    index: usize,
    high_water: AtomicU64,
    writes: AtomicU64,
}

impl SerialLogFile {
    /// Opens or creates the log file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path, index: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                SerialDbError::StorageError(format!(
                    "Failed to open serial log {}: {e}",
                    path.display()
                ))
            })?;
        let len = file
            .metadata()
            .map_err(|e| SerialDbError::StorageError(format!("Failed to stat serial log: {e}")))?
            .len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index,
            high_water: AtomicU64::new(len),
            writes: AtomicU64::new(0),
        })
    }

    /// Returns the file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Position of this file in the log's file pair (0 or 1).
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of block writes issued.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Highest byte offset written or found on open.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Reads up to `buf.len()` bytes at `offset`. Bytes past the end of the
    /// file are zero-filled. Returns the number of bytes actually read.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SerialDbError::StorageError(format!("Failed to seek serial log: {e}")))?;

        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(SerialDbError::StorageError(format!(
                        "Failed to read serial log {}: {e}",
                        self.path.display()
                    )))
                }
            }
        }
        buf[total..].fill(0);
        Ok(total)
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SerialDbError::StorageError(format!("Failed to seek serial log: {e}")))?;
        file.write_all(data).map_err(|e| {
            SerialDbError::StorageError(format!(
                "Failed to write serial log {}: {e}",
                self.path.display()
            ))
        })?;
        self.high_water
            .fetch_max(offset + data.len() as u64, Ordering::Relaxed);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Forces written data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> Result<()> {
        self.file
            .lock()
            .sync_data()
            .map_err(|e| SerialDbError::StorageError(format!("Failed to sync serial log: {e}")))
    }

    /// Truncates the file to zero length.
    ///
    /// # Errors
    ///
    /// Returns an error if the truncation fails.
    pub fn zap(&self) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0)
            .map_err(|e| SerialDbError::StorageError(format!("Failed to truncate serial log: {e}")))?;
        self.high_water.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_positional_io() {
        let temp = TempDir::new().unwrap();
        let file = SerialLogFile::open(&temp.path().join("serial.fl1"), 0).unwrap();

        file.write(512, b"block").unwrap();
        assert_eq!(file.size(), 517);
        assert_eq!(file.writes(), 1);

        let mut buf = [0xAAu8; 16];
        let read = file.read(510, &mut buf).unwrap();
        assert_eq!(read, 7);
        assert_eq!(&buf[2..7], b"block");
        assert!(buf[7..].iter().all(|&b| b == 0));

        file.sync().unwrap();
        file.zap().unwrap();
        assert_eq!(file.read(0, &mut buf).unwrap(), 0);
    }
}
