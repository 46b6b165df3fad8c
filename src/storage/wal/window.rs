//! Serial log windows.
//!
//! A window is a contiguous region of one log file holding a run of
//! consecutive blocks. Its buffer may be dropped while no reader has it
//! activated and reloaded from disk on the next activation. Callers pin a
//! window with an [`ActiveWindow`] guard for exactly as long as they read
//! or write its buffer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, SerialDbError};
use crate::storage::wal::block::{
    round_up, validate_block, BlockHeader, BLOCK_HEADER_SIZE, BLOCK_TRAILER_SIZE,
};
use crate::storage::wal::file::SerialLogFile;

struct WindowInner {
    buffer: Option<Vec<u8>>,
    /// End of the last block written into this window.
    current_length: usize,
    first_block_number: u64,
    /// Offset of block `first_block_number + i` within the window.
    block_offsets: Vec<usize>,
}

/// A region of a serial log file.
pub struct SerialLogWindow {
    file: Arc<SerialLogFile>,
    origin: u64,
    size: usize,
    inner: RwLock<WindowInner>,
    in_use: AtomicUsize,
    writing: AtomicBool,
}

impl SerialLogWindow {
    /// Creates a window with no buffer and no blocks.
    #[must_use]
    pub fn new(file: Arc<SerialLogFile>, origin: u64, size: usize) -> Self {
        Self {
            file,
            origin,
            size,
            inner: RwLock::new(WindowInner {
                buffer: None,
                current_length: 0,
                first_block_number: 0,
                block_offsets: Vec::new(),
            }),
            in_use: AtomicUsize::new(0),
            writing: AtomicBool::new(false),
        }
    }

    /// Creates an empty window that the writer is about to fill.
    #[must_use]
    pub fn for_writing(file: Arc<SerialLogFile>, origin: u64, size: usize) -> Self {
        let window = Self::new(file, origin, size);
        window.inner.write().buffer = Some(vec![0; size]);
        window.writing.store(true, Ordering::Release);
        window
    }

    /// The log file this window belongs to.
    #[must_use]
    pub fn file(&self) -> &Arc<SerialLogFile> {
        &self.file
    }

    /// Byte offset of the window within its file.
    #[must_use]
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Buffer capacity of the window.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// End of the last block in this window.
    #[must_use]
    pub fn current_length(&self) -> usize {
        self.inner.read().current_length
    }

    /// First block in this window, if any.
    #[must_use]
    pub fn first_block_number(&self) -> Option<u64> {
        let inner = self.inner.read();
        (!inner.block_offsets.is_empty()).then_some(inner.first_block_number)
    }

    /// Last block in this window, if any.
    #[must_use]
    pub fn last_block_number(&self) -> Option<u64> {
        let inner = self.inner.read();
        let count = inner.block_offsets.len() as u64;
        (count > 0).then(|| inner.first_block_number + count - 1)
    }

    /// Returns true if `block_number` lives in this window.
    #[must_use]
    pub fn contains_block(&self, block_number: u64) -> bool {
        self.block_offset(block_number).is_some()
    }

    /// Offset of `block_number` within this window.
    #[must_use]
    pub fn block_offset(&self, block_number: u64) -> Option<usize> {
        let inner = self.inner.read();
        let index = block_number.checked_sub(inner.first_block_number)?;
        inner.block_offsets.get(index as usize).copied()
    }

    /// Returns true while a buffer is resident.
    #[must_use]
    pub fn has_buffer(&self) -> bool {
        self.inner.read().buffer.is_some()
    }

    /// Number of outstanding activations.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Returns true while the writer may still add or flush blocks here.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    /// Marks whether the writer still owns this window.
    pub fn set_writing(&self, writing: bool) {
        self.writing.store(writing, Ordering::Release);
    }

    /// Bytes left for new blocks after the current contents.
    #[must_use]
    pub fn remaining(&self, sector_size: usize) -> usize {
        self.size
            .saturating_sub(round_up(self.current_length(), sector_size))
    }

    /// Pins the window, reading it back from its file if the buffer was released.
    ///
    /// Returns the guard and whether a disk read happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the window cannot be read.
    pub fn activate(&self) -> Result<(ActiveWindow<'_>, bool)> {
        let mut inner = self.inner.write();
        let mut loaded = false;
        if inner.buffer.is_none() {
            let mut buffer = vec![0; self.size];
            let length = inner.current_length.min(self.size);
            self.file.read(self.origin, &mut buffer[..length])?;
            inner.buffer = Some(buffer);
            loaded = true;
        }
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Ok((ActiveWindow { window: self }, loaded))
    }

    /// Drops the buffer if nobody has the window activated and the writer is done with it.
    pub fn release_buffer(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.buffer.is_none() || self.in_use() > 0 || self.is_writing() {
            return false;
        }
        inner.buffer = None;
        true
    }

    /// Reads the window's region from disk and indexes the valid block chain in it.
    ///
    /// The first block must carry `expected_first` when given; scanning stops at
    /// the first block that is torn, foreign, or out of sequence. Returns the
    /// number of blocks found.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read.
    pub fn scan(&self, creation_time: u32, sector_size: usize, expected_first: Option<u64>) -> Result<usize> {
        let mut buffer = vec![0; self.size];
        self.file.read(self.origin, &mut buffer)?;

        let mut offsets = Vec::new();
        let mut first = 0;
        let mut expected = expected_first;
        let mut offset = 0;
        let mut end = 0;
        while offset + BLOCK_HEADER_SIZE <= self.size {
            let Some(header) = validate_block(&buffer[offset..], creation_time, expected) else {
                break;
            };
            if offsets.is_empty() {
                first = header.block_number;
            }
            offsets.push(offset);
            end = offset + header.length as usize;
            expected = Some(header.block_number + 1);
            offset = round_up(end, sector_size);
        }

        let mut inner = self.inner.write();
        inner.buffer = Some(buffer);
        inner.first_block_number = first;
        inner.block_offsets = offsets;
        inner.current_length = end;
        Ok(inner.block_offsets.len())
    }

    /// Registers a new block the writer starts at `offset`.
    pub(crate) fn add_block(&self, block_number: u64, offset: usize) {
        let mut inner = self.inner.write();
        if inner.block_offsets.is_empty() {
            inner.first_block_number = block_number;
        }
        inner.block_offsets.push(offset);
    }

    /// Updates the end of the written region.
    pub(crate) fn set_current_length(&self, length: usize) {
        self.inner.write().current_length = length;
    }
}

/// RAII pin on an activated window.
///
/// Automatically deactivates the window when dropped.
pub struct ActiveWindow<'a> {
    window: &'a SerialLogWindow,
}

impl ActiveWindow<'_> {
    /// Copies the data area of `block_number`: the bytes after the header up to
    /// `end` (an offset in the window), or up to the trailer of a closed block.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the block is not in this window or its header is damaged.
    pub fn block_data(&self, block_number: u64, end: Option<usize>) -> Result<Vec<u8>> {
        let offset = self.window.block_offset(block_number).ok_or_else(|| {
            SerialDbError::LogError(format!("block {block_number} is not in this window"))
        })?;
        let inner = self.window.inner.read();
        let buffer = inner.buffer.as_deref().ok_or_else(|| {
            SerialDbError::InvariantViolation("activated window has no buffer".into())
        })?;

        let end = match end {
            Some(end) => end,
            None => {
                let header = BlockHeader::decode(&buffer[offset..])?;
                offset + header.length as usize - BLOCK_TRAILER_SIZE
            }
        };
        let start = offset + BLOCK_HEADER_SIZE;
        buffer
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SerialDbError::LogError(format!("block {block_number} has a bad length")))
    }

    /// Copies `length` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if the range is outside the window.
    pub fn read_range(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        let inner = self.window.inner.read();
        inner
            .buffer
            .as_deref()
            .and_then(|b| b.get(offset..offset + length))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SerialDbError::LogError(format!("range {offset}+{length} outside window")))
    }

    /// Runs `f` over the mutable buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is missing.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut inner = self.window.inner.write();
        let buffer = inner.buffer.as_deref_mut().ok_or_else(|| {
            SerialDbError::InvariantViolation("activated window has no buffer".into())
        })?;
        Ok(f(buffer))
    }
}

impl Drop for ActiveWindow<'_> {
    fn drop(&mut self) {
        self.window.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::block::{write_marker, BLOCK_MARKER_SIZE, BLOCK_TRAILER};
    use tempfile::TempDir;

    const SECTOR: usize = 512;

    fn write_block(window: &SerialLogWindow, number: u64, offset: usize, payload: &[u8]) -> usize {
        let length = BLOCK_HEADER_SIZE + BLOCK_MARKER_SIZE + payload.len() + BLOCK_TRAILER_SIZE;
        let (active, _) = window.activate().unwrap();
        active
            .with_buffer_mut(|buf| {
                BlockHeader {
                    block_number: number,
                    read_block_number: 1,
                    length: length as u32,
                    creation_time: 77,
                    version: 2,
                }
                .encode(&mut buf[offset..]);
                write_marker(&mut buf[offset + BLOCK_HEADER_SIZE..], 2, 0);
                let data = offset + BLOCK_HEADER_SIZE + BLOCK_MARKER_SIZE;
                buf[data..data + payload.len()].copy_from_slice(payload);
                buf[offset + length - 1] = BLOCK_TRAILER;
            })
            .unwrap();
        window.add_block(number, offset);
        window.set_current_length(offset + length);
        let bytes = active.read_range(offset, length).unwrap();
        window.file().write(window.origin() + offset as u64, &bytes).unwrap();
        offset + length
    }

    #[test]
    fn test_scan_finds_written_chain() {
        let temp = TempDir::new().unwrap();
        let file = Arc::new(SerialLogFile::open(&temp.path().join("serial.fl1"), 0).unwrap());
        let window = SerialLogWindow::for_writing(file.clone(), 0, 8 * SECTOR);

        let end = write_block(&window, 5, 0, b"first");
        write_block(&window, 6, round_up(end, SECTOR), b"second");

        let scanned = SerialLogWindow::new(file, 0, 8 * SECTOR);
        assert_eq!(scanned.scan(77, SECTOR, None).unwrap(), 2);
        assert_eq!(scanned.first_block_number(), Some(5));
        assert_eq!(scanned.last_block_number(), Some(6));
        assert!(scanned.contains_block(6));
        assert!(!scanned.contains_block(7));

        let (active, _) = scanned.activate().unwrap();
        let data = active.block_data(6, None).unwrap();
        assert_eq!(&data[BLOCK_MARKER_SIZE..], b"second");

        // A different creation time means the blocks belong to another log.
        let foreign = SerialLogWindow::new(window.file().clone(), 0, 8 * SECTOR);
        assert_eq!(foreign.scan(78, SECTOR, None).unwrap(), 0);
    }

    #[test]
    fn test_buffer_release_and_reload() {
        let temp = TempDir::new().unwrap();
        let file = Arc::new(SerialLogFile::open(&temp.path().join("serial.fl1"), 0).unwrap());
        let window = SerialLogWindow::for_writing(file, 0, 4 * SECTOR);
        write_block(&window, 1, 0, b"payload");

        assert!(!window.release_buffer(), "writer still owns the window");
        window.set_writing(false);

        {
            let (_active, loaded) = window.activate().unwrap();
            assert!(!loaded);
            assert!(!window.release_buffer(), "window is pinned");
        }
        assert!(window.release_buffer());
        assert!(!window.has_buffer());

        let (active, loaded) = window.activate().unwrap();
        assert!(loaded);
        assert_eq!(window.in_use(), 1);
        let data = active.block_data(1, None).unwrap();
        assert_eq!(&data[BLOCK_MARKER_SIZE..], b"payload");
    }
}
