//! Serial log block framing.
//!
//! ```text
//! [0..8)    block number (u64 LE)
//! [8..16)   read block number (u64 LE): oldest block recovery must read
//! [16..20)  length including header and trailer (u32 LE)
//! [20..24)  creation time of the log (u32 LE)
//! [24..26)  protocol version (u16 LE)
//! [26..33)  marker: Version tag, version, fixed 5-byte skip count
//! [33..n-1) record bytes
//! [n-1]     trailer: End tag
//! ```
//!
//! The skip count is the number of leading data bytes that continue a
//! record begun in an earlier block.

use crate::error::{Result, SerialDbError};
use crate::storage::wal::record::RecordType;
use crate::storage::wal::varint::{encode_fixed_int, LogInput, SliceInput, FIXED_INT_LENGTH, LOW_BYTE_FLAG};

/// Size of the fixed block header.
pub const BLOCK_HEADER_SIZE: usize = 26;

/// Size of the marker that starts the data area of every block.
pub const BLOCK_MARKER_SIZE: usize = 2 + FIXED_INT_LENGTH;

/// Size of the trailer.
pub const BLOCK_TRAILER_SIZE: usize = 1;

/// Smallest well-formed block.
pub const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + BLOCK_MARKER_SIZE + BLOCK_TRAILER_SIZE;

/// Trailer byte closing a block.
pub const BLOCK_TRAILER: u8 = RecordType::End as u8 | LOW_BYTE_FLAG;

/// Fixed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub block_number: u64,
    pub read_block_number: u64,
    pub length: u32,
    pub creation_time: u32,
    pub version: u16,
}

impl BlockHeader {
    /// Writes the header into the first `BLOCK_HEADER_SIZE` bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.block_number.to_le_bytes());
        buf[8..16].copy_from_slice(&self.read_block_number.to_le_bytes());
        buf[16..20].copy_from_slice(&self.length.to_le_bytes());
        buf[20..24].copy_from_slice(&self.creation_time.to_le_bytes());
        buf[24..26].copy_from_slice(&self.version.to_le_bytes());
    }

    /// Reads a header from the start of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `LogError` if `buf` is shorter than a header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = buf.get(..BLOCK_HEADER_SIZE).ok_or_else(|| {
            SerialDbError::LogError(format!("block header truncated at {} bytes", buf.len()))
        })?;
        let mut u64_bytes = [0u8; 8];
        let mut u32_bytes = [0u8; 4];
        let mut u16_bytes = [0u8; 2];

        u64_bytes.copy_from_slice(&header[0..8]);
        let block_number = u64::from_le_bytes(u64_bytes);
        u64_bytes.copy_from_slice(&header[8..16]);
        let read_block_number = u64::from_le_bytes(u64_bytes);
        u32_bytes.copy_from_slice(&header[16..20]);
        let length = u32::from_le_bytes(u32_bytes);
        u32_bytes.copy_from_slice(&header[20..24]);
        let creation_time = u32::from_le_bytes(u32_bytes);
        u16_bytes.copy_from_slice(&header[24..26]);
        let version = u16::from_le_bytes(u16_bytes);

        Ok(Self {
            block_number,
            read_block_number,
            length,
            creation_time,
            version,
        })
    }
}

/// Writes the data-area marker at the start of `buf`.
pub fn write_marker(buf: &mut [u8], version: u32, skip: i32) {
    buf[0] = RecordType::Version as u8 | LOW_BYTE_FLAG;
    buf[1] = (version as u8 & 0x3f) | LOW_BYTE_FLAG;
    buf[2..BLOCK_MARKER_SIZE].copy_from_slice(&encode_fixed_int(skip));
}

/// Patches the skip count of a marker written with `write_marker`.
pub fn patch_skip(buf: &mut [u8], skip: i32) {
    buf[2..BLOCK_MARKER_SIZE].copy_from_slice(&encode_fixed_int(skip));
}

/// Parses the marker at the start of a data area into (version, skip).
///
/// # Errors
///
/// Returns `LogError` if the data area does not start with a marker.
pub fn read_marker(data: &[u8], block_number: u64) -> Result<(u32, usize)> {
    let marker = data.get(..BLOCK_MARKER_SIZE).ok_or_else(|| {
        SerialDbError::LogError(format!("block {block_number} is too short for its marker"))
    })?;
    let mut input = SliceInput::new(marker, 0);
    let tag = input.get_int()?;
    if tag != RecordType::Version as i32 {
        return Err(SerialDbError::LogError(format!(
            "block {block_number} starts with tag {tag} instead of a version marker"
        )));
    }
    let version = input.get_int()?;
    let skip = input.get_length()?;
    Ok((version as u32, skip))
}

/// Rounds `n` up to a multiple of `sector`.
#[must_use]
pub fn round_up(n: usize, sector: usize) -> usize {
    n.div_ceil(sector) * sector
}

/// Checks whether `buf` holds a complete block written by this log.
///
/// `expected` pins the block number when scanning a chain.
#[must_use]
pub fn validate_block(buf: &[u8], creation_time: u32, expected: Option<u64>) -> Option<BlockHeader> {
    let header = BlockHeader::decode(buf).ok()?;
    let length = header.length as usize;
    if header.creation_time != creation_time
        || length < MIN_BLOCK_SIZE
        || length > buf.len()
        || buf[length - 1] != BLOCK_TRAILER
    {
        return None;
    }
    if expected.is_some_and(|n| n != header.block_number) {
        return None;
    }
    Some(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(block_number: u64, creation_time: u32) -> Vec<u8> {
        let mut buf = vec![0u8; MIN_BLOCK_SIZE + 4];
        let length = buf.len();
        BlockHeader {
            block_number,
            read_block_number: block_number,
            length: length as u32,
            creation_time,
            version: 2,
        }
        .encode(&mut buf);
        write_marker(&mut buf[BLOCK_HEADER_SIZE..], 2, 0);
        buf[length - 1] = BLOCK_TRAILER;
        buf
    }

    #[test]
    fn test_header_layout() {
        let header = BlockHeader {
            block_number: 7,
            read_block_number: 3,
            length: 512,
            creation_time: 99,
            version: 2,
        };
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        header.encode(&mut buf);
        assert_eq!(buf[0], 7);
        assert_eq!(buf[8], 3);
        assert_eq!(BlockHeader::decode(&buf).unwrap(), header);
        assert!(BlockHeader::decode(&buf[..10]).is_err());
    }

    #[test]
    fn test_marker_skip_patch() {
        let mut data = [0u8; BLOCK_MARKER_SIZE];
        write_marker(&mut data, 2, 0);
        assert_eq!(read_marker(&data, 1).unwrap(), (2, 0));
        patch_skip(&mut data, 300);
        assert_eq!(read_marker(&data, 1).unwrap(), (2, 300));

        data[0] = 0x80 | 4;
        assert!(read_marker(&data, 1).is_err());
    }

    #[test]
    fn test_validate_block() {
        let block = sample_block(12, 55);
        assert!(validate_block(&block, 55, None).is_some());
        assert!(validate_block(&block, 55, Some(12)).is_some());
        assert!(validate_block(&block, 55, Some(13)).is_none());
        assert!(validate_block(&block, 56, None).is_none());

        let mut torn = block.clone();
        let last = torn.len() - 1;
        torn[last] = 0;
        assert!(validate_block(&torn, 55, None).is_none());
        assert!(validate_block(&block[..20], 55, None).is_none());
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 512), 0);
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_up(513, 512), 1024);
    }
}
