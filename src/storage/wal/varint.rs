//! Variable-length integer coding used by every serial log record field.
//!
//! A value is written as big-endian groups of 7 bits. The final byte has
//! the high bit (`0x80`) set. The sign comes from bit `0x40` of the first
//! byte, so small negative numbers stay short: `-1` is the single byte `0xFF`.

use crate::error::{Result, SerialDbError};

/// High bit marking the last byte of a varint.
pub const LOW_BYTE_FLAG: u8 = 0x80;

/// Width of the fixed-length form, enough for any `i32`.
pub const FIXED_INT_LENGTH: usize = 5;

fn fits(value: i64, bytes: usize) -> bool {
    let bits = 7 * bytes - 1;
    if bits >= 63 {
        return true;
    }
    let limit = 1i64 << bits;
    value >= -limit && value < limit
}

/// Number of bytes the varint form of `value` takes (1 to 5).
#[must_use]
pub fn int_byte_count(value: i32) -> usize {
    (1..FIXED_INT_LENGTH)
        .find(|&n| fits(i64::from(value), n))
        .unwrap_or(FIXED_INT_LENGTH)
}

/// Number of bytes the varint form of `value` takes (1 to 10).
#[must_use]
pub fn int64_byte_count(value: i64) -> usize {
    (1..10).find(|&n| fits(value, n)).unwrap_or(10)
}

fn push_groups(out: &mut Vec<u8>, value: i64, count: usize) {
    for i in (1..count).rev() {
        out.push(((value >> (7 * i)) & 0x7f) as u8);
    }
    out.push((value & 0x7f) as u8 | LOW_BYTE_FLAG);
}

/// Writer side of the record codec.
pub trait LogOutput {
    /// Appends raw bytes.
    fn put_data(&mut self, data: &[u8]);

    /// Appends a variable-length `i32`.
    fn put_int(&mut self, value: i32);

    /// Appends a variable-length `i64`.
    fn put_int64(&mut self, value: i64);

    /// Appends an unsigned identifier in its signed varint form.
    fn put_u32(&mut self, value: u32) {
        self.put_int(value as i32);
    }

    /// Appends a length-prefixed byte string.
    fn put_bytes(&mut self, data: &[u8]) {
        self.put_int(data.len() as i32);
        self.put_data(data);
    }
}

impl LogOutput for Vec<u8> {
    fn put_data(&mut self, data: &[u8]) {
        self.extend_from_slice(data);
    }

    fn put_int(&mut self, value: i32) {
        push_groups(self, i64::from(value), int_byte_count(value));
    }

    fn put_int64(&mut self, value: i64) {
        push_groups(self, value, int64_byte_count(value));
    }
}

/// Encodes `value` in exactly `FIXED_INT_LENGTH` bytes.
///
/// Used for fields patched after the surrounding bytes are written.
#[must_use]
pub fn encode_fixed_int(value: i32) -> [u8; FIXED_INT_LENGTH] {
    let mut out = Vec::with_capacity(FIXED_INT_LENGTH);
    push_groups(&mut out, i64::from(value), FIXED_INT_LENGTH);
    let mut fixed = [0u8; FIXED_INT_LENGTH];
    fixed.copy_from_slice(&out);
    fixed
}

/// Reader side of the record codec.
pub trait LogInput {
    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Fails when the input is exhausted.
    fn get_byte(&mut self) -> Result<u8>;

    /// Reads `length` raw bytes.
    ///
    /// # Errors
    ///
    /// Fails when the input is exhausted.
    fn get_data(&mut self, length: usize) -> Result<Vec<u8>>;

    /// Log protocol version the input was written with.
    fn version(&self) -> u32;

    /// Block the reader is positioned in, for error reporting.
    fn block_number(&self) -> u64 {
        0
    }

    /// Reads a variable-length `i32`.
    ///
    /// # Errors
    ///
    /// Fails when the input is exhausted.
    fn get_int(&mut self) -> Result<i32> {
        let value = self.get_int64()?;
        Ok(value as i32)
    }

    /// Reads a variable-length `i64`.
    ///
    /// # Errors
    ///
    /// Fails when the input is exhausted.
    fn get_int64(&mut self) -> Result<i64> {
        let mut c = self.get_byte()?;
        let mut number: i64 = if c & 0x40 != 0 { -1 } else { 0 };
        loop {
            number = (number << 7) | i64::from(c & 0x7f);
            if c & LOW_BYTE_FLAG != 0 {
                return Ok(number);
            }
            c = self.get_byte()?;
        }
    }

    /// Reads an unsigned identifier written with `put_u32`.
    ///
    /// # Errors
    ///
    /// Fails when the input is exhausted.
    fn get_u32(&mut self) -> Result<u32> {
        Ok(self.get_int()? as u32)
    }

    /// Reads a non-negative length field.
    ///
    /// # Errors
    ///
    /// Returns `DataOverrun` for a negative length.
    fn get_length(&mut self) -> Result<usize> {
        let length = self.get_int()?;
        usize::try_from(length).map_err(|_| SerialDbError::DataOverrun {
            block_number: self.block_number(),
            requested: i64::from(length),
        })
    }

    /// Reads a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// Fails when the input is exhausted or the length is negative.
    fn get_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.get_length()?;
        self.get_data(length)
    }
}

/// `LogInput` over an in-memory byte slice.
pub struct SliceInput<'a> {
    data: &'a [u8],
    position: usize,
    version: u32,
}

impl<'a> SliceInput<'a> {
    /// Creates a reader over `data` written with protocol `version`.
    #[must_use]
    pub fn new(data: &'a [u8], version: u32) -> Self {
        Self {
            data,
            position: 0,
            version,
        }
    }

    /// Returns true once every byte is consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.position >= self.data.len()
    }
}

impl LogInput for SliceInput<'_> {
    fn get_byte(&mut self) -> Result<u8> {
        let byte = self
            .data
            .get(self.position)
            .copied()
            .ok_or(SerialDbError::LogOverrun { block_number: 0 })?;
        self.position += 1;
        Ok(byte)
    }

    fn get_data(&mut self, length: usize) -> Result<Vec<u8>> {
        let end = self.position.checked_add(length).filter(|&end| end <= self.data.len());
        let Some(end) = end else {
            return Err(SerialDbError::DataOverrun {
                block_number: 0,
                requested: length as i64,
            });
        };
        let data = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(data)
    }

    fn version(&self) -> u32 {
        self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(value: i32) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_int(value);
        out
    }

    #[test]
    fn test_byte_count_boundaries() {
        assert_eq!(int_byte_count(0), 1);
        assert_eq!(int_byte_count(63), 1);
        assert_eq!(int_byte_count(64), 2);
        assert_eq!(int_byte_count(-64), 1);
        assert_eq!(int_byte_count(-65), 2);
        assert_eq!(int_byte_count((1 << 13) - 1), 2);
        assert_eq!(int_byte_count(1 << 13), 3);
        assert_eq!(int_byte_count(1 << 27), 5);
        assert_eq!(int_byte_count(i32::MAX), 5);
        assert_eq!(int_byte_count(i32::MIN), 5);
        assert_eq!(int64_byte_count(i64::MAX), 10);
        assert_eq!(int64_byte_count(1 << 48), 8);
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(0), vec![0x80]);
        assert_eq!(encode(-1), vec![0xFF]);
        assert_eq!(encode(42), vec![0x80 | 42]);
        assert_eq!(encode(64), vec![0x00, 0xC0]);
        assert_eq!(encode(-65), vec![0x7F, 0xBF]);
    }

    #[test]
    fn test_fixed_form_decodes_like_short_form() {
        for value in [0, 3, -1, 4096, i32::MAX, i32::MIN] {
            let fixed = encode_fixed_int(value);
            let mut input = SliceInput::new(&fixed, 2);
            assert_eq!(input.get_int().unwrap(), value);
            assert!(input.is_empty());
        }
    }

    #[test]
    fn test_truncated_input_fails() {
        let bytes = encode(1 << 20);
        let mut input = SliceInput::new(&bytes[..1], 2);
        assert!(input.get_int().is_err());
    }

    #[test]
    fn test_negative_length_is_overrun() {
        let bytes = encode(-5);
        let mut input = SliceInput::new(&bytes, 2);
        assert!(matches!(
            input.get_length(),
            Err(SerialDbError::DataOverrun { requested: -5, .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_int_length_matches_count(value in any::<i32>()) {
            let bytes = encode(value);
            prop_assert_eq!(bytes.len(), int_byte_count(value));
            prop_assert!(bytes[..bytes.len() - 1].iter().all(|b| b & LOW_BYTE_FLAG == 0));
            let mut input = SliceInput::new(&bytes, 2);
            prop_assert_eq!(input.get_int().unwrap(), value);
        }

        #[test]
        fn prop_int64_length_matches_count(value in any::<i64>()) {
            let mut bytes = Vec::new();
            bytes.put_int64(value);
            prop_assert_eq!(bytes.len(), int64_byte_count(value));
            let mut input = SliceInput::new(&bytes, 2);
            prop_assert_eq!(input.get_int64().unwrap(), value);
        }
    }
}
