//! Variable-length integer encoding utilities.
//!
//! 7 bits per byte with a continuation bit, plus zig-zag mapping for signed
//! values so small negative deltas stay short.

use crate::error::{GalleyError, Result};

/// Append the variable-length encoding of `value` to `out`.
pub fn encode_u64(value: u64, out: &mut Vec<u8>) {
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        out.push(byte);

        if val == 0 {
            break;
        }
    }
}

/// Encode a u64 value into a fresh buffer.
pub fn encoded_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    encode_u64(value, &mut bytes);
    bytes
}

/// Decode a u64 value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(GalleyError::corrupt("varint overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(GalleyError::corrupt("incomplete varint"))
}

/// Map a signed value onto the unsigned range (0, -1, 1, -2, ...).
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_u64() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u64::MAX];

        for &value in &test_values {
            let encoded = encoded_u64(value);
            let (decoded, bytes_read) = decode_u64(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
        }
    }

    #[test]
    fn test_small_values_use_one_byte() {
        assert_eq!(encoded_u64(0), vec![0]);
        assert_eq!(encoded_u64(127), vec![127]);
        assert_eq!(encoded_u64(128).len(), 2);
    }

    #[test]
    fn test_incomplete_varint_is_corrupt() {
        let result = decode_u64(&[0x80, 0x80]);
        assert!(matches!(result, Err(GalleyError::CorruptState(_))));
    }

    #[test]
    fn test_zigzag() {
        for value in [0i64, -1, 1, -2, 2, i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }
}
