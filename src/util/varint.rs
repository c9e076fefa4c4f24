//! Variable-length integer encoding utilities.
//!
//! Unsigned values use 7 bits per byte with a continuation bit. Signed values
//! are zig-zag mapped first so that small negative numbers stay short.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{Result, SegdexError};

/// Maximum encoded length of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoded_len(value));
    let mut val = value;

    loop {
        let byte = (val & 0x7F) as u8;
        val >>= 7;

        if val == 0 {
            bytes.push(byte);
            return bytes;
        }
        bytes.push(byte | 0x80);
    }
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Decode a u64 from the front of `bytes`, returning the value and the number
/// of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;

    for (i, &byte) in bytes.iter().enumerate().take(MAX_VARINT_LEN) {
        let chunk = (byte & 0x7F) as u64;
        if i == MAX_VARINT_LEN - 1 && chunk > 1 {
            return Err(SegdexError::corrupt("varint overflows u64"));
        }
        result |= chunk << (7 * i);

        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }

    if bytes.len() >= MAX_VARINT_LEN {
        Err(SegdexError::corrupt("varint longer than 10 bytes"))
    } else {
        Err(SegdexError::corrupt("incomplete varint"))
    }
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        buf[i] = reader.read_u8()?;
        if buf[i] & 0x80 == 0 {
            return decode_u64(&buf[..=i]).map(|(value, _)| value);
        }
    }
    Err(SegdexError::corrupt("varint longer than 10 bytes"))
}

/// Map a signed value onto an unsigned one (0, -1, 1, -2, ... -> 0, 1, 2, 3, ...).
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
