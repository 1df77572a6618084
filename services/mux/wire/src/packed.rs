//! Packed (zig-zag LEB128) integers.
//!
//! Signed values are zig-zag mapped so that small negative dialog IDs stay
//! short, then written seven bits at a time, least significant group first.

use crate::error::WireError;

/// Longest encoding of a 64-bit value
pub const MAX_PACKED_LEN: usize = 10;

/// Encode `value` into `out`, returning the number of bytes used
pub fn encode_packed(value: i64, out: &mut [u8; MAX_PACKED_LEN]) -> usize {
    let mut v = ((value << 1) ^ (value >> 63)) as u64;
    let mut i = 0;
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out[i] = byte;
            return i + 1;
        }
        out[i] = byte | 0x80;
        i += 1;
    }
}

/// Number of bytes `value` occupies when packed
pub fn packed_len(value: i64) -> usize {
    let mut scratch = [0u8; MAX_PACKED_LEN];
    encode_packed(value, &mut scratch)
}

/// Decode a packed integer from the front of `src`.
///
/// Returns `Ok(None)` when `src` ends before the last byte of the integer.
pub fn decode_packed(src: &[u8]) -> Result<Option<(i64, usize)>, WireError> {
    let mut raw: u64 = 0;
    for (i, &byte) in src.iter().enumerate() {
        if i == MAX_PACKED_LEN - 1 && byte > 0x01 {
            return Err(WireError::malformed("packed integer overflows 64 bits"));
        }
        raw |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            let value = ((raw >> 1) as i64) ^ -((raw & 1) as i64);
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}
