//! Packed integer encoding shared by the sort buffers and scratch files.
//!
//! Unsigned values use LEB128 (seven bits per byte, low group first, high
//! bit set on every byte but the last). Signed counts are zigzag mapped
//! first so the `-1` undefined marker takes a single byte.

use crate::error::{CoreError, CoreResult};

/// Longest encoding of a `u64`.
pub const MAX_PACKED_LEN: usize = 10;

/// Returns the encoded length of `value`.
#[must_use]
pub const fn packed_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Appends the packed form of `value` to `out`.
pub fn write_packed(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Appends the zigzag packed form of a signed value.
pub fn write_packed_signed(out: &mut Vec<u8>, value: i64) {
    write_packed(out, zigzag(value));
}

/// Decodes a packed value from the front of `input`.
///
/// Returns the value and the number of bytes consumed, or `None` if `input`
/// ends before the value does.
///
/// # Errors
///
/// Returns an error if the encoding is longer than any `u64` can need.
pub fn read_packed(input: &[u8]) -> CoreResult<Option<(u64, usize)>> {
    let mut value = 0u64;
    for (i, byte) in input.iter().enumerate() {
        if i >= MAX_PACKED_LEN {
            return Err(CoreError::scratch_corruption("packed integer overflows u64"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if input.len() >= MAX_PACKED_LEN {
        return Err(CoreError::scratch_corruption("packed integer overflows u64"));
    }
    Ok(None)
}

/// Maps a signed value onto the unsigned range, small magnitudes first.
#[must_use]
pub const fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag`].
#[must_use]
pub const fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_encodings() {
        let mut out = Vec::new();
        write_packed(&mut out, 0);
        write_packed(&mut out, 127);
        write_packed(&mut out, 128);
        write_packed(&mut out, 300);
        assert_eq!(out, vec![0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);
    }

    #[test]
    fn undefined_marker_is_one_byte() {
        let mut out = Vec::new();
        write_packed_signed(&mut out, -1);
        assert_eq!(out, vec![0x01]);
        assert_eq!(unzigzag(1), -1);
    }

    #[test]
    fn truncated_input_is_incomplete() {
        assert!(read_packed(&[0x80, 0x80]).unwrap().is_none());
        assert!(read_packed(&[]).unwrap().is_none());
    }

    #[test]
    fn overlong_input_is_corrupt() {
        let input = [0xffu8; 11];
        assert!(read_packed(&input).is_err());
    }

    proptest! {
        #[test]
        fn packed_length_matches_encoding(value in any::<u64>()) {
            let mut out = Vec::new();
            write_packed(&mut out, value);
            prop_assert_eq!(out.len(), packed_len(value));
            prop_assert_eq!(read_packed(&out).unwrap(), Some((value, out.len())));
        }

        #[test]
        fn zigzag_is_invertible(value in any::<i64>()) {
            prop_assert_eq!(unzigzag(zigzag(value)), value);
        }
    }
}
