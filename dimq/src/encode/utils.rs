/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Primitive field encoders.  Everything appends to a destination buffer; multi-byte integers are
big-endian.
 */

use crate::error::{DimqError, DimqResult};

/// Largest value representable as an MQTT variable length integer
pub const MAXIMUM_VARIABLE_LENGTH_INTEGER: usize = (1 << 28) - 1;

/// Number of bytes needed to encode `value` as a variable length integer
pub fn compute_variable_length_integer_encode_size(value: usize) -> DimqResult<usize> {
    if value < 1usize << 7 {
        Ok(1)
    } else if value < 1usize << 14 {
        Ok(2)
    } else if value < 1usize << 21 {
        Ok(3)
    } else if value < 1usize << 28 {
        Ok(4)
    } else {
        Err(DimqError::new_payload_too_large("value exceeds variable length integer maximum"))
    }
}

/// Appends `value` to `dest` as an MQTT variable length integer, returning the number of bytes
/// written.  Values above 268,435,455 fail with `PayloadTooLarge`.
pub fn encode_varint(value: u32, dest: &mut Vec<u8>) -> DimqResult<usize> {
    if value as usize > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        return Err(DimqError::new_payload_too_large("value exceeds variable length integer maximum"));
    }

    let mut written = 0;
    let mut val = value;
    loop {
        let mut byte: u8 = (val & 0x7F) as u8;
        val /= 128;

        if val != 0 {
            byte |= 128;
        }

        dest.push(byte);
        written += 1;

        if val == 0 {
            return Ok(written);
        }
    }
}

pub(crate) fn encode_vli(value: usize, dest: &mut Vec<u8>) -> DimqResult<()> {
    if value > MAXIMUM_VARIABLE_LENGTH_INTEGER {
        return Err(DimqError::new_payload_too_large("value exceeds variable length integer maximum"));
    }

    encode_varint(value as u32, dest)?;
    Ok(())
}

pub(crate) fn encode_u8(dest: &mut Vec<u8>, value: u8) {
    dest.push(value);
}

pub(crate) fn encode_u16(dest: &mut Vec<u8>, value: u16) {
    dest.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn encode_u32(dest: &mut Vec<u8>, value: u32) {
    dest.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn encode_length_prefixed_bytes(dest: &mut Vec<u8>, value: &[u8]) -> DimqResult<()> {
    if value.len() > u16::MAX as usize {
        return Err(DimqError::new_payload_too_large("length prefixed field exceeds 65535 bytes"));
    }

    encode_u16(dest, value.len() as u16);
    dest.extend_from_slice(value);
    Ok(())
}

pub(crate) fn encode_length_prefixed_string(dest: &mut Vec<u8>, value: &str) -> DimqResult<()> {
    encode_length_prefixed_bytes(dest, value.as_bytes())
}

pub(crate) fn encode_fixed_header(dest: &mut Vec<u8>, first_byte: u8, remaining_length: usize) -> DimqResult<()> {
    encode_u8(dest, first_byte);
    encode_vli(remaining_length, dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::utils::*;
    use assert_matches::assert_matches;

    macro_rules! assert_vli_encoding_equals {
        ($value: expr, $expected_result: expr) => {{
            let mut dest = Vec::<u8>::with_capacity(4);
            assert_eq!($expected_result.len(), encode_varint($value, &mut dest).unwrap());
            assert_eq!($expected_result, &dest[..]);
        }};
    }

    fn do_varint_round_trip(value: u32) {
        let mut dest = Vec::<u8>::with_capacity(4);
        let written = encode_varint(value, &mut dest).unwrap();

        for i in 0..dest.len() {
            assert_eq!(DecodeVarintResult::Incomplete, decode_varint(&dest[..i]).unwrap());
        }

        assert_eq!(compute_variable_length_integer_encode_size(value as usize).unwrap(), written);
        assert_eq!(DecodeVarintResult::Value { value, consumed: written }, decode_varint(&dest).unwrap());
    }

    #[test]
    fn varint_round_trips_at_encoding_boundaries() {
        for value in [0u32, 1, 127, 128, 16_383, 16_384, 2_097_151, 2_097_152, 100_000, 34_200_000, MAXIMUM_VARIABLE_LENGTH_INTEGER as u32] {
            do_varint_round_trip(value);
        }
    }

    #[test]
    fn encode_varint_successes() {
        assert_vli_encoding_equals!(0, [0u8]);
        assert_vli_encoding_equals!(127, [127u8]);
        assert_vli_encoding_equals!(128, [0x80u8, 1u8]);
        assert_vli_encoding_equals!(321, [0xC1u8, 0x02u8]);
        assert_vli_encoding_equals!(MAXIMUM_VARIABLE_LENGTH_INTEGER as u32, [0xFFu8, 0xFFu8, 0xFFu8, 0x7Fu8]);
    }

    #[test]
    fn encode_varint_above_maximum_fails() {
        let mut dest = Vec::new();
        assert_matches!(encode_varint(MAXIMUM_VARIABLE_LENGTH_INTEGER as u32 + 1, &mut dest), Err(DimqError::PayloadTooLarge(_)));
        assert_matches!(encode_varint(u32::MAX, &mut dest), Err(DimqError::PayloadTooLarge(_)));
        assert!(dest.is_empty());
    }

    #[test]
    fn compute_vli_encoding_size() {
        assert_eq!(1, compute_variable_length_integer_encode_size(127).unwrap());
        assert_eq!(2, compute_variable_length_integer_encode_size(128).unwrap());
        assert_eq!(3, compute_variable_length_integer_encode_size(16384).unwrap());
        assert_eq!(4, compute_variable_length_integer_encode_size(2097152).unwrap());
        assert_matches!(compute_variable_length_integer_encode_size(MAXIMUM_VARIABLE_LENGTH_INTEGER + 1), Err(DimqError::PayloadTooLarge(_)));
    }

    #[test]
    fn length_prefixed_fields() {
        let mut dest = Vec::new();
        encode_length_prefixed_string(&mut dest, "MQTT").unwrap();
        assert_eq!(&[0u8, 4, b'M', b'Q', b'T', b'T'], &dest[..]);

        let oversized = vec![0u8; 65536];
        assert_matches!(encode_length_prefixed_bytes(&mut dest, &oversized), Err(DimqError::PayloadTooLarge(_)));
    }
}
