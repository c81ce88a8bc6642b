/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Primitive field decoders.  Each one consumes a field from the front of a slice and returns the
remaining bytes.
 */

use crate::error::{DimqError, DimqResult};

use log::*;

/// Outcome of decoding a variable length integer from the front of a byte slice
#[derive(Eq, PartialEq, Debug)]
pub enum DecodeVarintResult {

    /// More bytes are needed before the integer can be decoded
    Incomplete,

    /// A complete integer was decoded from the first `consumed` bytes
    Value {
        value: u32,
        consumed: usize,
    }
}

/// Decodes an MQTT variable length integer (1 to 4 bytes, base-128, least significant group first).
///
/// Fails with `MalformedPacket` when the fourth byte still has its continuation bit set.
pub fn decode_varint(buffer: &[u8]) -> DimqResult<DecodeVarintResult> {
    let mut value: u32 = 0;
    let mut shift: u32 = 0;

    for i in 0..4 {
        if i >= buffer.len() {
            return Ok(DecodeVarintResult::Incomplete);
        }

        let byte = buffer[i];
        value |= ((byte & 0x7F) as u32) << shift;
        shift += 7;

        if (byte & 0x80) == 0 {
            return Ok(DecodeVarintResult::Value { value, consumed: i + 1 });
        }
    }

    error!("Packet Decode - invalid variable length integer");
    Err(DimqError::new_malformed_packet("variable length integer requires more than four bytes"))
}

pub(crate) fn decode_vli_into_mutable<'a>(buffer: &'a[u8], value: &mut usize) -> DimqResult<&'a[u8]> {
    match decode_varint(buffer)? {
        DecodeVarintResult::Incomplete => {
            error!("Packet Decode - truncated variable length integer");
            Err(DimqError::new_malformed_packet("truncated variable length integer"))
        }
        DecodeVarintResult::Value { value: vli, consumed } => {
            *value = vli as usize;
            Ok(&buffer[consumed..])
        }
    }
}

fn split_length_prefixed_bytes<'a>(bytes: &'a[u8], field_type: &str) -> DimqResult<(&'a[u8], &'a[u8])> {
    if bytes.len() < 2 {
        error!("Packet Decode - {} value does not have a full length prefix", field_type);
        return Err(DimqError::new_malformed_packet("length prefix truncated"));
    }

    let value_length = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let mutable_bytes = &bytes[2..];
    if value_length > mutable_bytes.len() {
        error!("Packet Decode - {} value has length larger than remaining packet bytes", field_type);
        return Err(DimqError::new_malformed_packet("length prefixed value exceeds remaining bytes"));
    }

    Ok((&mutable_bytes[..value_length], &mutable_bytes[value_length..]))
}

pub(crate) fn decode_length_prefixed_string<'a>(bytes: &'a[u8], value: &mut String) -> DimqResult<&'a[u8]> {
    let (string_bytes, remaining) = split_length_prefixed_bytes(bytes, "Utf-8 string")?;

    let decoded = std::str::from_utf8(string_bytes).map_err(|err| {
        error!("Packet Decode - invalid utf-8");
        DimqError::from(err)
    })?;

    if decoded.contains('\u{0000}') {
        error!("Packet Decode - Utf-8 string contains a null character");
        return Err(DimqError::new_malformed_packet("utf-8 string contains U+0000"));
    }

    *value = decoded.to_string();
    Ok(remaining)
}

pub(crate) fn decode_length_prefixed_bytes<'a>(bytes: &'a[u8], value: &mut Vec<u8>) -> DimqResult<&'a[u8]> {
    let (data, remaining) = split_length_prefixed_bytes(bytes, "Binary data")?;

    *value = data.to_vec();
    Ok(remaining)
}

pub(crate) fn decode_u8<'a>(bytes: &'a[u8], value: &mut u8) -> DimqResult<&'a[u8]> {
    if bytes.is_empty() {
        error!("Packet Decode - Insufficent packet bytes for u8 field");
        return Err(DimqError::new_malformed_packet("insufficient bytes for u8"));
    }

    *value = bytes[0];

    Ok(&bytes[1..])
}

pub(crate) fn decode_u8_as_enum<'a, T>(bytes: &'a[u8], value: &mut T, converter: fn(u8) -> DimqResult<T>) -> DimqResult<&'a[u8]> {
    if bytes.is_empty() {
        error!("Packet Decode - Insufficent packet bytes for enum field");
        return Err(DimqError::new_malformed_packet("insufficient bytes for enum"));
    }

    *value = converter(bytes[0])?;

    Ok(&bytes[1..])
}

pub(crate) fn decode_u16<'a>(bytes: &'a[u8], value: &mut u16) -> DimqResult<&'a[u8]> {
    if bytes.len() < 2 {
        error!("Packet Decode - Insufficent packet bytes for u16 field");
        return Err(DimqError::new_malformed_packet("insufficient bytes for u16"));
    }

    *value = u16::from_be_bytes([bytes[0], bytes[1]]);

    Ok(&bytes[2..])
}

pub(crate) fn decode_u32<'a>(bytes: &'a[u8], value: &mut u32) -> DimqResult<&'a[u8]> {
    if bytes.len() < 4 {
        error!("Packet Decode - Insufficent packet bytes for u32 field");
        return Err(DimqError::new_malformed_packet("insufficient bytes for u32"));
    }

    *value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    Ok(&bytes[4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn decode_varint_incomplete() {
        assert_eq!(DecodeVarintResult::Incomplete, decode_varint(&[]).unwrap());
        assert_eq!(DecodeVarintResult::Incomplete, decode_varint(&[0x80]).unwrap());
        assert_eq!(DecodeVarintResult::Incomplete, decode_varint(&[0xFF, 0xFF, 0xFF]).unwrap());
    }

    #[test]
    fn decode_varint_values() {
        assert_eq!(DecodeVarintResult::Value{ value: 0, consumed: 1 }, decode_varint(&[0x00, 0x55]).unwrap());
        assert_eq!(DecodeVarintResult::Value{ value: 321, consumed: 2 }, decode_varint(&[0xC1, 0x02]).unwrap());
        assert_eq!(DecodeVarintResult::Value{ value: 268_435_455, consumed: 4 }, decode_varint(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap());
    }

    #[test]
    fn decode_varint_fifth_byte_is_malformed() {
        assert_matches!(decode_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]), Err(DimqError::MalformedPacket(_)));
    }

    #[test]
    fn decode_string_rejects_null_and_bad_utf8() {
        let mut value = String::new();
        assert_matches!(decode_length_prefixed_string(&[0, 3, b'a', 0, b'b'], &mut value), Err(DimqError::MalformedPacket(_)));
        assert_matches!(decode_length_prefixed_string(&[0, 2, 0xC3, 0x28], &mut value), Err(DimqError::MalformedPacket(_)));
        assert_matches!(decode_length_prefixed_string(&[0, 4, b'a'], &mut value), Err(DimqError::MalformedPacket(_)));

        let remaining = decode_length_prefixed_string(&[0, 2, b'h', b'i', 7], &mut value).unwrap();
        assert_eq!("hi", value);
        assert_eq!(&[7u8], remaining);
    }

    #[test]
    fn decode_integers_are_big_endian() {
        let mut short = 0u16;
        let mut long = 0u32;
        let remaining = decode_u16(&[0x01, 0x02, 0x00, 0x00, 0x01, 0x00], &mut short).unwrap();
        assert_eq!(0x0102, short);
        decode_u32(remaining, &mut long).unwrap();
        assert_eq!(256, long);
        assert_matches!(decode_u32(&[1, 2, 3], &mut long), Err(DimqError::MalformedPacket(_)));
    }
}
