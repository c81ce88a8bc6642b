/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::utils::*;
use crate::encode::utils::*;
use crate::error::{DimqError, DimqResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::property::*;
use crate::mqtt::utils::*;

use log::*;

use std::fmt;

#[rustfmt::skip]
pub(crate) fn compute_unsuback_packet_length_properties(packet: &UnsubackPacket, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    if !version.is_v5() {
        return Ok((2, 0));
    }

    let unsuback_property_section_length = get_remaining_length(&packet.properties);
    let mut total_remaining_length : usize = 2 + compute_variable_length_integer_encode_size(unsuback_property_section_length)?;
    total_remaining_length += unsuback_property_section_length;
    total_remaining_length += packet.reason_codes.len();

    Ok((total_remaining_length, unsuback_property_section_length))
}

pub(crate) fn write_unsuback_packet(packet: &UnsubackPacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    if packet.packet_id == 0 {
        error!("UnsubackPacket Encode - packet id must be non-zero");
        return Err(DimqError::new_packet_validation(PacketType::Unsuback, "packet id is zero"));
    }

    if version.is_v5() {
        validate_properties(PropertyContext::Unsuback, &packet.properties)?;
    }

    let (total_remaining_length, unsuback_property_length) = compute_unsuback_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, UNSUBACK_FIRST_BYTE, total_remaining_length)?;
    encode_u16(dest, packet.packet_id);

    if version.is_v5() {
        write_properties_with_length(&packet.properties, unsuback_property_length, dest)?;
        for reason_code in &packet.reason_codes {
            encode_u8(dest, *reason_code as u8);
        }
    }

    Ok(())
}

pub(crate) fn decode_unsuback_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    if first_byte != UNSUBACK_FIRST_BYTE {
        error!("UnsubackPacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for unsuback packet"));
    }

    let mut packet = UnsubackPacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    if !version.is_v5() {
        if !mutable_body.is_empty() {
            error!("UnsubackPacket Decode - mqtt3 unsuback longer than a packet id");
            return Err(DimqError::new_malformed_packet("unsuback packet length mismatch"));
        }

        return Ok(ControlPacket::Unsuback(packet));
    }

    let (properties, remaining_bytes) = read_properties(PropertyContext::Unsuback, mutable_body)?;
    packet.properties = properties;
    mutable_body = remaining_bytes;

    packet.reason_codes.reserve(mutable_body.len());
    for byte in mutable_body {
        packet.reason_codes.push(convert_u8_to_unsuback_reason_code(*byte)?);
    }

    if packet.reason_codes.is_empty() {
        error!("UnsubackPacket Decode - unsuback carries no reason codes");
        return Err(DimqError::new_protocol_error("unsuback with no reason codes"));
    }

    Ok(ControlPacket::Unsuback(packet))
}

impl fmt::Display for UnsubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        if !self.reason_codes.is_empty() {
            write!(f, " reason_codes: [")?;
            for (i, reason_code) in self.reason_codes.iter().enumerate() {
                write!(f, " {}:{}", i, reason_code)?;
            }
            write!(f, " ]")?;
        }
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn unsuback_round_trip_encode_decode_mqtt311() {
        let packet = UnsubackPacket {
            packet_id: 1023,
            ..Default::default()
        };

        let encoded = encode_packet_for_test(&ControlPacket::Unsuback(packet.clone()), ProtocolVersion::Mqtt311);
        assert_eq!(vec!(0xB0u8, 2, 3, 255), encoded);

        assert!(do_round_trip_encode_decode_test(&ControlPacket::Unsuback(packet), ProtocolVersion::Mqtt311));
    }

    fn create_unsuback_with_all_fields() -> UnsubackPacket {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::ReasonString, PropertyValue::String("unsubscribed".to_string())).unwrap();
        properties.add_user_property("unsuback", "value");

        UnsubackPacket {
            packet_id: 1023,
            reason_codes: vec!(
                UnsubackReasonCode::Success,
                UnsubackReasonCode::NoSubscriptionExisted,
                UnsubackReasonCode::TopicFilterInvalid,
            ),
            properties,
        }
    }

    #[test]
    fn unsuback_round_trip_encode_decode_all_fields() {
        let packet = create_unsuback_with_all_fields();
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Unsuback(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn unsuback_decode_failure_bad_fixed_header() {
        let packet = create_unsuback_with_all_fields();
        do_fixed_header_flag_decode_failure_test(&ControlPacket::Unsuback(packet), ProtocolVersion::Mqtt5, 9);
    }

    #[test]
    fn unsuback_decode_failure_bad_reason_code() {
        let packet = create_unsuback_with_all_fields();

        let corrupt_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            let last = clone.len() - 1;
            clone[last] = 255;
            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Unsuback(packet), ProtocolVersion::Mqtt5, corrupt_reason_code);
    }

    #[test]
    fn unsuback_decode_failure_mqtt311_trailing_bytes() {
        let packet = UnsubackPacket {
            packet_id: 12,
            ..Default::default()
        };

        let append_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] += 1;
            clone.push(0);
            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Unsuback(packet), ProtocolVersion::Mqtt311, append_reason_code);
    }

    #[test]
    fn unsuback_decode_failure_packet_size() {
        let packet = create_unsuback_with_all_fields();
        do_inbound_size_decode_failure_test(&ControlPacket::Unsuback(packet), ProtocolVersion::Mqtt5);
    }
}
