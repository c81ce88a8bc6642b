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

const MQTT3_SUBACK_FAILURE_RETURN_CODE : u8 = 0x80;

#[rustfmt::skip]
pub(crate) fn compute_suback_packet_length_properties(packet: &SubackPacket, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    let mut total_remaining_length : usize = 2 + packet.reason_codes.len();

    let mut suback_property_section_length = 0;
    if version.is_v5() {
        suback_property_section_length = get_remaining_length(&packet.properties);
        total_remaining_length += compute_variable_length_integer_encode_size(suback_property_section_length)?;
        total_remaining_length += suback_property_section_length;
    }

    Ok((total_remaining_length, suback_property_section_length))
}

// MQTT 3.x only knows granted qos values and a single failure code
fn suback_reason_code_to_v3_return_code(reason_code: SubackReasonCode) -> u8 {
    match reason_code {
        SubackReasonCode::GrantedQos0 | SubackReasonCode::GrantedQos1 | SubackReasonCode::GrantedQos2 => {
            reason_code as u8
        }
        _ => { MQTT3_SUBACK_FAILURE_RETURN_CODE }
    }
}

fn convert_v3_return_code_to_suback_reason_code(value: u8) -> DimqResult<SubackReasonCode> {
    match value {
        0 => { Ok(SubackReasonCode::GrantedQos0) }
        1 => { Ok(SubackReasonCode::GrantedQos1) }
        2 => { Ok(SubackReasonCode::GrantedQos2) }
        MQTT3_SUBACK_FAILURE_RETURN_CODE => { Ok(SubackReasonCode::UnspecifiedError) }
        _ => {
            error!("SubackPacket Decode - invalid mqtt3 return code ({})", value);
            Err(DimqError::new_malformed_packet("invalid mqtt3 suback return code"))
        }
    }
}

pub(crate) fn write_suback_packet(packet: &SubackPacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    if packet.packet_id == 0 {
        error!("SubackPacket Encode - packet id must be non-zero");
        return Err(DimqError::new_packet_validation(PacketType::Suback, "packet id is zero"));
    }

    if version.is_v5() {
        validate_properties(PropertyContext::Suback, &packet.properties)?;
    }

    let (total_remaining_length, suback_property_length) = compute_suback_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, SUBACK_FIRST_BYTE, total_remaining_length)?;
    encode_u16(dest, packet.packet_id);

    if version.is_v5() {
        write_properties_with_length(&packet.properties, suback_property_length, dest)?;
        for reason_code in &packet.reason_codes {
            encode_u8(dest, *reason_code as u8);
        }
    } else {
        for reason_code in &packet.reason_codes {
            encode_u8(dest, suback_reason_code_to_v3_return_code(*reason_code));
        }
    }

    Ok(())
}

pub(crate) fn decode_suback_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    if first_byte != SUBACK_FIRST_BYTE {
        error!("SubackPacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for suback packet"));
    }

    let mut packet = SubackPacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;

    if version.is_v5() {
        let (properties, remaining_bytes) = read_properties(PropertyContext::Suback, mutable_body)?;
        packet.properties = properties;
        mutable_body = remaining_bytes;
    }

    let converter = if version.is_v5() { convert_u8_to_suback_reason_code } else { convert_v3_return_code_to_suback_reason_code };
    packet.reason_codes.reserve(mutable_body.len());
    for byte in mutable_body {
        packet.reason_codes.push(converter(*byte)?);
    }

    if packet.reason_codes.is_empty() {
        error!("SubackPacket Decode - suback carries no reason codes");
        return Err(DimqError::new_protocol_error("suback with no reason codes"));
    }

    Ok(ControlPacket::Suback(packet))
}

impl fmt::Display for SubackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubackPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " reason_codes: [")?;
        for (i, reason_code) in self.reason_codes.iter().enumerate() {
            write!(f, " {}:{}", i, reason_code)?;
        }
        write!(f, " ]")?;
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn suback_round_trip_encode_decode_mqtt311() {
        let packet = SubackPacket {
            packet_id: 1023,
            reason_codes: vec!(
                SubackReasonCode::GrantedQos2,
                SubackReasonCode::UnspecifiedError,
                SubackReasonCode::GrantedQos0,
            ),
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&ControlPacket::Suback(packet), ProtocolVersion::Mqtt311));
    }

    #[test]
    fn suback_mqtt311_collapses_failure_codes() {
        let packet = SubackPacket {
            packet_id: 1,
            reason_codes: vec!(SubackReasonCode::NotAuthorized, SubackReasonCode::GrantedQos1),
            ..Default::default()
        };

        let encoded = encode_packet_for_test(&ControlPacket::Suback(packet), ProtocolVersion::Mqtt311);
        assert_eq!(vec!(0x90u8, 4, 0, 1, 0x80, 1), encoded);
    }

    fn create_suback_with_all_fields() -> SubackPacket {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::ReasonString, PropertyValue::String("partial".to_string())).unwrap();
        properties.add_user_property("suback", "value");

        SubackPacket {
            packet_id: 1023,
            reason_codes: vec!(
                SubackReasonCode::GrantedQos2,
                SubackReasonCode::NotAuthorized,
                SubackReasonCode::TopicFilterInvalid,
                SubackReasonCode::SharedSubscriptionsNotSupported,
                SubackReasonCode::GrantedQos1,
            ),
            properties,
        }
    }

    #[test]
    fn suback_round_trip_encode_decode_all_fields() {
        let packet = create_suback_with_all_fields();
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Suback(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn suback_decode_failure_bad_fixed_header() {
        let packet = create_suback_with_all_fields();
        do_fixed_header_flag_decode_failure_test(&ControlPacket::Suback(packet), ProtocolVersion::Mqtt5, 5);
    }

    #[test]
    fn suback_decode_failure_bad_reason_code() {
        let packet = create_suback_with_all_fields();

        let corrupt_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            let last = clone.len() - 1;
            clone[last] = 3;
            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Suback(packet), ProtocolVersion::Mqtt5, corrupt_reason_code);
    }

    #[test]
    fn suback_decode_failure_mqtt311_v5_reason_code() {
        let packet = SubackPacket {
            packet_id: 5,
            reason_codes: vec!(SubackReasonCode::GrantedQos1),
            ..Default::default()
        };

        let use_v5_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[4] = SubackReasonCode::NotAuthorized as u8;
            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Suback(packet), ProtocolVersion::Mqtt311, use_v5_code);
    }

    #[test]
    fn suback_decode_failure_packet_size() {
        let packet = create_suback_with_all_fields();
        do_inbound_size_decode_failure_test(&ControlPacket::Suback(packet), ProtocolVersion::Mqtt5);
    }
}
