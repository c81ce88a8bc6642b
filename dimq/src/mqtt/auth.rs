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
pub(crate) fn compute_auth_packet_length_properties(packet: &AuthPacket, _: ProtocolVersion) -> DimqResult<(usize, usize)> {
    let auth_property_section_length = get_remaining_length(&packet.properties);
    if auth_property_section_length == 0 && packet.reason_code == AuthenticateReasonCode::Success {
        return Ok((0, 0));
    }

    let mut total_remaining_length : usize = 1 + compute_variable_length_integer_encode_size(auth_property_section_length)?;
    total_remaining_length += auth_property_section_length;

    Ok((total_remaining_length, auth_property_section_length))
}

pub(crate) fn write_auth_packet(packet: &AuthPacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    if !version.is_v5() {
        error!("AuthPacket Encode - auth packets require mqtt5");
        return Err(DimqError::new_packet_validation(PacketType::Auth, "auth packet on a pre-mqtt5 connection"));
    }

    validate_properties(PropertyContext::Auth, &packet.properties)?;

    let (total_remaining_length, auth_property_length) = compute_auth_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, AUTH_FIRST_BYTE, total_remaining_length)?;

    if total_remaining_length > 0 {
        encode_u8(dest, packet.reason_code as u8);
        write_properties_with_length(&packet.properties, auth_property_length, dest)?;
    }

    Ok(())
}

pub(crate) fn decode_auth_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    if !version.is_v5() {
        error!("AuthPacket Decode - auth packets require mqtt5");
        return Err(DimqError::new_protocol_error("auth packet on a pre-mqtt5 connection"));
    }

    if first_byte != AUTH_FIRST_BYTE {
        error!("AuthPacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for auth packet"));
    }

    let mut packet = AuthPacket { ..Default::default() };
    if packet_body.is_empty() {
        return Ok(ControlPacket::Auth(packet));
    }

    let mut mutable_body = packet_body;
    mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, convert_u8_to_authenticate_reason_code)?;

    if mutable_body.is_empty() {
        return Ok(ControlPacket::Auth(packet));
    }

    let (properties, remaining_bytes) = read_properties(PropertyContext::Auth, mutable_body)?;
    packet.properties = properties;

    if !remaining_bytes.is_empty() {
        error!("AuthPacket Decode - body length does not match expected overall packet length");
        return Err(DimqError::new_malformed_packet("auth packet length mismatch"));
    }

    Ok(ControlPacket::Auth(packet))
}

impl fmt::Display for AuthPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AuthPacket {{")?;
        log_enum!(self.reason_code, f, "reason_code");
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;
    use crate::encode::encode_packet;

    use assert_matches::assert_matches;

    #[test]
    fn auth_round_trip_encode_decode_default() {
        let packet = AuthPacket {
            ..Default::default()
        };

        let encoded = encode_packet_for_test(&ControlPacket::Auth(packet.clone()), ProtocolVersion::Mqtt5);
        assert_eq!(vec!(0xF0u8, 0), encoded);

        assert!(do_round_trip_encode_decode_test(&ControlPacket::Auth(packet), ProtocolVersion::Mqtt5));
    }

    fn create_auth_with_all_properties() -> AuthPacket {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::AuthenticationMethod, PropertyValue::String("SCRAM-SHA-256".to_string())).unwrap();
        properties.add(PropertyIdentifier::AuthenticationData, PropertyValue::Binary(vec!(1, 2, 3, 4, 5, 6))).unwrap();
        properties.add(PropertyIdentifier::ReasonString, PropertyValue::String("continue".to_string())).unwrap();
        properties.add_user_property("auth", "step-2");

        AuthPacket {
            reason_code: AuthenticateReasonCode::ContinueAuthentication,
            properties,
        }
    }

    #[test]
    fn auth_round_trip_encode_decode_all_properties() {
        let packet = create_auth_with_all_properties();
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Auth(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn auth_decode_failure_bad_fixed_header() {
        let packet = create_auth_with_all_properties();
        do_fixed_header_flag_decode_failure_test(&ControlPacket::Auth(packet), ProtocolVersion::Mqtt5, 8);
    }

    #[test]
    fn auth_decode_failure_bad_reason_code() {
        let packet = create_auth_with_all_properties();

        let corrupt_reason_code = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[2] = 26;
            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Auth(packet), ProtocolVersion::Mqtt5, corrupt_reason_code);
    }

    #[test]
    fn auth_decode_failure_duplicate_authentication_method() {
        let packet = create_auth_with_all_properties();

        let duplicate_method = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();
            clone[1] += 4;
            clone[3] += 4;
            clone.push(PropertyIdentifier::AuthenticationMethod as u8);
            clone.push(0);
            clone.push(1);
            clone.push(b'A');
            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Auth(packet), ProtocolVersion::Mqtt5, duplicate_method);
    }

    #[test]
    fn auth_encode_failure_mqtt311() {
        let packet = ControlPacket::Auth(create_auth_with_all_properties());
        let mut dest = Vec::new();

        assert_matches!(encode_packet(&packet, ProtocolVersion::Mqtt311, &mut dest), Err(DimqError::PacketValidation(_)));
    }

    #[test]
    fn auth_decode_failure_packet_size() {
        let packet = create_auth_with_all_properties();
        do_inbound_size_decode_failure_test(&ControlPacket::Auth(packet), ProtocolVersion::Mqtt5);
    }
}
