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

const CONNACK_SESSION_PRESENT_FLAG : u8 = 0x01;

#[rustfmt::skip]
pub(crate) fn compute_connack_packet_length_properties(packet: &ConnackPacket, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    if !version.is_v5() {
        return Ok((2, 0));
    }

    let connack_property_section_length = get_remaining_length(&packet.properties);
    let mut total_remaining_length : usize = 2 + compute_variable_length_integer_encode_size(connack_property_section_length)?;
    total_remaining_length += connack_property_section_length;

    Ok((total_remaining_length, connack_property_section_length))
}

pub(crate) fn write_connack_packet(packet: &ConnackPacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    if packet.session_present && !packet.reason_code.is_success() {
        error!("ConnackPacket Encode - session present may only be set on a successful connack");
        return Err(DimqError::new_packet_validation(PacketType::Connack, "session present set on failed connack"));
    }

    if version.is_v5() {
        validate_properties(PropertyContext::Connack, &packet.properties)?;
    }

    let (total_remaining_length, connack_property_length) = compute_connack_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, CONNACK_FIRST_BYTE, total_remaining_length)?;
    encode_u8(dest, if packet.session_present { CONNACK_SESSION_PRESENT_FLAG } else { 0 });

    if version.is_v5() {
        encode_u8(dest, packet.reason_code as u8);
        write_properties_with_length(&packet.properties, connack_property_length, dest)?;
    } else {
        encode_u8(dest, packet.reason_code.to_v3_return_code());
    }

    Ok(())
}

pub(crate) fn decode_connack_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    if first_byte != CONNACK_FIRST_BYTE {
        error!("ConnackPacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for connack packet"));
    }

    let mut packet = ConnackPacket { ..Default::default() };

    let mut mutable_body = packet_body;
    let mut flags : u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut flags)?;

    if (flags & !CONNACK_SESSION_PRESENT_FLAG) != 0 {
        error!("ConnackPacket Decode - reserved acknowledge flags set");
        return Err(DimqError::new_malformed_packet("reserved connack flags set"));
    }

    packet.session_present = (flags & CONNACK_SESSION_PRESENT_FLAG) != 0;

    if version.is_v5() {
        mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, convert_u8_to_connect_reason_code)?;

        let (properties, remaining_bytes) = read_properties(PropertyContext::Connack, mutable_body)?;
        packet.properties = properties;
        mutable_body = remaining_bytes;
    } else {
        let mut return_code : u8 = 0;
        mutable_body = decode_u8(mutable_body, &mut return_code)?;
        packet.reason_code = ConnectReasonCode::from_v3_return_code(return_code)?;
    }

    if !mutable_body.is_empty() {
        error!("ConnackPacket Decode - body length does not match expected overall packet length");
        return Err(DimqError::new_malformed_packet("connack packet length mismatch"));
    }

    if packet.session_present && !packet.reason_code.is_success() {
        error!("ConnackPacket Decode - session present set on a failed connack");
        return Err(DimqError::new_protocol_error("session present set on failed connack"));
    }

    Ok(ControlPacket::Connack(packet))
}

impl fmt::Display for ConnackPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnackPacket {{")?;
        log_primitive_value!(self.session_present, f, "session_present");
        log_enum!(self.reason_code, f, "reason_code");
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}
