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
pub(crate) fn compute_disconnect_packet_length_properties(packet: &DisconnectPacket, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    if !version.is_v5() {
        return Ok((0, 0));
    }

    let disconnect_property_section_length = get_remaining_length(&packet.properties);
    if disconnect_property_section_length == 0 {
        if packet.reason_code == DisconnectReasonCode::NormalDisconnection {
            return Ok((0, 0));
        }

        return Ok((1, 0));
    }

    let mut total_remaining_length : usize = 1 + compute_variable_length_integer_encode_size(disconnect_property_section_length)?;
    total_remaining_length += disconnect_property_section_length;

    Ok((total_remaining_length, disconnect_property_section_length))
}

pub(crate) fn write_disconnect_packet(packet: &DisconnectPacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    if version.is_v5() {
        validate_properties(PropertyContext::Disconnect, &packet.properties)?;
    }

    let (total_remaining_length, disconnect_property_length) = compute_disconnect_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, DISCONNECT_FIRST_BYTE, total_remaining_length)?;

    if total_remaining_length > 0 {
        encode_u8(dest, packet.reason_code as u8);
    }

    if total_remaining_length > 1 {
        write_properties_with_length(&packet.properties, disconnect_property_length, dest)?;
    }

    Ok(())
}

pub(crate) fn decode_disconnect_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    if first_byte != DISCONNECT_FIRST_BYTE {
        error!("DisconnectPacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for disconnect packet"));
    }

    let mut packet = DisconnectPacket { ..Default::default() };

    if !version.is_v5() {
        if !packet_body.is_empty() {
            error!("DisconnectPacket Decode - mqtt3 disconnect with a non-empty body");
            return Err(DimqError::new_malformed_packet("mqtt3 disconnect packet with non-empty body"));
        }

        return Ok(ControlPacket::Disconnect(packet));
    }

    let mut mutable_body = packet_body;
    if !mutable_body.is_empty() {
        mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, convert_u8_to_disconnect_reason_code)?;
    }

    if !mutable_body.is_empty() {
        let (properties, remaining_bytes) = read_properties(PropertyContext::Disconnect, mutable_body)?;
        packet.properties = properties;

        if !remaining_bytes.is_empty() {
            error!("DisconnectPacket Decode - body length does not match expected overall packet length");
            return Err(DimqError::new_malformed_packet("disconnect packet length mismatch"));
        }
    }

    Ok(ControlPacket::Disconnect(packet))
}

impl fmt::Display for DisconnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DisconnectPacket {{")?;
        log_enum!(self.reason_code, f, "reason_code");
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

impl DisconnectPacket {

    pub fn new(reason_code: DisconnectReasonCode) -> Self {
        DisconnectPacket {
            reason_code,
            ..Default::default()
        }
    }
}
