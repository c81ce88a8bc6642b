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

fn compute_will_length_properties(will: &WillMessage, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    let mut will_length = 2 + will.topic.len() + 2 + will.payload.len();

    let mut will_property_section_length = 0;
    if version.is_v5() {
        will_property_section_length = get_remaining_length(&will.properties);
        will_length += will_property_section_length;
        will_length += compute_variable_length_integer_encode_size(will_property_section_length)?;
    }

    Ok((will_length, will_property_section_length))
}

#[rustfmt::skip]
pub(crate) fn compute_connect_packet_length_properties(packet: &ConnectPacket) -> DimqResult<(usize, usize)> {
    let version = packet.protocol_version;

    /*
     * Variable Header
     *  - Protocol Name (length-prefixed)
     *  - Protocol Level
     *  - Connect Flags
     *  - Keep Alive
     *  - Property Length as VLI (mqtt5)
     *  - All Properties (mqtt5)
     * Payload
     *  - Client Id
     *  - Will (properties, topic, payload)
     *  - Username
     *  - Password
     */
    let mut total_remaining_length = 2 + version.protocol_name().len() + 1 + 1 + 2;

    let mut connect_property_section_length = 0;
    if version.is_v5() {
        connect_property_section_length = get_remaining_length(&packet.properties);
        total_remaining_length += connect_property_section_length;
        total_remaining_length += compute_variable_length_integer_encode_size(connect_property_section_length)?;
    }

    total_remaining_length += 2 + packet.client_id.len();

    if let Some(will) = &packet.will {
        total_remaining_length += compute_will_length_properties(will, version)?.0;
    }

    if let Some(username) = &packet.username {
        total_remaining_length += 2 + username.len();
    }

    if let Some(password) = &packet.password {
        total_remaining_length += 2 + password.len();
    }

    Ok((total_remaining_length, connect_property_section_length))
}

fn compute_connect_flags(packet: &ConnectPacket) -> u8 {
    let mut flags: u8 = 0;
    if packet.clean_start {
        flags |= CONNECT_PACKET_CLEAN_START_FLAG_MASK;
    }

    if let Some(will) = &packet.will {
        flags |= CONNECT_PACKET_HAS_WILL_FLAG_MASK;
        flags |= (will.qos as u8) << CONNECT_PACKET_WILL_QOS_FLAG_SHIFT;
        if will.retain {
            flags |= CONNECT_PACKET_WILL_RETAIN_FLAG_MASK;
        }
    }

    if packet.password.is_some() {
        flags |= CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK;
    }

    if packet.username.is_some() {
        flags |= CONNECT_PACKET_HAS_USERNAME_FLAG_MASK;
    }

    flags
}

fn validate_connect_packet_outbound(packet: &ConnectPacket) -> DimqResult<()> {
    let version = packet.protocol_version;

    if !version.is_v5() && packet.password.is_some() && packet.username.is_none() {
        error!("ConnectPacket Encode - mqtt3 connect may not carry a password without a username");
        return Err(DimqError::new_packet_validation(PacketType::Connect, "password without username"));
    }

    if version.is_v5() {
        validate_properties(PropertyContext::Connect, &packet.properties)?;
        if let Some(will) = &packet.will {
            validate_properties(PropertyContext::Will, &will.properties)?;
        }
    }

    Ok(())
}

pub(crate) fn write_connect_packet(packet: &ConnectPacket, dest: &mut Vec<u8>) -> DimqResult<()> {
    validate_connect_packet_outbound(packet)?;

    let version = packet.protocol_version;
    let (total_remaining_length, connect_property_length) = compute_connect_packet_length_properties(packet)?;

    encode_fixed_header(dest, CONNECT_FIRST_BYTE, total_remaining_length)?;
    encode_length_prefixed_string(dest, version.protocol_name())?;
    encode_u8(dest, version as u8);
    encode_u8(dest, compute_connect_flags(packet));
    encode_u16(dest, packet.keep_alive_interval_seconds);

    if version.is_v5() {
        write_properties_with_length(&packet.properties, connect_property_length, dest)?;
    }

    encode_length_prefixed_string(dest, &packet.client_id)?;

    if let Some(will) = &packet.will {
        if version.is_v5() {
            let (_, will_property_length) = compute_will_length_properties(will, version)?;
            write_properties_with_length(&will.properties, will_property_length, dest)?;
        }

        encode_length_prefixed_string(dest, &will.topic)?;
        encode_length_prefixed_bytes(dest, &will.payload)?;
    }

    if let Some(username) = &packet.username {
        encode_length_prefixed_string(dest, username)?;
    }

    if let Some(password) = &packet.password {
        encode_length_prefixed_bytes(dest, password)?;
    }

    Ok(())
}

fn decode_protocol_version(protocol_name: &str, protocol_level: u8) -> DimqResult<ProtocolVersion> {
    let expected_name = match protocol_level {
        3 => { PROTOCOL_NAME_MQTT31 }
        4 | 5 => { PROTOCOL_NAME_MQTT }
        _ => {
            // a recognizable protocol name with an unknown level gets a connack before the close
            if protocol_name == PROTOCOL_NAME_MQTT || protocol_name == PROTOCOL_NAME_MQTT31 {
                info!("ConnectPacket Decode - unsupported protocol level {}", protocol_level);
                return Err(DimqError::new_connection_rejected(ConnectReasonCode::UnsupportedProtocolVersion));
            }

            error!("ConnectPacket Decode - unknown protocol \"{}\"", protocol_name);
            return Err(DimqError::new_protocol_error("unknown protocol name"));
        }
    };

    if protocol_name != expected_name {
        error!("ConnectPacket Decode - protocol name \"{}\" does not match level {}", protocol_name, protocol_level);
        return Err(DimqError::new_protocol_error("protocol name does not match protocol level"));
    }

    convert_u8_to_protocol_version(protocol_level)
}

pub(crate) fn decode_connect_packet(first_byte: u8, packet_body: &[u8]) -> DimqResult<ControlPacket> {
    if first_byte != CONNECT_FIRST_BYTE {
        error!("ConnectPacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for connect packet"));
    }

    let mut packet = ConnectPacket { ..Default::default() };

    let mut mutable_body = packet_body;
    let mut protocol_name = String::new();
    mutable_body = decode_length_prefixed_string(mutable_body, &mut protocol_name)?;

    let mut protocol_level : u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut protocol_level)?;

    let version = decode_protocol_version(&protocol_name, protocol_level)?;
    packet.protocol_version = version;

    let mut connect_flags : u8 = 0;
    mutable_body = decode_u8(mutable_body, &mut connect_flags)?;

    if (connect_flags & CONNECT_PACKET_RESERVED_FLAG_MASK) != 0 {
        error!("ConnectPacket Decode - reserved connect flag set");
        return Err(DimqError::new_malformed_packet("reserved connect flag set"));
    }

    packet.clean_start = (connect_flags & CONNECT_PACKET_CLEAN_START_FLAG_MASK) != 0;
    let has_will = (connect_flags & CONNECT_PACKET_HAS_WILL_FLAG_MASK) != 0;
    let will_retain = (connect_flags & CONNECT_PACKET_WILL_RETAIN_FLAG_MASK) != 0;
    let will_qos_bits = (connect_flags >> CONNECT_PACKET_WILL_QOS_FLAG_SHIFT) & QOS_MASK;
    let has_username = (connect_flags & CONNECT_PACKET_HAS_USERNAME_FLAG_MASK) != 0;
    let has_password = (connect_flags & CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK) != 0;

    if !has_will && (will_retain || will_qos_bits != 0) {
        error!("ConnectPacket Decode - will flags set without a will");
        return Err(DimqError::new_protocol_error("will qos or retain set without a will"));
    }

    if !version.is_v5() && has_password && !has_username {
        error!("ConnectPacket Decode - password flag set without username flag");
        return Err(DimqError::new_protocol_error("password without username"));
    }

    mutable_body = decode_u16(mutable_body, &mut packet.keep_alive_interval_seconds)?;

    if version.is_v5() {
        let (properties, remaining_bytes) = read_properties(PropertyContext::Connect, mutable_body)?;
        packet.properties = properties;
        mutable_body = remaining_bytes;
    }

    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.client_id)?;

    if has_will {
        let mut will = WillMessage {
            qos: convert_u8_to_quality_of_service(will_qos_bits)?,
            retain: will_retain,
            ..Default::default()
        };

        if version.is_v5() {
            let (properties, remaining_bytes) = read_properties(PropertyContext::Will, mutable_body)?;
            will.properties = properties;
            mutable_body = remaining_bytes;
        }

        mutable_body = decode_length_prefixed_string(mutable_body, &mut will.topic)?;
        mutable_body = decode_length_prefixed_bytes(mutable_body, &mut will.payload)?;

        packet.will = Some(will);
    }

    if has_username {
        let mut username = String::new();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut username)?;
        packet.username = Some(username);
    }

    if has_password {
        let mut password = Vec::new();
        mutable_body = decode_length_prefixed_bytes(mutable_body, &mut password)?;
        packet.password = Some(password);
    }

    if !mutable_body.is_empty() {
        error!("ConnectPacket Decode - body length does not match expected overall packet length");
        return Err(DimqError::new_malformed_packet("connect packet length mismatch"));
    }

    Ok(ControlPacket::Connect(packet))
}

impl fmt::Display for WillMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        log_string!(self.topic, f, "topic");
        log_enum!(self.qos, f, "qos");
        log_primitive_value!(self.retain, f, "retain");
        log_binary_data!(self.payload, f, "payload");
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

impl fmt::Display for ConnectPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectPacket {{")?;
        log_enum!(self.protocol_version, f, "protocol_version");
        log_primitive_value!(self.clean_start, f, "clean_start");
        log_primitive_value!(self.keep_alive_interval_seconds, f, "keep_alive_interval_seconds");
        log_string!(self.client_id, f, "client_id");
        log_optional_string!(self.username, f, "username", value);
        log_optional_sensitive!(self.password, f, "password");
        if let Some(will) = &self.will {
            write!(f, " will:{}", will)?;
        }
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

impl ConnectPacket {

    /// Session expiry interval requested by the client; absent means the session ends with the connection
    pub fn session_expiry_interval_seconds(&self) -> u32 {
        self.properties.get_u32(PropertyIdentifier::SessionExpiryInterval).unwrap_or(0)
    }

    /// Maximum number of unacknowledged QoS 1+ publishes the client is willing to receive
    pub fn receive_maximum(&self) -> u16 {
        self.properties.get_u16(PropertyIdentifier::ReceiveMaximum).unwrap_or(u16::MAX)
    }

    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.properties.get_u32(PropertyIdentifier::MaximumPacketSize)
    }

    pub fn topic_alias_maximum(&self) -> u16 {
        self.properties.get_u16(PropertyIdentifier::TopicAliasMaximum).unwrap_or(0)
    }

    pub fn authentication_method(&self) -> Option<&str> {
        self.properties.get_string(PropertyIdentifier::AuthenticationMethod)
    }
}
