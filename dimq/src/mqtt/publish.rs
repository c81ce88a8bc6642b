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
pub(crate) fn compute_publish_packet_length_properties(packet: &PublishPacket, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    /*
     * Remaining Length:
     * Variable Header
     *  - Topic Name
     *  - Packet Identifier (qos1+)
     *  - Property Length as VLI (mqtt5)
     *  - All Properties (mqtt5)
     * Payload
     */
    let mut total_remaining_length = 2 + packet.topic.len();

    if packet.qos != QualityOfService::AtMostOnce {
        total_remaining_length += 2;
    }

    let mut publish_property_section_length = 0;
    if version.is_v5() {
        publish_property_section_length = get_remaining_length(&packet.properties);
        total_remaining_length += publish_property_section_length;
        total_remaining_length += compute_variable_length_integer_encode_size(publish_property_section_length)?;
    }

    total_remaining_length += packet.payload.len();

    Ok((total_remaining_length, publish_property_section_length))
}

/*
 * Fixed Header
 * byte 1:
 *  bits 4-7: MQTT Control Packet Type
 *  bit 3: DUP flag
 *  bit 1-2: QoS level
 *  bit 0: RETAIN
 * byte 2-x: Remaining Length as Variable Byte Integer (1-4 bytes)
 */
fn compute_publish_fixed_header_first_byte(packet: &PublishPacket) -> u8 {
    let mut first_byte: u8 = PACKET_TYPE_PUBLISH << 4;

    if packet.duplicate {
        first_byte |= PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG;
    }

    first_byte |= (packet.qos as u8) << 1;

    if packet.retain {
        first_byte |= PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG;
    }

    first_byte
}

fn validate_publish_packet_outbound(packet: &PublishPacket, version: ProtocolVersion) -> DimqResult<()> {
    if packet.qos == QualityOfService::AtMostOnce {
        if packet.packet_id != 0 {
            error!("PublishPacket Encode - qos 0 publish may not carry a packet id");
            return Err(DimqError::new_packet_validation(PacketType::Publish, "packet id set on qos 0 publish"));
        }

        if packet.duplicate {
            error!("PublishPacket Encode - qos 0 publish may not set the duplicate flag");
            return Err(DimqError::new_packet_validation(PacketType::Publish, "duplicate flag set on qos 0 publish"));
        }
    } else if packet.packet_id == 0 {
        error!("PublishPacket Encode - packet id must be non-zero");
        return Err(DimqError::new_packet_validation(PacketType::Publish, "packet id is zero"));
    }

    if version.is_v5() {
        validate_properties(PropertyContext::Publish, &packet.properties)?;
    }

    Ok(())
}

pub(crate) fn write_publish_packet(packet: &PublishPacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    validate_publish_packet_outbound(packet, version)?;

    let (total_remaining_length, publish_property_length) = compute_publish_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, compute_publish_fixed_header_first_byte(packet), total_remaining_length)?;
    encode_length_prefixed_string(dest, &packet.topic)?;

    if packet.qos != QualityOfService::AtMostOnce {
        encode_u16(dest, packet.packet_id);
    }

    if version.is_v5() {
        write_properties_with_length(&packet.properties, publish_property_length, dest)?;
    }

    dest.extend_from_slice(&packet.payload);

    Ok(())
}

pub(crate) fn decode_publish_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    let mut packet = PublishPacket { ..Default::default() };

    packet.duplicate = (first_byte & PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG) != 0;
    packet.retain = (first_byte & PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG) != 0;
    packet.qos = convert_u8_to_quality_of_service((first_byte >> 1) & QOS_MASK)?;

    if packet.qos == QualityOfService::AtMostOnce && packet.duplicate {
        error!("PublishPacket Decode - qos 0 publish with duplicate flag set");
        return Err(DimqError::new_malformed_packet("qos 0 publish with duplicate flag set"));
    }

    let mut mutable_body = packet_body;
    mutable_body = decode_length_prefixed_string(mutable_body, &mut packet.topic)?;

    if packet.qos != QualityOfService::AtMostOnce {
        mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
        if packet.packet_id == 0 {
            error!("PublishPacket Decode - qos {} publish with zero packet id", packet.qos as u8);
            return Err(DimqError::new_protocol_error("qos 1+ publish with zero packet id"));
        }
    }

    if version.is_v5() {
        let (properties, remaining_bytes) = read_properties(PropertyContext::Publish, mutable_body)?;
        packet.properties = properties;
        mutable_body = remaining_bytes;
    }

    packet.payload = mutable_body.to_vec();

    Ok(ControlPacket::Publish(packet))
}

impl fmt::Display for PublishPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublishPacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        log_string!(self.topic, f, "topic");
        log_enum!(self.qos, f, "qos");
        log_primitive_value!(self.duplicate, f, "duplicate");
        log_primitive_value!(self.retain, f, "retain");
        log_binary_data!(self.payload, f, "payload");
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

impl PublishPacket {

    /// Common-case constructor for PublishPackets that don't need special configuration
    pub fn new(topic: &str, qos: QualityOfService, payload: &[u8]) -> Self {
        PublishPacket {
            topic: topic.to_string(),
            qos,
            payload: payload.to_vec(),
            ..Default::default()
        }
    }

    /// Topic alias carried by the packet, if any
    pub fn topic_alias(&self) -> Option<u16> {
        self.properties.get_u16(PropertyIdentifier::TopicAlias)
    }

    /// Message expiry interval carried by the packet, if any
    pub fn message_expiry_interval_seconds(&self) -> Option<u32> {
        self.properties.get_u32(PropertyIdentifier::MessageExpiryInterval)
    }
}
