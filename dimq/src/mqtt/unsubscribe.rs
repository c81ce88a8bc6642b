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
pub(crate) fn compute_unsubscribe_packet_length_properties(packet: &UnsubscribePacket, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    let mut total_remaining_length : usize = 2;

    let mut unsubscribe_property_section_length = 0;
    if version.is_v5() {
        unsubscribe_property_section_length = get_remaining_length(&packet.properties);
        total_remaining_length += compute_variable_length_integer_encode_size(unsubscribe_property_section_length)?;
        total_remaining_length += unsubscribe_property_section_length;
    }

    total_remaining_length += packet.topic_filters.len() * 2;
    total_remaining_length += packet.topic_filters.iter().map(|filter| filter.len()).sum::<usize>();

    Ok((total_remaining_length, unsubscribe_property_section_length))
}

pub(crate) fn write_unsubscribe_packet(packet: &UnsubscribePacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    if packet.packet_id == 0 {
        error!("UnsubscribePacket Encode - packet id must be non-zero");
        return Err(DimqError::new_packet_validation(PacketType::Unsubscribe, "packet id is zero"));
    }

    if packet.topic_filters.is_empty() {
        error!("UnsubscribePacket Encode - empty topic filter list");
        return Err(DimqError::new_packet_validation(PacketType::Unsubscribe, "empty topic filter list"));
    }

    if version.is_v5() {
        validate_properties(PropertyContext::Unsubscribe, &packet.properties)?;
    }

    let (total_remaining_length, unsubscribe_property_length) = compute_unsubscribe_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, UNSUBSCRIBE_FIRST_BYTE, total_remaining_length)?;
    encode_u16(dest, packet.packet_id);

    if version.is_v5() {
        write_properties_with_length(&packet.properties, unsubscribe_property_length, dest)?;
    }

    for topic_filter in &packet.topic_filters {
        encode_length_prefixed_string(dest, topic_filter)?;
    }

    Ok(())
}

pub(crate) fn decode_unsubscribe_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    if first_byte != UNSUBSCRIBE_FIRST_BYTE {
        error!("UnsubscribePacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for unsubscribe packet"));
    }

    let mut packet = UnsubscribePacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
    if packet.packet_id == 0 {
        error!("UnsubscribePacket Decode - packet id must be non-zero");
        return Err(DimqError::new_protocol_error("unsubscribe with zero packet id"));
    }

    if version.is_v5() {
        let (properties, remaining_bytes) = read_properties(PropertyContext::Unsubscribe, mutable_body)?;
        packet.properties = properties;
        mutable_body = remaining_bytes;
    }

    while !mutable_body.is_empty() {
        let mut topic_filter = String::new();
        mutable_body = decode_length_prefixed_string(mutable_body, &mut topic_filter)?;
        packet.topic_filters.push(topic_filter);
    }

    if packet.topic_filters.is_empty() {
        error!("UnsubscribePacket Decode - unsubscribe packet carries no topic filters");
        return Err(DimqError::new_protocol_error("unsubscribe packet with no topic filters"));
    }

    Ok(ControlPacket::Unsubscribe(packet))
}

impl fmt::Display for UnsubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "UnsubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " topic_filters: [")?;
        for (i, topic_filter) in self.topic_filters.iter().enumerate() {
            write!(f, " {}:\"{}\"", i, topic_filter)?;
        }
        write!(f, " ]")?;
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}
