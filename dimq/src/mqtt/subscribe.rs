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
pub(crate) fn compute_subscribe_packet_length_properties(packet: &SubscribePacket, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
    let mut total_remaining_length : usize = 2;

    let mut subscribe_property_section_length = 0;
    if version.is_v5() {
        subscribe_property_section_length = get_remaining_length(&packet.properties);
        total_remaining_length += compute_variable_length_integer_encode_size(subscribe_property_section_length)?;
        total_remaining_length += subscribe_property_section_length;
    }

    total_remaining_length += packet.subscriptions.len() * 3;
    total_remaining_length += packet.subscriptions.iter().map(|subscription| subscription.topic_filter.len()).sum::<usize>();

    Ok((total_remaining_length, subscribe_property_section_length))
}

fn compute_subscription_options_byte(subscription: &Subscription, version: ProtocolVersion) -> u8 {
    let mut options_byte = subscription.qos as u8;

    if version.is_v5() {
        if subscription.no_local {
            options_byte |= SUBSCRIPTION_OPTIONS_NO_LOCAL_MASK;
        }

        if subscription.retain_as_published {
            options_byte |= SUBSCRIPTION_OPTIONS_RETAIN_AS_PUBLISHED_MASK;
        }

        options_byte |= (subscription.retain_handling_type as u8) << SUBSCRIPTION_OPTIONS_RETAIN_HANDLING_SHIFT;
    }

    options_byte
}

pub(crate) fn write_subscribe_packet(packet: &SubscribePacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    if packet.packet_id == 0 {
        error!("SubscribePacket Encode - packet id must be non-zero");
        return Err(DimqError::new_packet_validation(PacketType::Subscribe, "packet id is zero"));
    }

    if packet.subscriptions.is_empty() {
        error!("SubscribePacket Encode - empty subscription list");
        return Err(DimqError::new_packet_validation(PacketType::Subscribe, "empty subscription list"));
    }

    if version.is_v5() {
        validate_properties(PropertyContext::Subscribe, &packet.properties)?;
    }

    let (total_remaining_length, subscribe_property_length) = compute_subscribe_packet_length_properties(packet, version)?;

    encode_fixed_header(dest, SUBSCRIBE_FIRST_BYTE, total_remaining_length)?;
    encode_u16(dest, packet.packet_id);

    if version.is_v5() {
        write_properties_with_length(&packet.properties, subscribe_property_length, dest)?;
    }

    for subscription in &packet.subscriptions {
        encode_length_prefixed_string(dest, &subscription.topic_filter)?;
        encode_u8(dest, compute_subscription_options_byte(subscription, version));
    }

    Ok(())
}

fn decode_subscription<'a>(bytes: &'a [u8], version: ProtocolVersion) -> DimqResult<(Subscription, &'a [u8])> {
    let mut subscription = Subscription { ..Default::default() };

    let mut mutable_bytes = decode_length_prefixed_string(bytes, &mut subscription.topic_filter)?;

    let mut options_byte : u8 = 0;
    mutable_bytes = decode_u8(mutable_bytes, &mut options_byte)?;

    if version.is_v5() {
        if (options_byte & SUBSCRIPTION_OPTIONS_RESERVED_MASK) != 0 {
            error!("SubscribePacket Decode - reserved subscription option bits set");
            return Err(DimqError::new_malformed_packet("reserved subscription option bits set"));
        }

        subscription.no_local = (options_byte & SUBSCRIPTION_OPTIONS_NO_LOCAL_MASK) != 0;
        subscription.retain_as_published = (options_byte & SUBSCRIPTION_OPTIONS_RETAIN_AS_PUBLISHED_MASK) != 0;
        subscription.retain_handling_type = convert_u8_to_retain_handling_type((options_byte >> SUBSCRIPTION_OPTIONS_RETAIN_HANDLING_SHIFT) & 0x03)?;
    } else if (options_byte & !SUBSCRIPTION_OPTIONS_QOS_MASK) != 0 {
        error!("SubscribePacket Decode - mqtt3 subscription options may only carry a qos");
        return Err(DimqError::new_malformed_packet("reserved subscription option bits set"));
    }

    subscription.qos = convert_u8_to_quality_of_service(options_byte & SUBSCRIPTION_OPTIONS_QOS_MASK)?;

    Ok((subscription, mutable_bytes))
}

pub(crate) fn decode_subscribe_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    if first_byte != SUBSCRIBE_FIRST_BYTE {
        error!("SubscribePacket Decode - invalid first byte");
        return Err(DimqError::new_malformed_packet("invalid first byte for subscribe packet"));
    }

    let mut packet = SubscribePacket { ..Default::default() };

    let mut mutable_body = packet_body;
    mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
    if packet.packet_id == 0 {
        error!("SubscribePacket Decode - packet id must be non-zero");
        return Err(DimqError::new_protocol_error("subscribe with zero packet id"));
    }

    if version.is_v5() {
        let (properties, remaining_bytes) = read_properties(PropertyContext::Subscribe, mutable_body)?;
        packet.properties = properties;
        mutable_body = remaining_bytes;
    }

    while !mutable_body.is_empty() {
        let (subscription, remaining_bytes) = decode_subscription(mutable_body, version)?;
        packet.subscriptions.push(subscription);
        mutable_body = remaining_bytes;
    }

    if packet.subscriptions.is_empty() {
        error!("SubscribePacket Decode - subscribe packet carries no subscriptions");
        return Err(DimqError::new_protocol_error("subscribe packet with no subscriptions"));
    }

    Ok(ControlPacket::Subscribe(packet))
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}", self.topic_filter, quality_of_service_to_str(self.qos))?;
        if self.no_local {
            write!(f, ", no_local")?;
        }
        if self.retain_as_published {
            write!(f, ", retain_as_published")?;
        }
        if self.retain_handling_type != RetainHandlingType::SendOnSubscribe {
            write!(f, ", {:?}", self.retain_handling_type)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for SubscribePacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SubscribePacket {{")?;
        log_primitive_value!(self.packet_id, f, "packet_id");
        write!(f, " subscriptions: [")?;
        for (i, subscription) in self.subscriptions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}", subscription)?;
        }
        write!(f, " ]")?;
        log_properties!(self.properties, f, "properties");
        write!(f, " }}")
    }
}

impl SubscribePacket {

    /// Subscription identifier the client attached to this request, if any
    pub fn subscription_identifier(&self) -> Option<u32> {
        self.properties.get_varint(PropertyIdentifier::SubscriptionIdentifier)
    }
}
