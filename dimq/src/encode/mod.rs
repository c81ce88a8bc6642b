/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Packet serialization.  Every packet is sized first and then written as one contiguous buffer.
 */

pub mod utils;

use crate::error::DimqResult;
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::auth::*;
use crate::mqtt::connack::*;
use crate::mqtt::connect::*;
use crate::mqtt::disconnect::*;
use crate::mqtt::pingreq::*;
use crate::mqtt::pingresp::*;
use crate::mqtt::puback::*;
use crate::mqtt::pubcomp::*;
use crate::mqtt::publish::*;
use crate::mqtt::pubrec::*;
use crate::mqtt::pubrel::*;
use crate::mqtt::suback::*;
use crate::mqtt::subscribe::*;
use crate::mqtt::unsuback::*;
use crate::mqtt::unsubscribe::*;

/// Computes a packet's remaining length (everything after the fixed header) without encoding it
pub fn compute_remaining_length(packet: &ControlPacket, version: ProtocolVersion) -> DimqResult<usize> {
    match packet {
        ControlPacket::Connect(packet) => { Ok(compute_connect_packet_length_properties(packet)?.0) }
        ControlPacket::Connack(packet) => { Ok(compute_connack_packet_length_properties(packet, version)?.0) }
        ControlPacket::Publish(packet) => { Ok(compute_publish_packet_length_properties(packet, version)?.0) }
        ControlPacket::Puback(packet) => { Ok(compute_puback_packet_length_properties(packet, version)?.0) }
        ControlPacket::Pubrec(packet) => { Ok(compute_pubrec_packet_length_properties(packet, version)?.0) }
        ControlPacket::Pubrel(packet) => { Ok(compute_pubrel_packet_length_properties(packet, version)?.0) }
        ControlPacket::Pubcomp(packet) => { Ok(compute_pubcomp_packet_length_properties(packet, version)?.0) }
        ControlPacket::Subscribe(packet) => { Ok(compute_subscribe_packet_length_properties(packet, version)?.0) }
        ControlPacket::Suback(packet) => { Ok(compute_suback_packet_length_properties(packet, version)?.0) }
        ControlPacket::Unsubscribe(packet) => { Ok(compute_unsubscribe_packet_length_properties(packet, version)?.0) }
        ControlPacket::Unsuback(packet) => { Ok(compute_unsuback_packet_length_properties(packet, version)?.0) }
        ControlPacket::Pingreq(_) => { Ok(0) }
        ControlPacket::Pingresp(_) => { Ok(0) }
        ControlPacket::Disconnect(packet) => { Ok(compute_disconnect_packet_length_properties(packet, version)?.0) }
        ControlPacket::Auth(packet) => { Ok(compute_auth_packet_length_properties(packet, version)?.0) }
    }
}

/// Computes the total encoded size of a packet, fixed header included
pub fn compute_packet_size(packet: &ControlPacket, version: ProtocolVersion) -> DimqResult<usize> {
    let remaining_length = compute_remaining_length(packet, version)?;
    Ok(1 + utils::compute_variable_length_integer_encode_size(remaining_length)? + remaining_length)
}

/// Appends the full encoding of `packet` to `dest`.  CONNECT packets always encode with their
/// own protocol version.
pub fn encode_packet(packet: &ControlPacket, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
    log_packet("Encoding outbound packet: ", packet);

    match packet {
        ControlPacket::Connect(packet) => { write_connect_packet(packet, dest) }
        ControlPacket::Connack(packet) => { write_connack_packet(packet, version, dest) }
        ControlPacket::Publish(packet) => { write_publish_packet(packet, version, dest) }
        ControlPacket::Puback(packet) => { write_puback_packet(packet, version, dest) }
        ControlPacket::Pubrec(packet) => { write_pubrec_packet(packet, version, dest) }
        ControlPacket::Pubrel(packet) => { write_pubrel_packet(packet, version, dest) }
        ControlPacket::Pubcomp(packet) => { write_pubcomp_packet(packet, version, dest) }
        ControlPacket::Subscribe(packet) => { write_subscribe_packet(packet, version, dest) }
        ControlPacket::Suback(packet) => { write_suback_packet(packet, version, dest) }
        ControlPacket::Unsubscribe(packet) => { write_unsubscribe_packet(packet, version, dest) }
        ControlPacket::Unsuback(packet) => { write_unsuback_packet(packet, version, dest) }
        ControlPacket::Pingreq(packet) => { write_pingreq_packet(packet, dest) }
        ControlPacket::Pingresp(packet) => { write_pingresp_packet(packet, dest) }
        ControlPacket::Disconnect(packet) => { write_disconnect_packet(packet, version, dest) }
        ControlPacket::Auth(packet) => { write_auth_packet(packet, version, dest) }
    }
}
