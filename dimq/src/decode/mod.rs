/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Resumable MQTT packet decoder.

The decoder accepts arbitrarily fragmented input and keeps whatever partial state it needs (the
first byte, the remaining length bytes seen so far, the body bytes seen so far) between calls.
 */

pub mod utils;

use crate::decode::utils::*;
use crate::encode::utils::*;
use crate::error::{DimqError, DimqResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::utils::*;

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

use log::*;

use std::collections::VecDeque;
use std::fmt;

const DECODE_BUFFER_DEFAULT_SIZE : usize = 16 * 1024;

/// Where the decoder is within the current packet
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DecoderState {
    AwaitingFixedHeader,
    AwaitingRemainingLength,
    AwaitingBody,
    TerminalError
}

impl fmt::Display for DecoderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum DecoderDirective {
    OutOfData,
    Continue,
}

/// Per-call decoding parameters
pub struct DecodingContext<'a> {

    /// Largest total packet size (fixed header included) that will be accepted.  Zero means the
    /// protocol maximum.
    pub maximum_packet_size : u32,

    /// Protocol version used for every packet other than CONNECT, which carries its own
    pub protocol_version : ProtocolVersion,

    /// Destination for fully decoded packets
    pub decoded_packets: &'a mut VecDeque<ControlPacket>
}

/// Streaming packet decoder.  After a decode failure the decoder stays in `TerminalError` until
/// it is reset for a new connection.
pub struct Decoder {
    state: DecoderState,

    scratch: Vec<u8>,

    first_byte: Option<u8>,

    remaining_length : Option<usize>,
}

pub(crate) fn decode_packet(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
    let packet_type = first_byte >> 4;

    debug!("Decoding a packet of type {}", packet_type_to_str(packet_type));

    match packet_type {
        PACKET_TYPE_CONNECT => { decode_connect_packet(first_byte, packet_body) }
        PACKET_TYPE_CONNACK => { decode_connack_packet(first_byte, packet_body, version) }
        PACKET_TYPE_PUBLISH => { decode_publish_packet(first_byte, packet_body, version) }
        PACKET_TYPE_PUBACK => { decode_puback_packet(first_byte, packet_body, version) }
        PACKET_TYPE_PUBREC => { decode_pubrec_packet(first_byte, packet_body, version) }
        PACKET_TYPE_PUBREL => { decode_pubrel_packet(first_byte, packet_body, version) }
        PACKET_TYPE_PUBCOMP => { decode_pubcomp_packet(first_byte, packet_body, version) }
        PACKET_TYPE_SUBSCRIBE => { decode_subscribe_packet(first_byte, packet_body, version) }
        PACKET_TYPE_SUBACK => { decode_suback_packet(first_byte, packet_body, version) }
        PACKET_TYPE_UNSUBSCRIBE => { decode_unsubscribe_packet(first_byte, packet_body, version) }
        PACKET_TYPE_UNSUBACK => { decode_unsuback_packet(first_byte, packet_body, version) }
        PACKET_TYPE_PINGREQ => { decode_pingreq_packet(first_byte, packet_body) }
        PACKET_TYPE_PINGRESP => { decode_pingresp_packet(first_byte, packet_body) }
        PACKET_TYPE_DISCONNECT => { decode_disconnect_packet(first_byte, packet_body, version) }
        PACKET_TYPE_AUTH => { decode_auth_packet(first_byte, packet_body, version) }
        _ => {
            error!("Packet Decode - reserved packet type ({})", packet_type);
            Err(DimqError::new_malformed_packet("reserved packet type"))
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder {
            state: DecoderState::AwaitingFixedHeader,
            scratch : Vec::<u8>::with_capacity(DECODE_BUFFER_DEFAULT_SIZE),
            first_byte : None,
            remaining_length : None,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn reset_for_new_connection(&mut self) {
        self.reset();
    }

    fn process_awaiting_fixed_header<'a>(&mut self, bytes: &'a [u8]) -> DimqResult<(DecoderDirective, &'a[u8])> {
        if bytes.is_empty() {
            return Ok((DecoderDirective::OutOfData, bytes));
        }

        let first_byte = bytes[0];
        if (first_byte >> 4) == 0 {
            error!("Packet Decode - reserved packet type 0 in fixed header");
            return Err(DimqError::new_malformed_packet("reserved packet type"));
        }

        self.first_byte = Some(first_byte);
        self.state = DecoderState::AwaitingRemainingLength;

        Ok((DecoderDirective::Continue, &bytes[1..]))
    }

    fn process_awaiting_remaining_length<'a>(&mut self, bytes: &'a[u8], context: &DecodingContext) -> DimqResult<(DecoderDirective, &'a[u8])> {
        if bytes.is_empty() {
            return Ok((DecoderDirective::OutOfData, bytes));
        }

        self.scratch.push(bytes[0]);
        let remaining_bytes = &bytes[1..];

        match decode_varint(&self.scratch)? {
            DecodeVarintResult::Value { value: remaining_length, consumed } => {
                let mut maximum_size = context.maximum_packet_size as usize;
                if maximum_size == 0 {
                    maximum_size = MAXIMUM_VARIABLE_LENGTH_INTEGER;
                }

                let total_packet_size = remaining_length as usize + 1 + consumed;
                if total_packet_size > maximum_size {
                    error!("Packet Decode - packet size {} exceeds maximum of {}", total_packet_size, maximum_size);
                    return Err(DimqError::new_payload_too_large("packet exceeds maximum packet size"));
                }

                self.remaining_length = Some(remaining_length as usize);
                self.state = DecoderState::AwaitingBody;
                self.scratch.clear();
                Ok((DecoderDirective::Continue, remaining_bytes))
            }
            DecodeVarintResult::Incomplete => {
                if remaining_bytes.is_empty() {
                    Ok((DecoderDirective::OutOfData, remaining_bytes))
                } else {
                    Ok((DecoderDirective::Continue, remaining_bytes))
                }
            }
        }
    }

    fn process_awaiting_body<'a>(&mut self, bytes: &'a[u8], context: &mut DecodingContext) -> DimqResult<(DecoderDirective, &'a[u8])> {
        let (Some(first_byte), Some(remaining_length)) = (self.first_byte, self.remaining_length) else {
            return Err(DimqError::new_internal_state_error("decoder reached body state without a fixed header"));
        };

        let read_so_far = self.scratch.len();
        let bytes_needed = remaining_length - read_so_far;
        if bytes_needed > bytes.len() {
            self.scratch.extend_from_slice(bytes);
            return Ok((DecoderDirective::OutOfData, &[]));
        }

        let packet =
            if !self.scratch.is_empty() {
                self.scratch.extend_from_slice(&bytes[..bytes_needed]);
                decode_packet(first_byte, &self.scratch, context.protocol_version)?
            } else {
                decode_packet(first_byte, &bytes[..bytes_needed], context.protocol_version)?
            };

        log_packet("Successfully decoded incoming packet: ", &packet);

        // packets pipelined behind a CONNECT use the version it announces
        if let ControlPacket::Connect(connect) = &packet {
            context.protocol_version = connect.protocol_version;
        }

        context.decoded_packets.push_back(packet);

        self.reset();
        Ok((DecoderDirective::Continue, &bytes[bytes_needed..]))
    }

    /// Consumes `bytes`, appending every packet completed along the way to the context's packet
    /// queue.  Partial packets are retained for the next call.
    pub fn decode_bytes(&mut self, bytes: &[u8], context: &mut DecodingContext) -> DimqResult<()> {
        let mut current_slice = bytes;

        let mut directive = DecoderDirective::Continue;
        while directive == DecoderDirective::Continue {
            let step_result = match self.state {
                DecoderState::AwaitingFixedHeader => {
                    self.process_awaiting_fixed_header(current_slice)
                }

                DecoderState::AwaitingRemainingLength => {
                    self.process_awaiting_remaining_length(current_slice, context)
                }

                DecoderState::AwaitingBody => {
                    self.process_awaiting_body(current_slice, context)
                }

                DecoderState::TerminalError => {
                    Err(DimqError::new_malformed_packet("decoder is in a terminal error state"))
                }
            };

            match step_result {
                Ok((next_directive, next_slice)) => {
                    directive = next_directive;
                    current_slice = next_slice;
                }
                Err(error) => {
                    self.state = DecoderState::TerminalError;
                    return Err(error);
                }
            }
        }

        Ok(())
    }

    fn reset(&mut self) {
        self.state = DecoderState::AwaitingFixedHeader;
        self.scratch.clear();
        self.first_byte = None;
        self.remaining_length = None;
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::*;

    use assert_matches::assert_matches;

    fn create_publish() -> ControlPacket {
        ControlPacket::Publish(PublishPacket {
            packet_id: 9,
            topic: "sensors/kitchen/temperature".to_string(),
            qos: QualityOfService::ExactlyOnce,
            payload: b"21.5".to_vec(),
            ..Default::default()
        })
    }

    #[test]
    fn one_byte_at_a_time_matches_single_call() {
        let packet = create_publish();
        let encoded = encode_packet_for_test(&packet, ProtocolVersion::Mqtt5);

        let mut whole_packets = VecDeque::new();
        let mut decoder = Decoder::new();
        decoder.decode_bytes(&encoded, &mut DecodingContext { maximum_packet_size: 0, protocol_version: ProtocolVersion::Mqtt5, decoded_packets: &mut whole_packets }).unwrap();

        let mut fragmented_packets = VecDeque::new();
        let mut fragmented_decoder = Decoder::new();
        for byte in encoded.iter() {
            let mut context = DecodingContext { maximum_packet_size: 0, protocol_version: ProtocolVersion::Mqtt5, decoded_packets: &mut fragmented_packets };
            fragmented_decoder.decode_bytes(std::slice::from_ref(byte), &mut context).unwrap();
        }

        assert_eq!(1, whole_packets.len());
        assert_eq!(whole_packets, fragmented_packets);
    }

    #[test]
    fn partial_state_is_reported() {
        let encoded = encode_packet_for_test(&create_publish(), ProtocolVersion::Mqtt311);

        let mut packets = VecDeque::new();
        let mut decoder = Decoder::new();
        let mut context = DecodingContext { maximum_packet_size: 0, protocol_version: ProtocolVersion::Mqtt311, decoded_packets: &mut packets };

        decoder.decode_bytes(&encoded[..1], &mut context).unwrap();
        assert_eq!(DecoderState::AwaitingRemainingLength, decoder.state());

        decoder.decode_bytes(&encoded[1..4], &mut context).unwrap();
        assert_eq!(DecoderState::AwaitingBody, decoder.state());

        decoder.decode_bytes(&encoded[4..], &mut context).unwrap();
        assert_eq!(DecoderState::AwaitingFixedHeader, decoder.state());
        assert_eq!(1, packets.len());
    }

    #[test]
    fn five_byte_remaining_length_is_malformed() {
        let mut packets = VecDeque::new();
        let mut decoder = Decoder::new();
        let mut context = DecodingContext { maximum_packet_size: 0, protocol_version: ProtocolVersion::Mqtt5, decoded_packets: &mut packets };

        let result = decoder.decode_bytes(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01], &mut context);
        assert_matches!(result, Err(DimqError::MalformedPacket(_)));
        assert_eq!(DecoderState::TerminalError, decoder.state());

        // terminal until reset
        assert!(decoder.decode_bytes(&[0xC0, 0x00], &mut context).is_err());
        decoder.reset_for_new_connection();
        assert!(decoder.decode_bytes(&[0xC0, 0x00], &mut context).is_ok());
        assert_eq!(1, packets.len());
    }

    #[test]
    fn reserved_packet_type_is_malformed() {
        let mut packets = VecDeque::new();
        let mut decoder = Decoder::new();
        let mut context = DecodingContext { maximum_packet_size: 0, protocol_version: ProtocolVersion::Mqtt5, decoded_packets: &mut packets };

        assert_matches!(decoder.decode_bytes(&[0x00, 0x00], &mut context), Err(DimqError::MalformedPacket(_)));
    }

    #[test]
    fn pingreq_with_body_is_malformed() {
        let mut packets = VecDeque::new();
        let mut decoder = Decoder::new();
        let mut context = DecodingContext { maximum_packet_size: 0, protocol_version: ProtocolVersion::Mqtt311, decoded_packets: &mut packets };

        assert_matches!(decoder.decode_bytes(&[0xC0, 0x01, 0x00], &mut context), Err(DimqError::MalformedPacket(_)));
        assert!(packets.is_empty());
    }

    #[test]
    fn several_packets_in_one_buffer() {
        let mut stream = encode_packet_for_test(&ControlPacket::Pingreq(PingreqPacket{}), ProtocolVersion::Mqtt311);
        stream.extend_from_slice(&encode_packet_for_test(&create_publish(), ProtocolVersion::Mqtt311));
        stream.extend_from_slice(&encode_packet_for_test(&ControlPacket::Pingresp(PingrespPacket{}), ProtocolVersion::Mqtt311));

        let mut packets = VecDeque::new();
        let mut decoder = Decoder::new();
        let mut context = DecodingContext { maximum_packet_size: 0, protocol_version: ProtocolVersion::Mqtt311, decoded_packets: &mut packets };
        decoder.decode_bytes(&stream, &mut context).unwrap();

        assert_eq!(3, packets.len());
        assert_matches!(packets[0], ControlPacket::Pingreq(_));
        assert_matches!(packets[1], ControlPacket::Publish(_));
        assert_matches!(packets[2], ControlPacket::Pingresp(_));
    }
}
