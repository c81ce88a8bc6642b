/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the packet codec shared by client and broker sessions.

Inbound, the codec feeds transport bytes to a resumable [`Decoder`](crate::decode::Decoder).
Outbound, each queued packet is serialized once into a contiguous buffer; flushing writes as much
as the transport accepts and resumes a partially-written buffer from its byte offset the next
time around.
 */

use crate::decode::*;
use crate::encode::*;
use crate::error::{DimqError, DimqResult};
use crate::mqtt::*;
use crate::transport::{Transport, TransportError};

use log::*;

use std::collections::VecDeque;

const READ_BUFFER_SIZE : usize = 4096;

/// Result of an attempt to write queued packets to a transport
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlushStatus {

    /// Every queued byte has been written
    Complete,

    /// The transport stopped accepting bytes; the remainder stays queued
    Pending,
}

/// Converts between transport bytes and control packets for one connection
pub trait Codec : Send {

    /// Decodes `bytes`, appending every complete packet to `packets`
    fn decode(&mut self, bytes: &[u8], packets: &mut VecDeque<ControlPacket>) -> DimqResult<()>;

    /// Serializes a packet onto the outbound queue
    fn queue_packet(&mut self, packet: &ControlPacket) -> DimqResult<()>;

    /// Writes queued bytes until the queue empties or the transport would block
    fn flush(&mut self, transport: &mut dyn Transport) -> DimqResult<FlushStatus>;

    /// Whether any serialized bytes are waiting to be written
    fn has_pending_writes(&self) -> bool;

    /// Discards all partial inbound and outbound state ahead of a new connection
    fn reset(&mut self);

    /// Protocol version currently used for encoding and decoding
    fn protocol_version(&self) -> ProtocolVersion;

    fn set_protocol_version(&mut self, version: ProtocolVersion);

    /// Largest inbound packet accepted; zero means the protocol maximum
    fn set_maximum_inbound_packet_size(&mut self, maximum: u32);

    /// Largest outbound packet the peer accepts; zero means the protocol maximum
    fn set_maximum_outbound_packet_size(&mut self, maximum: u32);

    /// Reads from the transport until it would block, decoding everything read.  A closed
    /// transport fails with `ConnectionClosed` after the bytes already read have been decoded.
    fn receive(&mut self, transport: &mut dyn Transport, packets: &mut VecDeque<ControlPacket>) -> DimqResult<()> {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match transport.read(&mut buffer) {
                Ok(bytes_read) => {
                    self.decode(&buffer[..bytes_read], packets)?;
                }
                Err(TransportError::WouldBlock) => {
                    return Ok(());
                }
                Err(error) => {
                    return Err(error.into());
                }
            }
        }
    }
}

/// The standard [`Codec`] implementation
pub struct MqttCodec {
    decoder: Decoder,

    protocol_version: ProtocolVersion,

    maximum_inbound_packet_size: u32,

    maximum_outbound_packet_size: u32,

    outbound: VecDeque<Vec<u8>>,

    write_offset: usize,
}

impl MqttCodec {

    /// Creates a codec speaking the given protocol version.  Broker-side codecs adopt the
    /// version announced by the client's CONNECT.
    pub fn new(protocol_version: ProtocolVersion) -> MqttCodec {
        MqttCodec {
            decoder: Decoder::new(),
            protocol_version,
            maximum_inbound_packet_size: 0,
            maximum_outbound_packet_size: 0,
            outbound: VecDeque::new(),
            write_offset: 0,
        }
    }

    /// Number of serialized bytes waiting to be written
    pub fn pending_write_bytes(&self) -> usize {
        let total : usize = self.outbound.iter().map(|buffer| buffer.len()).sum();
        total - self.write_offset
    }
}

impl Codec for MqttCodec {

    fn decode(&mut self, bytes: &[u8], packets: &mut VecDeque<ControlPacket>) -> DimqResult<()> {
        let mut context = DecodingContext {
            maximum_packet_size: self.maximum_inbound_packet_size,
            protocol_version: self.protocol_version,
            decoded_packets: packets,
        };

        let result = self.decoder.decode_bytes(bytes, &mut context);
        self.protocol_version = context.protocol_version;

        result
    }

    fn queue_packet(&mut self, packet: &ControlPacket) -> DimqResult<()> {
        let packet_size = compute_packet_size(packet, self.protocol_version)?;
        if self.maximum_outbound_packet_size > 0 && packet_size > self.maximum_outbound_packet_size as usize {
            warn!("MqttCodec queue_packet - {} packet of {} bytes exceeds peer maximum of {}", packet.packet_type(), packet_size, self.maximum_outbound_packet_size);
            return Err(DimqError::new_payload_too_large("packet exceeds the peer's maximum packet size"));
        }

        let mut buffer = Vec::with_capacity(packet_size);
        encode_packet(packet, self.protocol_version, &mut buffer)?;
        self.outbound.push_back(buffer);

        Ok(())
    }

    fn flush(&mut self, transport: &mut dyn Transport) -> DimqResult<FlushStatus> {
        while let Some(buffer) = self.outbound.front() {
            match transport.write(&buffer[self.write_offset..]) {
                Ok(bytes_written) => {
                    self.write_offset += bytes_written;
                    if self.write_offset >= buffer.len() {
                        self.outbound.pop_front();
                        self.write_offset = 0;
                    }
                }
                Err(TransportError::WouldBlock) => {
                    return Ok(FlushStatus::Pending);
                }
                Err(error) => {
                    return Err(error.into());
                }
            }
        }

        Ok(FlushStatus::Complete)
    }

    fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn reset(&mut self) {
        self.decoder.reset_for_new_connection();
        self.outbound.clear();
        self.write_offset = 0;
    }

    fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    fn set_maximum_inbound_packet_size(&mut self, maximum: u32) {
        self.maximum_inbound_packet_size = maximum;
    }

    fn set_maximum_outbound_packet_size(&mut self, maximum: u32) {
        self.maximum_outbound_packet_size = maximum;
    }
}
