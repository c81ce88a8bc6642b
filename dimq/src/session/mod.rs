/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the per-connection MQTT state machines.

[`ClientSession`](client::ClientSession) and [`BrokerSession`](broker::BrokerSession) are the two
roles.  Both are single-owner, non-blocking state machines driven by the embedding application:
bytes go in through `handle_incoming_bytes` (or `receive` from a [`Transport`]), time advances
through `service`, and serialized packets come out through `flush`.  Nothing inside a session
sleeps, spawns or reads a clock.

The machinery both roles share (codec, outbound packet staging, topic aliases, state tracking and
the close-on-error policy) lives in [`SessionCore`].
 */

pub mod broker;
pub mod client;

use crate::alias::*;
use crate::codec::{Codec, FlushStatus};
use crate::error::{DimqError, DimqResult, ErrorCategory};
use crate::inflight::{AckOutcome, AckType, InflightQueue};
use crate::logging::log_packet;
use crate::mqtt::*;
use crate::transport::Transport;

use log::*;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

/// Sent records older than this are marked as duplicates for their next transmission
pub(crate) const INFLIGHT_RETRY_HORIZON : Duration = Duration::from_secs(20);

/// Lifecycle state of a session's current connection
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {

    /// Created; no connection attempt has been made
    New,

    /// CONNECT sent (client) or awaited (broker)
    ConnectPending,

    /// CONNACK exchanged; session state is being restored
    Connected,

    /// MQTT5 extended authentication in progress during connect
    Authenticating,

    /// MQTT5 re-authentication in progress on an active connection
    Reauthenticating,

    Active,

    /// DISCONNECT queued; waiting for it to be written
    Disconnecting,

    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// How an outgoing QoS 1 or 2 publish finished
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PublishCompletion {

    /// QoS 1 flow finished
    Puback(PubackReasonCode),

    /// QoS 2 flow ended early by a failing PUBREC
    Pubrec(PubrecReasonCode),

    /// QoS 2 flow finished
    Pubcomp(PubcompReasonCode),

    /// The publish could never be delivered, either because it exceeded the peer's maximum
    /// packet size or because the peer did not resume the session it belonged to
    Discarded,
}

/// Observer for session events.  Every method has an empty default.
#[allow(unused_variables)]
pub trait SessionEventHandler : Send {

    /// A connection was established.  `client_id` is the id in use, which may have been
    /// assigned by the broker.
    fn on_connect(&mut self, client_id: &str, session_present: bool) {}

    /// An application message arrived.  QoS 2 messages are reported once, when released.
    fn on_message(&mut self, publish: &PublishPacket) {}

    /// An outgoing QoS 1 or 2 publish reached the end of its flow
    fn on_publish_complete(&mut self, packet_id: u16, completion: PublishCompletion) {}

    /// A SUBACK was received (client) or sent (broker)
    fn on_subscribe(&mut self, suback: &SubackPacket) {}

    /// An UNSUBACK was received (client) or sent (broker)
    fn on_unsubscribe(&mut self, unsuback: &UnsubackPacket) {}

    /// The connection ended.  `error` is absent for orderly disconnects.
    fn on_disconnect(&mut self, reason_code: DisconnectReasonCode, error: Option<&DimqError>) {}

    /// The peer sent an MQTT5 AUTH challenge.  Returning `None` abandons authentication.
    fn on_auth_challenge(&mut self, method: &str, data: Option<&[u8]>) -> Option<Vec<u8>> {
        None
    }
}

/// Connection machinery shared by the client and broker roles
pub(crate) struct SessionCore {
    pub(crate) state: SessionState,

    pub(crate) codec: Box<dyn Codec>,

    /// Packets produced by the state machine, waiting to be serialized
    pub(crate) outbound: VecDeque<ControlPacket>,

    /// Decoded packets waiting to be processed
    pub(crate) inbound: VecDeque<ControlPacket>,

    pub(crate) handler: Box<dyn SessionEventHandler>,

    pub(crate) last_inbound: Instant,
    pub(crate) last_outbound: Instant,

    pub(crate) inbound_aliases: InboundAliasResolver,
    outbound_aliases: Box<dyn OutboundAliasResolver + Send>,
    outbound_alias_maximum: u16,
    requested_aliases: HashMap<String, u16>,

    base_timestamp: Instant,
    pub(crate) elapsed_time_ms: u128,
}

impl SessionCore {
    pub(crate) fn new(codec: Box<dyn Codec>, handler: Box<dyn SessionEventHandler>, outbound_aliases: Box<dyn OutboundAliasResolver + Send>, base_timestamp: Instant) -> SessionCore {
        SessionCore {
            state: SessionState::New,
            codec,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            handler,
            last_inbound: base_timestamp,
            last_outbound: base_timestamp,
            inbound_aliases: InboundAliasResolver::new(0),
            outbound_aliases,
            outbound_alias_maximum: 0,
            requested_aliases: HashMap::new(),
            base_timestamp,
            elapsed_time_ms: 0,
        }
    }

    pub(crate) fn update_internal_clock(&mut self, now: Instant) {
        self.elapsed_time_ms = now.saturating_duration_since(self.base_timestamp).as_millis();
    }

    pub(crate) fn change_state(&mut self, next_state: SessionState) {
        debug!("[{} ms] change_state - transitioning from {} to {}", self.elapsed_time_ms, self.state, next_state);
        self.state = next_state;
    }

    pub(crate) fn protocol_version(&self) -> ProtocolVersion {
        self.codec.protocol_version()
    }

    pub(crate) fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Connected | SessionState::Authenticating | SessionState::Reauthenticating | SessionState::Active)
    }

    /// Prepares the codec and alias state for a fresh connection
    pub(crate) fn reset_connection(&mut self, now: Instant) {
        self.codec.reset();
        self.outbound.clear();
        self.inbound.clear();
        self.outbound_alias_maximum = 0;
        self.outbound_aliases.reset_for_new_connection(0);
        self.last_inbound = now;
        self.last_outbound = now;
    }

    pub(crate) fn reset_outbound_aliases(&mut self, maximum_alias: u16) {
        self.outbound_alias_maximum = maximum_alias;
        self.outbound_aliases.reset_for_new_connection(maximum_alias);
    }

    /// Records a caller-chosen alias for a topic so it survives being stored in an inflight record
    pub(crate) fn request_alias(&mut self, topic: &str, alias: Option<u16>) {
        match alias {
            Some(alias) => { self.requested_aliases.insert(topic.to_string(), alias); }
            None => { self.requested_aliases.remove(topic); }
        }
    }

    pub(crate) fn queue_packet(&mut self, packet: ControlPacket) {
        self.outbound.push_back(packet);
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty() || self.codec.has_pending_writes()
    }

    pub(crate) fn decode(&mut self, bytes: &[u8]) -> DimqResult<()> {
        debug!("[{} ms] decode - received {} bytes", self.elapsed_time_ms, bytes.len());
        self.codec.decode(bytes, &mut self.inbound)
    }

    pub(crate) fn receive(&mut self, transport: &mut dyn Transport) -> DimqResult<()> {
        self.codec.receive(transport, &mut self.inbound)
    }

    /// Serializes every staged packet.  Returns the packet ids of publishes that were too large
    /// for the peer and were dropped; the caller settles their inflight records.
    pub(crate) fn encode_outbound(&mut self, now: Instant) -> DimqResult<Vec<u16>> {
        let mut rejected = Vec::new();

        while let Some(mut packet) = self.outbound.pop_front() {
            let mut aliased = false;
            if let ControlPacket::Publish(publish) = &mut packet {
                if self.codec.protocol_version().is_v5() {
                    let requested_alias = publish.topic_alias().or_else(|| self.requested_aliases.get(&publish.topic).copied());
                    let resolution = self.outbound_aliases.resolve_and_apply_topic_alias(requested_alias, &publish.topic);
                    aliased = resolution.alias.is_some();
                    apply_outbound_alias_resolution(publish, &resolution)?;
                }
            }

            log_packet("Sending: ", &packet);
            match self.codec.queue_packet(&packet) {
                Ok(()) => {
                    self.last_outbound = now;
                }
                Err(DimqError::PayloadTooLarge(_)) if packet.packet_type() == PacketType::Publish => {
                    if let ControlPacket::Publish(publish) = &packet {
                        warn!("[{} ms] encode_outbound - dropping publish {} that exceeds the peer's maximum packet size", self.elapsed_time_ms, publish.packet_id);
                        rejected.push(publish.packet_id);
                    }

                    // the peer never saw any binding made for the dropped packet
                    if aliased {
                        self.outbound_aliases.reset_for_new_connection(self.outbound_alias_maximum);
                    }
                }
                Err(error) => {
                    return Err(error);
                }
            }
        }

        Ok(rejected)
    }

    pub(crate) fn flush(&mut self, transport: &mut dyn Transport) -> DimqResult<FlushStatus> {
        self.codec.flush(transport)
    }

    /// Applies a PUBACK, PUBREC or PUBCOMP to the outgoing queue.  Acks for unknown packet ids
    /// are logged and ignored.
    pub(crate) fn apply_publish_ack(&mut self, inflight_out: &mut InflightQueue, packet_id: u16, ack: AckType, completion: PublishCompletion, now: Instant) -> DimqResult<()> {
        match inflight_out.on_ack(packet_id, ack, now, &mut self.outbound) {
            Ok(AckOutcome::Completed(_)) => {
                debug!("[{} ms] apply_publish_ack - publish {} completed by {}", self.elapsed_time_ms, packet_id, ack);
                self.handler.on_publish_complete(packet_id, completion);
                Ok(())
            }
            Ok(AckOutcome::Progressed) => {
                Ok(())
            }
            Err(DimqError::InflightNotFound(_)) => {
                warn!("[{} ms] apply_publish_ack - {} for unknown packet id {}", self.elapsed_time_ms, ack, packet_id);
                Ok(())
            }
            Err(error) => {
                Err(error)
            }
        }
    }

    /// Drops outgoing records whose publishes could not be encoded
    pub(crate) fn discard_rejected(&mut self, inflight_out: &mut InflightQueue, rejected: Vec<u16>, now: Instant) -> DimqResult<()> {
        for packet_id in rejected.into_iter().filter(|packet_id| *packet_id != 0) {
            if inflight_out.discard(packet_id, now, &mut self.outbound)?.is_some() {
                self.handler.on_publish_complete(packet_id, PublishCompletion::Discarded);
            }
        }

        Ok(())
    }

    /// Serializes a packet straight into the codec, ahead of anything still staged.  Used for the
    /// last packet a connection sends before closing.
    pub(crate) fn queue_final_packet(&mut self, packet: ControlPacket) {
        log_packet("Sending: ", &packet);
        if let Err(error) = self.codec.queue_packet(&packet) {
            warn!("[{} ms] queue_final_packet - unable to queue {}: {}", self.elapsed_time_ms, packet.packet_type(), error);
        }
    }

    /// Ends the connection because of an error.  If the connection was established and the peer
    /// speaks MQTT5, a DISCONNECT carrying the error's reason code is queued for one last flush.
    /// Returns the error for propagation.
    pub(crate) fn fail(&mut self, error: DimqError) -> DimqError {
        let reason_code = error.disconnect_reason_code();
        let sends_disconnect = match error.category() {
            ErrorCategory::Malformed | ErrorCategory::Protocol | ErrorCategory::Resource => { true }
            ErrorCategory::Auth => { matches!(error, DimqError::NotAuthorized(_)) }
            ErrorCategory::Transport => { matches!(error, DimqError::KeepaliveTimeout(_) | DimqError::SessionTakenOver(_)) }
            ErrorCategory::Internal => { false }
        };

        if self.state == SessionState::Disconnected {
            return error;
        }

        error!("[{} ms] fail - closing connection in state {}: {}", self.elapsed_time_ms, self.state, error);

        if sends_disconnect && self.is_established() && self.protocol_version().is_v5() {
            self.queue_final_packet(ControlPacket::Disconnect(DisconnectPacket::new(reason_code)));
        }

        self.outbound.clear();
        self.inbound.clear();
        self.change_state(SessionState::Disconnected);
        self.handler.on_disconnect(reason_code, Some(&error));

        error
    }
}
