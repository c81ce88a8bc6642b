/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Client role of the session state machine.

A [`ClientSession`] owns one logical MQTT session with a broker.  The session survives any number
of connections: call [`connect`](ClientSession::connect) on each new transport and the session
decides whether to resume, replays unacknowledged flows when the broker reports the session as
present, and reports publishes that could not survive as
[`PublishCompletion::Discarded`](crate::session::PublishCompletion::Discarded).
 */

use crate::alias::OutboundAliasResolverFactory;
use crate::codec::{Codec, FlushStatus, MqttCodec};
use crate::config::*;
use crate::encode::utils::MAXIMUM_VARIABLE_LENGTH_INTEGER;
use crate::error::{DimqError, DimqResult};
use crate::inflight::*;
use crate::logging::log_packet;
use crate::message::{MessageOrigin, MessageStore};
use crate::mqtt::*;
use crate::session::*;
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::Transport;
use crate::{fold_optional_timepoint_min, fold_timepoint};

use log::*;

use std::collections::HashMap;
use std::fmt::Display;
use std::time::{Duration, Instant};

/// Values negotiated with the broker during the most recent successful connect
#[derive(Default, Clone, Debug, Eq, PartialEq)]
pub struct NegotiatedSettings {

    /// The maximum QoS allowed between the server and client.
    pub maximum_qos : QualityOfService,

    /// The amount of time in seconds the server will retain the session after a disconnect.
    pub session_expiry_interval : u32,

    /// The number of QoS 1 and QoS2 publications the server is willing to process concurrently.
    pub receive_maximum_from_server : u16,

    /// The maximum packet size the server is willing to accept.
    pub maximum_packet_size_to_server : u32,

    /// The highest value that the server will accept as a Topic Alias sent by the client.
    pub topic_alias_maximum_to_server : u16,

    /// The amount of time in seconds before the server will disconnect the client for inactivity.
    pub server_keep_alive : u16,

    /// Whether or not the server supports retained messages.
    pub retain_available : bool,

    /// Whether or not the server supports wildcard subscriptions.
    pub wildcard_subscriptions_available : bool,

    /// Whether or not the server supports subscription identifiers.
    pub subscription_identifiers_available : bool,

    /// Whether or not the server supports shared subscriptions.
    pub shared_subscriptions_available : bool,

    /// Whether or not the client has rejoined an existing session.
    pub rejoined_session : bool,

    /// Client id in use for the current connection
    pub client_id : String
}

impl Display for NegotiatedSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NegotiatedSettings {{")?;
        write!(f, " maximum_qos:{}", self.maximum_qos)?;
        write!(f, " session_expiry_interval:{}", self.session_expiry_interval)?;
        write!(f, " receive_maximum_from_server:{}", self.receive_maximum_from_server)?;
        write!(f, " maximum_packet_size_to_server:{}", self.maximum_packet_size_to_server)?;
        write!(f, " topic_alias_maximum_to_server:{}", self.topic_alias_maximum_to_server)?;
        write!(f, " server_keep_alive:{}", self.server_keep_alive)?;
        write!(f, " retain_available:{}", self.retain_available)?;
        write!(f, " wildcard_subscriptions_available:{}", self.wildcard_subscriptions_available)?;
        write!(f, " subscription_identifiers_available:{}", self.subscription_identifiers_available)?;
        write!(f, " shared_subscriptions_available:{}", self.shared_subscriptions_available)?;
        write!(f, " rejoined_session:{}", self.rejoined_session)?;
        write!(f, " client_id:{}", self.client_id)?;
        write!(f, " }}")
    }
}

fn flag_property(properties: &PropertyList, identifier: PropertyIdentifier) -> bool {
    properties.get_byte(identifier).map_or(true, |value| value != 0)
}

fn build_negotiated_settings(options: &ConnectOptions, connack: &ConnackPacket, existing_settings: &Option<NegotiatedSettings>) -> NegotiatedSettings {
    let properties = &connack.properties;

    let final_client_id =
        if let Some(assigned) = properties.get_string(PropertyIdentifier::AssignedClientIdentifier) {
            assigned.to_string()
        } else if !options.client_id.is_empty() {
            options.client_id.clone()
        } else if let Some(settings) = &existing_settings {
            settings.client_id.clone()
        } else {
            // a 3.1.1 broker may assign an id but has no way to tell us what it is
            String::new()
        };

    let requested_session_expiry =
        if options.protocol_version.is_v5() {
            options.session_expiry_interval_seconds.unwrap_or(0)
        } else if options.clean_start {
            0
        } else {
            u32::MAX
        };

    NegotiatedSettings {
        maximum_qos : properties.get_byte(PropertyIdentifier::MaximumQos).and_then(|value| QualityOfService::try_from(value).ok()).unwrap_or(QualityOfService::ExactlyOnce),
        session_expiry_interval : properties.get_u32(PropertyIdentifier::SessionExpiryInterval).unwrap_or(requested_session_expiry),
        receive_maximum_from_server : properties.get_u16(PropertyIdentifier::ReceiveMaximum).unwrap_or(65535),
        maximum_packet_size_to_server : properties.get_u32(PropertyIdentifier::MaximumPacketSize).unwrap_or(MAXIMUM_VARIABLE_LENGTH_INTEGER as u32),
        topic_alias_maximum_to_server : properties.get_u16(PropertyIdentifier::TopicAliasMaximum).unwrap_or(0),
        server_keep_alive : properties.get_u16(PropertyIdentifier::ServerKeepAlive).unwrap_or(options.keep_alive_interval_seconds),
        retain_available : flag_property(properties, PropertyIdentifier::RetainAvailable),
        wildcard_subscriptions_available : flag_property(properties, PropertyIdentifier::WildcardSubscriptionAvailable),
        subscription_identifiers_available : flag_property(properties, PropertyIdentifier::SubscriptionIdentifiersAvailable),
        shared_subscriptions_available : flag_property(properties, PropertyIdentifier::SharedSubscriptionAvailable),
        rejoined_session : connack.session_present,
        client_id : final_client_id
    }
}

fn collect_subscription_identifiers(publish: &PublishPacket) -> Vec<u32> {
    publish.properties.get_all(PropertyIdentifier::SubscriptionIdentifier).filter_map(|value| {
        if let PropertyValue::VarInt(identifier) = value {
            Some(*identifier)
        } else {
            None
        }
    }).collect()
}

/// Client side of an MQTT session
pub struct ClientSession {
    core: SessionCore,

    config: ClientSessionConfig,

    inflight_in: InflightQueue,
    inflight_out: InflightQueue,

    /// SUBSCRIBE and UNSUBSCRIBE packet ids waiting for their acknowledgement
    pending_acks: HashMap<u16, PacketType>,

    has_connected_successfully: bool,

    current_settings: Option<NegotiatedSettings>,

    ping_timeout_timepoint: Option<Instant>,

    disconnect_reason_code: DisconnectReasonCode,
}

impl ClientSession {

    /// Creates a session that has not yet connected
    pub fn new(config: ClientSessionConfig, handler: Box<dyn SessionEventHandler>) -> ClientSession {
        let options = &config.connect_options;
        let outbound_aliases = match &config.outbound_alias_resolver_factory {
            Some(factory) => { factory() }
            None => { OutboundAliasResolverFactory::new_null_factory()() }
        };

        let codec = Box::new(MqttCodec::new(options.protocol_version));
        let core = SessionCore::new(codec, handler, outbound_aliases, config.base_timestamp);
        let inflight_in = InflightQueue::new(InflightDirection::Incoming, options.receive_maximum.unwrap_or(u16::MAX));

        ClientSession {
            core,
            inflight_in,
            inflight_out: InflightQueue::new(InflightDirection::Outgoing, u16::MAX).with_packet_ids_on_enqueue(),
            pending_acks: HashMap::new(),
            has_connected_successfully: false,
            current_settings: None,
            ping_timeout_timepoint: None,
            disconnect_reason_code: DisconnectReasonCode::NormalDisconnection,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.state
    }

    /// Settings negotiated by the most recent successful connect
    pub fn negotiated_settings(&self) -> Option<&NegotiatedSettings> {
        self.current_settings.as_ref()
    }

    /// Outgoing QoS 1 and 2 flows, including ones queued behind the broker's receive maximum
    pub fn outgoing_inflight(&self) -> &InflightQueue {
        &self.inflight_out
    }

    pub fn incoming_inflight(&self) -> &InflightQueue {
        &self.inflight_in
    }

    fn is_resumable(&self) -> bool {
        let options = &self.config.connect_options;
        if options.protocol_version.is_v5() {
            options.session_expiry_interval_seconds.unwrap_or(0) > 0
        } else {
            !options.clean_start
        }
    }

    /// Starts a new connection by queueing a CONNECT.  The caller has already established the
    /// transport the packet will be flushed to.
    pub fn connect(&mut self, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        match self.core.state {
            SessionState::New | SessionState::Disconnected => {}
            state => {
                error!("[{} ms] connect - invalid state {} to connect from", self.core.elapsed_time_ms, state);
                return Err(DimqError::new_protocol_error(format!("connect not allowed in state {}", state)));
            }
        }

        let options = &self.config.connect_options;

        // a session created for clean start is only resumed after it has existed once
        let clean_start = options.clean_start && !(self.has_connected_successfully && self.is_resumable());
        let mut connect = options.to_connect_packet(clean_start)?;
        if connect.client_id.is_empty() {
            if let Some(settings) = &self.current_settings {
                connect.client_id = settings.client_id.clone();
            }
        }

        self.core.reset_connection(now);
        self.core.codec.set_protocol_version(options.protocol_version);
        self.core.codec.set_maximum_outbound_packet_size(MAXIMUM_VARIABLE_LENGTH_INTEGER as u32);
        self.core.codec.set_maximum_inbound_packet_size(options.maximum_packet_size_bytes.unwrap_or(MAXIMUM_VARIABLE_LENGTH_INTEGER as u32));
        if options.protocol_version.is_v5() {
            self.core.inbound_aliases.reset_for_new_connection(options.topic_alias_maximum.unwrap_or(0));
        }

        info!("[{} ms] connect - connecting as \"{}\" with clean start {}", self.core.elapsed_time_ms, connect.client_id, clean_start);

        self.ping_timeout_timepoint = None;
        self.disconnect_reason_code = DisconnectReasonCode::NormalDisconnection;
        self.core.queue_packet(ControlPacket::Connect(connect));
        self.core.change_state(SessionState::ConnectPending);

        Ok(())
    }

    fn check_operational(&self, operation: &str) -> DimqResult<()> {
        match self.core.state {
            SessionState::Active | SessionState::Reauthenticating => { Ok(()) }
            state => {
                warn!("[{} ms] {} - not allowed in state {}", self.core.elapsed_time_ms, operation, state);
                Err(DimqError::new_protocol_error(format!("{} not allowed in state {}", operation, state)))
            }
        }
    }

    /// Publishes an application message.  Returns the packet id assigned to a QoS 1 or 2
    /// publish, or zero for QoS 0.  Completion is reported through
    /// [`SessionEventHandler::on_publish_complete`].
    pub fn publish(&mut self, packet: PublishPacket, now: Instant) -> DimqResult<u16> {
        self.core.update_internal_clock(now);
        self.check_operational("publish")?;
        validate_topic_name(&packet.topic)?;

        let client_id =
            if let Some(settings) = &self.current_settings {
                if packet.qos > settings.maximum_qos {
                    warn!("[{} ms] publish - {} exceeds the broker's maximum qos", self.core.elapsed_time_ms, packet.qos);
                    return Err(DimqError::new_quota_exceeded(DisconnectReasonCode::QosNotSupported, "publish qos exceeds the broker's maximum"));
                }

                if packet.retain && !settings.retain_available {
                    warn!("[{} ms] publish - broker does not support retained messages", self.core.elapsed_time_ms);
                    return Err(DimqError::new_quota_exceeded(DisconnectReasonCode::RetainNotSupported, "broker does not support retained messages"));
                }

                Some(settings.client_id.clone())
            } else {
                None
            };

        if self.core.protocol_version().is_v5() {
            self.core.request_alias(&packet.topic, packet.topic_alias());
        }

        let origin = MessageOrigin {
            client_id,
            username: self.config.connect_options.username.clone(),
        };

        let delivery = Delivery {
            message: MessageStore::from_publish(&packet, origin, now).into_shared(None),
            qos: packet.qos,
            retain: packet.retain,
            subscription_identifiers: Vec::new(),
        };

        let packet_id = match self.inflight_out.enqueue(delivery, now, &mut self.core.outbound)? {
            EnqueueOutcome::Sent => { 0 }
            EnqueueOutcome::InFlight(packet_id) | EnqueueOutcome::Queued(Some(packet_id)) => { packet_id }
            EnqueueOutcome::Queued(None) => {
                return Err(DimqError::new_internal_state_error("queued publish has no packet id"));
            }
            EnqueueOutcome::Expired => {
                warn!("[{} ms] publish - message to \"{}\" expired before it could be sent", self.core.elapsed_time_ms, packet.topic);
                return Err(DimqError::new_packet_validation(PacketType::Publish, "message expired before it could be sent"));
            }
        };
        debug!("[{} ms] publish - queued {} publish to \"{}\" with packet id {}", self.core.elapsed_time_ms, packet.qos, packet.topic, packet_id);

        Ok(packet_id)
    }

    /// Queues a SUBSCRIBE, returning its packet id
    pub fn subscribe(&mut self, mut packet: SubscribePacket, now: Instant) -> DimqResult<u16> {
        self.core.update_internal_clock(now);
        self.check_operational("subscribe")?;

        if packet.subscriptions.is_empty() {
            return Err(DimqError::new_packet_validation(PacketType::Subscribe, "subscribe packet contains no subscriptions"));
        }

        for subscription in packet.subscriptions.iter() {
            validate_topic_filter(&subscription.topic_filter)?;
        }

        packet.packet_id = self.inflight_out.reserve_mid()?;
        self.pending_acks.insert(packet.packet_id, PacketType::Subscribe);

        let packet_id = packet.packet_id;
        self.core.queue_packet(ControlPacket::Subscribe(packet));

        Ok(packet_id)
    }

    /// Queues an UNSUBSCRIBE, returning its packet id
    pub fn unsubscribe(&mut self, mut packet: UnsubscribePacket, now: Instant) -> DimqResult<u16> {
        self.core.update_internal_clock(now);
        self.check_operational("unsubscribe")?;

        if packet.topic_filters.is_empty() {
            return Err(DimqError::new_packet_validation(PacketType::Unsubscribe, "unsubscribe packet contains no topic filters"));
        }

        for filter in packet.topic_filters.iter() {
            validate_topic_filter(filter)?;
        }

        packet.packet_id = self.inflight_out.reserve_mid()?;
        self.pending_acks.insert(packet.packet_id, PacketType::Unsubscribe);

        let packet_id = packet.packet_id;
        self.core.queue_packet(ControlPacket::Unsubscribe(packet));

        Ok(packet_id)
    }

    /// Queues a DISCONNECT.  The session becomes `Disconnected` once the packet has been flushed.
    pub fn disconnect(&mut self, packet: DisconnectPacket, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        if !self.core.is_established() {
            return Err(DimqError::new_protocol_error(format!("disconnect not allowed in state {}", self.core.state)));
        }

        info!("[{} ms] disconnect - disconnecting with reason {}", self.core.elapsed_time_ms, packet.reason_code);
        self.disconnect_reason_code = packet.reason_code;
        self.core.queue_packet(ControlPacket::Disconnect(packet));
        self.core.change_state(SessionState::Disconnecting);

        Ok(())
    }

    /// Starts MQTT5 re-authentication with the configured authentication method
    pub fn reauthenticate(&mut self, data: Option<&[u8]>, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        if self.core.state != SessionState::Active || !self.core.protocol_version().is_v5() {
            return Err(DimqError::new_protocol_error("re-authentication requires an active MQTT5 connection"));
        }

        let Some(method) = &self.config.connect_options.authentication_method else {
            return Err(DimqError::new_protocol_error("re-authentication requires an authentication method"));
        };

        let mut auth = AuthPacket {
            reason_code: AuthenticateReasonCode::ReAuthenticate,
            ..Default::default()
        };
        auth.properties.add(PropertyIdentifier::AuthenticationMethod, PropertyValue::String(method.clone()))?;
        if let Some(data) = data {
            auth.properties.add(PropertyIdentifier::AuthenticationData, PropertyValue::Binary(data.to_vec()))?;
        }

        self.core.queue_packet(ControlPacket::Auth(auth));
        self.core.change_state(SessionState::Reauthenticating);

        Ok(())
    }

    /// Decodes bytes read from the transport and processes every complete packet
    pub fn handle_incoming_bytes(&mut self, bytes: &[u8], now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        if self.core.state == SessionState::Disconnected || self.core.state == SessionState::New {
            return Err(DimqError::new_connection_closed("session has no connection"));
        }

        let result = self.core.decode(bytes).and_then(|_| self.process_inbound(now));
        self.fail_on_error(result)
    }

    /// Reads everything currently available from the transport and processes it
    pub fn receive(&mut self, transport: &mut dyn Transport, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        if self.core.state == SessionState::Disconnected || self.core.state == SessionState::New {
            return Err(DimqError::new_connection_closed("session has no connection"));
        }

        let result = self.core.receive(transport).and_then(|_| self.process_inbound(now));
        self.fail_on_error(result)
    }

    /// Runs time-based work: keep alive pings, the keep alive deadline and duplicate marking
    pub fn service(&mut self, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);

        if matches!(self.core.state, SessionState::Active | SessionState::Reauthenticating) {
            let result = self.service_keep_alive(now);
            self.fail_on_error(result)?;
        }

        let marked = self.inflight_out.retry_check(now, INFLIGHT_RETRY_HORIZON);
        if marked > 0 {
            debug!("[{} ms] service - marked {} stale publishes as duplicates", self.core.elapsed_time_ms, marked);
        }

        Ok(())
    }

    /// Serializes queued packets and writes as much as the transport accepts
    pub fn flush(&mut self, transport: &mut dyn Transport, now: Instant) -> DimqResult<FlushStatus> {
        self.core.update_internal_clock(now);

        let result = self.flush_internal(transport, now);
        let status = self.fail_on_error(result)?;

        if status == FlushStatus::Complete && self.core.state == SessionState::Disconnecting {
            self.end_connection();
            self.core.change_state(SessionState::Disconnected);
            self.core.handler.on_disconnect(self.disconnect_reason_code, None);
        }

        Ok(status)
    }

    fn flush_internal(&mut self, transport: &mut dyn Transport, now: Instant) -> DimqResult<FlushStatus> {
        if self.core.state != SessionState::Disconnected {
            let rejected = self.core.encode_outbound(now)?;
            self.core.discard_rejected(&mut self.inflight_out, rejected, now)?;
        }

        if !self.core.codec.has_pending_writes() {
            return Ok(FlushStatus::Complete);
        }

        self.core.flush(transport)
    }

    /// Reports that the transport failed or was closed underneath the session
    pub fn connection_lost(&mut self, now: Instant) {
        self.core.update_internal_clock(now);
        if self.core.state != SessionState::Disconnected && self.core.state != SessionState::New {
            self.fail(DimqError::new_connection_closed("transport connection lost"));
        }
    }

    /// Forcibly ends the session.  Every inflight flow is released and reported as discarded.
    pub fn close(&mut self, now: Instant) {
        self.core.update_internal_clock(now);
        info!("[{} ms] close - closing session", self.core.elapsed_time_ms);

        let was_connected = self.core.state != SessionState::Disconnected && self.core.state != SessionState::New;
        self.end_connection();
        self.core.codec.reset();
        self.core.outbound.clear();
        self.core.inbound.clear();

        let discarded : Vec<u16> = self.inflight_out.records().map(|record| record.mid).collect();
        self.inflight_out.clear();
        self.inflight_in.clear();
        for packet_id in discarded {
            self.core.handler.on_publish_complete(packet_id, PublishCompletion::Discarded);
        }

        if was_connected {
            self.core.change_state(SessionState::Disconnected);
            self.core.handler.on_disconnect(DisconnectReasonCode::NormalDisconnection, None);
        }
    }

    fn next_ping_timepoint(&self) -> Option<Instant> {
        let keep_alive = self.current_settings.as_ref().map_or(0, |settings| settings.server_keep_alive);
        if keep_alive == 0 || self.ping_timeout_timepoint.is_some() {
            return None;
        }

        Some(self.core.last_inbound.min(self.core.last_outbound) + Duration::from_secs(keep_alive as u64))
    }

    /// Earliest time at which [`service`](ClientSession::service) or
    /// [`flush`](ClientSession::flush) has work to do
    pub fn get_next_service_timepoint(&self, now: Instant) -> Option<Instant> {
        match self.core.state {
            SessionState::New => { None }
            SessionState::Disconnected => {
                if self.core.codec.has_pending_writes() {
                    Some(now)
                } else {
                    None
                }
            }
            SessionState::Active | SessionState::Reauthenticating => {
                let next_service_time = fold_optional_timepoint_min(&self.ping_timeout_timepoint, &self.next_ping_timepoint());
                if self.core.has_pending_output() {
                    fold_timepoint(&next_service_time, &now)
                } else {
                    next_service_time
                }
            }
            _ => {
                if self.core.has_pending_output() {
                    Some(now)
                } else {
                    None
                }
            }
        }
    }

    fn service_keep_alive(&mut self, now: Instant) -> DimqResult<()> {
        if let Some(ping_timeout) = &self.ping_timeout_timepoint {
            if &now >= ping_timeout {
                error!("[{} ms] service_keep_alive - keep alive timeout exceeded", self.core.elapsed_time_ms);
                return Err(DimqError::new_keepalive_timeout());
            }
        } else if let Some(next_ping) = self.next_ping_timepoint() {
            if now >= next_ping {
                debug!("[{} ms] service_keep_alive - next ping time reached, sending ping", self.core.elapsed_time_ms);
                self.core.queue_packet(ControlPacket::Pingreq(PingreqPacket {}));

                let keep_alive = self.current_settings.as_ref().map_or(0, |settings| settings.server_keep_alive) as u64;

                // nothing heard for 1.5 keep alive intervals is fatal regardless of ping timeout configuration
                let deadline = self.core.last_inbound + Duration::from_millis(keep_alive * 1500);
                let final_deadline = match self.config.ping_timeout {
                    Some(ping_timeout) => { deadline.min(now + ping_timeout) }
                    None => { deadline }
                };
                self.ping_timeout_timepoint = Some(final_deadline.max(now));
            }
        }

        Ok(())
    }

    fn fail_on_error<T>(&mut self, result: DimqResult<T>) -> DimqResult<T> {
        result.map_err(|error| self.fail(error))
    }

    fn fail(&mut self, error: DimqError) -> DimqError {
        self.end_connection();
        self.core.fail(error)
    }

    /// Drops per-connection bookkeeping.  Session state (inflight flows) survives.
    fn end_connection(&mut self) {
        for (packet_id, packet_type) in self.pending_acks.drain() {
            debug!("[{} ms] end_connection - abandoning {} with packet id {}", self.core.elapsed_time_ms, packet_type, packet_id);
            self.inflight_out.release_mid(packet_id);
        }

        self.ping_timeout_timepoint = None;
    }

    fn process_inbound(&mut self, now: Instant) -> DimqResult<()> {
        while let Some(packet) = self.core.inbound.pop_front() {
            self.core.last_inbound = now;
            log_packet("Received: ", &packet);

            self.handle_packet(packet, now)?;
            if self.core.state == SessionState::Disconnected {
                self.core.inbound.clear();
                break;
            }
        }

        Ok(())
    }

    fn handle_packet(&mut self, packet: ControlPacket, now: Instant) -> DimqResult<()> {
        match packet {
            ControlPacket::Connack(connack) => { self.handle_connack(connack, now) }
            ControlPacket::Publish(publish) => { self.handle_publish(publish, now) }
            ControlPacket::Puback(puback) => {
                self.check_incoming_ack(PacketType::Puback)?;
                self.core.apply_publish_ack(&mut self.inflight_out, puback.packet_id, AckType::Puback, PublishCompletion::Puback(puback.reason_code), now)
            }
            ControlPacket::Pubrec(pubrec) => {
                self.check_incoming_ack(PacketType::Pubrec)?;
                self.core.apply_publish_ack(&mut self.inflight_out, pubrec.packet_id, AckType::Pubrec(pubrec.reason_code), PublishCompletion::Pubrec(pubrec.reason_code), now)
            }
            ControlPacket::Pubcomp(pubcomp) => {
                self.check_incoming_ack(PacketType::Pubcomp)?;
                self.core.apply_publish_ack(&mut self.inflight_out, pubcomp.packet_id, AckType::Pubcomp, PublishCompletion::Pubcomp(pubcomp.reason_code), now)
            }
            ControlPacket::Pubrel(pubrel) => { self.handle_pubrel(pubrel, now) }
            ControlPacket::Suback(suback) => { self.handle_suback(suback) }
            ControlPacket::Unsuback(unsuback) => { self.handle_unsuback(unsuback) }
            ControlPacket::Pingresp(_) => { self.handle_pingresp() }
            ControlPacket::Disconnect(disconnect) => { self.handle_disconnect(disconnect) }
            ControlPacket::Auth(auth) => { self.handle_auth(auth) }
            packet => {
                error!("[{} ms] handle_packet - clients do not accept {} packets", self.core.elapsed_time_ms, packet.packet_type());
                Err(DimqError::new_protocol_error(format!("client received a {} packet", packet.packet_type())))
            }
        }
    }

    fn check_incoming_ack(&self, packet_type: PacketType) -> DimqResult<()> {
        match self.core.state {
            SessionState::Active | SessionState::Reauthenticating | SessionState::Disconnecting => { Ok(()) }
            state => {
                error!("[{} ms] check_incoming_ack - invalid state {} to receive a {}", self.core.elapsed_time_ms, state, packet_type);
                Err(DimqError::new_protocol_error(format!("invalid state to receive a {}", packet_type)))
            }
        }
    }

    fn handle_connack(&mut self, connack: ConnackPacket, now: Instant) -> DimqResult<()> {
        info!("[{} ms] handle_connack - processing CONNACK packet", self.core.elapsed_time_ms);

        if self.core.state != SessionState::ConnectPending && self.core.state != SessionState::Authenticating {
            error!("[{} ms] handle_connack - invalid state to receive a connack", self.core.elapsed_time_ms);
            return Err(DimqError::new_protocol_error("invalid state for connack receipt"));
        }

        if !connack.reason_code.is_success() {
            error!("[{} ms] handle_connack - connection rejected with reason code {}", self.core.elapsed_time_ms, connack.reason_code);
            return Err(DimqError::new_connection_rejected(connack.reason_code));
        }

        self.core.change_state(SessionState::Connected);
        self.has_connected_successfully = true;

        let settings = build_negotiated_settings(&self.config.connect_options, &connack, &self.current_settings);
        debug!("[{} ms] handle_connack - negotiated settings: {}", self.core.elapsed_time_ms, &settings);

        self.core.codec.set_maximum_outbound_packet_size(settings.maximum_packet_size_to_server);
        self.inflight_out.set_quota_maximum(settings.receive_maximum_from_server);
        if self.core.protocol_version().is_v5() {
            self.core.reset_outbound_aliases(settings.topic_alias_maximum_to_server);
        }

        let client_id = settings.client_id.clone();
        self.current_settings = Some(settings);
        self.ping_timeout_timepoint = None;

        if connack.session_present {
            info!("[{} ms] handle_connack - resuming session with {} outgoing and {} incoming flows", self.core.elapsed_time_ms, self.inflight_out.len(), self.inflight_in.len());
            self.inflight_out.reconnect_reset(now, &mut self.core.outbound)?;
            self.inflight_in.reconnect_reset(now, &mut self.core.outbound)?;
        } else {
            let discarded : Vec<u16> = self.inflight_out.records().map(|record| record.mid).collect();
            if !discarded.is_empty() {
                warn!("[{} ms] handle_connack - broker did not resume the session; discarding {} publishes", self.core.elapsed_time_ms, discarded.len());
            }

            self.inflight_out.clear();
            self.inflight_in.clear();
            for packet_id in discarded {
                self.core.handler.on_publish_complete(packet_id, PublishCompletion::Discarded);
            }
        }

        self.core.change_state(SessionState::Active);
        self.core.handler.on_connect(&client_id, connack.session_present);

        Ok(())
    }

    fn handle_publish(&mut self, mut publish: PublishPacket, now: Instant) -> DimqResult<()> {
        self.check_incoming_ack(PacketType::Publish)?;

        if self.core.protocol_version().is_v5() {
            self.core.inbound_aliases.resolve_publish_topic(&mut publish)?;
        }

        validate_topic_name(&publish.topic)?;

        match publish.qos {
            QualityOfService::AtMostOnce => {
                self.core.handler.on_message(&publish);
            }
            QualityOfService::AtLeastOnce => {
                self.core.handler.on_message(&publish);
                self.core.queue_packet(ControlPacket::Puback(PubackPacket {
                    packet_id: publish.packet_id,
                    ..Default::default()
                }));
            }
            QualityOfService::ExactlyOnce => {
                let delivery = Delivery {
                    message: MessageStore::from_publish(&publish, MessageOrigin::default(), now).into_shared(None),
                    qos: QualityOfService::ExactlyOnce,
                    retain: publish.retain,
                    subscription_identifiers: collect_subscription_identifiers(&publish),
                };

                if self.inflight_in.receive_qos2(publish.packet_id, delivery, now, &mut self.core.outbound)? == IncomingOutcome::Duplicate {
                    debug!("[{} ms] handle_publish - duplicate qos 2 publish {}", self.core.elapsed_time_ms, publish.packet_id);
                }
            }
        }

        Ok(())
    }

    fn handle_pubrel(&mut self, pubrel: PubrelPacket, now: Instant) -> DimqResult<()> {
        self.check_incoming_ack(PacketType::Pubrel)?;

        if let Some(record) = self.inflight_in.release_incoming(pubrel.packet_id, &mut self.core.outbound) {
            let publish = record.message.to_publish_packet(record.qos, record.mid, record.retain, &record.subscription_identifiers, now)?;
            self.core.handler.on_message(&publish);
        }

        Ok(())
    }

    fn take_pending_ack(&mut self, packet_id: u16, expected: PacketType, ack: PacketType) -> DimqResult<()> {
        if self.pending_acks.get(&packet_id) != Some(&expected) {
            error!("[{} ms] take_pending_ack - no pending {} matches {} packet id {}", self.core.elapsed_time_ms, expected, ack, packet_id);
            return Err(DimqError::new_protocol_error(format!("no pending {} for incoming {}", expected, ack)));
        }

        self.pending_acks.remove(&packet_id);
        self.inflight_out.release_mid(packet_id);
        Ok(())
    }

    fn handle_suback(&mut self, suback: SubackPacket) -> DimqResult<()> {
        info!("[{} ms] handle_suback - processing SUBACK packet", self.core.elapsed_time_ms);
        self.check_incoming_ack(PacketType::Suback)?;
        self.take_pending_ack(suback.packet_id, PacketType::Subscribe, PacketType::Suback)?;

        self.core.handler.on_subscribe(&suback);
        Ok(())
    }

    fn handle_unsuback(&mut self, unsuback: UnsubackPacket) -> DimqResult<()> {
        info!("[{} ms] handle_unsuback - processing UNSUBACK packet", self.core.elapsed_time_ms);
        self.check_incoming_ack(PacketType::Unsuback)?;
        self.take_pending_ack(unsuback.packet_id, PacketType::Unsubscribe, PacketType::Unsuback)?;

        self.core.handler.on_unsubscribe(&unsuback);
        Ok(())
    }

    fn handle_pingresp(&mut self) -> DimqResult<()> {
        self.check_incoming_ack(PacketType::Pingresp)?;

        if self.ping_timeout_timepoint.take().is_none() {
            error!("[{} ms] handle_pingresp - no matching PINGREQ", self.core.elapsed_time_ms);
            return Err(DimqError::new_protocol_error("pingresp received without an outstanding pingreq"));
        }

        Ok(())
    }

    fn handle_disconnect(&mut self, disconnect: DisconnectPacket) -> DimqResult<()> {
        if !self.core.protocol_version().is_v5() || !self.core.is_established() {
            error!("[{} ms] handle_disconnect - unexpected DISCONNECT from broker", self.core.elapsed_time_ms);
            return Err(DimqError::new_protocol_error("broker sent a disconnect"));
        }

        info!("[{} ms] handle_disconnect - broker disconnected with reason {}", self.core.elapsed_time_ms, disconnect.reason_code);
        self.end_connection();
        self.core.outbound.clear();
        self.core.change_state(SessionState::Disconnected);
        self.core.handler.on_disconnect(disconnect.reason_code, None);

        Ok(())
    }

    fn handle_auth(&mut self, auth: AuthPacket) -> DimqResult<()> {
        if !self.core.protocol_version().is_v5() {
            return Err(DimqError::new_protocol_error("auth packet on an mqtt3 connection"));
        }

        let Some(method) = self.config.connect_options.authentication_method.clone() else {
            error!("[{} ms] handle_auth - AUTH received without an authentication method", self.core.elapsed_time_ms);
            return Err(DimqError::new_protocol_error("auth packet received without extended authentication"));
        };

        if auth.properties.get_string(PropertyIdentifier::AuthenticationMethod) != Some(method.as_str()) {
            return Err(DimqError::new_protocol_error("auth packet authentication method mismatch"));
        }

        match (auth.reason_code, self.core.state) {
            (AuthenticateReasonCode::Success, SessionState::Reauthenticating) => {
                info!("[{} ms] handle_auth - re-authentication succeeded", self.core.elapsed_time_ms);
                self.core.change_state(SessionState::Active);
                Ok(())
            }
            (AuthenticateReasonCode::ContinueAuthentication, SessionState::ConnectPending | SessionState::Authenticating | SessionState::Reauthenticating) => {
                if self.core.state == SessionState::ConnectPending {
                    self.core.change_state(SessionState::Authenticating);
                }

                let challenge = auth.properties.get_binary(PropertyIdentifier::AuthenticationData);
                let Some(response) = self.core.handler.on_auth_challenge(&method, challenge) else {
                    warn!("[{} ms] handle_auth - authentication challenge abandoned", self.core.elapsed_time_ms);
                    return Err(DimqError::new_not_authorized("authentication challenge abandoned"));
                };

                let mut reply = AuthPacket {
                    reason_code: AuthenticateReasonCode::ContinueAuthentication,
                    ..Default::default()
                };
                reply.properties.add(PropertyIdentifier::AuthenticationMethod, PropertyValue::String(method))?;
                reply.properties.add(PropertyIdentifier::AuthenticationData, PropertyValue::Binary(response))?;
                self.core.queue_packet(ControlPacket::Auth(reply));

                Ok(())
            }
            (reason_code, state) => {
                error!("[{} ms] handle_auth - unexpected AUTH {} in state {}", self.core.elapsed_time_ms, reason_code, state);
                Err(DimqError::new_protocol_error("unexpected auth packet"))
            }
        }
    }
}
