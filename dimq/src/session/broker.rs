/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Broker role of the session state machine.

One [`BrokerSession`] exists per accepted network connection.  It validates the client's CONNECT
against the broker configuration and security chain, attaches to (or takes over) the client's
session in the shared [`BrokerContext`], routes inbound publishes through the context and drains
the session mailbox into the outgoing inflight queue when serviced.
 */

use crate::alias::OutboundAliasResolverFactory;
use crate::broker::*;
use crate::broker::security::*;
use crate::codec::{Codec, FlushStatus, MqttCodec};
use crate::error::{DimqError, DimqResult};
use crate::inflight::*;
use crate::logging::log_packet;
use crate::message::{MessageOrigin, MessageStore};
use crate::mqtt::*;
use crate::session::*;
use crate::topic::subscription::SubscriptionOptions;
use crate::topic::{validate_topic_filter, validate_topic_name};
use crate::transport::Transport;
use crate::fold_timepoint;

use log::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

/// A CONNECT held while MQTT5 extended authentication runs
struct PendingConnect {
    connect: ConnectPacket,
    assigned_client_id: bool,
    server_keep_alive: Option<u16>,
}

/// Broker side of one client connection
pub struct BrokerSession {
    core: SessionCore,

    context: Arc<BrokerContext>,

    connection_id: u64,

    client: ClientInfo,

    /// The attached session; `None` before CONNECT completes and after detaching
    slot: Option<Arc<SessionSlot>>,

    keep_alive_seconds: u16,

    /// Session expiry interval asked for in CONNECT, before the broker cap applies
    requested_session_expiry_interval: u32,

    authentication_method: Option<String>,

    pending_connect: Option<PendingConnect>,

    disconnect_reason_code: DisconnectReasonCode,
}

impl BrokerSession {

    /// Creates a session for a freshly accepted connection.  The first packet it accepts is
    /// CONNECT.
    pub fn new(context: Arc<BrokerContext>, handler: Box<dyn SessionEventHandler>, now: Instant) -> BrokerSession {
        let mut codec = Box::new(MqttCodec::new(ProtocolVersion::Mqtt311));
        codec.set_maximum_inbound_packet_size(context.config().maximum_packet_size());

        let outbound_aliases = OutboundAliasResolverFactory::new_lru_factory(u16::MAX)();
        let mut core = SessionCore::new(codec, handler, outbound_aliases, now);
        core.change_state(SessionState::ConnectPending);

        let connection_id = context.allocate_connection_id();
        debug!("BrokerSession new - accepted connection {}", connection_id);

        BrokerSession {
            core,
            context,
            connection_id,
            client: ClientInfo::default(),
            slot: None,
            keep_alive_seconds: 0,
            requested_session_expiry_interval: 0,
            authentication_method: None,
            pending_connect: None,
            disconnect_reason_code: DisconnectReasonCode::NormalDisconnection,
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.state
    }

    /// Client id of the connected client; empty until CONNECT has been accepted
    pub fn client_id(&self) -> &str {
        &self.client.client_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.core.protocol_version()
    }

    /// Keep alive in effect for the connection, after any server override
    pub fn keep_alive_seconds(&self) -> u16 {
        self.keep_alive_seconds
    }

    /// Decodes bytes read from the transport and processes every complete packet
    pub fn handle_incoming_bytes(&mut self, bytes: &[u8], now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        if self.core.state == SessionState::Disconnected {
            return Err(DimqError::new_connection_closed("connection already closed"));
        }

        let result = self.core.decode(bytes).and_then(|_| self.process_inbound(now));
        self.fail_on_error(result, now)
    }

    /// Reads everything currently available from the transport and processes it
    pub fn receive(&mut self, transport: &mut dyn Transport, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        if self.core.state == SessionState::Disconnected {
            return Err(DimqError::new_connection_closed("connection already closed"));
        }

        let result = self.core.receive(transport).and_then(|_| self.process_inbound(now));
        self.fail_on_error(result, now)
    }

    /// Moves mailbox deliveries into the outgoing inflight queue and enforces the keep alive
    pub fn service(&mut self, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);

        let result = match self.core.state {
            SessionState::Active | SessionState::Reauthenticating => { self.service_active(now) }
            SessionState::Authenticating => { self.service_keep_alive(now) }
            _ => { Ok(()) }
        };

        self.fail_on_error(result, now)
    }

    fn service_keep_alive(&mut self, now: Instant) -> DimqResult<()> {
        if let Some(deadline) = self.keep_alive_deadline() {
            if now >= deadline {
                error!("[{} ms] service_keep_alive - no packet from \"{}\" within one and a half keep alive intervals", self.core.elapsed_time_ms, self.client.client_id);
                return Err(DimqError::new_keepalive_timeout());
            }
        }

        Ok(())
    }

    fn service_active(&mut self, now: Instant) -> DimqResult<()> {
        self.service_keep_alive(now)?;
        self.drain_mailbox(now)
    }

    fn attached_slot(&self) -> DimqResult<Arc<SessionSlot>> {
        self.slot.clone().ok_or_else(|| DimqError::new_internal_state_error("connection has no attached session"))
    }

    fn drain_mailbox(&mut self, now: Instant) -> DimqResult<()> {
        let slot = self.attached_slot()?;
        let mut store = slot.lock_for(self.connection_id)?;

        // deliveries waiting for quota stay in the mailbox once the backlog is full
        let backlog_limit = self.context.config().maximum_queued_messages;
        let mut drained = 0;
        while store.inflight_out.queued_len() < backlog_limit {
            let Some(delivery) = slot.pop_delivery()? else {
                break;
            };

            drained += 1;
            if store.inflight_out.enqueue(delivery, now, &mut self.core.outbound)? == EnqueueOutcome::Expired {
                debug!("[{} ms] drain_mailbox - dropped an expired message", self.core.elapsed_time_ms);
            }
        }

        if drained > 0 {
            debug!("[{} ms] drain_mailbox - {} deliveries for \"{}\", {} waiting for quota", self.core.elapsed_time_ms, drained, self.client.client_id, store.inflight_out.queued_len());
        }

        let marked = store.inflight_out.retry_check(now, INFLIGHT_RETRY_HORIZON);
        if marked > 0 {
            debug!("[{} ms] drain_mailbox - marked {} stale deliveries as duplicates", self.core.elapsed_time_ms, marked);
        }

        Ok(())
    }

    /// Serializes queued packets and writes as much as the transport accepts
    pub fn flush(&mut self, transport: &mut dyn Transport, now: Instant) -> DimqResult<FlushStatus> {
        self.core.update_internal_clock(now);

        let result = self.flush_internal(transport, now);
        let status = self.fail_on_error(result, now)?;

        if status == FlushStatus::Complete && self.core.state == SessionState::Disconnecting {
            self.core.change_state(SessionState::Disconnected);
            let detached = self.detach(WillDisposition::Publish, now);
            self.core.handler.on_disconnect(self.disconnect_reason_code, None);
            detached?;
        }

        Ok(status)
    }

    fn flush_internal(&mut self, transport: &mut dyn Transport, now: Instant) -> DimqResult<FlushStatus> {
        if self.core.state != SessionState::Disconnected && !self.core.outbound.is_empty() {
            let rejected = self.core.encode_outbound(now)?;
            if !rejected.is_empty() {
                let slot = self.attached_slot()?;
                let mut store = slot.lock_for(self.connection_id)?;
                self.core.discard_rejected(&mut store.inflight_out, rejected, now)?;
            }
        }

        if !self.core.codec.has_pending_writes() {
            return Ok(FlushStatus::Complete);
        }

        self.core.flush(transport)
    }

    fn keep_alive_deadline(&self) -> Option<Instant> {
        if self.keep_alive_seconds == 0 {
            return None;
        }

        Some(self.core.last_inbound + Duration::from_millis(self.keep_alive_seconds as u64 * 1500))
    }

    /// Earliest time at which [`service`](BrokerSession::service) or
    /// [`flush`](BrokerSession::flush) has work to do
    pub fn get_next_service_timepoint(&self, now: Instant) -> Option<Instant> {
        if self.core.state == SessionState::Disconnected {
            return if self.core.codec.has_pending_writes() { Some(now) } else { None };
        }

        let next_service_time = self.keep_alive_deadline();
        let mailbox_ready = self.slot.as_ref().is_some_and(|slot| slot.queued_len() > 0 && self.has_backlog_room(slot));
        if self.core.has_pending_output() || mailbox_ready {
            fold_timepoint(&next_service_time, &now)
        } else {
            next_service_time
        }
    }

    fn has_backlog_room(&self, slot: &SessionSlot) -> bool {
        match slot.lock_for(self.connection_id) {
            Ok(store) => { store.inflight_out.queued_len() < self.context.config().maximum_queued_messages }
            Err(_) => { true }
        }
    }

    /// Starts a broker-initiated disconnect.  MQTT5 clients are sent a DISCONNECT first.  The
    /// will is published either way.
    pub fn disconnect(&mut self, reason_code: DisconnectReasonCode, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        if self.core.state == SessionState::Disconnected || self.core.state == SessionState::Disconnecting {
            return Ok(());
        }

        info!("[{} ms] disconnect - disconnecting \"{}\" with reason {}", self.core.elapsed_time_ms, self.client.client_id, reason_code);
        self.disconnect_reason_code = reason_code;
        if self.core.is_established() && self.core.protocol_version().is_v5() {
            self.core.queue_packet(ControlPacket::Disconnect(DisconnectPacket::new(reason_code)));
            self.core.change_state(SessionState::Disconnecting);
            return Ok(());
        }

        self.core.change_state(SessionState::Disconnected);
        let detached = self.detach(WillDisposition::Publish, now);
        self.core.handler.on_disconnect(reason_code, None);
        detached
    }

    /// Reports that the transport failed or was closed underneath the session.  The session
    /// goes offline and its will is scheduled.
    pub fn connection_lost(&mut self, now: Instant) {
        self.core.update_internal_clock(now);
        if self.core.state != SessionState::Disconnected {
            self.fail(DimqError::new_connection_closed("transport connection lost"), now);
        }
    }

    /// Forcibly ends the connection and the session behind it.  Inflight state and
    /// subscriptions are released and any will is published immediately.
    pub fn close(&mut self, now: Instant) -> DimqResult<()> {
        self.core.update_internal_clock(now);
        info!("[{} ms] close - closing connection {} for \"{}\"", self.core.elapsed_time_ms, self.connection_id, self.client.client_id);

        let was_connected = self.core.state != SessionState::Disconnected;
        self.core.codec.reset();
        self.core.outbound.clear();
        self.core.inbound.clear();

        let result =
            if let Some(slot) = self.slot.take() {
                if let Ok(mut store) = slot.lock_for(self.connection_id) {
                    store.inflight_in.clear();
                    store.inflight_out.clear();
                }

                self.context.remove_session(&self.client.client_id, self.connection_id, now)
            } else {
                Ok(())
            };

        if was_connected {
            self.core.change_state(SessionState::Disconnected);
            self.core.handler.on_disconnect(DisconnectReasonCode::AdministrativeAction, None);
        }

        result
    }

    fn fail_on_error<T>(&mut self, result: DimqResult<T>, now: Instant) -> DimqResult<T> {
        result.map_err(|error| self.fail(error, now))
    }

    fn fail(&mut self, error: DimqError, now: Instant) -> DimqError {
        let error = self.core.fail(error);
        if let Err(detach_error) = self.detach(WillDisposition::Publish, now) {
            warn!("[{} ms] fail - unable to detach session of \"{}\": {}", self.core.elapsed_time_ms, self.client.client_id, detach_error);
        }

        error
    }

    fn detach(&mut self, disposition: WillDisposition, now: Instant) -> DimqResult<()> {
        self.pending_connect = None;
        match self.slot.take() {
            Some(_) => { self.context.session_disconnected(&self.client.client_id, self.connection_id, disposition, now) }
            None => { Ok(()) }
        }
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
        match self.core.state {
            SessionState::ConnectPending => {
                if let ControlPacket::Connect(connect) = packet {
                    return self.handle_connect(connect, now);
                }

                error!("[{} ms] handle_packet - first packet was {} rather than CONNECT", self.core.elapsed_time_ms, packet.packet_type());
                Err(DimqError::new_protocol_error("first packet on a connection must be connect"))
            }
            SessionState::Authenticating => {
                if let ControlPacket::Auth(auth) = packet {
                    return self.handle_auth(auth, now);
                }

                error!("[{} ms] handle_packet - {} received during authentication", self.core.elapsed_time_ms, packet.packet_type());
                Err(DimqError::new_protocol_error("only auth packets are allowed during authentication"))
            }
            SessionState::Active | SessionState::Reauthenticating | SessionState::Disconnecting => {
                match packet {
                    ControlPacket::Publish(publish) => { self.handle_publish(publish, now) }
                    ControlPacket::Puback(puback) => {
                        self.handle_publish_ack(puback.packet_id, AckType::Puback, PublishCompletion::Puback(puback.reason_code), now)
                    }
                    ControlPacket::Pubrec(pubrec) => {
                        self.handle_publish_ack(pubrec.packet_id, AckType::Pubrec(pubrec.reason_code), PublishCompletion::Pubrec(pubrec.reason_code), now)
                    }
                    ControlPacket::Pubcomp(pubcomp) => {
                        self.handle_publish_ack(pubcomp.packet_id, AckType::Pubcomp, PublishCompletion::Pubcomp(pubcomp.reason_code), now)
                    }
                    ControlPacket::Pubrel(pubrel) => { self.handle_pubrel(pubrel, now) }
                    ControlPacket::Subscribe(subscribe) => { self.handle_subscribe(subscribe, now) }
                    ControlPacket::Unsubscribe(unsubscribe) => { self.handle_unsubscribe(unsubscribe) }
                    ControlPacket::Pingreq(_) => {
                        self.core.queue_packet(ControlPacket::Pingresp(PingrespPacket {}));
                        Ok(())
                    }
                    ControlPacket::Disconnect(disconnect) => { self.handle_disconnect(disconnect, now) }
                    ControlPacket::Auth(auth) => { self.handle_auth(auth, now) }
                    packet => {
                        error!("[{} ms] handle_packet - brokers do not accept {} packets here", self.core.elapsed_time_ms, packet.packet_type());
                        Err(DimqError::new_protocol_error(format!("broker received an unexpected {} packet", packet.packet_type())))
                    }
                }
            }
            state => {
                error!("[{} ms] handle_packet - {} received in state {}", self.core.elapsed_time_ms, packet.packet_type(), state);
                Err(DimqError::new_protocol_error("packet received in an invalid state"))
            }
        }
    }

    /// Answers the CONNECT with a failing CONNACK and produces the error that closes the
    /// connection
    fn reject_connect(&mut self, reason_code: ConnectReasonCode) -> DimqError {
        warn!("[{} ms] reject_connect - rejecting connection {} with {}", self.core.elapsed_time_ms, self.connection_id, reason_code);
        self.core.queue_final_packet(ControlPacket::Connack(ConnackPacket {
            session_present: false,
            reason_code,
            ..Default::default()
        }));

        DimqError::new_connection_rejected(reason_code)
    }

    fn handle_connect(&mut self, mut connect: ConnectPacket, now: Instant) -> DimqResult<()> {
        info!("[{} ms] handle_connect - processing {} CONNECT from \"{}\"", self.core.elapsed_time_ms, connect.protocol_version, connect.client_id);

        let version = connect.protocol_version;
        let config = self.context.config().clone();
        self.core.codec.set_protocol_version(version);

        let mut assigned_client_id = false;
        if connect.client_id.is_empty() {
            if version == ProtocolVersion::Mqtt31 || (!version.is_v5() && !connect.clean_start) {
                return Err(self.reject_connect(ConnectReasonCode::ClientIdentifierNotValid));
            }

            connect.client_id = self.context.assign_client_id();
            assigned_client_id = true;
            debug!("[{} ms] handle_connect - assigned client id \"{}\"", self.core.elapsed_time_ms, connect.client_id);
        }

        let mut keep_alive = connect.keep_alive_interval_seconds;
        let mut server_keep_alive = None;
        if config.maximum_keep_alive > 0 && (keep_alive == 0 || keep_alive > config.maximum_keep_alive) {
            if !version.is_v5() {
                return Err(self.reject_connect(ConnectReasonCode::ClientIdentifierNotValid));
            }

            keep_alive = config.maximum_keep_alive;
            server_keep_alive = Some(keep_alive);
        }

        if let Some(will) = &connect.will {
            if validate_topic_name(&will.topic).is_err() {
                return Err(self.reject_connect(ConnectReasonCode::TopicNameInvalid));
            }

            if will.qos > config.maximum_qos {
                return Err(self.reject_connect(ConnectReasonCode::QosNotSupported));
            }

            if will.retain && !config.retain_available {
                return Err(self.reject_connect(ConnectReasonCode::RetainNotSupported));
            }
        }

        let decision = self.context.security().check_credentials(&connect.client_id, connect.username.as_deref(), connect.password.as_deref());
        if decision != AuthDecision::Allow {
            let reason_code =
                if connect.username.is_some() || connect.password.is_some() {
                    ConnectReasonCode::BadUsernameOrPassword
                } else {
                    ConnectReasonCode::NotAuthorized
                };
            return Err(self.reject_connect(reason_code));
        }

        self.client = ClientInfo {
            client_id: connect.client_id.clone(),
            username: connect.username.clone(),
            protocol_version: version,
        };
        self.keep_alive_seconds = keep_alive;

        if version.is_v5() {
            self.core.inbound_aliases.reset_for_new_connection(config.topic_alias_maximum);
            self.core.reset_outbound_aliases(connect.topic_alias_maximum());
            self.core.codec.set_maximum_outbound_packet_size(connect.maximum_packet_size().unwrap_or(0));

            if let Some(method) = connect.authentication_method().map(|method| method.to_string()) {
                let data = connect.properties.get_binary(PropertyIdentifier::AuthenticationData).map(|data| data.to_vec());
                self.authentication_method = Some(method.clone());

                let pending = PendingConnect {
                    connect,
                    assigned_client_id,
                    server_keep_alive,
                };

                return match self.context.security().authenticate(&self.client.client_id, &method, data.as_deref(), false) {
                    ExtendedAuthResult::Success(response) => { self.finish_connect(pending, response, now) }
                    ExtendedAuthResult::Continue(challenge) => {
                        info!("[{} ms] handle_connect - starting {} authentication for \"{}\"", self.core.elapsed_time_ms, method, self.client.client_id);
                        self.pending_connect = Some(pending);
                        self.send_auth(AuthenticateReasonCode::ContinueAuthentication, Some(challenge))?;
                        self.core.change_state(SessionState::Authenticating);
                        Ok(())
                    }
                    ExtendedAuthResult::Deny => { Err(self.reject_connect(ConnectReasonCode::NotAuthorized)) }
                    ExtendedAuthResult::Defer => { Err(self.reject_connect(ConnectReasonCode::BadAuthenticationMethod)) }
                };
            }
        }

        let pending = PendingConnect {
            connect,
            assigned_client_id,
            server_keep_alive,
        };

        self.finish_connect(pending, None, now)
    }

    fn finish_connect(&mut self, pending: PendingConnect, authentication_data: Option<Vec<u8>>, now: Instant) -> DimqResult<()> {
        let PendingConnect { mut connect, assigned_client_id, server_keep_alive } = pending;
        let config = self.context.config().clone();
        let version = connect.protocol_version;

        let requested_session_expiry =
            if version.is_v5() {
                connect.session_expiry_interval_seconds()
            } else if connect.clean_start {
                0
            } else {
                u32::MAX
            };
        let session_expiry_interval = config.effective_session_expiry(requested_session_expiry);

        let request = SessionRequest {
            client: self.client.clone(),
            clean_start: connect.clean_start,
            session_expiry_interval,
            will: connect.will.take(),
        };

        let attachment = self.context.connect_session(request, self.connection_id, now)?;
        self.slot = Some(attachment.slot.clone());
        self.requested_session_expiry_interval = requested_session_expiry;
        self.core.change_state(SessionState::Connected);

        let mut connack = ConnackPacket {
            session_present: attachment.session_present,
            reason_code: ConnectReasonCode::Success,
            ..Default::default()
        };

        if version.is_v5() {
            let properties = &mut connack.properties;
            if assigned_client_id {
                properties.add(PropertyIdentifier::AssignedClientIdentifier, PropertyValue::String(self.client.client_id.clone()))?;
            }

            if let Some(keep_alive) = server_keep_alive {
                properties.add(PropertyIdentifier::ServerKeepAlive, PropertyValue::U16(keep_alive))?;
            }

            if session_expiry_interval != requested_session_expiry {
                properties.add(PropertyIdentifier::SessionExpiryInterval, PropertyValue::U32(session_expiry_interval))?;
            }

            if config.receive_maximum != u16::MAX {
                properties.add(PropertyIdentifier::ReceiveMaximum, PropertyValue::U16(config.receive_maximum))?;
            }

            if config.maximum_qos != QualityOfService::ExactlyOnce {
                properties.add(PropertyIdentifier::MaximumQos, PropertyValue::Byte(config.maximum_qos as u8))?;
            }

            if !config.retain_available {
                properties.add(PropertyIdentifier::RetainAvailable, PropertyValue::Byte(0))?;
            }

            if config.maximum_packet_size > 0 {
                properties.add(PropertyIdentifier::MaximumPacketSize, PropertyValue::U32(config.maximum_packet_size))?;
            }

            if config.topic_alias_maximum > 0 {
                properties.add(PropertyIdentifier::TopicAliasMaximum, PropertyValue::U16(config.topic_alias_maximum))?;
            }

            if let Some(method) = &self.authentication_method {
                properties.add(PropertyIdentifier::AuthenticationMethod, PropertyValue::String(method.clone()))?;
                if let Some(data) = authentication_data {
                    properties.add(PropertyIdentifier::AuthenticationData, PropertyValue::Binary(data))?;
                }
            }
        }

        self.core.queue_packet(ControlPacket::Connack(connack));

        {
            let mut store = attachment.slot.lock_for(self.connection_id)?;
            let store = &mut *store;
            store.inflight_out.set_quota_maximum(connect.receive_maximum());

            if attachment.session_present {
                info!("[{} ms] finish_connect - resuming session for \"{}\"", self.core.elapsed_time_ms, self.client.client_id);
                store.inflight_out.reconnect_reset(now, &mut self.core.outbound)?;
                store.inflight_in.reconnect_reset(now, &mut self.core.outbound)?;
            } else {
                store.inflight_out.clear();
                store.inflight_in.clear();
            }
        }

        self.core.change_state(SessionState::Active);
        self.core.handler.on_connect(&self.client.client_id, attachment.session_present);

        self.drain_mailbox(now)
    }

    fn send_auth(&mut self, reason_code: AuthenticateReasonCode, data: Option<Vec<u8>>) -> DimqResult<()> {
        let mut auth = AuthPacket {
            reason_code,
            ..Default::default()
        };

        if let Some(method) = &self.authentication_method {
            auth.properties.add(PropertyIdentifier::AuthenticationMethod, PropertyValue::String(method.clone()))?;
        }

        if let Some(data) = data {
            auth.properties.add(PropertyIdentifier::AuthenticationData, PropertyValue::Binary(data))?;
        }

        self.core.queue_packet(ControlPacket::Auth(auth));
        Ok(())
    }

    fn handle_auth(&mut self, auth: AuthPacket, now: Instant) -> DimqResult<()> {
        let Some(method) = self.authentication_method.clone() else {
            error!("[{} ms] handle_auth - AUTH from \"{}\" without extended authentication", self.core.elapsed_time_ms, self.client.client_id);
            return Err(DimqError::new_protocol_error("auth packet without extended authentication"));
        };

        if auth.properties.get_string(PropertyIdentifier::AuthenticationMethod) != Some(method.as_str()) {
            return Err(DimqError::new_protocol_error("auth packet authentication method mismatch"));
        }

        let continuing = match (self.core.state, auth.reason_code) {
            (SessionState::Authenticating | SessionState::Reauthenticating, AuthenticateReasonCode::ContinueAuthentication) => { true }
            (SessionState::Active, AuthenticateReasonCode::ReAuthenticate) => {
                self.core.change_state(SessionState::Reauthenticating);
                false
            }
            (state, reason_code) => {
                error!("[{} ms] handle_auth - unexpected AUTH {} in state {}", self.core.elapsed_time_ms, reason_code, state);
                return Err(DimqError::new_protocol_error("unexpected auth packet"));
            }
        };

        let data = auth.properties.get_binary(PropertyIdentifier::AuthenticationData);
        let result = self.context.security().authenticate(&self.client.client_id, &method, data, continuing);

        if self.core.state == SessionState::Authenticating {
            return match result {
                ExtendedAuthResult::Success(response) => {
                    match self.pending_connect.take() {
                        Some(pending) => { self.finish_connect(pending, response, now) }
                        None => { Err(DimqError::new_internal_state_error("authentication finished without a pending connect")) }
                    }
                }
                ExtendedAuthResult::Continue(challenge) => {
                    self.send_auth(AuthenticateReasonCode::ContinueAuthentication, Some(challenge))
                }
                ExtendedAuthResult::Deny => { Err(self.reject_connect(ConnectReasonCode::NotAuthorized)) }
                ExtendedAuthResult::Defer => { Err(self.reject_connect(ConnectReasonCode::BadAuthenticationMethod)) }
            };
        }

        match result {
            ExtendedAuthResult::Success(response) => {
                info!("[{} ms] handle_auth - \"{}\" re-authenticated", self.core.elapsed_time_ms, self.client.client_id);
                self.send_auth(AuthenticateReasonCode::Success, response)?;
                self.core.change_state(SessionState::Active);
                Ok(())
            }
            ExtendedAuthResult::Continue(challenge) => {
                self.send_auth(AuthenticateReasonCode::ContinueAuthentication, Some(challenge))
            }
            ExtendedAuthResult::Deny | ExtendedAuthResult::Defer => {
                warn!("[{} ms] handle_auth - re-authentication of \"{}\" failed", self.core.elapsed_time_ms, self.client.client_id);
                Err(DimqError::new_not_authorized("re-authentication failed"))
            }
        }
    }

    fn handle_publish(&mut self, mut publish: PublishPacket, now: Instant) -> DimqResult<()> {
        let config = self.context.config();
        if publish.qos > config.maximum_qos {
            error!("[{} ms] handle_publish - {} publish exceeds the maximum qos", self.core.elapsed_time_ms, publish.qos);
            return Err(DimqError::new_quota_exceeded(DisconnectReasonCode::QosNotSupported, "publish qos exceeds the broker maximum"));
        }

        if publish.retain && !config.retain_available {
            error!("[{} ms] handle_publish - retained publish while retain is unavailable", self.core.elapsed_time_ms);
            return Err(DimqError::new_quota_exceeded(DisconnectReasonCode::RetainNotSupported, "retained messages are not supported"));
        }

        if self.core.protocol_version().is_v5() {
            self.core.inbound_aliases.resolve_publish_topic(&mut publish)?;
        }

        validate_topic_name(&publish.topic)?;

        if self.context.security().check_acl(&self.client, &publish.topic, AclAccess::Write) != AuthDecision::Allow {
            warn!("[{} ms] handle_publish - \"{}\" may not publish to \"{}\"", self.core.elapsed_time_ms, self.client.client_id, publish.topic);
            match publish.qos {
                QualityOfService::AtMostOnce => {}
                QualityOfService::AtLeastOnce => {
                    self.core.queue_packet(ControlPacket::Puback(PubackPacket {
                        packet_id: publish.packet_id,
                        reason_code: PubackReasonCode::NotAuthorized,
                        ..Default::default()
                    }));
                }
                QualityOfService::ExactlyOnce => {
                    self.core.queue_packet(ControlPacket::Pubrec(PubrecPacket {
                        packet_id: publish.packet_id,
                        reason_code: PubrecReasonCode::NotAuthorized,
                        ..Default::default()
                    }));
                }
            }

            return Ok(());
        }

        let origin = MessageOrigin {
            client_id: Some(self.client.client_id.clone()),
            username: self.client.username.clone(),
        };

        match publish.qos {
            QualityOfService::AtMostOnce => {
                let message = MessageStore::from_publish(&publish, origin, now).into_shared(self.context.persistence_for(publish.qos, publish.retain));
                self.core.handler.on_message(&publish);
                self.context.publish(message, now)?;
            }
            QualityOfService::AtLeastOnce => {
                let message = MessageStore::from_publish(&publish, origin, now).into_shared(self.context.persistence_for(publish.qos, publish.retain));
                self.core.handler.on_message(&publish);

                let deliveries = self.context.publish(message, now)?;
                let reason_code =
                    if deliveries == 0 && self.core.protocol_version().is_v5() {
                        PubackReasonCode::NoMatchingSubscribers
                    } else {
                        PubackReasonCode::Success
                    };

                self.core.queue_packet(ControlPacket::Puback(PubackPacket {
                    packet_id: publish.packet_id,
                    reason_code,
                    ..Default::default()
                }));
            }
            QualityOfService::ExactlyOnce => {
                let slot = self.attached_slot()?;
                let mut store = slot.lock_for(self.connection_id)?;

                // retransmissions are only re-acknowledged, so they never reach the persistence hook
                let persistence = if store.inflight_in.get(publish.packet_id).is_some() { None } else { self.context.persistence_for(publish.qos, publish.retain) };
                let message = MessageStore::from_publish(&publish, origin, now).into_shared(persistence);
                let delivery = Delivery {
                    message,
                    qos: QualityOfService::ExactlyOnce,
                    retain: publish.retain,
                    subscription_identifiers: Vec::new(),
                };

                if store.inflight_in.receive_qos2(publish.packet_id, delivery, now, &mut self.core.outbound)? == IncomingOutcome::Duplicate {
                    debug!("[{} ms] handle_publish - duplicate qos 2 publish {} from \"{}\"", self.core.elapsed_time_ms, publish.packet_id, self.client.client_id);
                }
            }
        }

        Ok(())
    }

    fn handle_pubrel(&mut self, pubrel: PubrelPacket, now: Instant) -> DimqResult<()> {
        let slot = self.attached_slot()?;
        let released = slot.lock_for(self.connection_id)?.inflight_in.release_incoming(pubrel.packet_id, &mut self.core.outbound);

        if let Some(record) = released {
            let publish = record.message.to_publish_packet(record.qos, record.mid, record.retain, &[], now)?;
            self.core.handler.on_message(&publish);
            self.context.publish(record.message, now)?;
        }

        Ok(())
    }

    fn handle_publish_ack(&mut self, packet_id: u16, ack: AckType, completion: PublishCompletion, now: Instant) -> DimqResult<()> {
        let slot = self.attached_slot()?;
        let mut store = slot.lock_for(self.connection_id)?;
        self.core.apply_publish_ack(&mut store.inflight_out, packet_id, ack, completion, now)
    }

    fn handle_subscribe(&mut self, subscribe: SubscribePacket, now: Instant) -> DimqResult<()> {
        info!("[{} ms] handle_subscribe - \"{}\" subscribing to {} filters", self.core.elapsed_time_ms, self.client.client_id, subscribe.subscriptions.len());

        let is_v5 = self.core.protocol_version().is_v5();
        let maximum_qos = self.context.config().maximum_qos();
        let upgrade_outgoing_qos = self.context.config().upgrade_outgoing_qos;
        let subscription_identifier = subscribe.subscription_identifier();

        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut replays = Vec::new();

        for subscription in subscribe.subscriptions.iter() {
            let filter = subscription.topic_filter.as_str();
            if validate_topic_filter(filter).is_err() {
                warn!("[{} ms] handle_subscribe - invalid topic filter \"{}\"", self.core.elapsed_time_ms, filter);
                reason_codes.push(if is_v5 { SubackReasonCode::TopicFilterInvalid } else { SubackReasonCode::UnspecifiedError });
                continue;
            }

            if self.context.security().check_acl(&self.client, filter, AclAccess::Subscribe) != AuthDecision::Allow {
                warn!("[{} ms] handle_subscribe - \"{}\" may not subscribe to \"{}\"", self.core.elapsed_time_ms, self.client.client_id, filter);
                reason_codes.push(if is_v5 { SubackReasonCode::NotAuthorized } else { SubackReasonCode::UnspecifiedError });
                continue;
            }

            let granted_qos = subscription.qos.min(maximum_qos);
            let options = SubscriptionOptions::from_subscription(subscription);
            let is_new = match self.context.subscribe(&self.client.client_id, filter, granted_qos, options, subscription_identifier) {
                Ok(is_new) => { is_new }
                Err(DimqError::InvalidTopicFilter(_)) => {
                    reason_codes.push(if is_v5 { SubackReasonCode::TopicFilterInvalid } else { SubackReasonCode::UnspecifiedError });
                    continue;
                }
                Err(error) => { return Err(error); }
            };

            reason_codes.push(SubackReasonCode::from_granted_qos(granted_qos));

            let replay = match options.retain_handling {
                RetainHandlingType::SendOnSubscribe => { true }
                RetainHandlingType::SendOnSubscribeIfNew => { is_new }
                RetainHandlingType::DontSend => { false }
            };

            if replay {
                for message in self.context.retained_for(filter, now)? {
                    if self.context.security().check_acl(&self.client, message.topic(), AclAccess::Read) != AuthDecision::Allow {
                        continue;
                    }

                    let qos = if upgrade_outgoing_qos { granted_qos } else { message.qos().min(granted_qos) };
                    replays.push(Delivery {
                        message,
                        qos,
                        retain: true,
                        subscription_identifiers: subscription_identifier.into_iter().collect(),
                    });
                }
            }
        }

        let suback = SubackPacket {
            packet_id: subscribe.packet_id,
            reason_codes,
            ..Default::default()
        };
        self.core.handler.on_subscribe(&suback);
        self.core.queue_packet(ControlPacket::Suback(suback));

        if !replays.is_empty() {
            debug!("[{} ms] handle_subscribe - replaying {} retained messages", self.core.elapsed_time_ms, replays.len());
            let slot = self.attached_slot()?;
            let mut store = slot.lock_for(self.connection_id)?;
            for delivery in replays {
                store.inflight_out.enqueue(delivery, now, &mut self.core.outbound)?;
            }
        }

        Ok(())
    }

    fn handle_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> DimqResult<()> {
        info!("[{} ms] handle_unsubscribe - \"{}\" unsubscribing from {} filters", self.core.elapsed_time_ms, self.client.client_id, unsubscribe.topic_filters.len());

        let mut reason_codes = Vec::with_capacity(unsubscribe.topic_filters.len());
        for filter in unsubscribe.topic_filters.iter() {
            if validate_topic_filter(filter).is_err() {
                reason_codes.push(UnsubackReasonCode::TopicFilterInvalid);
                continue;
            }

            if self.context.security().check_acl(&self.client, filter, AclAccess::Unsubscribe) != AuthDecision::Allow {
                warn!("[{} ms] handle_unsubscribe - \"{}\" may not unsubscribe from \"{}\"", self.core.elapsed_time_ms, self.client.client_id, filter);
                reason_codes.push(UnsubackReasonCode::NotAuthorized);
                continue;
            }

            let existed = self.context.unsubscribe(&self.client.client_id, filter)?;
            reason_codes.push(if existed { UnsubackReasonCode::Success } else { UnsubackReasonCode::NoSubscriptionExisted });
        }

        let unsuback = UnsubackPacket {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            ..Default::default()
        };
        self.core.handler.on_unsubscribe(&unsuback);
        self.core.queue_packet(ControlPacket::Unsuback(unsuback));

        Ok(())
    }

    fn handle_disconnect(&mut self, disconnect: DisconnectPacket, now: Instant) -> DimqResult<()> {
        info!("[{} ms] handle_disconnect - \"{}\" disconnected with reason {}", self.core.elapsed_time_ms, self.client.client_id, disconnect.reason_code);

        if self.core.protocol_version().is_v5() {
            if let Some(session_expiry_interval) = disconnect.properties.get_u32(PropertyIdentifier::SessionExpiryInterval) {
                if self.requested_session_expiry_interval == 0 && session_expiry_interval != 0 {
                    error!("[{} ms] handle_disconnect - session expiry cannot be set on a session that connected without one", self.core.elapsed_time_ms);
                    return Err(DimqError::new_protocol_error("disconnect set a session expiry after connecting with none"));
                }

                self.context.update_session_expiry(&self.client.client_id, self.connection_id, session_expiry_interval)?;
            }
        }

        let disposition =
            if disconnect.reason_code == DisconnectReasonCode::DisconnectWithWillMessage {
                WillDisposition::Publish
            } else {
                WillDisposition::Discard
            };

        self.core.outbound.clear();
        self.core.change_state(SessionState::Disconnected);
        let detached = self.detach(disposition, now);
        self.core.handler.on_disconnect(disconnect.reason_code, None);

        detached
    }
}
