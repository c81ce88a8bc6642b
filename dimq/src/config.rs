/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the configuration types for client sessions and broker contexts.

All configuration is built programmatically through builders; nothing here reads files.
 */

use crate::alias::OutboundAliasResolverFactoryFn;
use crate::error::DimqResult;
use crate::mqtt::*;

use std::fmt;
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS : u16 = 60;

/// Configuration options that determine the field values of the CONNECT packet a client
/// session sends on each connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {

    pub(crate) protocol_version: ProtocolVersion,

    pub(crate) client_id: String,

    pub(crate) keep_alive_interval_seconds: u16,

    pub(crate) clean_start: bool,

    pub(crate) session_expiry_interval_seconds: Option<u32>,

    pub(crate) receive_maximum: Option<u16>,

    pub(crate) maximum_packet_size_bytes: Option<u32>,

    pub(crate) topic_alias_maximum: Option<u16>,

    pub(crate) username: Option<String>,

    pub(crate) password: Option<Vec<u8>>,

    pub(crate) will: Option<WillMessage>,

    pub(crate) will_delay_interval_seconds: Option<u32>,

    pub(crate) authentication_method: Option<String>,

    pub(crate) authentication_data: Option<Vec<u8>>,

    pub(crate) user_properties: Vec<(String, String)>,
}

impl ConnectOptions {

    /// Creates a new builder for ConnectOptions
    pub fn builder() -> ConnectOptionsBuilder {
        ConnectOptionsBuilder::new()
    }

    /// Returns the client id currently configured in these options
    pub fn client_id(&self) -> &str { &self.client_id }

    /// Returns the protocol version the session will speak
    pub fn protocol_version(&self) -> ProtocolVersion { self.protocol_version }

    pub(crate) fn to_connect_packet(&self, clean_start: bool) -> DimqResult<ConnectPacket> {
        let mut properties = PropertyList::new();
        let mut will = self.will.clone();

        if self.protocol_version.is_v5() {
            if let Some(session_expiry) = self.session_expiry_interval_seconds {
                properties.add(PropertyIdentifier::SessionExpiryInterval, PropertyValue::U32(session_expiry))?;
            }

            if let Some(receive_maximum) = self.receive_maximum {
                properties.add(PropertyIdentifier::ReceiveMaximum, PropertyValue::U16(receive_maximum))?;
            }

            if let Some(maximum_packet_size) = self.maximum_packet_size_bytes {
                properties.add(PropertyIdentifier::MaximumPacketSize, PropertyValue::U32(maximum_packet_size))?;
            }

            if let Some(topic_alias_maximum) = self.topic_alias_maximum {
                properties.add(PropertyIdentifier::TopicAliasMaximum, PropertyValue::U16(topic_alias_maximum))?;
            }

            if let Some(method) = &self.authentication_method {
                properties.add(PropertyIdentifier::AuthenticationMethod, PropertyValue::String(method.clone()))?;
                if let Some(data) = &self.authentication_data {
                    properties.add(PropertyIdentifier::AuthenticationData, PropertyValue::Binary(data.clone()))?;
                }
            }

            for (name, value) in &self.user_properties {
                properties.add_user_property(name, value);
            }

            if let (Some(will), Some(delay)) = (&mut will, self.will_delay_interval_seconds) {
                will.properties.set(PropertyIdentifier::WillDelayInterval, PropertyValue::U32(delay))?;
            }
        } else if let Some(will) = &mut will {
            will.properties = PropertyList::new();
        }

        Ok(ConnectPacket {
            protocol_version: self.protocol_version,
            clean_start,
            keep_alive_interval_seconds: self.keep_alive_interval_seconds,
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            will,
            properties,
        })
    }
}

impl Default for ConnectOptions {

    /// Creates a ConnectOptions object with default values.
    ///
    /// Keep alive is set to a non-zero default rather than zero, which would disable keep alive.
    fn default() -> Self {
        ConnectOptions {
            protocol_version: ProtocolVersion::Mqtt5,
            client_id: String::new(),
            keep_alive_interval_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
            clean_start: true,
            session_expiry_interval_seconds: None,
            receive_maximum: None,
            maximum_packet_size_bytes: None,
            topic_alias_maximum: None,
            username: None,
            password: None,
            will: None,
            will_delay_interval_seconds: None,
            authentication_method: None,
            authentication_data: None,
            user_properties: Vec::new(),
        }
    }
}

/// A builder for connection-related options on a client session.
#[derive(Debug, Default)]
pub struct ConnectOptionsBuilder {
    options: ConnectOptions
}

impl ConnectOptionsBuilder {

    /// Creates a new builder object for ConnectOptions
    pub fn new() -> Self {
        ConnectOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the protocol version the session speaks.  Defaults to MQTT5.
    pub fn with_protocol_version(&mut self, protocol_version: ProtocolVersion) -> &mut Self {
        self.options.protocol_version = protocol_version;
        self
    }

    /// Sets the client id.  An empty client id asks the broker to assign one.
    pub fn with_client_id(&mut self, client_id: &str) -> &mut Self {
        self.options.client_id = client_id.to_string();
        self
    }

    /// Sets the maximum interval, in seconds, between two packets sent by the client.  Zero
    /// disables keep alive.
    pub fn with_keep_alive_interval_seconds(&mut self, keep_alive: u16) -> &mut Self {
        self.options.keep_alive_interval_seconds = keep_alive;
        self
    }

    /// Sets whether the first connection attempt discards any existing session.  Subsequent
    /// reconnects after a successful connection always attempt to resume.
    pub fn with_clean_start(&mut self, clean_start: bool) -> &mut Self {
        self.options.clean_start = clean_start;
        self
    }

    /// Sets the time interval, in seconds, the broker should keep the session after the
    /// connection closes.  MQTT5 only.
    pub fn with_session_expiry_interval_seconds(&mut self, session_expiry_interval_seconds: u32) -> &mut Self {
        self.options.session_expiry_interval_seconds = Some(session_expiry_interval_seconds);
        self
    }

    /// Sets the maximum number of unacknowledged QoS 1 and 2 publishes the client accepts
    pub fn with_receive_maximum(&mut self, receive_maximum: u16) -> &mut Self {
        self.options.receive_maximum = Some(receive_maximum);
        self
    }

    /// Sets the largest packet the client is willing to receive
    pub fn with_maximum_packet_size_bytes(&mut self, maximum_packet_size_bytes: u32) -> &mut Self {
        self.options.maximum_packet_size_bytes = Some(maximum_packet_size_bytes);
        self
    }

    /// Sets the highest topic alias the broker may use on publishes sent to the client
    pub fn with_topic_alias_maximum(&mut self, topic_alias_maximum: u16) -> &mut Self {
        self.options.topic_alias_maximum = Some(topic_alias_maximum);
        self
    }

    /// Sets the username presented to the broker
    pub fn with_username(&mut self, username: &str) -> &mut Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets the password presented to the broker
    pub fn with_password(&mut self, password: &[u8]) -> &mut Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Configures a message the broker publishes if the connection ends without a normal
    /// DISCONNECT
    pub fn with_will(&mut self, will: WillMessage) -> &mut Self {
        self.options.will = Some(will);
        self
    }

    /// Sets how long, in seconds, the broker waits before publishing the will.  MQTT5 only.
    pub fn with_will_delay_interval_seconds(&mut self, will_delay_interval_seconds: u32) -> &mut Self {
        self.options.will_delay_interval_seconds = Some(will_delay_interval_seconds);
        self
    }

    /// Requests extended (AUTH packet) authentication with the given method.  MQTT5 only.
    pub fn with_authentication_method(&mut self, method: &str) -> &mut Self {
        self.options.authentication_method = Some(method.to_string());
        self
    }

    /// Sets the initial authentication data sent with an authentication method
    pub fn with_authentication_data(&mut self, data: &[u8]) -> &mut Self {
        self.options.authentication_data = Some(data.to_vec());
        self
    }

    /// Adds a user property to every CONNECT packet.  MQTT5 only.
    pub fn with_user_property(&mut self, name: &str, value: &str) -> &mut Self {
        self.options.user_properties.push((name.to_string(), value.to_string()));
        self
    }

    /// Builds a new ConnectOptions object
    pub fn build(&self) -> ConnectOptions {
        self.options.clone()
    }
}

/// Session-level configuration for a client session
#[derive(Clone)]
pub struct ClientSessionConfig {

    pub(crate) connect_options: ConnectOptions,

    pub(crate) base_timestamp: Instant,

    pub(crate) outbound_alias_resolver_factory: Option<OutboundAliasResolverFactoryFn>,

    pub(crate) ping_timeout: Option<Duration>,
}

impl fmt::Debug for ClientSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientSessionConfig {{ ")?;
        write!(f, "connect_options: {:?}, ", self.connect_options)?;
        write!(f, "ping_timeout: {:?}, ", self.ping_timeout)?;
        if self.outbound_alias_resolver_factory.is_some() {
            write!(f, "outbound_alias_resolver_factory: Some(...) ")?;
        } else {
            write!(f, "outbound_alias_resolver_factory: None ")?;
        }

        write!(f, "}}")
    }
}

impl ClientSessionConfig {

    /// Creates a new builder for a client session configuration
    pub fn builder(connect_options: ConnectOptions) -> ClientSessionConfigBuilder {
        ClientSessionConfigBuilder::new(connect_options)
    }

    /// Connect options used for every connection attempt
    pub fn connect_options(&self) -> &ConnectOptions {
        &self.connect_options
    }
}

/// A builder for client session configuration
pub struct ClientSessionConfigBuilder {
    config: ClientSessionConfig
}

impl ClientSessionConfigBuilder {

    /// Creates a new builder around a set of connect options
    pub fn new(connect_options: ConnectOptions) -> Self {
        ClientSessionConfigBuilder {
            config: ClientSessionConfig {
                connect_options,
                base_timestamp: Instant::now(),
                outbound_alias_resolver_factory: None,
                ping_timeout: None,
            }
        }
    }

    /// Sets the instant elapsed times in log output are measured from
    pub fn with_base_timestamp(&mut self, base_timestamp: Instant) -> &mut Self {
        self.config.base_timestamp = base_timestamp;
        self
    }

    /// Configures an outbound topic alias resolver used for publishes sent to the broker
    pub fn with_outbound_alias_resolver_factory(&mut self, factory: OutboundAliasResolverFactoryFn) -> &mut Self {
        self.config.outbound_alias_resolver_factory = Some(factory);
        self
    }

    /// Sets how long after sending a PINGREQ the session waits for a PINGRESP.  Without this,
    /// the session gives up after one and a half keep alive intervals of inbound silence.
    pub fn with_ping_timeout(&mut self, ping_timeout: Duration) -> &mut Self {
        self.config.ping_timeout = Some(ping_timeout);
        self
    }

    /// Builds the configuration
    pub fn build(&self) -> ClientSessionConfig {
        self.config.clone()
    }
}

/// Outcome applied when no security plugin reaches a decision
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum DefaultPolicy {
    Allow,

    #[default]
    Deny,
}

/// How one member of a shared subscription group is chosen for each publish
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub enum SharedSubscriptionPolicy {

    /// Members take turns in subscription order
    #[default]
    RoundRobin,

    /// A member is picked uniformly at random
    Random,
}

/// Broker-wide configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub(crate) allow_anonymous: bool,
    pub(crate) default_acl_policy: DefaultPolicy,
    pub(crate) default_credential_policy: DefaultPolicy,
    pub(crate) receive_maximum: u16,
    pub(crate) maximum_packet_size: u32,
    pub(crate) maximum_qos: QualityOfService,
    pub(crate) retain_available: bool,
    pub(crate) topic_alias_maximum: u16,
    pub(crate) maximum_keep_alive: u16,
    pub(crate) session_expiry_cap: Option<u32>,
    pub(crate) maximum_queued_messages: usize,
    pub(crate) shared_subscription_policy: SharedSubscriptionPolicy,
    pub(crate) upgrade_outgoing_qos: bool,
    pub(crate) assigned_client_id_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            allow_anonymous: true,
            default_acl_policy: DefaultPolicy::Deny,
            default_credential_policy: DefaultPolicy::Allow,
            receive_maximum: 20,
            maximum_packet_size: 0,
            maximum_qos: QualityOfService::ExactlyOnce,
            retain_available: true,
            topic_alias_maximum: 10,
            maximum_keep_alive: 0,
            session_expiry_cap: None,
            maximum_queued_messages: 1000,
            shared_subscription_policy: SharedSubscriptionPolicy::RoundRobin,
            upgrade_outgoing_qos: false,
            assigned_client_id_prefix: "auto-".to_string(),
        }
    }
}

impl BrokerConfig {

    /// Creates a new builder for broker configuration
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }

    /// Largest packet, fixed header included, the broker accepts.  Zero means no limit beyond
    /// the protocol's own.
    pub fn maximum_packet_size(&self) -> u32 { self.maximum_packet_size }

    /// Highest quality of service granted to subscriptions and accepted on publishes
    pub fn maximum_qos(&self) -> QualityOfService { self.maximum_qos }

    /// Effective session expiry for a requested interval, after applying the configured cap
    pub fn effective_session_expiry(&self, requested: u32) -> u32 {
        match self.session_expiry_cap {
            Some(cap) => { requested.min(cap) }
            None => { requested }
        }
    }
}

/// A builder for broker configuration
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    config: BrokerConfig
}

impl BrokerConfigBuilder {

    /// Creates a new builder with default broker settings
    pub fn new() -> Self {
        BrokerConfigBuilder {
            ..Default::default()
        }
    }

    /// Sets whether clients connecting without a username are admitted
    pub fn with_allow_anonymous(&mut self, allow_anonymous: bool) -> &mut Self {
        self.config.allow_anonymous = allow_anonymous;
        self
    }

    /// Sets the result of an access check when every security plugin defers
    pub fn with_default_acl_policy(&mut self, policy: DefaultPolicy) -> &mut Self {
        self.config.default_acl_policy = policy;
        self
    }

    /// Sets the result of a credential check when every security plugin defers
    pub fn with_default_credential_policy(&mut self, policy: DefaultPolicy) -> &mut Self {
        self.config.default_credential_policy = policy;
        self
    }

    /// Sets the number of unacknowledged QoS 1 and 2 publishes accepted from each client
    pub fn with_receive_maximum(&mut self, receive_maximum: u16) -> &mut Self {
        self.config.receive_maximum = receive_maximum.max(1);
        self
    }

    /// Sets the largest packet accepted from clients; zero removes the limit
    pub fn with_maximum_packet_size(&mut self, maximum_packet_size: u32) -> &mut Self {
        self.config.maximum_packet_size = maximum_packet_size;
        self
    }

    /// Sets the highest supported quality of service
    pub fn with_maximum_qos(&mut self, maximum_qos: QualityOfService) -> &mut Self {
        self.config.maximum_qos = maximum_qos;
        self
    }

    /// Sets whether retained messages are supported
    pub fn with_retain_available(&mut self, retain_available: bool) -> &mut Self {
        self.config.retain_available = retain_available;
        self
    }

    /// Sets the highest topic alias clients may use
    pub fn with_topic_alias_maximum(&mut self, topic_alias_maximum: u16) -> &mut Self {
        self.config.topic_alias_maximum = topic_alias_maximum;
        self
    }

    /// Sets the largest keep alive accepted from clients; zero means unlimited
    pub fn with_maximum_keep_alive(&mut self, maximum_keep_alive: u16) -> &mut Self {
        self.config.maximum_keep_alive = maximum_keep_alive;
        self
    }

    /// Caps how long offline sessions are kept, in seconds
    pub fn with_session_expiry_cap(&mut self, cap: u32) -> &mut Self {
        self.config.session_expiry_cap = Some(cap);
        self
    }

    /// Sets how many QoS 1 and 2 messages are queued for an offline session before further
    /// messages are dropped
    pub fn with_maximum_queued_messages(&mut self, maximum_queued_messages: usize) -> &mut Self {
        self.config.maximum_queued_messages = maximum_queued_messages;
        self
    }

    /// Sets how shared subscription groups pick a member
    pub fn with_shared_subscription_policy(&mut self, policy: SharedSubscriptionPolicy) -> &mut Self {
        self.config.shared_subscription_policy = policy;
        self
    }

    /// Delivers messages at the subscription's granted QoS even when published at a lower one
    pub fn with_upgrade_outgoing_qos(&mut self, upgrade_outgoing_qos: bool) -> &mut Self {
        self.config.upgrade_outgoing_qos = upgrade_outgoing_qos;
        self
    }

    /// Sets the prefix of client ids the broker assigns
    pub fn with_assigned_client_id_prefix(&mut self, prefix: &str) -> &mut Self {
        self.config.assigned_client_id_prefix = prefix.to_string();
        self
    }

    /// Builds the broker configuration
    pub fn build(&self) -> BrokerConfig {
        self.config.clone()
    }
}
