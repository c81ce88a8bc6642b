/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing a set of structured data types that model MQTT 3.1, 3.1.1 and 5 control
packets, along with the enumerations that appear inside them.
 */

use crate::error::DimqError;

use std::fmt;

pub(crate) mod auth;
pub(crate) mod connack;
pub(crate) mod connect;
pub(crate) mod disconnect;
pub(crate) mod pingreq;
pub(crate) mod pingresp;
pub mod property;
pub(crate) mod puback;
pub(crate) mod pubcomp;
pub(crate) mod publish;
pub(crate) mod pubrec;
pub(crate) mod pubrel;
pub(crate) mod suback;
pub(crate) mod subscribe;
pub(crate) mod unsuback;
pub(crate) mod unsubscribe;
pub mod utils;

pub use property::{Property, PropertyIdentifier, PropertyList, PropertyValue};

/// Protocol revision spoken on a connection.
///
/// Enum values match the protocol level byte of the CONNECT variable header.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ProtocolVersion {

    /// MQTT 3.1, protocol name "MQIsdp"
    Mqtt31 = 3,

    /// MQTT 3.1.1, protocol name "MQTT"
    #[default]
    Mqtt311 = 4,

    /// MQTT 5, protocol name "MQTT"
    Mqtt5 = 5,
}

impl ProtocolVersion {

    /// Protocol name string carried in the CONNECT variable header
    pub fn protocol_name(&self) -> &'static str {
        match self {
            ProtocolVersion::Mqtt31 => { "MQIsdp" }
            _ => { "MQTT" }
        }
    }

    /// Returns true if the protocol version supports properties, reason codes and AUTH
    pub fn is_v5(&self) -> bool {
        *self == ProtocolVersion::Mqtt5
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Mqtt31 => { write!(f, "3.1") }
            ProtocolVersion::Mqtt311 => { write!(f, "3.1.1") }
            ProtocolVersion::Mqtt5 => { write!(f, "5") }
        }
    }
}

/// The fifteen MQTT control packet types.
///
/// Enum values match the high nibble of a packet's first byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", utils::packet_type_to_str(*self as u8))
    }
}

/// MQTT message delivery quality of service.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No
    /// response is sent by the receiver and no retry is performed by the sender.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = DimqError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_quality_of_service(value)
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", utils::quality_of_service_to_str(*self))
    }
}

/// Optional property describing a PUBLISH payload's format.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PayloadFormatIndicator {

    /// The payload is arbitrary binary data
    #[default]
    Bytes = 0,

    /// The payload is a well-formed utf-8 string value.
    Utf8 = 1,
}

/// Configures how retained messages should be handled when subscribing with a topic filter that
/// matches topics with associated retained messages.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum RetainHandlingType {

    /// Always send matching retained messages when the subscription is made.
    #[default]
    SendOnSubscribe = 0,

    /// Send matching retained messages only if the subscription did not previously exist.
    SendOnSubscribeIfNew = 1,

    /// Never send retained messages because of a subscription.
    DontSend = 2,
}

macro_rules! define_reason_code_display {
    ($reason_code_type: ident) => {
        impl fmt::Display for $reason_code_type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}({})", self, *self as u8)
            }
        }

        impl $reason_code_type {

            /// Returns true if the reason code indicates success
            pub fn is_success(&self) -> bool {
                (*self as u8) < 128
            }
        }
    };
}

/// Server return code for connection attempts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReasonCode {
    #[default]
    Success = 0,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    UnsupportedProtocolVersion = 132,
    ClientIdentifierNotValid = 133,
    BadUsernameOrPassword = 134,
    NotAuthorized = 135,
    ServerUnavailable = 136,
    ServerBusy = 137,
    Banned = 138,
    BadAuthenticationMethod = 140,
    TopicNameInvalid = 144,
    PacketTooLarge = 149,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QosNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    ConnectionRateExceeded = 159,
}

define_reason_code_display!(ConnectReasonCode);

impl ConnectReasonCode {

    /// Maps the reason code onto the closest MQTT 3.x CONNACK return code
    pub fn to_v3_return_code(&self) -> u8 {
        match self {
            ConnectReasonCode::Success => { 0 }
            ConnectReasonCode::UnsupportedProtocolVersion => { 1 }
            ConnectReasonCode::ClientIdentifierNotValid => { 2 }
            ConnectReasonCode::ServerUnavailable | ConnectReasonCode::ServerBusy => { 3 }
            ConnectReasonCode::BadUsernameOrPassword => { 4 }
            _ => { 5 }
        }
    }

    /// Maps an MQTT 3.x CONNACK return code onto a reason code
    pub fn from_v3_return_code(value: u8) -> Result<ConnectReasonCode, DimqError> {
        match value {
            0 => { Ok(ConnectReasonCode::Success) }
            1 => { Ok(ConnectReasonCode::UnsupportedProtocolVersion) }
            2 => { Ok(ConnectReasonCode::ClientIdentifierNotValid) }
            3 => { Ok(ConnectReasonCode::ServerUnavailable) }
            4 => { Ok(ConnectReasonCode::BadUsernameOrPassword) }
            5 => { Ok(ConnectReasonCode::NotAuthorized) }
            _ => { Err(DimqError::new_malformed_packet("invalid mqtt3 connack return code")) }
        }
    }
}

/// Reason code inside PUBACK packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubackReasonCode {
    #[default]
    Success = 0,
    NoMatchingSubscribers = 16,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
}

define_reason_code_display!(PubackReasonCode);

/// Reason code inside PUBREC packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrecReasonCode {
    #[default]
    Success = 0,
    NoMatchingSubscribers = 16,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicNameInvalid = 144,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    PayloadFormatInvalid = 153,
}

define_reason_code_display!(PubrecReasonCode);

/// Reason code inside PUBREL packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubrelReasonCode {
    #[default]
    Success = 0,
    PacketIdentifierNotFound = 146,
}

define_reason_code_display!(PubrelReasonCode);

/// Reason code inside PUBCOMP packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum PubcompReasonCode {
    #[default]
    Success = 0,
    PacketIdentifierNotFound = 146,
}

define_reason_code_display!(PubcompReasonCode);

/// Reason code inside DISCONNECT packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum DisconnectReasonCode {
    #[default]
    NormalDisconnection = 0,
    DisconnectWithWillMessage = 4,
    UnspecifiedError = 128,
    MalformedPacket = 129,
    ProtocolError = 130,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    ServerBusy = 137,
    ServerShuttingDown = 139,
    KeepAliveTimeout = 141,
    SessionTakenOver = 142,
    TopicFilterInvalid = 143,
    TopicNameInvalid = 144,
    ReceiveMaximumExceeded = 147,
    TopicAliasInvalid = 148,
    PacketTooLarge = 149,
    MessageRateTooHigh = 150,
    QuotaExceeded = 151,
    AdministrativeAction = 152,
    PayloadFormatInvalid = 153,
    RetainNotSupported = 154,
    QosNotSupported = 155,
    UseAnotherServer = 156,
    ServerMoved = 157,
    SharedSubscriptionsNotSupported = 158,
    ConnectionRateExceeded = 159,
    MaximumConnectTime = 160,
    SubscriptionIdentifiersNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

define_reason_code_display!(DisconnectReasonCode);

/// Reason code for each subscription inside a SUBACK packet.  For MQTT 3.x the first three
/// values and `UnspecifiedError` are the only legal return codes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubackReasonCode {
    #[default]
    GrantedQos0 = 0,
    GrantedQos1 = 1,
    GrantedQos2 = 2,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PacketIdentifierInUse = 145,
    QuotaExceeded = 151,
    SharedSubscriptionsNotSupported = 158,
    SubscriptionIdentifiersNotSupported = 161,
    WildcardSubscriptionsNotSupported = 162,
}

define_reason_code_display!(SubackReasonCode);

impl SubackReasonCode {

    /// Builds the success reason code for a granted quality of service
    pub fn from_granted_qos(qos: QualityOfService) -> SubackReasonCode {
        match qos {
            QualityOfService::AtMostOnce => { SubackReasonCode::GrantedQos0 }
            QualityOfService::AtLeastOnce => { SubackReasonCode::GrantedQos1 }
            QualityOfService::ExactlyOnce => { SubackReasonCode::GrantedQos2 }
        }
    }
}

/// Reason code for each topic filter inside an MQTT5 UNSUBACK packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum UnsubackReasonCode {
    #[default]
    Success = 0,
    NoSubscriptionExisted = 17,
    UnspecifiedError = 128,
    ImplementationSpecificError = 131,
    NotAuthorized = 135,
    TopicFilterInvalid = 143,
    PacketIdentifierInUse = 145,
}

define_reason_code_display!(UnsubackReasonCode);

/// Reason code inside AUTH packets.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AuthenticateReasonCode {
    #[default]
    Success = 0,
    ContinueAuthentication = 24,
    ReAuthenticate = 25,
}

define_reason_code_display!(AuthenticateReasonCode);

/// Will message carried by a CONNECT packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WillMessage {

    /// Topic the will is published to
    pub topic: String,

    /// Will payload
    pub payload: Vec<u8>,

    /// Delivery quality of service for the will
    pub qos: QualityOfService,

    /// Should the will be retained
    pub retain: bool,

    /// MQTT5 will properties (will delay interval, message expiry, content type, ...)
    pub properties: PropertyList,
}

/// Data model of an MQTT CONNECT packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub keep_alive_interval_seconds: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<WillMessage>,
    pub properties: PropertyList,
}

/// Data model of an MQTT CONNACK packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {
    pub session_present: bool,
    pub reason_code: ConnectReasonCode,
    pub properties: PropertyList,
}

/// Data model of an MQTT PUBLISH packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {

    /// Packet id; zero for QoS 0
    pub packet_id: u16,
    pub topic: String,
    pub qos: QualityOfService,
    pub duplicate: bool,
    pub retain: bool,
    pub payload: Vec<u8>,
    pub properties: PropertyList,
}

/// Data model of an MQTT PUBACK packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {
    pub packet_id: u16,
    pub reason_code: PubackReasonCode,
    pub properties: PropertyList,
}

/// Data model of an MQTT PUBREC packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {
    pub packet_id: u16,
    pub reason_code: PubrecReasonCode,
    pub properties: PropertyList,
}

/// Data model of an MQTT PUBREL packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {
    pub packet_id: u16,
    pub reason_code: PubrelReasonCode,
    pub properties: PropertyList,
}

/// Data model of an MQTT PUBCOMP packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {
    pub packet_id: u16,
    pub reason_code: PubcompReasonCode,
    pub properties: PropertyList,
}

/// A single topic filter and its options inside a SUBSCRIBE packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: QualityOfService,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling_type: RetainHandlingType,
}

impl Subscription {

    /// Creates a subscription with default options at the requested quality of service
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos,
            ..Default::default()
        }
    }
}

/// Data model of an MQTT SUBSCRIBE packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub subscriptions: Vec<Subscription>,
    pub properties: PropertyList,
}

/// Data model of an MQTT SUBACK packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<SubackReasonCode>,
    pub properties: PropertyList,
}

/// Data model of an MQTT UNSUBSCRIBE packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub topic_filters: Vec<String>,
    pub properties: PropertyList,
}

/// Data model of an MQTT UNSUBACK packet.  MQTT 3.x UNSUBACKs carry no reason codes, in which
/// case `reason_codes` is empty.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {
    pub packet_id: u16,
    pub reason_codes: Vec<UnsubackReasonCode>,
    pub properties: PropertyList,
}

/// Data model of an MQTT PINGREQ packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingreqPacket {}

/// Data model of an MQTT PINGRESP packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingrespPacket {}

/// Data model of an MQTT DISCONNECT packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {
    pub reason_code: DisconnectReasonCode,
    pub properties: PropertyList,
}

/// Data model of an MQTT5 AUTH packet.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AuthPacket {
    pub reason_code: AuthenticateReasonCode,
    pub properties: PropertyList,
}

/// Tagged union over the fifteen MQTT control packets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlPacket {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback(PubackPacket),
    Pubrec(PubrecPacket),
    Pubrel(PubrelPacket),
    Pubcomp(PubcompPacket),
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Unsubscribe(UnsubscribePacket),
    Unsuback(UnsubackPacket),
    Pingreq(PingreqPacket),
    Pingresp(PingrespPacket),
    Disconnect(DisconnectPacket),
    Auth(AuthPacket),
}

impl ControlPacket {

    /// Returns the packet type of this packet
    pub fn packet_type(&self) -> PacketType {
        utils::control_packet_to_packet_type(self)
    }
}

impl fmt::Display for ControlPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlPacket::Connect(packet) => { write!(f, "{}", packet) }
            ControlPacket::Connack(packet) => { write!(f, "{}", packet) }
            ControlPacket::Publish(packet) => { write!(f, "{}", packet) }
            ControlPacket::Puback(packet) => { write!(f, "{}", packet) }
            ControlPacket::Pubrec(packet) => { write!(f, "{}", packet) }
            ControlPacket::Pubrel(packet) => { write!(f, "{}", packet) }
            ControlPacket::Pubcomp(packet) => { write!(f, "{}", packet) }
            ControlPacket::Subscribe(packet) => { write!(f, "{}", packet) }
            ControlPacket::Suback(packet) => { write!(f, "{}", packet) }
            ControlPacket::Unsubscribe(packet) => { write!(f, "{}", packet) }
            ControlPacket::Unsuback(packet) => { write!(f, "{}", packet) }
            ControlPacket::Pingreq(packet) => { write!(f, "{}", packet) }
            ControlPacket::Pingresp(packet) => { write!(f, "{}", packet) }
            ControlPacket::Disconnect(packet) => { write!(f, "{}", packet) }
            ControlPacket::Auth(packet) => { write!(f, "{}", packet) }
        }
    }
}
