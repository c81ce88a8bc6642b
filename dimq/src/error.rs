/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::mqtt::{ConnectReasonCode, DisconnectReasonCode, PacketType};

use std::error::Error;
use std::fmt;

/// Additional details about a MalformedPacket error variant
#[derive(Debug)]
pub struct MalformedPacketContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a PayloadTooLarge error variant
#[derive(Debug)]
pub struct PayloadTooLargeContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ProtocolError error variant
#[derive(Debug)]
pub struct ProtocolErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a DuplicateProperty error variant
#[derive(Debug)]
pub struct DuplicatePropertyContext {

    /// numeric identifier of the property that appeared more than once
    pub identifier: u8,
}

/// Additional details about a PacketValidation error variant
#[derive(Debug)]
pub struct PacketValidationContext {

    /// type of packet that failed validation
    pub packet_type: PacketType,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InvalidTopicFilter error variant
#[derive(Debug)]
pub struct InvalidTopicFilterContext {

    /// the filter that was rejected
    pub filter: String,
}

/// Additional details about an InvalidTopicName error variant
#[derive(Debug)]
pub struct InvalidTopicNameContext {

    /// the topic that was rejected
    pub topic: String,
}

/// Additional details about an InboundTopicAliasNotValid error variant
#[derive(Debug)]
pub struct InboundTopicAliasNotValidContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a QuotaExceeded error variant
#[derive(Debug)]
pub struct QuotaExceededContext {

    /// reason code that should be reported to the peer
    pub reason_code: DisconnectReasonCode,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a PacketIdSpaceExhausted error variant
#[derive(Debug)]
pub struct PacketIdSpaceExhaustedContext {
}

/// Additional details about an InflightNotFound error variant
#[derive(Debug)]
pub struct InflightNotFoundContext {

    /// message id that did not correspond to any inflight record
    pub mid: u16,
}

/// Additional details about a ProtocolMismatch error variant
#[derive(Debug)]
pub struct ProtocolMismatchContext {

    /// message id of the inflight record whose qos did not match the acknowledgement
    pub mid: u16,
}

/// Additional details about a KeepaliveTimeout error variant
#[derive(Debug)]
pub struct KeepaliveTimeoutContext {
}

/// Additional details about a ConnectionRejected error variant
#[derive(Debug)]
pub struct ConnectionRejectedContext {

    /// reason code carried by the failing CONNACK
    pub reason_code: ConnectReasonCode,
}

/// Additional details about a NotAuthorized error variant
#[derive(Debug)]
pub struct NotAuthorizedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a SessionTakenOver error variant
#[derive(Debug)]
pub struct SessionTakenOverContext {
}

/// Additional details about a ConnectionClosed error variant
#[derive(Debug)]
pub struct ConnectionClosedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a StdIoError error variant
#[derive(Debug)]
pub struct StdIoErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Basic error type for the entire dimq crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum DimqError {

    /// Bytes received from the peer could not be decoded into a valid MQTT packet.  Bad
    /// variable length integers, invalid utf-8, reserved header flags, and mismatches between
    /// length fields and actual content all land here.  Always fatal to the connection.
    MalformedPacket(MalformedPacketContext),

    /// A value was too large to be represented on the wire; for example a variable length
    /// integer above 268435455 or a packet larger than the negotiated maximum.
    PayloadTooLarge(PayloadTooLargeContext),

    /// The peer sent something that was well-formed but not allowed in the current context.
    ProtocolError(ProtocolErrorContext),

    /// A property that may appear at most once was present multiple times.
    DuplicateProperty(DuplicatePropertyContext),

    /// An outbound packet failed validation against protocol rules before being encoded.
    PacketValidation(PacketValidationContext),

    /// A subscription topic filter was not well-formed.
    InvalidTopicFilter(InvalidTopicFilterContext),

    /// A publish topic was not well-formed (empty, or containing wildcard characters).
    InvalidTopicName(InvalidTopicNameContext),

    /// An inbound publish used a topic alias that was out of range or never bound.
    InboundTopicAliasNotValid(InboundTopicAliasNotValidContext),

    /// A flow control or resource limit was exceeded.  Carries the reason code that should be
    /// reported to the peer.
    QuotaExceeded(QuotaExceededContext),

    /// Every packet id in the range 1..=65535 is currently bound to an inflight message.
    PacketIdSpaceExhausted(PacketIdSpaceExhaustedContext),

    /// An acknowledgement referenced a message id with no matching inflight record.
    InflightNotFound(InflightNotFoundContext),

    /// An acknowledgement type did not match the quality of service of its inflight record.
    ProtocolMismatch(ProtocolMismatchContext),

    /// No PINGRESP (client) or no packet at all (broker) was received within the keepalive
    /// deadline.
    KeepaliveTimeout(KeepaliveTimeoutContext),

    /// The broker answered a CONNECT with a failing CONNACK.
    ConnectionRejected(ConnectionRejectedContext),

    /// Credentials or access control checks rejected the operation.
    NotAuthorized(NotAuthorizedContext),

    /// Another connection claimed this session's client id.
    SessionTakenOver(SessionTakenOverContext),

    /// The connection was closed, either by the peer or by a DISCONNECT exchange.
    ConnectionClosed(ConnectionClosedContext),

    /// The byte-stream transport reported a failure.
    TransportError(TransportErrorContext),

    /// Generic error wrapping std::io::Error
    StdIoError(StdIoErrorContext),

    /// Something happened that should never happen.  Always indicates a bug in this crate.
    InternalStateError(InternalStateErrorContext),
}

/// Coarse classification of errors that decides how a session reacts to them.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCategory {

    /// Structurally invalid bytes.  Close immediately.
    Malformed,

    /// Valid encoding, invalid for the session's state.  Close, after a v5 DISCONNECT if possible.
    Protocol,

    /// A limit was exceeded.  Negatively acknowledge where the protocol allows it.
    Resource,

    /// The connection itself failed.
    Transport,

    /// Authentication or authorization failed.
    Auth,

    /// A crate bug.
    Internal,
}

impl DimqError {

    pub(crate) fn new_malformed_packet(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::MalformedPacket(
            MalformedPacketContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_payload_too_large(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::PayloadTooLarge(
            PayloadTooLargeContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_protocol_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::ProtocolError(
            ProtocolErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_duplicate_property(identifier: u8) -> Self {
        DimqError::DuplicateProperty(
            DuplicatePropertyContext {
                identifier
            }
        )
    }

    pub(crate) fn new_packet_validation(packet_type: PacketType, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::PacketValidation(
            PacketValidationContext {
                packet_type,
                source : source.into()
            }
        )
    }

    pub(crate) fn new_invalid_topic_filter(filter: &str) -> Self {
        DimqError::InvalidTopicFilter(
            InvalidTopicFilterContext {
                filter: filter.to_string()
            }
        )
    }

    pub(crate) fn new_invalid_topic_name(topic: &str) -> Self {
        DimqError::InvalidTopicName(
            InvalidTopicNameContext {
                topic: topic.to_string()
            }
        )
    }

    pub(crate) fn new_inbound_topic_alias_not_valid(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::InboundTopicAliasNotValid(
            InboundTopicAliasNotValidContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_quota_exceeded(reason_code: DisconnectReasonCode, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::QuotaExceeded(
            QuotaExceededContext {
                reason_code,
                source : source.into()
            }
        )
    }

    pub(crate) fn new_packet_id_space_exhausted() -> Self {
        DimqError::PacketIdSpaceExhausted(
            PacketIdSpaceExhaustedContext {
            }
        )
    }

    pub(crate) fn new_inflight_not_found(mid: u16) -> Self {
        DimqError::InflightNotFound(
            InflightNotFoundContext {
                mid
            }
        )
    }

    pub(crate) fn new_protocol_mismatch(mid: u16) -> Self {
        DimqError::ProtocolMismatch(
            ProtocolMismatchContext {
                mid
            }
        )
    }

    pub(crate) fn new_keepalive_timeout() -> Self {
        DimqError::KeepaliveTimeout(
            KeepaliveTimeoutContext {
            }
        )
    }

    pub(crate) fn new_connection_rejected(reason_code: ConnectReasonCode) -> Self {
        DimqError::ConnectionRejected(
            ConnectionRejectedContext {
                reason_code
            }
        )
    }

    pub(crate) fn new_not_authorized(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::NotAuthorized(
            NotAuthorizedContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_session_taken_over() -> Self {
        DimqError::SessionTakenOver(
            SessionTakenOverContext {
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::ConnectionClosed(
            ConnectionClosedContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new TransportError variant from an existing error.  Typically this should be
    /// an error surfacing from a third-party transport library.
    pub fn new_transport_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::TransportError(
            TransportErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a StdIoError variant from an existing error.  Typically this should be a
    /// std::io::Error
    pub fn new_std_io_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::StdIoError(
            StdIoErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        DimqError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }

    /// Maps the error onto the coarse taxonomy sessions use to decide between closing the
    /// connection and negatively acknowledging a single operation.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DimqError::MalformedPacket(_) => { ErrorCategory::Malformed }
            DimqError::PayloadTooLarge(_) => { ErrorCategory::Resource }
            DimqError::ProtocolError(_) => { ErrorCategory::Protocol }
            DimqError::DuplicateProperty(_) => { ErrorCategory::Protocol }
            DimqError::PacketValidation(_) => { ErrorCategory::Protocol }
            DimqError::InvalidTopicFilter(_) => { ErrorCategory::Protocol }
            DimqError::InvalidTopicName(_) => { ErrorCategory::Protocol }
            DimqError::InboundTopicAliasNotValid(_) => { ErrorCategory::Protocol }
            DimqError::QuotaExceeded(_) => { ErrorCategory::Resource }
            DimqError::PacketIdSpaceExhausted(_) => { ErrorCategory::Resource }
            DimqError::InflightNotFound(_) => { ErrorCategory::Protocol }
            DimqError::ProtocolMismatch(_) => { ErrorCategory::Protocol }
            DimqError::KeepaliveTimeout(_) => { ErrorCategory::Transport }
            DimqError::ConnectionRejected(_) => { ErrorCategory::Auth }
            DimqError::NotAuthorized(_) => { ErrorCategory::Auth }
            DimqError::SessionTakenOver(_) => { ErrorCategory::Transport }
            DimqError::ConnectionClosed(_) => { ErrorCategory::Transport }
            DimqError::TransportError(_) => { ErrorCategory::Transport }
            DimqError::StdIoError(_) => { ErrorCategory::Transport }
            DimqError::InternalStateError(_) => { ErrorCategory::Internal }
        }
    }

    /// Reason code an MQTT5 endpoint should place in the DISCONNECT it sends before closing the
    /// connection because of this error.
    pub fn disconnect_reason_code(&self) -> DisconnectReasonCode {
        match self {
            DimqError::MalformedPacket(_) => { DisconnectReasonCode::MalformedPacket }
            DimqError::PayloadTooLarge(_) => { DisconnectReasonCode::PacketTooLarge }
            DimqError::DuplicateProperty(_) => { DisconnectReasonCode::ProtocolError }
            DimqError::InvalidTopicFilter(_) => { DisconnectReasonCode::TopicFilterInvalid }
            DimqError::InvalidTopicName(_) => { DisconnectReasonCode::TopicNameInvalid }
            DimqError::InboundTopicAliasNotValid(_) => { DisconnectReasonCode::TopicAliasInvalid }
            DimqError::QuotaExceeded(context) => { context.reason_code }
            DimqError::KeepaliveTimeout(_) => { DisconnectReasonCode::KeepAliveTimeout }
            DimqError::NotAuthorized(_) => { DisconnectReasonCode::NotAuthorized }
            DimqError::SessionTakenOver(_) => { DisconnectReasonCode::SessionTakenOver }
            DimqError::InternalStateError(_) => { DisconnectReasonCode::UnspecifiedError }
            _ => { DisconnectReasonCode::ProtocolError }
        }
    }
}

impl Error for DimqError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DimqError::MalformedPacket(context) => {
                Some(context.source.as_ref())
            }
            DimqError::PayloadTooLarge(context) => {
                Some(context.source.as_ref())
            }
            DimqError::ProtocolError(context) => {
                Some(context.source.as_ref())
            }
            DimqError::PacketValidation(context) => {
                Some(context.source.as_ref())
            }
            DimqError::InboundTopicAliasNotValid(context) => {
                Some(context.source.as_ref())
            }
            DimqError::QuotaExceeded(context) => {
                Some(context.source.as_ref())
            }
            DimqError::NotAuthorized(context) => {
                Some(context.source.as_ref())
            }
            DimqError::ConnectionClosed(context) => {
                Some(context.source.as_ref())
            }
            DimqError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            DimqError::StdIoError(context) => {
                Some(context.source.as_ref())
            }
            DimqError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for DimqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimqError::MalformedPacket(_) => {
                write!(f, "failure encountered while decoding an incoming MQTT packet")
            }
            DimqError::PayloadTooLarge(_) => {
                write!(f, "value exceeds the maximum size representable or negotiated")
            }
            DimqError::ProtocolError(_) => {
                write!(f, "peer behavior disallowed by the mqtt protocol")
            }
            DimqError::DuplicateProperty(context) => {
                write!(f, "property {} appeared more than once", context.identifier)
            }
            DimqError::PacketValidation(context) => {
                write!(f, "{} packet failed validation", context.packet_type)
            }
            DimqError::InvalidTopicFilter(context) => {
                write!(f, "invalid topic filter \"{}\"", context.filter)
            }
            DimqError::InvalidTopicName(context) => {
                write!(f, "invalid topic name \"{}\"", context.topic)
            }
            DimqError::InboundTopicAliasNotValid(_) => {
                write!(f, "topic alias value on incoming publish is not valid")
            }
            DimqError::QuotaExceeded(context) => {
                write!(f, "resource limit exceeded ({})", context.reason_code)
            }
            DimqError::PacketIdSpaceExhausted(_) => {
                write!(f, "all packet ids are currently in use")
            }
            DimqError::InflightNotFound(context) => {
                write!(f, "no inflight message with id {}", context.mid)
            }
            DimqError::ProtocolMismatch(context) => {
                write!(f, "acknowledgement type does not match the qos of inflight message {}", context.mid)
            }
            DimqError::KeepaliveTimeout(_) => {
                write!(f, "keepalive deadline elapsed without activity from the peer")
            }
            DimqError::ConnectionRejected(context) => {
                write!(f, "connection rejected by the broker ({})", context.reason_code)
            }
            DimqError::NotAuthorized(_) => {
                write!(f, "operation not authorized")
            }
            DimqError::SessionTakenOver(_) => {
                write!(f, "another connection took over this session")
            }
            DimqError::ConnectionClosed(_) => {
                write!(f, "connection was closed; source contains further details")
            }
            DimqError::TransportError(_) => {
                write!(f, "transport error; source contains further details")
            }
            DimqError::StdIoError(_) => {
                write!(f, "generic error wrapper for std::io::Error; source contains further details")
            }
            DimqError::InternalStateError(_) => {
                write!(f, "reached an invalid internal state; almost certainly a bug")
            }
        }
    }
}

impl From<std::io::Error> for DimqError {
    fn from(error: std::io::Error) -> Self {
        DimqError::new_std_io_error(error)
    }
}

impl From<core::str::Utf8Error> for DimqError {
    fn from(err: core::str::Utf8Error) -> Self {
        DimqError::new_malformed_packet(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type DimqResult<T> = Result<T, DimqError>;

pub(crate) fn fold_dimq_result<T>(base: DimqResult<T>, new_result: DimqResult<T>) -> DimqResult<T> {
    new_result?;
    base
}
