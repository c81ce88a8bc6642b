/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Wire constants and conversion helpers shared by the packet modules.
 */

use crate::error::{DimqError, DimqResult};
use crate::mqtt::*;

use log::*;

pub(crate) const PACKET_TYPE_CONNECT: u8 = 1;
pub(crate) const PACKET_TYPE_CONNACK: u8 = 2;
pub(crate) const PACKET_TYPE_PUBLISH: u8 = 3;
pub(crate) const PACKET_TYPE_PUBACK: u8 = 4;
pub(crate) const PACKET_TYPE_PUBREC: u8 = 5;
pub(crate) const PACKET_TYPE_PUBREL: u8 = 6;
pub(crate) const PACKET_TYPE_PUBCOMP: u8 = 7;
pub(crate) const PACKET_TYPE_SUBSCRIBE: u8 = 8;
pub(crate) const PACKET_TYPE_SUBACK: u8 = 9;
pub(crate) const PACKET_TYPE_UNSUBSCRIBE: u8 = 10;
pub(crate) const PACKET_TYPE_UNSUBACK: u8 = 11;
pub(crate) const PACKET_TYPE_PINGREQ: u8 = 12;
pub(crate) const PACKET_TYPE_PINGRESP: u8 = 13;
pub(crate) const PACKET_TYPE_DISCONNECT: u8 = 14;
pub(crate) const PACKET_TYPE_AUTH: u8 = 15;

pub(crate) const PUBLISH_PACKET_FIXED_HEADER_DUPLICATE_FLAG : u8 = 8;
pub(crate) const PUBLISH_PACKET_FIXED_HEADER_RETAIN_FLAG : u8 = 1;
pub(crate) const QOS_MASK : u8 = 3;

pub(crate) const CONNECT_PACKET_RESERVED_FLAG_MASK : u8 = 1;
pub(crate) const CONNECT_PACKET_CLEAN_START_FLAG_MASK : u8 = 1 << 1;
pub(crate) const CONNECT_PACKET_HAS_WILL_FLAG_MASK : u8 = 1 << 2;
pub(crate) const CONNECT_PACKET_WILL_QOS_FLAG_SHIFT : u8 = 3;
pub(crate) const CONNECT_PACKET_WILL_RETAIN_FLAG_MASK : u8 = 1 << 5;
pub(crate) const CONNECT_PACKET_HAS_PASSWORD_FLAG_MASK : u8 = 1 << 6;
pub(crate) const CONNECT_PACKET_HAS_USERNAME_FLAG_MASK : u8 = 1 << 7;

pub(crate) const CONNECT_FIRST_BYTE : u8 = PACKET_TYPE_CONNECT << 4;
pub(crate) const CONNACK_FIRST_BYTE : u8 = PACKET_TYPE_CONNACK << 4;
pub(crate) const PUBACK_FIRST_BYTE : u8 = PACKET_TYPE_PUBACK << 4;
pub(crate) const PUBREC_FIRST_BYTE : u8 = PACKET_TYPE_PUBREC << 4;
pub(crate) const PUBREL_FIRST_BYTE : u8 = (PACKET_TYPE_PUBREL << 4) | (0x02u8);
pub(crate) const PUBCOMP_FIRST_BYTE : u8 = PACKET_TYPE_PUBCOMP << 4;
pub(crate) const SUBSCRIBE_FIRST_BYTE : u8 = (PACKET_TYPE_SUBSCRIBE << 4) | (0x02u8);
pub(crate) const SUBACK_FIRST_BYTE : u8 = PACKET_TYPE_SUBACK << 4;
pub(crate) const UNSUBSCRIBE_FIRST_BYTE : u8 = (PACKET_TYPE_UNSUBSCRIBE << 4) | (0x02u8);
pub(crate) const UNSUBACK_FIRST_BYTE : u8 = PACKET_TYPE_UNSUBACK << 4;
pub(crate) const PINGREQ_FIRST_BYTE : u8 = PACKET_TYPE_PINGREQ << 4;
pub(crate) const PINGRESP_FIRST_BYTE : u8 = PACKET_TYPE_PINGRESP << 4;
pub(crate) const DISCONNECT_FIRST_BYTE : u8 = PACKET_TYPE_DISCONNECT << 4;
pub(crate) const AUTH_FIRST_BYTE : u8 = PACKET_TYPE_AUTH << 4;

pub(crate) const SUBSCRIPTION_OPTIONS_QOS_MASK : u8 = 3;
pub(crate) const SUBSCRIPTION_OPTIONS_NO_LOCAL_MASK : u8 = 1u8 << 2;
pub(crate) const SUBSCRIPTION_OPTIONS_RETAIN_AS_PUBLISHED_MASK : u8 = 1u8 << 3;
pub(crate) const SUBSCRIPTION_OPTIONS_RETAIN_HANDLING_SHIFT : u8 = 4;
pub(crate) const SUBSCRIPTION_OPTIONS_RESERVED_MASK : u8 = 0xC0;

pub(crate) const PROTOCOL_NAME_MQTT31 : &str = "MQIsdp";
pub(crate) const PROTOCOL_NAME_MQTT : &str = "MQTT";

macro_rules! define_u8_enum_conversion_function {
    ($function_name: ident, $enum_type: ident, $enum_type_as_string: expr, [ $($variant: ident),+ ]) => {
        pub fn $function_name(value: u8) -> DimqResult<$enum_type> {
            $(
                if value == $enum_type::$variant as u8 {
                    return Ok($enum_type::$variant);
                }
            )+

            error!("Packet Decode - Invalid {} value ({})", $enum_type_as_string, value);
            Err(DimqError::new_malformed_packet(concat!("invalid ", $enum_type_as_string, " value")))
        }
    };
}

define_u8_enum_conversion_function!(convert_u8_to_quality_of_service, QualityOfService, "quality of service",
    [AtMostOnce, AtLeastOnce, ExactlyOnce]);

define_u8_enum_conversion_function!(convert_u8_to_retain_handling_type, RetainHandlingType, "retain handling type",
    [SendOnSubscribe, SendOnSubscribeIfNew, DontSend]);

define_u8_enum_conversion_function!(convert_u8_to_connect_reason_code, ConnectReasonCode, "connect reason code",
    [Success, UnspecifiedError, MalformedPacket, ProtocolError, ImplementationSpecificError, UnsupportedProtocolVersion,
     ClientIdentifierNotValid, BadUsernameOrPassword, NotAuthorized, ServerUnavailable, ServerBusy, Banned,
     BadAuthenticationMethod, TopicNameInvalid, PacketTooLarge, QuotaExceeded, PayloadFormatInvalid,
     RetainNotSupported, QosNotSupported, UseAnotherServer, ServerMoved, ConnectionRateExceeded]);

define_u8_enum_conversion_function!(convert_u8_to_puback_reason_code, PubackReasonCode, "puback reason code",
    [Success, NoMatchingSubscribers, UnspecifiedError, ImplementationSpecificError, NotAuthorized,
     TopicNameInvalid, PacketIdentifierInUse, QuotaExceeded, PayloadFormatInvalid]);

define_u8_enum_conversion_function!(convert_u8_to_pubrec_reason_code, PubrecReasonCode, "pubrec reason code",
    [Success, NoMatchingSubscribers, UnspecifiedError, ImplementationSpecificError, NotAuthorized,
     TopicNameInvalid, PacketIdentifierInUse, QuotaExceeded, PayloadFormatInvalid]);

define_u8_enum_conversion_function!(convert_u8_to_pubrel_reason_code, PubrelReasonCode, "pubrel reason code",
    [Success, PacketIdentifierNotFound]);

define_u8_enum_conversion_function!(convert_u8_to_pubcomp_reason_code, PubcompReasonCode, "pubcomp reason code",
    [Success, PacketIdentifierNotFound]);

define_u8_enum_conversion_function!(convert_u8_to_disconnect_reason_code, DisconnectReasonCode, "disconnect reason code",
    [NormalDisconnection, DisconnectWithWillMessage, UnspecifiedError, MalformedPacket, ProtocolError,
     ImplementationSpecificError, NotAuthorized, ServerBusy, ServerShuttingDown, KeepAliveTimeout,
     SessionTakenOver, TopicFilterInvalid, TopicNameInvalid, ReceiveMaximumExceeded, TopicAliasInvalid,
     PacketTooLarge, MessageRateTooHigh, QuotaExceeded, AdministrativeAction, PayloadFormatInvalid,
     RetainNotSupported, QosNotSupported, UseAnotherServer, ServerMoved, SharedSubscriptionsNotSupported,
     ConnectionRateExceeded, MaximumConnectTime, SubscriptionIdentifiersNotSupported,
     WildcardSubscriptionsNotSupported]);

define_u8_enum_conversion_function!(convert_u8_to_suback_reason_code, SubackReasonCode, "suback reason code",
    [GrantedQos0, GrantedQos1, GrantedQos2, UnspecifiedError, ImplementationSpecificError, NotAuthorized,
     TopicFilterInvalid, PacketIdentifierInUse, QuotaExceeded, SharedSubscriptionsNotSupported,
     SubscriptionIdentifiersNotSupported, WildcardSubscriptionsNotSupported]);

define_u8_enum_conversion_function!(convert_u8_to_unsuback_reason_code, UnsubackReasonCode, "unsuback reason code",
    [Success, NoSubscriptionExisted, UnspecifiedError, ImplementationSpecificError, NotAuthorized,
     TopicFilterInvalid, PacketIdentifierInUse]);

define_u8_enum_conversion_function!(convert_u8_to_authenticate_reason_code, AuthenticateReasonCode, "authenticate reason code",
    [Success, ContinueAuthentication, ReAuthenticate]);

pub(crate) fn convert_u8_to_protocol_version(value: u8) -> DimqResult<ProtocolVersion> {
    match value {
        3 => { Ok(ProtocolVersion::Mqtt31) }
        4 => { Ok(ProtocolVersion::Mqtt311) }
        5 => { Ok(ProtocolVersion::Mqtt5) }
        _ => {
            error!("Packet Decode - Unsupported protocol level ({})", value);
            Err(DimqError::new_protocol_error("unsupported protocol level"))
        }
    }
}

pub(crate) fn quality_of_service_to_str (qos: QualityOfService) -> &'static str {
    match qos {
        QualityOfService::AtMostOnce => { "AtMostOnce (0)" }
        QualityOfService::AtLeastOnce => { "AtLeastOnce (1)" }
        QualityOfService::ExactlyOnce => { "ExactlyOnce (2)" }
    }
}

pub(crate) fn control_packet_to_packet_type(packet: &ControlPacket) -> PacketType {
    match packet {
        ControlPacket::Connect(_) => { PacketType::Connect }
        ControlPacket::Connack(_) => { PacketType::Connack }
        ControlPacket::Publish(_) => { PacketType::Publish }
        ControlPacket::Puback(_) => { PacketType::Puback }
        ControlPacket::Pubrec(_) => { PacketType::Pubrec }
        ControlPacket::Pubrel(_) => { PacketType::Pubrel }
        ControlPacket::Pubcomp(_) => { PacketType::Pubcomp }
        ControlPacket::Subscribe(_) => { PacketType::Subscribe }
        ControlPacket::Suback(_) => { PacketType::Suback }
        ControlPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
        ControlPacket::Unsuback(_) => { PacketType::Unsuback }
        ControlPacket::Pingreq(_) => { PacketType::Pingreq }
        ControlPacket::Pingresp(_) => { PacketType::Pingresp }
        ControlPacket::Disconnect(_) => { PacketType::Disconnect }
        ControlPacket::Auth(_) => { PacketType::Auth }
    }
}

pub(crate) fn packet_type_to_str(packet_type: u8) -> &'static str {
    match packet_type {
        PACKET_TYPE_CONNECT => { "Connect" }
        PACKET_TYPE_CONNACK => { "Connack" }
        PACKET_TYPE_PUBLISH => { "Publish" }
        PACKET_TYPE_PUBACK => { "Puback" }
        PACKET_TYPE_PUBREC => { "Pubrec" }
        PACKET_TYPE_PUBREL => { "Pubrel" }
        PACKET_TYPE_PUBCOMP => { "Pubcomp" }
        PACKET_TYPE_SUBSCRIBE => { "Subscribe" }
        PACKET_TYPE_SUBACK => { "Suback" }
        PACKET_TYPE_UNSUBSCRIBE => { "Unsubscribe" }
        PACKET_TYPE_UNSUBACK => { "Unsuback" }
        PACKET_TYPE_PINGREQ => { "Pingreq" }
        PACKET_TYPE_PINGRESP => { "Pingresp" }
        PACKET_TYPE_DISCONNECT => { "Disconnect" }
        PACKET_TYPE_AUTH => { "Auth" }
        _ => {
            "Unknown"
        }
    }
}

pub(crate) fn control_packet_to_str(packet: &ControlPacket) -> &'static str {
    match packet {
        ControlPacket::Connect(_) => { "CONNECT" }
        ControlPacket::Connack(_) => { "CONNACK" }
        ControlPacket::Publish(_) => { "PUBLISH" }
        ControlPacket::Puback(_) => { "PUBACK" }
        ControlPacket::Pubrec(_) => { "PUBREC" }
        ControlPacket::Pubrel(_) => { "PUBREL" }
        ControlPacket::Pubcomp(_) => { "PUBCOMP" }
        ControlPacket::Subscribe(_) => { "SUBSCRIBE" }
        ControlPacket::Suback(_) => { "SUBACK" }
        ControlPacket::Unsubscribe(_) => { "UNSUBSCRIBE" }
        ControlPacket::Unsuback(_) => { "UNSUBACK" }
        ControlPacket::Pingreq(_) => { "PINGREQ" }
        ControlPacket::Pingresp(_) => { "PINGRESP" }
        ControlPacket::Disconnect(_) => { "DISCONNECT" }
        ControlPacket::Auth(_) => { "AUTH" }
    }
}

/*****************************************************/

macro_rules! define_ack_packet_lengths_function {
    ($function_name: ident, $packet_type: ident, $reason_code_type: ident) => {
        pub(crate) fn $function_name(packet: &$packet_type, version: ProtocolVersion) -> DimqResult<(usize, usize)> {
            if !version.is_v5() {
                return Ok((2, 0));
            }

            let property_section_length = get_remaining_length(&packet.properties);
            if property_section_length == 0 {
                if packet.reason_code == $reason_code_type::Success {
                    return Ok((2, 0));
                } else {
                    return Ok((3, 0));
                }
            }

            Ok((3 + property_section_length + compute_variable_length_integer_encode_size(property_section_length)?, property_section_length))
        }
    };
}

pub(crate) use define_ack_packet_lengths_function;

macro_rules! define_ack_packet_write_function {
    ($function_name: ident, $packet_type: ident, $packet_type_variant: ident, $packet_type_as_string: expr, $first_byte: expr, $property_context: expr, $lengths_function_name: ident) => {
        pub(crate) fn $function_name(packet: &$packet_type, version: ProtocolVersion, dest: &mut Vec<u8>) -> DimqResult<()> {
            if packet.packet_id == 0 {
                error!("{}Packet Encode - packet id must be non-zero", $packet_type_as_string);
                return Err(DimqError::new_packet_validation(PacketType::$packet_type_variant, "packet id must be non-zero"));
            }

            let (remaining_length, property_section_length) = $lengths_function_name(packet, version)?;
            if version.is_v5() {
                validate_properties($property_context, &packet.properties)?;
            }

            encode_fixed_header(dest, $first_byte, remaining_length)?;
            encode_u16(dest, packet.packet_id);
            if remaining_length == 2 {
                return Ok(());
            }

            encode_u8(dest, packet.reason_code as u8);
            if remaining_length == 3 {
                return Ok(());
            }

            write_properties_with_length(&packet.properties, property_section_length, dest)
        }
    };
}

pub(crate) use define_ack_packet_write_function;

macro_rules! define_ack_packet_decode_function {
    ($function_name: ident, $control_packet_variant: ident, $packet_type: ident, $packet_type_as_string: expr, $first_byte: expr, $reason_code_converter_function_name: ident, $property_context: expr) => {
        pub(crate) fn $function_name(first_byte: u8, packet_body: &[u8], version: ProtocolVersion) -> DimqResult<ControlPacket> {
            if first_byte != $first_byte {
                error!("{}Packet Decode - invalid first byte", $packet_type_as_string);
                return Err(DimqError::new_malformed_packet("invalid first byte for ack packet"));
            }

            let mut packet = $packet_type { ..Default::default() };
            let mut mutable_body = packet_body;
            mutable_body = decode_u16(mutable_body, &mut packet.packet_id)?;
            if packet.packet_id == 0 {
                error!("{}Packet Decode - packet id of zero", $packet_type_as_string);
                return Err(DimqError::new_protocol_error("ack packet with zero packet id"));
            }

            if !version.is_v5() {
                if !mutable_body.is_empty() {
                    error!("{}Packet Decode - mqtt3 ack packet has trailing bytes", $packet_type_as_string);
                    return Err(DimqError::new_malformed_packet("mqtt3 ack packet remaining length must be 2"));
                }

                return Ok(ControlPacket::$control_packet_variant(packet));
            }

            if mutable_body.is_empty() {
                /* Success is the default, so nothing to do */
                return Ok(ControlPacket::$control_packet_variant(packet));
            }

            mutable_body = decode_u8_as_enum(mutable_body, &mut packet.reason_code, $reason_code_converter_function_name)?;
            if mutable_body.is_empty() {
                return Ok(ControlPacket::$control_packet_variant(packet));
            }

            let (properties, remaining_bytes) = read_properties($property_context, mutable_body)?;
            if !remaining_bytes.is_empty() {
                error!("{}Packet Decode - property length does not match remaining packet length", $packet_type_as_string);
                return Err(DimqError::new_malformed_packet("mismatch between property length and remaining packet length for ack packet"));
            }

            packet.properties = properties;

            Ok(ControlPacket::$control_packet_variant(packet))
        }
    };
}

pub(crate) use define_ack_packet_decode_function;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn reason_code_conversions() {
        assert_eq!(PubackReasonCode::QuotaExceeded, convert_u8_to_puback_reason_code(151).unwrap());
        assert_eq!(SubackReasonCode::GrantedQos2, convert_u8_to_suback_reason_code(2).unwrap());
        assert_eq!(DisconnectReasonCode::SessionTakenOver, convert_u8_to_disconnect_reason_code(142).unwrap());
        assert_matches!(convert_u8_to_puback_reason_code(3), Err(DimqError::MalformedPacket(_)));
        assert_matches!(convert_u8_to_quality_of_service(3), Err(DimqError::MalformedPacket(_)));
    }

    #[test]
    fn v3_connack_return_codes() {
        assert_eq!(5, ConnectReasonCode::NotAuthorized.to_v3_return_code());
        assert_eq!(2, ConnectReasonCode::ClientIdentifierNotValid.to_v3_return_code());
        assert_eq!(ConnectReasonCode::BadUsernameOrPassword, ConnectReasonCode::from_v3_return_code(4).unwrap());
        assert_matches!(ConnectReasonCode::from_v3_return_code(6), Err(DimqError::MalformedPacket(_)));
    }

    #[test]
    fn protocol_levels() {
        assert_eq!(ProtocolVersion::Mqtt31, convert_u8_to_protocol_version(3).unwrap());
        assert_eq!(ProtocolVersion::Mqtt5, convert_u8_to_protocol_version(5).unwrap());
        assert_matches!(convert_u8_to_protocol_version(6), Err(DimqError::ProtocolError(_)));
    }
}
