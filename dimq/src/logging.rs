/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::mqtt::*;
use log::*;

macro_rules! log_primitive_value {
    ($integral_value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:{}", $log_field, $integral_value)?;
    };
}

pub(crate) use log_primitive_value;

macro_rules! log_enum {
    ($enum_value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:{}", $log_field, $enum_value)?;
    };
}

pub(crate) use log_enum;

macro_rules! log_string {
    ($value: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:\"{}\"", $log_field, $value)?;
    };
}

pub(crate) use log_string;

macro_rules! log_optional_string {
    ($optional_string: expr, $formatter: expr, $log_field: expr, $value:ident) => {
        if let Some($value) = &$optional_string {
            write!($formatter, " {}:\"{}\"", $log_field, $value)?;
        }
    };
}

pub(crate) use log_optional_string;

macro_rules! log_optional_sensitive {
    ($optional_value: expr, $formatter: expr, $log_field: expr) => {
        if $optional_value.is_some() {
            write!($formatter, " {}:<...redacted>", $log_field)?;
        }
    };
}

pub(crate) use log_optional_sensitive;

macro_rules! log_binary_data {
    ($data: expr, $formatter: expr, $log_field: expr) => {
        write!($formatter, " {}:<{} Bytes>", $log_field, $data.len())?;
    };
}

pub(crate) use log_binary_data;

macro_rules! log_properties {
    ($properties: expr, $formatter: expr, $log_field: expr) => {
        if !$properties.is_empty() {
            write!($formatter, " {}:{}", $log_field, $properties)?;
        }
    };
}

pub(crate) use log_properties;

macro_rules! define_ack_packet_display_trait {
    ($packet_type: ident, $packet_name: expr) => {
        impl fmt::Display for $packet_type {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{} {{", $packet_name)?;
                log_primitive_value!(self.packet_id, f, "packet_id");
                log_enum!(self.reason_code, f, "reason_code");
                log_properties!(self.properties, f, "properties");
                write!(f, " }}")
            }
        }
    };
}

pub(crate) use define_ack_packet_display_trait;

fn get_packet_type_for_logging(packet: &ControlPacket) -> &'static str {
    match packet {
        ControlPacket::Connect(_) => { "ConnectPacket{...}" }
        ControlPacket::Connack(_) => { "ConnackPacket{...}" }
        ControlPacket::Publish(_) => { "PublishPacket{...}" }
        ControlPacket::Puback(_) => { "PubackPacket{...}" }
        ControlPacket::Pubrec(_) => { "PubrecPacket{...}" }
        ControlPacket::Pubrel(_) => { "PubrelPacket{...}" }
        ControlPacket::Pubcomp(_) => { "PubcompPacket{...}" }
        ControlPacket::Subscribe(_) => { "SubscribePacket{...}" }
        ControlPacket::Suback(_) => { "SubackPacket{...}" }
        ControlPacket::Unsubscribe(_) => { "UnsubscribePacket{...}" }
        ControlPacket::Unsuback(_) => { "UnsubackPacket{...}" }
        ControlPacket::Pingreq(_) => { "PingreqPacket{...}" }
        ControlPacket::Pingresp(_) => { "PingrespPacket{...}" }
        ControlPacket::Disconnect(_) => { "DisconnectPacket{...}" }
        ControlPacket::Auth(_) => { "AuthPacket{...}" }
    }
}

/// Logs a packet at info level as a bare type name, or in full at debug and trace
pub(crate) fn log_packet(prefix: &str, packet: &ControlPacket) {
    let level = log::max_level();
    match level {
        LevelFilter::Info => {
            info!("{}{}", prefix, get_packet_type_for_logging(packet));
        }
        LevelFilter::Debug | LevelFilter::Trace => {
            debug!("{}{}", prefix, packet);
        }
        _ => {}
    }
}
