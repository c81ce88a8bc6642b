/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::decode::utils::*;
use crate::encode::utils::*;
use crate::error::{DimqError, DimqResult};
use crate::logging::*;
use crate::mqtt::*;
use crate::mqtt::property::*;
use crate::mqtt::utils::*;

use log::*;

use std::fmt;

#[rustfmt::skip]
define_ack_packet_lengths_function!(compute_puback_packet_length_properties, PubackPacket, PubackReasonCode);
define_ack_packet_write_function!(write_puback_packet, PubackPacket, Puback, "Puback", PUBACK_FIRST_BYTE, PropertyContext::Puback, compute_puback_packet_length_properties);
define_ack_packet_decode_function!(decode_puback_packet, Puback, PubackPacket, "Puback", PUBACK_FIRST_BYTE, convert_u8_to_puback_reason_code, PropertyContext::Puback);

define_ack_packet_display_trait!(PubackPacket, "PubackPacket");
