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
define_ack_packet_lengths_function!(compute_pubrel_packet_length_properties, PubrelPacket, PubrelReasonCode);
define_ack_packet_write_function!(write_pubrel_packet, PubrelPacket, Pubrel, "Pubrel", PUBREL_FIRST_BYTE, PropertyContext::Pubrel, compute_pubrel_packet_length_properties);
define_ack_packet_decode_function!(decode_pubrel_packet, Pubrel, PubrelPacket, "Pubrel", PUBREL_FIRST_BYTE, convert_u8_to_pubrel_reason_code, PropertyContext::Pubrel);

define_ack_packet_display_trait!(PubrelPacket, "PubrelPacket");
