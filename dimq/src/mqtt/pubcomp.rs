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
define_ack_packet_lengths_function!(compute_pubcomp_packet_length_properties, PubcompPacket, PubcompReasonCode);
define_ack_packet_write_function!(write_pubcomp_packet, PubcompPacket, Pubcomp, "Pubcomp", PUBCOMP_FIRST_BYTE, PropertyContext::Pubcomp, compute_pubcomp_packet_length_properties);
define_ack_packet_decode_function!(decode_pubcomp_packet, Pubcomp, PubcompPacket, "Pubcomp", PUBCOMP_FIRST_BYTE, convert_u8_to_pubcomp_reason_code, PropertyContext::Pubcomp);

define_ack_packet_display_trait!(PubcompPacket, "PubcompPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    #[test]
    fn pubcomp_round_trip_encode_decode_success_no_props() {
        let packet = PubcompPacket {
            packet_id: 1234,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&ControlPacket::Pubcomp(packet), ProtocolVersion::Mqtt5));
    }

    fn create_pubcomp_with_all_properties() -> PubcompPacket {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::ReasonString, PropertyValue::String("never heard of it".to_string())).unwrap();
        properties.add_user_property("pubcomp1", "value1");
        properties.add_user_property("pubcomp2", "value2");

        PubcompPacket {
            packet_id: 1025,
            reason_code: PubcompReasonCode::PacketIdentifierNotFound,
            properties,
        }
    }

    #[test]
    fn pubcomp_round_trip_encode_decode_failure_with_props() {
        let packet = create_pubcomp_with_all_properties();
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Pubcomp(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn pubcomp_decode_failure_bad_fixed_header() {
        let packet = create_pubcomp_with_all_properties();
        do_fixed_header_flag_decode_failure_test(&ControlPacket::Pubcomp(packet), ProtocolVersion::Mqtt5, 2);
    }

    #[test]
    fn pubcomp_decode_failure_packet_size() {
        let packet = create_pubcomp_with_all_properties();
        do_inbound_size_decode_failure_test(&ControlPacket::Pubcomp(packet), ProtocolVersion::Mqtt5);
    }

    #[test]
    fn pubcomp_decode_failure_zero_packet_id() {
        let mut decoder = crate::decode::Decoder::new();
        let mut packets = VecDeque::new();
        let mut context = crate::decode::DecodingContext {
            maximum_packet_size: 0,
            protocol_version: ProtocolVersion::Mqtt311,
            decoded_packets: &mut packets,
        };

        let result = decoder.decode_bytes(&[0x70, 0x02, 0x00, 0x00], &mut context);
        assert_matches!(result, Err(DimqError::ProtocolError(_)));
    }
}
