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
define_ack_packet_lengths_function!(compute_pubrec_packet_length_properties, PubrecPacket, PubrecReasonCode);
define_ack_packet_write_function!(write_pubrec_packet, PubrecPacket, Pubrec, "Pubrec", PUBREC_FIRST_BYTE, PropertyContext::Pubrec, compute_pubrec_packet_length_properties);
define_ack_packet_decode_function!(decode_pubrec_packet, Pubrec, PubrecPacket, "Pubrec", PUBREC_FIRST_BYTE, convert_u8_to_pubrec_reason_code, PropertyContext::Pubrec);

define_ack_packet_display_trait!(PubrecPacket, "PubrecPacket");

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pubrec_round_trip_encode_decode_success_no_props() {
        let packet = PubrecPacket {
            packet_id: 1234,
            ..Default::default()
        };

        assert!(do_round_trip_encode_decode_test(&ControlPacket::Pubrec(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Pubrec(packet), ProtocolVersion::Mqtt31));
    }

    fn create_pubrec_with_all_properties() -> PubrecPacket {
        let mut properties = PropertyList::new();
        properties.add(PropertyIdentifier::ReasonString, PropertyValue::String("not on my watch".to_string())).unwrap();
        properties.add_user_property("pubrec", "value");

        PubrecPacket {
            packet_id: 65535,
            reason_code: PubrecReasonCode::NotAuthorized,
            properties,
        }
    }

    #[test]
    fn pubrec_round_trip_encode_decode_failure_with_props() {
        let packet = create_pubrec_with_all_properties();
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Pubrec(packet), ProtocolVersion::Mqtt5));
    }

    #[test]
    fn pubrec_decode_failure_bad_fixed_header() {
        let packet = create_pubrec_with_all_properties();
        do_fixed_header_flag_decode_failure_test(&ControlPacket::Pubrec(packet), ProtocolVersion::Mqtt5, 9);
    }

    #[test]
    fn pubrec_decode_failure_disallowed_property() {
        let packet = create_pubrec_with_all_properties();

        let add_topic_alias = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            clone[1] += 3;
            clone[5] += 3;

            clone.push(PropertyIdentifier::TopicAlias as u8);
            clone.push(0);
            clone.push(4);

            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Pubrec(packet), ProtocolVersion::Mqtt5, add_topic_alias);
    }

    #[test]
    fn pubrec_decode_failure_packet_size() {
        let packet = create_pubrec_with_all_properties();
        do_inbound_size_decode_failure_test(&ControlPacket::Pubrec(packet), ProtocolVersion::Mqtt5);
    }
}
