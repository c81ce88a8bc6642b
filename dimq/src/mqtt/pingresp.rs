/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::encode::utils::*;
use crate::error::{DimqError, DimqResult};
use crate::mqtt::*;
use crate::mqtt::utils::*;

use log::*;

use std::fmt;

pub(crate) fn write_pingresp_packet(_: &PingrespPacket, dest: &mut Vec<u8>) -> DimqResult<()> {
    encode_u8(dest, PINGRESP_FIRST_BYTE);
    encode_u8(dest, 0);

    Ok(())
}

pub(crate) fn decode_pingresp_packet(first_byte: u8, packet_body: &[u8]) -> DimqResult<ControlPacket> {
    if !packet_body.is_empty() {
        error!("Packet Decode - Pingresp packet with non-zero remaining length");
        return Err(DimqError::new_malformed_packet("pingresp packet with non-zero remaining length"));
    }

    if first_byte != PINGRESP_FIRST_BYTE {
        error!("Packet Decode - Pingresp packet with invalid first byte");
        return Err(DimqError::new_malformed_packet("pingresp packet with invalid first byte"));
    }

    Ok(ControlPacket::Pingresp(PingrespPacket{}))
}

impl fmt::Display for PingrespPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PingrespPacket {{}}")
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::decode::testing::*;

    #[test]
    fn pingresp_round_trip_encode_decode() {
        let packet = PingrespPacket {};
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Pingresp(packet.clone()), ProtocolVersion::Mqtt5));
        assert!(do_round_trip_encode_decode_test(&ControlPacket::Pingresp(packet), ProtocolVersion::Mqtt31));
    }

    #[test]
    fn pingresp_decode_failure_bad_fixed_header() {
        let packet = PingrespPacket {};

        do_fixed_header_flag_decode_failure_test(&ControlPacket::Pingresp(packet), ProtocolVersion::Mqtt311, 4);
    }

    #[test]
    fn pingresp_decode_failure_bad_length() {
        let packet = PingrespPacket {};

        let extend_length = | bytes: &[u8] | -> Vec<u8> {
            let mut clone = bytes.to_vec();

            clone[1] = 2;
            clone.push(5);
            clone.push(6);

            clone
        };

        do_mutated_decode_failure_test(&ControlPacket::Pingresp(packet), ProtocolVersion::Mqtt311, extend_length);
    }
}
