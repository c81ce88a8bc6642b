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

pub(crate) fn write_pingreq_packet(_: &PingreqPacket, dest: &mut Vec<u8>) -> DimqResult<()> {
    encode_u8(dest, PINGREQ_FIRST_BYTE);
    encode_u8(dest, 0);

    Ok(())
}

pub(crate) fn decode_pingreq_packet(first_byte: u8, packet_body: &[u8]) -> DimqResult<ControlPacket> {
    if !packet_body.is_empty() {
        error!("Packet Decode - Pingreq packet with non-zero remaining length");
        return Err(DimqError::new_malformed_packet("pingreq packet with non-zero remaining length"));
    }

    if first_byte != PINGREQ_FIRST_BYTE {
        error!("Packet Decode - Pingreq packet with invalid first byte");
        return Err(DimqError::new_malformed_packet("pingreq packet with invalid first byte"));
    }

    Ok(ControlPacket::Pingreq(PingreqPacket{}))
}

impl fmt::Display for PingreqPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PingreqPacket {{}}")
    }
}
