//! H.265 RTP payload format (RFC 7798), without DONL

use bytes::{Buf, Bytes};

use super::NalPayload;
use crate::error::{ProtocolError, Result};
use crate::media::nal::hevc_nal_type;

const AGGREGATION_PACKET: u8 = 48;
const FRAGMENTATION_UNIT: u8 = 49;

pub fn split_payload(payload: &Bytes) -> Result<NalPayload> {
    if payload.len() < 2 {
        return Err(ProtocolError::MalformedRtp("short h265 payload").into());
    }

    match hevc_nal_type(payload[0]) {
        0..=47 => Ok(NalPayload::Units(vec![payload.clone()])),
        AGGREGATION_PACKET => {
            let mut rest = payload.slice(2..);
            let mut units = Vec::new();
            while rest.remaining() >= 2 {
                let size = rest.get_u16() as usize;
                if size > rest.len() {
                    return Err(ProtocolError::MalformedRtp("ap unit exceeds packet").into());
                }
                units.push(rest.split_to(size));
            }
            Ok(NalPayload::Units(units))
        }
        FRAGMENTATION_UNIT => {
            if payload.len() < 3 {
                return Err(ProtocolError::MalformedRtp("short h265 fu").into());
            }
            let fu_header = payload[2];
            let nal_type = fu_header & 0x3F;
            Ok(NalPayload::Fragment {
                start: fu_header & 0x80 != 0,
                end: fu_header & 0x40 != 0,
                header: Bytes::copy_from_slice(&[(payload[0] & 0x81) | (nal_type << 1), payload[1]]),
                data: payload.slice(3..),
            })
        }
        _ => Err(ProtocolError::MalformedRtp("unsupported h265 packetization").into()),
    }
}
