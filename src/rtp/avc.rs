//! H.264 RTP payload format (RFC 6184), non-interleaved mode

use bytes::{Buf, Bytes};

use super::NalPayload;
use crate::error::{ProtocolError, Result};

const STAP_A: u8 = 24;
const FU_A: u8 = 28;

pub fn split_payload(payload: &Bytes) -> Result<NalPayload> {
    if payload.is_empty() {
        return Err(ProtocolError::MalformedRtp("empty h264 payload").into());
    }

    match payload[0] & 0x1F {
        1..=23 => Ok(NalPayload::Units(vec![payload.clone()])),
        STAP_A => {
            let mut rest = payload.slice(1..);
            let mut units = Vec::new();
            while rest.remaining() >= 2 {
                let size = rest.get_u16() as usize;
                if size > rest.len() {
                    return Err(ProtocolError::MalformedRtp("stap-a unit exceeds packet").into());
                }
                units.push(rest.split_to(size));
            }
            Ok(NalPayload::Units(units))
        }
        FU_A => {
            if payload.len() < 2 {
                return Err(ProtocolError::MalformedRtp("short fu-a").into());
            }
            let fu_header = payload[1];
            Ok(NalPayload::Fragment {
                start: fu_header & 0x80 != 0,
                end: fu_header & 0x40 != 0,
                header: Bytes::copy_from_slice(&[(payload[0] & 0xE0) | (fu_header & 0x1F)]),
                data: payload.slice(2..),
            })
        }
        _ => Err(ProtocolError::MalformedRtp("unsupported h264 packetization").into()),
    }
}
