//! MPEG-4 AAC over RTP, AAC-hbr mode (RFC 3640)
//!
//! ```text
//! +---------+-----------+-----------+---------------+
//! | RTP     | AU Header | Auxiliary | Access Unit   |
//! | Header  | Section   | Section   | Data Section  |
//! +---------+-----------+-----------+---------------+
//! ```
//!
//! The AU header section starts with its length in bits; each AU header is
//! a 13-bit size and a 3-bit index.

use bytes::Bytes;

use super::{AccessUnit, RtpPacket, SequenceTracker};
use crate::error::{ProtocolError, Result};

const AU_HEADER_SIZE: usize = 2;
const SAMPLES_PER_FRAME: u32 = 1024;

#[derive(Debug, Default)]
pub struct AacDepacketizer {
    seq: SequenceTracker,
}

impl AacDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split one RTP payload into access units. The n-th unit is stamped
    /// `timestamp + n * 1024` in the track clock. A lost packet only loses
    /// its own units, so gaps are counted and otherwise ignored.
    pub fn push(&mut self, pkt: &RtpPacket, out: &mut Vec<AccessUnit>) -> Result<()> {
        self.seq.observe(pkt.header.sequence_number);
        let timestamp = pkt.header.timestamp;
        let payload: &Bytes = &pkt.payload;
        if payload.len() < 2 {
            return Err(ProtocolError::MalformedRtp("short aac payload").into());
        }
        let headers_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let headers_len = (headers_bits + 7) / 8;
        let count = headers_len / AU_HEADER_SIZE;
        if payload.len() < 2 + headers_len {
            return Err(ProtocolError::MalformedRtp("truncated au headers").into());
        }

        let mut offset = 2 + headers_len;
        for i in 0..count {
            let h = 2 + i * AU_HEADER_SIZE;
            let size = (u16::from_be_bytes([payload[h], payload[h + 1]]) >> 3) as usize;
            if offset + size > payload.len() {
                return Err(ProtocolError::MalformedRtp("aac access unit exceeds packet").into());
            }
            out.push(AccessUnit {
                timestamp: timestamp.wrapping_add(i as u32 * SAMPLES_PER_FRAME),
                payload: payload.slice(offset..offset + size),
            });
            offset += size;
        }
        Ok(())
    }

    /// Packets lost to sequence gaps so far
    pub fn lost_packets(&self) -> u64 {
        self.seq.lost()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::RtpHeader;

    fn rtp(seq: u16, ts: u32, payload: Vec<u8>) -> RtpPacket {
        RtpPacket::new(
            RtpHeader {
                marker: true,
                payload_type: 97,
                sequence_number: seq,
                timestamp: ts,
                ssrc: 1,
            },
            Bytes::from(payload),
        )
    }

    #[test]
    fn test_two_access_units() {
        let mut payload = vec![0x00, 0x20]; // 32 bits of AU headers
        payload.extend_from_slice(&[(3 >> 5) as u8, (3 << 3) as u8]);
        payload.extend_from_slice(&[0x00, 2 << 3]);
        payload.extend_from_slice(&[1, 2, 3, 4, 5]);

        let mut out = Vec::new();
        AacDepacketizer::new()
            .push(&rtp(1, 1000, payload), &mut out)
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].payload[..], &[1, 2, 3]);
        assert_eq!(out[0].timestamp, 1000);
        assert_eq!(&out[1].payload[..], &[4, 5]);
        assert_eq!(out[1].timestamp, 2024);
    }

    #[test]
    fn test_truncated_unit() {
        let mut out = Vec::new();
        let mut d = AacDepacketizer::new();
        assert!(d.push(&rtp(1, 0, vec![0x00, 0x10, 0x00, 0x50, 1, 2]), &mut out).is_err());
        assert!(d.push(&rtp(2, 0, vec![0]), &mut out).is_err());
    }

    #[test]
    fn test_sequence_gap_counted() {
        let single = || vec![0x00, 0x10, 0x00, 0x10, 0xAA, 0xBB];
        let mut d = AacDepacketizer::new();
        let mut out = Vec::new();
        d.push(&rtp(7, 0, single()), &mut out).unwrap();
        d.push(&rtp(8, 1024, single()), &mut out).unwrap();
        // 9 and 10 lost
        d.push(&rtp(11, 4096, single()), &mut out).unwrap();
        assert_eq!(out.len(), 3);
        assert_eq!(out[2].timestamp, 4096);
        assert_eq!(d.lost_packets(), 2);
    }
}
