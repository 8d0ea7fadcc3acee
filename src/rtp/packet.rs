//! RTP fixed header (RFC 3550)
//!
//! ```text
//!  0                   1                   2                   3
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           timestamp                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           synchronization source (SSRC) identifier            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};

pub const RTP_VERSION: u8 = 2;
const FIXED_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Header plus payload with CSRCs, extension and padding removed
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() < FIXED_HEADER_SIZE {
            return Err(ProtocolError::MalformedRtp("short header").into());
        }
        if data[0] >> 6 != RTP_VERSION {
            return Err(ProtocolError::MalformedRtp("bad version").into());
        }

        let padding = data[0] & 0x20 != 0;
        let extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0F) as usize;

        let header = RtpHeader {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };

        let mut start = FIXED_HEADER_SIZE + csrc_count * 4;
        if extension {
            if data.len() < start + 4 {
                return Err(ProtocolError::MalformedRtp("truncated extension").into());
            }
            let words = u16::from_be_bytes([data[start + 2], data[start + 3]]) as usize;
            start += 4 + words * 4;
        }

        let mut end = data.len();
        if padding {
            let pad = data[end - 1] as usize;
            if pad == 0 || pad > end {
                return Err(ProtocolError::MalformedRtp("bad padding").into());
            }
            end -= pad;
        }
        if start > end {
            return Err(ProtocolError::MalformedRtp("header exceeds packet").into());
        }

        Ok(Self {
            header,
            payload: data.slice(start..end),
        })
    }

    /// Serialize without CSRCs, extension or padding
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FIXED_HEADER_SIZE + self.payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8(((self.header.marker as u8) << 7) | (self.header.payload_type & 0x7F));
        buf.put_u16(self.header.sequence_number);
        buf.put_u32(self.header.timestamp);
        buf.put_u32(self.header.ssrc);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Expected-next tracking of RTP sequence numbers
///
/// A number behind the expected one (within half the sequence space) is a
/// late or duplicate packet and leaves the expectation alone.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    next: Option<u16>,
    lost: u64,
}

impl SequenceTracker {
    /// Record `seq`; returns how many packets went missing right before it
    pub fn observe(&mut self, seq: u16) -> u16 {
        let Some(expected) = self.next else {
            self.next = Some(seq.wrapping_add(1));
            return 0;
        };
        let gap = seq.wrapping_sub(expected);
        if gap >= 0x8000 {
            tracing::debug!(expected, got = seq, "late rtp packet");
            return 0;
        }
        self.next = Some(seq.wrapping_add(1));
        if gap > 0 {
            self.lost += gap as u64;
            tracing::debug!(expected, got = seq, lost = gap, "rtp sequence gap");
        }
        gap
    }

    /// Packets missed since the first one seen
    pub fn lost(&self) -> u64 {
        self.lost
    }
}
