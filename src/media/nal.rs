//! H.264 / H.265 NAL unit helpers
//!
//! Video payloads inside the crate are AVCC: each NAL unit prefixed by a
//! 4-byte big-endian length. RTP delivers bare NAL units and MPEG-TS wants
//! Annex-B start codes, so conversion happens at those edges only.

use bytes::{BufMut, Bytes, BytesMut};

/// Length prefix used for every AVCC payload built by this crate
pub const NALU_LENGTH_SIZE: usize = 4;

pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

// H.264 nal_unit_type values
pub const AVC_NAL_SLICE: u8 = 1;
pub const AVC_NAL_IDR: u8 = 5;
pub const AVC_NAL_SEI: u8 = 6;
pub const AVC_NAL_SPS: u8 = 7;
pub const AVC_NAL_PPS: u8 = 8;
pub const AVC_NAL_AUD: u8 = 9;

// H.265 nal_unit_type values
pub const HEVC_NAL_BLA_W_LP: u8 = 16;
pub const HEVC_NAL_CRA: u8 = 21;
pub const HEVC_NAL_VPS: u8 = 32;
pub const HEVC_NAL_SPS: u8 = 33;
pub const HEVC_NAL_PPS: u8 = 34;
pub const HEVC_NAL_AUD: u8 = 35;

#[inline]
pub fn avc_nal_type(header: u8) -> u8 {
    header & 0x1F
}

#[inline]
pub fn hevc_nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// IRAP pictures (BLA, IDR, CRA) start a decodable sequence
#[inline]
pub fn is_hevc_irap(nal_type: u8) -> bool {
    (HEVC_NAL_BLA_W_LP..=HEVC_NAL_CRA).contains(&nal_type)
}

/// Iterator over NAL units of an AVCC buffer; stops at the first truncated unit
pub struct NaluIterator<'a> {
    data: &'a [u8],
    offset: usize,
    length_size: usize,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_length_size(data, NALU_LENGTH_SIZE)
    }

    pub fn with_length_size(data: &'a [u8], length_size: usize) -> Self {
        Self {
            data,
            offset: 0,
            length_size,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.length_size == 0 || self.offset + self.length_size > self.data.len() {
            return None;
        }

        let mut len = 0usize;
        for i in 0..self.length_size {
            len = (len << 8) | self.data[self.offset + i] as usize;
        }
        self.offset += self.length_size;

        if self.offset + len > self.data.len() {
            return None;
        }
        let nalu = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(nalu)
    }
}

/// Append `nalu` to an AVCC buffer
pub fn put_avcc(buf: &mut BytesMut, nalu: &[u8]) {
    buf.put_u32(nalu.len() as u32);
    buf.put_slice(nalu);
}

/// Join bare NAL units into one AVCC payload
pub fn to_avcc<'a, I>(nalus: I) -> Bytes
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut buf = BytesMut::new();
    for nalu in nalus {
        put_avcc(&mut buf, nalu);
    }
    buf.freeze()
}

/// Append each NAL unit of an AVCC buffer to `out` with a 4-byte start code
pub fn avcc_to_annexb(avcc: &[u8], out: &mut BytesMut) {
    for nalu in NaluIterator::new(avcc) {
        out.put_slice(&START_CODE);
        out.put_slice(nalu);
    }
}

/// Remove emulation prevention bytes (`00 00 03` -> `00 00`)
pub fn to_rbsp(nalu: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nalu.len());
    let mut zeros = 0;
    for &b in nalu {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        if b == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        out.push(b);
    }
    out
}
