//! Out-of-band codec configuration
//!
//! [`CodecConfig`] holds the parameter sets and AudioSpecificConfig a
//! decoder needs before the first packet of each type. RTMP carries them as
//! decoder configuration records inside sequence headers, RTSP carries them
//! in SDP `fmtp` lines; both end up here.
//!
//! AVCDecoderConfigurationRecord:
//! ```text
//! version(1) profile(1) compat(1) level(1) 0xFC|lengthSizeMinusOne(1)
//! 0xE0|numSPS(1) { len(2) sps }* numPPS(1) { len(2) pps }*
//! ```
//!
//! HEVCDecoderConfigurationRecord: 22 bytes of profile/tier/level fields,
//! then `numArrays(1) { type(1) numNalus(2) { len(2) nalu }* }*`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::nal::{self, HEVC_NAL_PPS, HEVC_NAL_SPS, HEVC_NAL_VPS};
use super::packet::PayloadType;
use crate::error::{MediaError, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodecConfig {
    /// AAC AudioSpecificConfig
    pub asc: Option<Bytes>,
    /// Present for H.265 only
    pub vps: Option<Bytes>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
}

impl CodecConfig {
    pub fn is_empty(&self) -> bool {
        self.asc.is_none() && self.sps.is_none() && self.pps.is_none() && self.vps.is_none()
    }

    pub fn has_audio(&self) -> bool {
        self.asc.is_some()
    }

    /// Video codec implied by the parameter sets, if complete
    pub fn video_codec(&self) -> Option<PayloadType> {
        match (&self.vps, &self.sps, &self.pps) {
            (Some(_), Some(_), Some(_)) => Some(PayloadType::Hevc),
            (None, Some(_), Some(_)) => Some(PayloadType::Avc),
            _ => None,
        }
    }

    /// Overlay the fields that `other` carries
    pub fn merge(&mut self, other: &CodecConfig) {
        if other.asc.is_some() {
            self.asc = other.asc.clone();
        }
        if other.sps.is_some() || other.pps.is_some() {
            // a new video config replaces the whole set
            self.vps = other.vps.clone();
            self.sps = other.sps.clone();
            self.pps = other.pps.clone();
        }
    }

    /// Build the record matching [`video_codec`](Self::video_codec)
    pub fn video_record(&self) -> Result<Bytes> {
        match (&self.vps, &self.sps, &self.pps) {
            (Some(vps), Some(sps), Some(pps)) => Ok(build_hevc_record(vps, sps, pps)),
            (None, Some(sps), Some(pps)) => build_avc_record(sps, pps),
            _ => Err(MediaError::MissingConfig.into()),
        }
    }
}

pub fn build_avc_record(sps: &[u8], pps: &[u8]) -> Result<Bytes> {
    if sps.len() < 4 {
        return Err(MediaError::Truncated("sps").into());
    }
    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(1);
    buf.put_u8(sps[1]);
    buf.put_u8(sps[2]);
    buf.put_u8(sps[3]);
    buf.put_u8(0xFF); // 4-byte NALU lengths
    buf.put_u8(0xE1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(1);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    Ok(buf.freeze())
}

/// Returns `(sps, pps)`; only the first of each is kept
pub fn parse_avc_record(mut data: Bytes) -> Result<(Bytes, Bytes)> {
    if data.len() < 6 {
        return Err(MediaError::InvalidConfigRecord.into());
    }
    data.advance(5);
    let num_sps = data.get_u8() & 0x1F;
    let mut sps = None;
    for _ in 0..num_sps {
        let unit = read_unit(&mut data)?;
        sps.get_or_insert(unit);
    }

    if !data.has_remaining() {
        return Err(MediaError::InvalidConfigRecord.into());
    }
    let num_pps = data.get_u8();
    let mut pps = None;
    for _ in 0..num_pps {
        let unit = read_unit(&mut data)?;
        pps.get_or_insert(unit);
    }

    match (sps, pps) {
        (Some(sps), Some(pps)) => Ok((sps, pps)),
        _ => Err(MediaError::InvalidConfigRecord.into()),
    }
}

pub fn build_hevc_record(vps: &[u8], sps: &[u8], pps: &[u8]) -> Bytes {
    // general_profile_space..general_level_idc, 12 bytes after the SPS
    // header byte that follows the 2-byte NAL header
    let rbsp = nal::to_rbsp(sps);
    let mut ptl = [0u8; 12];
    if rbsp.len() >= 15 {
        ptl.copy_from_slice(&rbsp[3..15]);
    } else {
        ptl[0] = 0x01; // Main profile
        ptl[11] = 93; // level 3.1
    }

    let mut buf = BytesMut::with_capacity(23 + 15 + vps.len() + sps.len() + pps.len());
    buf.put_u8(1);
    buf.put_slice(&ptl);
    buf.put_u16(0xF000); // min_spatial_segmentation_idc
    buf.put_u8(0xFC); // parallelismType
    buf.put_u8(0xFD); // chroma_format_idc 4:2:0
    buf.put_u8(0xF8); // bit_depth_luma_minus8
    buf.put_u8(0xF8); // bit_depth_chroma_minus8
    buf.put_u16(0); // avgFrameRate
    buf.put_u8(0x0F); // 1 temporal layer, nested, 4-byte lengths
    buf.put_u8(3);
    for (nal_type, unit) in [(HEVC_NAL_VPS, vps), (HEVC_NAL_SPS, sps), (HEVC_NAL_PPS, pps)] {
        buf.put_u8(0x80 | nal_type);
        buf.put_u16(1);
        buf.put_u16(unit.len() as u16);
        buf.put_slice(unit);
    }
    buf.freeze()
}

/// Returns `(vps, sps, pps)`
pub fn parse_hevc_record(mut data: Bytes) -> Result<(Bytes, Bytes, Bytes)> {
    if data.len() < 23 {
        return Err(MediaError::InvalidConfigRecord.into());
    }
    data.advance(22);
    let num_arrays = data.get_u8();

    let (mut vps, mut sps, mut pps) = (None, None, None);
    for _ in 0..num_arrays {
        if data.remaining() < 3 {
            return Err(MediaError::InvalidConfigRecord.into());
        }
        let nal_type = data.get_u8() & 0x3F;
        let count = data.get_u16();
        for _ in 0..count {
            let unit = read_unit(&mut data)?;
            let slot = match nal_type {
                HEVC_NAL_VPS => &mut vps,
                HEVC_NAL_SPS => &mut sps,
                HEVC_NAL_PPS => &mut pps,
                _ => continue,
            };
            slot.get_or_insert(unit);
        }
    }

    match (vps, sps, pps) {
        (Some(vps), Some(sps), Some(pps)) => Ok((vps, sps, pps)),
        _ => Err(MediaError::InvalidConfigRecord.into()),
    }
}

fn read_unit(data: &mut Bytes) -> Result<Bytes> {
    if data.remaining() < 2 {
        return Err(MediaError::InvalidConfigRecord.into());
    }
    let len = data.get_u16() as usize;
    if data.remaining() < len {
        return Err(MediaError::InvalidConfigRecord.into());
    }
    Ok(data.split_to(len))
}
