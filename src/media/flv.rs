//! FLV framing
//!
//! RTMP audio/video message bodies are FLV tag bodies; HTTP-FLV wraps the
//! same bodies in FLV tag headers. This module converts between those
//! bodies and [`AvPacket`] / [`CodecConfig`].
//!
//! Audio body (AAC only):
//! ```text
//! 0xAF | packetType(1: 0=config, 1=raw) | data
//! ```
//!
//! Video body:
//! ```text
//! frameType(4) codecId(4) | packetType(1) | cts(SI24) | data      legacy
//! 1 frameType(3) packetType(4) | fourcc(4) | [cts(SI24)] | data   enhanced
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::{self, CodecConfig};
use super::packet::{AvPacket, PayloadType};
use crate::error::{MediaError, Result};

pub const TAG_TYPE_AUDIO: u8 = 8;
pub const TAG_TYPE_VIDEO: u8 = 9;
pub const TAG_TYPE_SCRIPT: u8 = 18;

const SOUND_FORMAT_AAC: u8 = 10;
/// AAC, 44 kHz, 16 bit, stereo: the only header value players expect for AAC
const AAC_SOUND_HEADER: u8 = 0xAF;

const CODEC_ID_AVC: u8 = 7;
const CODEC_ID_HEVC: u8 = 12;

const FRAME_TYPE_KEY: u8 = 1;
const FRAME_TYPE_INTER: u8 = 2;

const PACKET_TYPE_SEQUENCE_HEADER: u8 = 0;
const PACKET_TYPE_NALU: u8 = 1;

// enhanced RTMP packet types
const EX_SEQUENCE_START: u8 = 0;
const EX_CODED_FRAMES: u8 = 1;
const EX_CODED_FRAMES_X: u8 = 3;
const FOURCC_HEVC: &[u8; 4] = b"hvc1";
const FOURCC_AVC: &[u8; 4] = b"avc1";

/// What an RTMP audio/video body turned out to contain
#[derive(Debug, Clone, PartialEq)]
pub enum FlvMedia {
    /// Sequence header carrying a partial codec config
    Config(CodecConfig),
    Packet(AvPacket),
    /// End of sequence or other bodies with nothing to forward
    Ignored,
}

pub fn parse_audio(timestamp: u32, mut data: Bytes) -> Result<FlvMedia> {
    if data.len() < 2 {
        return Err(MediaError::Truncated("audio tag").into());
    }
    let format = data[0] >> 4;
    if format != SOUND_FORMAT_AAC {
        return Err(MediaError::UnsupportedAudio(format).into());
    }
    let packet_type = data[1];
    data.advance(2);

    match packet_type {
        PACKET_TYPE_SEQUENCE_HEADER => Ok(FlvMedia::Config(CodecConfig {
            asc: Some(data),
            ..Default::default()
        })),
        _ => Ok(FlvMedia::Packet(AvPacket::audio(timestamp, data))),
    }
}

pub fn parse_video(timestamp: u32, data: Bytes) -> Result<FlvMedia> {
    if data.is_empty() {
        return Err(MediaError::Truncated("video tag").into());
    }
    if data[0] & 0x80 != 0 {
        return parse_enhanced_video(timestamp, data);
    }

    if data.len() < 5 {
        return Err(MediaError::Truncated("video tag").into());
    }
    let codec_id = data[0] & 0x0F;
    let payload_type = match codec_id {
        CODEC_ID_AVC => PayloadType::Avc,
        CODEC_ID_HEVC => PayloadType::Hevc,
        other => return Err(MediaError::UnsupportedVideo(other).into()),
    };
    let packet_type = data[1];
    let cts = read_si24(&data[2..5]);
    let body = data.slice(5..);

    match packet_type {
        PACKET_TYPE_SEQUENCE_HEADER => Ok(FlvMedia::Config(parse_record(payload_type, body)?)),
        PACKET_TYPE_NALU => Ok(FlvMedia::Packet(AvPacket::video(payload_type, timestamp, cts, body))),
        _ => Ok(FlvMedia::Ignored),
    }
}

fn parse_enhanced_video(timestamp: u32, data: Bytes) -> Result<FlvMedia> {
    if data.len() < 5 {
        return Err(MediaError::Truncated("video tag").into());
    }
    let packet_type = data[0] & 0x0F;
    let payload_type = match &data[1..5] {
        f if f == FOURCC_HEVC => PayloadType::Hevc,
        f if f == FOURCC_AVC => PayloadType::Avc,
        _ => return Err(MediaError::UnsupportedVideo(data[0] & 0x0F).into()),
    };

    match packet_type {
        EX_SEQUENCE_START => Ok(FlvMedia::Config(parse_record(payload_type, data.slice(5..))?)),
        EX_CODED_FRAMES => {
            if data.len() < 8 {
                return Err(MediaError::Truncated("video tag").into());
            }
            let cts = read_si24(&data[5..8]);
            Ok(FlvMedia::Packet(AvPacket::video(payload_type, timestamp, cts, data.slice(8..))))
        }
        EX_CODED_FRAMES_X => Ok(FlvMedia::Packet(AvPacket::video(
            payload_type,
            timestamp,
            0,
            data.slice(5..),
        ))),
        _ => Ok(FlvMedia::Ignored),
    }
}

fn parse_record(payload_type: PayloadType, record: Bytes) -> Result<CodecConfig> {
    match payload_type {
        PayloadType::Avc => {
            let (sps, pps) = codec::parse_avc_record(record)?;
            Ok(CodecConfig {
                sps: Some(sps),
                pps: Some(pps),
                ..Default::default()
            })
        }
        _ => {
            let (vps, sps, pps) = codec::parse_hevc_record(record)?;
            Ok(CodecConfig {
                vps: Some(vps),
                sps: Some(sps),
                pps: Some(pps),
                ..Default::default()
            })
        }
    }
}

fn read_si24(b: &[u8]) -> i32 {
    let v = ((b[0] as i32) << 16) | ((b[1] as i32) << 8) | b[2] as i32;
    (v << 8) >> 8
}

/// `0xAF 0x00 <asc>`
pub fn audio_config_body(asc: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + asc.len());
    buf.put_u8(AAC_SOUND_HEADER);
    buf.put_u8(PACKET_TYPE_SEQUENCE_HEADER);
    buf.put_slice(asc);
    buf.freeze()
}

/// Sequence header body for the video part of `config`
pub fn video_config_body(config: &CodecConfig) -> Result<Bytes> {
    let codec_id = match config.video_codec() {
        Some(PayloadType::Hevc) => CODEC_ID_HEVC,
        Some(_) => CODEC_ID_AVC,
        None => return Err(MediaError::MissingConfig.into()),
    };
    let record = config.video_record()?;
    let mut buf = BytesMut::with_capacity(5 + record.len());
    buf.put_u8((FRAME_TYPE_KEY << 4) | codec_id);
    buf.put_u8(PACKET_TYPE_SEQUENCE_HEADER);
    buf.put_slice(&[0, 0, 0]);
    buf.put_slice(&record);
    Ok(buf.freeze())
}

/// Audio or video body for one packet
pub fn packet_body(pkt: &AvPacket) -> Bytes {
    match pkt.payload_type {
        PayloadType::Aac => {
            let mut buf = BytesMut::with_capacity(2 + pkt.payload.len());
            buf.put_u8(AAC_SOUND_HEADER);
            buf.put_u8(PACKET_TYPE_NALU);
            buf.put_slice(&pkt.payload);
            buf.freeze()
        }
        PayloadType::Avc | PayloadType::Hevc => {
            let codec_id = if pkt.payload_type == PayloadType::Hevc {
                CODEC_ID_HEVC
            } else {
                CODEC_ID_AVC
            };
            let frame_type = if pkt.is_keyframe() {
                FRAME_TYPE_KEY
            } else {
                FRAME_TYPE_INTER
            };
            let cts = pkt.composition_time;
            let mut buf = BytesMut::with_capacity(5 + pkt.payload.len());
            buf.put_u8((frame_type << 4) | codec_id);
            buf.put_u8(PACKET_TYPE_NALU);
            buf.put_u8((cts >> 16) as u8);
            buf.put_u8((cts >> 8) as u8);
            buf.put_u8(cts as u8);
            buf.put_slice(&pkt.payload);
            buf.freeze()
        }
    }
}

/// A complete FLV tag
#[derive(Debug, Clone, PartialEq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub data: Bytes,
}

impl FlvTag {
    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: TAG_TYPE_AUDIO,
            timestamp,
            data,
        }
    }

    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: TAG_TYPE_VIDEO,
            timestamp,
            data,
        }
    }

    pub fn script(data: Bytes) -> Self {
        Self {
            tag_type: TAG_TYPE_SCRIPT,
            timestamp: 0,
            data,
        }
    }

    pub fn from_packet(pkt: &AvPacket) -> Self {
        let body = packet_body(pkt);
        if pkt.is_video() {
            Self::video(pkt.timestamp, body)
        } else {
            Self::audio(pkt.timestamp, body)
        }
    }

    /// Tag header, body and the trailing PreviousTagSize
    pub fn encode(&self) -> Bytes {
        let size = self.data.len() as u32;
        let mut buf = BytesMut::with_capacity(11 + self.data.len() + 4);
        buf.put_u8(self.tag_type);
        put_u24(&mut buf, size);
        put_u24(&mut buf, self.timestamp & 0xFF_FFFF);
        buf.put_u8((self.timestamp >> 24) as u8);
        put_u24(&mut buf, 0); // stream id
        buf.put_slice(&self.data);
        buf.put_u32(size + 11);
        buf.freeze()
    }
}

/// `FLV` signature header followed by PreviousTagSize0
pub fn file_header(has_audio: bool, has_video: bool) -> Bytes {
    let mut flags = 0u8;
    if has_audio {
        flags |= 0x04;
    }
    if has_video {
        flags |= 0x01;
    }
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(b"FLV");
    buf.put_u8(1);
    buf.put_u8(flags);
    buf.put_u32(9);
    buf.put_u32(0);
    buf.freeze()
}

fn put_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}
