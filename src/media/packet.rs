//! Unified audio/video packet
//!
//! Every ingest path (RTMP, RTSP/RTP, relay pull) produces [`AvPacket`]s and
//! every output path consumes them. The payload is reference counted and
//! never mutated after construction, so one packet can be handed to any
//! number of subscribers at once.

use bytes::Bytes;

use super::nal::{self, NaluIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadType {
    /// Raw AAC access unit (no ADTS header)
    Aac,
    /// H.264, AVCC framed
    Avc,
    /// H.265, AVCC framed
    Hevc,
}

impl PayloadType {
    pub fn is_video(&self) -> bool {
        matches!(self, PayloadType::Avc | PayloadType::Hevc)
    }
}

/// One access unit of encoded media
#[derive(Debug, Clone, PartialEq)]
pub struct AvPacket {
    pub payload_type: PayloadType,
    /// Decode timestamp, milliseconds, stream relative
    pub timestamp: u32,
    /// Presentation minus decode time in milliseconds (video only)
    pub composition_time: i32,
    pub payload: Bytes,
}

impl AvPacket {
    pub fn audio(timestamp: u32, payload: Bytes) -> Self {
        Self {
            payload_type: PayloadType::Aac,
            timestamp,
            composition_time: 0,
            payload,
        }
    }

    pub fn video(payload_type: PayloadType, timestamp: u32, composition_time: i32, payload: Bytes) -> Self {
        Self {
            payload_type,
            timestamp,
            composition_time,
            payload,
        }
    }

    pub fn is_video(&self) -> bool {
        self.payload_type.is_video()
    }

    pub fn is_audio(&self) -> bool {
        self.payload_type == PayloadType::Aac
    }

    /// True if the access unit contains an IDR (H.264) or IRAP (H.265) picture
    pub fn is_keyframe(&self) -> bool {
        match self.payload_type {
            PayloadType::Aac => false,
            PayloadType::Avc => NaluIterator::new(&self.payload)
                .any(|n| !n.is_empty() && nal::avc_nal_type(n[0]) == nal::AVC_NAL_IDR),
            PayloadType::Hevc => NaluIterator::new(&self.payload)
                .any(|n| !n.is_empty() && nal::is_hevc_irap(nal::hevc_nal_type(n[0]))),
        }
    }

    /// Presentation timestamp in milliseconds, clamped at zero
    pub fn pts(&self) -> u32 {
        (self.timestamp as i64 + self.composition_time as i64).max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::nal::to_avcc;

    #[test]
    fn test_avc_keyframe_detection() {
        let idr = AvPacket::video(
            PayloadType::Avc,
            0,
            0,
            to_avcc([&[0x06u8, 0][..], &[0x65u8, 0x88][..]]),
        );
        assert!(idr.is_keyframe());

        let p = AvPacket::video(PayloadType::Avc, 40, 0, to_avcc([&[0x41u8, 0x9a][..]]));
        assert!(!p.is_keyframe());
    }

    #[test]
    fn test_hevc_keyframe_detection() {
        let cra = AvPacket::video(PayloadType::Hevc, 0, 0, to_avcc([&[0x2Au8, 0x01][..]]));
        assert!(cra.is_keyframe());
        let trail = AvPacket::video(PayloadType::Hevc, 0, 0, to_avcc([&[0x02u8, 0x01][..]]));
        assert!(!trail.is_keyframe());
    }

    #[test]
    fn test_audio_is_never_keyframe() {
        let a = AvPacket::audio(10, Bytes::from_static(&[0x21, 0x00]));
        assert!(a.is_audio());
        assert!(!a.is_keyframe());
        assert_eq!(a.pts(), 10);
    }

    #[test]
    fn test_pts_with_negative_cts() {
        let v = AvPacket::video(PayloadType::Avc, 10, -40, Bytes::new());
        assert_eq!(v.pts(), 0);
        let v = AvPacket::video(PayloadType::Avc, 100, 80, Bytes::new());
        assert_eq!(v.pts(), 180);
    }
}
