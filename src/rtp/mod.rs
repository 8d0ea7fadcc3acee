//! RTP depacketization
//!
//! A [`TrackUnpacker`] turns the RTP packets of one SDP track into
//! [`AvPacket`]s with millisecond timestamps relative to the track's first
//! packet, and hands them to an [`RtpObserver`].

pub mod aac;
pub mod avc;
pub mod hevc;
pub mod packet;
pub mod video;

use bytes::Bytes;

pub use aac::AacDepacketizer;
pub use packet::{RtpHeader, RtpPacket, SequenceTracker};
pub use video::VideoDepacketizer;

use crate::error::Result;
use crate::media::{AvPacket, CodecConfig, PayloadType};
use crate::sdp::SdpTrack;

/// Consumer of depacketized media
pub trait RtpObserver {
    fn on_rtp_packet(&mut self, _pkt: &RtpPacket) {}

    fn on_av_config(&mut self, config: &CodecConfig);

    fn on_av_packet(&mut self, pkt: AvPacket);
}

/// One complete access unit, timestamp still in the track clock
#[derive(Debug, Clone, PartialEq)]
pub struct AccessUnit {
    pub timestamp: u32,
    pub payload: Bytes,
}

/// NAL units carried by one video RTP payload
#[derive(Debug, Clone, PartialEq)]
pub enum NalPayload {
    /// Single NAL unit or aggregation packet
    Units(Vec<Bytes>),
    /// One piece of a fragmented NAL unit; `header` is the rebuilt NAL header
    Fragment {
        start: bool,
        end: bool,
        header: Bytes,
        data: Bytes,
    },
}

enum Depacketizer {
    Audio(AacDepacketizer),
    Video(VideoDepacketizer),
}

pub struct TrackUnpacker {
    codec: PayloadType,
    clock_rate: u32,
    base_timestamp: Option<u32>,
    inner: Depacketizer,
    units: Vec<AccessUnit>,
}

impl TrackUnpacker {
    pub fn new(track: &SdpTrack) -> Self {
        let inner = match track.codec {
            PayloadType::Aac => Depacketizer::Audio(AacDepacketizer::new()),
            codec => Depacketizer::Video(VideoDepacketizer::new(codec, &track.config)),
        };
        Self {
            codec: track.codec,
            // a zero clock rate would divide by zero below
            clock_rate: track.clock_rate.max(1),
            base_timestamp: None,
            inner,
            units: Vec::new(),
        }
    }

    pub fn codec(&self) -> PayloadType {
        self.codec
    }

    pub fn feed(&mut self, pkt: &RtpPacket, observer: &mut dyn RtpObserver) -> Result<()> {
        observer.on_rtp_packet(pkt);
        let base = *self.base_timestamp.get_or_insert(pkt.header.timestamp);

        match &mut self.inner {
            Depacketizer::Audio(d) => d.push(pkt, &mut self.units)?,
            Depacketizer::Video(d) => {
                d.push(pkt, &mut self.units)?;
                if let Some(config) = d.take_config() {
                    observer.on_av_config(&config);
                }
            }
        }

        for unit in self.units.drain(..) {
            // units stamped before the base clamp to zero
            let ticks = (unit.timestamp.wrapping_sub(base) as i32).max(0) as u64;
            let ms = (ticks * 1000 / self.clock_rate as u64) as u32;
            let pkt = match self.codec {
                PayloadType::Aac => AvPacket::audio(ms, unit.payload),
                codec => AvPacket::video(codec, ms, 0, unit.payload),
            };
            observer.on_av_packet(pkt);
        }
        Ok(())
    }
}
