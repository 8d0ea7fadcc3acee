//! Access unit assembly for H.264/H.265 over RTP
//!
//! NAL units sharing an RTP timestamp form one access unit, emitted on the
//! marker bit or when the timestamp moves on. Parameter sets found in-band
//! are lifted out of the access unit into a codec config.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::{avc, hevc, AccessUnit, NalPayload, RtpPacket, SequenceTracker};
use crate::error::Result;
use crate::media::nal::{self, AVC_NAL_AUD, AVC_NAL_PPS, AVC_NAL_SPS, HEVC_NAL_AUD, HEVC_NAL_PPS, HEVC_NAL_SPS, HEVC_NAL_VPS};
use crate::media::{CodecConfig, PayloadType};

enum ParamSet {
    Vps,
    Sps,
    Pps,
}

pub struct VideoDepacketizer {
    codec: PayloadType,
    au: BytesMut,
    au_timestamp: Option<u32>,
    fragment: Option<BytesMut>,
    seq: SequenceTracker,
    config: CodecConfig,
    config_changed: bool,
}

impl VideoDepacketizer {
    pub fn new(codec: PayloadType, config: &CodecConfig) -> Self {
        Self {
            codec,
            au: BytesMut::new(),
            au_timestamp: None,
            fragment: None,
            seq: SequenceTracker::default(),
            config: CodecConfig {
                asc: None,
                ..config.clone()
            },
            config_changed: false,
        }
    }

    pub fn push(&mut self, pkt: &RtpPacket, out: &mut Vec<AccessUnit>) -> Result<()> {
        if self.seq.observe(pkt.header.sequence_number) > 0 && self.fragment.take().is_some() {
            debug!(seq = pkt.header.sequence_number, "dropping fragmented nal");
        }

        if self.au_timestamp.is_some_and(|ts| ts != pkt.header.timestamp) {
            self.fragment = None;
            self.flush(out);
        }
        self.au_timestamp = Some(pkt.header.timestamp);

        let split = match self.codec {
            PayloadType::Hevc => hevc::split_payload(&pkt.payload)?,
            _ => avc::split_payload(&pkt.payload)?,
        };

        match split {
            NalPayload::Units(units) => {
                for unit in units {
                    self.add_nal(unit);
                }
            }
            NalPayload::Fragment {
                start,
                end,
                header,
                data,
            } => {
                if start {
                    let mut buf = BytesMut::with_capacity(header.len() + data.len());
                    buf.put_slice(&header);
                    buf.put_slice(&data);
                    self.fragment = Some(buf);
                } else if let Some(buf) = self.fragment.as_mut() {
                    buf.put_slice(&data);
                }
                // without a start fragment the rest is dropped until the next one
                if end {
                    if let Some(buf) = self.fragment.take() {
                        self.add_nal(buf.freeze());
                    }
                }
            }
        }

        if pkt.header.marker {
            self.flush(out);
        }
        Ok(())
    }

    /// Packets lost to sequence gaps so far
    pub fn lost_packets(&self) -> u64 {
        self.seq.lost()
    }

    /// Config with in-band parameter sets, once per change and only when complete
    pub fn take_config(&mut self) -> Option<CodecConfig> {
        if !self.config_changed || self.config.video_codec().is_none() {
            return None;
        }
        self.config_changed = false;
        Some(self.config.clone())
    }

    fn add_nal(&mut self, unit: Bytes) {
        if unit.is_empty() {
            return;
        }
        let kind = match self.codec {
            PayloadType::Hevc => match nal::hevc_nal_type(unit[0]) {
                HEVC_NAL_VPS => Some(ParamSet::Vps),
                HEVC_NAL_SPS => Some(ParamSet::Sps),
                HEVC_NAL_PPS => Some(ParamSet::Pps),
                HEVC_NAL_AUD => return,
                _ => None,
            },
            _ => match nal::avc_nal_type(unit[0]) {
                AVC_NAL_SPS => Some(ParamSet::Sps),
                AVC_NAL_PPS => Some(ParamSet::Pps),
                AVC_NAL_AUD => return,
                _ => None,
            },
        };

        let slot = match kind {
            Some(ParamSet::Vps) => &mut self.config.vps,
            Some(ParamSet::Sps) => &mut self.config.sps,
            Some(ParamSet::Pps) => &mut self.config.pps,
            None => {
                nal::put_avcc(&mut self.au, &unit);
                return;
            }
        };
        if slot.as_ref() != Some(&unit) {
            *slot = Some(unit);
            self.config_changed = true;
        }
    }

    fn flush(&mut self, out: &mut Vec<AccessUnit>) {
        if self.au.is_empty() {
            return;
        }
        if let Some(timestamp) = self.au_timestamp {
            out.push(AccessUnit {
                timestamp,
                payload: self.au.split().freeze(),
            });
        }
    }
}
