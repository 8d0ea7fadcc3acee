//! MPEG-TS muxer for HTTP-TS subscribers
//!
//! Each call to [`TsMuxer::mux`] turns one [`AvPacket`] into a fragment made
//! of whole 188-byte transport packets. PAT and PMT precede the first
//! fragment and every video keyframe, so a fragment starting at a keyframe
//! is decodable on its own.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use super::aac::AudioSpecificConfig;
use super::codec::CodecConfig;
use super::nal::{self, START_CODE};
use super::packet::{AvPacket, PayloadType};
use crate::error::Result;

pub const TS_PACKET_SIZE: usize = 188;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
const SYNC_BYTE: u8 = 0x47;

pub const PID_PAT: u16 = 0x0000;
pub const PID_PMT: u16 = 0x1000;
pub const PID_VIDEO: u16 = 0x0100;
pub const PID_AUDIO: u16 = 0x0101;

const STREAM_TYPE_AVC: u8 = 0x1B;
const STREAM_TYPE_HEVC: u8 = 0x24;
const STREAM_TYPE_AAC: u8 = 0x0F;

const STREAM_ID_VIDEO: u8 = 0xE0;
const STREAM_ID_AUDIO: u8 = 0xC0;

const AVC_AUD: &[u8] = &[0x09, 0xF0];
const HEVC_AUD: &[u8] = &[0x46, 0x01, 0x50];

/// Milliseconds to the 90 kHz system clock
fn to_90khz(ms: u32) -> u64 {
    ms as u64 * 90
}

pub struct TsMuxer {
    config: CodecConfig,
    asc: Option<AudioSpecificConfig>,
    video_type: Option<PayloadType>,
    continuity: HashMap<u16, u8>,
    psi_pending: bool,
    seen_keyframe: bool,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    pub fn new() -> Self {
        Self {
            config: CodecConfig::default(),
            asc: None,
            video_type: None,
            continuity: HashMap::new(),
            psi_pending: true,
            seen_keyframe: false,
        }
    }

    /// Apply a (partial) codec config; the program table is re-sent afterwards
    pub fn set_config(&mut self, config: &CodecConfig) -> Result<()> {
        self.config.merge(config);
        if let Some(asc) = &self.config.asc {
            self.asc = Some(AudioSpecificConfig::parse(asc.clone())?);
        }
        self.video_type = self.config.video_codec();
        self.psi_pending = true;
        Ok(())
    }

    pub fn has_video(&self) -> bool {
        self.video_type.is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.asc.is_some()
    }

    /// Returns `None` for packets that cannot be muxed yet: tracks without
    /// config, and anything before the first video keyframe of a stream
    /// that has video.
    pub fn mux(&mut self, pkt: &AvPacket) -> Option<Bytes> {
        let keyframe = pkt.is_video() && pkt.is_keyframe();
        if pkt.is_video() {
            if !keyframe && !self.seen_keyframe {
                return None;
            }
            if self.video_type.is_none() {
                // parameter sets may still arrive in-band
                self.video_type = Some(pkt.payload_type);
                self.psi_pending = true;
            }
            self.seen_keyframe |= keyframe;
        } else if self.asc.is_none() || (self.has_video() && !self.seen_keyframe) {
            return None;
        }

        let mut out = BytesMut::new();
        if keyframe || self.psi_pending {
            self.write_pat(&mut out);
            self.write_pmt(&mut out);
            self.psi_pending = false;
        }

        if pkt.is_video() {
            let es = self.video_es(pkt, keyframe);
            let pes = build_pes(STREAM_ID_VIDEO, &es, to_90khz(pkt.pts()), to_90khz(pkt.timestamp), false);
            let pcr = keyframe.then(|| to_90khz(pkt.timestamp));
            self.write_pes(&mut out, PID_VIDEO, &pes, pcr);
        } else {
            let es = self.audio_es(pkt)?;
            let ts = to_90khz(pkt.timestamp);
            // audio-only programs carry PCR every 16th audio packet
            let pcr = (!self.has_video() && self.continuity_of(PID_AUDIO) == 0).then_some(ts);
            let pes = build_pes(STREAM_ID_AUDIO, &es, ts, ts, true);
            self.write_pes(&mut out, PID_AUDIO, &pes, pcr);
        }
        Some(out.freeze())
    }

    fn video_es(&self, pkt: &AvPacket, keyframe: bool) -> BytesMut {
        let mut es = BytesMut::with_capacity(pkt.payload.len() + 64);
        es.put_slice(&START_CODE);
        es.put_slice(match pkt.payload_type {
            PayloadType::Hevc => HEVC_AUD,
            _ => AVC_AUD,
        });

        if keyframe {
            let sets = [&self.config.vps, &self.config.sps, &self.config.pps];
            for unit in sets.into_iter().flatten() {
                es.put_slice(&START_CODE);
                es.put_slice(unit);
            }
        }
        nal::avcc_to_annexb(&pkt.payload, &mut es);
        es
    }

    fn audio_es(&self, pkt: &AvPacket) -> Option<BytesMut> {
        let asc = self.asc.as_ref()?;
        let mut es = BytesMut::with_capacity(pkt.payload.len() + 7);
        es.put_slice(&asc.adts_header(pkt.payload.len()));
        es.put_slice(&pkt.payload);
        Some(es)
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0);
        let current = *cc;
        *cc = (*cc + 1) & 0x0F;
        current
    }

    fn continuity_of(&self, pid: u16) -> u8 {
        self.continuity.get(&pid).copied().unwrap_or(0)
    }

    fn write_pat(&mut self, out: &mut BytesMut) {
        let section = pat_section();
        self.write_psi(out, PID_PAT, &section);
    }

    fn write_pmt(&mut self, out: &mut BytesMut) {
        let video = self.video_type.map(|t| match t {
            PayloadType::Hevc => STREAM_TYPE_HEVC,
            _ => STREAM_TYPE_AVC,
        });
        let section = pmt_section(video, self.has_audio());
        self.write_psi(out, PID_PMT, &section);
    }

    fn write_psi(&mut self, out: &mut BytesMut, pid: u16, section: &[u8]) {
        let cc = self.next_continuity(pid);
        let start = out.len();
        out.put_u8(SYNC_BYTE);
        out.put_u8(0x40 | (pid >> 8) as u8 & 0x1F);
        out.put_u8(pid as u8);
        out.put_u8(0x10 | cc);
        out.put_u8(0); // pointer field
        out.put_slice(section);
        out.resize(start + TS_PACKET_SIZE, 0xFF);
    }

    fn write_pes(&mut self, out: &mut BytesMut, pid: u16, pes: &[u8], pcr: Option<u64>) {
        let mut offset = 0;
        let mut first = true;

        while offset < pes.len() {
            let cc = self.next_continuity(pid);
            let pcr = if first { pcr } else { None };
            let fixed_af = if pcr.is_some() { 8 } else { 0 };
            let remaining = pes.len() - offset;
            let space = TS_PAYLOAD_SIZE - fixed_af;
            let take = remaining.min(space);
            let stuffing = space - take;
            let has_af = fixed_af > 0 || stuffing > 0;

            out.put_u8(SYNC_BYTE);
            out.put_u8((if first { 0x40 } else { 0 }) | (pid >> 8) as u8 & 0x1F);
            out.put_u8(pid as u8);
            out.put_u8((if has_af { 0x30 } else { 0x10 }) | cc);

            match pcr {
                Some(pcr) => {
                    out.put_u8((7 + stuffing) as u8);
                    out.put_u8(0x50); // random access + PCR
                    put_pcr(out, pcr);
                    out.put_bytes(0xFF, stuffing);
                }
                None if stuffing == 1 => out.put_u8(0),
                None if stuffing > 1 => {
                    out.put_u8((stuffing - 1) as u8);
                    out.put_u8(0x00);
                    out.put_bytes(0xFF, stuffing - 2);
                }
                None => {}
            }

            out.put_slice(&pes[offset..offset + take]);
            offset += take;
            first = false;
        }
    }
}

fn build_pes(stream_id: u8, es: &[u8], pts: u64, dts: u64, bounded: bool) -> BytesMut {
    let with_dts = pts != dts;
    let header_data_len: usize = if with_dts { 10 } else { 5 };

    let mut pes = BytesMut::with_capacity(9 + header_data_len + es.len());
    pes.put_slice(&[0x00, 0x00, 0x01, stream_id]);
    let length = 3 + header_data_len + es.len();
    // video PES packets are left unbounded
    if bounded && length <= u16::MAX as usize {
        pes.put_u16(length as u16);
    } else {
        pes.put_u16(0);
    }
    pes.put_u8(0x80);
    if with_dts {
        pes.put_u8(0xC0);
        pes.put_u8(header_data_len as u8);
        put_timestamp(&mut pes, 0x03, pts);
        put_timestamp(&mut pes, 0x01, dts);
    } else {
        pes.put_u8(0x80);
        pes.put_u8(header_data_len as u8);
        put_timestamp(&mut pes, 0x02, pts);
    }
    pes.put_slice(es);
    pes
}

fn put_timestamp(buf: &mut BytesMut, prefix: u8, ts: u64) {
    buf.put_u8((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1);
    buf.put_u8((ts >> 22) as u8);
    buf.put_u8(((((ts >> 15) & 0x7F) as u8) << 1) | 1);
    buf.put_u8((ts >> 7) as u8);
    buf.put_u8((((ts & 0x7F) as u8) << 1) | 1);
}

fn put_pcr(buf: &mut BytesMut, base: u64) {
    buf.put_u8((base >> 25) as u8);
    buf.put_u8((base >> 17) as u8);
    buf.put_u8((base >> 9) as u8);
    buf.put_u8((base >> 1) as u8);
    buf.put_u8((((base & 1) as u8) << 7) | 0x7E);
    buf.put_u8(0);
}

fn pat_section() -> Vec<u8> {
    let mut s = vec![
        0x00, // table id
        0xB0,
        0x0D,
        0x00,
        0x01, // transport stream id
        0xC1,
        0x00,
        0x00,
        0x00,
        0x01, // program number
        0xE0 | (PID_PMT >> 8) as u8,
        PID_PMT as u8,
    ];
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

fn pmt_section(video: Option<u8>, audio: bool) -> Vec<u8> {
    let mut streams = Vec::new();
    if let Some(stream_type) = video {
        streams.push((stream_type, PID_VIDEO));
    }
    if audio {
        streams.push((STREAM_TYPE_AAC, PID_AUDIO));
    }
    let pcr_pid = if video.is_some() { PID_VIDEO } else { PID_AUDIO };
    let section_length = 9 + 5 * streams.len() + 4;

    let mut s = Vec::with_capacity(3 + section_length);
    s.push(0x02);
    s.push(0xB0 | ((section_length >> 8) as u8 & 0x0F));
    s.push(section_length as u8);
    s.extend_from_slice(&[0x00, 0x01, 0xC1, 0x00, 0x00]);
    s.push(0xE0 | (pcr_pid >> 8) as u8);
    s.push(pcr_pid as u8);
    s.extend_from_slice(&[0xF0, 0x00]);
    for (stream_type, pid) in streams {
        s.push(stream_type);
        s.push(0xE0 | (pid >> 8) as u8);
        s.push(pid as u8);
        s.extend_from_slice(&[0xF0, 0x00]);
    }
    let crc = crc32_mpeg2(&s);
    s.extend_from_slice(&crc.to_be_bytes());
    s
}

/// CRC-32/MPEG-2 as used by PSI sections
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= (b as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::nal::to_avcc;

    fn pid_of(packet: &[u8]) -> u16 {
        (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
    }

    fn config() -> CodecConfig {
        CodecConfig {
            asc: Some(Bytes::from_static(&[0x12, 0x10])),
            sps: Some(Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E])),
            pps: Some(Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])),
            vps: None,
        }
    }

    fn keyframe(ts: u32) -> AvPacket {
        AvPacket::video(PayloadType::Avc, ts, 0, to_avcc([&[0x65u8, 0x88, 0x84][..]]))
    }

    #[test]
    fn test_pat_section() {
        assert_eq!(
            pat_section(),
            vec![0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, 0x00, 0x01, 0xF0, 0x00, 0x2A, 0xB1, 0x04, 0xB2]
        );
    }

    #[test]
    fn test_pmt_lists_tracks() {
        let pmt = pmt_section(Some(STREAM_TYPE_AVC), true);
        assert_eq!(pmt.len(), 3 + 9 + 10 + 4);
        assert_eq!(pmt[12], STREAM_TYPE_AVC);
        assert_eq!(pmt[17], STREAM_TYPE_AAC);
        // crc over the whole section including its CRC is zero
        assert_eq!(crc32_mpeg2(&pmt), 0);
    }

    #[test]
    fn test_keyframe_fragment_layout() {
        let mut muxer = TsMuxer::new();
        muxer.set_config(&config()).unwrap();
        let frag = muxer.mux(&keyframe(1000)).unwrap();
        assert_eq!(frag.len() % TS_PACKET_SIZE, 0);

        let packets: Vec<&[u8]> = frag.chunks(TS_PACKET_SIZE).collect();
        assert!(packets.iter().all(|p| p[0] == SYNC_BYTE));
        assert_eq!(pid_of(packets[0]), PID_PAT);
        assert_eq!(pid_of(packets[1]), PID_PMT);

        let video = packets[2];
        assert_eq!(pid_of(video), PID_VIDEO);
        assert_eq!(video[1] & 0x40, 0x40); // payload unit start
        assert_eq!(video[3] & 0x30, 0x30);
        assert_eq!(video[5], 0x50);
        let af_len = video[4] as usize;
        let pes = &video[5 + af_len..];
        assert_eq!(&pes[..4], &[0x00, 0x00, 0x01, STREAM_ID_VIDEO]);
        // AUD then SPS
        let es = &pes[9 + pes[8] as usize..];
        assert_eq!(&es[..6], &[0, 0, 0, 1, 0x09, 0xF0]);
        assert_eq!(&es[6..11], &[0, 0, 0, 1, 0x67]);
    }

    #[test]
    fn test_inter_frame_before_keyframe_dropped() {
        let mut muxer = TsMuxer::new();
        muxer.set_config(&config()).unwrap();
        let inter = AvPacket::video(PayloadType::Avc, 0, 0, to_avcc([&[0x41u8, 0x9A][..]]));
        assert!(muxer.mux(&inter).is_none());
        assert!(muxer.mux(&AvPacket::audio(0, Bytes::from_static(&[1, 2]))).is_none());
        assert!(muxer.mux(&keyframe(40)).is_some());
        assert!(muxer.mux(&inter).is_some());
    }

    #[test]
    fn test_audio_adts_and_continuity() {
        let mut muxer = TsMuxer::new();
        muxer.set_config(&CodecConfig {
            asc: Some(Bytes::from_static(&[0x12, 0x10])),
            ..Default::default()
        })
        .unwrap();

        let first = muxer.mux(&AvPacket::audio(0, Bytes::from(vec![0xAB; 300]))).unwrap();
        let second = muxer.mux(&AvPacket::audio(23, Bytes::from(vec![0xCD; 10]))).unwrap();

        // PAT + PMT + two audio packets, then a single audio packet
        assert_eq!(first.len(), 4 * TS_PACKET_SIZE);
        assert_eq!(second.len(), TS_PACKET_SIZE);

        let a0 = &first[2 * TS_PACKET_SIZE..];
        assert_eq!(pid_of(a0), PID_AUDIO);
        assert_eq!(a0[3] & 0x0F, 0);
        assert_eq!(first[3 * TS_PACKET_SIZE + 3] & 0x0F, 1);
        assert_eq!(second[3] & 0x0F, 2);

        // stuffed single packet: ADTS sync word after the PES header
        let af_len = second[4] as usize;
        let pes = &second[5 + af_len..];
        assert_eq!(&pes[..4], &[0x00, 0x00, 0x01, STREAM_ID_AUDIO]);
        let es = &pes[9 + pes[8] as usize..];
        assert_eq!(&es[..2], &[0xFF, 0xF1]);
        assert_eq!(&es[7..], &[0xCD; 10]);
    }

    #[test]
    fn test_psi_repeated_on_keyframes_only() {
        let mut muxer = TsMuxer::new();
        muxer.set_config(&config()).unwrap();
        let k = muxer.mux(&keyframe(0)).unwrap();
        let p = muxer
            .mux(&AvPacket::video(PayloadType::Avc, 40, 0, to_avcc([&[0x41u8][..]])))
            .unwrap();
        let k2 = muxer.mux(&keyframe(80)).unwrap();
        assert_eq!(pid_of(&k), PID_PAT);
        assert_eq!(pid_of(&p), PID_VIDEO);
        assert_eq!(pid_of(&k2), PID_PAT);
    }

    #[test]
    fn test_pes_timestamps() {
        let pes = build_pes(STREAM_ID_VIDEO, &[], 3600 + 900, 3600, false);
        assert_eq!(pes[7], 0xC0);
        assert_eq!(pes[8], 10);
        assert_eq!(pes[9] >> 4, 0x03);
        assert_eq!(pes[14] >> 4, 0x01);

        let pes = build_pes(STREAM_ID_AUDIO, &[0; 4], 90, 90, true);
        assert_eq!(pes[7], 0x80);
        assert_eq!(u16::from_be_bytes([pes[4], pes[5]]), 3 + 5 + 4);
    }
}
