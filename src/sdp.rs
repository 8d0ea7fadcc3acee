//! SDP attribute parsing
//!
//! Only the attributes needed to set up depacketizers are interpreted:
//!
//! ```text
//! m=<media> <port> <proto> <fmt> ...
//! a=rtpmap:<payload type> <encoding name>/<clock rate>[/<encoding parameters>]
//! a=fmtp:<format> <name>=<value>[; <name>=<value>]
//! a=control:<url>
//! ```
//!
//! Any malformed `a=rtpmap`, `a=fmtp` or `a=control` line fails the whole
//! parse; other lines are ignored.

use std::collections::HashMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;

use crate::error::SdpError;
use crate::media::{CodecConfig, PayloadType};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SdpContext {
    pub rtp_maps: Vec<RtpMap>,
    pub fmtps: Vec<Fmtp>,
    pub controls: Vec<Control>,
    /// `m=` sections in order, with the control that belongs to each
    pub media: Vec<MediaDescription>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub encoding_parameters: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fmtp {
    pub format: u8,
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Control {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    /// `audio`, `video`, ...
    pub kind: String,
    pub formats: Vec<u8>,
    pub control: Option<String>,
}

/// One playable track: codec, RTP parameters and out-of-band config
#[derive(Debug, Clone, PartialEq)]
pub struct SdpTrack {
    pub codec: PayloadType,
    pub rtp_payload_type: u8,
    pub clock_rate: u32,
    pub control: Option<String>,
    pub config: CodecConfig,
}

pub fn parse_sdp(text: &str) -> Result<SdpContext, SdpError> {
    let mut ctx = SdpContext::default();

    for line in text.lines() {
        if line.starts_with("m=") {
            ctx.media.push(parse_media(line));
        } else if line.starts_with("a=rtpmap") {
            ctx.rtp_maps.push(parse_rtpmap(line)?);
        } else if line.starts_with("a=fmtp") {
            ctx.fmtps.push(parse_fmtp(line)?);
        } else if line.starts_with("a=control") {
            let control = parse_control(line)?;
            if let Some(media) = ctx.media.last_mut() {
                media.control = Some(control.value.clone());
            }
            ctx.controls.push(control);
        }
    }

    Ok(ctx)
}

fn malformed(line: &str) -> SdpError {
    SdpError::MalformedLine(line.to_string())
}

fn parse_media(line: &str) -> MediaDescription {
    let mut fields = line["m=".len()..].split_whitespace();
    let kind = fields.next().unwrap_or_default().to_string();
    // port and protocol
    let formats = fields.skip(2).filter_map(|f| f.parse().ok()).collect();
    MediaDescription {
        kind,
        formats,
        control: None,
    }
}

pub fn parse_rtpmap(line: &str) -> Result<RtpMap, SdpError> {
    let (_, value) = line.split_once(':').ok_or_else(|| malformed(line))?;
    let (pt, encoding) = value.split_once(' ').ok_or_else(|| malformed(line))?;
    let payload_type = pt.trim().parse().map_err(|_| malformed(line))?;

    let mut parts = encoding.trim().splitn(3, '/');
    let encoding_name = parts.next().unwrap_or_default().to_string();
    let clock_rate = parts
        .next()
        .ok_or_else(|| malformed(line))?
        .parse()
        .map_err(|_| malformed(line))?;
    let encoding_parameters = parts.next().map(str::to_string);

    Ok(RtpMap {
        payload_type,
        encoding_name,
        clock_rate,
        encoding_parameters,
    })
}

pub fn parse_fmtp(line: &str) -> Result<Fmtp, SdpError> {
    let (_, value) = line.split_once(':').ok_or_else(|| malformed(line))?;
    let (format, params) = value.split_once(' ').ok_or_else(|| malformed(line))?;
    let format = format.trim().parse().map_err(|_| malformed(line))?;

    let mut parameters = HashMap::new();
    for pair in params.split(';') {
        let pair = pair.trim();
        let (k, v) = pair.split_once('=').ok_or_else(|| malformed(line))?;
        parameters.insert(k.to_string(), v.to_string());
    }

    Ok(Fmtp { format, parameters })
}

pub fn parse_control(line: &str) -> Result<Control, SdpError> {
    let value = line.strip_prefix("a=control:").ok_or_else(|| malformed(line))?;
    Ok(Control {
        value: value.to_string(),
    })
}

impl Fmtp {
    fn param(&self, name: &'static str) -> Result<&str, SdpError> {
        self.parameters
            .get(name)
            .map(String::as_str)
            .ok_or(SdpError::MissingParameter(name))
    }
}

/// 2-byte AudioSpecificConfig from the hex `config` parameter
pub fn parse_asc(fmtp: &Fmtp) -> Result<Bytes, SdpError> {
    let value = fmtp.param("config")?;
    let hex_bytes = value.get(..4).ok_or(SdpError::InvalidParameter("config"))?;
    let asc = hex::decode(hex_bytes).map_err(|_| SdpError::InvalidParameter("config"))?;
    Ok(Bytes::from(asc))
}

/// `sprop-parameter-sets=<base64 sps>,<base64 pps>`
pub fn parse_sps_pps(fmtp: &Fmtp) -> Result<(Bytes, Bytes), SdpError> {
    const NAME: &str = "sprop-parameter-sets";
    let value = fmtp.param(NAME)?;
    let (sps, pps) = value.split_once(',').ok_or(SdpError::InvalidParameter(NAME))?;
    Ok((decode_base64(sps, NAME)?, decode_base64(pps, NAME)?))
}

/// `sprop-vps`, `sprop-sps` and `sprop-pps`
pub fn parse_vps_sps_pps(fmtp: &Fmtp) -> Result<(Bytes, Bytes, Bytes), SdpError> {
    let vps = decode_base64(fmtp.param("sprop-vps")?, "sprop-vps")?;
    let sps = decode_base64(fmtp.param("sprop-sps")?, "sprop-sps")?;
    let pps = decode_base64(fmtp.param("sprop-pps")?, "sprop-pps")?;
    Ok((vps, sps, pps))
}

fn decode_base64(value: &str, name: &'static str) -> Result<Bytes, SdpError> {
    STANDARD
        .decode(value.trim())
        .map(Bytes::from)
        .map_err(|_| SdpError::InvalidParameter(name))
}

fn codec_of(encoding_name: &str) -> Option<PayloadType> {
    match encoding_name.to_ascii_lowercase().as_str() {
        "mpeg4-generic" => Some(PayloadType::Aac),
        "h264" => Some(PayloadType::Avc),
        "h265" | "hevc" => Some(PayloadType::Hevc),
        _ => None,
    }
}

impl SdpContext {
    pub fn rtp_map(&self, payload_type: u8) -> Option<&RtpMap> {
        self.rtp_maps.iter().find(|m| m.payload_type == payload_type)
    }

    pub fn fmtp(&self, format: u8) -> Option<&Fmtp> {
        self.fmtps.iter().find(|f| f.format == format)
    }

    /// Supported tracks with their codec config.
    ///
    /// rtpmap and fmtp are paired by payload type and the codec is chosen by
    /// encoding name. Every supported codec needs its fmtp: `config` for AAC,
    /// `sprop-parameter-sets` for H.264 and `sprop-vps/sps/pps` for H.265.
    pub fn tracks(&self) -> Result<Vec<SdpTrack>, SdpError> {
        let mut tracks = Vec::new();

        for map in &self.rtp_maps {
            let Some(codec) = codec_of(&map.encoding_name) else {
                continue;
            };
            let fmtp = self.fmtp(map.payload_type);

            let mut config = CodecConfig::default();
            match (codec, fmtp) {
                (_, None) => return Err(SdpError::MissingFmtp(map.payload_type)),
                (PayloadType::Aac, Some(fmtp)) => config.asc = Some(parse_asc(fmtp)?),
                (PayloadType::Avc, Some(fmtp)) => {
                    let (sps, pps) = parse_sps_pps(fmtp)?;
                    config.sps = Some(sps);
                    config.pps = Some(pps);
                }
                (PayloadType::Hevc, Some(fmtp)) => {
                    let (vps, sps, pps) = parse_vps_sps_pps(fmtp)?;
                    config.vps = Some(vps);
                    config.sps = Some(sps);
                    config.pps = Some(pps);
                }
            }

            let control = self
                .media
                .iter()
                .find(|m| m.formats.contains(&map.payload_type))
                .and_then(|m| m.control.clone());

            tracks.push(SdpTrack {
                codec,
                rtp_payload_type: map.payload_type,
                clock_rate: map.clock_rate,
                control,
                config,
            });
        }

        Ok(tracks)
    }
}

impl fmt::Display for RtpMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "a=rtpmap:{} {}/{}",
            self.payload_type, self.encoding_name, self.clock_rate
        )?;
        if let Some(params) = &self.encoding_parameters {
            write!(f, "/{}", params)?;
        }
        Ok(())
    }
}

impl fmt::Display for Fmtp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a=fmtp:{} ", self.format)?;
        let mut keys: Vec<&String> = self.parameters.keys().collect();
        keys.sort();
        for (i, k) in keys.into_iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}={}", k, self.parameters[k])?;
        }
        Ok(())
    }
}
