//! RTSP/1.0 message codec
//!
//! Requests and responses share one TCP connection with interleaved binary
//! frames once media flows:
//!
//! ```text
//! '$' | channel(1) | length(2) | RTP or RTCP packet
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ProtocolError, Result};

pub const RTSP_VERSION: &str = "RTSP/1.0";

const MAX_HEAD_SIZE: usize = 16 * 1024;
const MAX_BODY_SIZE: usize = 1024 * 1024;
const INTERLEAVED_MARKER: u8 = b'$';

/// Header list that keeps wire order and matches names case-insensitively
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace any existing value
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn parse<'a>(lines: impl Iterator<Item = &'a str>) -> Self {
        Self(
            lines
                .filter_map(|line| line.split_once(':'))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect(),
        )
    }

    fn content_length(&self) -> Result<usize> {
        match self.get("Content-Length") {
            None => Ok(0),
            Some(v) => v
                .parse()
                .map_err(|_| ProtocolError::MalformedRtsp(format!("bad Content-Length {}", v)).into()),
        }
    }

    fn write_to(&self, out: &mut String, body: &[u8]) {
        for (k, v) in self.iter() {
            if !k.eq_ignore_ascii_case("Content-Length") {
                out.push_str(&format!("{}: {}\r\n", k, v));
            }
        }
        if !body.is_empty() {
            out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        out.push_str("\r\n");
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtspRequest {
    pub method: String,
    pub uri: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl RtspRequest {
    pub fn new(method: &str, uri: &str) -> Self {
        Self {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn cseq(&self) -> Option<&str> {
        self.headers.get("CSeq")
    }

    pub fn encode(&self) -> Bytes {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, RTSP_VERSION);
        self.headers.write_to(&mut out, &self.body);
        let mut buf = BytesMut::from(out.as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

impl RtspResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    /// Response echoing the request's CSeq
    pub fn to(request: &RtspRequest, status: u16) -> Self {
        let mut response = Self::new(status);
        if let Some(cseq) = request.cseq() {
            response.headers.set("CSeq", cseq);
        }
        response
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = format!("{} {} {}\r\n", RTSP_VERSION, self.status, self.reason);
        self.headers.write_to(&mut out, &self.body);
        let mut buf = BytesMut::from(out.as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        415 => "Unsupported Media Type",
        454 => "Session Not Found",
        455 => "Method Not Valid in This State",
        461 => "Unsupported Transport",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// Anything that can arrive on an RTSP connection
#[derive(Debug, Clone, PartialEq)]
pub enum RtspItem {
    Request(RtspRequest),
    Response(RtspResponse),
    Interleaved { channel: u8, payload: Bytes },
}

/// Decode one item from the front of `buf`, or `None` if more bytes are needed
pub fn decode_item(buf: &mut BytesMut) -> Result<Option<RtspItem>> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf[0] == INTERLEAVED_MARKER {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Ok(None);
        }
        let channel = buf[1];
        buf.advance(4);
        let payload = buf.split_to(len).freeze();
        return Ok(Some(RtspItem::Interleaved { channel, payload }));
    }

    let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProtocolError::MalformedRtsp("message head too large".into()).into());
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| ProtocolError::MalformedRtsp("message head is not utf-8".into()))?;
    let mut lines = head.lines();
    let first = lines.next().unwrap_or_default().to_string();
    let headers = Headers::parse(lines);

    let body_len = headers.content_length()?;
    if body_len > MAX_BODY_SIZE {
        return Err(ProtocolError::MalformedRtsp(format!("body of {} bytes", body_len)).into());
    }
    if buf.len() < head_end + 4 + body_len {
        return Ok(None);
    }
    buf.advance(head_end + 4);
    let body = buf.split_to(body_len).freeze();

    let fields: Vec<&str> = first.splitn(3, ' ').collect();
    let item = match fields.as_slice() {
        [version, status, reason] if version.starts_with("RTSP/") => {
            let status = status
                .parse()
                .map_err(|_| ProtocolError::MalformedRtsp(first.clone()))?;
            RtspItem::Response(RtspResponse {
                status,
                reason: reason.to_string(),
                headers,
                body,
            })
        }
        [method, uri, version] if version.starts_with("RTSP/") => RtspItem::Request(RtspRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            headers,
            body,
        }),
        _ => return Err(ProtocolError::MalformedRtsp(first).into()),
    };
    Ok(Some(item))
}

/// `$`-framed binary data on channel `channel`
pub fn encode_interleaved(channel: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u8(INTERLEAVED_MARKER);
    buf.put_u8(channel);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    buf.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowerTransport {
    Tcp,
    Udp,
}

/// The parts of a `Transport` header this server acts on
#[derive(Debug, Clone, PartialEq)]
pub struct Transport {
    pub lower: LowerTransport,
    pub unicast: bool,
    pub interleaved: Option<(u8, u8)>,
    pub mode: Option<String>,
}

impl Transport {
    pub fn parse(value: &str) -> Self {
        let mut transport = Transport {
            lower: LowerTransport::Udp,
            unicast: true,
            interleaved: None,
            mode: None,
        };
        for part in value.split(';').map(str::trim) {
            let (key, val) = part.split_once('=').unwrap_or((part, ""));
            match key {
                "RTP/AVP/TCP" => transport.lower = LowerTransport::Tcp,
                "RTP/AVP" | "RTP/AVP/UDP" => transport.lower = LowerTransport::Udp,
                "unicast" => transport.unicast = true,
                "multicast" => transport.unicast = false,
                "interleaved" => {
                    transport.interleaved = match val.split_once('-') {
                        Some((a, b)) => a.parse().ok().zip(b.parse().ok()),
                        None => val.parse().ok().map(|a: u8| (a, a.saturating_add(1))),
                    };
                }
                "mode" => transport.mode = Some(val.trim_matches('"').to_string()),
                _ => {}
            }
        }
        transport
    }

    pub fn tcp_interleaved(rtp: u8, rtcp: u8) -> Self {
        Self {
            lower: LowerTransport::Tcp,
            unicast: true,
            interleaved: Some((rtp, rtcp)),
            mode: None,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self.lower {
            LowerTransport::Tcp => "RTP/AVP/TCP",
            LowerTransport::Udp => "RTP/AVP",
        })?;
        f.write_str(if self.unicast { ";unicast" } else { ";multicast" })?;
        if let Some((a, b)) = self.interleaved {
            write!(f, ";interleaved={}-{}", a, b)?;
        }
        if let Some(mode) = &self.mode {
            write!(f, ";mode={}", mode)?;
        }
        Ok(())
    }
}

/// Absolute URL of a track from the presentation URL and its `a=control`
pub fn resolve_control(base: &str, control: Option<&str>) -> String {
    match control {
        None | Some("") | Some("*") => base.to_string(),
        Some(c) if c.starts_with("rtsp://") || c.starts_with("rtsps://") => c.to_string(),
        Some(c) => format!("{}/{}", base.trim_end_matches('/'), c.trim_start_matches('/')),
    }
}

/// Buffered RTSP transport
pub struct RtspConnection<S> {
    stream: S,
    buf: BytesMut,
}

impl<S> RtspConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Next request, response or interleaved frame; `ConnectionClosed` at EOF
    pub async fn read_item(&mut self) -> Result<RtspItem> {
        loop {
            if let Some(item) = decode_item(&mut self.buf)? {
                return Ok(item);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETUP: &str = "SETUP rtsp://127.0.0.1:5544/live/cam1/streamid=0 RTSP/1.0\r\n\
        Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record\r\n\
        CSeq: 3\r\n\
        User-Agent: Lavf58.76.100\r\n\
        \r\n";

    #[test]
    fn test_decode_request() {
        let mut buf = BytesMut::from(SETUP.as_bytes());
        let Some(RtspItem::Request(req)) = decode_item(&mut buf).unwrap() else {
            panic!("not a request");
        };
        assert!(buf.is_empty());
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.cseq(), Some("3"));
        assert_eq!(req.headers.get("transport"), Some("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record"));
        assert_eq!(req.encode(), Bytes::from(SETUP));
    }

    #[test]
    fn test_decode_waits_for_body() {
        let sdp = "v=0\r\nm=video 0 RTP/AVP 96\r\n";
        let msg = format!(
            "ANNOUNCE rtsp://h/live/cam1 RTSP/1.0\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n{}",
            sdp.len(),
            sdp
        );
        let mut buf = BytesMut::from(&msg.as_bytes()[..msg.len() - 5]);
        assert_eq!(decode_item(&mut buf).unwrap(), None);
        buf.put_slice(&msg.as_bytes()[msg.len() - 5..]);
        match decode_item(&mut buf).unwrap() {
            Some(RtspItem::Request(req)) => assert_eq!(&req.body[..], sdp.as_bytes()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_interleaved_after_response() {
        let response = RtspResponse::new(200).header("CSeq", "4").header("Session", "12345678");
        let mut buf = BytesMut::new();
        buf.put_slice(&response.encode());
        buf.put_slice(&encode_interleaved(2, &[0x80, 0x60, 0, 1]));
        buf.put_slice(&[b'$', 0]);

        assert_eq!(decode_item(&mut buf).unwrap(), Some(RtspItem::Response(response)));
        assert_eq!(
            decode_item(&mut buf).unwrap(),
            Some(RtspItem::Interleaved {
                channel: 2,
                payload: Bytes::from_static(&[0x80, 0x60, 0, 1])
            })
        );
        assert_eq!(decode_item(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_malformed_start_line() {
        let mut buf = BytesMut::from(&b"HELLO\r\n\r\n"[..]);
        assert!(decode_item(&mut buf).is_err());
    }

    #[test]
    fn test_transport() {
        let t = Transport::parse("RTP/AVP/TCP;unicast;interleaved=2-3;mode=record");
        assert_eq!(t.lower, LowerTransport::Tcp);
        assert_eq!(t.interleaved, Some((2, 3)));
        assert_eq!(t.mode.as_deref(), Some("record"));

        let udp = Transport::parse("RTP/AVP;unicast;client_port=8000-8001");
        assert_eq!(udp.lower, LowerTransport::Udp);
        assert_eq!(udp.interleaved, None);

        assert_eq!(Transport::tcp_interleaved(0, 1).to_string(), "RTP/AVP/TCP;unicast;interleaved=0-1");
    }

    #[test]
    fn test_resolve_control() {
        let base = "rtsp://h:554/live/cam1";
        assert_eq!(resolve_control(base, Some("streamid=0")), "rtsp://h:554/live/cam1/streamid=0");
        assert_eq!(resolve_control(&format!("{}/", base), Some("trackID=1")), "rtsp://h:554/live/cam1/trackID=1");
        assert_eq!(resolve_control(base, Some("rtsp://other/x")), "rtsp://other/x");
        assert_eq!(resolve_control(base, Some("*")), base);
        assert_eq!(resolve_control(base, None), base);
    }
}
