//! RTSP pull client session
//!
//! ```text
//! OPTIONS -> DESCRIBE -> SETUP (one per track, TCP interleaved) -> PLAY -> $ frames ...
//! ```
//!
//! Depacketized media goes to a [`PublisherObserver`], so a pull can feed a
//! hub the same way an RTMP pull does.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::message::{resolve_control, RtspConnection, RtspItem, RtspRequest, RtspResponse, Transport};
use crate::client::config::{split_host_port, within, ClientSessionOptions};
use crate::error::{Error, ProtocolError, Result, SdpError, TimeoutPhase};
use crate::hub::PublisherObserver;
use crate::media::{AvPacket, CodecConfig};
use crate::rtp::{RtpObserver, RtpPacket, TrackUnpacker};
use crate::sdp::{self, SdpTrack};
use crate::session::next_session_id;
use crate::stats::{CountingStream, SessionStat, StatDirection, StatSession};

pub const RTSP_PORT: u16 = 554;

const USER_AGENT: &str = concat!("livehub/", env!("CARGO_PKG_VERSION"));

/// `host:port` of an `rtsp://` URL
pub fn rtsp_addr(url: &str) -> Result<String> {
    let bad = || Error::Url(url.to_string());
    let rest = url.strip_prefix("rtsp://").ok_or_else(bad)?;
    let authority = rest.split(['/', '?']).next().unwrap_or_default();
    let (host, port) = split_host_port(authority, RTSP_PORT).ok_or_else(bad)?;
    Ok(format!("{}:{}", host, port))
}

/// Forwards depacketized media to a publisher observer, keeping the first error
struct ObserverBridge<'a> {
    inner: &'a mut dyn PublisherObserver,
    error: Option<Error>,
}

impl RtpObserver for ObserverBridge<'_> {
    fn on_av_config(&mut self, config: &CodecConfig) {
        if self.error.is_none() {
            self.error = self.inner.on_av_config(config).err();
        }
    }

    fn on_av_packet(&mut self, pkt: AvPacket) {
        if self.error.is_none() {
            self.error = self.inner.on_av_packet(pkt).err();
        }
    }
}

pub struct RtspPullSession<S> {
    id: u64,
    url: String,
    conn: RtspConnection<CountingStream<S>>,
    stat: SessionStat,
    options: ClientSessionOptions,
    cseq: u32,
    session_key: Option<String>,
    tracks: Vec<SdpTrack>,
    /// RTP channel -> unpacker
    channels: HashMap<u8, TrackUnpacker>,
    disposed: bool,
}

impl RtspPullSession<TcpStream> {
    /// Connect and run the request sequence up to `PLAY`
    pub async fn pull(url: &str, options: ClientSessionOptions) -> Result<Self> {
        let addr = rtsp_addr(url)?;
        let stream = within(options.connect_timeout, TimeoutPhase::Connect, async {
            Ok(TcpStream::connect(&addr).await?)
        })
        .await?;
        let _ = stream.set_nodelay(true);
        let remote = stream.peer_addr().ok();

        let mut session = Self::new(stream, remote, url, options);
        session.start().await?;
        Ok(session)
    }
}

impl<S> RtspPullSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, remote_addr: Option<SocketAddr>, url: &str, options: ClientSessionOptions) -> Self {
        let id = next_session_id();
        let stat = SessionStat::new("RTSP", format!("RTSPPULL{}", id), remote_addr, StatDirection::Read);
        Self {
            id,
            url: url.to_string(),
            conn: RtspConnection::new(CountingStream::new(stream, stat.conn())),
            stat,
            options,
            cseq: 0,
            session_key: None,
            tracks: Vec::new(),
            channels: HashMap::new(),
            disposed: false,
        }
    }

    pub fn unique_key(&self) -> &str {
        self.stat.session_id()
    }

    pub fn tracks(&self) -> &[SdpTrack] {
        &self.tracks
    }

    pub fn stat(&self) -> StatSession {
        self.stat.snapshot()
    }

    pub fn update_stat(&mut self, interval_secs: u32) {
        self.stat.update_stat(interval_secs);
    }

    pub fn is_alive(&mut self) -> bool {
        self.stat.is_alive()
    }

    /// OPTIONS, DESCRIBE, SETUP and PLAY under the do timeout
    pub async fn start(&mut self) -> Result<()> {
        let limit = self.options.do_timeout;
        within(limit, TimeoutPhase::Do, self.negotiate()).await?;
        tracing::info!(session_id = self.id, url = %self.url, tracks = self.tracks.len(), "RTSP pull started");
        Ok(())
    }

    async fn negotiate(&mut self) -> Result<()> {
        let url = self.url.clone();
        self.request(RtspRequest::new("OPTIONS", &url)).await?;

        let describe = RtspRequest::new("DESCRIBE", &url).header("Accept", "application/sdp");
        let resp = self.request(describe).await?;
        let base = resp
            .headers
            .get("Content-Base")
            .or_else(|| resp.headers.get("Content-Location"))
            .unwrap_or(url.as_str())
            .to_string();
        let text = std::str::from_utf8(&resp.body)
            .map_err(|_| SdpError::MalformedLine("sdp body is not utf-8".into()))?;
        let tracks = sdp::parse_sdp(text)?.tracks()?;
        if tracks.is_empty() {
            return Err(ProtocolError::Rejected(format!("no supported track in {}", url)).into());
        }

        for (i, track) in tracks.iter().enumerate() {
            let rtp_channel = (i * 2) as u8;
            let setup = RtspRequest::new("SETUP", &resolve_control(&base, track.control.as_deref()))
                .header("Transport", Transport::tcp_interleaved(rtp_channel, rtp_channel + 1).to_string());
            let resp = self.request(setup).await?;

            if self.session_key.is_none() {
                self.session_key = resp
                    .headers
                    .get("Session")
                    .map(|s| s.split(';').next().unwrap_or_default().trim().to_string());
            }
            // the server may pick other channels
            let channel = resp
                .headers
                .get("Transport")
                .and_then(|t| Transport::parse(t).interleaved)
                .map_or(rtp_channel, |(rtp, _)| rtp);
            self.channels.insert(channel, TrackUnpacker::new(track));
        }

        self.request(RtspRequest::new("PLAY", &base).header("Range", "npt=0.000-"))
            .await?;
        self.tracks = tracks;
        Ok(())
    }

    async fn request(&mut self, req: RtspRequest) -> Result<RtspResponse> {
        self.cseq += 1;
        let mut req = req
            .header("CSeq", self.cseq.to_string())
            .header("User-Agent", USER_AGENT);
        if let Some(key) = &self.session_key {
            req = req.header("Session", key.clone());
        }
        self.conn.write(&req.encode()).await?;

        loop {
            match self.conn.read_item().await? {
                RtspItem::Response(resp) => {
                    if !resp.is_success() {
                        return Err(ProtocolError::Rejected(format!(
                            "{} {} {}",
                            req.method, resp.status, resp.reason
                        ))
                        .into());
                    }
                    return Ok(resp);
                }
                RtspItem::Interleaved { channel, .. } => {
                    tracing::trace!(session_id = self.id, channel, "Skipping media before response");
                }
                RtspItem::Request(r) => {
                    tracing::debug!(session_id = self.id, method = %r.method, "Ignoring server request");
                }
            }
        }
    }

    /// Read media until the server goes away; SDP config is reported first
    pub async fn run(&mut self, observer: &mut dyn PublisherObserver) -> Result<()> {
        let mut config = CodecConfig::default();
        for track in &self.tracks {
            config.merge(&track.config);
        }
        if !config.is_empty() {
            observer.on_av_config(&config)?;
        }

        let mut bridge = ObserverBridge { inner: observer, error: None };
        loop {
            let item = within(self.options.read_av_timeout, TimeoutPhase::ReadAv, self.conn.read_item()).await;
            let (channel, payload) = match item {
                Ok(RtspItem::Interleaved { channel, payload }) => (channel, payload),
                Ok(_) => continue,
                Err(Error::ConnectionClosed) => {
                    tracing::info!(session_id = self.id, url = %self.url, "RTSP pull closed by server");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.on_interleaved(channel, payload, &mut bridge);
            if let Some(e) = bridge.error.take() {
                return Err(e);
            }
        }
    }

    fn on_interleaved(&mut self, channel: u8, payload: Bytes, observer: &mut dyn RtpObserver) {
        let Some(unpacker) = self.channels.get_mut(&channel) else {
            return;
        };
        let result = RtpPacket::parse(payload).and_then(|pkt| unpacker.feed(&pkt, observer));
        if let Err(e) = result {
            tracing::debug!(session_id = self.id, channel, error = %e, "Dropping RTP packet");
        }
    }

    /// Send TEARDOWN (best effort) and close; later calls do nothing
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.session_key.is_some() {
            self.cseq += 1;
            let mut req = RtspRequest::new("TEARDOWN", &self.url).header("CSeq", self.cseq.to_string());
            if let Some(key) = &self.session_key {
                req = req.header("Session", key.clone());
            }
            let _ = self.conn.write(&req.encode()).await;
        }
        let _ = self.conn.shutdown().await;
        tracing::info!(session_id = self.id, url = %self.url, "RTSP pull disposed");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;
    use crate::rtp::RtpHeader;
    use crate::rtsp::message::encode_interleaved;

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=cam\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z0LAHpU=,aM48gA==\r\n\
        a=control:trackID=0\r\n";

    #[derive(Default)]
    struct Sink {
        configs: Vec<CodecConfig>,
        packets: Vec<AvPacket>,
    }

    impl PublisherObserver for Sink {
        fn on_av_config(&mut self, config: &CodecConfig) -> Result<()> {
            self.configs.push(config.clone());
            Ok(())
        }

        fn on_av_packet(&mut self, pkt: AvPacket) -> Result<()> {
            self.packets.push(pkt);
            Ok(())
        }

        fn on_metadata(&mut self, _metadata: Bytes) -> Result<()> {
            Ok(())
        }
    }

    async fn expect_request(conn: &mut RtspConnection<DuplexStream>, method: &str) -> RtspRequest {
        match conn.read_item().await.unwrap() {
            RtspItem::Request(req) => {
                assert_eq!(req.method, method);
                req
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn fake_server(stream: DuplexStream) {
        let mut conn = RtspConnection::new(stream);
        let req = expect_request(&mut conn, "OPTIONS").await;
        assert_eq!(req.cseq(), Some("1"));
        conn.write(&RtspResponse::to(&req, 200).encode()).await.unwrap();

        let req = expect_request(&mut conn, "DESCRIBE").await;
        let mut resp = RtspResponse::to(&req, 200)
            .header("Content-Base", "rtsp://cam/live/")
            .header("Content-Type", "application/sdp");
        resp.body = Bytes::from_static(SDP.as_bytes());
        conn.write(&resp.encode()).await.unwrap();

        let req = expect_request(&mut conn, "SETUP").await;
        assert_eq!(req.uri, "rtsp://cam/live/trackID=0");
        assert_eq!(req.headers.get("Transport"), Some("RTP/AVP/TCP;unicast;interleaved=0-1"));
        let resp = RtspResponse::to(&req, 200)
            .header("Transport", "RTP/AVP/TCP;unicast;interleaved=4-5")
            .header("Session", "ABCD;timeout=60");
        conn.write(&resp.encode()).await.unwrap();

        let req = expect_request(&mut conn, "PLAY").await;
        assert_eq!(req.headers.get("Session"), Some("ABCD"));
        conn.write(&RtspResponse::to(&req, 200).encode()).await.unwrap();

        let rtp = RtpPacket::new(
            RtpHeader {
                marker: true,
                payload_type: 96,
                sequence_number: 1,
                timestamp: 3000,
                ssrc: 9,
            },
            Bytes::from_static(&[0x65, 0x88, 0x80]),
        );
        conn.write(&encode_interleaved(4, &rtp.encode())).await.unwrap();
        conn.write(&encode_interleaved(5, &[0x80, 0xC8, 0, 0])).await.unwrap();
        // closing ends the pull
    }

    #[test]
    fn test_rtsp_addr() {
        assert_eq!(rtsp_addr("rtsp://cam/live").unwrap(), "cam:554");
        assert_eq!(rtsp_addr("rtsp://10.0.0.2:8554/a/b?x=1").unwrap(), "10.0.0.2:8554");
        assert!(matches!(rtsp_addr("rtmp://cam/live"), Err(Error::Url(_))));
    }

    #[tokio::test]
    async fn test_pull_sequence() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(fake_server(server));

        let mut session = RtspPullSession::new(client, None, "rtsp://cam/live", ClientSessionOptions::default());
        session.start().await.unwrap();
        assert_eq!(session.tracks().len(), 1);

        let mut sink = Sink::default();
        session.run(&mut sink).await.unwrap();
        server.await.unwrap();

        assert_eq!(sink.configs.len(), 1);
        assert!(sink.configs[0].sps.is_some());
        assert_eq!(sink.packets.len(), 1);
        assert!(sink.packets[0].is_keyframe());
        assert!(session.stat().read_bytes_sum > 0);
    }

    #[tokio::test]
    async fn test_error_status_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut conn = RtspConnection::new(server);
            let req = expect_request(&mut conn, "OPTIONS").await;
            conn.write(&RtspResponse::to(&req, 404).encode()).await.unwrap();
        });

        let mut session = RtspPullSession::new(client, None, "rtsp://cam/live", ClientSessionOptions::default());
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_do_timeout() {
        let (client, _server) = tokio::io::duplex(4096);
        let options = ClientSessionOptions::default().do_timeout(std::time::Duration::from_millis(20));
        let mut session = RtspPullSession::new(client, None, "rtsp://cam/live", options);
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutPhase::Do)));
    }
}
