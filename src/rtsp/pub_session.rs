//! RTSP publish (ingest) server session
//!
//! ```text
//! OPTIONS -> ANNOUNCE (sdp) -> SETUP per track -> RECORD -> $ frames ... -> TEARDOWN
//! ```
//!
//! Media must be interleaved on the RTSP connection; a UDP `SETUP` is
//! answered with 461.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use super::message::{resolve_control, LowerTransport, RtspConnection, RtspItem, RtspRequest, RtspResponse, Transport};
use crate::error::{Error, HubError, Result, TimeoutPhase};
use crate::hub::{HubManager, HubPublisher, PublisherKind, PublisherObserver, StreamIdentity};
use crate::media::CodecConfig;
use crate::rtp::{RtpObserver, RtpPacket, TrackUnpacker};
use crate::sdp::{self, SdpTrack};
use crate::stats::{CountingStream, SessionStat, StatDirection, StatSession};

const PUBLIC_METHODS: &str = "OPTIONS, ANNOUNCE, SETUP, RECORD, TEARDOWN";

/// `rtsp://host[:port]/app/stream[?query]` -> `app`, `stream`
pub fn identity_from_url(url: &str) -> Option<StreamIdentity> {
    let rest = url.strip_prefix("rtsp://")?;
    let (_, path) = rest.split_once('/')?;
    let path = path.split('?').next()?.trim_end_matches('/');
    let (app, name) = path.split_once('/')?;
    if app.is_empty() || name.is_empty() {
        return None;
    }
    Some(StreamIdentity::new(app, name))
}

struct SetupTrack {
    unpacker: TrackUnpacker,
}

pub struct RtspPubSession<S> {
    id: u64,
    conn: RtspConnection<CountingStream<S>>,
    stat: SessionStat,
    hubs: Arc<HubManager>,
    read_timeout: Duration,
    /// Value of the `Session` header handed out at the first SETUP
    session_key: String,
    base_url: String,
    tracks: Vec<SdpTrack>,
    /// RTP channel -> track
    channels: HashMap<u8, SetupTrack>,
    publisher: Option<HubPublisher>,
    recording: bool,
}

impl<S> RtspPubSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        id: u64,
        stream: S,
        remote_addr: Option<SocketAddr>,
        hubs: Arc<HubManager>,
        read_timeout: Duration,
    ) -> Self {
        let stat = SessionStat::new("RTSP", format!("RTSPPUB{}", id), remote_addr, StatDirection::Read);
        Self {
            id,
            conn: RtspConnection::new(CountingStream::new(stream, stat.conn())),
            stat,
            hubs,
            read_timeout,
            session_key: format!("{:08X}", rand::random::<u32>()),
            base_url: String::new(),
            tracks: Vec::new(),
            channels: HashMap::new(),
            publisher: None,
            recording: false,
        }
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

    pub async fn run(&mut self) -> Result<()> {
        let result = self.serve().await;
        self.dispose();
        result
    }

    /// Detach from the hub; safe to repeat
    pub fn dispose(&mut self) {
        if let Some(publisher) = self.publisher.take() {
            tracing::info!(session_id = self.id, stream = %publisher.hub().identity(), "RTSP publish stopped");
        }
        self.recording = false;
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            match self.read_item().await? {
                RtspItem::Request(req) => {
                    if !self.on_request(req).await? {
                        return Ok(());
                    }
                }
                RtspItem::Interleaved { channel, payload } => self.on_interleaved(channel, payload)?,
                RtspItem::Response(resp) => {
                    tracing::debug!(session_id = self.id, status = resp.status, "Ignoring response from publisher");
                }
            }
        }
    }

    async fn read_item(&mut self) -> Result<RtspItem> {
        if self.read_timeout.is_zero() {
            return self.conn.read_item().await;
        }
        let phase = if self.recording {
            TimeoutPhase::ReadAv
        } else {
            TimeoutPhase::ReadRequest
        };
        tokio::time::timeout(self.read_timeout, self.conn.read_item())
            .await
            .map_err(|_| Error::Timeout(phase))?
    }

    /// Returns false once the session should end
    async fn on_request(&mut self, req: RtspRequest) -> Result<bool> {
        tracing::debug!(session_id = self.id, method = %req.method, uri = %req.uri, "RTSP request");
        match req.method.as_str() {
            "OPTIONS" => {
                let resp = RtspResponse::to(&req, 200).header("Public", PUBLIC_METHODS);
                self.reply(resp).await?;
            }
            "ANNOUNCE" => self.on_announce(req).await?,
            "SETUP" => self.on_setup(req).await?,
            "RECORD" => {
                if self.publisher.is_none() || self.channels.is_empty() {
                    self.reply(RtspResponse::to(&req, 455)).await?;
                } else {
                    self.recording = true;
                    let resp = RtspResponse::to(&req, 200).header("Session", self.session_key.clone());
                    self.reply(resp).await?;
                    tracing::info!(session_id = self.id, tracks = self.channels.len(), "RTSP record started");
                }
            }
            "TEARDOWN" => {
                self.reply(RtspResponse::to(&req, 200)).await?;
                return Ok(false);
            }
            _ => self.reply(RtspResponse::to(&req, 501)).await?,
        }
        Ok(true)
    }

    async fn on_announce(&mut self, req: RtspRequest) -> Result<()> {
        let Some(identity) = identity_from_url(&req.uri) else {
            self.reply(RtspResponse::to(&req, 400)).await?;
            return Ok(());
        };

        let parsed = std::str::from_utf8(&req.body)
            .map_err(|_| crate::error::SdpError::MalformedLine("sdp body is not utf-8".into()))
            .and_then(|text| sdp::parse_sdp(text)?.tracks());
        let tracks = match parsed {
            Ok(tracks) if !tracks.is_empty() => tracks,
            Ok(_) => {
                self.reply(RtspResponse::to(&req, 415)).await?;
                return Ok(());
            }
            Err(e) => {
                self.reply(RtspResponse::to(&req, 400)).await?;
                return Err(e.into());
            }
        };

        let mut publisher = match self.hubs.publish(&identity, self.id, PublisherKind::Local).await {
            Ok(publisher) => publisher,
            Err(e @ HubError::Conflict(_)) => {
                tracing::warn!(session_id = self.id, stream = %identity, "RTSP publish rejected");
                self.reply(RtspResponse::to(&req, 406)).await?;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let mut config = CodecConfig::default();
        for track in &tracks {
            config.merge(&track.config);
        }
        if !config.is_empty() {
            PublisherObserver::on_av_config(&mut publisher, &config)?;
        }

        tracing::info!(session_id = self.id, stream = %identity, tracks = tracks.len(), "RTSP publish announced");
        self.base_url = req.uri.clone();
        self.tracks = tracks;
        self.publisher = Some(publisher);
        self.reply(RtspResponse::to(&req, 200)).await
    }

    async fn on_setup(&mut self, req: RtspRequest) -> Result<()> {
        let transport = Transport::parse(req.headers.get("Transport").unwrap_or_default());
        let interleaved = match (transport.lower, transport.interleaved) {
            (LowerTransport::Tcp, Some(channels)) => channels,
            _ => {
                tracing::debug!(session_id = self.id, transport = %transport, "Unsupported transport");
                return self.reply(RtspResponse::to(&req, 461)).await;
            }
        };

        let base = self.base_url.as_str();
        let track = self.tracks.iter().find(|t| {
            let url = resolve_control(base, t.control.as_deref());
            url == req.uri || t.control.as_deref().is_some_and(|c| req.uri.ends_with(c))
        });
        let Some(track) = track else {
            return self.reply(RtspResponse::to(&req, 404)).await;
        };

        self.channels.insert(
            interleaved.0,
            SetupTrack {
                unpacker: TrackUnpacker::new(track),
            },
        );
        let resp = RtspResponse::to(&req, 200)
            .header("Transport", Transport::tcp_interleaved(interleaved.0, interleaved.1).to_string())
            .header("Session", self.session_key.clone());
        self.reply(resp).await
    }

    fn on_interleaved(&mut self, channel: u8, payload: bytes::Bytes) -> Result<()> {
        // RTCP channels and unknown channels carry nothing for the hub
        let (Some(track), Some(publisher)) = (self.channels.get_mut(&channel), self.publisher.as_mut()) else {
            return Ok(());
        };
        let pkt = match RtpPacket::parse(payload) {
            Ok(pkt) => pkt,
            Err(e) => {
                tracing::debug!(session_id = self.id, channel, error = %e, "Dropping RTP packet");
                return Ok(());
            }
        };
        if let Err(e) = track.unpacker.feed(&pkt, publisher as &mut dyn RtpObserver) {
            tracing::debug!(session_id = self.id, channel, error = %e, "Dropping RTP payload");
        }
        match publisher.take_error() {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn reply(&mut self, resp: RtspResponse) -> Result<()> {
        self.conn.write(&resp.encode()).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use tokio::io::DuplexStream;

    use super::*;
    use crate::hub::{HubConfig, HubFrame, SubscriberProtocol};
    use crate::media::PayloadType;
    use crate::rtp::RtpHeader;
    use crate::rtsp::message::encode_interleaved;

    const SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=No Name\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z0LAHpU=,aM48gA==\r\n\
        a=control:streamid=0\r\n";

    struct Client {
        conn: RtspConnection<DuplexStream>,
        cseq: u32,
    }

    impl Client {
        async fn call(&mut self, req: RtspRequest) -> RtspResponse {
            self.cseq += 1;
            let req = req.header("CSeq", self.cseq.to_string());
            self.conn.write(&req.encode()).await.unwrap();
            match self.conn.read_item().await.unwrap() {
                RtspItem::Response(resp) => {
                    assert_eq!(resp.headers.get("CSeq"), Some(self.cseq.to_string().as_str()));
                    resp
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        async fn announce(&mut self, url: &str) -> RtspResponse {
            let mut req = RtspRequest::new("ANNOUNCE", url).header("Content-Type", "application/sdp");
            req.body = Bytes::from_static(SDP.as_bytes());
            self.call(req).await
        }
    }

    fn spawn(hubs: &Arc<HubManager>, id: u64) -> (Client, tokio::task::JoinHandle<Result<()>>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut session = RtspPubSession::new(id, b, None, Arc::clone(hubs), Duration::from_secs(5));
        let handle = tokio::spawn(async move { session.run().await });
        (
            Client {
                conn: RtspConnection::new(a),
                cseq: 0,
            },
            handle,
        )
    }

    fn rtp(seq: u16, ts: u32, payload: &[u8]) -> Bytes {
        RtpPacket::new(
            RtpHeader {
                marker: true,
                payload_type: 96,
                sequence_number: seq,
                timestamp: ts,
                ssrc: 1,
            },
            Bytes::copy_from_slice(payload),
        )
        .encode()
    }

    #[test]
    fn test_identity_from_url() {
        assert_eq!(
            identity_from_url("rtsp://127.0.0.1:5544/live/cam1?x=1"),
            Some(StreamIdentity::new("live", "cam1"))
        );
        assert_eq!(identity_from_url("rtsp://127.0.0.1/cam1"), None);
        assert_eq!(identity_from_url("http://h/live/cam1"), None);
    }

    #[tokio::test]
    async fn test_announce_setup_record() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let (mut client, handle) = spawn(&hubs, 1);
        let url = "rtsp://127.0.0.1:5544/live/cam1";

        let resp = client.call(RtspRequest::new("OPTIONS", url)).await;
        assert!(resp.headers.get("Public").unwrap().contains("ANNOUNCE"));

        assert_eq!(client.announce(url).await.status, 200);
        let identity = StreamIdentity::new("live", "cam1");
        let mut sub = hubs.subscribe(&identity, SubscriberProtocol::HttpFlv).await.unwrap();
        match sub.try_recv() {
            Some(HubFrame::Config(config)) => assert_eq!(config.video_codec(), Some(PayloadType::Avc)),
            other => panic!("unexpected {:?}", other),
        }

        let udp = RtspRequest::new("SETUP", &format!("{}/streamid=0", url))
            .header("Transport", "RTP/AVP;unicast;client_port=8000-8001");
        assert_eq!(client.call(udp).await.status, 461);

        let tcp = RtspRequest::new("SETUP", &format!("{}/streamid=0", url))
            .header("Transport", "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record");
        let resp = client.call(tcp).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.headers.get("Transport"), Some("RTP/AVP/TCP;unicast;interleaved=0-1"));
        assert!(resp.headers.get("Session").is_some());

        assert_eq!(client.call(RtspRequest::new("RECORD", url)).await.status, 200);

        // IDR slice as a single NAL unit, then an RTCP frame that is ignored
        let mut frames = BytesMut::new();
        frames.put_slice(&encode_interleaved(0, &rtp(1, 90_000, &[0x65, 0x88, 0x84])));
        frames.put_slice(&encode_interleaved(1, &[0x80, 0xC8, 0x00, 0x00]));
        frames.put_slice(&encode_interleaved(0, &rtp(2, 93_600, &[0x41, 0x9A])));
        client.conn.write(&frames).await.unwrap();

        let first = sub.recv().await.unwrap();
        match first {
            HubFrame::Packet(pkt) => {
                assert!(pkt.is_keyframe());
                assert_eq!(pkt.timestamp, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
        match sub.recv().await.unwrap() {
            HubFrame::Packet(pkt) => assert_eq!(pkt.timestamp, 40),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(client.call(RtspRequest::new("TEARDOWN", url)).await.status, 200);
        handle.await.unwrap().unwrap();
        let hub = hubs.get(&identity).await.unwrap();
        assert!(!hub.has_publisher());
    }

    #[tokio::test]
    async fn test_second_announce_conflicts() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let url = "rtsp://127.0.0.1:5544/live/cam1";
        let (mut first, _h1) = spawn(&hubs, 1);
        assert_eq!(first.announce(url).await.status, 200);

        let (mut second, h2) = spawn(&hubs, 2);
        assert_eq!(second.announce(url).await.status, 406);
        let err = h2.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Hub(HubError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_bad_sdp_rejected() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let (mut client, handle) = spawn(&hubs, 1);
        let mut req = RtspRequest::new("ANNOUNCE", "rtsp://h/live/cam1");
        req.body = Bytes::from_static(b"v=0\r\na=rtpmap:x\r\n");
        assert_eq!(client.call(req).await.status, 400);
        assert!(matches!(handle.await.unwrap(), Err(Error::Sdp(_))));
        assert_eq!(hubs.hub_count().await, 0);
    }
}
