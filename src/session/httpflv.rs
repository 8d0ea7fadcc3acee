//! HTTP-FLV subscriber session: `GET /<app>/<stream>.flv`

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::http::{self, HttpRequest};
use crate::error::Result;
use crate::hub::{HubFrame, HubManager, StreamIdentity, SubscriberProtocol};
use crate::media::flv::{self, FlvTag};
use crate::stats::{CountingStream, SessionStat, StatDirection, StatSession};

pub const HTTP_FLV_RESPONSE_HEADER: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Server: livehub/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
    "Cache-Control: no-cache\r\n",
    "Content-Type: video/x-flv\r\n",
    "Connection: close\r\n",
    "Expires: -1\r\n",
    "Pragma: no-cache\r\n",
    "Access-Control-Allow-Origin: *\r\n",
    "\r\n",
);

pub struct HttpFlvSubSession<S> {
    id: u64,
    stream: CountingStream<S>,
    stat: SessionStat,
    request: Option<HttpRequest>,
}

impl<S> HttpFlvSubSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: u64, stream: S, remote_addr: Option<SocketAddr>) -> Self {
        let stat = SessionStat::new("HTTPFLV", format!("FLVSUB{}", id), remote_addr, StatDirection::Write);
        Self {
            id,
            stream: CountingStream::new(stream, stat.conn()),
            stat,
            request: None,
        }
    }

    pub fn with_request(mut self, request: HttpRequest) -> Self {
        self.request = Some(request);
        self
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

    pub async fn run(&mut self, hubs: &HubManager, request_timeout: Duration) -> Result<()> {
        let result = self.serve(hubs, request_timeout).await;
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(session_id = self.id, error = %e, "Shutdown failed");
        }
        result
    }

    async fn serve(&mut self, hubs: &HubManager, request_timeout: Duration) -> Result<()> {
        let request = match self.request.take() {
            Some(request) => request,
            None => http::read_request(&mut self.stream, request_timeout).await?,
        };
        let Some(identity) = request.stream_identity("flv") else {
            tracing::debug!(session_id = self.id, uri = %request.uri, "Not an HTTP-FLV request");
            return http::write_not_found(&mut self.stream).await;
        };
        self.request = Some(request);

        let mut sub = hubs.subscribe(&identity, SubscriberProtocol::HttpFlv).await?;
        tracing::info!(session_id = self.id, stream = %identity, subscriber_id = sub.id(), "HTTP-FLV play started");

        let mut out = BytesMut::new();
        out.put_slice(HTTP_FLV_RESPONSE_HEADER.as_bytes());
        out.put_slice(&flv::file_header(true, true));
        self.stream.write_all(&out).await?;

        let mut scratch = BytesMut::with_capacity(128);
        loop {
            let frame = tokio::select! {
                frame = sub.recv() => frame?,
                closed = http::client_closed(&mut self.stream, &mut scratch) => {
                    tracing::info!(session_id = self.id, stream = %identity, "HTTP-FLV client closed");
                    return closed;
                }
            };
            if frame.is_closed() {
                return Ok(());
            }
            out.clear();
            for tag in frame_tags(&frame)? {
                out.put_slice(&tag.encode());
            }
            if !out.is_empty() {
                self.stream.write_all(&out).await?;
            }
        }
    }

    /// Stream this session serves, once the request is known
    pub fn stream_identity(&self) -> Option<StreamIdentity> {
        self.request.as_ref()?.stream_identity("flv")
    }
}

fn frame_tags(frame: &HubFrame) -> Result<Vec<FlvTag>> {
    let tags = match frame {
        HubFrame::Metadata(data) => vec![FlvTag::script(data.clone())],
        HubFrame::Config(config) => {
            let mut tags = Vec::with_capacity(2);
            if let Some(asc) = &config.asc {
                tags.push(FlvTag::audio(0, flv::audio_config_body(asc)));
            }
            if config.video_codec().is_some() {
                tags.push(FlvTag::video(0, flv::video_config_body(config)?));
            }
            tags
        }
        HubFrame::Packet(pkt) => vec![FlvTag::from_packet(pkt)],
        HubFrame::Closed => Vec::new(),
    };
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::hub::{HubConfig, PublisherKind, PublisherObserver};
    use crate::media::AvPacket;

    #[tokio::test]
    async fn test_streams_flv_tags() {
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let identity = StreamIdentity::new("live", "radio");
        let mut publisher = hubs.publish(&identity, 100, PublisherKind::Local).await.unwrap();
        publisher.on_metadata(Bytes::from_static(&[0x02, 0x00, 0x01, b'x'])).unwrap();
        publisher
            .on_av_config(&crate::media::CodecConfig {
                asc: Some(Bytes::from_static(&[0x12, 0x10])),
                ..Default::default()
            })
            .unwrap();

        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let server_hubs = Arc::clone(&hubs);
        let handle = tokio::spawn(async move {
            let mut session = HttpFlvSubSession::new(1, server, None);
            session.run(&server_hubs, Duration::from_secs(1)).await
        });
        client.write_all(b"GET /live/radio.flv HTTP/1.1\r\n\r\n").await.unwrap();

        let mut header = vec![0u8; HTTP_FLV_RESPONSE_HEADER.len() + 13];
        client.read_exact(&mut header).await.unwrap();
        assert!(header.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert_eq!(&header[HTTP_FLV_RESPONSE_HEADER.len()..][..3], b"FLV");

        // script tag with the metadata body
        let mut script = vec![0u8; 11 + 4 + 4];
        client.read_exact(&mut script).await.unwrap();
        assert_eq!(script[0], flv::TAG_TYPE_SCRIPT);
        assert_eq!(&script[11..15], &[0x02, 0x00, 0x01, b'x']);

        // audio sequence header
        let mut audio = vec![0u8; 11 + 4 + 4];
        client.read_exact(&mut audio).await.unwrap();
        assert_eq!(audio[0], flv::TAG_TYPE_AUDIO);
        assert_eq!(&audio[11..15], &[0xAF, 0x00, 0x12, 0x10]);

        publisher.on_av_packet(AvPacket::audio(21, Bytes::from_static(&[0x21]))).unwrap();
        let mut raw = vec![0u8; 11 + 3 + 4];
        client.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[4..7], &[0, 0, 21]);
        assert_eq!(&raw[11..14], &[0xAF, 0x01, 0x21]);

        hubs.dispose_all().await;
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_client_close_releases_subscription() {
        // nothing is published, so only the socket can end the session
        let hubs = Arc::new(HubManager::new(HubConfig::default()));
        let (mut client, server) = tokio::io::duplex(4096);
        let server_hubs = Arc::clone(&hubs);
        let handle = tokio::spawn(async move {
            let mut session = HttpFlvSubSession::new(1, server, None);
            session.run(&server_hubs, Duration::from_secs(1)).await
        });

        client.write_all(b"GET /live/idle.flv HTTP/1.1\r\n\r\n").await.unwrap();
        let mut header = vec![0u8; HTTP_FLV_RESPONSE_HEADER.len() + 13];
        client.read_exact(&mut header).await.unwrap();
        let hub = hubs.get(&StreamIdentity::new("live", "idle")).await.unwrap();
        assert_eq!(hub.subscriber_count(), 1);

        drop(client);
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_ts_path_gets_404() {
        let hubs = HubManager::new(HubConfig::default());
        let (mut client, server) = tokio::io::duplex(4096);
        let request = HttpRequest::parse("GET /live/cam1.ts HTTP/1.1").unwrap();
        let mut session = HttpFlvSubSession::new(1, server, None).with_request(request);
        session.run(&hubs, Duration::from_secs(1)).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404"));
    }
}
