//! HTTP-TS subscriber session
//!
//! `GET /<app>/<stream>.ts` answers with a never-ending MPEG-TS body: one
//! fragment of whole 188-byte packets per forwarded AV packet.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::http::{self, HttpRequest};
use crate::error::Result;
use crate::hub::{HubFrame, HubManager, StreamIdentity, SubscriberProtocol};
use crate::media::TsMuxer;
use crate::stats::{CountingStream, SessionStat, StatDirection, StatSession};

pub const HTTP_TS_RESPONSE_HEADER: &str = concat!(
    "HTTP/1.1 200 OK\r\n",
    "Server: livehub/",
    env!("CARGO_PKG_VERSION"),
    "\r\n",
    "Cache-Control: no-cache\r\n",
    "Content-Type: video/mp2t\r\n",
    "Connection: close\r\n",
    "Expires: -1\r\n",
    "Pragma: no-cache\r\n",
    "Access-Control-Allow-Origin: *\r\n",
    "\r\n",
);

pub struct HttpTsSubSession<S> {
    id: u64,
    stream: CountingStream<S>,
    stat: SessionStat,
    request: Option<HttpRequest>,
    disposed: bool,
}

impl<S> HttpTsSubSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: u64, stream: S, remote_addr: Option<SocketAddr>) -> Self {
        let stat = SessionStat::new("HTTPTS", format!("HTTPTSSUB{}", id), remote_addr, StatDirection::Write);
        Self {
            id,
            stream: CountingStream::new(stream, stat.conn()),
            stat,
            request: None,
            disposed: false,
        }
    }

    /// Use a request head the listener already read
    pub fn with_request(mut self, request: HttpRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn unique_key(&self) -> &str {
        self.stat.session_id()
    }

    pub async fn read_request(&mut self, timeout: Duration) -> Result<&HttpRequest> {
        let request = http::read_request(&mut self.stream, timeout).await?;
        Ok(self.request.insert(request))
    }

    /// Stream named by the request, if it is a valid HTTP-TS request
    pub fn stream_identity(&self) -> Option<StreamIdentity> {
        self.request.as_ref()?.stream_identity("ts")
    }

    pub async fn write_response_header(&mut self) -> Result<()> {
        self.write_raw_fragment(HTTP_TS_RESPONSE_HEADER.as_bytes()).await
    }

    pub async fn write_raw_fragment(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Close the connection; later calls do nothing
    pub async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;
        tracing::info!(session_id = self.id, key = %self.unique_key(), "HTTP-TS session disposed");
        self.stream.shutdown().await?;
        Ok(())
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

    /// Serve one subscriber until the hub closes or the client goes away
    pub async fn run(&mut self, hubs: &HubManager, request_timeout: Duration) -> Result<()> {
        let result = self.serve(hubs, request_timeout).await;
        if let Err(e) = self.dispose().await {
            tracing::debug!(session_id = self.id, error = %e, "Shutdown failed");
        }
        result
    }

    async fn serve(&mut self, hubs: &HubManager, request_timeout: Duration) -> Result<()> {
        if self.request.is_none() {
            self.read_request(request_timeout).await?;
        }
        let Some(identity) = self.stream_identity() else {
            tracing::debug!(session_id = self.id, request = ?self.request, "Not an HTTP-TS request");
            return http::write_not_found(&mut self.stream).await;
        };

        let mut sub = hubs.subscribe(&identity, SubscriberProtocol::HttpTs).await?;
        tracing::info!(session_id = self.id, stream = %identity, subscriber_id = sub.id(), "HTTP-TS play started");
        self.write_response_header().await?;

        let mut muxer = TsMuxer::new();
        let mut scratch = BytesMut::with_capacity(128);
        loop {
            let frame = tokio::select! {
                frame = sub.recv() => frame?,
                closed = http::client_closed(&mut self.stream, &mut scratch) => {
                    tracing::info!(session_id = self.id, stream = %identity, "HTTP-TS client closed");
                    return closed;
                }
            };
            match frame {
                HubFrame::Config(config) => muxer.set_config(&config)?,
                HubFrame::Packet(pkt) => {
                    if let Some(fragment) = muxer.mux(&pkt) {
                        self.write_raw_fragment(&fragment).await?;
                    }
                }
                HubFrame::Metadata(_) => {}
                HubFrame::Closed => return Ok(()),
            }
        }
    }
}
