//! RTMP push session
//!
//! Publishes hub frames to a remote server. Frames are re-framed exactly as
//! an RTMP player session would send them, so metadata and sequence headers
//! reach the remote side before the first media packet.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::config::{ClientSessionOptions, RtmpUrl};
use super::core::{ClientRole, ClientSession};
use crate::error::Result;
use crate::hub::HubFrame;
use crate::session::rtmp::frame_messages;
use crate::stats::StatSession;

pub struct PushSession<S> {
    core: ClientSession<S>,
}

impl PushSession<TcpStream> {
    /// Connect and publish; returns once the server answered `NetStream.Publish.Start`
    pub async fn push(url: &str, options: ClientSessionOptions) -> Result<Self> {
        let core = ClientSession::connect(ClientRole::Push, url, options).await?;
        Ok(Self { core })
    }
}

impl<S> PushSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Publish over an already connected stream
    pub async fn start(stream: S, url: &str, options: ClientSessionOptions) -> Result<Self> {
        let mut core = ClientSession::new(ClientRole::Push, stream, None, RtmpUrl::parse(url)?, options);
        core.start().await?;
        Ok(Self { core })
    }

    /// Send one hub frame; `Closed` sends nothing.
    ///
    /// Whatever the server sent since the last frame is handled first, so
    /// pings get answered and a rejection surfaces here.
    pub async fn write_frame(&mut self, frame: &HubFrame) -> Result<()> {
        self.core.drain_inbound().await?;
        let messages = frame_messages(frame)?;
        if messages.is_empty() {
            return Ok(());
        }
        for (message, timestamp) in &messages {
            self.core.send(message, *timestamp).await?;
        }
        self.core.flush().await
    }

    pub async fn dispose(&mut self) {
        self.core.dispose().await;
    }

    pub fn unique_key(&self) -> &str {
        self.core.unique_key()
    }

    pub fn stat(&self) -> StatSession {
        self.core.stat()
    }

    pub fn update_stat(&mut self, interval_secs: u32) {
        self.core.update_stat(interval_secs);
    }

    /// Whether bytes were written since the last call
    pub fn is_alive(&mut self) -> bool {
        self.core.is_alive()
    }
}
