//! Client URL parsing and timeouts

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result, TimeoutPhase};
use crate::protocol::constants::RTMP_PORT;

/// Parsed `rtmp://host[:port]/app/stream[?query]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    /// Stream name including any query string, as sent in play/publish
    pub stream: String,
}

impl RtmpUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let bad = || Error::Url(url.to_string());

        let rest = url.strip_prefix("rtmp://").ok_or_else(bad)?;
        let (authority, path) = rest.split_once('/').ok_or_else(bad)?;
        let (host, port) = split_host_port(authority, RTMP_PORT).ok_or_else(bad)?;

        let (app, stream) = path.split_once('/').ok_or_else(bad)?;
        let stream = stream.trim_end_matches('/');
        if app.is_empty() || stream.is_empty() || stream.starts_with('?') {
            return Err(bad());
        }

        Ok(Self {
            host,
            port,
            app: app.to_string(),
            stream: stream.to_string(),
        })
    }

    /// `host:port` for `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

/// `host[:port]`; an empty host or a bad port is rejected
pub(crate) fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, default_port),
    };
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Client timeouts; `Duration::ZERO` means no limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientSessionOptions {
    /// TCP connect
    pub connect_timeout: Duration,
    /// Everything from connect up to the play/publish `onStatus`
    pub do_timeout: Duration,
    /// Gap between two reads once media flows
    pub read_av_timeout: Duration,
}

impl ClientSessionOptions {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn do_timeout(mut self, timeout: Duration) -> Self {
        self.do_timeout = timeout;
        self
    }

    pub fn read_av_timeout(mut self, timeout: Duration) -> Self {
        self.read_av_timeout = timeout;
        self
    }
}

/// Run `fut` under `limit`, mapping expiry to `Timeout(phase)`
pub(crate) async fn within<F, T>(limit: Duration, phase: TimeoutPhase, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if limit.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(phase))?
}
