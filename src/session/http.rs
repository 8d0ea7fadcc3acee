//! Minimal HTTP/1.x request head parsing for the subscriber listeners

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, ProtocolError, Result, TimeoutPhase};
use crate::hub::StreamIdentity;

const MAX_REQUEST_HEAD: usize = 8 * 1024;

pub const NOT_FOUND_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    /// Request target as sent, query string included
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn parse(head: &str) -> Result<Self> {
        let mut lines = head.lines();
        let first = lines
            .next()
            .ok_or_else(|| ProtocolError::MalformedHttp("empty request".into()))?;
        let mut fields = first.split_ascii_whitespace();
        let (Some(method), Some(uri), Some(version)) = (fields.next(), fields.next(), fields.next()) else {
            return Err(ProtocolError::MalformedHttp(first.to_string()).into());
        };

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Ok(Self {
            method: method.to_string(),
            uri: uri.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// Path without the query string
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `/app/stream.<ext>` -> `app`, `stream`; anything else is `None`
    pub fn stream_identity(&self, ext: &str) -> Option<StreamIdentity> {
        if self.method != "GET" {
            return None;
        }
        let parts: Vec<&str> = self.path().split('/').collect();
        let ["", app, file] = parts.as_slice() else {
            return None;
        };
        let (name, file_ext) = file.rsplit_once('.')?;
        if app.is_empty() || name.is_empty() || file_ext != ext {
            return None;
        }
        Some(StreamIdentity::new(*app, name))
    }
}

/// Read one request head, failing with `Timeout(ReadRequest)` when the
/// deadline passes first. A zero timeout waits forever.
pub async fn read_request<S>(stream: &mut S, timeout: Duration) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    let read = read_head(stream);
    if timeout.is_zero() {
        return read.await;
    }
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| Error::Timeout(TimeoutPhase::ReadRequest))?
}

async fn read_head<S>(stream: &mut S) -> Result<HttpRequest>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = find_head_end(&buf) {
            let head = std::str::from_utf8(&buf[..end])
                .map_err(|_| ProtocolError::MalformedHttp("request head is not utf-8".into()))?;
            return HttpRequest::parse(head);
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(ProtocolError::MalformedHttp("request head too large".into()).into());
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Resolves once the client closes its side of the connection. Bytes sent
/// after the request head are discarded.
///
/// Cancel safe: nothing read is kept between calls.
pub(crate) async fn client_closed<S>(stream: &mut S, scratch: &mut BytesMut) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    loop {
        scratch.clear();
        if stream.read_buf(scratch).await? == 0 {
            return Ok(());
        }
    }
}

pub async fn write_not_found<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(NOT_FOUND_RESPONSE).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let req = HttpRequest::parse("GET /live/cam1.ts?t=1 HTTP/1.1\r\nHost: example\r\nUser-Agent: vlc").unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path(), "/live/cam1.ts");
        assert_eq!(req.header("host"), Some("example"));
        assert_eq!(req.stream_identity("ts"), Some(StreamIdentity::new("live", "cam1")));
        assert_eq!(req.stream_identity("flv"), None);
    }

    #[test]
    fn test_stream_path_must_have_three_segments() {
        for uri in ["/cam1.ts", "/a/b/cam1.ts", "/live/.ts", "//cam1.ts", "/live/cam1"] {
            let req = HttpRequest::parse(&format!("GET {} HTTP/1.1", uri)).unwrap();
            assert_eq!(req.stream_identity("ts"), None, "{}", uri);
        }
        let post = HttpRequest::parse("POST /live/cam1.ts HTTP/1.1").unwrap();
        assert_eq!(post.stream_identity("ts"), None);
    }

    #[test]
    fn test_dotted_stream_name() {
        let req = HttpRequest::parse("GET /live/cam.1.flv HTTP/1.1").unwrap();
        assert_eq!(req.stream_identity("flv"), Some(StreamIdentity::new("live", "cam.1")));
        assert_eq!(req.stream_identity("ts"), None);
    }

    #[tokio::test]
    async fn test_client_closed() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"stray bytes").await.unwrap();
        drop(client);
        let mut scratch = BytesMut::with_capacity(16);
        client_closed(&mut server, &mut scratch).await.unwrap();
    }

    #[test]
    fn test_malformed_request_line() {
        assert!(HttpRequest::parse("GET /only-two").is_err());
    }

    #[tokio::test]
    async fn test_read_request() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET /live/cam1.flv HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let req = read_request(&mut server, Duration::from_secs(1)).await.unwrap();
        assert_eq!(req.path(), "/live/cam1.flv");
    }

    #[tokio::test]
    async fn test_read_request_timeout() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let err = read_request(&mut server, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutPhase::ReadRequest)));
    }

    #[tokio::test]
    async fn test_head_split_across_reads() {
        let mut mock = tokio_test::io::Builder::new()
            .read(b"GET /live/ca")
            .read(b"m1.ts HTTP/1.1\r\n")
            .read(b"\r\n")
            .write(NOT_FOUND_RESPONSE)
            .build();
        let req = read_request(&mut mock, Duration::ZERO).await.unwrap();
        assert_eq!(req.stream_identity("ts"), Some(StreamIdentity::new("live", "cam1")));
        write_not_found(&mut mock).await.unwrap();
    }
}
