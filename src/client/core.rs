//! Shared RTMP client state machine
//!
//! ```text
//! TCP connect -> handshake -> connect (txn 1) -> createStream (txn 2)
//!             -> play | publish -> wait onStatus NetStream.{Play,Publish}.Start
//! ```
//!
//! Pull and push sessions each hold one [`ClientSession`] and narrow what
//! can be done with it once the stream is up.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::config::{within, ClientSessionOptions, RtmpUrl};
use crate::amf::AmfValue;
use crate::error::{ProtocolError, Result, TimeoutPhase};
use crate::protocol::constants::*;
use crate::protocol::{client_handshake, Command, InboundMessage, RtmpConnection, RtmpMessage};
use crate::session::next_session_id;
use crate::stats::{CountingStream, SessionStat, StatDirection, StatSession};

const TRANSACTION_CONNECT: f64 = 1.0;
const TRANSACTION_CREATE_STREAM: f64 = 2.0;
const TRANSACTION_PLAY_PUBLISH: f64 = 3.0;

/// What the client does once its stream exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Pull,
    Push,
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRole::Pull => f.write_str("pull"),
            ClientRole::Push => f.write_str("push"),
        }
    }
}

pub struct ClientSession<S> {
    id: u64,
    role: ClientRole,
    url: RtmpUrl,
    conn: RtmpConnection<CountingStream<S>>,
    stat: SessionStat,
    options: ClientSessionOptions,
    stream_id: u32,
    disposed: bool,
}

impl ClientSession<TcpStream> {
    /// Connect to `url` and run the command exchange up to `onStatus`.
    ///
    /// The whole sequence, TCP connect included, runs under `do_timeout`.
    pub async fn connect(role: ClientRole, url: &str, options: ClientSessionOptions) -> Result<Self> {
        let url = RtmpUrl::parse(url)?;
        within(options.do_timeout, TimeoutPhase::Do, async move {
            let addr = url.addr();
            let stream = within(options.connect_timeout, TimeoutPhase::Connect, async {
                Ok(TcpStream::connect(&addr).await?)
            })
            .await?;
            let _ = stream.set_nodelay(true);
            let remote = stream.peer_addr().ok();

            let mut session = Self::new(role, stream, remote, url, options);
            session.negotiate().await?;
            Ok(session)
        })
        .await
    }
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        role: ClientRole,
        stream: S,
        remote_addr: Option<SocketAddr>,
        url: RtmpUrl,
        options: ClientSessionOptions,
    ) -> Self {
        let id = next_session_id();
        let (key, direction) = match role {
            ClientRole::Pull => (format!("RTMPPULL{}", id), StatDirection::Read),
            ClientRole::Push => (format!("RTMPPUSH{}", id), StatDirection::Write),
        };
        let stat = SessionStat::new("RTMP", key, remote_addr, direction);
        Self {
            id,
            role,
            url,
            conn: RtmpConnection::new(CountingStream::new(stream, stat.conn())),
            stat,
            options,
            stream_id: 0,
            disposed: false,
        }
    }

    /// Command exchange on an already connected stream, under `do_timeout`
    pub async fn start(&mut self) -> Result<()> {
        let limit = self.options.do_timeout;
        within(limit, TimeoutPhase::Do, self.negotiate()).await
    }

    async fn negotiate(&mut self) -> Result<()> {
        client_handshake(self.conn.get_mut(), Duration::ZERO).await?;
        self.conn.set_out_chunk_size(RECOMMENDED_CHUNK_SIZE).await?;

        let object = crate::amf_object! {
            "app" => self.url.app.as_str(),
            "type" => "nonprivate",
            "flashVer" => "FMLE/3.0 (compatible; livehub)",
            "tcUrl" => self.url.tc_url(),
        };
        self.send_command(Command::new(CMD_CONNECT, TRANSACTION_CONNECT, object, Vec::new()), 0)
            .await?;
        self.wait_result(TRANSACTION_CONNECT).await?;

        let create = Command::new(CMD_CREATE_STREAM, TRANSACTION_CREATE_STREAM, AmfValue::Null, Vec::new());
        self.send_command(create, 0).await?;
        let reply = self.wait_result(TRANSACTION_CREATE_STREAM).await?;
        self.stream_id = reply
            .number_arg(0)
            .ok_or(ProtocolError::MalformedMessage("createStream result"))? as u32;

        let stream = AmfValue::from(self.url.stream.as_str());
        let (command, args, expected) = match self.role {
            ClientRole::Pull => (CMD_PLAY, vec![stream], NS_PLAY_START),
            ClientRole::Push => (CMD_PUBLISH, vec![stream, AmfValue::from("live")], NS_PUBLISH_START),
        };
        let cmd = Command::new(command, TRANSACTION_PLAY_PUBLISH, AmfValue::Null, args);
        self.send_command(cmd, self.stream_id).await?;
        self.wait_status(expected).await?;

        tracing::info!(
            session_id = self.id,
            role = %self.role,
            url = %self.url.tc_url(),
            stream = %self.url.stream,
            "RTMP client started"
        );
        Ok(())
    }

    async fn send_command(&mut self, cmd: Command, stream_id: u32) -> Result<()> {
        self.conn.send(&RtmpMessage::Command(cmd), 0, stream_id).await?;
        self.conn.flush().await
    }

    /// `_result` for `transaction_id`; `_error` fails the session
    async fn wait_result(&mut self, transaction_id: f64) -> Result<Command> {
        loop {
            let InboundMessage { message, .. } = self.conn.read_message().await?;
            let RtmpMessage::Command(cmd) = message else {
                continue;
            };
            if cmd.transaction_id != transaction_id {
                tracing::trace!(session_id = self.id, command = %cmd.name, "Skipping command");
                continue;
            }
            match cmd.name.as_str() {
                CMD_RESULT => return Ok(cmd),
                CMD_ERROR => return Err(ProtocolError::Rejected(status_code(&cmd)).into()),
                _ => {}
            }
        }
    }

    async fn wait_status(&mut self, expected: &str) -> Result<()> {
        loop {
            let InboundMessage { message, .. } = self.conn.read_message().await?;
            let RtmpMessage::Command(cmd) = message else {
                continue;
            };
            match cmd.name.as_str() {
                CMD_ON_STATUS => {
                    let code = status_code(&cmd);
                    let level = cmd.args.first().and_then(|info| info.get_string("level"));
                    if level == Some("error") {
                        return Err(ProtocolError::Rejected(code).into());
                    }
                    if code == expected {
                        return Ok(());
                    }
                    tracing::debug!(session_id = self.id, code = %code, "onStatus");
                }
                CMD_ERROR => return Err(ProtocolError::Rejected(status_code(&cmd)).into()),
                _ => {}
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn url(&self) -> &RtmpUrl {
        &self.url
    }

    pub fn options(&self) -> &ClientSessionOptions {
        &self.options
    }

    pub fn unique_key(&self) -> &str {
        self.stat.session_id()
    }

    pub(crate) async fn read_message(&mut self) -> Result<InboundMessage> {
        self.conn.read_message().await
    }

    /// Handle what the server already sent without waiting for more.
    ///
    /// Acknowledgements and ping responses go out; an error `onStatus` or
    /// `_error` fails the session, other messages are dropped.
    pub(crate) async fn drain_inbound(&mut self) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                next = self.conn.next_message() => next,
                _ = std::future::ready(()) => break,
            };
            self.conn.write_control().await?;
            let Some(InboundMessage { message, .. }) = next? else {
                continue;
            };
            let RtmpMessage::Command(cmd) = message else {
                continue;
            };
            match cmd.name.as_str() {
                CMD_ON_STATUS => {
                    let code = status_code(&cmd);
                    let level = cmd.args.first().and_then(|info| info.get_string("level"));
                    if level == Some("error") {
                        return Err(ProtocolError::Rejected(code).into());
                    }
                    tracing::debug!(session_id = self.id, code = %code, "onStatus");
                }
                CMD_ERROR => return Err(ProtocolError::Rejected(status_code(&cmd)).into()),
                _ => tracing::trace!(session_id = self.id, command = %cmd.name, "Ignoring command"),
            }
        }
        Ok(())
    }

    /// Queue a message on the client's stream; call `flush` to send
    pub(crate) async fn send(&mut self, message: &RtmpMessage, timestamp: u32) -> Result<()> {
        self.conn.send(message, timestamp, self.stream_id).await
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        self.conn.flush().await
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

    /// Close the connection; later calls do nothing
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.stream_id != 0 {
            let delete = Command::new(
                CMD_DELETE_STREAM,
                0.0,
                AmfValue::Null,
                vec![AmfValue::from(self.stream_id)],
            );
            let _ = self.send_command(delete, 0).await;
        }
        if let Err(e) = self.conn.shutdown().await {
            tracing::debug!(session_id = self.id, error = %e, "Shutdown failed");
        }
        tracing::info!(session_id = self.id, role = %self.role, key = %self.unique_key(), "RTMP client disposed");
    }
}

fn status_code(cmd: &Command) -> String {
    cmd.args
        .first()
        .and_then(|info| info.get_string("code"))
        .unwrap_or(cmd.name.as_str())
        .to_string()
}
