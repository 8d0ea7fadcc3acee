//! Error types
//!
//! Every area (handshake, chunk stream, AMF, media framing, SDP, hub) has its
//! own error enum; they all fold into [`Error`] so session code can use `?`
//! end to end. A session that returns an error is disposed by its owner and
//! never reused.

use std::fmt;

use crate::hub::StreamIdentity;

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("amf error: {0}")]
    Amf(#[from] AmfError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("sdp error: {0}")]
    Sdp(#[from] SdpError),

    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    #[error("timeout during {0}")]
    Timeout(TimeoutPhase),

    /// Subscriber was dropped because its outbound queue was full
    #[error("subscriber dropped: outbound queue full")]
    BackpressureDrop,

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid url: {0}")]
    Url(String),

    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// True for errors that end a session but say nothing bad about the peer
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// The phase a deadline expired in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// TCP connect
    Connect,
    /// RTMP handshake
    Handshake,
    /// Whole client setup up to the play/publish answer
    Do,
    /// Waiting for the next audio/video message
    ReadAv,
    /// Waiting for an HTTP or RTSP request
    ReadRequest,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Handshake => "handshake",
            TimeoutPhase::Do => "session setup",
            TimeoutPhase::ReadAv => "av read",
            TimeoutPhase::ReadRequest => "request read",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported rtmp version {0}")]
    InvalidVersion(u8),

    #[error("handshake packet has wrong size")]
    InvalidSize,

    #[error("handshake in unexpected state")]
    InvalidState,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("chunk stream {0} continues without a prior header")]
    UnknownChunkStream(u32),

    #[error("message length {0} exceeds limit")]
    MessageTooLarge(u32),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u32),

    #[error("malformed {0} message")]
    MalformedMessage(&'static str),

    #[error("unexpected command {command} in phase {phase}")]
    UnexpectedCommand { command: String, phase: String },

    #[error("peer rejected request: {0}")]
    Rejected(String),

    #[error("malformed rtp packet: {0}")]
    MalformedRtp(&'static str),

    #[error("malformed rtsp message: {0}")]
    MalformedRtsp(String),

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("malformed http request: {0}")]
    MalformedHttp(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AmfError {
    #[error("unexpected end of amf data")]
    UnexpectedEof,

    #[error("unknown amf0 marker 0x{0:02x}")]
    UnknownMarker(u8),

    #[error("invalid utf-8 in amf string")]
    InvalidUtf8,

    #[error("invalid amf object end")]
    InvalidObjectEnd,

    #[error("invalid amf reference {0}")]
    InvalidReference(u16),

    #[error("amf nesting too deep")]
    NestingTooDeep,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MediaError {
    #[error("{0} too short")]
    Truncated(&'static str),

    #[error("unsupported audio format {0}")]
    UnsupportedAudio(u8),

    #[error("unsupported video codec {0}")]
    UnsupportedVideo(u8),

    #[error("invalid decoder configuration record")]
    InvalidConfigRecord,

    #[error("invalid audio specific config")]
    InvalidAudioConfig,

    #[error("codec config not yet known")]
    MissingConfig,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SdpError {
    #[error("malformed sdp line: {0}")]
    MalformedLine(String),

    #[error("missing fmtp parameter {0}")]
    MissingParameter(&'static str),

    #[error("invalid fmtp value for {0}")]
    InvalidParameter(&'static str),

    #[error("no fmtp for payload type {0}")]
    MissingFmtp(u8),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("stream {0} already has a publisher")]
    Conflict(StreamIdentity),

    #[error("stream {0} not found")]
    NotFound(StreamIdentity),

    #[error("publisher id mismatch on stream {0}")]
    PublisherMismatch(StreamIdentity),

    #[error("stream {0} is closed")]
    Closed(StreamIdentity),
}
