//! RTMP server session state machine
//!
//! ```text
//! Handshaking -> Connecting -> Creating -> Publishing
//!                                       \-> Playing
//! any phase -> Closed
//! ```
//!
//! Every command is checked against the current phase; a command that does
//! not fit (e.g. `publish` before `connect`, or a second `publish`) is a
//! protocol error and ends the session.

use std::fmt;

use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Handshake in progress
    Handshaking,
    /// Waiting for `connect`
    Connecting,
    /// Connected; `createStream` and then `publish` or `play` expected
    Creating,
    Publishing,
    Playing,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionPhase::Handshaking => "handshaking",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Creating => "creating",
            SessionPhase::Publishing => "publishing",
            SessionPhase::Playing => "playing",
            SessionPhase::Closed => "closed",
        })
    }
}

/// Per-connection command state
#[derive(Debug)]
pub struct SessionState {
    phase: SessionPhase,
    app: String,
    tc_url: Option<String>,
    /// Message stream handed out by `createStream`
    stream_id: Option<u32>,
    next_stream_id: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Handshaking,
            app: String::new(),
            tc_url: None,
            stream_id: None,
            // stream 0 is the NetConnection
            next_stream_id: 1,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn tc_url(&self) -> Option<&str> {
        self.tc_url.as_deref()
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    fn expect(&self, command: &str, phase: SessionPhase) -> Result<()> {
        if self.phase != phase {
            return Err(ProtocolError::UnexpectedCommand {
                command: command.to_string(),
                phase: self.phase.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn complete_handshake(&mut self) {
        if self.phase == SessionPhase::Handshaking {
            self.phase = SessionPhase::Connecting;
        }
    }

    pub fn on_connect(&mut self, app: &str, tc_url: Option<&str>) -> Result<()> {
        self.expect("connect", SessionPhase::Connecting)?;
        self.app = app.trim_matches('/').to_string();
        self.tc_url = tc_url.map(str::to_string);
        self.phase = SessionPhase::Creating;
        Ok(())
    }

    /// Allocate the message stream for `publish`/`play`
    pub fn on_create_stream(&mut self) -> Result<u32> {
        self.expect("createStream", SessionPhase::Creating)?;
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        self.stream_id = Some(id);
        Ok(id)
    }

    pub fn on_publish(&mut self) -> Result<u32> {
        self.enter("publish", SessionPhase::Publishing)
    }

    pub fn on_play(&mut self) -> Result<u32> {
        self.enter("play", SessionPhase::Playing)
    }

    fn enter(&mut self, command: &str, phase: SessionPhase) -> Result<u32> {
        self.expect(command, SessionPhase::Creating)?;
        let Some(stream_id) = self.stream_id else {
            return Err(ProtocolError::UnexpectedCommand {
                command: command.to_string(),
                phase: "no stream created".to_string(),
            }
            .into());
        };
        self.phase = phase;
        Ok(stream_id)
    }

    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_publish_lifecycle() {
        let mut state = SessionState::new();
        assert_eq!(state.phase(), SessionPhase::Handshaking);

        state.complete_handshake();
        assert_eq!(state.phase(), SessionPhase::Connecting);

        state.on_connect("live/", Some("rtmp://h/live")).unwrap();
        assert_eq!(state.phase(), SessionPhase::Creating);
        assert_eq!(state.app(), "live");
        assert_eq!(state.tc_url(), Some("rtmp://h/live"));

        assert_eq!(state.on_create_stream().unwrap(), 1);
        assert_eq!(state.on_publish().unwrap(), 1);
        assert_eq!(state.phase(), SessionPhase::Publishing);

        state.close();
        assert!(state.is_closed());
    }

    #[test]
    fn test_publish_before_connect_fails() {
        let mut state = SessionState::new();
        state.complete_handshake();
        let err = state.on_publish().unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedCommand { ref command, .. }) if command == "publish"
        ));
    }

    #[test]
    fn test_duplicate_commands_fail() {
        let mut state = SessionState::new();
        state.complete_handshake();
        state.on_connect("live", None).unwrap();
        assert!(state.on_connect("live", None).is_err());

        state.on_create_stream().unwrap();
        state.on_play().unwrap();
        assert!(state.on_play().is_err());
        assert!(state.on_publish().is_err());
    }

    #[test]
    fn test_publish_needs_stream() {
        let mut state = SessionState::new();
        state.complete_handshake();
        state.on_connect("live", None).unwrap();
        assert!(state.on_publish().is_err());
        assert_eq!(state.phase(), SessionPhase::Creating);
    }

    #[test]
    fn test_create_stream_ids_increase() {
        let mut state = SessionState::new();
        state.complete_handshake();
        state.on_connect("live", None).unwrap();
        assert_eq!(state.on_create_stream().unwrap(), 1);
        assert_eq!(state.on_create_stream().unwrap(), 2);
        assert_eq!(state.stream_id(), Some(2));
    }
}
