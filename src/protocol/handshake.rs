//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (version) + C1 (1536) ----->|
//!   |<------ S0 + S1 (1536) + S2 (echo C1) -|
//!   |------- C2 (echo S1) ----------------->|
//! ```
//!
//! Simple handshake only (no HMAC digest). The version byte must be 3 on
//! both sides; anything else fails the session. An echo (S2 or C2) whose
//! random bytes differ from what we sent is logged and tolerated, several
//! peers in the wild get it wrong.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, HandshakeError, Result, TimeoutPhase};
use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Initial,
    /// Waiting for C0C1 (server) or S0S1S2 (client)
    WaitingForPeerPacket,
    /// Server waiting for C2
    WaitingForPeerResponse,
    Done,
}

/// Sans-IO handshake state machine
#[derive(Debug)]
pub struct Handshake {
    role: HandshakeRole,
    state: HandshakeState,
    /// C1 or S1 as we sent it
    sent: Option<[u8; HANDSHAKE_SIZE]>,
    echo_matched: Option<bool>,
}

impl Handshake {
    pub fn new(role: HandshakeRole) -> Self {
        Self {
            role,
            state: HandshakeState::Initial,
            sent: None,
            echo_matched: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Whether the peer's echo carried our random bytes back, once received
    pub fn echo_matched(&self) -> Option<bool> {
        self.echo_matched
    }

    /// Bytes the peer must send before [`process`](Self::process) can advance
    pub fn bytes_needed(&self) -> usize {
        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => 1 + HANDSHAKE_SIZE,
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                1 + HANDSHAKE_SIZE * 2
            }
            (HandshakeState::WaitingForPeerResponse, _) => HANDSHAKE_SIZE,
            _ => 0,
        }
    }

    /// C0C1 for a client; a server sends nothing first
    pub fn generate_initial(&mut self) -> Option<Bytes> {
        if self.state != HandshakeState::Initial {
            return None;
        }
        self.state = HandshakeState::WaitingForPeerPacket;

        match self.role {
            HandshakeRole::Client => {
                let c1 = generate_packet();
                let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
                buf.put_u8(RTMP_VERSION);
                buf.put_slice(&c1);
                self.sent = Some(c1);
                Some(buf.freeze())
            }
            HandshakeRole::Server => None,
        }
    }

    /// Feed peer bytes; returns what must be written back, if anything.
    ///
    /// Returns `Ok(None)` without consuming when `data` is too short.
    pub fn process(&mut self, data: &mut Bytes) -> Result<Option<Bytes>> {
        let needed = self.bytes_needed();
        if needed == 0 {
            return Err(HandshakeError::InvalidState.into());
        }
        if data.remaining() < needed {
            return Ok(None);
        }

        match (self.state, self.role) {
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Server) => {
                check_version(data.get_u8())?;
                let c1 = take_packet(data);

                let s1 = generate_packet();

                let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
                response.put_u8(RTMP_VERSION);
                response.put_slice(&s1);
                response.put_slice(&generate_echo(&c1));

                self.sent = Some(s1);
                self.state = HandshakeState::WaitingForPeerResponse;
                Ok(Some(response.freeze()))
            }
            (HandshakeState::WaitingForPeerPacket, HandshakeRole::Client) => {
                check_version(data.get_u8())?;
                let s1 = take_packet(data);
                let s2 = take_packet(data);
                self.check_echo(&s2);

                self.state = HandshakeState::Done;
                Ok(Some(Bytes::copy_from_slice(&generate_echo(&s1))))
            }
            (HandshakeState::WaitingForPeerResponse, _) => {
                let c2 = take_packet(data);
                self.check_echo(&c2);
                self.state = HandshakeState::Done;
                Ok(None)
            }
            _ => Err(HandshakeError::InvalidState.into()),
        }
    }

    fn check_echo(&mut self, echo: &[u8; HANDSHAKE_SIZE]) {
        let Some(sent) = self.sent.as_ref() else {
            return;
        };
        // bytes 4..8 carry the peer's read time
        let matched = sent[..4] == echo[..4] && sent[8..] == echo[8..];
        if !matched {
            tracing::debug!(role = ?self.role, "Handshake echo does not match what we sent");
        }
        self.echo_matched = Some(matched);
    }
}

fn check_version(version: u8) -> Result<()> {
    if version != RTMP_VERSION {
        return Err(HandshakeError::InvalidVersion(version).into());
    }
    Ok(())
}

fn take_packet(data: &mut Bytes) -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    data.copy_to_slice(&mut packet);
    packet
}

fn now_millis() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// C1/S1: time(4) + zero(4) + random(1528)
fn generate_packet() -> [u8; HANDSHAKE_SIZE] {
    let mut packet = [0u8; HANDSHAKE_SIZE];
    packet[0..4].copy_from_slice(&now_millis().to_be_bytes());
    rand::thread_rng().fill_bytes(&mut packet[8..]);
    packet
}

/// C2/S2: the peer's packet with our read time in bytes 4..8
fn generate_echo(peer_packet: &[u8; HANDSHAKE_SIZE]) -> [u8; HANDSHAKE_SIZE] {
    let mut echo = *peer_packet;
    echo[4..8].copy_from_slice(&now_millis().to_be_bytes());
    echo
}

async fn drive<S>(stream: &mut S, mut handshake: Handshake) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(initial) = handshake.generate_initial() {
        stream.write_all(&initial).await?;
    }

    while !handshake.is_done() {
        let mut buf = vec![0u8; handshake.bytes_needed()];
        stream.read_exact(&mut buf).await?;
        let mut data = Bytes::from(buf);
        if let Some(response) = handshake.process(&mut data)? {
            stream.write_all(&response).await?;
        }
    }
    stream.flush().await?;
    Ok(())
}

/// Run the server side of the handshake, failing with
/// `Timeout(Handshake)` if it does not finish in time.
pub async fn server_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(timeout, drive(stream, Handshake::new(HandshakeRole::Server))).await
}

/// Client side counterpart of [`server_handshake`]
pub async fn client_handshake<S>(stream: &mut S, timeout: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(timeout, drive(stream, Handshake::new(HandshakeRole::Client))).await
}

async fn with_timeout<F>(timeout: Duration, fut: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::Timeout(TimeoutPhase::Handshake))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_server_handshake() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let mut c0c1 = client.generate_initial().unwrap();
        assert_eq!(c0c1.len(), 1 + HANDSHAKE_SIZE);
        assert!(server.generate_initial().is_none());

        let mut s0s1s2 = server.process(&mut c0c1).unwrap().unwrap();
        assert_eq!(s0s1s2.len(), 1 + HANDSHAKE_SIZE * 2);
        assert_eq!(s0s1s2[0], RTMP_VERSION);

        let mut c2 = client.process(&mut s0s1s2).unwrap().unwrap();
        assert_eq!(c2.len(), HANDSHAKE_SIZE);
        assert!(client.is_done());

        assert!(server.process(&mut c2).unwrap().is_none());
        assert!(server.is_done());
    }

    #[test]
    fn test_s2_echoes_c1_random() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let c0c1 = client.generate_initial().unwrap();
        server.generate_initial();
        let s0s1s2 = server.process(&mut c0c1.clone()).unwrap().unwrap();

        let c1 = &c0c1[1..];
        let s2 = &s0s1s2[1 + HANDSHAKE_SIZE..];
        assert_eq!(&s2[0..4], &c1[0..4]);
        assert_eq!(&s2[8..], &c1[8..]);
    }

    #[test]
    fn test_echo_checked_both_ways() {
        let mut client = Handshake::new(HandshakeRole::Client);
        let mut server = Handshake::new(HandshakeRole::Server);

        let mut c0c1 = client.generate_initial().unwrap();
        server.generate_initial();
        let mut s0s1s2 = server.process(&mut c0c1).unwrap().unwrap();
        let mut c2 = client.process(&mut s0s1s2).unwrap().unwrap();
        assert_eq!(client.echo_matched(), Some(true));

        server.process(&mut c2).unwrap();
        assert_eq!(server.echo_matched(), Some(true));
    }

    #[test]
    fn test_bad_echo_tolerated() {
        let mut client = Handshake::new(HandshakeRole::Client);
        client.generate_initial().unwrap();

        // S2 of zeros instead of C1
        let mut data = BytesMut::new();
        data.put_u8(RTMP_VERSION);
        data.put_slice(&[1u8; HANDSHAKE_SIZE]);
        data.put_slice(&[0u8; HANDSHAKE_SIZE]);
        let c2 = client.process(&mut data.freeze()).unwrap();
        assert!(c2.is_some());
        assert!(client.is_done());
        assert_eq!(client.echo_matched(), Some(false));

        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();
        let mut c0c1 = BytesMut::new();
        c0c1.put_u8(RTMP_VERSION);
        c0c1.put_slice(&[2u8; HANDSHAKE_SIZE]);
        server.process(&mut c0c1.freeze()).unwrap();
        server.process(&mut Bytes::from(vec![0u8; HANDSHAKE_SIZE])).unwrap();
        assert!(server.is_done());
        assert_eq!(server.echo_matched(), Some(false));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();

        let mut data = BytesMut::new();
        data.put_u8(6);
        data.put_slice(&[0u8; HANDSHAKE_SIZE]);
        let result = server.process(&mut data.freeze());
        assert!(matches!(
            result,
            Err(Error::Handshake(HandshakeError::InvalidVersion(6)))
        ));
    }

    #[test]
    fn test_partial_data_waits() {
        let mut server = Handshake::new(HandshakeRole::Server);
        server.generate_initial();
        let mut data = Bytes::from(vec![RTMP_VERSION; 100]);
        assert!(server.process(&mut data).unwrap().is_none());
        assert_eq!(data.len(), 100);
        assert!(!server.is_done());
    }

    #[tokio::test]
    async fn test_async_handshake_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(8192);
        let timeout = Duration::from_secs(5);

        let server = tokio::spawn(async move { server_handshake(&mut b, timeout).await });
        client_handshake(&mut a, timeout).await.unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (_a, mut b) = tokio::io::duplex(8192);
        let result = server_handshake(&mut b, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(Error::Timeout(TimeoutPhase::Handshake))));
    }
}
