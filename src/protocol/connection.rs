//! Message-level RTMP transport
//!
//! Wraps a byte stream with a chunk decoder/encoder pair and handles the
//! protocol control messages that only affect this connection (chunk size,
//! abort, window acknowledgement, ping). Everything else is returned to the
//! session that owns the connection.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::chunk::{ChunkDecoder, ChunkEncoder, MessageHeader};
use crate::protocol::message::{RtmpMessage, UserControlEvent};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// An application-level message plus the header it arrived with
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub header: MessageHeader,
    pub message: RtmpMessage,
}

pub struct RtmpConnection<S> {
    stream: S,
    read_buf: BytesMut,
    decoder: ChunkDecoder,
    encoder: ChunkEncoder,
    pending: std::collections::VecDeque<InboundMessage>,
    /// Encoded control replies not yet written
    control_out: BytesMut,
    /// Window announced by the peer; we acknowledge every time it fills
    peer_window_ack_size: u32,
    bytes_received: u64,
    last_ack: u64,
    ping_response: Option<u32>,
}

impl<S> RtmpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            decoder: ChunkDecoder::new(),
            encoder: ChunkEncoder::new(),
            pending: std::collections::VecDeque::new(),
            control_out: BytesMut::new(),
            peer_window_ack_size: 0,
            bytes_received: 0,
            last_ack: 0,
            ping_response: None,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn in_chunk_size(&self) -> u32 {
        self.decoder.chunk_size()
    }

    pub fn out_chunk_size(&self) -> u32 {
        self.encoder.chunk_size()
    }

    /// Timestamp of the last PingResponse the peer sent
    pub fn last_ping_response(&self) -> Option<u32> {
        self.ping_response
    }

    /// Read the next message that the session has to act on, writing any
    /// control replies (Acknowledgement, PingResponse) as they come up.
    ///
    /// Returns `Error::ConnectionClosed` on a clean EOF.
    pub async fn read_message(&mut self) -> Result<InboundMessage> {
        loop {
            let next = self.next_message().await;
            self.write_control().await?;
            if let Some(msg) = next? {
                return Ok(msg);
            }
        }
    }

    /// Cancel safe variant of [`read_message`](Self::read_message) for use
    /// in `select!`.
    ///
    /// Never writes. Control replies are queued and `Ok(None)` is returned
    /// as soon as one is waiting; the caller writes them with
    /// [`write_control`](Self::write_control) (or any later `send`).
    pub async fn next_message(&mut self) -> Result<Option<InboundMessage>> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(Some(msg));
            }

            for raw in self.decoder.decode_all(&mut self.read_buf)? {
                let message = RtmpMessage::parse(&raw)?;
                if let Some(message) = self.handle_control(message)? {
                    self.pending.push_back(InboundMessage {
                        header: raw.header,
                        message,
                    });
                }
            }
            if !self.pending.is_empty() {
                continue;
            }
            if !self.control_out.is_empty() {
                return Ok(None);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.bytes_received += n as u64;
            self.maybe_acknowledge();
        }
    }

    /// Write queued control replies, if any
    pub async fn write_control(&mut self) -> Result<()> {
        if self.control_out.is_empty() {
            return Ok(());
        }
        let control = self.control_out.split();
        self.stream.write_all(&control).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Apply connection-local control messages; returns the rest
    fn handle_control(&mut self, message: RtmpMessage) -> Result<Option<RtmpMessage>> {
        match message {
            RtmpMessage::SetChunkSize(size) => {
                tracing::debug!(chunk_size = size, "Peer set chunk size");
                self.decoder.set_chunk_size(size)?;
                Ok(None)
            }
            RtmpMessage::Abort(csid) => {
                self.decoder.abort(csid);
                Ok(None)
            }
            RtmpMessage::WindowAckSize(size) => {
                self.peer_window_ack_size = size;
                Ok(None)
            }
            RtmpMessage::UserControl(UserControlEvent::PingRequest(t)) => {
                self.queue_control(&RtmpMessage::UserControl(UserControlEvent::PingResponse(t)));
                Ok(None)
            }
            RtmpMessage::UserControl(UserControlEvent::PingResponse(t)) => {
                self.ping_response = Some(t);
                Ok(None)
            }
            RtmpMessage::Acknowledgement(_)
            | RtmpMessage::SetPeerBandwidth { .. }
            | RtmpMessage::UserControl(_) => {
                tracing::trace!(?message, "Control message");
                Ok(None)
            }
            other => Ok(Some(other)),
        }
    }

    fn maybe_acknowledge(&mut self) {
        let window = self.peer_window_ack_size as u64;
        if window > 0 && self.bytes_received - self.last_ack >= window {
            self.last_ack = self.bytes_received;
            let seq = self.bytes_received as u32;
            self.queue_control(&RtmpMessage::Acknowledgement(seq));
        }
    }

    /// Encode now so chunk header state stays in write order
    fn queue_control(&mut self, message: &RtmpMessage) {
        let payload = message.encode_payload();
        let bytes = self.encoder.encode(message.csid(), message.header(0, 0), &payload);
        self.control_out.extend_from_slice(&bytes);
    }

    /// Chunk and write one message
    pub async fn send(&mut self, message: &RtmpMessage, timestamp: u32, stream_id: u32) -> Result<()> {
        let payload = message.encode_payload();
        let bytes = self
            .encoder
            .encode(message.csid(), message.header(timestamp, stream_id), &payload);
        if !self.control_out.is_empty() {
            let control = self.control_out.split();
            self.stream.write_all(&control).await?;
        }
        self.stream.write_all(&bytes).await?;
        Ok(())
    }

    /// Announce and switch to a new outgoing chunk size
    pub async fn set_out_chunk_size(&mut self, size: u32) -> Result<()> {
        self.send(&RtmpMessage::SetChunkSize(size), 0, 0).await?;
        self.encoder.set_chunk_size(size)
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::message::Command;

    #[tokio::test]
    async fn test_control_messages_are_consumed() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut writer = RtmpConnection::new(a);
        let mut reader = RtmpConnection::new(b);

        writer.set_out_chunk_size(4096).await.unwrap();
        writer.send(&RtmpMessage::WindowAckSize(5_000_000), 0, 0).await.unwrap();
        writer
            .send(&RtmpMessage::Video(vec![0x17u8; 6000].into()), 40, 1)
            .await
            .unwrap();

        let msg = reader.read_message().await.unwrap();
        assert_eq!(reader.in_chunk_size(), 4096);
        assert_eq!(msg.header.timestamp, 40);
        assert_eq!(msg.header.stream_id, 1);
        match msg.message {
            RtmpMessage::Video(data) => assert_eq!(data.len(), 6000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut client = RtmpConnection::new(a);
        let mut server = RtmpConnection::new(b);

        server
            .send(&RtmpMessage::UserControl(UserControlEvent::PingRequest(77)), 0, 0)
            .await
            .unwrap();
        server
            .send(&RtmpMessage::Command(Command::on_status("status", "x", "y")), 0, 1)
            .await
            .unwrap();

        // client consumes the ping, answers it, and surfaces the command
        let msg = client.read_message().await.unwrap();
        assert!(matches!(msg.message, RtmpMessage::Command(_)));

        client
            .send(&RtmpMessage::Command(Command::on_status("status", "z", "w")), 0, 1)
            .await
            .unwrap();
        // server sees only the command; the ping response is a control message
        let msg = server.read_message().await.unwrap();
        assert!(matches!(msg.message, RtmpMessage::Command(_)));
        assert_eq!(server.last_ping_response(), Some(77));
    }

    #[tokio::test]
    async fn test_next_message_defers_control_replies() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut peer = RtmpConnection::new(a);
        let mut conn = RtmpConnection::new(b);

        peer.send(&RtmpMessage::UserControl(UserControlEvent::PingRequest(5)), 0, 0)
            .await
            .unwrap();
        assert!(conn.next_message().await.unwrap().is_none());

        // the pong is only queued until write_control
        let mut buf = [0u8; 64];
        let idle = tokio::time::timeout(Duration::from_millis(50), peer.get_mut().read(&mut buf)).await;
        assert!(idle.is_err());

        conn.write_control().await.unwrap();
        let n = peer.get_mut().read(&mut buf).await.unwrap();
        assert!(n > 0);
    }

    #[tokio::test]
    async fn test_next_message_survives_cancellation() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut peer = RtmpConnection::new(a);
        let mut conn = RtmpConnection::new(b);

        for _ in 0..3 {
            let waited = tokio::time::timeout(Duration::from_millis(10), conn.next_message()).await;
            assert!(waited.is_err());
        }

        peer.send(&RtmpMessage::Command(Command::on_status("status", "a", "b")), 0, 1)
            .await
            .unwrap();
        peer.send(&RtmpMessage::Command(Command::on_status("status", "c", "d")), 0, 1)
            .await
            .unwrap();

        let first = conn.next_message().await.unwrap().unwrap();
        assert!(matches!(first.message, RtmpMessage::Command(_)));
        let second = tokio::time::timeout(Duration::from_secs(1), conn.next_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(second.message, RtmpMessage::Command(_)));
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let mut conn = RtmpConnection::new(b);
        assert!(matches!(conn.read_message().await, Err(Error::ConnectionClosed)));
    }
}
