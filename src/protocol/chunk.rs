//! RTMP chunk stream framing
//!
//! ```text
//! basic header     fmt(2) | csid(6)      csid 0 => 64 + next byte
//!                                        csid 1 => 64 + next two bytes (LE)
//! message header   fmt0: ts(3) len(3) type(1) stream id(4, LE)
//!                  fmt1: delta(3) len(3) type(1)
//!                  fmt2: delta(3)
//!                  fmt3: -
//! extended ts      4 bytes when the 3-byte field is 0xFFFFFF
//! ```
//!
//! Each chunk stream id remembers the last header it carried so compact
//! headers can inherit the omitted fields. That state belongs to exactly one
//! connection direction and is never shared.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::protocol::constants::{
    DEFAULT_CHUNK_SIZE, EXTENDED_TIMESTAMP, MAX_CHUNK_SIZE, MAX_MESSAGE_SIZE,
};

/// Fields of a complete message header after inheritance is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    /// Absolute timestamp in milliseconds
    pub timestamp: u32,
    pub length: u32,
    pub type_id: u8,
    pub stream_id: u32,
}

/// A fully reassembled message
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub csid: u32,
    pub header: MessageHeader,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct ChunkStreamState {
    header: MessageHeader,
    /// Delta applied when a fmt3 chunk starts a new message
    delta: u32,
    /// Whether the last header on this chunk stream used an extended timestamp
    extended: bool,
    payload: BytesMut,
    /// Bytes still expected for the message in progress
    remaining: u32,
}

/// Parsed chunk header, not yet committed to the chunk stream state
struct ParsedChunk {
    header_len: usize,
    csid: u32,
    fmt: u8,
    timestamp_field: Option<u32>,
    length: Option<u32>,
    type_id: Option<u8>,
    stream_id: Option<u32>,
}

/// Reassembles messages from incoming chunks
pub struct ChunkDecoder {
    chunk_size: u32,
    max_message_size: u32,
    streams: HashMap<u32, ChunkStreamState>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            streams: HashMap::new(),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Apply a peer's Set Chunk Size
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Apply a peer's Abort: drop the partial message on `csid`
    pub fn abort(&mut self, csid: u32) {
        if let Some(state) = self.streams.get_mut(&csid) {
            state.payload.clear();
            state.remaining = 0;
        }
    }

    /// Consume at most one chunk from `buf`.
    ///
    /// Returns `Ok(Some(_))` when that chunk completed a message, `Ok(None)`
    /// when more bytes are needed or the message is still partial. Bytes are
    /// only consumed once the whole chunk is available. Call repeatedly
    /// until it returns `None` with no progress (see [`decode_all`]).
    ///
    /// [`decode_all`]: Self::decode_all
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RawMessage>> {
        let parsed = match self.parse_header(buf)? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };

        let state = self.streams.entry(parsed.csid).or_default();
        let continuing = state.remaining > 0;

        if continuing && parsed.fmt != 3 {
            tracing::debug!(
                csid = parsed.csid,
                dropped = state.payload.len(),
                "New chunk header interrupts partial message"
            );
        }

        let starts_message = !(continuing && parsed.fmt == 3);
        let length = if starts_message {
            parsed.length.unwrap_or(state.header.length)
        } else {
            state.header.length
        };

        if length > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge(length).into());
        }

        let remaining = if starts_message { length } else { state.remaining };
        let payload_len = remaining.min(self.chunk_size) as usize;
        if buf.len() < parsed.header_len + payload_len {
            return Ok(None);
        }

        buf.advance(parsed.header_len);
        let data = buf.split_to(payload_len);

        if starts_message {
            match parsed.fmt {
                0 => {
                    let ts = parsed.timestamp_field.unwrap_or(0);
                    state.header.timestamp = ts;
                    state.delta = ts;
                }
                1 | 2 => {
                    let delta = parsed.timestamp_field.unwrap_or(0);
                    state.header.timestamp = state.header.timestamp.wrapping_add(delta);
                    state.delta = delta;
                }
                _ => {
                    state.header.timestamp = state.header.timestamp.wrapping_add(state.delta);
                }
            }
            if let Some(field) = parsed.timestamp_field {
                state.extended = field >= EXTENDED_TIMESTAMP;
            }
            state.header.length = length;
            if let Some(type_id) = parsed.type_id {
                state.header.type_id = type_id;
            }
            if let Some(stream_id) = parsed.stream_id {
                state.header.stream_id = stream_id;
            }
            state.payload.clear();
            state.payload.reserve(length as usize);
            state.remaining = length;
        }

        state.payload.extend_from_slice(&data);
        state.remaining -= payload_len as u32;

        if state.remaining > 0 {
            return Ok(None);
        }

        Ok(Some(RawMessage {
            csid: parsed.csid,
            header: state.header,
            payload: state.payload.split().freeze(),
        }))
    }

    /// Drain every message that can be completed from `buf`
    pub fn decode_all(&mut self, buf: &mut BytesMut) -> Result<Vec<RawMessage>> {
        let mut messages = Vec::new();
        loop {
            let before = buf.len();
            let message = self.decode(buf)?;
            let progressed = buf.len() != before;
            if let Some(message) = message {
                messages.push(message);
            } else if !progressed {
                return Ok(messages);
            }
        }
    }

    /// Parse the basic + message header without touching `buf` or state
    fn parse_header(&self, buf: &BytesMut) -> Result<Option<ParsedChunk>> {
        let mut cursor = &buf[..];
        if cursor.is_empty() {
            return Ok(None);
        }

        let first = cursor.get_u8();
        let fmt = first >> 6;
        let csid = match first & 0x3F {
            0 => {
                if cursor.is_empty() {
                    return Ok(None);
                }
                64 + cursor.get_u8() as u32
            }
            1 => {
                if cursor.len() < 2 {
                    return Ok(None);
                }
                64 + cursor.get_u16_le() as u32
            }
            id => id as u32,
        };

        let state = self.streams.get(&csid);
        if fmt != 0 && state.is_none() {
            return Err(ProtocolError::UnknownChunkStream(csid).into());
        }

        let needed = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        };
        if cursor.len() < needed {
            return Ok(None);
        }

        let mut parsed = ParsedChunk {
            header_len: 0,
            csid,
            fmt,
            timestamp_field: None,
            length: None,
            type_id: None,
            stream_id: None,
        };

        if fmt <= 2 {
            parsed.timestamp_field = Some(read_u24(&mut cursor));
        }
        if fmt <= 1 {
            parsed.length = Some(read_u24(&mut cursor));
            parsed.type_id = Some(cursor.get_u8());
        }
        if fmt == 0 {
            parsed.stream_id = Some(cursor.get_u32_le());
        }

        let has_extended = match parsed.timestamp_field {
            Some(field) => field == EXTENDED_TIMESTAMP,
            None => state.map(|s| s.extended).unwrap_or(false),
        };
        if has_extended {
            if cursor.len() < 4 {
                return Ok(None);
            }
            let extended = cursor.get_u32();
            if parsed.timestamp_field.is_some() {
                parsed.timestamp_field = Some(extended);
            }
        }

        parsed.header_len = buf.len() - cursor.len();
        Ok(Some(parsed))
    }
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct EncoderStreamState {
    header: MessageHeader,
    delta: u32,
    extended: bool,
}

/// Splits messages into chunks, picking the most compact header format
pub struct ChunkEncoder {
    chunk_size: u32,
    streams: HashMap<u32, EncoderStreamState>,
    buf: BytesMut,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
            buf: BytesMut::with_capacity(64 * 1024),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Change the outgoing chunk size; the peer must be told via Set Chunk Size
    pub fn set_chunk_size(&mut self, size: u32) -> Result<()> {
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(ProtocolError::InvalidChunkSize(size).into());
        }
        self.chunk_size = size;
        Ok(())
    }

    /// Chunk one message. `header.length` is taken from `payload`.
    pub fn encode(&mut self, csid: u32, header: MessageHeader, payload: &[u8]) -> Bytes {
        let header = MessageHeader {
            length: payload.len() as u32,
            ..header
        };

        let (fmt, field) = match self.streams.get(&csid) {
            Some(prev)
                if prev.header.stream_id == header.stream_id
                    && header.timestamp >= prev.header.timestamp =>
            {
                let delta = header.timestamp - prev.header.timestamp;
                if header.length != prev.header.length || header.type_id != prev.header.type_id {
                    (1, delta)
                } else if delta != prev.delta {
                    (2, delta)
                } else {
                    (3, delta)
                }
            }
            _ => (0, header.timestamp),
        };

        let extended = field >= EXTENDED_TIMESTAMP;
        let wire_field = field.min(EXTENDED_TIMESTAMP);

        write_basic_header(&mut self.buf, fmt, csid);
        if fmt <= 2 {
            write_u24(&mut self.buf, wire_field);
        }
        if fmt <= 1 {
            write_u24(&mut self.buf, header.length);
            self.buf.put_u8(header.type_id);
        }
        if fmt == 0 {
            self.buf.put_u32_le(header.stream_id);
        }
        if extended {
            self.buf.put_u32(field);
        }

        let chunk_size = self.chunk_size as usize;
        let mut chunks = payload.chunks(chunk_size.max(1));
        if let Some(first) = chunks.next() {
            self.buf.put_slice(first);
        }
        for chunk in chunks {
            write_basic_header(&mut self.buf, 3, csid);
            if extended {
                self.buf.put_u32(field);
            }
            self.buf.put_slice(chunk);
        }

        self.streams.insert(
            csid,
            EncoderStreamState {
                header,
                delta: field,
                extended,
            },
        );

        self.buf.split().freeze()
    }

    /// True if the last message on `csid` used an extended timestamp
    pub fn is_extended(&self, csid: u32) -> bool {
        self.streams.get(&csid).map(|s| s.extended).unwrap_or(false)
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    match csid {
        0..=63 => buf.put_u8((fmt << 6) | csid as u8),
        64..=319 => {
            buf.put_u8(fmt << 6);
            buf.put_u8((csid - 64) as u8);
        }
        _ => {
            buf.put_u8((fmt << 6) | 1);
            buf.put_u16_le((csid - 64) as u16);
        }
    }
}

fn read_u24(cursor: &mut &[u8]) -> u32 {
    let b = [cursor.get_u8(), cursor.get_u8(), cursor.get_u8()];
    u32::from_be_bytes([0, b[0], b[1], b[2]])
}

fn write_u24(buf: &mut BytesMut, v: u32) {
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn header(timestamp: u32, type_id: u8) -> MessageHeader {
        MessageHeader {
            timestamp,
            length: 0,
            type_id,
            stream_id: 1,
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn roundtrip(chunk_size: u32, messages: &[(u32, MessageHeader, Vec<u8>)]) -> Vec<RawMessage> {
        let mut encoder = ChunkEncoder::new();
        encoder.set_chunk_size(chunk_size).unwrap();
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(chunk_size).unwrap();

        let mut wire = BytesMut::new();
        for (csid, h, p) in messages {
            wire.extend_from_slice(&encoder.encode(*csid, *h, p));
        }
        let out = decoder.decode_all(&mut wire).unwrap();
        assert!(wire.is_empty());
        out
    }

    #[test]
    fn test_reassembly_independent_of_chunk_size() {
        let body = payload(200_000);
        for size in [128, 4096, 65536] {
            let out = roundtrip(size, &[(6, header(40, 9), body.clone())]);
            assert_eq!(out.len(), 1);
            assert_eq!(&out[0].payload[..], &body[..]);
            assert_eq!(out[0].header.length, body.len() as u32);
            assert_eq!(out[0].header.timestamp, 40);
        }
    }

    #[test]
    fn test_byte_at_a_time_feed() {
        let mut encoder = ChunkEncoder::new();
        let body = payload(500);
        let wire = encoder.encode(4, header(10, 8), &body);

        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in wire.iter() {
            buf.put_u8(*byte);
            out.extend(decoder.decode_all(&mut buf).unwrap());
        }
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].payload[..], &body[..]);
    }

    #[test]
    fn test_header_compaction_formats() {
        let mut encoder = ChunkEncoder::new();
        let first = encoder.encode(6, header(0, 9), &[1, 2, 3]);
        assert_eq!(first[0] >> 6, 0);

        // same length/type, new delta => fmt2
        let second = encoder.encode(6, header(33, 9), &[4, 5, 6]);
        assert_eq!(second[0] >> 6, 2);
        assert_eq!(second.len(), 1 + 3 + 3);

        // same length/type/delta => fmt3
        let third = encoder.encode(6, header(66, 9), &[7, 8, 9]);
        assert_eq!(third[0] >> 6, 3);
        assert_eq!(third.len(), 1 + 3);

        // new length => fmt1
        let fourth = encoder.encode(6, header(99, 9), &[1, 2]);
        assert_eq!(fourth[0] >> 6, 1);

        // backwards timestamp => fmt0
        let fifth = encoder.encode(6, header(10, 9), &[1, 2]);
        assert_eq!(fifth[0] >> 6, 0);

        let mut wire = BytesMut::new();
        for part in [first, second, third, fourth, fifth] {
            wire.extend_from_slice(&part);
        }
        let out = ChunkDecoder::new().decode_all(&mut wire).unwrap();
        let stamps: Vec<u32> = out.iter().map(|m| m.header.timestamp).collect();
        assert_eq!(stamps, vec![0, 33, 66, 99, 10]);
        assert_eq!(&out[2].payload[..], &[7, 8, 9]);
    }

    #[test]
    fn test_extended_timestamp() {
        let big = 0x0100_0000 + 5;
        let body = payload(300);
        let out = roundtrip(128, &[(4, header(big, 8), body.clone())]);
        assert_eq!(out[0].header.timestamp, big);
        assert_eq!(&out[0].payload[..], &body[..]);

        let mut encoder = ChunkEncoder::new();
        let wire = encoder.encode(4, header(big, 8), &[0u8; 10]);
        assert!(encoder.is_extended(4));
        assert_eq!(&wire[1..4], &[0xFF, 0xFF, 0xFF]);
        assert_eq!(&wire[12..16], &big.to_be_bytes());
    }

    #[test]
    fn test_interleaved_chunk_streams() {
        let mut encoder = ChunkEncoder::new();
        let video = payload(300);
        let audio = payload(200);
        let v = encoder.encode(6, header(0, 9), &video);
        let a = encoder.encode(4, header(0, 8), &audio);

        // split each message after its first chunk and interleave
        let v_first = 12 + 128;
        let a_first = 12 + 128;
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&v[..v_first]);
        wire.extend_from_slice(&a[..a_first]);
        wire.extend_from_slice(&v[v_first..]);
        wire.extend_from_slice(&a[a_first..]);

        let out = ChunkDecoder::new().decode_all(&mut wire).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].csid, 6);
        assert_eq!(&out[0].payload[..], &video[..]);
        assert_eq!(out[1].csid, 4);
        assert_eq!(&out[1].payload[..], &audio[..]);
    }

    #[test]
    fn test_large_chunk_stream_ids() {
        let out = roundtrip(
            128,
            &[
                (70, header(1, 20), vec![1, 2, 3]),
                (1000, header(2, 20), vec![4, 5]),
            ],
        );
        assert_eq!(out[0].csid, 70);
        assert_eq!(out[1].csid, 1000);
    }

    #[test]
    fn test_compact_header_on_unknown_stream_fails() {
        let mut buf = BytesMut::from(&[0x43u8, 0, 0, 0][..]);
        let result = ChunkDecoder::new().decode(&mut buf);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::UnknownChunkStream(3)))
        ));
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x03);
        write_u24(&mut buf, 0);
        write_u24(&mut buf, MAX_MESSAGE_SIZE + 1);
        buf.put_u8(9);
        buf.put_u32_le(1);
        let result = ChunkDecoder::new().decode(&mut buf);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::MessageTooLarge(_)))
        ));
    }

    #[test]
    fn test_abort_discards_partial() {
        let mut encoder = ChunkEncoder::new();
        let wire = encoder.encode(6, header(0, 9), &payload(300));
        let mut decoder = ChunkDecoder::new();
        let mut buf = BytesMut::from(&wire[..12 + 128]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        decoder.abort(6);
        let next = encoder.encode(6, header(0, 9), &[9, 9]);
        let mut buf = BytesMut::from(&next[..]);
        let out = decoder.decode_all(&mut buf).unwrap();
        assert_eq!(&out[0].payload[..], &[9, 9]);
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.set_chunk_size(0).is_err());
        assert!(decoder.set_chunk_size(0x8000_0000).is_err());
        assert!(decoder.set_chunk_size(4096).is_ok());
        assert_eq!(decoder.chunk_size(), 4096);
    }
}
