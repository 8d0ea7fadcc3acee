//! RTMP protocol engine
//!
//! - `handshake`: C0/C1/C2 exchange
//! - `chunk`: chunk header parsing/writing and message reassembly
//! - `message`: typed control, command and data messages
//! - `connection`: message-level transport over any async byte stream

pub mod chunk;
pub mod connection;
pub mod constants;
pub mod handshake;
pub mod message;

pub use chunk::{ChunkDecoder, ChunkEncoder, MessageHeader, RawMessage};
pub use connection::{InboundMessage, RtmpConnection};
pub use handshake::{client_handshake, server_handshake, Handshake, HandshakeRole};
pub use message::{Command, RtmpMessage, UserControlEvent};
