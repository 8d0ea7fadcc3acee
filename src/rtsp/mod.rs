//! RTSP ingest and pull
//!
//! Only TCP interleaved transport is carried: RTP and RTCP ride on the RTSP
//! connection as `$`-framed packets.

pub mod message;
pub mod pub_session;
pub mod pull_session;

pub use message::{RtspConnection, RtspItem, RtspRequest, RtspResponse, Transport};
pub use pub_session::RtspPubSession;
pub use pull_session::RtspPullSession;
