//! Media model and container framing
//!
//! - [`AvPacket`]: the unit every ingest path produces and every output consumes
//! - [`CodecConfig`]: parameter sets and AudioSpecificConfig
//! - FLV bodies/tags for RTMP and HTTP-FLV, MPEG-TS for HTTP-TS
//! - [`GopCache`] for late joiners

pub mod aac;
pub mod codec;
pub mod flv;
pub mod gop;
pub mod nal;
pub mod packet;
pub mod ts;

pub use aac::AudioSpecificConfig;
pub use codec::CodecConfig;
pub use flv::{FlvMedia, FlvTag};
pub use gop::GopCache;
pub use packet::{AvPacket, PayloadType};
pub use ts::TsMuxer;
