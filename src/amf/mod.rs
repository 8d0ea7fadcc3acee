//! AMF0 encoding for RTMP command and data messages

pub mod amf0;
pub mod value;

pub use amf0::{decode_all, encode_all, Amf0Decoder, Amf0Encoder};
pub use value::{AmfValue, Properties};
