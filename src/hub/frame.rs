//! Stream identity and the frames a hub hands to its subscribers

use std::sync::Arc;

use bytes::Bytes;

use crate::media::{AvPacket, CodecConfig};

/// Unique key of a hub: application name plus stream name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentity {
    /// Application name (e.g., "live")
    pub app: String,
    /// Stream name (e.g., "cam1")
    pub name: String,
}

impl StreamIdentity {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app, self.name)
    }
}

/// One item in a subscriber's queue
///
/// Cheap to clone: payloads are reference counted and the codec config is
/// shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    /// AMF0-encoded `onMetaData` body
    Metadata(Bytes),
    /// Full codec config as currently known to the hub
    Config(Arc<CodecConfig>),
    Packet(AvPacket),
    /// The hub was torn down
    Closed,
}

impl HubFrame {
    pub fn is_closed(&self) -> bool {
        matches!(self, HubFrame::Closed)
    }
}
