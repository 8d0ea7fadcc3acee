//! Role interfaces between sessions and hubs

use std::sync::Arc;

use bytes::Bytes;

use super::group::Hub;
use super::subscriber::SubscriberProtocol;
use crate::error::{HubError, Result};
use crate::media::{AvPacket, CodecConfig};
use crate::rtp::RtpObserver;

/// Where a publisher's media comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherKind {
    /// RTMP or RTSP ingest from a client of this server
    Local,
    /// Pulled from another server on demand
    RelayPull,
}

/// Sink for what a publisher produces
pub trait PublisherObserver: Send {
    fn on_av_config(&mut self, config: &CodecConfig) -> Result<()>;

    fn on_av_packet(&mut self, pkt: AvPacket) -> Result<()>;

    fn on_metadata(&mut self, metadata: Bytes) -> Result<()>;
}

/// Hub membership changes, used to start and stop relay legs
#[allow(unused_variables)]
pub trait SubscriberLifecycleObserver: Send + Sync {
    fn on_publisher_attached(&self, hub: &Arc<Hub>, kind: PublisherKind) {}

    fn on_publisher_detached(&self, hub: &Arc<Hub>) {}

    fn on_subscriber_attached(&self, hub: &Arc<Hub>, subscriber_id: u64, protocol: SubscriberProtocol) {}

    fn on_subscriber_detached(&self, hub: &Arc<Hub>, subscriber_id: u64) {}
}

/// Publisher handle bound to one hub; dropping it detaches the publisher
pub struct HubPublisher {
    hub: Arc<Hub>,
    session_id: u64,
    error: Option<HubError>,
}

impl HubPublisher {
    pub(super) fn new(hub: Arc<Hub>, session_id: u64) -> Self {
        Self {
            hub,
            session_id,
            error: None,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// First error hit through the infallible [`RtpObserver`] path
    pub fn take_error(&mut self) -> Option<HubError> {
        self.error.take()
    }

    pub fn detach(&self) {
        self.hub.detach_publisher(self.session_id);
    }
}

impl PublisherObserver for HubPublisher {
    fn on_av_config(&mut self, config: &CodecConfig) -> Result<()> {
        Ok(self.hub.publish_config(self.session_id, config)?)
    }

    fn on_av_packet(&mut self, pkt: AvPacket) -> Result<()> {
        Ok(self.hub.publish_packet(self.session_id, pkt)?)
    }

    fn on_metadata(&mut self, metadata: Bytes) -> Result<()> {
        Ok(self.hub.publish_metadata(self.session_id, metadata)?)
    }
}

impl RtpObserver for HubPublisher {
    fn on_av_config(&mut self, config: &CodecConfig) {
        if let Err(e) = self.hub.publish_config(self.session_id, config) {
            self.error.get_or_insert(e);
        }
    }

    fn on_av_packet(&mut self, pkt: AvPacket) {
        if let Err(e) = self.hub.publish_packet(self.session_id, pkt) {
            self.error.get_or_insert(e);
        }
    }
}

impl std::fmt::Debug for HubPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubPublisher")
            .field("stream", self.hub.identity())
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Drop for HubPublisher {
    fn drop(&mut self) {
        self.detach();
    }
}
