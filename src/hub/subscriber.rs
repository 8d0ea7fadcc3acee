//! Subscriber side of a hub

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::frame::HubFrame;
use super::group::Hub;
use crate::error::{Error, Result};

/// Output framing a subscriber wants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberProtocol {
    Rtmp,
    HttpFlv,
    HttpTs,
    RelayPush,
}

impl fmt::Display for SubscriberProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubscriberProtocol::Rtmp => "rtmp",
            SubscriberProtocol::HttpFlv => "httpflv",
            SubscriberProtocol::HttpTs => "httpts",
            SubscriberProtocol::RelayPush => "relay-push",
        })
    }
}

/// The hub's end of one subscriber queue
pub(super) struct SubscriberSlot {
    pub protocol: SubscriberProtocol,
    pub tx: mpsc::Sender<HubFrame>,
    pub dropped: Arc<AtomicBool>,
}

/// A live subscription; dropping it detaches from the hub
pub struct Subscription {
    id: u64,
    protocol: SubscriberProtocol,
    rx: mpsc::Receiver<HubFrame>,
    dropped: Arc<AtomicBool>,
    hub: Arc<Hub>,
}

impl Subscription {
    pub(super) fn new(
        id: u64,
        protocol: SubscriberProtocol,
        rx: mpsc::Receiver<HubFrame>,
        dropped: Arc<AtomicBool>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            id,
            protocol,
            rx,
            dropped,
            hub,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn protocol(&self) -> SubscriberProtocol {
        self.protocol
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Next frame in publisher order.
    ///
    /// Returns [`HubFrame::Closed`] once the hub is gone and
    /// [`Error::BackpressureDrop`] if the hub dropped this subscriber for
    /// falling behind.
    pub async fn recv(&mut self) -> Result<HubFrame> {
        // queued frames are stale once dropped
        if self.is_dropped() {
            return Err(Error::BackpressureDrop);
        }
        match self.rx.recv().await {
            Some(frame) => Ok(frame),
            None if self.dropped.load(Ordering::Acquire) => Err(Error::BackpressureDrop),
            None => Ok(HubFrame::Closed),
        }
    }

    /// Non-blocking variant used to drain already queued frames
    pub fn try_recv(&mut self) -> Option<HubFrame> {
        self.rx.try_recv().ok()
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.detach_subscriber(self.id);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("stream", self.hub.identity())
            .finish()
    }
}
