//! Relay legs started from hub membership changes
//!
//! - pull: the first subscriber of a hub without a publisher makes the
//!   server play the stream from the origin and publish it locally
//! - push: every local publisher is forwarded to each configured remote
//!
//! [`RelayController`] is the hub's [`SubscriberLifecycleObserver`]; hubs
//! know nothing about relays.

pub mod pull;
pub mod push;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::client::ClientSessionOptions;
use crate::hub::{Hub, PublisherKind, StreamIdentity, SubscriberLifecycleObserver, SubscriberProtocol};

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Origin to pull from: `host[:port]` for RTMP or an `rtsp://` base URL.
    /// `None` disables relay pull.
    pub pull_addr: Option<String>,
    /// `host[:port]` of every server to push local publishers to
    pub push_addrs: Vec<String>,
    pub client: ClientSessionOptions,
}

#[derive(Default)]
struct StreamLegs {
    /// Running pull and the token that identifies it
    pull: Option<(u64, AbortHandle)>,
    push: Vec<AbortHandle>,
}

impl StreamLegs {
    fn is_empty(&self) -> bool {
        self.pull.is_none() && self.push.is_empty()
    }
}

type LegTable = Arc<Mutex<HashMap<StreamIdentity, StreamLegs>>>;

pub struct RelayController {
    options: RelayOptions,
    legs: LegTable,
    next_token: AtomicU64,
}

impl RelayController {
    pub fn new(options: RelayOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            legs: Arc::default(),
            next_token: AtomicU64::new(1),
        })
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Whether a pull for `identity` is running
    pub fn is_pulling(&self, identity: &StreamIdentity) -> bool {
        self.legs.lock().get(identity).is_some_and(|l| l.pull.is_some())
    }

    pub fn push_leg_count(&self, identity: &StreamIdentity) -> usize {
        self.legs.lock().get(identity).map_or(0, |l| l.push.len())
    }

    fn start_pull(&self, hub: &Arc<Hub>, origin: &str) {
        let identity = hub.identity().clone();
        let mut legs = self.legs.lock();
        let entry = legs.entry(identity.clone()).or_default();
        if entry.pull.is_some() {
            return;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let url = pull::origin_url(origin, &identity);
        let task = tokio::spawn(pull::run_pull(
            Arc::clone(hub),
            url,
            self.options.client,
            Arc::clone(&self.legs),
            token,
        ));
        entry.pull = Some((token, task.abort_handle()));
    }

    fn stop_pull(&self, identity: &StreamIdentity) {
        let mut legs = self.legs.lock();
        if let Some(entry) = legs.get_mut(identity) {
            if let Some((_, handle)) = entry.pull.take() {
                tracing::info!(stream = %identity, "Stopping relay pull, no subscribers left");
                handle.abort();
            }
            if entry.is_empty() {
                legs.remove(identity);
            }
        }
    }

    fn start_push(&self, hub: &Arc<Hub>) {
        let identity = hub.identity().clone();
        let mut legs = self.legs.lock();
        let entry = legs.entry(identity.clone()).or_default();
        for handle in entry.push.drain(..) {
            handle.abort();
        }
        for addr in &self.options.push_addrs {
            let url = format!("rtmp://{}/{}/{}", addr, identity.app, identity.name);
            let task = tokio::spawn(push::run_push_leg(Arc::clone(hub), url, self.options.client));
            entry.push.push(task.abort_handle());
        }
    }

    fn stop_push(&self, identity: &StreamIdentity) {
        let mut legs = self.legs.lock();
        if let Some(entry) = legs.get_mut(identity) {
            if !entry.push.is_empty() {
                tracing::info!(stream = %identity, legs = entry.push.len(), "Stopping relay push");
            }
            for handle in entry.push.drain(..) {
                handle.abort();
            }
            if entry.is_empty() {
                legs.remove(identity);
            }
        }
    }
}

impl SubscriberLifecycleObserver for RelayController {
    fn on_publisher_attached(&self, hub: &Arc<Hub>, kind: PublisherKind) {
        if kind == PublisherKind::Local && !self.options.push_addrs.is_empty() {
            self.start_push(hub);
        }
    }

    fn on_publisher_detached(&self, hub: &Arc<Hub>) {
        self.stop_push(hub.identity());
    }

    fn on_subscriber_attached(&self, hub: &Arc<Hub>, _subscriber_id: u64, protocol: SubscriberProtocol) {
        if protocol == SubscriberProtocol::RelayPush || hub.has_publisher() {
            return;
        }
        if let Some(origin) = &self.options.pull_addr {
            self.start_pull(hub, origin);
        }
    }

    fn on_subscriber_detached(&self, hub: &Arc<Hub>, _subscriber_id: u64) {
        if hub.subscriber_count() == 0 && hub.publisher_kind() != Some(PublisherKind::Local) {
            self.stop_pull(hub.identity());
        }
    }
}
