//! Per-stream hub
//!
//! One publisher in, any number of subscribers out. All state lives behind
//! one mutex; each operation holds it only for the bookkeeping and
//! non-blocking queue pushes, never across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::config::HubConfig;
use super::frame::{HubFrame, StreamIdentity};
use super::observer::{HubPublisher, PublisherKind, SubscriberLifecycleObserver};
use super::subscriber::{SubscriberProtocol, SubscriberSlot, Subscription};
use crate::error::HubError;
use crate::media::{AvPacket, CodecConfig, GopCache};

/// Snapshot of a hub's counters
#[derive(Debug, Clone, PartialEq)]
pub struct HubStat {
    pub identity: StreamIdentity,
    pub publisher_id: Option<u64>,
    pub publisher_kind: Option<PublisherKind>,
    pub subscriber_count: usize,
    pub gop_count: usize,
    pub cached_packets: usize,
    pub packets_in: u64,
}

struct PublisherSlot {
    session_id: u64,
    kind: PublisherKind,
}

struct HubState {
    publisher: Option<PublisherSlot>,
    codec: Arc<CodecConfig>,
    metadata: Option<Bytes>,
    gop: GopCache,
    subscribers: HashMap<u64, SubscriberSlot>,
    /// When the last publisher left
    publisher_left_at: Option<Instant>,
    /// Since when the hub had neither publisher nor subscribers
    empty_since: Option<Instant>,
    packets_in: u64,
    disposed: bool,
}

impl HubState {
    fn is_empty(&self) -> bool {
        self.publisher.is_none() && self.subscribers.is_empty()
    }

    fn check_publisher(&self, identity: &StreamIdentity, session_id: u64) -> Result<(), HubError> {
        if self.disposed {
            return Err(HubError::Closed(identity.clone()));
        }
        match &self.publisher {
            Some(p) if p.session_id == session_id => Ok(()),
            _ => Err(HubError::PublisherMismatch(identity.clone())),
        }
    }

    /// Push to every subscriber without waiting; returns the ids removed
    fn fan_out(&mut self, identity: &StreamIdentity, frame: HubFrame) -> Vec<u64> {
        let mut removed = Vec::new();
        for (id, sub) in &self.subscribers {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    sub.dropped.store(true, Ordering::Release);
                    tracing::warn!(
                        stream = %identity,
                        subscriber_id = *id,
                        protocol = %sub.protocol,
                        "Subscriber queue full, dropping subscriber"
                    );
                    removed.push(*id);
                }
                Err(TrySendError::Closed(_)) => removed.push(*id),
            }
        }
        for id in &removed {
            self.subscribers.remove(id);
        }
        if self.is_empty() && self.empty_since.is_none() {
            self.empty_since = Some(Instant::now());
        }
        removed
    }
}

pub struct Hub {
    identity: StreamIdentity,
    config: HubConfig,
    state: Mutex<HubState>,
    next_subscriber_id: AtomicU64,
    observer: Option<Arc<dyn SubscriberLifecycleObserver>>,
}

impl Hub {
    pub fn new(identity: StreamIdentity, config: HubConfig) -> Arc<Self> {
        Self::with_observer(identity, config, None)
    }

    pub fn with_observer(
        identity: StreamIdentity,
        config: HubConfig,
        observer: Option<Arc<dyn SubscriberLifecycleObserver>>,
    ) -> Arc<Self> {
        let state = HubState {
            publisher: None,
            codec: Arc::new(CodecConfig::default()),
            metadata: None,
            gop: GopCache::new(config.cache_depth()),
            subscribers: HashMap::new(),
            publisher_left_at: None,
            empty_since: Some(Instant::now()),
            packets_in: 0,
            disposed: false,
        };
        Arc::new(Self {
            identity,
            config,
            state: Mutex::new(state),
            next_subscriber_id: AtomicU64::new(1),
            observer,
        })
    }

    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Bind `session_id` as the only publisher.
    ///
    /// Fails with [`HubError::Conflict`] while another publisher is attached;
    /// the existing binding is left untouched. On success the metadata,
    /// codec config and GOP cache of any previous publisher are discarded.
    pub fn attach_publisher(
        self: &Arc<Self>,
        session_id: u64,
        kind: PublisherKind,
    ) -> Result<HubPublisher, HubError> {
        {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(HubError::Closed(self.identity.clone()));
            }
            if let Some(current) = &state.publisher {
                tracing::warn!(
                    stream = %self.identity,
                    session_id,
                    current = current.session_id,
                    "Publish rejected, stream already has a publisher"
                );
                return Err(HubError::Conflict(self.identity.clone()));
            }

            state.publisher = Some(PublisherSlot { session_id, kind });
            state.codec = Arc::new(CodecConfig::default());
            state.metadata = None;
            state.gop.clear();
            state.publisher_left_at = None;
            state.empty_since = None;

            tracing::info!(
                stream = %self.identity,
                session_id,
                ?kind,
                subscribers = state.subscribers.len(),
                "Publisher attached"
            );
        }

        if let Some(observer) = &self.observer {
            observer.on_publisher_attached(self, kind);
        }
        Ok(HubPublisher::new(Arc::clone(self), session_id))
    }

    /// Idempotent; ignores ids that are not the current publisher
    pub fn detach_publisher(self: &Arc<Self>, session_id: u64) {
        {
            let mut state = self.state.lock();
            match &state.publisher {
                Some(p) if p.session_id == session_id => {}
                _ => return,
            }
            state.publisher = None;
            let now = Instant::now();
            state.publisher_left_at = Some(now);
            if state.is_empty() {
                state.empty_since = Some(now);
            }
            tracing::info!(
                stream = %self.identity,
                session_id,
                subscribers = state.subscribers.len(),
                "Publisher detached"
            );
        }

        if let Some(observer) = &self.observer {
            observer.on_publisher_detached(self);
        }
    }

    /// Register a subscriber and queue its catch-up frames.
    ///
    /// Catch-up (metadata, codec config, then cached GOPs from a keyframe)
    /// is queued under the same lock that serializes live fan-out, so the
    /// subscriber sees no gap and no duplicate at the replay/live boundary.
    pub fn attach_subscriber(self: &Arc<Self>, protocol: SubscriberProtocol) -> Result<Subscription, HubError> {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicBool::new(false));

        let rx = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(HubError::Closed(self.identity.clone()));
            }

            let mut catchup = Vec::new();
            if let Some(metadata) = &state.metadata {
                catchup.push(HubFrame::Metadata(metadata.clone()));
            }
            if !state.codec.is_empty() {
                catchup.push(HubFrame::Config(Arc::clone(&state.codec)));
            }
            let replay = self.config.replay_gops(protocol);
            catchup.extend(state.gop.recent(replay).cloned().map(HubFrame::Packet));

            let (tx, rx) = mpsc::channel(catchup.len() + self.config.subscriber_queue_capacity.max(1));
            let replayed = catchup.len();
            for frame in catchup {
                // capacity covers the whole catch-up
                let _ = tx.try_send(frame);
            }

            state.subscribers.insert(
                id,
                SubscriberSlot {
                    protocol,
                    tx,
                    dropped: Arc::clone(&dropped),
                },
            );
            state.empty_since = None;

            tracing::info!(
                stream = %self.identity,
                subscriber_id = id,
                %protocol,
                replayed,
                subscribers = state.subscribers.len(),
                "Subscriber attached"
            );
            rx
        };

        if let Some(observer) = &self.observer {
            observer.on_subscriber_attached(self, id, protocol);
        }
        Ok(Subscription::new(id, protocol, rx, dropped, Arc::clone(self)))
    }

    pub fn detach_subscriber(self: &Arc<Self>, id: u64) {
        {
            let mut state = self.state.lock();
            if state.subscribers.remove(&id).is_none() {
                return;
            }
            if state.is_empty() {
                state.empty_since = Some(Instant::now());
            }
            tracing::debug!(
                stream = %self.identity,
                subscriber_id = id,
                subscribers = state.subscribers.len(),
                "Subscriber detached"
            );
        }

        if let Some(observer) = &self.observer {
            observer.on_subscriber_detached(self, id);
        }
    }

    pub fn publish_config(self: &Arc<Self>, session_id: u64, config: &CodecConfig) -> Result<(), HubError> {
        let removed = {
            let mut state = self.state.lock();
            state.check_publisher(&self.identity, session_id)?;

            let mut merged = (*state.codec).clone();
            let video_changed = config.sps.is_some() && (config.sps != merged.sps || config.pps != merged.pps);
            merged.merge(config);
            if merged == *state.codec {
                return Ok(());
            }
            if video_changed {
                // cached frames reference the old parameter sets
                state.gop.clear();
            }
            state.codec = Arc::new(merged);
            tracing::debug!(
                stream = %self.identity,
                video = ?state.codec.video_codec(),
                audio = state.codec.has_audio(),
                "Codec config updated"
            );

            let frame = HubFrame::Config(Arc::clone(&state.codec));
            state.fan_out(&self.identity, frame)
        };
        self.notify_removed(removed);
        Ok(())
    }

    /// Cache and forward one packet, in publisher order
    pub fn publish_packet(self: &Arc<Self>, session_id: u64, pkt: AvPacket) -> Result<(), HubError> {
        let removed = {
            let mut state = self.state.lock();
            state.check_publisher(&self.identity, session_id)?;
            state.packets_in += 1;
            state.gop.push(&pkt);
            state.fan_out(&self.identity, HubFrame::Packet(pkt))
        };
        self.notify_removed(removed);
        Ok(())
    }

    pub fn publish_metadata(self: &Arc<Self>, session_id: u64, metadata: Bytes) -> Result<(), HubError> {
        let removed = {
            let mut state = self.state.lock();
            state.check_publisher(&self.identity, session_id)?;
            state.metadata = Some(metadata.clone());
            state.fan_out(&self.identity, HubFrame::Metadata(metadata))
        };
        self.notify_removed(removed);
        Ok(())
    }

    fn notify_removed(self: &Arc<Self>, removed: Vec<u64>) {
        if let Some(observer) = &self.observer {
            for id in removed {
                observer.on_subscriber_detached(self, id);
            }
        }
    }

    /// Tear down: subscribers get [`HubFrame::Closed`] and their queues
    /// close; later publisher calls fail with [`HubError::Closed`].
    /// Safe to call more than once and from any task.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.publisher = None;
        for sub in state.subscribers.values() {
            let _ = sub.tx.try_send(HubFrame::Closed);
        }
        state.subscribers.clear();
        state.gop.clear();
        tracing::info!(stream = %self.identity, "Hub disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Whether the cleanup task may remove this hub
    pub fn is_expired(&self, now: Instant) -> bool {
        let state = self.state.lock();
        if state.disposed {
            return true;
        }
        if state.publisher.is_some() {
            return false;
        }
        let idle = state
            .publisher_left_at
            .is_some_and(|t| now.duration_since(t) >= self.config.publisher_idle_timeout);
        let empty = state
            .empty_since
            .is_some_and(|t| now.duration_since(t) >= self.config.empty_hub_grace_period);
        idle || empty
    }

    pub fn has_publisher(&self) -> bool {
        self.state.lock().publisher.is_some()
    }

    pub fn publisher_kind(&self) -> Option<PublisherKind> {
        self.state.lock().publisher.as_ref().map(|p| p.kind)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn codec_config(&self) -> Arc<CodecConfig> {
        Arc::clone(&self.state.lock().codec)
    }

    pub fn stat(&self) -> HubStat {
        let state = self.state.lock();
        HubStat {
            identity: self.identity.clone(),
            publisher_id: state.publisher.as_ref().map(|p| p.session_id),
            publisher_kind: state.publisher.as_ref().map(|p| p.kind),
            subscriber_count: state.subscribers.len(),
            gop_count: state.gop.gop_count(),
            cached_packets: state.gop.packet_count(),
            packets_in: state.packets_in,
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub").field("identity", &self.identity).finish()
    }
}
