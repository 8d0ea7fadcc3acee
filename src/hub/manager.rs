//! Hub lookup, creation and cleanup

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;

use super::config::HubConfig;
use super::frame::StreamIdentity;
use super::group::{Hub, HubStat};
use super::observer::{HubPublisher, PublisherKind, SubscriberLifecycleObserver};
use super::subscriber::{SubscriberProtocol, Subscription};
use crate::error::HubError;

/// All hubs of a server, keyed by stream identity
pub struct HubManager {
    hubs: RwLock<HashMap<StreamIdentity, Arc<Hub>>>,
    config: HubConfig,
    observer: Option<Arc<dyn SubscriberLifecycleObserver>>,
}

impl HubManager {
    pub fn new(config: HubConfig) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            config,
            observer: None,
        }
    }

    pub fn with_observer(config: HubConfig, observer: Arc<dyn SubscriberLifecycleObserver>) -> Self {
        Self {
            observer: Some(observer),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub async fn get(&self, identity: &StreamIdentity) -> Option<Arc<Hub>> {
        self.hubs.read().await.get(identity).cloned()
    }

    /// Existing live hub for `identity`, or a new one
    pub async fn get_or_create(&self, identity: &StreamIdentity) -> Arc<Hub> {
        if let Some(hub) = self.hubs.read().await.get(identity) {
            if !hub.is_disposed() {
                return Arc::clone(hub);
            }
        }

        let mut hubs = self.hubs.write().await;
        match hubs.get(identity) {
            Some(hub) if !hub.is_disposed() => Arc::clone(hub),
            _ => {
                let hub = Hub::with_observer(identity.clone(), self.config.clone(), self.observer.clone());
                hubs.insert(identity.clone(), Arc::clone(&hub));
                tracing::info!(stream = %identity, hubs = hubs.len(), "Hub created");
                hub
            }
        }
    }

    /// Attach a publisher, creating the hub if needed
    pub async fn publish(
        &self,
        identity: &StreamIdentity,
        session_id: u64,
        kind: PublisherKind,
    ) -> Result<HubPublisher, HubError> {
        let hub = self.get_or_create(identity).await;
        match hub.attach_publisher(session_id, kind) {
            // lost a race with cleanup, the next lookup creates a fresh hub
            Err(HubError::Closed(_)) => self.get_or_create(identity).await.attach_publisher(session_id, kind),
            other => other,
        }
    }

    /// Attach a subscriber, creating the hub if needed
    pub async fn subscribe(
        &self,
        identity: &StreamIdentity,
        protocol: SubscriberProtocol,
    ) -> Result<Subscription, HubError> {
        let hub = self.get_or_create(identity).await;
        match hub.attach_subscriber(protocol) {
            Err(HubError::Closed(_)) => self.get_or_create(identity).await.attach_subscriber(protocol),
            other => other,
        }
    }

    pub async fn hub_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn stats(&self) -> Vec<HubStat> {
        self.hubs.read().await.values().map(|h| h.stat()).collect()
    }

    /// Remove and dispose hubs whose idle timeout or grace period elapsed
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let expired: Vec<Arc<Hub>> = {
            let mut hubs = self.hubs.write().await;
            let keys: Vec<StreamIdentity> = hubs
                .iter()
                .filter(|(_, hub)| hub.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| hubs.remove(key)).collect()
        };

        for hub in expired {
            tracing::info!(stream = %hub.identity(), "Hub removed by cleanup");
            hub.dispose();
        }
    }

    /// Dispose every hub, used on shutdown
    pub async fn dispose_all(&self) {
        let hubs: Vec<Arc<Hub>> = self.hubs.write().await.drain().map(|(_, hub)| hub).collect();
        for hub in hubs {
            hub.dispose();
        }
    }

    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.cleanup().await;
            }
        })
    }
}
