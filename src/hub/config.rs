//! Hub configuration

use std::time::Duration;

use super::SubscriberProtocol;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// GOPs replayed to RTMP subscribers and relay push legs
    pub rtmp_gop_num: usize,

    /// GOPs replayed to HTTP-FLV and HTTP-TS subscribers
    pub httpflv_gop_num: usize,

    /// Live frames a subscriber may fall behind before it is dropped
    pub subscriber_queue_capacity: usize,

    /// How long a hub outlives its publisher
    pub publisher_idle_timeout: Duration,

    /// How long a hub with neither publisher nor subscribers is kept
    pub empty_hub_grace_period: Duration,

    /// Period of the manager's cleanup task
    pub cleanup_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            rtmp_gop_num: 1,
            httpflv_gop_num: 1,
            subscriber_queue_capacity: 512,
            publisher_idle_timeout: Duration::from_secs(10),
            empty_hub_grace_period: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(1),
        }
    }
}

impl HubConfig {
    /// Set the same GOP depth for every protocol
    pub fn gop_num(mut self, n: usize) -> Self {
        self.rtmp_gop_num = n;
        self.httpflv_gop_num = n;
        self
    }

    pub fn subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity.max(1);
        self
    }

    pub fn publisher_idle_timeout(mut self, timeout: Duration) -> Self {
        self.publisher_idle_timeout = timeout;
        self
    }

    pub fn empty_hub_grace_period(mut self, period: Duration) -> Self {
        self.empty_hub_grace_period = period;
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Depth of the shared cache: enough for the deepest replay
    pub fn cache_depth(&self) -> usize {
        self.rtmp_gop_num.max(self.httpflv_gop_num)
    }

    pub fn replay_gops(&self, protocol: SubscriberProtocol) -> usize {
        match protocol {
            SubscriberProtocol::Rtmp | SubscriberProtocol::RelayPush => self.rtmp_gop_num,
            SubscriberProtocol::HttpFlv | SubscriberProtocol::HttpTs => self.httpflv_gop_num,
        }
    }
}
