//! Stream hubs: one publisher fanned out to many subscribers
//!
//! ```text
//!                        Arc<HubManager>
//!                  ┌──────────────────────────┐
//!                  │ StreamIdentity -> Hub {  │
//!                  │   publisher,             │
//!                  │   codec config, gop,     │
//!                  │   subscriber queues      │
//!                  │ }                        │
//!                  └────────────┬─────────────┘
//!                               │
//!       ┌───────────────────────┼───────────────────────┐
//!       ▼                       ▼                       ▼
//!  [HubPublisher]         [Subscription]          [Subscription]
//!  on_av_packet()         recv() -> RTMP          recv() -> HTTP-TS
//! ```
//!
//! Each subscriber has a bounded queue. The hub never waits on a
//! subscriber: a queue that is full when a frame arrives gets its
//! subscriber dropped, so one slow consumer never holds up the rest.

pub mod config;
pub mod frame;
pub mod group;
pub mod manager;
pub mod observer;
pub mod subscriber;

pub use config::HubConfig;
pub use frame::{HubFrame, StreamIdentity};
pub use group::{Hub, HubStat};
pub use manager::HubManager;
pub use observer::{HubPublisher, PublisherKind, PublisherObserver, SubscriberLifecycleObserver};
pub use subscriber::{SubscriberProtocol, Subscription};
