//! RTMP client sessions
//!
//! - [`PullSession`]: play a remote stream, feeding a [`PublisherObserver`](crate::hub::PublisherObserver)
//! - [`PushSession`]: publish hub frames to a remote server
//!
//! Both wrap one [`ClientSession`], which owns the connection and the
//! connect/createStream/play|publish exchange.

pub mod config;
pub mod core;
pub mod publisher;
pub mod puller;

pub use self::config::{ClientSessionOptions, RtmpUrl};
pub use self::core::{ClientRole, ClientSession};
pub use publisher::PushSession;
pub use puller::PullSession;
