//! livehub: a live media routing server
//!
//! Streams are published over RTMP or RTSP (or pulled from an origin) into a
//! per-stream [`Hub`](hub::Hub) and played out over RTMP, HTTP-FLV and
//! HTTP-TS.
//!
//! ```no_run
//! use livehub::{LiveServer, ServerConfig};
//!
//! # async fn run() -> livehub::Result<()> {
//! let server = LiveServer::new(ServerConfig::default()).await?;
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await
//! # }
//! ```

pub mod amf;
pub mod client;
pub mod error;
pub mod hub;
pub mod media;
pub mod protocol;
pub mod relay;
pub mod rtp;
pub mod rtsp;
pub mod sdp;
pub mod server;
pub mod session;
pub mod stats;

pub use error::{Error, Result};
pub use hub::{HubManager, StreamIdentity};
pub use server::{LiveServer, ServerConfig};
