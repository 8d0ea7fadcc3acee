//! Server wiring: configuration and the listeners

pub mod config;
pub mod listener;

pub use config::ServerConfig;
pub use listener::{ListenerKind, LiveServer};
