//! Server configuration
//!
//! Loaded from JSON; every section is optional and falls back to its
//! defaults, so a partial file is accepted:
//!
//! ```json
//! {
//!   "rtmp":       { "enable": true, "addr": "0.0.0.0:1935", "gop_num": 1 },
//!   "httpflv":    { "enable": true, "sub_listen_addr": "0.0.0.0:8080", "gop_num": 1 },
//!   "httpts":     { "enable": true, "sub_listen_addr": "0.0.0.0:8080" },
//!   "rtsp":       { "enable": true, "addr": "0.0.0.0:5544" },
//!   "relay_push": { "enable": false, "addr_list": [] },
//!   "relay_pull": { "enable": false, "addr": "" },
//!   "server_id":  "1"
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ClientSessionOptions;
use crate::error::{Error, Result};
use crate::hub::HubConfig;
use crate::protocol::constants::*;
use crate::relay::RelayOptions;
use crate::session::RtmpSessionOptions;

/// Top-level sections a config file is expected to have
const SECTIONS: &[&str] = &["rtmp", "httpflv", "httpts", "rtsp", "relay_push", "relay_pull"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtmpConfig {
    pub enable: bool,
    pub addr: String,
    /// GOPs replayed to RTMP players and relay push legs
    pub gop_num: usize,
}

impl Default for RtmpConfig {
    fn default() -> Self {
        Self {
            enable: true,
            addr: format!("0.0.0.0:{}", RTMP_PORT),
            gop_num: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFlvConfig {
    pub enable: bool,
    pub sub_listen_addr: String,
    /// GOPs replayed to HTTP-FLV and HTTP-TS subscribers
    pub gop_num: usize,
}

impl Default for HttpFlvConfig {
    fn default() -> Self {
        Self {
            enable: true,
            sub_listen_addr: "0.0.0.0:8080".into(),
            gop_num: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTsConfig {
    pub enable: bool,
    pub sub_listen_addr: String,
}

impl Default for HttpTsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            sub_listen_addr: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtspConfig {
    pub enable: bool,
    pub addr: String,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            enable: true,
            addr: "0.0.0.0:5544".into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPushConfig {
    pub enable: bool,
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayPullConfig {
    pub enable: bool,
    /// `host:port` of the origin, or an `rtsp://` base URL
    pub addr: String,
}

/// Hub tuning; durations in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    pub subscriber_queue_capacity: usize,
    pub publisher_idle_timeout: u64,
    pub empty_hub_grace_period: u64,
    pub cleanup_interval: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        let defaults = HubConfig::default();
        Self {
            subscriber_queue_capacity: defaults.subscriber_queue_capacity,
            publisher_idle_timeout: defaults.publisher_idle_timeout.as_secs(),
            empty_hub_grace_period: defaults.empty_hub_grace_period.as_secs(),
            cleanup_interval: defaults.cleanup_interval.as_secs(),
        }
    }
}

/// Per-connection tuning; durations in seconds, 0 means no limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub handshake_timeout: u64,
    pub chunk_size: u32,
    pub window_ack_size: u32,
    pub tcp_nodelay: bool,
    /// HTTP request head deadline
    pub request_timeout: u64,
    /// Gap allowed between two reads of an RTSP publisher
    pub read_timeout: u64,
    /// Relay client timeouts
    pub connect_timeout: u64,
    pub do_timeout: u64,
    pub read_av_timeout: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            handshake_timeout: 10,
            chunk_size: RECOMMENDED_CHUNK_SIZE,
            window_ack_size: DEFAULT_WINDOW_ACK_SIZE,
            tcp_nodelay: true,
            request_timeout: 10,
            read_timeout: 30,
            connect_timeout: 5,
            do_timeout: 10,
            read_av_timeout: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub rtmp: RtmpConfig,
    pub httpflv: HttpFlvConfig,
    pub httpts: HttpTsConfig,
    pub rtsp: RtspConfig,
    pub relay_push: RelayPushConfig,
    pub relay_pull: RelayPullConfig,
    pub server_id: String,
    pub hub: HubSection,
    pub session: SessionSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rtmp: RtmpConfig::default(),
            httpflv: HttpFlvConfig::default(),
            httpts: HttpTsConfig::default(),
            rtsp: RtspConfig::default(),
            relay_push: RelayPushConfig::default(),
            relay_pull: RelayPullConfig::default(),
            server_id: "1".into(),
            hub: HubSection::default(),
            session: SessionSection::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid json: {}", e)))?;
        let Some(object) = value.as_object() else {
            return Err(Error::Config("top level must be an object".into()));
        };
        for section in SECTIONS {
            if !object.contains_key(*section) {
                tracing::warn!(section, "Missing config section, using defaults");
            }
        }

        let config: Self = serde_json::from_value(value).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_json_str(&text)?;
        tracing::info!(path = %path.display(), server_id = %config.server_id, "Config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let listeners = [
            ("rtmp.addr", self.rtmp.enable, &self.rtmp.addr),
            ("httpflv.sub_listen_addr", self.httpflv.enable, &self.httpflv.sub_listen_addr),
            ("httpts.sub_listen_addr", self.httpts.enable, &self.httpts.sub_listen_addr),
            ("rtsp.addr", self.rtsp.enable, &self.rtsp.addr),
        ];
        for (key, enable, addr) in listeners {
            if enable && addr.trim().is_empty() {
                return Err(Error::Config(format!("{} is empty", key)));
            }
        }
        if self.relay_pull.enable && self.relay_pull.addr.trim().is_empty() {
            return Err(Error::Config("relay_pull.addr is empty".into()));
        }
        if !(1..=MAX_CHUNK_SIZE).contains(&self.session.chunk_size) {
            return Err(Error::Config(format!("session.chunk_size {} out of range", self.session.chunk_size)));
        }
        Ok(())
    }

    pub fn rtmp_addr(mut self, addr: impl Into<String>) -> Self {
        self.rtmp.enable = true;
        self.rtmp.addr = addr.into();
        self
    }

    pub fn httpflv_addr(mut self, addr: impl Into<String>) -> Self {
        self.httpflv.enable = true;
        self.httpflv.sub_listen_addr = addr.into();
        self
    }

    pub fn httpts_addr(mut self, addr: impl Into<String>) -> Self {
        self.httpts.enable = true;
        self.httpts.sub_listen_addr = addr.into();
        self
    }

    pub fn rtsp_addr(mut self, addr: impl Into<String>) -> Self {
        self.rtsp.enable = true;
        self.rtsp.addr = addr.into();
        self
    }

    /// Turn every listener off; enable the wanted ones with the `*_addr` setters
    pub fn without_listeners(mut self) -> Self {
        self.rtmp.enable = false;
        self.httpflv.enable = false;
        self.httpts.enable = false;
        self.rtsp.enable = false;
        self
    }

    /// Same GOP depth for RTMP and HTTP subscribers
    pub fn gop_num(mut self, n: usize) -> Self {
        self.rtmp.gop_num = n;
        self.httpflv.gop_num = n;
        self
    }

    pub fn relay_push(mut self, addr_list: Vec<String>) -> Self {
        self.relay_push.enable = !addr_list.is_empty();
        self.relay_push.addr_list = addr_list;
        self
    }

    pub fn relay_pull(mut self, addr: impl Into<String>) -> Self {
        self.relay_pull.enable = true;
        self.relay_pull.addr = addr.into();
        self
    }

    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            rtmp_gop_num: self.rtmp.gop_num,
            httpflv_gop_num: self.httpflv.gop_num,
            ..HubConfig::default()
        }
        .subscriber_queue_capacity(self.hub.subscriber_queue_capacity)
        .publisher_idle_timeout(Duration::from_secs(self.hub.publisher_idle_timeout))
        .empty_hub_grace_period(Duration::from_secs(self.hub.empty_hub_grace_period))
        .cleanup_interval(Duration::from_secs(self.hub.cleanup_interval.max(1)))
    }

    pub fn rtmp_session_options(&self) -> RtmpSessionOptions {
        RtmpSessionOptions {
            handshake_timeout: Duration::from_secs(self.session.handshake_timeout),
            chunk_size: self.session.chunk_size,
            window_ack_size: self.session.window_ack_size,
            ..RtmpSessionOptions::default()
        }
    }

    pub fn client_options(&self) -> ClientSessionOptions {
        ClientSessionOptions::default()
            .connect_timeout(Duration::from_secs(self.session.connect_timeout))
            .do_timeout(Duration::from_secs(self.session.do_timeout))
            .read_av_timeout(Duration::from_secs(self.session.read_av_timeout))
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            pull_addr: self.relay_pull.enable.then(|| self.relay_pull.addr.clone()),
            push_addrs: if self.relay_push.enable {
                self.relay_push.addr_list.clone()
            } else {
                Vec::new()
            },
            client: self.client_options(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.session.request_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.session.read_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert!(config.rtmp.enable);
        assert_eq!(config.rtmp.addr, "0.0.0.0:1935");
        assert_eq!(config.httpflv.sub_listen_addr, config.httpts.sub_listen_addr);
        assert!(!config.relay_pull.enable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let config = ServerConfig::from_json_str(
            r#"{
                "rtmp": { "addr": "127.0.0.1:19350", "gop_num": 2 },
                "relay_pull": { "enable": true, "addr": "origin:1935" },
                "server_id": "edge-1"
            }"#,
        )
        .unwrap();

        assert!(config.rtmp.enable);
        assert_eq!(config.rtmp.addr, "127.0.0.1:19350");
        assert_eq!(config.httpflv, HttpFlvConfig::default());
        assert_eq!(config.server_id, "edge-1");

        let hub = config.hub_config();
        assert_eq!(hub.rtmp_gop_num, 2);
        assert_eq!(hub.httpflv_gop_num, 1);

        let relay = config.relay_options();
        assert_eq!(relay.pull_addr.as_deref(), Some("origin:1935"));
        assert!(relay.push_addrs.is_empty());
    }

    #[test]
    fn test_disabled_push_has_no_legs() {
        let config = ServerConfig::from_json_str(
            r#"{ "relay_push": { "enable": false, "addr_list": ["a:1935"] } }"#,
        )
        .unwrap();
        assert!(config.relay_options().push_addrs.is_empty());
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(ServerConfig::from_json_str("[1]"), Err(Error::Config(_))));
        assert!(matches!(ServerConfig::from_json_str("{"), Err(Error::Config(_))));
        assert!(matches!(
            ServerConfig::from_json_str(r#"{ "rtmp": { "gop_num": "two" } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerConfig::from_json_str(r#"{ "relay_pull": { "enable": true } }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            ServerConfig::from_json_str(r#"{ "session": { "chunk_size": 0 } }"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_builder_chaining() {
        let config = ServerConfig::default()
            .without_listeners()
            .rtmp_addr("127.0.0.1:0")
            .gop_num(3)
            .relay_push(vec!["10.0.0.2:1935".into()])
            .server_id("x");

        assert!(config.rtmp.enable);
        assert!(!config.httpflv.enable);
        assert_eq!(config.hub_config().cache_depth(), 3);
        assert_eq!(config.relay_options().push_addrs, vec!["10.0.0.2:1935".to_string()]);
        assert_eq!(config.server_id, "x");
    }

    #[test]
    fn test_load_missing_file() {
        let err = ServerConfig::load("/nonexistent/livehub.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
