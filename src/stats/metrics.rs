//! Per-session byte counters, bitrate and liveness

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Byte counters shared between a transport and its session
#[derive(Debug, Default)]
pub struct ConnStat {
    read_bytes: AtomicU64,
    wrote_bytes: AtomicU64,
}

impl ConnStat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_read(&self, n: u64) {
        self.read_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_wrote(&self, n: u64) {
        self.wrote_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn wrote_bytes(&self) -> u64 {
        self.wrote_bytes.load(Ordering::Relaxed)
    }
}

/// Which counter reflects a session's useful traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatDirection {
    /// Publishers and pull sessions
    Read,
    /// Subscribers and push sessions
    Write,
}

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq)]
pub struct StatSession {
    pub protocol: &'static str,
    pub session_id: String,
    pub start_time: SystemTime,
    pub remote_addr: Option<SocketAddr>,
    pub read_bytes_sum: u64,
    pub wrote_bytes_sum: u64,
    /// As of the last [`SessionStat::update_stat`]
    pub bitrate_kbits: u64,
}

/// Stat bookkeeping owned by a session
#[derive(Debug)]
pub struct SessionStat {
    conn: Arc<ConnStat>,
    direction: StatDirection,
    protocol: &'static str,
    session_id: String,
    start_time: SystemTime,
    remote_addr: Option<SocketAddr>,
    bitrate_prev_bytes: u64,
    bitrate_kbits: u64,
    alive_prev_bytes: Option<u64>,
}

impl SessionStat {
    pub fn new(
        protocol: &'static str,
        session_id: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        direction: StatDirection,
    ) -> Self {
        Self {
            conn: ConnStat::new(),
            direction,
            protocol,
            session_id: session_id.into(),
            start_time: SystemTime::now(),
            remote_addr,
            bitrate_prev_bytes: 0,
            bitrate_kbits: 0,
            alive_prev_bytes: None,
        }
    }

    /// Counters to hand to a [`CountingStream`](super::CountingStream)
    pub fn conn(&self) -> Arc<ConnStat> {
        Arc::clone(&self.conn)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// RTMP sessions only learn their role at `publish`/`play`
    pub fn set_direction(&mut self, direction: StatDirection) {
        self.direction = direction;
    }

    fn counter(&self) -> u64 {
        match self.direction {
            StatDirection::Read => self.conn.read_bytes(),
            StatDirection::Write => self.conn.wrote_bytes(),
        }
    }

    /// Recompute the bitrate over the last `interval_secs` seconds:
    /// delta bytes * 8 / 1024 / interval
    pub fn update_stat(&mut self, interval_secs: u32) {
        let current = self.counter();
        let delta = current.saturating_sub(self.bitrate_prev_bytes);
        self.bitrate_kbits = delta * 8 / 1024 / interval_secs.max(1) as u64;
        self.bitrate_prev_bytes = current;
    }

    /// The first call is always true; later calls report whether the
    /// counter moved since the previous call.
    pub fn is_alive(&mut self) -> bool {
        let current = self.counter();
        let alive = match self.alive_prev_bytes {
            None => true,
            Some(prev) => current != prev,
        };
        self.alive_prev_bytes = Some(current);
        alive
    }

    pub fn snapshot(&self) -> StatSession {
        StatSession {
            protocol: self.protocol,
            session_id: self.session_id.clone(),
            start_time: self.start_time,
            remote_addr: self.remote_addr,
            read_bytes_sum: self.conn.read_bytes(),
            wrote_bytes_sum: self.conn.wrote_bytes(),
            bitrate_kbits: self.bitrate_kbits,
        }
    }
}
