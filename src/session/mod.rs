//! Server-side sessions, one task per accepted connection
//!
//! - `rtmp`: RTMP publish/play with the command state machine in `state`
//! - `httpflv` / `httpts`: HTTP progressive subscribers
//! - `http`: the request head parsing both share

use std::sync::atomic::{AtomicU64, Ordering};

pub mod http;
pub mod httpflv;
pub mod httpts;
pub mod rtmp;
pub mod state;

pub use http::HttpRequest;
pub use httpflv::HttpFlvSubSession;
pub use httpts::HttpTsSubSession;
pub use rtmp::{RtmpServerSession, RtmpSessionOptions};
pub use state::{SessionPhase, SessionState};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide session id, also used as the hub publisher id
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}
