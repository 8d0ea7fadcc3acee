//! Relay push: forward a local publisher to one remote server
//!
//! Each leg retries on its own with exponential backoff and runs until the
//! controller aborts it when the publisher leaves.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{ClientSessionOptions, PushSession};
use crate::error::Result;
use crate::hub::{Hub, SubscriberProtocol};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (1-based): 1 s doubling up to 30 s
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.clamp(1, 16).saturating_sub(1);
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

pub(super) async fn run_push_leg(hub: Arc<Hub>, url: String, options: ClientSessionOptions) {
    let mut attempt = 0;
    loop {
        match push_once(&hub, &url, options, &mut attempt).await {
            Ok(()) => {
                tracing::info!(stream = %hub.identity(), url = %url, "Relay push finished");
                return;
            }
            Err(e) => {
                tracing::warn!(stream = %hub.identity(), url = %url, attempt, error = %e, "Relay push failed");
            }
        }
        if !hub.has_publisher() || hub.is_disposed() {
            return;
        }
        attempt += 1;
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}

async fn push_once(hub: &Arc<Hub>, url: &str, options: ClientSessionOptions, attempt: &mut u32) -> Result<()> {
    let mut session = PushSession::push(url, options).await?;
    *attempt = 0;
    tracing::info!(stream = %hub.identity(), url = %url, key = %session.unique_key(), "Relay push connected");

    let result = forward(hub, &mut session).await;
    session.dispose().await;
    result
}

async fn forward(hub: &Arc<Hub>, session: &mut PushSession<tokio::net::TcpStream>) -> Result<()> {
    let mut sub = hub.attach_subscriber(SubscriberProtocol::RelayPush)?;
    loop {
        let frame = sub.recv().await?;
        if frame.is_closed() {
            return Ok(());
        }
        session.write_frame(&frame).await?;
    }
}
