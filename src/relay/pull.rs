//! Relay pull: play a stream from the origin and publish it into a local hub

use std::sync::Arc;

use super::LegTable;
use crate::client::{ClientSessionOptions, PullSession};
use crate::error::Result;
use crate::hub::{Hub, PublisherKind, StreamIdentity};
use crate::rtsp::RtspPullSession;
use crate::session::next_session_id;

/// URL of `identity` on the origin; an `rtsp://` origin keeps its scheme
pub fn origin_url(origin: &str, identity: &StreamIdentity) -> String {
    if origin.starts_with("rtsp://") || origin.starts_with("rtmp://") {
        format!("{}/{}/{}", origin.trim_end_matches('/'), identity.app, identity.name)
    } else {
        format!("rtmp://{}/{}/{}", origin, identity.app, identity.name)
    }
}

/// One pull attempt; the leg is removed from `legs` when it ends
pub(super) async fn run_pull(hub: Arc<Hub>, url: String, options: ClientSessionOptions, legs: LegTable, token: u64) {
    let identity = hub.identity().clone();
    tracing::info!(stream = %identity, url = %url, "Relay pull starting");

    match pull_into(&hub, &url, options).await {
        Ok(()) => tracing::info!(stream = %identity, url = %url, "Relay pull finished"),
        Err(e) => tracing::warn!(stream = %identity, url = %url, error = %e, "Relay pull failed"),
    }

    let mut legs = legs.lock();
    if let Some(entry) = legs.get_mut(&identity) {
        if entry.pull.as_ref().is_some_and(|(t, _)| *t == token) {
            entry.pull = None;
        }
        if entry.is_empty() {
            legs.remove(&identity);
        }
    }
}

async fn pull_into(hub: &Arc<Hub>, url: &str, options: ClientSessionOptions) -> Result<()> {
    // a local publisher may arrive while connecting, so attach only afterwards
    if url.starts_with("rtsp://") {
        let mut session = RtspPullSession::pull(url, options).await?;
        let result = match hub.attach_publisher(next_session_id(), PublisherKind::RelayPull) {
            Ok(mut publisher) => session.run(&mut publisher).await,
            Err(e) => Err(e.into()),
        };
        session.dispose().await;
        return result;
    }

    let mut session = PullSession::pull(url, options).await?;
    let result = match hub.attach_publisher(next_session_id(), PublisherKind::RelayPull) {
        Ok(mut publisher) => {
            tracing::info!(stream = %hub.identity(), key = %session.unique_key(), "Relay pull publishing");
            session.run(&mut publisher).await
        }
        Err(e) => Err(e.into()),
    };
    session.dispose().await;
    result
}
