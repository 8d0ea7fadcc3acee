//! Listeners and the accept loops
//!
//! One accept loop per enabled listener, one task per accepted connection.
//! When HTTP-FLV and HTTP-TS share an address a single listener serves
//! both and picks the session from the request path extension.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::error::Result;
use crate::hub::HubManager;
use crate::relay::RelayController;
use crate::rtsp::RtspPubSession;
use crate::server::config::ServerConfig;
use crate::session::{http, next_session_id, HttpFlvSubSession, HttpTsSubSession, RtmpServerSession};

/// What a listener accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Rtmp,
    Http { flv: bool, ts: bool },
    Rtsp,
}

/// State every connection task needs
#[derive(Clone)]
struct Context {
    config: Arc<ServerConfig>,
    hubs: Arc<HubManager>,
}

pub struct LiveServer {
    ctx: Context,
    relay: Arc<RelayController>,
    listeners: Vec<(ListenerKind, TcpListener)>,
}

impl LiveServer {
    /// Build the hub manager and bind every enabled listener
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let relay = RelayController::new(config.relay_options());
        let hubs = Arc::new(HubManager::with_observer(config.hub_config(), relay.clone()));

        let mut plan: Vec<(ListenerKind, &str)> = Vec::new();
        if config.rtmp.enable {
            plan.push((ListenerKind::Rtmp, config.rtmp.addr.as_str()));
        }
        match (config.httpflv.enable, config.httpts.enable) {
            (true, true) if config.httpflv.sub_listen_addr == config.httpts.sub_listen_addr => {
                plan.push((ListenerKind::Http { flv: true, ts: true }, config.httpflv.sub_listen_addr.as_str()));
            }
            (flv, ts) => {
                if flv {
                    plan.push((ListenerKind::Http { flv: true, ts: false }, config.httpflv.sub_listen_addr.as_str()));
                }
                if ts {
                    plan.push((ListenerKind::Http { flv: false, ts: true }, config.httpts.sub_listen_addr.as_str()));
                }
            }
        }
        if config.rtsp.enable {
            plan.push((ListenerKind::Rtsp, config.rtsp.addr.as_str()));
        }

        let mut listeners = Vec::with_capacity(plan.len());
        for (kind, addr) in plan {
            let listener = TcpListener::bind(addr).await?;
            tracing::info!(?kind, addr = %listener.local_addr()?, "Listening");
            listeners.push((kind, listener));
        }

        Ok(Self {
            ctx: Context {
                config: Arc::new(config),
                hubs,
            },
            relay,
            listeners,
        })
    }

    pub fn hubs(&self) -> &Arc<HubManager> {
        &self.ctx.hubs
    }

    pub fn relay(&self) -> &Arc<RelayController> {
        &self.relay
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    /// Bound address of the first listener of `kind`
    pub fn local_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|(k, _)| *k == kind)
            .and_then(|(_, l)| l.local_addr().ok())
    }

    /// Serve until `shutdown` resolves, then dispose every hub
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let cleanup_handle = self.ctx.hubs.spawn_cleanup_task();

        let mut loops = JoinSet::new();
        for (kind, listener) in self.listeners {
            loops.spawn(accept_loop(kind, listener, self.ctx.clone()));
        }

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
            }
            Some(ended) = loops.join_next() => {
                tracing::error!(?ended, "Accept loop ended");
            }
        }

        loops.abort_all();
        cleanup_handle.abort();
        self.ctx.hubs.dispose_all().await;
        Ok(())
    }
}

async fn accept_loop(kind: ListenerKind, listener: TcpListener, ctx: Context) {
    loop {
        match listener.accept().await {
            Ok((socket, peer_addr)) => handle_connection(kind, socket, peer_addr, &ctx),
            Err(e) => {
                tracing::error!(?kind, error = %e, "Failed to accept connection");
            }
        }
    }
}

fn handle_connection(kind: ListenerKind, socket: TcpStream, peer_addr: SocketAddr, ctx: &Context) {
    let session_id = next_session_id();
    tracing::debug!(session_id, peer = %peer_addr, ?kind, "New connection");

    if ctx.config.session.tcp_nodelay {
        if let Err(e) = socket.set_nodelay(true) {
            tracing::error!(error = %e, "Failed to configure socket");
            return;
        }
    }

    let ctx = ctx.clone();
    tokio::spawn(async move {
        let result = match kind {
            ListenerKind::Rtmp => {
                let options = ctx.config.rtmp_session_options();
                let mut session = RtmpServerSession::new(session_id, socket, Some(peer_addr), ctx.hubs, options);
                session.run().await
            }
            ListenerKind::Rtsp => {
                let timeout = ctx.config.read_timeout();
                let mut session = RtspPubSession::new(session_id, socket, Some(peer_addr), ctx.hubs, timeout);
                session.run().await
            }
            ListenerKind::Http { flv, ts } => serve_http(session_id, socket, peer_addr, flv, ts, &ctx).await,
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_disconnect() => tracing::debug!(session_id, error = %e, "Connection error"),
            Err(e) => tracing::warn!(session_id, peer = %peer_addr, error = %e, "Session failed"),
        }
        tracing::debug!(session_id, "Connection closed");
    });
}

async fn serve_http(
    session_id: u64,
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    flv: bool,
    ts: bool,
    ctx: &Context,
) -> Result<()> {
    let timeout: Duration = ctx.config.request_timeout();
    let request = http::read_request(&mut socket, timeout).await?;

    if ts && request.stream_identity("ts").is_some() {
        let mut session = HttpTsSubSession::new(session_id, socket, Some(peer_addr)).with_request(request);
        return session.run(&ctx.hubs, timeout).await;
    }
    if flv && request.stream_identity("flv").is_some() {
        let mut session = HttpFlvSubSession::new(session_id, socket, Some(peer_addr)).with_request(request);
        return session.run(&ctx.hubs, timeout).await;
    }
    tracing::debug!(session_id, uri = %request.uri, "No stream for request");
    http::write_not_found(&mut socket).await
}
