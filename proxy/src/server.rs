/// WebSocket front door
///
/// One listener serves the WebSocket upgrade on `/` plus `/health` and
/// `/metrics`. Each accepted socket gets its own `ConnectionSession` task;
/// the server keeps nothing per client beyond a connection count.

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::ProxyConfig;
use crate::metrics::prometheus as metrics;
use crate::session::{ConnectionSession, SessionContext};
use crate::upstream::{PoolConnector, TcpConnector};

/// Client frames buffered between the socket reader and the session.
const INBOUND_BUFFER: usize = 256;

pub struct ProxyServer<C: PoolConnector = TcpConnector> {
    ctx: Arc<SessionContext>,
    connector: Arc<C>,
    max_connections: usize,
    active: AtomicUsize,
    started_at: i64,
}

impl ProxyServer<TcpConnector> {
    pub fn new(cfg: &ProxyConfig) -> Self {
        Self::with_connector(cfg, TcpConnector)
    }
}

impl<C: PoolConnector> ProxyServer<C> {
    pub fn with_connector(cfg: &ProxyConfig, connector: C) -> Self {
        Self {
            ctx: Arc::new(SessionContext::from_config(cfg)),
            connector: Arc::new(connector),
            max_connections: cfg.max_connections,
            active: AtomicUsize::new(0),
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/", get(ws_handler::<C>))
            .route("/health", get(api_health::<C>))
            .route("/metrics", get(api_metrics))
            .with_state(self)
    }

    /// Bind with SO_REUSEADDR so a restart does not hit "Address already in use".
    pub fn bind(addr: &str) -> Result<TcpListener> {
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", addr, e))?;
        let domain = if sock_addr.is_ipv6() { socket2::Domain::IPV6 } else { socket2::Domain::IPV4 };
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;
        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub async fn start(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = Self::bind(addr)?;
        tracing::info!("✅ Proxy listening on ws://{} (SO_REUSEADDR)", addr);
        self.serve(listener, shutdown_signal()).await?;
        tracing::info!("🏁 Proxy shut down cleanly");
        Ok(())
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Reserves a connection slot; `false` when the server is full.
    fn try_acquire(&self) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn ws_handler<C: PoolConnector>(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(server): State<Arc<ProxyServer<C>>>,
) -> Response {
    if !server.try_acquire() {
        tracing::warn!("⚠️ Connection limit reached ({}), refusing {}", server.max_connections, peer);
        metrics::inc_rejected_upgrades();
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    // Released on drop, also when the upgrade itself fails
    let slot = Slot(Arc::clone(&server));
    ws.on_upgrade(move |socket| async move {
        handle_socket(socket, peer, Arc::clone(&slot.0)).await;
        drop(slot);
    })
}

struct Slot<C: PoolConnector>(Arc<ProxyServer<C>>);

impl<C: PoolConnector> Drop for Slot<C> {
    fn drop(&mut self) {
        self.0.release();
    }
}

async fn handle_socket<C: PoolConnector>(socket: WebSocket, peer: SocketAddr, server: Arc<ProxyServer<C>>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

    // One WebSocket text frame per pool line
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let reader = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!("[Client] Non-UTF8 binary frame dropped");
                        continue;
                    }
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            };
            if in_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let session = ConnectionSession::new(
        Arc::clone(&server.ctx),
        Arc::clone(&server.connector),
        peer.to_string(),
        out_tx,
    );
    let summary = session.run(in_rx).await;
    tracing::debug!(
        "[Session] {} finished: {} pool connects, cursor {}",
        summary.session_id,
        summary.upstream_connects,
        summary.fallback_cursor
    );

    reader.abort();
    // The session dropped its sender, so the writer drains and closes
    let _ = writer.await;
}

async fn api_health<C: PoolConnector>(State(server): State<Arc<ProxyServer<C>>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": server.active_connections(),
        "sessions": metrics::active_session_count(),
        "max_connections": server.max_connections,
        "pools": server.ctx.registry.keys(),
        "fee_enabled": server.ctx.fee.is_some(),
        "uptime_secs": chrono::Utc::now().timestamp() - server.started_at,
    }))
}

async fn api_metrics() -> impl IntoResponse {
    let body = metrics::render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Ctrl-C everywhere, plus SIGTERM on Unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
                    _ = ctrl_c => tracing::info!("SIGINT received, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {}", e);
                let _ = ctrl_c.await;
                tracing::info!("SIGINT received, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl+C received, shutting down");
    }
}
