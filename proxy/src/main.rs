// Stratum WebSocket proxy
//
// Browser miners connect over WebSocket; each session is relayed to a raw
// TCP Stratum pool with per-coin failover and dev fee cycling.

use std::sync::Arc;
use stratum_ws_proxy::config::ProxyConfig;
use stratum_ws_proxy::server::ProxyServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cfg = ProxyConfig::load()?;
    let registry = cfg.registry();

    tracing::info!("🚀 Stratum WebSocket proxy v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("📡 Listening on ws://{}", cfg.listen_addr());
    tracing::info!("📦 Pools: {}", registry.keys().join(", "));
    tracing::info!("🔗 Fallback chains: {}", registry.coins().join(", "));
    if cfg.fee.is_active() {
        tracing::info!(
            "💎 Dev fee: {:.1}% ({}s of every {}s)",
            cfg.fee.percent(),
            cfg.fee.fee_secs,
            cfg.fee.cycle_secs
        );
    } else if cfg.fee.enabled {
        tracing::warn!("⚠️ Dev fee wallet not configured, fee cycling disabled (set PROXY_FEE_WALLET)");
    } else {
        tracing::info!("Dev fee disabled");
    }

    let server = Arc::new(ProxyServer::new(&cfg));
    server.start(&cfg.listen_addr()).await
}
