use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use prometheus::core::Collector;
use std::sync::OnceLock;

static SESSIONS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static CONNECT_ATTEMPTS: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_CONNECTS: OnceLock<IntCounter> = OnceLock::new();
static UPSTREAM_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static FAILOVERS: OnceLock<IntCounter> = OnceLock::new();
static CHAINS_EXHAUSTED: OnceLock<IntCounter> = OnceLock::new();

static CLIENT_FRAMES: OnceLock<IntCounter> = OnceLock::new();
static POOL_FRAMES: OnceLock<IntCounter> = OnceLock::new();
static MALFORMED_FRAMES: OnceLock<IntCounter> = OnceLock::new();
static QUEUE_OVERFLOWS: OnceLock<IntCounter> = OnceLock::new();
static FEE_FLIPS: OnceLock<IntCounter> = OnceLock::new();
static REJECTED_UPGRADES: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static UPSTREAM_OPEN: OnceLock<IntGauge> = OnceLock::new();

fn sessions_total() -> &'static IntCounter {
    SESSIONS_TOTAL.get_or_init(|| IntCounter::new("proxy_sessions_total", "Total client sessions").unwrap())
}

fn connect_attempts() -> &'static IntCounter {
    CONNECT_ATTEMPTS.get_or_init(|| {
        IntCounter::new(
            "proxy_pool_connect_attempts_total",
            "Total pool connection attempts",
        )
        .unwrap()
    })
}

fn upstream_connects() -> &'static IntCounter {
    UPSTREAM_CONNECTS.get_or_init(|| {
        IntCounter::new("proxy_pool_connects_total", "Total successful pool connections").unwrap()
    })
}

fn upstream_failures() -> &'static IntCounter {
    UPSTREAM_FAILURES.get_or_init(|| {
        IntCounter::new(
            "proxy_pool_failures_total",
            "Pool connect errors, timeouts and disconnects",
        )
        .unwrap()
    })
}

fn failovers() -> &'static IntCounter {
    FAILOVERS.get_or_init(|| IntCounter::new("proxy_failovers_total", "Moves to the next fallback pool").unwrap())
}

fn chains_exhausted() -> &'static IntCounter {
    CHAINS_EXHAUSTED.get_or_init(|| {
        IntCounter::new(
            "proxy_chains_exhausted_total",
            "Sessions closed after every fallback pool failed",
        )
        .unwrap()
    })
}

fn client_frames() -> &'static IntCounter {
    CLIENT_FRAMES
        .get_or_init(|| IntCounter::new("proxy_client_frames_total", "Client frames accepted").unwrap())
}

fn pool_frames() -> &'static IntCounter {
    POOL_FRAMES
        .get_or_init(|| IntCounter::new("proxy_pool_frames_total", "Pool frames relayed to clients").unwrap())
}

fn malformed_frames() -> &'static IntCounter {
    MALFORMED_FRAMES.get_or_init(|| {
        IntCounter::new("proxy_malformed_frames_total", "Client frames dropped as invalid").unwrap()
    })
}

fn queue_overflows() -> &'static IntCounter {
    QUEUE_OVERFLOWS.get_or_init(|| {
        IntCounter::new(
            "proxy_queue_overflows_total",
            "Frames rejected or evicted by a full pending queue",
        )
        .unwrap()
    })
}

fn fee_flips() -> &'static IntCounter {
    FEE_FLIPS.get_or_init(|| IntCounter::new("proxy_fee_flips_total", "Dev fee phase changes").unwrap())
}

fn rejected_upgrades() -> &'static IntCounter {
    REJECTED_UPGRADES.get_or_init(|| {
        IntCounter::new(
            "proxy_rejected_upgrades_total",
            "WebSocket upgrades refused at the connection limit",
        )
        .unwrap()
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| IntGauge::new("proxy_active_sessions", "Open client sessions").unwrap())
}

fn upstream_open() -> &'static IntGauge {
    UPSTREAM_OPEN.get_or_init(|| IntGauge::new("proxy_pool_connections_open", "Open pool connections").unwrap())
}

pub fn inc_sessions() {
    sessions_total().inc();
    active_sessions().inc();
}

pub fn dec_sessions() {
    active_sessions().dec();
}

pub fn inc_connect_attempts() {
    connect_attempts().inc();
}

pub fn inc_upstream_connects() {
    upstream_connects().inc();
}

pub fn inc_upstream_failures() {
    upstream_failures().inc();
}

pub fn inc_failovers() {
    failovers().inc();
}

pub fn inc_chains_exhausted() {
    chains_exhausted().inc();
}

pub fn inc_client_frames() {
    client_frames().inc();
}

pub fn inc_pool_frames() {
    pool_frames().inc();
}

pub fn inc_malformed_frames() {
    malformed_frames().inc();
}

pub fn inc_queue_overflows() {
    queue_overflows().inc();
}

pub fn inc_fee_flips() {
    fee_flips().inc();
}

pub fn inc_rejected_upgrades() {
    rejected_upgrades().inc();
}

pub fn inc_upstream_open() {
    upstream_open().inc();
}

pub fn dec_upstream_open() {
    upstream_open().dec();
}

pub fn active_session_count() -> i64 {
    active_sessions().get()
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(sessions_total().collect());
    mfs.extend(connect_attempts().collect());
    mfs.extend(upstream_connects().collect());
    mfs.extend(upstream_failures().collect());
    mfs.extend(failovers().collect());
    mfs.extend(chains_exhausted().collect());
    mfs.extend(client_frames().collect());
    mfs.extend(pool_frames().collect());
    mfs.extend(malformed_frames().collect());
    mfs.extend(queue_overflows().collect());
    mfs.extend(fee_flips().collect());
    mfs.extend(rejected_upgrades().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(upstream_open().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
