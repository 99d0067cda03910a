/// One browser connection and its pool connection
///
/// A `ConnectionSession` is owned by a single task. Every input (client
/// frame, pool bytes, connect result, retry timer, fee timer) arrives as an
/// `Event` from one `select!`, and only the event handlers open or close
/// sockets and timers. Dropping the session releases everything it holds.
///
/// State machine:
///   AwaitingLogin --login--> Connecting --ok--> Relaying
///   Connecting/Relaying --pool error--> Connecting (next preset, after
///   retry delay) or Closed (chain exhausted)
///   any --client gone--> Closed
///
/// Fee cycling re-authenticates: at each phase flip while relaying, the
/// session drops the pool socket and reconnects to the same preset, and the
/// stored login is replayed with the newly active identity.

use bytes::BytesMut;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ProxyConfig, QueueOverflow, UnknownMethodPolicy};
use crate::error::ProxyError;
use crate::fee::{FeePhase, FeeSchedule, FeeScheduler, Identity};
use crate::metrics::prometheus as metrics;
use crate::registry::{algorithm_hint, PoolPreset, PoolRegistry};
use crate::stratum::framer::truncate;
use crate::stratum::protocol::{ClientCall, ClientFrame, LoginParams, StratumError, StratumResponse};
use crate::upstream::{connect_with_timeout, PoolConnector, Upstream};

pub mod pending;

use self::pending::{PendingQueue, PushOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingLogin,
    Connecting,
    Relaying,
    Closed,
}

/// Operator identity and its schedule. Absent when the fee is off.
#[derive(Debug, Clone)]
pub struct FeePlan {
    pub schedule: FeeSchedule,
    pub identity: Identity,
}

/// Read-only state shared by every session.
pub struct SessionContext {
    pub registry: PoolRegistry,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub max_line_bytes: usize,
    pub pending_limit: usize,
    pub queue_overflow: QueueOverflow,
    pub unknown_methods: UnknownMethodPolicy,
    pub fee: Option<FeePlan>,
}

impl SessionContext {
    pub fn from_config(cfg: &ProxyConfig) -> Self {
        let fee = cfg.fee.is_active().then(|| FeePlan {
            schedule: cfg.fee.schedule(),
            identity: cfg.fee.identity(),
        });
        Self {
            registry: cfg.registry(),
            retry_delay: cfg.retry_delay(),
            connect_timeout: cfg.connect_timeout(),
            max_line_bytes: cfg.max_line_bytes,
            pending_limit: cfg.pending_queue_limit,
            queue_overflow: cfg.queue_overflow,
            unknown_methods: cfg.unknown_methods,
            fee,
        }
    }
}

/// What a finished session left behind. Both flags are false after a
/// correct teardown.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub upstream_connects: usize,
    pub fallback_cursor: usize,
    pub upstream_open: bool,
    pub fee_timer_armed: bool,
    pub duration: Duration,
}

type ConnectFuture<S> = Pin<Box<dyn Future<Output = Result<S, ProxyError>> + Send>>;

enum Event<S> {
    Client(Option<String>),
    Connected(Result<S, ProxyError>),
    PoolData(Result<BytesMut, ProxyError>),
    RetryDue,
    FeeDue,
}

pub struct ConnectionSession<C: PoolConnector> {
    id: String,
    peer: String,
    ctx: Arc<SessionContext>,
    connector: Arc<C>,
    outbound: mpsc::UnboundedSender<String>,

    state: SessionState,
    upstream: Option<Upstream<C::Stream>>,
    connecting: Option<ConnectFuture<C::Stream>>,
    retry_at: Option<Instant>,
    pending: PendingQueue,

    selected_pool_key: Option<String>,
    coin: String,
    chain: Vec<PoolPreset>,
    fallback_cursor: usize,
    upstream_connects: usize,

    user_identity: Option<Identity>,
    login: Option<ClientFrame>,
    fee_timer: Option<FeeScheduler>,
    fee_deadline: Option<Instant>,

    started: Instant,
}

impl<C: PoolConnector> ConnectionSession<C> {
    pub fn new(
        ctx: Arc<SessionContext>,
        connector: Arc<C>,
        peer: impl Into<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        let pending = PendingQueue::new(ctx.pending_limit, ctx.queue_overflow);
        Self {
            id: Uuid::new_v4().to_string(),
            peer: peer.into(),
            ctx,
            connector,
            outbound,
            state: SessionState::AwaitingLogin,
            upstream: None,
            connecting: None,
            retry_at: None,
            pending,
            selected_pool_key: None,
            coin: String::new(),
            chain: Vec::new(),
            fallback_cursor: 0,
            upstream_connects: 0,
            user_identity: None,
            login: None,
            fee_timer: None,
            fee_deadline: None,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn fallback_cursor(&self) -> usize {
        self.fallback_cursor
    }

    pub fn selected_pool_key(&self) -> Option<&str> {
        self.selected_pool_key.as_deref()
    }

    pub fn fee_active(&self) -> bool {
        self.fee_timer.as_ref().is_some_and(FeeScheduler::is_fee_active)
    }

    /// Drives the session until the client leaves or every pool failed.
    /// `incoming` yields client text frames; `None` means the client is gone.
    pub async fn run(mut self, mut incoming: mpsc::Receiver<String>) -> SessionSummary {
        metrics::inc_sessions();
        info!(
            "[{}] Client connected from {} (session {})",
            chrono::Utc::now().to_rfc3339(),
            self.peer,
            self.id
        );

        while self.state != SessionState::Closed {
            let event = tokio::select! {
                text = incoming.recv() => Event::Client(text),
                res = next_connect(&mut self.connecting) => Event::Connected(res),
                chunk = next_chunk(&mut self.upstream) => Event::PoolData(chunk),
                _ = sleep_until(self.retry_at) => Event::RetryDue,
                _ = sleep_until(self.fee_deadline) => Event::FeeDue,
            };
            self.handle(event).await;
        }

        self.teardown();
        metrics::dec_sessions();

        let duration = self.started.elapsed();
        info!(
            "[{}] Client disconnected (session {}: {}s)",
            chrono::Utc::now().to_rfc3339(),
            self.id,
            duration.as_secs()
        );

        SessionSummary {
            session_id: self.id.clone(),
            upstream_connects: self.upstream_connects,
            fallback_cursor: self.fallback_cursor,
            upstream_open: self.upstream.is_some() || self.connecting.is_some(),
            fee_timer_armed: self.fee_timer.is_some() || self.fee_deadline.is_some(),
            duration,
        }
    }

    async fn handle(&mut self, event: Event<C::Stream>) {
        match event {
            Event::Client(Some(text)) => self.on_client_text(&text).await,
            Event::Client(None) => {
                debug!("[Client] {} closed", self.peer);
                self.teardown();
            }
            Event::Connected(Ok(stream)) => self.on_connected(stream).await,
            Event::Connected(Err(e)) | Event::PoolData(Err(e)) => self.on_upstream_failure(e),
            Event::PoolData(Ok(chunk)) => self.on_pool_data(&chunk),
            Event::RetryDue => {
                self.retry_at = None;
                self.begin_connect();
            }
            Event::FeeDue => self.on_fee_due(),
        }
    }

    async fn on_client_text(&mut self, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("[Client] Invalid frame ({}): {}", e, truncate(text, 120));
                metrics::inc_malformed_frames();
                return;
            }
        };
        metrics::inc_client_frames();

        match frame.call.clone() {
            ClientCall::Login(params) => self.on_login(params, frame).await,
            ClientCall::Submit | ClientCall::KeepAlive | ClientCall::GetJob => {
                self.relay_or_queue(frame).await
            }
            ClientCall::Unknown(method) => match self.ctx.unknown_methods {
                UnknownMethodPolicy::Forward => {
                    debug!("[Client] Forwarding unrecognized method '{}'", method);
                    self.relay_or_queue(frame).await
                }
                UnknownMethodPolicy::Drop => {
                    warn!("[Client] Dropping unrecognized method '{}'", method);
                    self.reply(&frame.id, StratumError::method_not_supported(&method));
                }
            },
        }
    }

    async fn on_login(&mut self, params: LoginParams, frame: ClientFrame) {
        let identity = params.identity();
        info!(
            "[Client] Login request - Pool: {}, Coin: {}",
            params.pool.as_deref().unwrap_or("-"),
            params.coin()
        );
        info!("[Client] User wallet: {}...", identity.short());
        self.user_identity = Some(identity);
        self.login = Some(frame.clone());

        match self.state {
            SessionState::AwaitingLogin => {
                let requested = params.pool.as_deref();
                if let Some(key) = requested.filter(|k| self.ctx.registry.resolve(k).is_none()) {
                    info!("[Pool] Unknown pool \"{}\", using default for {}", key, params.coin());
                }
                self.selected_pool_key = params.pool.clone();
                self.chain = self.ctx.registry.chain_for_login(requested, params.coin());
                self.fallback_cursor = 0;

                let Some(head) = self.chain.first() else {
                    self.coin = params.coin().to_string();
                    self.exhaust();
                    return;
                };
                self.coin = head.coin.clone();
                info!("[Pool] ⛏️ Mining {} - Algorithm: {}", self.coin, algorithm_hint(&self.coin));

                self.pending.push_forced(frame);
                self.begin_connect();
            }
            SessionState::Connecting => self.enqueue(frame),
            SessionState::Relaying => self.write_upstream(frame).await,
            SessionState::Closed => {}
        }
    }

    async fn relay_or_queue(&mut self, frame: ClientFrame) {
        match self.state {
            SessionState::Relaying => self.write_upstream(frame).await,
            SessionState::AwaitingLogin | SessionState::Connecting => self.enqueue(frame),
            SessionState::Closed => {}
        }
    }

    fn enqueue(&mut self, frame: ClientFrame) {
        let method = frame.call.name().to_string();
        match self.pending.push(frame) {
            PushOutcome::Queued => {
                debug!("[Client → Pool] (queued) {} ({} pending)", method, self.pending.len())
            }
            PushOutcome::Rejected(rejected) => {
                warn!("[Client] Pending queue full, rejecting {}", method);
                metrics::inc_queue_overflows();
                self.reply(&rejected.id, StratumError::queue_full());
            }
            PushOutcome::Evicted(evicted) => {
                warn!("[Client] Pending queue full, dropped oldest {}", evicted.call.name());
                metrics::inc_queue_overflows();
            }
        }
    }

    /// Wire form of a client frame under the active identity.
    fn wire_line(&self, frame: &ClientFrame) -> String {
        if !frame.is_login() {
            return frame.to_line();
        }
        match (&self.fee_timer, &self.ctx.fee, &self.user_identity) {
            (Some(timer), Some(plan), Some(user)) => {
                if timer.is_fee_active() {
                    info!("[DevFee] 💎 Login uses dev wallet");
                }
                frame.to_line_as(timer.active_identity(user, &plan.identity))
            }
            _ => frame.to_line(),
        }
    }

    async fn write_upstream(&mut self, frame: ClientFrame) {
        let line = self.wire_line(&frame);
        let Some(upstream) = self.upstream.as_mut() else {
            self.enqueue(frame);
            return;
        };
        debug!("[Client → Pool] {}", truncate(line.trim_end(), 100));
        if let Err(e) = upstream.write_line(&line).await {
            // Unsent; the next pool gets it after the login
            self.pending.push_forced(frame);
            self.on_upstream_failure(e);
        }
    }

    fn begin_connect(&mut self) {
        let Some(preset) = self.chain.get(self.fallback_cursor).cloned() else {
            self.exhaust();
            return;
        };
        info!("[Pool] Connecting to {} ({})...", preset.display_name, preset.address());
        if preset.is_daemon {
            info!("[Pool] {} is a daemon endpoint", preset.key);
        }
        metrics::inc_connect_attempts();

        let connector = Arc::clone(&self.connector);
        let timeout = self.ctx.connect_timeout;
        self.connecting = Some(Box::pin(async move {
            connect_with_timeout(connector.as_ref(), &preset, timeout).await
        }));
        self.state = SessionState::Connecting;
    }

    async fn on_connected(&mut self, stream: C::Stream) {
        let Some(preset) = self.chain.get(self.fallback_cursor).cloned() else {
            return;
        };
        info!("[Pool] ✅ Connected to {}", preset.display_name);
        metrics::inc_upstream_connects();

        self.upstream = Some(Upstream::new(stream, preset, self.ctx.max_line_bytes));
        self.upstream_connects += 1;
        self.state = SessionState::Relaying;

        // A fresh pool connection must see a login before anything else
        if !self.pending.has_login() {
            if let Some(login) = self.login.clone() {
                debug!("[Pool] Replaying login on new connection");
                self.pending.push_front(login);
            }
        }

        // Frames leave the queue only once written
        while let Some(frame) = self.pending.pop_front() {
            let line = self.wire_line(&frame);
            let Some(upstream) = self.upstream.as_mut() else {
                self.pending.push_front(frame);
                return;
            };
            debug!("[Client → Pool] (flush) {}", truncate(line.trim_end(), 100));
            if let Err(e) = upstream.write_line(&line).await {
                self.pending.push_front(frame);
                self.on_upstream_failure(e);
                return;
            }
        }

        if self.fee_timer.is_none() {
            self.start_fee_timer();
        }
    }

    fn on_pool_data(&mut self, chunk: &[u8]) {
        let Some(upstream) = self.upstream.as_mut() else { return };
        for frame in upstream.reframe(chunk) {
            match frame.message.method() {
                Some("job") => info!("[Pool] 📋 New job"),
                Some(method) => debug!("[Pool → Client] {} {}", method, truncate(&frame.text, 120)),
                None => debug!("[Pool → Client] {}", truncate(&frame.text, 120)),
            }
            metrics::inc_pool_frames();
            if self.outbound.send(frame.text).is_err() {
                debug!("[Client] Writer gone, closing session {}", self.id);
                self.teardown();
                return;
            }
        }
    }

    fn on_upstream_failure(&mut self, err: ProxyError) {
        warn!("[Pool] ❌ Error: {}", err);
        metrics::inc_upstream_failures();

        self.upstream = None;
        self.connecting = None;
        self.cancel_fee_timer();

        self.fallback_cursor += 1;
        match self.chain.get(self.fallback_cursor) {
            Some(next) => {
                info!(
                    "[Pool] Trying fallback: {} in {}ms",
                    next.key,
                    self.ctx.retry_delay.as_millis()
                );
                metrics::inc_failovers();
                self.retry_at = Some(Instant::now() + self.ctx.retry_delay);
                self.state = SessionState::Connecting;
            }
            None => self.exhaust(),
        }
    }

    /// Every preset failed: tell the client, then close.
    fn exhaust(&mut self) {
        let err = ProxyError::ChainExhausted { coin: self.coin.clone() };
        error!(
            "[Pool] ❌ {} ({} tried), closing session {}",
            err,
            self.chain.len(),
            self.id
        );
        metrics::inc_chains_exhausted();

        // Answer the login if the pool never did
        let id = match (&self.login, self.upstream_connects) {
            (Some(login), 0) => login.id.clone(),
            _ => Value::Null,
        };
        self.reply(&id, StratumError::pool_unavailable(&self.coin, self.chain.len()));
        self.teardown();
    }

    fn start_fee_timer(&mut self) {
        let Some(plan) = self.ctx.fee.as_ref() else { return };
        if self.user_identity.as_ref().map_or(true, |id| id.login.is_empty()) {
            return;
        }
        let now = Instant::now();
        let timer = FeeScheduler::start(plan.schedule, now);
        self.fee_deadline = Some(timer.deadline(now));
        self.fee_timer = Some(timer);
    }

    fn cancel_fee_timer(&mut self) {
        self.fee_timer = None;
        self.fee_deadline = None;
    }

    fn on_fee_due(&mut self) {
        let now = Instant::now();
        let Some(timer) = self.fee_timer.as_mut() else {
            self.fee_deadline = None;
            return;
        };
        let flipped = timer.poll(now);
        self.fee_deadline = Some(timer.deadline(now));

        if let Some(phase) = flipped {
            metrics::inc_fee_flips();
            if self.state == SessionState::Relaying {
                self.relogin(phase);
            }
        }
    }

    /// Reconnect to the current preset so the pool sees the new identity.
    fn relogin(&mut self, phase: FeePhase) {
        info!("[DevFee] Re-authenticating upstream with {} identity", phase);
        self.upstream = None;
        self.begin_connect();
    }

    fn reply(&self, id: &Value, error: StratumError) {
        if id.is_null() && error.code != StratumError::POOL_UNAVAILABLE {
            return;
        }
        let _ = self.outbound.send(StratumResponse::error(id.clone(), error).to_text());
    }

    /// Releases the pool socket, pending connect and both timers.
    fn teardown(&mut self) {
        self.cancel_fee_timer();
        self.retry_at = None;
        self.connecting = None;
        if self.upstream.take().is_some() {
            debug!("[Pool] Connection closed for session {}", self.id);
        }
        self.pending.clear();
        self.state = SessionState::Closed;
    }
}

async fn next_connect<S>(slot: &mut Option<ConnectFuture<S>>) -> Result<S, ProxyError> {
    let Some(fut) = slot.as_mut() else {
        return std::future::pending().await;
    };
    let res = fut.await;
    *slot = None;
    res
}

async fn next_chunk<S>(slot: &mut Option<Upstream<S>>) -> Result<BytesMut, ProxyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    match slot.as_mut() {
        Some(upstream) => upstream.read_chunk().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{default_chains, default_presets};
    use async_trait::async_trait;
    use std::io;
    use tokio::io::DuplexStream;

    /// Never resolves; keeps sessions in Connecting.
    struct StalledConnector;

    #[async_trait]
    impl PoolConnector for StalledConnector {
        type Stream = DuplexStream;

        async fn connect(&self, _preset: &PoolPreset) -> io::Result<DuplexStream> {
            std::future::pending().await
        }
    }

    fn context(limit: usize, overflow: QueueOverflow, unknown: UnknownMethodPolicy) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            registry: PoolRegistry::new(default_presets(), default_chains()),
            retry_delay: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(10),
            max_line_bytes: 64 * 1024,
            pending_limit: limit,
            queue_overflow: overflow,
            unknown_methods: unknown,
            fee: None,
        })
    }

    fn session(ctx: Arc<SessionContext>) -> (ConnectionSession<StalledConnector>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionSession::new(ctx, Arc::new(StalledConnector), "127.0.0.1:50000", tx), rx)
    }

    const LOGIN: &str = r#"{"id":1,"jsonrpc":"2.0","method":"login","params":{"login":"4User","pass":"rig1","pool":"nope","coin":"wownero"}}"#;

    #[tokio::test]
    async fn test_login_resolves_chain_and_connects() {
        let (mut s, _rx) = session(context(8, QueueOverflow::RejectNewest, UnknownMethodPolicy::Forward));
        assert_eq!(s.state(), SessionState::AwaitingLogin);

        s.handle(Event::Client(Some(LOGIN.to_string()))).await;

        assert_eq!(s.state(), SessionState::Connecting);
        assert_eq!(s.selected_pool_key(), Some("nope"));
        assert_eq!(s.chain[0].key, "herominers-wow");
        assert_eq!(s.coin, "wownero");
        assert!(s.connecting.is_some());
        assert_eq!(s.pending.len(), 1);
        assert_eq!(s.user_identity, Some(Identity::new("4User", "rig1")));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let (mut s, mut rx) = session(context(8, QueueOverflow::RejectNewest, UnknownMethodPolicy::Forward));
        s.handle(Event::Client(Some("{not json".to_string()))).await;
        s.handle(Event::Client(Some(r#"{"id":4,"params":{}}"#.to_string()))).await;

        assert_eq!(s.state(), SessionState::AwaitingLogin);
        assert!(s.pending.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_queue_overflow_answers_client() {
        let (mut s, mut rx) = session(context(2, QueueOverflow::RejectNewest, UnknownMethodPolicy::Forward));
        s.handle(Event::Client(Some(LOGIN.to_string()))).await;
        for n in 2..5 {
            let submit = format!(r#"{{"id":{},"method":"submit","params":{{"job_id":"j","nonce":"00","result":"00"}}}}"#, n);
            s.handle(Event::Client(Some(submit))).await;
        }

        // login (forced) + submit 2 fill the queue; 3 and 4 bounce
        assert_eq!(s.pending.len(), 2);
        for expected in [3, 4] {
            let v: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(v["id"], expected);
            assert_eq!(v["error"]["message"], "proxy queue full");
        }
    }

    #[tokio::test]
    async fn test_unknown_method_drop_policy() {
        let (mut s, mut rx) = session(context(8, QueueOverflow::RejectNewest, UnknownMethodPolicy::Drop));
        s.handle(Event::Client(Some(r#"{"id":9,"method":"mining.hello"}"#.to_string()))).await;
        assert!(s.pending.is_empty());
        let v: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(v["error"]["code"], StratumError::INVALID_METHOD);
    }

    #[tokio::test]
    async fn test_failure_advances_cursor_then_exhausts() {
        let (mut s, mut rx) = session(context(8, QueueOverflow::RejectNewest, UnknownMethodPolicy::Forward));
        s.handle(Event::Client(Some(LOGIN.to_string()))).await;

        s.on_upstream_failure(ProxyError::UpstreamClosed);
        assert_eq!(s.fallback_cursor(), 1);
        assert_eq!(s.state(), SessionState::Connecting);
        assert!(s.retry_at.is_some());
        assert!(s.connecting.is_none());

        s.handle(Event::RetryDue).await;
        assert!(s.connecting.is_some());

        s.on_upstream_failure(ProxyError::UpstreamClosed);
        assert_eq!(s.fallback_cursor(), 2);
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.retry_at.is_none());

        let v: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(v["id"], 1);
        assert_eq!(v["error"]["code"], StratumError::POOL_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_client_close_tears_down() {
        let (mut s, _rx) = session(context(8, QueueOverflow::RejectNewest, UnknownMethodPolicy::Forward));
        s.handle(Event::Client(Some(LOGIN.to_string()))).await;
        s.handle(Event::Client(None)).await;

        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.connecting.is_none());
        assert!(s.upstream.is_none());
        assert!(s.fee_timer.is_none());
        assert!(s.pending.is_empty());
    }
}
