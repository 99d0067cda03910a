use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::fee::{FeeSchedule, Identity};
use crate::registry::{self, PoolPreset, PoolRegistry, DEFAULT_COIN};

/// Placeholder operator wallet; fee cycling stays off until it is replaced.
/// Read from PROXY_FEE_WALLET or the config file.
const FALLBACK_FEE_WALLET: &str = "YOUR_XMR_WALLET_ADDRESS";

pub fn default_fee_wallet() -> String {
    std::env::var("PROXY_FEE_WALLET").unwrap_or_else(|_| FALLBACK_FEE_WALLET.to_string())
}

// Upper bounds keep every timer deadline representable
const MAX_RETRY_DELAY_MS: u64 = 60 * 60 * 1000;
const MAX_CONNECT_TIMEOUT_SECS: u64 = 60 * 60;
const MAX_FEE_CYCLE_SECS: u64 = 30 * 24 * 60 * 60;

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidEnv { name, value })
}

fn check_max(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::OutOfRange { field, value, max });
    }
    Ok(())
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflow {
    /// Refuse the incoming frame and answer it with an error.
    #[default]
    RejectNewest,
    /// Evict the oldest queued frame (never the login) to make room.
    DropOldest,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownMethodPolicy {
    #[default]
    Forward,
    Drop,
}

#[derive(Deserialize, Clone, Debug)]
pub struct FeeSettings {
    #[serde(default = "default_fee_enabled")]
    pub enabled: bool,
    #[serde(default = "default_fee_wallet")]
    pub wallet: String,
    #[serde(default = "default_fee_worker")]
    pub worker: String,
    /// Full user + fee cycle, in seconds.
    #[serde(default = "default_cycle_secs")]
    pub cycle_secs: u64,
    /// Operator share of each cycle, in seconds.
    #[serde(default = "default_fee_secs")]
    pub fee_secs: u64,
}

fn default_fee_enabled() -> bool { true }
fn default_fee_worker() -> String { "webfee".to_string() }
fn default_cycle_secs() -> u64 { 6000 }
fn default_fee_secs() -> u64 { 60 }

impl Default for FeeSettings {
    fn default() -> Self {
        // 100 minutes per cycle, 1 minute to the operator (1%)
        Self {
            enabled: true,
            wallet: default_fee_wallet(),
            worker: default_fee_worker(),
            cycle_secs: default_cycle_secs(),
            fee_secs: default_fee_secs(),
        }
    }
}

impl FeeSettings {
    /// Cycling runs only with a real operator wallet and a non-zero fee slice.
    pub fn is_active(&self) -> bool {
        self.enabled
            && self.fee_secs > 0
            && !self.wallet.is_empty()
            && self.wallet != FALLBACK_FEE_WALLET
    }

    pub fn percent(&self) -> f64 {
        if self.cycle_secs == 0 {
            return 0.0;
        }
        self.fee_secs as f64 * 100.0 / self.cycle_secs as f64
    }

    pub fn identity(&self) -> Identity {
        Identity::new(self.wallet.clone(), self.worker.clone())
    }

    pub fn schedule(&self) -> FeeSchedule {
        FeeSchedule::new(
            Duration::from_secs(self.cycle_secs.saturating_sub(self.fee_secs)),
            Duration::from_secs(self.fee_secs),
        )
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_host: String,
    pub port: u16,
    pub retry_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub pending_queue_limit: usize,
    pub queue_overflow: QueueOverflow,
    pub unknown_methods: UnknownMethodPolicy,
    pub max_connections: usize,
    pub max_line_bytes: usize,
    pub fee: FeeSettings,
    pub pools: HashMap<String, PoolPreset>,
    pub fallback: HashMap<String, Vec<String>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            port: 3333,
            retry_delay_ms: 1000,
            connect_timeout_secs: 10,
            pending_queue_limit: 64,
            queue_overflow: QueueOverflow::default(),
            unknown_methods: UnknownMethodPolicy::default(),
            max_connections: 10_000,
            max_line_bytes: 256 * 1024,
            fee: FeeSettings::default(),
            pools: registry::default_presets(),
            fallback: registry::default_chains(),
        }
    }
}

impl ProxyConfig {
    /// Defaults, then config file, then env, then `[port]` from argv.
    pub fn load() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var("PROXY_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if std::path::Path::new("proxy_config.json").exists() => {
                Self::from_file("proxy_config.json")?
            }
            Err(_) => Self::default(),
        };

        if let Ok(h) = std::env::var("PROXY_HOST") { cfg.listen_host = h; }
        if let Ok(p) = std::env::var("PROXY_PORT") {
            cfg.port = p.parse().map_err(|_| ConfigError::InvalidPort(p))?;
        }
        if let Ok(d) = std::env::var("PROXY_RETRY_DELAY_MS") {
            cfg.retry_delay_ms = parse_env("PROXY_RETRY_DELAY_MS", d)?;
        }
        if let Ok(l) = std::env::var("PROXY_PENDING_LIMIT") {
            cfg.pending_queue_limit = parse_env("PROXY_PENDING_LIMIT", l)?;
        }
        if let Ok(e) = std::env::var("PROXY_FEE_ENABLED") {
            cfg.fee.enabled = matches!(e.as_str(), "1" | "true" | "TRUE" | "yes" | "YES");
        }
        if let Ok(w) = std::env::var("PROXY_FEE_WALLET") { cfg.fee.wallet = w; }
        if let Ok(w) = std::env::var("PROXY_FEE_WORKER") { cfg.fee.worker = w; }

        // Usage: stratum-ws-proxy [port]
        if let Some(arg) = std::env::args().nth(1) {
            cfg.port = arg.parse().map_err(|_| ConfigError::InvalidPort(arg))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let cfg = Self::from_json(&txt).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
        tracing::info!("✅ Loaded proxy config from {}", path);
        Ok(cfg)
    }

    pub fn from_json(txt: &str) -> Result<Self, serde_json::Error> {
        let mut cfg: Self = serde_json::from_str(txt)?;
        // Preset keys live in the map; fill them in so file entries may omit them.
        for (key, preset) in cfg.pools.iter_mut() {
            if preset.key.is_empty() {
                preset.key = key.clone();
            }
        }
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_max("retry_delay_ms", self.retry_delay_ms, MAX_RETRY_DELAY_MS)?;
        check_max("connect_timeout_secs", self.connect_timeout_secs, MAX_CONNECT_TIMEOUT_SECS)?;
        check_max("fee.cycle_secs", self.fee.cycle_secs, MAX_FEE_CYCLE_SECS)?;
        if self.fee.fee_secs >= self.fee.cycle_secs {
            return Err(ConfigError::InvalidFeeCycle {
                cycle_secs: self.fee.cycle_secs,
                fee_secs: self.fee.fee_secs,
            });
        }
        if self.pending_queue_limit == 0 {
            return Err(ConfigError::ZeroQueueLimit);
        }
        if !self.fallback.contains_key(DEFAULT_COIN) {
            return Err(ConfigError::MissingDefaultChain(DEFAULT_COIN.to_string()));
        }
        for (coin, keys) in &self.fallback {
            if keys.is_empty() {
                return Err(ConfigError::EmptyChain(coin.clone()));
            }
            if let Some(key) = keys.iter().find(|k| !self.pools.contains_key(*k)) {
                return Err(ConfigError::UnknownPool {
                    coin: coin.clone(),
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> PoolRegistry {
        PoolRegistry::new(self.pools.clone(), self.fallback.clone())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.port)
    }
}
