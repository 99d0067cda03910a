/// Error types for the proxy
///
/// ConfigError is fatal at startup. ProxyError never leaves the session that
/// produced it.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid value '{value}' for {name}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("{field} = {value} exceeds the maximum of {max}")]
    OutOfRange { field: &'static str, value: u64, max: u64 },

    #[error("fee duration {fee_secs}s must be shorter than cycle {cycle_secs}s")]
    InvalidFeeCycle { cycle_secs: u64, fee_secs: u64 },

    #[error("fallback chain for '{0}' is empty")]
    EmptyChain(String),

    #[error("fallback chain for '{coin}' references unknown pool '{key}'")]
    UnknownPool { coin: String, key: String },

    #[error("no fallback chain configured for default coin '{0}'")]
    MissingDefaultChain(String),

    #[error("pending_queue_limit must be at least 1")]
    ZeroQueueLimit,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("pool closed the connection")]
    UpstreamClosed,

    #[error("all pools for '{coin}' are unreachable")]
    ChainExhausted { coin: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
