/// Pool presets and per-coin fallback chains
///
/// Built once from config and shared read-only by every session.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coin used when a login names no coin or one without a chain.
pub const DEFAULT_COIN: &str = "monero";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolPreset {
    /// Filled from the table key when a config file omits it.
    #[serde(default)]
    pub key: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub display_name: String,
    pub coin: String,
    #[serde(default)]
    pub is_daemon: bool,
}

impl PoolPreset {
    /// `host:port` form accepted by `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub struct PoolRegistry {
    presets: HashMap<String, PoolPreset>,
    chains: HashMap<String, Vec<String>>,
}

impl PoolRegistry {
    /// Callers validate the tables first (see `ProxyConfig::validate`).
    pub fn new(presets: HashMap<String, PoolPreset>, chains: HashMap<String, Vec<String>>) -> Self {
        Self { presets, chains }
    }

    pub fn resolve(&self, key: &str) -> Option<&PoolPreset> {
        self.presets.get(key)
    }

    /// Ordered presets for `coin`, falling back to the monero chain.
    pub fn fallback_chain(&self, coin: &str) -> Vec<PoolPreset> {
        let keys = self
            .chains
            .get(coin)
            .or_else(|| self.chains.get(DEFAULT_COIN))
            .map(Vec::as_slice)
            .unwrap_or_default();

        keys.iter()
            .filter_map(|k| self.presets.get(k).cloned())
            .collect()
    }

    /// Chain a session walks for one login.
    ///
    /// A known key goes first, followed by the rest of its own coin's chain.
    /// An unknown (or missing) key yields the requested coin's chain.
    pub fn chain_for_login(&self, pool_key: Option<&str>, coin: &str) -> Vec<PoolPreset> {
        match pool_key.and_then(|k| self.resolve(k)) {
            Some(preset) => {
                let mut chain = vec![preset.clone()];
                chain.extend(
                    self.fallback_chain(&preset.coin)
                        .into_iter()
                        .filter(|p| p.key != preset.key),
                );
                chain
            }
            None => self.fallback_chain(coin),
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.presets.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn coins(&self) -> Vec<&str> {
        let mut coins: Vec<&str> = self.chains.keys().map(String::as_str).collect();
        coins.sort_unstable();
        coins
    }
}

/// Algorithm name a coin's pools expect, for logging only.
pub fn algorithm_hint(coin: &str) -> &'static str {
    match coin {
        "wownero" => "rx/wow",
        "dero" => "astrobwt/v3",
        _ => "rx/0",
    }
}

fn preset(key: &str, host: &str, port: u16, name: &str, coin: &str, is_daemon: bool) -> (String, PoolPreset) {
    (
        key.to_string(),
        PoolPreset {
            key: key.to_string(),
            host: host.to_string(),
            port,
            display_name: name.to_string(),
            coin: coin.to_string(),
            is_daemon,
        },
    )
}

/// Built-in preset table used when the config file supplies none.
pub fn default_presets() -> HashMap<String, PoolPreset> {
    HashMap::from([
        // Monero (XMR)
        preset("moneroocean", "gulf.moneroocean.stream", 10128, "MoneroOcean", "monero", false),
        preset("supportxmr", "pool.supportxmr.com", 3333, "SupportXMR", "monero", false),
        preset("hashvault", "pool.hashvault.pro", 3333, "HashVault", "monero", false),
        preset("2miners", "xmr.2miners.com", 2222, "2Miners", "monero", false),
        // Wownero (WOW)
        preset("herominers-wow", "wownero.herominers.com", 1111, "HeroMiners WOW", "wownero", false),
        preset("moneroocean-wow", "gulf.moneroocean.stream", 10128, "MoneroOcean WOW", "wownero", false),
        // Dero nodes
        preset("dero-official", "minernode1.dero.io", 10100, "DERO Official", "dero", true),
        preset("dero-community", "dero-node.mysrv.cloud", 10100, "DERO Community", "dero", true),
    ])
}

pub fn default_chains() -> HashMap<String, Vec<String>> {
    let chain = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect::<Vec<_>>();
    HashMap::from([
        ("monero".to_string(), chain(&["supportxmr", "hashvault", "2miners"])),
        ("wownero".to_string(), chain(&["herominers-wow", "moneroocean-wow"])),
        ("dero".to_string(), chain(&["dero-official", "dero-community"])),
    ])
}
