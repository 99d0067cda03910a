pub mod stratum;
pub mod metrics;
pub mod config;
pub mod error;
pub mod registry;
pub mod fee;
pub mod upstream;
pub mod session;
pub mod server;

pub use config::ProxyConfig;
pub use server::ProxyServer;
