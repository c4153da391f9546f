// ============================
// chat-backend-lib/src/config.rs
// ============================
//! Configuration management.
use std::net::SocketAddr;
use std::path::Path;

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level filter used when RUST_LOG is unset
    pub log_level: String,
    /// Default number of messages returned by a history fetch
    pub history_limit: usize,
    /// Seconds before an unrefreshed typing indicator expires
    pub typing_expiry_secs: u64,
    /// Capacity of each connection's outbound event channel
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().expect("valid default address"),
            log_level: "info".to_string(),
            history_limit: 50,
            typing_expiry_secs: 3,
            event_buffer: 32,
        }
    }
}

impl Settings {
    /// Load settings: defaults, overridden by `chat.toml` if present,
    /// overridden by `CHAT_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("chat.toml")
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CHAT_"))
            .extract()?;
        Ok(settings)
    }
}
