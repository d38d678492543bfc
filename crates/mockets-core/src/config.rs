//! Configuration system for Mockets.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MOCKETS_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/mockets/config.toml
//!   3. ~/.config/mockets/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{
    DEFAULT_COOKIE_LIFESPAN_MS, DEFAULT_MAXIMUM_WINDOW_SIZE, DEFAULT_MTU, DEFAULT_SECURE_MTU,
    DEFAULT_REORDER_WINDOW, DEFAULT_UNRELIABLE_SEQUENCED_DELIVERY_TIMEOUT_MS, MAXIMUM_MTU,
};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MocketsConfig {
    pub network: NetworkConfig,
    pub handshake: HandshakeConfig,
    pub security: SecurityConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the listener binds. Port 0 = OS-assigned.
    pub listen_addr: SocketAddr,
    /// Packet MTU, capped at 2048.
    pub mtu: usize,
    /// SO_RCVBUF in bytes. 0 = OS default.
    pub receive_buffer_size: usize,
    /// Receive timeout of the accept loop, so close is noticed.
    pub accept_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeMode {
    /// Init / InitAck / CookieEcho / CookieAck.
    Cookie,
    /// SimpleConnect / SimpleConnectAck.
    Simple,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub mode: HandshakeMode,
    pub cookie_lifespan_ms: i64,
    /// Upper bound on live CookieRec entries.
    pub cookie_table_capacity: usize,
    pub connect_timeout_ms: u64,
    pub retransmit_interval_ms: u64,
    /// Window advertised in handshake replies.
    pub maximum_window_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Wrap every transport in the secure channel.
    pub enabled: bool,
    /// Path to the X25519 keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
    /// Receive timeouts tolerated before a handshake is abandoned.
    pub handshake_attempts: u32,
    pub handshake_interval_ms: u64,
    /// Largest ciphertext unit once the handshake is over.
    pub mtu: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Base wait before an unreliable-sequenced gap is skipped.
    pub unreliable_sequenced_timeout_ms: u64,
    /// Age after which incomplete unreliable-unsequenced fragments are dropped.
    pub unsequenced_fragment_expiry_ms: u64,
    /// Default wait for receive calls. Negative = block, 0 = poll.
    pub receive_timeout_ms: i64,
    /// TSNs past the next expected one a sequenced flow will hold.
    pub reorder_window: u32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4000)),
            mtu: DEFAULT_MTU,
            receive_buffer_size: 0,
            accept_poll_interval_ms: 1000,
        }
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            mode: HandshakeMode::Cookie,
            cookie_lifespan_ms: DEFAULT_COOKIE_LIFESPAN_MS,
            cookie_table_capacity: 1024,
            connect_timeout_ms: 30_000,
            retransmit_interval_ms: 500,
            maximum_window_size: DEFAULT_MAXIMUM_WINDOW_SIZE,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keypair_path: config_dir().join("keypair"),
            handshake_attempts: 20,
            handshake_interval_ms: 240,
            mtu: DEFAULT_SECURE_MTU,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            unreliable_sequenced_timeout_ms: DEFAULT_UNRELIABLE_SEQUENCED_DELIVERY_TIMEOUT_MS,
            unsequenced_fragment_expiry_ms: 3_000,
            receive_timeout_ms: -1,
            reorder_window: DEFAULT_REORDER_WINDOW,
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl NetworkConfig {
    /// MTU clamped to the protocol maximum.
    pub fn effective_mtu(&self) -> usize {
        self.mtu.min(MAXIMUM_MTU)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms.max(1))
    }
}

impl HandshakeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms.max(1))
    }
}

impl SecurityConfig {
    pub fn handshake_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_interval_ms.max(1))
    }
}

impl DeliveryConfig {
    pub fn unreliable_sequenced_timeout(&self) -> Duration {
        Duration::from_millis(self.unreliable_sequenced_timeout_ms)
    }

    pub fn unsequenced_fragment_expiry(&self) -> Duration {
        Duration::from_millis(self.unsequenced_fragment_expiry_ms)
    }

    /// Reorder window, at least one TSN.
    pub fn effective_reorder_window(&self) -> u32 {
        self.reorder_window.max(1)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("mockets")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MocketsConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            MocketsConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MOCKETS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    fn write_default_to(path: &std::path::Path) -> Result<(), ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            let text = toml::to_string_pretty(&MocketsConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(path, text)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        Ok(())
    }

    /// Apply MOCKETS_* overrides. `lookup` resolves a variable name; unset or
    /// unparsable values leave the key untouched.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
            v.and_then(|s| s.parse().ok())
        }
        fn flag(v: Option<String>) -> Option<bool> {
            v.map(|s| s == "true" || s == "1")
        }

        if let Some(v) = parse(lookup("MOCKETS_NETWORK__LISTEN_ADDR")) {
            self.network.listen_addr = v;
        }
        if let Some(v) = parse(lookup("MOCKETS_NETWORK__MTU")) {
            self.network.mtu = v;
        }
        if let Some(v) = parse(lookup("MOCKETS_NETWORK__RECEIVE_BUFFER_SIZE")) {
            self.network.receive_buffer_size = v;
        }
        if let Some(v) = lookup("MOCKETS_HANDSHAKE__MODE") {
            match v.as_str() {
                "cookie" => self.handshake.mode = HandshakeMode::Cookie,
                "simple" => self.handshake.mode = HandshakeMode::Simple,
                _ => {}
            }
        }
        if let Some(v) = parse(lookup("MOCKETS_HANDSHAKE__COOKIE_LIFESPAN_MS")) {
            self.handshake.cookie_lifespan_ms = v;
        }
        if let Some(v) = parse(lookup("MOCKETS_HANDSHAKE__CONNECT_TIMEOUT_MS")) {
            self.handshake.connect_timeout_ms = v;
        }
        if let Some(v) = flag(lookup("MOCKETS_SECURITY__ENABLED")) {
            self.security.enabled = v;
        }
        if let Some(v) = lookup("MOCKETS_SECURITY__KEYPAIR_PATH") {
            self.security.keypair_path = PathBuf::from(v);
        }
        if let Some(v) = parse(lookup("MOCKETS_DELIVERY__UNRELIABLE_SEQUENCED_TIMEOUT_MS")) {
            self.delivery.unreliable_sequenced_timeout_ms = v;
        }
        if let Some(v) = parse(lookup("MOCKETS_DELIVERY__RECEIVE_TIMEOUT_MS")) {
            self.delivery.receive_timeout_ms = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = MocketsConfig::default();
        assert_eq!(config.network.mtu, 1450);
        assert_eq!(config.network.listen_addr.port(), 4000);
        assert_eq!(config.handshake.mode, HandshakeMode::Cookie);
        assert_eq!(config.handshake.cookie_lifespan_ms, 60_000);
        assert_eq!(config.handshake.maximum_window_size, 262_144);
        assert!(!config.security.enabled);
        assert_eq!(config.security.mtu, 1400);
        assert_eq!(config.delivery.unreliable_sequenced_timeout_ms, 3_000);
        assert_eq!(config.delivery.receive_timeout_ms, -1);
        assert_eq!(config.delivery.effective_reorder_window(), 4096);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = MocketsConfig::from_toml(
            r#"
            [handshake]
            mode = "simple"

            [network]
            mtu = 1200
            "#,
        )
        .unwrap();
        assert_eq!(config.handshake.mode, HandshakeMode::Simple);
        assert_eq!(config.network.mtu, 1200);
        assert_eq!(config.handshake.cookie_table_capacity, 1024);
        assert_eq!(config.security.handshake_attempts, 20);
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("MOCKETS_NETWORK__LISTEN_ADDR", "127.0.0.1:5000"),
            ("MOCKETS_HANDSHAKE__MODE", "simple"),
            ("MOCKETS_SECURITY__ENABLED", "1"),
            ("MOCKETS_NETWORK__MTU", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = MocketsConfig::default();
        config.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.network.listen_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.handshake.mode, HandshakeMode::Simple);
        assert!(config.security.enabled);
        assert_eq!(config.network.mtu, 1450);
    }

    #[test]
    fn mtu_is_clamped() {
        let mut config = MocketsConfig::default();
        config.network.mtu = 9000;
        assert_eq!(config.network.effective_mtu(), MAXIMUM_MTU);
    }

    #[test]
    fn write_default_creates_loadable_file() {
        let tmp = std::env::temp_dir().join(format!("mockets-config-test-{}", std::process::id()));
        let path = tmp.join("config.toml");
        MocketsConfig::write_default_to(&path).expect("write default");
        assert!(path.exists());

        let text = std::fs::read_to_string(&path).unwrap();
        let config = MocketsConfig::from_toml(&text).expect("parse default");
        assert_eq!(config.network.mtu, DEFAULT_MTU);
        assert_eq!(config.handshake.mode, HandshakeMode::Cookie);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
