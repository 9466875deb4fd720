//! Platform configuration.
//!
//! A single JSON file (default `~/.noplacelike.json`) read once at boot.
//! Load order: file, then environment overrides, then CLI flags. The core
//! never writes the file after boot; only the `config` subcommand edits it.
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `NOPLACELIKE_HOST` | `server.host` |
//! | `NOPLACELIKE_PORT` | `server.port` |
//! | `NOPLACELIKE_CONFIG` | config file path |
//! | `NOPLACELIKE_LOG_LEVEL` | `log_level` |

use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

/// HTTP front door settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Maximum accepted request body, in bytes.
    pub max_body_bytes: usize,
    /// Allowed CORS origins; empty means any origin.
    pub cors_origins: Vec<String>,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_body_bytes: 16 * 1024 * 1024,
            cors_origins: Vec::new(),
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            idle_timeout_secs: 120,
        }
    }
}

/// LAN discovery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub port: u16,
    /// Address discovery requests are sent to.
    pub broadcast_addr: String,
    /// Seconds between periodic discovery passes.
    pub interval_secs: u64,
    /// How long one discovery pass collects responses.
    pub response_window_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            port: 8989,
            broadcast_addr: "255.255.255.255".to_string(),
            interval_secs: 30,
            response_window_secs: 2,
        }
    }
}

/// Peer channel settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeersSection {
    /// TCP port peers connect to for message channels.
    pub port: u16,
    pub keep_alive_secs: u64,
    /// Extra time a stale peer is kept before removal.
    pub grace_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for PeersSection {
    fn default() -> Self {
        Self {
            port: 8990,
            keep_alive_secs: 10,
            grace_secs: 10,
            write_timeout_secs: 5,
        }
    }
}

/// Token issuing and channel crypto.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// HMAC secret tokens are signed with. Generated on first run.
    pub secret: String,
    /// Static credential accepted by the token-issuing endpoint.
    pub bootstrap_token: String,
    /// Default token lifetime, in seconds.
    pub token_ttl_secs: u64,
    /// Encrypt peer channels with a key derived from `secret`.
    pub channel_crypto: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret: String::new(),
            bootstrap_token: String::new(),
            token_ttl_secs: 3600,
            channel_crypto: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub enabled: bool,
    /// Requests allowed per window, per remote address.
    pub max_requests: u64,
    pub window_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: 120,
            window_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Per-subscription buffer capacity before drop-oldest kicks in.
    pub buffer_capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
        }
    }
}

/// Root configuration document.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Instance display name; defaults to the hostname at boot.
    pub name: String,
    pub log_level: String,
    pub server: ServerSection,
    pub discovery: DiscoverySection,
    pub peers: PeersSection,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitSection,
    pub events: EventsSection,
    /// Directories exposed by the file-sharing plugin; edited by
    /// `noplacelike config --add-dir / --clear-dirs`.
    pub shared_dirs: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            log_level: "info".to_string(),
            server: ServerSection::default(),
            discovery: DiscoverySection::default(),
            peers: PeersSection::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitSection::default(),
            events: EventsSection::default(),
            shared_dirs: Vec::new(),
        }
    }
}

/// `~/.noplacelike.json`, or the current directory when no home is known.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".noplacelike.json")
}

/// Resolve the effective config path: CLI flag, `NOPLACELIKE_CONFIG`, default.
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(p) = cli {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var("NOPLACELIKE_CONFIG") {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    default_config_path()
}

fn random_credential(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

impl PlatformConfig {
    /// Load from `path`, creating the file with generated defaults when it
    /// does not exist. An unreadable or unparsable file is a fatal error.
    pub fn load(path: &Path) -> Result<Self, PlatformError> {
        if !path.exists() {
            let mut config = Self::default();
            config.auth.secret = random_credential(48);
            config.auth.bootstrap_token = random_credential(32);
            config.save(path)?;
            tracing::info!(path = %path.display(), "created default configuration");
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PlatformError::Internal(format!("config unreadable at {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            PlatformError::Internal(format!("config invalid at {}: {e}", path.display()))
        })
    }

    /// Write the document as pretty-printed JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), PlatformError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| PlatformError::Internal(e.to_string()))?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Apply `NOPLACELIKE_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("NOPLACELIKE_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("NOPLACELIKE_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(level) = std::env::var("NOPLACELIKE_LOG_LEVEL") {
            if !level.is_empty() {
                self.log_level = level;
            }
        }
    }

    /// Boot-time validation. A missing secret with auth enabled is fatal.
    pub fn validate(&self) -> Result<(), PlatformError> {
        if self.auth.enabled && self.auth.secret.is_empty() {
            return Err(PlatformError::Internal(
                "auth is enabled but auth.secret is empty".to_string(),
            ));
        }
        if self.events.buffer_capacity == 0 {
            return Err(PlatformError::Internal(
                "events.buffer_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn load_creates_file_with_generated_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = PlatformConfig::load(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.auth.secret.len(), 48);
        assert_eq!(config.auth.bootstrap_token.len(), 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_roundtrips_saved_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = PlatformConfig::default();
        config.server.port = 9999;
        config.auth.secret = "s3cret".to_string();
        config.shared_dirs.push("/tmp/shared".to_string());
        config.save(&path).unwrap();

        let loaded = PlatformConfig::load(&path).unwrap();
        assert_eq!(loaded.server.port, 9999);
        assert_eq!(loaded.shared_dirs, vec!["/tmp/shared".to_string()]);
    }

    #[test]
    fn invalid_json_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = PlatformConfig::load(&path).unwrap_err();
        assert!(matches!(err, PlatformError::Internal(_)));
    }

    #[test]
    fn missing_secret_with_auth_enabled_fails_validation() {
        let mut config = PlatformConfig::default();
        config.auth.enabled = true;
        config.auth.secret.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_host_port_and_level() {
        std::env::set_var("NOPLACELIKE_HOST", "192.168.1.50");
        std::env::set_var("NOPLACELIKE_PORT", "7777");
        std::env::set_var("NOPLACELIKE_LOG_LEVEL", "debug");
        let mut config = PlatformConfig::default();
        config.apply_env();
        std::env::remove_var("NOPLACELIKE_HOST");
        std::env::remove_var("NOPLACELIKE_PORT");
        std::env::remove_var("NOPLACELIKE_LOG_LEVEL");

        assert_eq!(config.server.host, "192.168.1.50");
        assert_eq!(config.server.port, 7777);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    #[serial]
    fn config_path_resolution_prefers_cli_then_env() {
        std::env::set_var("NOPLACELIKE_CONFIG", "/tmp/from-env.json");
        let cli = PathBuf::from("/tmp/from-cli.json");
        assert_eq!(resolve_config_path(Some(&cli)), cli);
        assert_eq!(
            resolve_config_path(None),
            PathBuf::from("/tmp/from-env.json")
        );
        std::env::remove_var("NOPLACELIKE_CONFIG");
    }
}
