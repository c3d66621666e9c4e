//! Server configuration loaded from environment variables.
//!
//! Everything except the encryption key has a development default. A bad
//! value logs a warning and keeps the default; a bad key stops startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use capsule_shared::constants::{
    DEFAULT_HTTP_PORT, DEFAULT_ITEM_TIMEOUT_SECS, DEFAULT_SCAN_CONCURRENCY,
    DEFAULT_SCAN_INTERVAL_SECS, MAX_PAYLOAD_SIZE,
};
use capsule_shared::crypto::{key_from_hex, SymmetricKey};
use capsule_shared::CryptoError;

/// Where encrypted payloads are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadBackend {
    /// One file per payload under `payload_storage_path`.
    Fs,
    /// The `payloads` table of the capsule database.
    Sqlite,
}

impl std::str::FromStr for PayloadBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fs" | "file" | "files" => Ok(Self::Fs),
            "sqlite" | "db" => Ok(Self::Sqlite),
            other => Err(format!("unknown payload backend '{other}'")),
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    /// Env: `HTTP_ADDR`. Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `DATABASE_PATH`. Default: `./capsules.db`
    pub database_path: PathBuf,

    /// Env: `PAYLOAD_BACKEND` (`fs` or `sqlite`). Default: `fs`
    pub payload_backend: PayloadBackend,

    /// Env: `PAYLOAD_STORAGE_PATH`. Default: `./payloads`
    pub payload_storage_path: PathBuf,

    /// Largest accepted upload in bytes.
    /// Env: `MAX_PAYLOAD_SIZE`. Default: 100 MiB
    pub max_payload_size: usize,

    /// Hex-encoded 32-byte master key, parsed by [`Self::master_key`].
    /// Env: `ENCRYPTION_KEY`. Required.
    pub encryption_key_hex: Option<String>,

    /// Env: `SCAN_INTERVAL_SECS`. Default: `600`
    pub scan_interval: Duration,

    /// Capsules unlocked in parallel within one scan.
    /// Env: `SCAN_CONCURRENCY`. Default: `4`
    pub scan_concurrency: usize,

    /// Storage timeout for each capsule during an unlock.
    /// Env: `UNLOCK_ITEM_TIMEOUT_SECS`. Default: `30`
    pub item_timeout: Duration,

    /// Bearer token for `/admin/*`. Unset disables the admin API.
    /// Env: `ADMIN_TOKEN`
    pub admin_token: Option<String>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("payload_backend", &self.payload_backend)
            .field("payload_storage_path", &self.payload_storage_path)
            .field("max_payload_size", &self.max_payload_size)
            .field("encryption_key", &self.encryption_key_hex.as_ref().map(|_| "<redacted>"))
            .field("scan_interval", &self.scan_interval)
            .field("scan_concurrency", &self.scan_concurrency)
            .field("item_timeout", &self.item_timeout)
            .field("admin_enabled", &self.admin_token.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./capsules.db"),
            payload_backend: PayloadBackend::Fs,
            payload_storage_path: PathBuf::from("./payloads"),
            max_payload_size: MAX_PAYLOAD_SIZE,
            encryption_key_hex: None,
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            scan_concurrency: DEFAULT_SCAN_CONCURRENCY,
            item_timeout: Duration::from_secs(DEFAULT_ITEM_TIMEOUT_SECS),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            parse_into(&mut config.http_addr, "HTTP_ADDR", &addr);
        }

        if let Some(path) = var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(backend) = var("PAYLOAD_BACKEND") {
            parse_into(&mut config.payload_backend, "PAYLOAD_BACKEND", &backend);
        }

        if let Some(path) = var("PAYLOAD_STORAGE_PATH") {
            config.payload_storage_path = PathBuf::from(path);
        }

        if let Some(val) = var("MAX_PAYLOAD_SIZE") {
            parse_into(&mut config.max_payload_size, "MAX_PAYLOAD_SIZE", &val);
        }

        if let Some(key) = var("ENCRYPTION_KEY") {
            if !key.trim().is_empty() {
                config.encryption_key_hex = Some(key);
            }
        }

        if let Some(val) = var("SCAN_INTERVAL_SECS") {
            let mut secs = config.scan_interval.as_secs();
            parse_into(&mut secs, "SCAN_INTERVAL_SECS", &val);
            config.scan_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(val) = var("SCAN_CONCURRENCY") {
            parse_into(&mut config.scan_concurrency, "SCAN_CONCURRENCY", &val);
            config.scan_concurrency = config.scan_concurrency.max(1);
        }

        if let Some(val) = var("UNLOCK_ITEM_TIMEOUT_SECS") {
            let mut secs = config.item_timeout.as_secs();
            parse_into(&mut secs, "UNLOCK_ITEM_TIMEOUT_SECS", &val);
            config.item_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(token) = var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    /// The master key from `ENCRYPTION_KEY`. A missing or malformed key is a
    /// startup error.
    pub fn master_key(&self) -> Result<SymmetricKey, CryptoError> {
        match &self.encryption_key_hex {
            Some(hex_key) => key_from_hex(hex_key),
            None => Err(CryptoError::InvalidKeyLength {
                expected: capsule_shared::constants::SYMMETRIC_KEY_SIZE,
                got: 0,
            }),
        }
    }
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, name: &str, value: &str) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!(value = %value, "Invalid {name}, using default"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.payload_backend, PayloadBackend::Fs);
        assert_eq!(config.scan_interval, Duration::from_secs(600));
        assert_eq!(config.max_payload_size, 100 * 1024 * 1024);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("PAYLOAD_BACKEND", "sqlite"),
            ("SCAN_INTERVAL_SECS", "300"),
            ("SCAN_CONCURRENCY", "8"),
            ("ADMIN_TOKEN", "secret"),
        ]);
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.payload_backend, PayloadBackend::Sqlite);
        assert_eq!(config.scan_interval, Duration::from_secs(300));
        assert_eq!(config.scan_concurrency, 8);
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = config_from(&[
            ("HTTP_ADDR", "not an address"),
            ("PAYLOAD_BACKEND", "s3"),
            ("SCAN_INTERVAL_SECS", "soon"),
            ("ADMIN_TOKEN", ""),
        ]);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.payload_backend, PayloadBackend::Fs);
        assert_eq!(config.scan_interval, Duration::from_secs(600));
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn test_master_key() {
        let config = config_from(&[("ENCRYPTION_KEY", "ab".repeat(32).as_str())]);
        assert_eq!(config.master_key().unwrap(), [0xab; 32]);
    }

    #[test]
    fn test_master_key_wrong_length() {
        let config = config_from(&[("ENCRYPTION_KEY", "abcd")]);
        assert_eq!(
            config.master_key(),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: 2
            })
        );
        assert!(ServerConfig::default().master_key().is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = config_from(&[("ENCRYPTION_KEY", "cd".repeat(32).as_str())]);
        assert!(!format!("{config:?}").contains("cdcd"));
    }
}
