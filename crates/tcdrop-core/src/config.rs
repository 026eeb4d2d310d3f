use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from tcdrop.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TcdropConfig {
    pub log: LogConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub retry: RetryConfig,
    pub container: ContainerConfig,
    pub oracle: OracleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend: "fs" or "memory"
    pub backend: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Prefix prepended to generated object names
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes pulled from / pushed to storage per request (default: 1 MiB)
    pub chunk_size: u64,
    /// Ciphertext kept for re-requests of already-served ranges (default: one chunk)
    pub cache_lookback: u64,
    /// Cipher/hash work done between cooperative yields (default: 1 MiB)
    pub crypt_slice: usize,
}

/// Backoff schedule for key-wrapping oracle calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub start_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Upper bound of the random jitter added per step
    pub max_jitter_ms: u64,
    /// Attempt limit (unset = unbounded)
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Length-concealment padding: "none", "block:<bytes>", or "size-class"
    pub padding: String,
    /// Stop after authenticated metadata until the caller resumes
    pub pause_after_metadata: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// File holding the 32-byte local oracle secret (base64)
    pub secret_file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            root: PathBuf::from("~/.local/share/tcdrop/objects"),
            prefix: "drops".into(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            cache_lookback: 1024 * 1024,
            crypt_slice: 1024 * 1024,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            start_interval_ms: 250,
            max_interval_ms: 60_000,
            max_jitter_ms: 1000,
            max_attempts: None,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            padding: "size-class".into(),
            pause_after_metadata: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[log]
level = "debug"
format = "json"

[storage]
backend = "memory"
root = "/var/lib/tcdrop"
prefix = "shares"

[transfer]
chunk_size = 65536
cache_lookback = 131072
crypt_slice = 32768

[retry]
start_interval_ms = 100
max_interval_ms = 5000
max_jitter_ms = 0
max_attempts = 4

[container]
padding = "block:4096"
pause_after_metadata = true

[oracle]
secret_file = "/etc/tcdrop/oracle.key"
"#;
        let config: TcdropConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.storage.backend, "memory");
        assert_eq!(config.storage.root, PathBuf::from("/var/lib/tcdrop"));
        assert_eq!(config.transfer.chunk_size, 65536);
        assert_eq!(config.transfer.crypt_slice, 32768);
        assert_eq!(config.retry.max_attempts, Some(4));
        assert_eq!(config.retry.max_jitter_ms, 0);
        assert_eq!(config.container.padding, "block:4096");
        assert!(config.container.pause_after_metadata);
        assert_eq!(
            config.oracle.secret_file,
            Some(PathBuf::from("/etc/tcdrop/oracle.key"))
        );
    }

    #[test]
    fn test_parse_defaults() {
        let config: TcdropConfig = toml::from_str("").unwrap();

        assert_eq!(config.log.level, "info");
        assert_eq!(config.storage.backend, "fs");
        assert_eq!(config.transfer.chunk_size, 1024 * 1024);
        assert_eq!(config.retry.start_interval_ms, 250);
        assert_eq!(config.retry.max_interval_ms, 60_000);
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.container.padding, "size-class");
        assert!(!config.container.pause_after_metadata);
        assert!(config.oracle.secret_file.is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[retry]
max_attempts = 2
"#;
        let config: TcdropConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.retry.max_attempts, Some(2));
        // Defaults
        assert_eq!(config.retry.start_interval_ms, 250);
        assert_eq!(config.transfer.cache_lookback, 1024 * 1024);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = TcdropConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: TcdropConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.root, parsed.storage.root);
        assert_eq!(config.transfer.chunk_size, parsed.transfer.chunk_size);
        assert_eq!(config.container.padding, parsed.container.padding);
    }
}
