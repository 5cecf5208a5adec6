use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub storage: StorageConfig,
    pub backup: BackupConfig,
    pub crypto: CryptoConfig,
    pub log: LogConfig,
}

/// Which opendal service backs the blob and metadata stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Azure Blob Storage (account name + account key)
    Azblob,
    /// S3-compatible endpoint (account = access key id, access key = secret)
    S3,
    /// Local directory, one subdirectory per container
    Fs,
    /// Process-local, for dry runs and tests
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Storage account name (azblob) or access key id (s3)
    pub account: Option<String>,
    /// Service endpoint; azblob defaults to https://{account}.blob.core.windows.net
    pub endpoint: Option<String>,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Container (bucket) holding encrypted content blobs
    pub blob_container: String,
    /// Container (bucket) holding metadata tables
    pub table_container: String,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Concurrent file workers (0 = available parallelism)
    pub workers: usize,
    /// Glob patterns matched against file and directory names
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Row key of the wrapped data key (default: main)
    pub key_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Azblob,
            account: None,
            endpoint: None,
            region: "us-east-1".into(),
            blob_container: "files".into(),
            table_container: "tables".into(),
            root: PathBuf::from("~/.local/share/cvault/store"),
            enforce_tls: false,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            exclude_patterns: Vec::new(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_name: "main".into(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl BackupConfig {
    /// Resolve `workers = 0` to the host's available parallelism.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
backend = "s3"
account = "AKIDEXAMPLE"
endpoint = "https://s3.example.com"
region = "eu-central-1"
blob_container = "vault-blobs"
table_container = "vault-tables"
enforce_tls = true

[backup]
workers = 8
exclude_patterns = ["*.tmp", ".cache"]

[crypto]
key_name = "family"

[log]
level = "debug"
format = "json"
"#;
        let config: VaultConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.account.as_deref(), Some("AKIDEXAMPLE"));
        assert_eq!(config.storage.blob_container, "vault-blobs");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.backup.workers, 8);
        assert_eq!(config.backup.exclude_patterns.len(), 2);
        assert_eq!(config.crypto.key_name, "family");
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config: VaultConfig = toml::from_str("").unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Azblob);
        assert_eq!(config.storage.blob_container, "files");
        assert_eq!(config.storage.table_container, "tables");
        assert!(!config.storage.enforce_tls);
        assert_eq!(config.backup.workers, 4);
        assert_eq!(config.crypto.key_name, "main");
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[storage]
backend = "fs"
root = "/srv/cvault"
"#;
        let config: VaultConfig = toml::from_str(toml_str).unwrap();

        // Overridden
        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.storage.root, PathBuf::from("/srv/cvault"));
        // Defaults
        assert_eq!(config.storage.blob_container, "files");
        assert_eq!(config.backup.workers, 4);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = VaultConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: VaultConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.backend, parsed.storage.backend);
        assert_eq!(config.storage.blob_container, parsed.storage.blob_container);
        assert_eq!(config.crypto.key_name, parsed.crypto.key_name);
    }

    #[test]
    fn zero_workers_means_available_parallelism() {
        let cfg = BackupConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(cfg.effective_workers() >= 1);
    }
}
