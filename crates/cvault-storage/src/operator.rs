//! OpenDAL Operator factory for cvault storage backends

use std::path::Path;

use cvault_core::config::{StorageBackend, StorageConfig};
use cvault_core::{VaultError, VaultResult};
use opendal::layers::{LoggingLayer, RetryLayer};
use opendal::{Builder, Operator};

/// Credentials for the remote account. `account` is the Azure storage
/// account name or the S3 access key id; `access_key` is the matching
/// secret. Unused by the fs and memory backends.
#[derive(Clone, Default)]
pub struct Credentials {
    pub account: Option<String>,
    pub access_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account", &self.account)
            .field("access_key", &self.access_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// The pair of operators a vault runs against.
#[derive(Debug, Clone)]
pub struct StoreOperators {
    /// Encrypted content blobs, keyed by plaintext hash
    pub blobs: Operator,
    /// Metadata entity documents
    pub tables: Operator,
}

/// Build both operators for the configured backend.
pub fn build_stores(cfg: &StorageConfig, creds: &Credentials) -> VaultResult<StoreOperators> {
    check_endpoint_tls(cfg)?;
    Ok(StoreOperators {
        blobs: build_operator(cfg, &cfg.blob_container, creds)?,
        tables: build_operator(cfg, &cfg.table_container, creds)?,
    })
}

/// Build an operator over a single container of the configured backend.
pub fn build_operator(
    cfg: &StorageConfig,
    container: &str,
    creds: &Credentials,
) -> VaultResult<Operator> {
    match cfg.backend {
        StorageBackend::Azblob => {
            let (account, key) = require_credentials(creds)?;
            let endpoint = cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| format!("https://{account}.blob.core.windows.net"));
            // opendal 0.55 builders are consuming: methods take `self`, return `Self`
            let builder = opendal::services::Azblob::default()
                .container(container)
                .endpoint(&endpoint)
                .account_name(account)
                .account_key(key);
            finish(builder, "azblob")
        }
        StorageBackend::S3 => {
            let (account, key) = require_credentials(creds)?;
            let mut builder = opendal::services::S3::default()
                .bucket(container)
                .region(&cfg.region)
                .access_key_id(account)
                .secret_access_key(key);
            if let Some(endpoint) = &cfg.endpoint {
                builder = builder.endpoint(endpoint);
            }
            finish(builder, "s3")
        }
        StorageBackend::Fs => {
            let root = cfg.root.join(container);
            let builder = opendal::services::Fs::default().root(path_str(&root)?);
            finish(builder, "fs")
        }
        StorageBackend::Memory => {
            let builder = opendal::services::Memory::default().root(container);
            finish(builder, "memory")
        }
    }
}

/// Refuse plaintext HTTP when `enforce_tls` is set; warn otherwise.
pub fn check_endpoint_tls(cfg: &StorageConfig) -> VaultResult<()> {
    let Some(endpoint) = cfg.endpoint.as_deref() else {
        return Ok(());
    };
    if endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            return Err(VaultError::Config(format!(
                "storage endpoint uses plaintext HTTP ({endpoint}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development."
            )));
        }
        tracing::warn!(
            endpoint = %endpoint,
            "storage endpoint uses plaintext HTTP, credentials are transmitted unencrypted. \
             Set storage.enforce_tls = true and use HTTPS in production."
        );
    }
    Ok(())
}

fn finish<B: Builder>(builder: B, service: &str) -> VaultResult<Operator> {
    let op = Operator::new(builder)
        .map_err(|e| VaultError::Config(format!("creating OpenDAL {service} operator: {e}")))?
        .layer(LoggingLayer::default())
        .layer(RetryLayer::new().with_max_times(5).with_jitter())
        .finish();
    Ok(op)
}

fn require_credentials(creds: &Credentials) -> VaultResult<(&str, &str)> {
    match (creds.account.as_deref(), creds.access_key.as_deref()) {
        (Some(a), Some(k)) if !a.is_empty() && !k.is_empty() => Ok((a, k)),
        _ => Err(VaultError::Config(
            "storage account and access key are required for this backend \
             (use --account/--accesskey or CVAULT_ACCOUNT/CVAULT_ACCESS_KEY)"
                .into(),
        )),
    }
}

fn path_str(path: &Path) -> VaultResult<&str> {
    path.to_str()
        .ok_or_else(|| VaultError::Config(format!("non-UTF-8 storage root: {}", path.display())))
}
