use std::path::{Path, PathBuf};

use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// No wrapped key record exists under the requested key name.
    #[error("encryption key not found: {0}")]
    KeyNotFound(String),

    /// AEAD authentication failed while unwrapping the data key.
    #[error("invalid password")]
    InvalidPassword,

    /// Ciphertext length or padding is malformed.
    #[error("corrupted ciphertext: {0}")]
    CorruptedCiphertext(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("file system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Transient backend failure; retrying is the storage client's job.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    /// A stored entity did not deserialize into its fixed record shape.
    #[error("invalid entity {table}/{row_key}: {reason}")]
    InvalidEntity {
        table: String,
        row_key: String,
        reason: String,
    },

    #[error("file changed during backup: {0}")]
    FileChanged(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Wrap a local I/O failure together with the offending path.
    pub fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        VaultError::FileSystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Key-management failures abort the whole operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VaultError::KeyNotFound(_) | VaultError::InvalidPassword | VaultError::Cancelled
        )
    }
}
