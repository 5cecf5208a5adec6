//! cvault-engine: encrypted, deduplicating backup and restore
//!
//! Backup pipeline, per file:
//! ```text
//! stat → cached metadata → detect ─ Unchanged ─→ skip
//!                                └─ New / PossiblyChanged
//!                                     → SHA-256 → blob exists? ─ yes ─→ upsert metadata
//!                                                             └─ no ──→ encrypt + put → upsert metadata
//! ```
//! Restore walks the metadata rows under a path-key prefix and streams each
//! blob through the decryptor into a temp file renamed into place.

pub mod backup;
pub mod detect;
pub mod keys;
pub mod pipeline;
mod pool;
pub mod restore;
pub mod walk;

pub use backup::{BackupOrchestrator, BackupReport, FileOutcome};
pub use detect::{detect, Verdict};
pub use keys::{KeyManager, KEY_PARTITION};
pub use restore::{RestoreOrchestrator, RestoreOutcome, RestoreReport};

use cvault_core::VaultError;

/// Progress callback type (items_done, items_total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Default size of the per-run worker pool
pub const DEFAULT_WORKERS: usize = 4;

/// One file that could not be processed. The run carries on without it.
#[derive(Debug)]
pub struct FileFailure {
    pub path_key: String,
    pub error: VaultError,
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> VaultError {
    VaultError::Other(anyhow::anyhow!("worker task failed: {e}"))
}
