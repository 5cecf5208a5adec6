//! Restore orchestration: prefix scan over metadata, download, decrypt

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cvault_core::{path_from_key, prefix_key, FileMetadataEntry, VaultError, VaultResult};
use cvault_crypto::{is_content_hash, DataKey};
use cvault_storage::{BlobStore, Entity, Table};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::decrypt_to_file;
use crate::pool::for_each_file;
use crate::{FileFailure, ProgressFn, DEFAULT_WORKERS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// A local file of the recorded size already exists
    Skipped,
    Downloaded { bytes: u64 },
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub partition: String,
    pub processed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: Vec<FileFailure>,
    /// Plaintext bytes written locally
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    pub cancelled: bool,
}

impl RestoreReport {
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }

    fn record(&mut self, path_key: String, result: VaultResult<RestoreOutcome>) {
        self.processed += 1;
        match result {
            Ok(RestoreOutcome::Skipped) => self.skipped += 1,
            Ok(RestoreOutcome::Downloaded { bytes }) => {
                self.downloaded += 1;
                self.bytes_transferred += bytes;
            }
            Err(error) => {
                warn!(path = %path_key, "restore failed: {error}");
                self.failed.push(FileFailure { path_key, error });
            }
        }
    }
}

/// Recreates a local tree from one partition of the metadata table.
pub struct RestoreOrchestrator {
    blobs: Arc<dyn BlobStore>,
    files: Table<FileMetadataEntry>,
    dek: Arc<DataKey>,
    workers: usize,
}

impl RestoreOrchestrator {
    pub fn new(blobs: Arc<dyn BlobStore>, files: Table<FileMetadataEntry>, dek: Arc<DataKey>) -> Self {
        Self {
            blobs,
            files,
            dek,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Restore every entry whose path starts with `prefix` into `target`.
    ///
    /// `prefix` is a path prefix (`photos/2024`) and goes through the same
    /// path-key normalization as backup. The target directory is created
    /// if missing.
    pub async fn run(
        &self,
        target: &Path,
        partition: &str,
        prefix: &str,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> VaultResult<RestoreReport> {
        let started = Instant::now();
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| VaultError::fs(target, e))?;

        let key_prefix = prefix_key(prefix);
        let rows = self.files.query_prefix(partition, &key_prefix).await?;
        let total = rows.len() as u64;
        info!(partition = %partition, prefix = %key_prefix, files = total, "restore started");

        let mut report = RestoreReport {
            partition: partition.to_string(),
            ..Default::default()
        };

        let blobs = Arc::clone(&self.blobs);
        let dek = Arc::clone(&self.dek);
        let target = target.to_path_buf();
        let mut done = 0u64;

        let cancelled = for_each_file(
            rows,
            self.workers,
            cancel,
            |key, entry| {
                let blobs = Arc::clone(&blobs);
                let dek = Arc::clone(&dek);
                let target = target.clone();
                async move { restore_file(&blobs, &dek, &target, &key, &entry).await }
            },
            |key, result| {
                done += 1;
                if let Some(cb) = progress {
                    cb(done, total, &key);
                }
                report.record(key, result);
            },
        )
        .await;
        report.cancelled = cancelled;

        report.elapsed = started.elapsed();
        info!(
            partition = %partition,
            processed = report.processed,
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed.len(),
            bytes = report.bytes_transferred,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "restore finished"
        );
        Ok(report)
    }
}

async fn restore_file(
    blobs: &Arc<dyn BlobStore>,
    dek: &DataKey,
    target: &Path,
    key: &str,
    entry: &FileMetadataEntry,
) -> VaultResult<RestoreOutcome> {
    if !is_content_hash(&entry.hash) {
        return Err(VaultError::InvalidEntity {
            table: <FileMetadataEntry as Entity>::TABLE.into(),
            row_key: key.to_string(),
            reason: format!("Hash {:?} is not a SHA-256 hex digest", entry.hash),
        });
    }
    let dest = local_path(target, key)?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VaultError::fs(parent, e))?;
    }

    if let Ok(meta) = tokio::fs::metadata(&dest).await {
        if meta.is_file() && meta.len() == entry.size {
            debug!(path = %key, "skip: same-size file already present");
            return Ok(RestoreOutcome::Skipped);
        }
    }

    let bytes = decrypt_to_file(blobs, &entry.hash, dek, &dest).await?;
    info!(path = %key, hash = %entry.hash, bytes, "restored");
    Ok(RestoreOutcome::Downloaded { bytes })
}

/// Map a row key under `target`, refusing keys that would escape it.
fn local_path(target: &Path, key: &str) -> VaultResult<PathBuf> {
    path_from_key(key)
        .map(|rel| target.join(rel))
        .ok_or_else(|| {
            VaultError::fs(
                target,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("refusing unsafe path key {key:?}"),
                ),
            )
        })
}
