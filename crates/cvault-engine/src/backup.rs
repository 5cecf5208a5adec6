//! Backup orchestration: walk, detect, hash, dedup, encrypt, upload, record

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cvault_core::{path_key, FileMetadataEntry, FileStat, VaultError, VaultResult};
use cvault_crypto::{hash_file, DataKey};
use cvault_storage::{BlobStore, Table};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detect::detect;
use crate::pipeline::encrypt_file;
use crate::pool::for_each_file;
use crate::walk::{collect_files, compile_excludes};
use crate::{join_error, FileFailure, ProgressFn, DEFAULT_WORKERS};

/// What happened to one file that backed up successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Size and mtime matched; nothing was read
    Unchanged,
    /// Hashed, and the blob already existed
    Deduplicated,
    /// Hashed, encrypted and uploaded; `bytes` counts ciphertext sent
    Uploaded { bytes: u64 },
}

/// Aggregate result of one backup run.
#[derive(Debug, Default)]
pub struct BackupReport {
    pub partition: String,
    /// Files that reached a terminal state, including failures
    pub processed: usize,
    pub uploaded: usize,
    pub deduplicated: usize,
    pub unchanged: usize,
    /// Content hash computations performed
    pub hashed: usize,
    pub failed: Vec<FileFailure>,
    /// Bytes sent to the blob store (uploads only)
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    /// True when the run stopped issuing files because of cancellation
    pub cancelled: bool,
}

impl BackupReport {
    /// Bytes per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / secs
        } else {
            0.0
        }
    }

    fn record(&mut self, path_key: String, result: VaultResult<FileOutcome>) {
        self.processed += 1;
        match result {
            Ok(FileOutcome::Unchanged) => self.unchanged += 1,
            Ok(FileOutcome::Deduplicated) => {
                self.hashed += 1;
                self.deduplicated += 1;
            }
            Ok(FileOutcome::Uploaded { bytes }) => {
                self.hashed += 1;
                self.uploaded += 1;
                self.bytes_transferred += bytes;
            }
            Err(error) => {
                warn!(path = %path_key, "backup failed: {error}");
                self.failed.push(FileFailure { path_key, error });
            }
        }
    }
}

/// Everything a file task needs, shared read-only across the pool.
struct Shared {
    blobs: Arc<dyn BlobStore>,
    files: Table<FileMetadataEntry>,
    dek: Arc<DataKey>,
    partition: String,
    cache: HashMap<String, FileMetadataEntry>,
}

/// Mirrors a local tree into one partition of the metadata table.
pub struct BackupOrchestrator {
    blobs: Arc<dyn BlobStore>,
    files: Table<FileMetadataEntry>,
    dek: Arc<DataKey>,
    workers: usize,
    excludes: Vec<glob::Pattern>,
}

impl BackupOrchestrator {
    pub fn new(blobs: Arc<dyn BlobStore>, files: Table<FileMetadataEntry>, dek: Arc<DataKey>) -> Self {
        Self {
            blobs,
            files,
            dek,
            workers: DEFAULT_WORKERS,
            excludes: Vec::new(),
        }
    }

    /// Size of the file worker pool (minimum 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_excludes(mut self, patterns: &[String]) -> Self {
        self.excludes = compile_excludes(patterns);
        self
    }

    /// Back up every regular file under `root` into `partition`.
    ///
    /// Fails outright only if `root` is not a readable directory or the
    /// partition's metadata cannot be listed. Every per-file error lands in
    /// `BackupReport::failed` and the run continues.
    pub async fn run(
        &self,
        root: &Path,
        partition: &str,
        cancel: &CancellationToken,
        progress: Option<&ProgressFn>,
    ) -> VaultResult<BackupReport> {
        let started = Instant::now();
        let meta = tokio::fs::metadata(root)
            .await
            .map_err(|e| VaultError::fs(root, e))?;
        if !meta.is_dir() {
            return Err(VaultError::fs(
                root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            ));
        }

        // One bulk listing per run instead of a lookup per file
        let cache: HashMap<String, FileMetadataEntry> =
            self.files.query_all(partition).await?.into_iter().collect();
        debug!(partition = %partition, entries = cache.len(), "loaded metadata cache");

        let walk = {
            let root = root.to_path_buf();
            let excludes = self.excludes.clone();
            tokio::task::spawn_blocking(move || collect_files(&root, &excludes))
                .await
                .map_err(join_error)?
        };

        let mut report = BackupReport {
            partition: partition.to_string(),
            ..Default::default()
        };
        for (dir, e) in walk.errors {
            let key = relative_key(root, &dir);
            report.record(key, Err(VaultError::fs(dir, e)));
        }

        let total = walk.files.len() as u64;
        info!(partition = %partition, files = total, root = %root.display(), "backup started");

        let shared = Arc::new(Shared {
            blobs: Arc::clone(&self.blobs),
            files: self.files.clone(),
            dek: Arc::clone(&self.dek),
            partition: partition.to_string(),
            cache,
        });
        let items: Vec<(String, PathBuf)> = walk
            .files
            .into_iter()
            .map(|path| (relative_key(root, &path), path))
            .collect();

        let mut done = 0u64;
        let cancelled = for_each_file(
            items,
            self.workers,
            cancel,
            |key, path| {
                let shared = Arc::clone(&shared);
                async move { backup_file(&shared, &path, &key).await }
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
            uploaded = report.uploaded,
            deduplicated = report.deduplicated,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            bytes = report.bytes_transferred,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "backup finished"
        );
        Ok(report)
    }
}

async fn backup_file(shared: &Shared, path: &Path, key: &str) -> VaultResult<FileOutcome> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| VaultError::fs(path, e))?;
    let stat = FileStat::from_metadata(&meta).map_err(|e| VaultError::fs(path, e))?;

    let verdict = detect(shared.cache.get(key), &stat);
    if !verdict.needs_hash() {
        debug!(path = %key, "skip: unchanged since last backup");
        return Ok(FileOutcome::Unchanged);
    }
    debug!(path = %key, verdict = ?verdict, "hashing");

    let hash = {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || hash_file(&path))
            .await
            .map_err(join_error)??
    };

    let outcome = if shared.blobs.exists(&hash).await? {
        debug!(path = %key, hash = %hash, "dedup: blob already stored");
        FileOutcome::Deduplicated
    } else {
        let ciphertext = encrypt_file(path, &shared.dek, &hash).await?;
        let bytes = shared.blobs.put(&hash, ciphertext).await?;
        info!(path = %key, hash = %hash, bytes, "uploaded");
        FileOutcome::Uploaded { bytes }
    };

    // Only after the blob is durable
    let entry = FileMetadataEntry {
        hash,
        modified_date: stat.modified,
        size: stat.size,
    };
    shared
        .files
        .upsert_entity(&shared.partition, key, &entry)
        .await?;

    Ok(outcome)
}

fn relative_key(root: &Path, path: &Path) -> String {
    path_key(path.strip_prefix(root).unwrap_or(path))
}
