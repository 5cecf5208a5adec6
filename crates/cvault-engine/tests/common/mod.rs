//! Shared fixtures: in-memory stores and small tree helpers.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use cvault_core::FileMetadataEntry;
use cvault_crypto::DataKey;
use cvault_engine::{BackupOrchestrator, KeyManager, RestoreOrchestrator};
use cvault_storage::{BlobStore, EntityStore, OpendalBlobStore, OpendalEntityStore, Table};
use opendal::Operator;
use secrecy::SecretString;

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

pub struct Vault {
    pub blob_op: Operator,
    pub blobs: Arc<dyn BlobStore>,
    pub tables: Arc<dyn EntityStore>,
}

impl Vault {
    pub fn new() -> Self {
        let blob_op = memory_operator();
        Self {
            blobs: Arc::new(OpendalBlobStore::new(blob_op.clone())),
            blob_op,
            tables: Arc::new(OpendalEntityStore::new(memory_operator())),
        }
    }

    pub fn files(&self) -> Table<FileMetadataEntry> {
        Table::new(Arc::clone(&self.tables))
    }

    pub fn keys(&self) -> KeyManager {
        KeyManager::new(Arc::clone(&self.tables))
    }

    pub async fn dek(&self) -> Arc<DataKey> {
        let dek = self
            .keys()
            .load_or_create("main", &password("correct horse"))
            .await
            .expect("load_or_create");
        Arc::new(dek)
    }

    pub fn backup(&self, dek: &Arc<DataKey>) -> BackupOrchestrator {
        BackupOrchestrator::new(Arc::clone(&self.blobs), self.files(), Arc::clone(dek))
    }

    pub fn restore(&self, dek: &Arc<DataKey>) -> RestoreOrchestrator {
        RestoreOrchestrator::new(Arc::clone(&self.blobs), self.files(), Arc::clone(dek))
    }

    /// Number of objects in the blob container.
    pub async fn blob_count(&self) -> usize {
        self.blob_op
            .list("/")
            .await
            .expect("list blobs")
            .iter()
            .filter(|e| !e.path().ends_with('/'))
            .count()
    }
}

pub fn password(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

pub fn write_test_file(root: &Path, rel: &str, content: &[u8]) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent");
    }
    std::fs::write(&path, content).expect("write test file");
    path
}

/// Push a file's mtime forward so change detection cannot miss an edit
/// that kept the size.
pub fn bump_mtime(path: &Path, secs: u64) {
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("open for set_modified");
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .expect("set_modified");
}
