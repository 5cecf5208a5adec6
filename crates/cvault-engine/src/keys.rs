//! Envelope key management: one wrapped DEK per key name

use std::sync::Arc;

use cvault_core::{VaultError, VaultResult, WrappedKeyRecord};
use cvault_crypto::{generate_data_key, rewrap_data_key, unwrap_data_key, wrap_data_key, DataKey};
use cvault_storage::{EntityStore, Table};
use secrecy::SecretString;
use tracing::info;

/// Partition of the `encryptionkeys` table holding every wrapped key.
pub const KEY_PARTITION: &str = "keys";

/// Loads, creates and rotates wrapped data keys.
///
/// No password hash is stored anywhere: a wrong password is detected only
/// by the AEAD tag failing during unwrap.
#[derive(Clone)]
pub struct KeyManager {
    keys: Table<WrappedKeyRecord>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            keys: Table::new(store),
        }
    }

    /// Unwrap the DEK stored under `key_name`, creating and persisting a
    /// fresh one on first use.
    pub async fn load_or_create(&self, key_name: &str, password: &SecretString) -> VaultResult<DataKey> {
        match self.keys.get_entity(KEY_PARTITION, key_name).await? {
            Some(record) => unwrap_data_key(&record, password),
            None => {
                let dek = generate_data_key();
                let record = wrap_data_key(&dek, password)?;
                self.keys.upsert_entity(KEY_PARTITION, key_name, &record).await?;
                info!(key = %key_name, "created new data encryption key");
                Ok(dek)
            }
        }
    }

    /// Unwrap an existing DEK; `KeyNotFound` if none was ever created.
    pub async fn load(&self, key_name: &str, password: &SecretString) -> VaultResult<DataKey> {
        let record = self.record(key_name).await?;
        unwrap_data_key(&record, password)
    }

    /// Re-wrap the same DEK under `new` with a fresh salt and nonce.
    pub async fn rotate_password(
        &self,
        key_name: &str,
        old: &SecretString,
        new: &SecretString,
    ) -> VaultResult<()> {
        let record = self.record(key_name).await?;
        let rewrapped = rewrap_data_key(&record, old, new)?;
        self.keys.upsert_entity(KEY_PARTITION, key_name, &rewrapped).await?;
        info!(key = %key_name, "password rotated");
        Ok(())
    }

    async fn record(&self, key_name: &str) -> VaultResult<WrappedKeyRecord> {
        self.keys
            .get_entity(KEY_PARTITION, key_name)
            .await?
            .ok_or_else(|| VaultError::KeyNotFound(key_name.to_string()))
    }
}
