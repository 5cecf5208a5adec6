//! Key-ordered metadata tables over an object store
//!
//! Each entity is one JSON document at `{table}/{partition}/{row_key}`.
//! The backend only offers listing, so a range scan lists the partition
//! directory, keeps names in `[start, end)`, and reads the survivors in
//! row-key order, at most [`PAGE_SIZE`] documents per page.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use cvault_core::{prefix_upper_bound, FileMetadataEntry, VaultError, VaultResult, WrappedKeyRecord};
use futures::TryStreamExt;
use opendal::Operator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{is_not_found, map_err};

/// Maximum rows fetched from the backend per query page.
pub const PAGE_SIZE: usize = 1000;

/// One page of raw documents, in ascending row-key order.
#[derive(Debug, Clone, Default)]
pub struct EntityPage {
    pub rows: Vec<(String, Vec<u8>)>,
    /// Row key to resume after, if more rows remain in range
    pub next: Option<String>,
}

/// Untyped document store addressed by (table, partition, row key).
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_raw(&self, table: &str, partition: &str, row_key: &str)
        -> VaultResult<Option<Vec<u8>>>;

    async fn upsert_raw(
        &self,
        table: &str,
        partition: &str,
        row_key: &str,
        doc: Vec<u8>,
    ) -> VaultResult<()>;

    /// Rows with `start <= key` and `key < end` (unbounded when `end` is
    /// `None`), strictly after `after`, at most `limit` of them.
    async fn query_page(
        &self,
        table: &str,
        partition: &str,
        start: &str,
        end: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> VaultResult<EntityPage>;
}

/// `EntityStore` over any opendal operator.
#[derive(Debug, Clone)]
pub struct OpendalEntityStore {
    op: Operator,
}

impl OpendalEntityStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }
}

fn validate_segment(table: &str, what: &str, value: &str, row_key: &str) -> VaultResult<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(VaultError::InvalidEntity {
            table: table.to_string(),
            row_key: row_key.to_string(),
            reason: format!("{what} {value:?} is not a valid address segment"),
        });
    }
    Ok(())
}

fn document_path(table: &str, partition: &str, row_key: &str) -> VaultResult<String> {
    validate_segment(table, "partition", partition, row_key)?;
    validate_segment(table, "row key", row_key, row_key)?;
    Ok(format!("{table}/{partition}/{row_key}"))
}

#[async_trait]
impl EntityStore for OpendalEntityStore {
    async fn get_raw(
        &self,
        table: &str,
        partition: &str,
        row_key: &str,
    ) -> VaultResult<Option<Vec<u8>>> {
        let path = document_path(table, partition, row_key)?;
        match self.op.read(&path).await {
            Ok(buf) => Ok(Some(buf.to_vec())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(map_err(&format!("reading {path}"), e)),
        }
    }

    async fn upsert_raw(
        &self,
        table: &str,
        partition: &str,
        row_key: &str,
        doc: Vec<u8>,
    ) -> VaultResult<()> {
        let path = document_path(table, partition, row_key)?;
        self.op
            .write(&path, doc)
            .await
            .map_err(|e| map_err(&format!("writing {path}"), e))?;
        Ok(())
    }

    async fn query_page(
        &self,
        table: &str,
        partition: &str,
        start: &str,
        end: Option<&str>,
        after: Option<&str>,
        limit: usize,
    ) -> VaultResult<EntityPage> {
        validate_segment(table, "partition", partition, "")?;
        let dir = format!("{table}/{partition}/");

        let mut lister = match self.op.lister(&dir).await {
            Ok(lister) => lister,
            Err(e) if is_not_found(&e) => return Ok(EntityPage::default()),
            Err(e) => return Err(map_err(&format!("listing {dir}"), e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = lister
            .try_next()
            .await
            .map_err(|e| map_err(&format!("listing {dir}"), e))?
        {
            if entry.path().ends_with('/') {
                continue;
            }
            let name = entry.name();
            let in_range = name >= start
                && end.map_or(true, |end| name < end)
                && after.map_or(true, |after| name > after);
            if in_range {
                keys.push(name.to_string());
            }
        }
        keys.sort();

        let next = if keys.len() > limit {
            keys.truncate(limit);
            keys.last().cloned()
        } else {
            None
        };

        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            let path = format!("{dir}{key}");
            match self.op.read(&path).await {
                Ok(buf) => rows.push((key, buf.to_vec())),
                // Deleted between list and read
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(map_err(&format!("reading {path}"), e)),
            }
        }

        debug!(table, partition, rows = rows.len(), more = next.is_some(), "query page");
        Ok(EntityPage { rows, next })
    }
}

/// A fixed-shape record stored in a named table.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;
}

impl Entity for FileMetadataEntry {
    const TABLE: &'static str = "filemetadata";
}

impl Entity for WrappedKeyRecord {
    const TABLE: &'static str = "encryptionkeys";
}

/// Typed view of one table. Documents that do not deserialize into `E`
/// fail with `InvalidEntity`.
pub struct Table<E> {
    store: Arc<dyn EntityStore>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Table<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> Table<E> {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            _entity: PhantomData,
        }
    }

    pub async fn get_entity(&self, partition: &str, row_key: &str) -> VaultResult<Option<E>> {
        match self.store.get_raw(E::TABLE, partition, row_key).await? {
            Some(doc) => decode(row_key, &doc).map(Some),
            None => Ok(None),
        }
    }

    pub async fn upsert_entity(&self, partition: &str, row_key: &str, entity: &E) -> VaultResult<()> {
        let doc = serde_json::to_vec(entity).map_err(|e| VaultError::InvalidEntity {
            table: E::TABLE.to_string(),
            row_key: row_key.to_string(),
            reason: e.to_string(),
        })?;
        self.store.upsert_raw(E::TABLE, partition, row_key, doc).await
    }

    /// Rows with `start <= key < end`, ordered by key.
    pub async fn query_range(
        &self,
        partition: &str,
        start: &str,
        end: &str,
    ) -> VaultResult<Vec<(String, E)>> {
        self.query(partition, start, Some(end)).await
    }

    /// Rows whose key starts with `prefix`. An empty prefix selects all.
    pub async fn query_prefix(&self, partition: &str, prefix: &str) -> VaultResult<Vec<(String, E)>> {
        match prefix_upper_bound(prefix) {
            Some(upper) => self.query_range(partition, prefix, &upper).await,
            // "" or a prefix of only char::MAX has no finite upper bound
            None => self.query(partition, prefix, None).await,
        }
    }

    pub async fn query_all(&self, partition: &str) -> VaultResult<Vec<(String, E)>> {
        self.query(partition, "", None).await
    }

    async fn query(
        &self,
        partition: &str,
        start: &str,
        end: Option<&str>,
    ) -> VaultResult<Vec<(String, E)>> {
        let mut out = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = self
                .store
                .query_page(E::TABLE, partition, start, end, after.as_deref(), PAGE_SIZE)
                .await?;
            for (key, doc) in page.rows {
                let entity = decode(&key, &doc)?;
                out.push((key, entity));
            }
            match page.next {
                Some(next) => after = Some(next),
                None => break,
            }
        }
        Ok(out)
    }
}

fn decode<E: Entity>(row_key: &str, doc: &[u8]) -> VaultResult<E> {
    serde_json::from_slice(doc).map_err(|e| VaultError::InvalidEntity {
        table: E::TABLE.to_string(),
        row_key: row_key.to_string(),
        reason: e.to_string(),
    })
}
