//! Content-addressed blob store

use async_trait::async_trait;
use bytes::Bytes;
use cvault_core::{VaultError, VaultResult};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use opendal::{Operator, Writer};
use tracing::{debug, warn};

use crate::{is_not_found, map_err};

/// An owned stream of blob bytes.
pub type ByteStream = BoxStream<'static, VaultResult<Bytes>>;

/// Immutable objects addressed by content hash.
///
/// `put` is only issued after `exists` returned false, so it behaves as
/// create-if-absent without relying on backend conditional writes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, key: &str) -> VaultResult<bool>;

    /// Stream `data` into a new object. Returns the bytes written.
    ///
    /// If the stream yields an error the write is aborted and no object
    /// becomes visible under `key`.
    async fn put(&self, key: &str, data: BoxStream<'_, VaultResult<Bytes>>) -> VaultResult<u64>;

    /// Open the object for streaming. Missing keys are `BlobNotFound`.
    async fn get(&self, key: &str) -> VaultResult<ByteStream>;
}

/// `BlobStore` over any opendal operator.
#[derive(Debug, Clone)]
pub struct OpendalBlobStore {
    op: Operator,
}

impl OpendalBlobStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }
}

#[async_trait]
impl BlobStore for OpendalBlobStore {
    async fn exists(&self, key: &str) -> VaultResult<bool> {
        self.op
            .exists(key)
            .await
            .map_err(|e| map_err(&format!("checking blob {key}"), e))
    }

    async fn put(&self, key: &str, data: BoxStream<'_, VaultResult<Bytes>>) -> VaultResult<u64> {
        let mut writer = self
            .op
            .writer(key)
            .await
            .map_err(|e| map_err(&format!("opening writer for {key}"), e))?;

        match pump(&mut writer, data).await {
            Ok(written) => {
                writer
                    .close()
                    .await
                    .map_err(|e| map_err(&format!("committing blob {key}"), e))?;
                debug!(key = %key, bytes = written, "blob stored");
                Ok(written)
            }
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(key = %key, "aborting blob upload failed: {abort_err}");
                }
                Err(e)
            }
        }
    }

    async fn get(&self, key: &str) -> VaultResult<ByteStream> {
        match self.op.stat(key).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Err(VaultError::BlobNotFound(key.to_string())),
            Err(e) => return Err(map_err(&format!("stat blob {key}"), e)),
        }

        let stream = self
            .op
            .reader(key)
            .await
            .map_err(|e| map_err(&format!("opening blob {key}"), e))?
            .into_bytes_stream(..)
            .await
            .map_err(|e| map_err(&format!("streaming blob {key}"), e))?;

        let key = key.to_string();
        Ok(stream
            .map_err(move |e| VaultError::Storage(format!("reading blob {key}: {e}")))
            .boxed())
    }
}

async fn pump(writer: &mut Writer, mut data: BoxStream<'_, VaultResult<Bytes>>) -> VaultResult<u64> {
    let mut written = 0u64;
    while let Some(chunk) = data.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        writer
            .write(chunk)
            .await
            .map_err(|e| map_err("writing blob chunk", e))?;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn store() -> OpendalBlobStore {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        OpendalBlobStore::new(op)
    }

    async fn collect(s: ByteStream) -> Vec<u8> {
        s.try_fold(Vec::new(), |mut acc, b| async move {
            acc.extend_from_slice(&b);
            Ok(acc)
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = store();
        let parts = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"blob ")),
            Ok(Bytes::from_static(b"store")),
        ];

        assert!(!store.exists("abc").await.unwrap());
        let n = store.put("abc", stream::iter(parts).boxed()).await.unwrap();
        assert_eq!(n, 16);
        assert!(store.exists("abc").await.unwrap());

        let got = collect(store.get("abc").await.unwrap()).await;
        assert_eq!(got, b"hello blob store");
    }

    #[tokio::test]
    async fn get_missing_is_blob_not_found() {
        let store = store();
        match store.get("nope").await {
            Err(VaultError::BlobNotFound(k)) => assert_eq!(k, "nope"),
            Err(e) => panic!("expected BlobNotFound, got {e:?}"),
            Ok(_) => panic!("expected BlobNotFound, got a stream"),
        }
    }

    #[tokio::test]
    async fn failing_stream_leaves_no_blob() {
        let store = store();
        let parts = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(VaultError::FileChanged("a.txt".into())),
        ];

        let result = store.put("half", stream::iter(parts).boxed()).await;
        assert!(matches!(result, Err(VaultError::FileChanged(_))));
        assert!(!store.exists("half").await.unwrap());
    }
}
