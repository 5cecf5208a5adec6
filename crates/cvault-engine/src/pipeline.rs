//! Async adapters between local files and the blob store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use cvault_core::{VaultError, VaultResult};
use cvault_crypto::{ContentHasher, DataKey, StreamDecryptor, StreamEncryptor, CHUNK_SIZE};
use cvault_storage::BlobStore;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

struct UploadState {
    file: tokio::fs::File,
    path: PathBuf,
    encryptor: Option<StreamEncryptor>,
    iv_sent: bool,
    hasher: ContentHasher,
    expected_hash: String,
    buf: Vec<u8>,
}

/// Open `path` as a lazy ciphertext stream: IV, then CBC blocks per 16 KiB
/// read, then the padded tail.
///
/// The plaintext is re-hashed as it streams. If the digest at end-of-file
/// differs from `expected_hash` the stream ends in `FileChanged` instead of
/// the final block, which aborts the blob write.
pub async fn encrypt_file(
    path: &Path,
    key: &DataKey,
    expected_hash: &str,
) -> VaultResult<BoxStream<'static, VaultResult<Bytes>>> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| VaultError::fs(path, e))?;

    let state = UploadState {
        file,
        path: path.to_path_buf(),
        encryptor: Some(StreamEncryptor::new(key)),
        iv_sent: false,
        hasher: ContentHasher::new(),
        expected_hash: expected_hash.to_string(),
        buf: vec![0u8; CHUNK_SIZE],
    };

    Ok(stream::try_unfold(state, |mut st| async move {
        let Some(encryptor) = st.encryptor.as_ref() else {
            return Ok(None);
        };
        if !st.iv_sent {
            let iv = Bytes::copy_from_slice(encryptor.iv());
            st.iv_sent = true;
            return Ok(Some((iv, st)));
        }

        loop {
            let n = st
                .file
                .read(&mut st.buf)
                .await
                .map_err(|e| VaultError::fs(&st.path, e))?;

            if n == 0 {
                let Some(encryptor) = st.encryptor.take() else {
                    return Ok(None);
                };
                let actual = std::mem::take(&mut st.hasher).finalize_hex();
                if actual != st.expected_hash {
                    return Err(VaultError::FileChanged(st.path.display().to_string()));
                }
                return Ok(Some((Bytes::from(encryptor.finalize()), st)));
            }

            st.hasher.update(&st.buf[..n]);
            let Some(encryptor) = st.encryptor.as_mut() else {
                return Ok(None);
            };
            let out = encryptor.update(&st.buf[..n]);
            if !out.is_empty() {
                return Ok(Some((Bytes::from(out), st)));
            }
        }
    })
    .boxed())
}

/// Download blob `hash` and decrypt it to `dest` via a temp sibling that is
/// renamed into place only after the whole stream decrypted cleanly.
///
/// Returns the plaintext bytes written.
pub async fn decrypt_to_file(
    blobs: &Arc<dyn BlobStore>,
    hash: &str,
    key: &DataKey,
    dest: &Path,
) -> VaultResult<u64> {
    let mut ciphertext = blobs.get(hash).await?;
    let tmp = tmp_sibling(dest);

    let result = async {
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| VaultError::fs(&tmp, e))?;
        let mut decryptor = StreamDecryptor::new(key);
        let mut written = 0u64;

        while let Some(chunk) = ciphertext.try_next().await? {
            let plain = decryptor.update(&chunk);
            file.write_all(&plain)
                .await
                .map_err(|e| VaultError::fs(&tmp, e))?;
            written += plain.len() as u64;
        }

        let tail = decryptor.finish()?;
        file.write_all(&tail)
            .await
            .map_err(|e| VaultError::fs(&tmp, e))?;
        file.sync_all().await.map_err(|e| VaultError::fs(&tmp, e))?;
        Ok::<_, VaultError>(written + tail.len() as u64)
    }
    .await;

    match result {
        Ok(written) => {
            tokio::fs::rename(&tmp, dest)
                .await
                .map_err(|e| VaultError::fs(dest, e))?;
            Ok(written)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

/// `dir/name.ext` → `dir/name.ext.cvault_tmp`
pub(crate) fn tmp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".cvault_tmp");
    dest.with_file_name(name)
}
