//! The encrypting upload stream and its mid-backup change guard.

mod common;

use common::write_test_file;
use cvault_core::VaultError;
use cvault_crypto::{decrypt_stream, generate_data_key, hash_bytes};
use cvault_engine::pipeline::encrypt_file;
use futures::StreamExt;
use tempfile::TempDir;

#[tokio::test]
async fn stream_decrypts_back_to_file_content() {
    let tmp = TempDir::new().unwrap();
    let content: Vec<u8> = (0u32..100_000).map(|i| (i % 253) as u8).collect();
    let path = write_test_file(tmp.path(), "big.bin", &content);
    let key = generate_data_key();

    let pieces: Vec<_> = encrypt_file(&path, &key, &hash_bytes(&content))
        .await
        .unwrap()
        .collect()
        .await;

    let mut ciphertext = Vec::new();
    for piece in pieces {
        ciphertext.extend_from_slice(&piece.unwrap());
    }
    let mut plain = Vec::new();
    decrypt_stream(ciphertext.as_slice(), &mut plain, &key).unwrap();
    assert_eq!(plain, content);
}

#[tokio::test]
async fn hash_mismatch_ends_stream_with_file_changed() {
    let tmp = TempDir::new().unwrap();
    let path = write_test_file(tmp.path(), "moving.txt", b"content at upload time");
    let key = generate_data_key();
    let stale = hash_bytes(b"content at hash time");

    let pieces: Vec<_> = encrypt_file(&path, &key, &stale)
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(pieces.last(), Some(Err(VaultError::FileChanged(_)))));
    assert!(pieces[..pieces.len() - 1].iter().all(|p| p.is_ok()));
}
