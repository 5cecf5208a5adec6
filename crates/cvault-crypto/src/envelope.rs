//! Envelope encryption: the data key sealed under a password-derived key.
//!
//! Record layout (all base64):
//! ```text
//! salt       = 16 random bytes (PBKDF2 salt)
//! nonce      = 12 random bytes (AES-GCM nonce)
//! ciphertext = AES-256-GCM(password_key, nonce, DEK) || 16-byte tag
//! ```
//!
//! There is no separate password verifier: the GCM tag is the only check,
//! so a wrong password always surfaces as `InvalidPassword`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cvault_core::{VaultError, VaultResult, WrappedKeyRecord};
use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroize;

use crate::kdf::derive_password_key;
use crate::keys::DataKey;
use crate::{KEY_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE};

/// Seal `dek` under `password` with a fresh salt and nonce.
pub fn wrap_data_key(dek: &DataKey, password: &SecretString) -> VaultResult<WrappedKeyRecord> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let password_key = derive_password_key(password, &salt);
    let cipher = Aes256Gcm::new(password_key.as_bytes().into());

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), dek.as_bytes().as_ref())
        .map_err(|e| VaultError::Crypto(format!("key wrapping failed: {e}")))?;

    Ok(WrappedKeyRecord {
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce_bytes),
        ciphertext: STANDARD.encode(ciphertext),
    })
}

/// Open a wrapped key record with `password`.
///
/// Fails with `InvalidPassword` when the GCM tag does not verify, and with
/// `Crypto` when the record itself is malformed.
pub fn unwrap_data_key(record: &WrappedKeyRecord, password: &SecretString) -> VaultResult<DataKey> {
    let salt = decode_field("salt", &record.salt, SALT_SIZE)?;
    let nonce_bytes = decode_field("nonce", &record.nonce, NONCE_SIZE)?;
    let ciphertext = decode_field("ciphertext", &record.ciphertext, KEY_SIZE + TAG_SIZE)?;

    let password_key = derive_password_key(password, &salt);
    let cipher = Aes256Gcm::new(password_key.as_bytes().into());

    let mut plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
        .map_err(|_| VaultError::InvalidPassword)?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(DataKey::from_bytes(key_bytes))
}

/// Unwrap with `old` and re-seal the same data key under `new`.
pub fn rewrap_data_key(
    record: &WrappedKeyRecord,
    old: &SecretString,
    new: &SecretString,
) -> VaultResult<WrappedKeyRecord> {
    let dek = unwrap_data_key(record, old)?;
    wrap_data_key(&dek, new)
}

fn decode_field(name: &str, value: &str, expected_len: usize) -> VaultResult<Vec<u8>> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| VaultError::Crypto(format!("wrapped key {name} is not valid base64: {e}")))?;
    if bytes.len() != expected_len {
        return Err(VaultError::Crypto(format!(
            "wrapped key {name} has {} bytes (expected {expected_len})",
            bytes.len()
        )));
    }
    Ok(bytes)
}
