//! Key derivation: password → 256-bit password key via PBKDF2-HMAC-SHA256

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// PBKDF2 work factor. Part of the persisted key format: records carry no
/// iteration count, so changing this orphans every existing record.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// A key derived from the user's password. Only ever used to wrap or
/// unwrap the data key. Zeroized on drop.
pub struct PasswordKey {
    bytes: [u8; KEY_SIZE],
}

impl PasswordKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for PasswordKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for PasswordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the password key from a password and its record's salt.
pub fn derive_password_key(password: &SecretString, salt: &[u8]) -> PasswordKey {
    derive_with_iterations(password, salt, PBKDF2_ITERATIONS)
}

fn derive_with_iterations(password: &SecretString, salt: &[u8], iterations: u32) -> PasswordKey {
    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(
        password.expose_secret().as_bytes(),
        salt,
        iterations,
        &mut bytes,
    );
    PasswordKey { bytes }
}
