//! cvault-crypto: client-side envelope encryption for cvault
//!
//! Key hierarchy:
//! ```text
//! Password
//!   └── Password Key (256-bit, PBKDF2-HMAC-SHA256, 10k iterations, 16-byte salt)
//!       └── wraps Data Encryption Key (256-bit random, AES-256-GCM, 96-bit nonce)
//!           └── File content: AES-256-CBC + PKCS#7, fresh 16-byte IV per blob
//! ```
//!
//! Blob format: `[16-byte IV][CBC ciphertext, padded to a multiple of 16]`.
//! Blobs are addressed by the SHA-256 of their plaintext, so identical
//! content dedups regardless of the IV it was encrypted under.

pub mod envelope;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod stream;

pub use envelope::{rewrap_data_key, unwrap_data_key, wrap_data_key};
pub use hash::{hash_bytes, hash_file, hash_reader, is_content_hash, ContentHasher};
pub use kdf::{derive_password_key, PasswordKey};
pub use keys::{generate_data_key, DataKey};
pub use stream::{
    decrypt_stream, encrypt_bytes, encrypt_reader, EncryptStream, StreamDecryptor,
    StreamEncryptor,
};

/// Size of a data or password key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a PBKDF2 salt
pub const SALT_SIZE: usize = 16;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of an AES-GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// AES block size; also the IV length of the stream codec
pub const BLOCK_SIZE: usize = 16;

/// Plaintext bytes consumed per stream codec step
pub const CHUNK_SIZE: usize = 16 * 1024;
