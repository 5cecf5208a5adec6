//! Streaming AES-256-CBC codec with PKCS#7 padding
//!
//! Ciphertext format (binary):
//! ```text
//! [16 bytes: random IV][N * 16 bytes: CBC ciphertext, PKCS#7 padded]
//! ```
//!
//! Both directions are explicit state machines so memory stays O(chunk)
//! for arbitrarily large inputs:
//!   - `StreamEncryptor` buffers fewer than 16 plaintext bytes between
//!     updates and pads exactly once, in `finalize`.
//!   - `StreamDecryptor` always withholds the last full block until
//!     `finish`, since only then is it known to carry the padding.

use std::io::{self, Read, Write};

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cvault_core::{VaultError, VaultResult};
use rand::RngCore;

use crate::keys::DataKey;
use crate::{BLOCK_SIZE, CHUNK_SIZE};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Incremental CBC encryptor.
pub struct StreamEncryptor {
    cipher: Aes256CbcEnc,
    iv: [u8; BLOCK_SIZE],
    pending: Vec<u8>,
}

impl StreamEncryptor {
    /// Start a new stream under a fresh random IV.
    pub fn new(key: &DataKey) -> Self {
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        Self::with_iv(key, iv)
    }

    /// Start a stream under a caller-chosen IV. Output is bitwise
    /// deterministic for a given (key, IV, plaintext).
    pub fn with_iv(key: &DataKey, iv: [u8; BLOCK_SIZE]) -> Self {
        Self {
            cipher: Aes256CbcEnc::new(key.as_bytes().into(), (&iv).into()),
            iv,
            pending: Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE),
        }
    }

    /// The IV, which must be emitted ahead of any ciphertext.
    pub fn iv(&self) -> &[u8; BLOCK_SIZE] {
        &self.iv
    }

    /// Encrypt every complete block available so far.
    ///
    /// May return an empty vector when fewer than 16 bytes are buffered.
    pub fn update(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(plaintext);
        let ready = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        let mut out: Vec<u8> = self.pending.drain(..ready).collect();
        self.encrypt_blocks(&mut out);
        out
    }

    /// Pad the buffered tail and encrypt it. Always returns exactly one
    /// block: a full padding block when the input was block-aligned.
    pub fn finalize(self) -> Vec<u8> {
        let Self { cipher, pending, .. } = self;
        cipher.encrypt_padded_vec_mut::<Pkcs7>(&pending)
    }

    fn encrypt_blocks(&mut self, buf: &mut [u8]) {
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }
}

/// Incremental CBC decryptor with end-of-stream unpadding.
pub struct StreamDecryptor {
    key: DataKey,
    iv: Vec<u8>,
    cipher: Option<Aes256CbcDec>,
    buffer: Vec<u8>,
}

impl StreamDecryptor {
    pub fn new(key: &DataKey) -> Self {
        Self {
            key: key.clone(),
            iv: Vec::with_capacity(BLOCK_SIZE),
            cipher: None,
            buffer: Vec::with_capacity(CHUNK_SIZE + 2 * BLOCK_SIZE),
        }
    }

    /// Feed ciphertext; returns whatever plaintext can be released.
    ///
    /// The first 16 bytes of the stream are taken as the IV. Afterwards at
    /// least one block (and at most two minus one byte) stays buffered.
    pub fn update(&mut self, mut data: &[u8]) -> Vec<u8> {
        if self.cipher.is_none() {
            let take = (BLOCK_SIZE - self.iv.len()).min(data.len());
            self.iv.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.iv.len() < BLOCK_SIZE {
                return Vec::new();
            }
            self.cipher = Some(Aes256CbcDec::new(
                self.key.as_bytes().into(),
                GenericArray::from_slice(&self.iv),
            ));
        }

        self.buffer.extend_from_slice(data);
        if self.buffer.len() < 2 * BLOCK_SIZE {
            return Vec::new();
        }

        let ready = (self.buffer.len() - BLOCK_SIZE) / BLOCK_SIZE * BLOCK_SIZE;
        let mut out: Vec<u8> = self.buffer.drain(..ready).collect();
        self.decrypt_blocks(&mut out);
        out
    }

    /// Signal end-of-stream: decrypt the withheld block and strip padding.
    pub fn finish(self) -> VaultResult<Vec<u8>> {
        let Some(cipher) = self.cipher else {
            return Err(VaultError::CorruptedCiphertext(format!(
                "stream ended after {} bytes, inside the 16-byte IV",
                self.iv.len()
            )));
        };
        if self.buffer.len() != BLOCK_SIZE {
            return Err(VaultError::CorruptedCiphertext(
                "ciphertext length is not a positive multiple of 16 bytes".into(),
            ));
        }

        let mut block = self.buffer;
        cipher
            .decrypt_padded_mut::<Pkcs7>(&mut block)
            .map(<[u8]>::to_vec)
            .map_err(|_| VaultError::CorruptedCiphertext("invalid PKCS#7 padding".into()))
    }

    fn decrypt_blocks(&mut self, buf: &mut [u8]) {
        if let Some(cipher) = self.cipher.as_mut() {
            for block in buf.chunks_exact_mut(BLOCK_SIZE) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
        }
    }
}

/// Lazy ciphertext producer over a plaintext reader.
///
/// Yields the IV first, then ciphertext for each 16 KiB of plaintext read,
/// then the padded final block. Fused after the final block or an error.
pub struct EncryptStream<R> {
    reader: R,
    encryptor: Option<StreamEncryptor>,
    iv_sent: bool,
    buf: Vec<u8>,
}

/// Wrap `reader` in an encrypting producer under a fresh IV.
pub fn encrypt_reader<R: Read>(reader: R, key: &DataKey) -> EncryptStream<R> {
    EncryptStream {
        reader,
        encryptor: Some(StreamEncryptor::new(key)),
        iv_sent: false,
        buf: vec![0u8; CHUNK_SIZE],
    }
}

impl<R: Read> Iterator for EncryptStream<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let encryptor = self.encryptor.as_mut()?;
        if !self.iv_sent {
            self.iv_sent = true;
            return Some(Ok(encryptor.iv().to_vec()));
        }

        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    let last = self.encryptor.take()?;
                    return Some(Ok(last.finalize()));
                }
                Ok(n) => {
                    let out = encryptor.update(&self.buf[..n]);
                    if !out.is_empty() {
                        return Some(Ok(out));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.encryptor = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Encrypt an in-memory buffer. Convenience over [`EncryptStream`].
pub fn encrypt_bytes(plaintext: &[u8], key: &DataKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK_SIZE + plaintext.len() + BLOCK_SIZE);
    // Reading from a slice cannot fail
    for piece in encrypt_reader(plaintext, key).flatten() {
        out.extend_from_slice(&piece);
    }
    out
}

/// Decrypt an IV-prefixed ciphertext stream into `writer`.
///
/// Returns the number of plaintext bytes written.
pub fn decrypt_stream<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    key: &DataKey,
) -> VaultResult<u64> {
    let mut decryptor = StreamDecryptor::new(key);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        let plain = decryptor.update(&buf[..n]);
        writer.write_all(&plain)?;
        written += plain.len() as u64;
    }

    let tail = decryptor.finish()?;
    writer.write_all(&tail)?;
    writer.flush()?;
    Ok(written + tail.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_data_key;
    use proptest::prelude::*;

    fn decrypt_vec(ciphertext: &[u8], key: &DataKey) -> VaultResult<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_stream(ciphertext, &mut out, key)?;
        Ok(out)
    }

    #[test]
    fn test_roundtrip_small() {
        let key = generate_data_key();
        let plaintext = b"hello, encrypted world!";

        let ciphertext = encrypt_bytes(plaintext, &key);
        assert_eq!(decrypt_vec(&ciphertext, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_roundtrip_empty() {
        let key = generate_data_key();
        let ciphertext = encrypt_bytes(b"", &key);

        // IV + one full padding block
        assert_eq!(ciphertext.len(), 32);
        assert_eq!(decrypt_vec(&ciphertext, &key).unwrap(), b"");
    }

    #[test]
    fn test_block_aligned_input_gets_full_padding_block() {
        let key = generate_data_key();
        let plaintext = vec![0x5Au8; 64];
        let ciphertext = encrypt_bytes(&plaintext, &key);

        assert_eq!(ciphertext.len(), 16 + 64 + 16);
        assert_eq!(decrypt_vec(&ciphertext, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_roundtrip_spans_many_chunks() {
        let key = generate_data_key();
        let plaintext: Vec<u8> = (0u32..(3 * CHUNK_SIZE as u32 + 7))
            .map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8)
            .collect();

        let ciphertext = encrypt_bytes(&plaintext, &key);
        assert_eq!(ciphertext.len(), 16 + (plaintext.len() / 16 + 1) * 16);
        assert_eq!(decrypt_vec(&ciphertext, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_stream_yields_iv_first_then_block_multiples() {
        let key = generate_data_key();
        let plaintext = vec![1u8; CHUNK_SIZE + 5];
        let pieces: Vec<Vec<u8>> = encrypt_reader(plaintext.as_slice(), &key)
            .collect::<io::Result<_>>()
            .unwrap();

        assert_eq!(pieces[0].len(), BLOCK_SIZE, "first piece is the IV");
        for piece in &pieces[1..] {
            assert_eq!(piece.len() % BLOCK_SIZE, 0);
        }
        assert_eq!(pieces.last().unwrap().len(), BLOCK_SIZE);
    }

    #[test]
    fn test_deterministic_given_iv() {
        let key = generate_data_key();
        let iv = [9u8; BLOCK_SIZE];

        let mut a = StreamEncryptor::with_iv(&key, iv);
        let mut b = StreamEncryptor::with_iv(&key, iv);
        let mut out_a = a.update(b"same plaintext, same key, same iv");
        out_a.extend(a.finalize());
        let mut out_b = b.update(b"same plaintext, same key, same iv");
        out_b.extend(b.finalize());

        assert_eq!(out_a, out_b);
    }

    #[test]
    fn test_fresh_iv_per_stream() {
        let key = generate_data_key();
        let a = encrypt_bytes(b"identical", &key);
        let b = encrypt_bytes(b"identical", &key);
        assert_ne!(a, b, "random IVs must make ciphertexts differ");
    }

    #[test]
    fn test_decryptor_withholds_last_block() {
        let key = generate_data_key();
        let ciphertext = encrypt_bytes(&[7u8; 48], &key);

        let mut dec = StreamDecryptor::new(&key);
        // IV + exactly one block: nothing may be released yet
        assert!(dec.update(&ciphertext[..32]).is_empty());
        // A second block releases the first one only
        assert_eq!(dec.update(&ciphertext[32..48]).len(), 16);
        let mut released = dec.update(&ciphertext[48..]);
        released.extend(dec.finish().unwrap());
        assert_eq!(released.len(), 32);
    }

    #[test]
    fn test_truncated_ciphertext_is_corrupted() {
        let key = generate_data_key();
        let ciphertext = encrypt_bytes(b"some file content", &key);

        let result = decrypt_vec(&ciphertext[..ciphertext.len() - 3], &key);
        assert!(matches!(result, Err(VaultError::CorruptedCiphertext(_))));
    }

    #[test]
    fn test_iv_only_is_corrupted() {
        let key = generate_data_key();
        let result = decrypt_vec(&[0u8; 16], &key);
        assert!(matches!(result, Err(VaultError::CorruptedCiphertext(_))));

        let result = decrypt_vec(&[0u8; 9], &key);
        assert!(matches!(result, Err(VaultError::CorruptedCiphertext(_))));
    }

    #[test]
    fn test_invalid_padding_is_corrupted() {
        let key = generate_data_key();
        let iv = [3u8; BLOCK_SIZE];
        // Encrypt a raw block whose last byte claims 0x20 bytes of padding
        let mut enc = StreamEncryptor::with_iv(&key, iv);
        let mut bad = iv.to_vec();
        bad.extend(enc.update(&[0x20u8; BLOCK_SIZE]));

        let result = decrypt_vec(&bad, &key);
        assert!(matches!(result, Err(VaultError::CorruptedCiphertext(_))));
    }

    #[test]
    fn test_zero_padding_byte_is_corrupted() {
        let key = generate_data_key();
        let iv = [4u8; BLOCK_SIZE];
        let mut enc = StreamEncryptor::with_iv(&key, iv);
        let mut bad = iv.to_vec();
        bad.extend(enc.update(&[0u8; BLOCK_SIZE]));

        let result = decrypt_vec(&bad, &key);
        assert!(matches!(result, Err(VaultError::CorruptedCiphertext(_))));
    }

    #[test]
    fn test_final_block_carries_pkcs7_padding() {
        let key = generate_data_key();
        let iv = [5u8; BLOCK_SIZE];
        let mut enc = StreamEncryptor::with_iv(&key, iv);
        assert!(enc.update(b"abc").is_empty());
        let last = enc.finalize();
        assert_eq!(last.len(), BLOCK_SIZE);

        // Decrypt the block raw to inspect the padding bytes
        let mut raw = last.clone();
        let mut dec = Aes256CbcDec::new(key.as_bytes().into(), (&iv).into());
        dec.decrypt_block_mut(GenericArray::from_mut_slice(&mut raw));
        assert_eq!(&raw[..3], b"abc");
        assert!(raw[3..].iter().all(|&b| b == 13));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn roundtrip_any_length(data in proptest::collection::vec(any::<u8>(), 0..=40_000)) {
            let key = generate_data_key();
            let ciphertext = encrypt_bytes(&data, &key);
            prop_assert_eq!((ciphertext.len() - BLOCK_SIZE) % BLOCK_SIZE, 0);
            prop_assert_eq!(decrypt_vec(&ciphertext, &key).unwrap(), data);
        }

        #[test]
        fn decrypt_is_independent_of_feed_boundaries(
            data in proptest::collection::vec(any::<u8>(), 0..=2_000),
            step in 1usize..=50,
        ) {
            let key = generate_data_key();
            let ciphertext = encrypt_bytes(&data, &key);

            let mut dec = StreamDecryptor::new(&key);
            let mut out = Vec::new();
            for piece in ciphertext.chunks(step) {
                out.extend(dec.update(piece));
            }
            out.extend(dec.finish().unwrap());
            prop_assert_eq!(out, data);
        }
    }
}
