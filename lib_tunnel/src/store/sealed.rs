//! # Sealed Store
//!
//! ChaCha20-Poly1305 layer over a [`FileStore`] backend. Sealed items are
//! stored as a random 12-byte nonce prefix followed by ciphertext+tag; the
//! 32-byte key arrives base64-encoded in `XPS_PASSWORD`. Items that must stay
//! readable by other consumers (the PAC file) bypass the seal through the
//! `*_plain` operations.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use super::backend::{FileStore, StoreError};

/// ChaCha20-Poly1305 nonce length.
const NONCE_SIZE: usize = 12;
/// Poly1305 tag length.
const TAG_SIZE: usize = 16;

/// Encrypting wrapper around a store backend.
#[derive(Clone)]
pub struct SealedStore<S> {
    inner: S,
    cipher: ChaCha20Poly1305,
}

impl<S: FileStore> SealedStore<S> {
    /// Wraps `inner` with the given 32-byte sealing key.
    pub fn new(inner: S, key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            inner,
        }
    }

    /// Seals `plaintext` and stores it at `path`.
    pub async fn save(&self, path: &str, plaintext: &[u8]) -> Result<(), StoreError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        let mut wire = Vec::with_capacity(NONCE_SIZE + sealed.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&sealed);
        self.inner.save(path, &wire).await
    }

    /// Loads and opens the sealed artifact at `path`.
    ///
    /// Content shorter than a nonce plus tag is treated as absent, so a
    /// half-written artifact gets regenerated instead of wedging startup.
    pub async fn load(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let wire = self.inner.load(path).await?;
        if wire.len() <= NONCE_SIZE + TAG_SIZE {
            return Err(StoreError::NotFound(path.to_string()));
        }

        self.cipher
            .decrypt(Nonce::from_slice(&wire[..NONCE_SIZE]), &wire[NONCE_SIZE..])
            .map_err(|e| StoreError::Crypto(e.to_string()))
    }

    /// Stores `plaintext` unsealed.
    pub async fn save_plain(&self, path: &str, plaintext: &[u8]) -> Result<(), StoreError> {
        self.inner.save(path, plaintext).await
    }

    /// Loads an unsealed artifact.
    pub async fn load_plain(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.inner.load(path).await
    }
}
