//! ChaCha20-Poly1305 payload sealing.
//!
//! Sealed layout: `nonce (12 bytes) || ciphertext || tag (16 bytes)`. A fresh
//! random nonce is drawn for every seal.

use crate::error::WireError;
use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use chrono::{DateTime, Utc};
use netcore_storage::KeyStore;

/// Nonce length in bytes
pub const NONCE_LEN: usize = 12;
/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;
/// Required key length in bytes
pub const KEY_LEN: usize = 32;

fn cipher(key: &[u8]) -> Result<ChaCha20Poly1305, WireError> {
    ChaCha20Poly1305::new_from_slice(key).map_err(|_| WireError::Crypto)
}

/// Encrypt and authenticate `plaintext`, binding `aad`
pub fn seal(key: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Bytes, WireError> {
    let cipher = cipher(key)?;
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| WireError::Crypto)?;

    let mut sealed = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed.freeze())
}

/// Verify and decrypt a sealed payload
pub fn open(key: &[u8], aad: &[u8], sealed: &[u8]) -> Result<Bytes, WireError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(WireError::Crypto);
    }
    let cipher = cipher(key)?;
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map(Bytes::from)
        .map_err(|_| WireError::Crypto)
}

/// Payload sealed with a stored key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    /// Handle of the key within its bucket
    pub handle: String,
    /// Nonce, ciphertext and tag
    pub sealed: Bytes,
}

/// Seal with the newest key of `bucket` valid at `now`
pub async fn seal_with_store(
    store: &dyn KeyStore,
    bucket: &str,
    aad: &[u8],
    plaintext: &[u8],
    now: DateTime<Utc>,
) -> Result<SealedMessage, WireError> {
    let (handle, key) = store
        .newest_valid_key(bucket, now)
        .await?
        .ok_or_else(|| WireError::NoValidKey(bucket.to_string()))?;
    Ok(SealedMessage {
        sealed: seal(&key.material, aad, plaintext)?,
        handle,
    })
}

/// Open a message sealed by [`seal_with_store`]
pub async fn open_with_store(
    store: &dyn KeyStore,
    bucket: &str,
    aad: &[u8],
    message: &SealedMessage,
) -> Result<Bytes, WireError> {
    let key = store
        .get_key(bucket, &message.handle)
        .await?
        .ok_or_else(|| WireError::KeyNotFound {
            bucket: bucket.to_string(),
            handle: message.handle.clone(),
        })?;
    open(&key.material, aad, &message.sealed)
}
