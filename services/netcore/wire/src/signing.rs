//! Time-bound message signatures.
//!
//! A token binds a payload to a key handle and an issue time. The MAC is
//! HMAC-SHA256 over `bucket 0x00 timestamp 0x00 payload`, where `timestamp`
//! is the wire form from [`crate::timestamp`]. Text form of a token is
//! `handle.timestamp.hexmac`.

use crate::error::WireError;
use crate::timestamp;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use netcore_storage::KeyStore;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Signature over a payload, naming the key that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedToken {
    /// Handle of the signing key within its bucket
    pub handle: String,
    /// Issue time, whole seconds
    pub timestamp: DateTime<Utc>,
    /// HMAC-SHA256 tag
    pub mac: Vec<u8>,
}

fn keyed_mac(
    key: &[u8],
    bucket: &str,
    timestamp: DateTime<Utc>,
    payload: &[u8],
) -> Result<HmacSha256, WireError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| WireError::Crypto)?;
    mac.update(bucket.as_bytes());
    mac.update(&[0]);
    mac.update(timestamp::encode_time(timestamp).as_bytes());
    mac.update(&[0]);
    mac.update(payload);
    Ok(mac)
}

/// Sign `payload` with the newest key of `bucket` valid at `now`
pub async fn sign(
    store: &dyn KeyStore,
    bucket: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<SignedToken, WireError> {
    let (handle, key) = store
        .newest_valid_key(bucket, now)
        .await?
        .ok_or_else(|| WireError::NoValidKey(bucket.to_string()))?;

    let issued = timestamp::truncate(now)?;
    let mac = keyed_mac(&key.material, bucket, issued, payload)?
        .finalize()
        .into_bytes()
        .to_vec();

    debug!("Signed {} byte payload with {}/{}", payload.len(), bucket, handle);
    Ok(SignedToken {
        handle,
        timestamp: issued,
        mac,
    })
}

/// Check `token` against `payload`.
///
/// The named key must exist and have been valid at the token's issue time,
/// the MAC must match, and the token must be no more than `max_age` away
/// from `now` in either direction.
pub async fn verify(
    store: &dyn KeyStore,
    bucket: &str,
    token: &SignedToken,
    payload: &[u8],
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<(), WireError> {
    let key = store
        .get_key(bucket, &token.handle)
        .await?
        .ok_or_else(|| WireError::KeyNotFound {
            bucket: bucket.to_string(),
            handle: token.handle.clone(),
        })?;

    if !key.is_valid_at(token.timestamp) {
        return Err(WireError::KeyNotValid(token.handle.clone()));
    }

    keyed_mac(&key.material, bucket, token.timestamp, payload)?
        .verify_slice(&token.mac)
        .map_err(|_| WireError::Signature)?;

    let age = now.signed_duration_since(token.timestamp);
    if age > max_age || -age > max_age {
        return Err(WireError::Expired);
    }
    Ok(())
}

impl fmt::Display for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.handle,
            timestamp::encode_time(self.timestamp),
            hex::encode(&self.mac)
        )
    }
}

impl FromStr for SignedToken {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(3, '.');
        let (Some(mac), Some(ts), Some(handle)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(WireError::MalformedToken);
        };
        if handle.is_empty() || mac.is_empty() {
            return Err(WireError::MalformedToken);
        }
        Ok(Self {
            handle: handle.to_string(),
            timestamp: timestamp::decode(ts)?,
            mac: hex::decode(mac).map_err(|_| WireError::MalformedToken)?,
        })
    }
}
