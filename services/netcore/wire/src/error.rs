//! Wire error types.

use netcore_storage::KeyStoreError;
use thiserror::Error;

/// Errors raised while encoding, signing or sealing messages
#[derive(Error, Debug)]
pub enum WireError {
    /// Timestamp text is not a base-10 integer
    #[error("invalid timestamp: {0:?}")]
    Timestamp(String),

    /// Timestamp seconds outside the representable range
    #[error("timestamp out of range: {0}")]
    TimestampRange(i64),

    /// Token text does not have the `handle.timestamp.mac` shape
    #[error("malformed token")]
    MalformedToken,

    /// MAC does not match the payload
    #[error("signature mismatch")]
    Signature,

    /// Token is older (or further in the future) than allowed
    #[error("token expired")]
    Expired,

    /// The token names a key the store does not hold
    #[error("key {bucket}/{handle} not found")]
    KeyNotFound {
        /// Bucket searched
        bucket: String,
        /// Handle named by the token
        handle: String,
    },

    /// The named key was not valid when the token was issued
    #[error("key {0} not valid at token time")]
    KeyNotValid(String),

    /// No key of the bucket is currently valid
    #[error("no valid key in bucket {0}")]
    NoValidKey(String),

    /// Bad key length or failed AEAD operation
    #[error("crypto failure")]
    Crypto,

    /// Key store failure
    #[error("key store error: {0}")]
    Storage(#[from] KeyStoreError),
}
