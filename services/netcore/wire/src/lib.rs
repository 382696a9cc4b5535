//! Timestamp codec, keyed message signing and payload sealing for netcore.
//!
//! Protocol handlers use this crate to put time-bound, authenticated values
//! on the wire. Keys come from a [`netcore_storage::KeyStore`] addressed by
//! bucket and handle.
//!
//! ## Features
//!
//! - **Timestamps**: base-10 seconds since 1970-01-01T00:00:00Z
//! - **Signatures**: HMAC-SHA256 tokens naming the signing key handle
//! - **Sealing** (`crypto` feature): ChaCha20-Poly1305 with a prefixed nonce
//!
//! ## Token Format
//!
//! ```text
//! +-------------+---+-------------------+---+---------------------+
//! | key handle  | . | issue time (secs) | . | HMAC-SHA256 (hex)   |
//! +-------------+---+-------------------+---+---------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(feature = "crypto")]
pub mod crypto;
pub mod error;
pub mod signing;
pub mod timestamp;

// Re-export main types
pub use error::WireError;
pub use signing::{sign, verify, SignedToken};

#[cfg(feature = "crypto")]
pub use crypto::{open, open_with_store, seal, seal_with_store, SealedMessage};
