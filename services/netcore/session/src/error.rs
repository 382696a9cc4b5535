//! Error types for connection management.

use netcore_socket::SocketError;
use thiserror::Error;

/// Errors raised by contexts, the registry and listeners
#[derive(Error, Debug)]
pub enum SessionError {
    /// A required input was missing or empty
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The identifier is already held by a live context
    #[error("context identifier already registered: {0}")]
    Collision(String),

    /// The context is closing or closed
    #[error("connection is not open")]
    NotConnected,

    /// The registry is at its client limit
    #[error("too many clients (limit {0})")]
    TooManyClients(usize),

    /// A detached operation was dropped before reporting its result
    #[error("operation aborted before completion")]
    Aborted,

    /// I/O failure on the underlying transport
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Failure while creating or configuring a socket
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),
}

impl SessionError {
    /// OS error code carried by the failure, if any
    pub fn os_code(&self) -> Option<i32> {
        match self {
            SessionError::Transport(e) => e.raw_os_error(),
            SessionError::Socket(e) => e.os_code(),
            _ => None,
        }
    }
}
