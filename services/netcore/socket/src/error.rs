//! Socket and address error types.

use std::io;
use thiserror::Error;

/// Errors raised by address handling and socket providers
#[derive(Error, Debug)]
pub enum SocketError {
    /// Address text could not be parsed
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A required argument was missing or out of range
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation is only defined for IPv4 operands
    #[error("operation requires IPv4 operands")]
    NotIpv4,

    /// Operands belong to different address families
    #[error("address family mismatch")]
    FamilyMismatch,

    /// Operation is not valid in the socket's current role or kind
    #[error("socket usage error: {0}")]
    Usage(&'static str),

    /// The OS refused the header-inclusion option on a raw socket
    #[error("header inclusion option rejected by the OS: {0}")]
    HeaderInclusion(#[source] io::Error),

    /// OS-level socket failure
    #[error("transport error (os code {code:?}): {source}")]
    Transport {
        /// Raw OS error code, when the failure came from the OS
        code: Option<i32>,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl SocketError {
    /// OS error code carried by a transport failure
    pub fn os_code(&self) -> Option<i32> {
        match self {
            SocketError::Transport { code, .. } => *code,
            SocketError::HeaderInclusion(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(source: io::Error) -> Self {
        SocketError::Transport {
            code: source.raw_os_error(),
            source,
        }
    }
}
