//! IP address values and low-level socket providers for netcore.
//!
//! This crate holds the pieces that sit directly on top of the OS:
//!
//! - **Addresses**: [`IpAddress`] parsing, formatting, classification and
//!   IPv4 masking, plus [`SocketEndpoint`] (address + port)
//! - **Sockets**: [`SocketProvider`] wrapping one exclusively owned raw,
//!   stream or datagram socket
//!
//! ## Example
//!
//! ```rust,no_run
//! use netcore_socket::{AddressFamily, IpAddress, SocketEndpoint, SocketProvider};
//!
//! # fn example() -> Result<(), netcore_socket::SocketError> {
//! let mut socket = SocketProvider::datagram(AddressFamily::IPv4)?;
//! socket.bind(SocketEndpoint::new(IpAddress::loopback(AddressFamily::IPv4), 0), true)?;
//!
//! let mut buf = [0u8; 1500];
//! let (len, peer) = socket.receive_from(&mut buf)?;
//! println!("{} bytes from {}", len, peer);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod endpoint;
pub mod error;
pub mod family;
pub mod provider;

pub use address::{AddressClass, IpAddress};
pub use endpoint::SocketEndpoint;
pub use error::SocketError;
pub use family::{AddressFamily, IPV4_LENGTH, IPV6_LENGTH};
pub use provider::{SocketKind, SocketProvider, DEFAULT_BACKLOG, IPPROTO_RAW};
