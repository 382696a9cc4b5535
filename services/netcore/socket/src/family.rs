//! Address family tag shared by addresses and sockets.

use serde::{Deserialize, Serialize};
use socket2::Domain;
use std::fmt;

/// Length in bytes of an IPv4 address
pub const IPV4_LENGTH: usize = 4;
/// Length in bytes of an IPv6 address
pub const IPV6_LENGTH: usize = 16;

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Internet Protocol version 4
    IPv4,
    /// Internet Protocol version 6
    IPv6,
}

impl AddressFamily {
    /// Number of bytes in an address of this family
    pub fn address_length(self) -> usize {
        match self {
            AddressFamily::IPv4 => IPV4_LENGTH,
            AddressFamily::IPv6 => IPV6_LENGTH,
        }
    }

    /// Socket domain used when opening sockets of this family
    pub fn domain(self) -> Domain {
        match self {
            AddressFamily::IPv4 => Domain::IPV4,
            AddressFamily::IPv6 => Domain::IPV6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::IPv4 => f.write_str("IPv4"),
            AddressFamily::IPv6 => f.write_str("IPv6"),
        }
    }
}
