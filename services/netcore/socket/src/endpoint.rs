//! Address + port pair used for bind, connect and peer reporting.

use crate::address::IpAddress;
use crate::error::SocketError;
use serde::{Deserialize, Serialize};
use socket2::SockAddr;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

/// A host address with a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SocketEndpoint {
    /// Host address
    pub address: IpAddress,
    /// Port number
    pub port: u16,
}

impl SocketEndpoint {
    /// Create an endpoint
    pub fn new(address: IpAddress, port: u16) -> Self {
        Self { address, port }
    }

    /// Convert to a standard library socket address, keeping the IPv6 scope
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.address {
            IpAddress::V4(bytes) => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(bytes), self.port)),
            IpAddress::V6 { bytes, scope } => {
                SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(bytes), self.port, 0, scope))
            }
        }
    }

    pub(crate) fn from_sock_addr(addr: &SockAddr) -> Result<Self, SocketError> {
        addr.as_socket()
            .map(Self::from)
            .ok_or(SocketError::InvalidArgument(
                "socket address is not an IP endpoint".to_string(),
            ))
    }
}

impl From<SocketAddr> for SocketEndpoint {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::new(IpAddress::from(*v4.ip()), v4.port()),
            SocketAddr::V6(v6) => Self::new(
                IpAddress::V6 {
                    bytes: v6.ip().octets(),
                    scope: v6.scope_id(),
                },
                v6.port(),
            ),
        }
    }
}

impl From<SocketEndpoint> for SocketAddr {
    fn from(endpoint: SocketEndpoint) -> Self {
        endpoint.to_socket_addr()
    }
}

impl From<SocketEndpoint> for SockAddr {
    fn from(endpoint: SocketEndpoint) -> Self {
        SockAddr::from(endpoint.to_socket_addr())
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            IpAddress::V4(_) => write!(f, "{}:{}", self.address, self.port),
            IpAddress::V6 { .. } => write!(f, "[{}]:{}", self.address, self.port),
        }
    }
}

impl FromStr for SocketEndpoint {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SocketError::InvalidAddress(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        let port = port
            .parse::<u16>()
            .map_err(|_| SocketError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(IpAddress::parse(host)?, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr_conversion_keeps_scope() {
        let endpoint: SocketEndpoint = "[fe80::1%4]:8080".parse().unwrap();
        assert_eq!(endpoint.address.scope(), 4);

        let std_addr = endpoint.to_socket_addr();
        match std_addr {
            SocketAddr::V6(v6) => assert_eq!(v6.scope_id(), 4),
            SocketAddr::V4(_) => panic!("expected an IPv6 socket address"),
        }
        assert_eq!(SocketEndpoint::from(std_addr), endpoint);
    }

    #[test]
    fn test_display_and_parse() {
        let endpoint: SocketEndpoint = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(endpoint.to_string(), "127.0.0.1:9000");
        assert_eq!(endpoint.port, 9000);

        let v6: SocketEndpoint = "[::1]:443".parse().unwrap();
        assert_eq!(v6.to_string(), "[::1]:443");

        assert!("127.0.0.1".parse::<SocketEndpoint>().is_err());
        assert!("127.0.0.1:99999".parse::<SocketEndpoint>().is_err());
    }
}
