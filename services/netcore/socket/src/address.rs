//! Internet host address value type.
//!
//! [`IpAddress`] is a tagged variant over the two physical layouts, so an
//! address can never carry a family that disagrees with its byte length.
//! Relational operators are total and consistent (usable for sorting and
//! deduplication) but carry no numeric meaning across families: an IPv4
//! address is never equal to an IPv6 address, including its IPv4-mapped
//! form.

use crate::error::SocketError;
use crate::family::{AddressFamily, IPV4_LENGTH, IPV6_LENGTH};
use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

bitflags! {
    /// Classification of an address as a set of categories.
    ///
    /// Categories overlap: `224.0.0.1` is multicast, well-known multicast
    /// and link-local multicast at the same time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AddressClass: u16 {
        /// All-zero address
        const WILDCARD = 1 << 0;
        /// IPv4 all-ones address
        const BROADCAST = 1 << 1;
        /// Loopback address
        const LOOPBACK = 1 << 2;
        /// Any multicast address
        const MULTICAST = 1 << 3;
        /// Well-known multicast
        const WELL_KNOWN_MC = 1 << 4;
        /// Node-local multicast (IPv6 only)
        const NODE_LOCAL_MC = 1 << 5;
        /// Link-local multicast
        const LINK_LOCAL_MC = 1 << 6;
        /// Site-local multicast
        const SITE_LOCAL_MC = 1 << 7;
        /// Organization-local multicast
        const ORG_LOCAL_MC = 1 << 8;
        /// Global multicast
        const GLOBAL_MC = 1 << 9;
        /// Link-local unicast
        const LINK_LOCAL = 1 << 10;
        /// Site-local unicast
        const SITE_LOCAL = 1 << 11;
        /// Neither wildcard, broadcast nor multicast
        const UNICAST = 1 << 12;
        /// IPv4-compatible (`::x.x.x.x`, always set for IPv4)
        const IPV4_COMPATIBLE = 1 << 13;
        /// IPv4-mapped (`::ffff:x.x.x.x`, always set for IPv4)
        const IPV4_MAPPED = 1 << 14;
    }
}

/// An IPv4 or IPv6 host address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IpAddress {
    /// IPv4 address in network byte order
    V4([u8; IPV4_LENGTH]),
    /// IPv6 address in network byte order with its scope identifier
    V6 {
        /// Address bytes
        bytes: [u8; IPV6_LENGTH],
        /// Scope (interface) identifier, 0 when absent
        scope: u32,
    },
}

impl IpAddress {
    /// Parse an address in presentation format.
    ///
    /// Accepts dotted decimal IPv4, colon-hex IPv6 with `::` compression,
    /// the mixed `x:x:x:x:x:x:d.d.d.d` form and a numeric `%scope` suffix
    /// on IPv6.
    pub fn parse(text: &str) -> Result<Self, SocketError> {
        Self::try_parse(text).ok_or_else(|| SocketError::InvalidAddress(text.to_string()))
    }

    /// Same grammar as [`IpAddress::parse`] but reports failure as `None`
    pub fn try_parse(text: &str) -> Option<Self> {
        if let Ok(v4) = text.parse::<Ipv4Addr>() {
            return Some(IpAddress::V4(v4.octets()));
        }

        let (addr, scope) = match text.split_once('%') {
            Some((addr, scope)) => (addr, Some(scope)),
            None => (text, None),
        };

        let v6 = addr.parse::<Ipv6Addr>().ok()?;
        let scope = match scope {
            Some(scope) => scope.parse::<u32>().ok()?,
            None => 0,
        };

        Some(IpAddress::V6 {
            bytes: v6.octets(),
            scope,
        })
    }

    /// Parse an address and require it to belong to `family`
    pub fn parse_with_family(text: &str, family: AddressFamily) -> Result<Self, SocketError> {
        let address = Self::parse(text)?;
        if address.family() != family {
            return Err(SocketError::FamilyMismatch);
        }
        Ok(address)
    }

    /// Build an address from raw network-order bytes.
    ///
    /// The scope is ignored for 4-byte input.
    pub fn from_bytes(bytes: &[u8], scope: u32) -> Result<Self, SocketError> {
        if let Ok(v4) = <[u8; IPV4_LENGTH]>::try_from(bytes) {
            return Ok(IpAddress::V4(v4));
        }
        if let Ok(v6) = <[u8; IPV6_LENGTH]>::try_from(bytes) {
            return Ok(IpAddress::V6 { bytes: v6, scope });
        }
        Err(SocketError::InvalidArgument(format!(
            "address must be {} or {} bytes, got {}",
            IPV4_LENGTH,
            IPV6_LENGTH,
            bytes.len()
        )))
    }

    /// The all-zero address of `family`
    pub fn wildcard(family: AddressFamily) -> Self {
        match family {
            AddressFamily::IPv4 => IpAddress::V4([0; IPV4_LENGTH]),
            AddressFamily::IPv6 => IpAddress::V6 {
                bytes: [0; IPV6_LENGTH],
                scope: 0,
            },
        }
    }

    /// The IPv4 broadcast address `255.255.255.255`
    pub fn broadcast() -> Self {
        IpAddress::V4([0xFF; IPV4_LENGTH])
    }

    /// The loopback address of `family`
    pub fn loopback(family: AddressFamily) -> Self {
        match family {
            AddressFamily::IPv4 => IpAddress::V4(Ipv4Addr::LOCALHOST.octets()),
            AddressFamily::IPv6 => IpAddress::V6 {
                bytes: Ipv6Addr::LOCALHOST.octets(),
                scope: 0,
            },
        }
    }

    /// IPv4 netmask with the `prefix_len` high-order bits set
    pub fn netmask_v4(prefix_len: u8) -> Result<Self, SocketError> {
        if prefix_len > 32 {
            return Err(SocketError::InvalidArgument(format!(
                "IPv4 prefix length {} exceeds 32",
                prefix_len
            )));
        }
        let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
        Ok(IpAddress::V4(mask.to_be_bytes()))
    }

    /// Address family of this address
    pub fn family(&self) -> AddressFamily {
        match self {
            IpAddress::V4(_) => AddressFamily::IPv4,
            IpAddress::V6 { .. } => AddressFamily::IPv6,
        }
    }

    /// IPv6 scope identifier; 0 for IPv4 or unscoped IPv6
    pub fn scope(&self) -> u32 {
        match self {
            IpAddress::V4(_) => 0,
            IpAddress::V6 { scope, .. } => *scope,
        }
    }

    /// Raw bytes in network order
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            IpAddress::V4(bytes) => bytes,
            IpAddress::V6 { bytes, .. } => bytes,
        }
    }

    /// Length of the raw representation (4 or 16)
    pub fn len(&self) -> usize {
        self.family().address_length()
    }

    /// Always false; present for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        false
    }

    fn v4_bits(&self) -> Option<u32> {
        match self {
            IpAddress::V4(bytes) => Some(u32::from_be_bytes(*bytes)),
            IpAddress::V6 { .. } => None,
        }
    }

    fn v6_first_word(&self) -> Option<u16> {
        match self {
            IpAddress::V4(_) => None,
            IpAddress::V6 { bytes, .. } => Some(u16::from_be_bytes([bytes[0], bytes[1]])),
        }
    }

    /// All bits zero
    pub fn is_wildcard(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// IPv4 all-ones; never true for IPv6
    pub fn is_broadcast(&self) -> bool {
        self.v4_bits() == Some(u32::MAX)
    }

    /// `127.0.0.0/8` or `::1`
    pub fn is_loopback(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => bytes[0] == 127,
            IpAddress::V6 { bytes, .. } => *bytes == Ipv6Addr::LOCALHOST.octets(),
        }
    }

    /// `224.0.0.0/4` or `ff00::/8`
    pub fn is_multicast(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => bytes[0] & 0xF0 == 0xE0,
            IpAddress::V6 { bytes, .. } => bytes[0] == 0xFF,
        }
    }

    /// Neither wildcard, broadcast nor multicast
    pub fn is_unicast(&self) -> bool {
        !self.is_wildcard() && !self.is_broadcast() && !self.is_multicast()
    }

    /// `169.254.0.0/16` or `fe80::/10`
    pub fn is_link_local(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => bytes[0] == 169 && bytes[1] == 254,
            IpAddress::V6 { .. } => self.v6_first_word().map_or(false, |w| w & 0xFFC0 == 0xFE80),
        }
    }

    /// `10/8`, `172.16/12`, `192.168/16` or `fec0::/10`
    pub fn is_site_local(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => {
                bytes[0] == 10
                    || (bytes[0] == 172 && bytes[1] & 0xF0 == 16)
                    || (bytes[0] == 192 && bytes[1] == 168)
            }
            IpAddress::V6 { .. } => self.v6_first_word().map_or(false, |w| w & 0xFFC0 == 0xFEC0),
        }
    }

    /// First 96 bits zero; always true for IPv4
    pub fn is_ipv4_compatible(&self) -> bool {
        match self {
            IpAddress::V4(_) => true,
            IpAddress::V6 { bytes, .. } => bytes[..12].iter().all(|b| *b == 0),
        }
    }

    /// `::ffff:0:0/96`; always true for IPv4
    pub fn is_ipv4_mapped(&self) -> bool {
        match self {
            IpAddress::V4(_) => true,
            IpAddress::V6 { bytes, .. } => {
                bytes[..10].iter().all(|b| *b == 0) && bytes[10] == 0xFF && bytes[11] == 0xFF
            }
        }
    }

    /// `224.0.0.0/8` or `ff0x::`
    pub fn is_well_known_mc(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => bytes[0] == 224,
            IpAddress::V6 { .. } => self.v6_first_word().map_or(false, |w| w & 0xFFF0 == 0xFF00),
        }
    }

    /// `ffx1::`; IPv4 has no node-local scope
    pub fn is_node_local_mc(&self) -> bool {
        self.v6_multicast_scope() == Some(0x1)
    }

    /// `224.0.0.0/24` or `ffx2::`
    pub fn is_link_local_mc(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => bytes[0] == 224 && bytes[1] == 0 && bytes[2] == 0,
            IpAddress::V6 { .. } => self.v6_multicast_scope() == Some(0x2),
        }
    }

    /// `239.255.0.0/16` or `ffx5::`
    pub fn is_site_local_mc(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => bytes[0] == 239 && bytes[1] == 255,
            IpAddress::V6 { .. } => self.v6_multicast_scope() == Some(0x5),
        }
    }

    /// `239.192.0.0/16` or `ffx8::`
    pub fn is_org_local_mc(&self) -> bool {
        match self {
            IpAddress::V4(bytes) => bytes[0] == 239 && bytes[1] == 192,
            IpAddress::V6 { .. } => self.v6_multicast_scope() == Some(0x8),
        }
    }

    /// `224.0.1.0` to `238.255.255.255` or `ffxf::`
    pub fn is_global_mc(&self) -> bool {
        match self {
            IpAddress::V4(_) => self
                .v4_bits()
                .map_or(false, |a| (0xE000_0100..=0xEEFF_FFFF).contains(&a)),
            IpAddress::V6 { .. } => self.v6_multicast_scope() == Some(0xF),
        }
    }

    fn v6_multicast_scope(&self) -> Option<u16> {
        self.v6_first_word()
            .filter(|w| w & 0xFF00 == 0xFF00)
            .map(|w| w & 0x000F)
    }

    /// Every category this address falls into
    pub fn classify(&self) -> AddressClass {
        let checks: [(bool, AddressClass); 15] = [
            (self.is_wildcard(), AddressClass::WILDCARD),
            (self.is_broadcast(), AddressClass::BROADCAST),
            (self.is_loopback(), AddressClass::LOOPBACK),
            (self.is_multicast(), AddressClass::MULTICAST),
            (self.is_well_known_mc(), AddressClass::WELL_KNOWN_MC),
            (self.is_node_local_mc(), AddressClass::NODE_LOCAL_MC),
            (self.is_link_local_mc(), AddressClass::LINK_LOCAL_MC),
            (self.is_site_local_mc(), AddressClass::SITE_LOCAL_MC),
            (self.is_org_local_mc(), AddressClass::ORG_LOCAL_MC),
            (self.is_global_mc(), AddressClass::GLOBAL_MC),
            (self.is_link_local(), AddressClass::LINK_LOCAL),
            (self.is_site_local(), AddressClass::SITE_LOCAL),
            (self.is_unicast(), AddressClass::UNICAST),
            (self.is_ipv4_compatible(), AddressClass::IPV4_COMPATIBLE),
            (self.is_ipv4_mapped(), AddressClass::IPV4_MAPPED),
        ];

        checks
            .into_iter()
            .filter(|(hit, _)| *hit)
            .fold(AddressClass::empty(), |acc, (_, class)| acc | class)
    }

    /// Replace this address with `address & netmask`. IPv4 only.
    pub fn mask(&mut self, netmask: &IpAddress) -> Result<(), SocketError> {
        self.mask_with(netmask, &IpAddress::wildcard(AddressFamily::IPv4))
    }

    /// Replace this address with `(address & netmask) | (set & !netmask)`. IPv4 only.
    pub fn mask_with(&mut self, netmask: &IpAddress, set: &IpAddress) -> Result<(), SocketError> {
        match (self.v4_bits(), netmask.v4_bits(), set.v4_bits()) {
            (Some(address), Some(mask), Some(set)) => {
                *self = IpAddress::V4(((address & mask) | (set & !mask)).to_be_bytes());
                Ok(())
            }
            _ => Err(SocketError::NotIpv4),
        }
    }

    /// Masked copy of this address
    pub fn masked(&self, netmask: &IpAddress) -> Result<IpAddress, SocketError> {
        let mut copy = *self;
        copy.mask(netmask)?;
        Ok(copy)
    }

    /// Prefix length when this address is a contiguous netmask
    pub fn prefix_len(&self) -> Option<u8> {
        let (ones, zeros, width) = match self {
            IpAddress::V4(bytes) => {
                let bits = u32::from_be_bytes(*bytes);
                (bits.leading_ones(), bits.trailing_zeros(), 32)
            }
            IpAddress::V6 { bytes, .. } => {
                let bits = u128::from_be_bytes(*bytes);
                (bits.leading_ones(), bits.trailing_zeros(), 128)
            }
        };
        if ones + zeros == width {
            Some(ones as u8)
        } else {
            None
        }
    }

    /// Whether this address lies inside `network` under `netmask` (IPv4)
    pub fn is_in_network(&self, network: &IpAddress, netmask: &IpAddress) -> bool {
        match (self.masked(netmask), network.masked(netmask)) {
            (Ok(ours), Ok(theirs)) => ours == theirs,
            _ => false,
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(bytes) => write!(f, "{}", Ipv4Addr::from(*bytes)),
            IpAddress::V6 { bytes, scope } => {
                write!(f, "{}", Ipv6Addr::from(*bytes))?;
                if *scope != 0 {
                    write!(f, "%{}", scope)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for IpAddress {
    type Err = SocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpAddress::parse(s)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr.octets())
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6 {
            bytes: addr.octets(),
            scope: 0,
        }
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => v4.into(),
            IpAddr::V6(v6) => v6.into(),
        }
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> Self {
        match addr {
            IpAddress::V4(bytes) => IpAddr::V4(Ipv4Addr::from(bytes)),
            IpAddress::V6 { bytes, .. } => IpAddr::V6(Ipv6Addr::from(bytes)),
        }
    }
}

impl Serialize for IpAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        IpAddress::parse(&text).map_err(serde::de::Error::custom)
    }
}
