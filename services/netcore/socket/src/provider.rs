//! Low-level socket provider.
//!
//! A [`SocketProvider`] is the single owner of one OS socket handle. There is
//! no shared handle: `accept` hands back a new provider for the accepted
//! connection and the `into_*` methods consume the provider to transfer the
//! handle elsewhere (for example into a tokio listener).

use crate::endpoint::SocketEndpoint;
use crate::error::SocketError;
use crate::family::AddressFamily;
use socket2::{Protocol, Socket, Type};
use std::io::Read;
use tracing::{debug, trace};

/// `IPPROTO_RAW`, the default protocol for raw sockets
pub const IPPROTO_RAW: i32 = 255;

/// Default listen backlog
pub const DEFAULT_BACKLOG: i32 = 128;

/// Kind of socket owned by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Raw IP socket for the given IP protocol number
    Raw {
        /// IP protocol number
        protocol: i32,
    },
    /// TCP stream socket
    Stream,
    /// UDP datagram socket
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Unbound,
    Bound,
    Connected,
    Listening,
}

/// Exclusive owner of one OS socket
#[derive(Debug)]
pub struct SocketProvider {
    socket: Socket,
    family: AddressFamily,
    kind: SocketKind,
    role: Role,
}

impl SocketProvider {
    /// Create an unconnected raw socket for `family` and `protocol`.
    ///
    /// For IPv4 the header-inclusion option is switched off so that sent
    /// payloads are IP payloads; the kernel builds the header. An OS that
    /// refuses the option fails construction.
    pub fn raw(family: AddressFamily, protocol: i32) -> Result<Self, SocketError> {
        let socket = Socket::new(family.domain(), Type::RAW, Some(Protocol::from(protocol)))?;

        if family == AddressFamily::IPv4 {
            #[allow(deprecated)]
            socket
                .set_header_included(false)
                .map_err(SocketError::HeaderInclusion)?;
        }

        debug!("Opened raw {} socket (protocol {})", family, protocol);
        Ok(Self {
            socket,
            family,
            kind: SocketKind::Raw { protocol },
            role: Role::Unbound,
        })
    }

    /// Raw socket using `IPPROTO_RAW`
    pub fn raw_default(family: AddressFamily) -> Result<Self, SocketError> {
        Self::raw(family, IPPROTO_RAW)
    }

    /// Raw socket bound to `endpoint`; the family follows the endpoint
    pub fn raw_bound(endpoint: SocketEndpoint, reuse_address: bool) -> Result<Self, SocketError> {
        let mut provider = Self::raw_default(endpoint.address.family())?;
        provider.bind(endpoint, reuse_address)?;
        Ok(provider)
    }

    /// Create an unconnected TCP socket
    pub fn stream(family: AddressFamily) -> Result<Self, SocketError> {
        let socket = Socket::new(family.domain(), Type::STREAM, Some(Protocol::TCP))?;
        Ok(Self {
            socket,
            family,
            kind: SocketKind::Stream,
            role: Role::Unbound,
        })
    }

    /// Create an unconnected UDP socket
    pub fn datagram(family: AddressFamily) -> Result<Self, SocketError> {
        let socket = Socket::new(family.domain(), Type::DGRAM, Some(Protocol::UDP))?;
        Ok(Self {
            socket,
            family,
            kind: SocketKind::Datagram,
            role: Role::Unbound,
        })
    }

    /// Address family chosen at construction
    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Socket kind chosen at construction
    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    fn check_family(&self, endpoint: &SocketEndpoint) -> Result<(), SocketError> {
        if endpoint.address.family() != self.family {
            return Err(SocketError::FamilyMismatch);
        }
        Ok(())
    }

    /// Bind a local endpoint. Cannot be combined with [`SocketProvider::connect`].
    pub fn bind(&mut self, endpoint: SocketEndpoint, reuse_address: bool) -> Result<(), SocketError> {
        match self.role {
            Role::Unbound => {}
            Role::Connected => return Err(SocketError::Usage("bind after connect")),
            Role::Bound | Role::Listening => return Err(SocketError::Usage("socket already bound")),
        }
        self.check_family(&endpoint)?;

        if reuse_address {
            self.socket.set_reuse_address(true)?;
        }
        self.socket.bind(&endpoint.into())?;
        self.role = Role::Bound;
        debug!("Bound {:?} socket to {}", self.kind, endpoint);
        Ok(())
    }

    /// Restrict traffic to a single peer. Cannot be combined with [`SocketProvider::bind`].
    pub fn connect(&mut self, endpoint: SocketEndpoint) -> Result<(), SocketError> {
        match self.role {
            Role::Unbound => {}
            Role::Connected => return Err(SocketError::Usage("socket already connected")),
            Role::Bound | Role::Listening => return Err(SocketError::Usage("connect after bind")),
        }
        self.check_family(&endpoint)?;

        self.socket.connect(&endpoint.into())?;
        self.role = Role::Connected;
        debug!("Connected {:?} socket to {}", self.kind, endpoint);
        Ok(())
    }

    /// Start listening on a bound stream socket
    pub fn listen(&mut self, backlog: i32) -> Result<(), SocketError> {
        if self.kind != SocketKind::Stream {
            return Err(SocketError::Usage("listen requires a stream socket"));
        }
        if self.role != Role::Bound {
            return Err(SocketError::Usage("listen requires a bound socket"));
        }
        self.socket.listen(backlog)?;
        self.role = Role::Listening;
        Ok(())
    }

    /// Accept one pending connection as a new, separately owned provider
    pub fn accept(&self) -> Result<(SocketProvider, SocketEndpoint), SocketError> {
        if self.role != Role::Listening {
            return Err(SocketError::Usage("accept requires a listening socket"));
        }
        let (socket, addr) = self.socket.accept()?;
        let peer = SocketEndpoint::from_sock_addr(&addr)?;
        trace!("Accepted connection from {}", peer);

        Ok((
            SocketProvider {
                socket,
                family: self.family,
                kind: SocketKind::Stream,
                role: Role::Connected,
            },
            peer,
        ))
    }

    /// Send on a connected socket; returns the number of bytes actually sent
    pub fn send_bytes(&self, buffer: &[u8]) -> Result<usize, SocketError> {
        let sent = self.socket.send(buffer)?;
        trace!("send_bytes: {} of {} bytes", sent, buffer.len());
        Ok(sent)
    }

    /// Receive into `buffer`; returns the number of bytes received
    pub fn receive_bytes(&self, buffer: &mut [u8]) -> Result<usize, SocketError> {
        let received = (&self.socket).read(buffer)?;
        trace!("receive_bytes: {} bytes", received);
        Ok(received)
    }

    /// Send to an explicit peer; returns the number of bytes actually sent
    pub fn send_to(&self, buffer: &[u8], endpoint: SocketEndpoint) -> Result<usize, SocketError> {
        self.check_family(&endpoint)?;
        let sent = self.socket.send_to(buffer, &endpoint.into())?;
        trace!("send_to {}: {} of {} bytes", endpoint, sent, buffer.len());
        Ok(sent)
    }

    /// Receive one datagram and report its sender
    pub fn receive_from(&self, buffer: &mut [u8]) -> Result<(usize, SocketEndpoint), SocketError> {
        // recvfrom through a std handle on a duplicate of the descriptor
        let datagram = std::net::UdpSocket::from(self.socket.try_clone()?);
        let (received, addr) = datagram.recv_from(buffer)?;
        let peer = SocketEndpoint::from(addr);
        trace!("receive_from {}: {} bytes", peer, received);
        Ok((received, peer))
    }

    /// Allow or forbid sending to broadcast addresses
    pub fn set_broadcast(&self, enabled: bool) -> Result<(), SocketError> {
        self.socket.set_broadcast(enabled)?;
        Ok(())
    }

    /// Current broadcast permission
    pub fn get_broadcast(&self) -> Result<bool, SocketError> {
        Ok(self.socket.broadcast()?)
    }

    /// Explicitly enable or disable header inclusion on an IPv4 raw socket
    pub fn set_header_included(&self, included: bool) -> Result<(), SocketError> {
        if !matches!(self.kind, SocketKind::Raw { .. }) || self.family != AddressFamily::IPv4 {
            return Err(SocketError::Usage("header inclusion applies to IPv4 raw sockets"));
        }
        #[allow(deprecated)]
        self.socket
            .set_header_included(included)
            .map_err(SocketError::HeaderInclusion)
    }

    /// Current header inclusion setting of an IPv4 raw socket
    pub fn header_included(&self) -> Result<bool, SocketError> {
        if !matches!(self.kind, SocketKind::Raw { .. }) || self.family != AddressFamily::IPv4 {
            return Ok(false);
        }
        #[allow(deprecated)]
        self.socket.header_included().map_err(SocketError::HeaderInclusion)
    }

    /// Switch the OS address-reuse option
    pub fn set_reuse_address(&self, enabled: bool) -> Result<(), SocketError> {
        self.socket.set_reuse_address(enabled)?;
        Ok(())
    }

    /// Put the socket in (non-)blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.socket.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Locally bound endpoint
    pub fn local_endpoint(&self) -> Result<SocketEndpoint, SocketError> {
        SocketEndpoint::from_sock_addr(&self.socket.local_addr()?)
    }

    /// Connected peer endpoint
    pub fn peer_endpoint(&self) -> Result<SocketEndpoint, SocketError> {
        SocketEndpoint::from_sock_addr(&self.socket.peer_addr()?)
    }

    /// Give up ownership of the underlying socket
    pub fn into_socket(self) -> Socket {
        self.socket
    }

    /// Hand a listening stream socket over as a non-blocking std listener
    pub fn into_tcp_listener(self) -> Result<std::net::TcpListener, SocketError> {
        if self.role != Role::Listening {
            return Err(SocketError::Usage("socket is not listening"));
        }
        self.socket.set_nonblocking(true)?;
        Ok(self.socket.into())
    }

    /// Hand a datagram socket over as a non-blocking std UDP socket
    pub fn into_udp_socket(self) -> Result<std::net::UdpSocket, SocketError> {
        if self.kind != SocketKind::Datagram {
            return Err(SocketError::Usage("socket is not a datagram socket"));
        }
        self.socket.set_nonblocking(true)?;
        Ok(self.socket.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::IpAddress;

    fn loopback_any_port() -> SocketEndpoint {
        SocketEndpoint::new(IpAddress::loopback(AddressFamily::IPv4), 0)
    }

    #[test]
    fn test_datagram_send_to_receive_from() {
        let mut server = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        server.bind(loopback_any_port(), true).unwrap();
        let server_addr = server.local_endpoint().unwrap();

        let mut client = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        client.bind(loopback_any_port(), false).unwrap();
        let client_addr = client.local_endpoint().unwrap();

        let sent = client.send_to(b"ping", server_addr).unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 64];
        let (len, from) = server.receive_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, client_addr);
    }

    #[test]
    fn test_receive_from_repeatedly_and_truncated() {
        let mut server = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        server.bind(loopback_any_port(), true).unwrap();
        let server_addr = server.local_endpoint().unwrap();

        let mut client = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        client.bind(loopback_any_port(), false).unwrap();
        client.send_to(b"first", server_addr).unwrap();
        client.send_to(b"second", server_addr).unwrap();

        let mut short = [0u8; 3];
        let (len, _) = server.receive_from(&mut short).unwrap();
        assert_eq!(&short[..len], b"fir");

        let mut buf = [0u8; 64];
        let (len, from) = server.receive_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"second");
        assert_eq!(from, client.local_endpoint().unwrap());
        assert_eq!(server.local_endpoint().unwrap(), server_addr);
    }

    #[test]
    fn test_bind_and_connect_are_exclusive() {
        let mut bound = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        bound.bind(loopback_any_port(), false).unwrap();
        let target = bound.local_endpoint().unwrap();
        assert!(matches!(bound.connect(target), Err(SocketError::Usage(_))));
        assert!(matches!(
            bound.bind(loopback_any_port(), false),
            Err(SocketError::Usage(_))
        ));

        let mut connected = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        connected.connect(target).unwrap();
        assert!(matches!(
            connected.bind(loopback_any_port(), false),
            Err(SocketError::Usage(_))
        ));

        connected.send_bytes(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let len = bound.receive_bytes(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello");
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let mut v4 = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        let v6_endpoint = SocketEndpoint::new(IpAddress::loopback(AddressFamily::IPv6), 0);
        assert!(matches!(
            v4.bind(v6_endpoint, false),
            Err(SocketError::FamilyMismatch)
        ));
    }

    #[test]
    fn test_broadcast_option() {
        let socket = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        assert!(!socket.get_broadcast().unwrap());
        socket.set_broadcast(true).unwrap();
        assert!(socket.get_broadcast().unwrap());
        socket.set_broadcast(false).unwrap();
        assert!(!socket.get_broadcast().unwrap());
    }

    #[test]
    fn test_stream_accept_returns_owned_provider() {
        let mut listener = SocketProvider::stream(AddressFamily::IPv4).unwrap();
        listener.bind(loopback_any_port(), true).unwrap();
        listener.listen(DEFAULT_BACKLOG).unwrap();
        let addr = listener.local_endpoint().unwrap();

        let mut client = SocketProvider::stream(AddressFamily::IPv4).unwrap();
        client.connect(addr).unwrap();

        let (accepted, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_endpoint().unwrap());
        assert_eq!(accepted.kind(), SocketKind::Stream);

        let mut sent = 0;
        let payload = b"partial transfers are looped";
        while sent < payload.len() {
            sent += client.send_bytes(&payload[sent..]).unwrap();
        }

        let mut buf = vec![0u8; payload.len()];
        let mut received = 0;
        while received < payload.len() {
            received += accepted.receive_bytes(&mut buf[received..]).unwrap();
        }
        assert_eq!(&buf, payload);
    }

    #[test]
    fn test_listen_requires_bound_stream() {
        let mut datagram = SocketProvider::datagram(AddressFamily::IPv4).unwrap();
        datagram.bind(loopback_any_port(), false).unwrap();
        assert!(matches!(datagram.listen(8), Err(SocketError::Usage(_))));

        let mut stream = SocketProvider::stream(AddressFamily::IPv4).unwrap();
        assert!(matches!(stream.listen(8), Err(SocketError::Usage(_))));
        assert!(matches!(stream.accept(), Err(SocketError::Usage(_))));
    }

    #[test]
    fn test_raw_socket_header_excluded_or_os_error() {
        // Raw sockets need elevated privileges; without them the OS error
        // must surface with its code.
        match SocketProvider::raw_default(AddressFamily::IPv4) {
            Ok(raw) => {
                assert_eq!(raw.kind(), SocketKind::Raw { protocol: IPPROTO_RAW });
                assert!(!raw.header_included().unwrap());
            }
            Err(SocketError::Transport { code, .. }) => assert!(code.is_some()),
            Err(SocketError::HeaderInclusion(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}
