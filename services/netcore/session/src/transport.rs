//! TCP, TLS and UDP transport for connection contexts.
//!
//! Listening sockets are created through [`SocketProvider`] (so address
//! reuse and family selection follow one code path) and then handed to
//! tokio. Accepted connections are wrapped in [`IoStream`], which reports
//! whether TLS is in effect.

use crate::error::SessionError;
use netcore_socket::{SocketEndpoint, SocketProvider};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;

/// Unified stream type that can be either plain TCP or TLS
pub enum IoStream {
    /// Plain TCP stream
    Plain(TcpStream),
    /// TLS-wrapped stream
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            IoStream::Plain(stream) => stream.peer_addr(),
            #[cfg(feature = "tls")]
            IoStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Whether the stream is TLS-wrapped
    pub fn is_secured(&self) -> bool {
        match self {
            IoStream::Plain(_) => false,
            #[cfg(feature = "tls")]
            IoStream::Tls(_) => true,
        }
    }
}

/// Create a TCP listener bound to `endpoint` with address reuse enabled
pub fn listen_tcp(endpoint: SocketEndpoint, backlog: i32) -> Result<TcpListener, SessionError> {
    let mut provider = SocketProvider::stream(endpoint.address.family())?;
    provider.bind(endpoint, true)?;
    provider.listen(backlog)?;
    let listener = TcpListener::from_std(provider.into_tcp_listener()?)?;
    debug!("TCP listener bound to {}", endpoint);
    Ok(listener)
}

/// Create a UDP socket bound to `endpoint` with address reuse enabled
pub fn bind_udp(endpoint: SocketEndpoint) -> Result<UdpSocket, SessionError> {
    let mut provider = SocketProvider::datagram(endpoint.address.family())?;
    provider.bind(endpoint, true)?;
    let socket = UdpSocket::from_std(provider.into_udp_socket()?)?;
    debug!("UDP socket bound to {}", endpoint);
    Ok(socket)
}

// TLS-specific functionality
#[cfg(feature = "tls")]
/// Server-side TLS wrapping of accepted connections
pub mod tls {
    use super::*;
    use anyhow::{Context as AnyhowContext, Result};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::ServerConfig;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_rustls::TlsAcceptor;
    use tracing::info;

    /// TLS server acceptor wrapper
    #[derive(Clone)]
    pub struct TlsServer {
        acceptor: TlsAcceptor,
    }

    /// Create a TLS server configuration from PEM material
    pub fn make_server_config(cert_chain_pem: &str, private_key_pem: &str) -> Result<ServerConfig> {
        info!("Creating TLS server configuration");

        // Install default crypto provider if not already set
        let _ = rustls::crypto::ring::default_provider().install_default();

        let cert_results: Result<Vec<_>, _> =
            rustls_pemfile::certs(&mut cert_chain_pem.as_bytes()).collect();
        let certs = cert_results
            .context("Failed to parse certificate chain")?
            .into_iter()
            .map(CertificateDer::from)
            .collect::<Vec<_>>();

        if certs.is_empty() {
            anyhow::bail!("No certificates found in certificate chain");
        }

        let key = {
            let key_results: Result<Vec<_>, _> =
                rustls_pemfile::pkcs8_private_keys(&mut private_key_pem.as_bytes()).collect();
            let mut keys = key_results.context("Failed to parse private key")?;
            if keys.is_empty() {
                anyhow::bail!("No private key found");
            }
            PrivateKeyDer::from(keys.remove(0))
        };

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("Failed to configure server certificate")?;

        Ok(config)
    }

    /// Read PEM files from disk and build a server configuration
    pub fn load_server_config(cert_file: &Path, key_file: &Path) -> Result<ServerConfig> {
        let cert_pem = std::fs::read_to_string(cert_file)
            .with_context(|| format!("Failed to read certificate file {}", cert_file.display()))?;
        let key_pem = std::fs::read_to_string(key_file)
            .with_context(|| format!("Failed to read key file {}", key_file.display()))?;
        make_server_config(&cert_pem, &key_pem)
    }

    /// Create TLS acceptor from server configuration
    pub fn tls_acceptor(config: ServerConfig) -> TlsServer {
        TlsServer {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }

    /// Run the server handshake on an accepted TCP stream
    pub async fn accept_tls(acceptor: &TlsServer, tcp_stream: TcpStream) -> Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr().context("Accepted stream has no peer")?;
        debug!("Accepting TLS connection from {}", peer_addr);

        let tls_stream = acceptor
            .acceptor
            .accept(tcp_stream)
            .await
            .with_context(|| format!("TLS handshake failed with {}", peer_addr))?;

        Ok(IoStream::Tls(Box::new(tls_stream)))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_rejects_empty_material() {
            assert!(make_server_config("", "").is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_socket::{AddressFamily, IpAddress};

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let endpoint = SocketEndpoint::new(IpAddress::loopback(AddressFamily::IPv4), 0);
        let listener = listen_tcp(endpoint, 16).unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = TcpStream::connect(bound_addr).await.unwrap();
        let io_stream = IoStream::Plain(stream);

        assert!(io_stream.peer_addr().is_ok());
        assert!(!io_stream.is_secured());
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let endpoint = SocketEndpoint::new(IpAddress::loopback(AddressFamily::IPv4), 0);
        let socket = bind_udp(endpoint).unwrap();
        let bound = socket.local_addr().unwrap();
        assert_ne!(bound.port(), 0);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hi", bound).await.unwrap();
        let mut buf = [0u8; 8];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hi");
        assert_eq!(from, client.local_addr().unwrap());
    }
}
