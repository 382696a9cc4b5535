//! TCP and UDP accept loops feeding the registry.

use crate::context::ConnectionContext;
use crate::error::SessionError;
use crate::handler::ConnectionHandler;
use crate::registry::{CloseReason, ContextRegistry};
use crate::transport::{bind_udp, listen_tcp, IoStream};
use bytes::Bytes;
use dashmap::DashMap;
use netcore_socket::{SocketEndpoint, DEFAULT_BACKLOG};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[cfg(feature = "tls")]
use crate::transport::tls::{accept_tls, TlsServer};

/// Largest datagram read in one call
pub const MAX_DATAGRAM: usize = 65_536;

const ENDPOINT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Settings shared by TCP and UDP listeners
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Listener name, recorded in every context it registers
    pub name: String,
    /// Local endpoint to bind
    pub endpoint: SocketEndpoint,
    /// Refuse to run without TLS
    pub tls_required: bool,
}

#[derive(Clone, Default)]
struct StreamWrapper {
    #[cfg(feature = "tls")]
    tls: Option<TlsServer>,
}

impl StreamWrapper {
    #[cfg(feature = "tls")]
    fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    #[cfg(not(feature = "tls"))]
    fn is_tls(&self) -> bool {
        false
    }

    #[cfg(feature = "tls")]
    async fn wrap(&self, stream: TcpStream) -> Result<IoStream, SessionError> {
        match &self.tls {
            Some(acceptor) => accept_tls(acceptor, stream)
                .await
                .map_err(|e| SessionError::Tls(format!("{:#}", e))),
            None => Ok(IoStream::Plain(stream)),
        }
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap(&self, stream: TcpStream) -> Result<IoStream, SessionError> {
        Ok(IoStream::Plain(stream))
    }
}

async fn serve_stream<H: ConnectionHandler>(
    registry: Arc<ContextRegistry<H::State>>,
    handler: Arc<H>,
    io: IoStream,
    remote: SocketEndpoint,
) {
    let secured = io.is_secured();
    let state = handler.initial_state(&remote);
    let (context, reader) = match registry.register_stream(io, remote, secured, state) {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Rejected connection from {}: {}", remote, e);
            return;
        }
    };

    let id = context.unique_id().to_string();
    let reason = match handler.handle(Arc::clone(&context), reader).await {
        Ok(()) if context.get_last_error().is_some() => CloseReason::Fault,
        Ok(()) => CloseReason::Explicit,
        Err(e) => {
            debug!("Handler for {} ended with error: {}", id, e);
            CloseReason::Fault
        }
    };
    registry.close_and_remove(&id, reason).await;
}

/// Accepts TCP clients and runs a handler per registered connection
pub struct TcpContextListener<H: ConnectionHandler> {
    config: ListenerConfig,
    listener: TcpListener,
    registry: Arc<ContextRegistry<H::State>>,
    handler: Arc<H>,
    wrapper: StreamWrapper,
}

impl<H: ConnectionHandler> TcpContextListener<H> {
    /// Bind the listening socket
    pub fn bind(
        config: ListenerConfig,
        registry: Arc<ContextRegistry<H::State>>,
        handler: Arc<H>,
    ) -> Result<Self, SessionError> {
        let listener = listen_tcp(config.endpoint, DEFAULT_BACKLOG)?;
        Ok(Self {
            config,
            listener,
            registry,
            handler,
            wrapper: StreamWrapper::default(),
        })
    }

    /// Wrap every accepted connection in TLS
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, acceptor: TlsServer) -> Self {
        self.wrapper.tls = Some(acceptor);
        self
    }

    /// Actual bound endpoint
    pub fn local_endpoint(&self) -> Result<SocketEndpoint, SessionError> {
        Ok(self.listener.local_addr()?.into())
    }

    /// Accept until `shutdown` becomes `true`, then close every connection
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        if self.config.tls_required && !self.wrapper.is_tls() {
            return Err(SessionError::Tls(format!(
                "listener {} requires TLS but no certificate is configured",
                self.config.name
            )));
        }
        info!(
            "Listener {} accepting TCP on {} (tls: {})",
            self.config.name,
            self.local_endpoint()?,
            self.wrapper.is_tls()
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer.into()),
                    Err(e) => warn!("Accept failed on {}: {}", self.config.name, e),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.registry.close_all(CloseReason::Shutdown).await;
        info!("Listener {} stopped", self.config.name);
        Ok(())
    }

    fn admit(&self, stream: TcpStream, remote: SocketEndpoint) {
        if !self.registry.has_capacity() {
            warn!(
                "Listener {} at client limit, dropping connection from {}",
                self.config.name, remote
            );
            return;
        }

        let registry = Arc::clone(&self.registry);
        let handler = Arc::clone(&self.handler);
        let wrapper = self.wrapper.clone();
        tokio::spawn(async move {
            match wrapper.wrap(stream).await {
                Ok(io) => serve_stream(registry, handler, io, remote).await,
                Err(e) => warn!("Dropping connection from {}: {}", remote, e),
            }
        });
    }
}

/// Receives datagrams and maps each client endpoint to a registered context
pub struct UdpContextListener<H: ConnectionHandler> {
    config: ListenerConfig,
    socket: Arc<UdpSocket>,
    registry: Arc<ContextRegistry<H::State>>,
    handler: Arc<H>,
    endpoints: DashMap<SocketEndpoint, String>,
}

impl<H: ConnectionHandler> UdpContextListener<H> {
    /// Bind the datagram socket
    pub fn bind(
        config: ListenerConfig,
        registry: Arc<ContextRegistry<H::State>>,
        handler: Arc<H>,
    ) -> Result<Self, SessionError> {
        let socket = Arc::new(bind_udp(config.endpoint)?);
        Ok(Self {
            config,
            socket,
            registry,
            handler,
            endpoints: DashMap::new(),
        })
    }

    /// Actual bound endpoint
    pub fn local_endpoint(&self) -> Result<SocketEndpoint, SessionError> {
        Ok(self.socket.local_addr()?.into())
    }

    /// Receive until `shutdown` becomes `true`, then close every context
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), SessionError> {
        if self.config.tls_required {
            return Err(SessionError::Tls(format!(
                "listener {} requires TLS, which datagram listeners do not support",
                self.config.name
            )));
        }
        info!(
            "Listener {} receiving UDP on {}",
            self.config.name,
            self.local_endpoint()?
        );

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut prune = tokio::time::interval(ENDPOINT_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        self.dispatch(Bytes::copy_from_slice(&buf[..len]), peer.into());
                    }
                    Err(e) => warn!("Receive failed on {}: {}", self.config.name, e),
                },
                _ = prune.tick() => self.prune_endpoints(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.registry.close_all(CloseReason::Shutdown).await;
        self.endpoints.clear();
        info!("Listener {} stopped", self.config.name);
        Ok(())
    }

    fn context_for(
        &self,
        remote: SocketEndpoint,
    ) -> Result<Arc<ConnectionContext<H::State>>, SessionError> {
        let known = self.endpoints.get(&remote).map(|entry| entry.value().clone());
        if let Some(id) = known {
            match self.registry.find_member(&id) {
                Some(context) if context.is_open() => return Ok(context),
                _ => {
                    // Drop a context left behind by a close that raced this lookup
                    if let Some(stale) = self.registry.remove(&id) {
                        debug!("Replacing closed context {} for {}", stale.unique_id(), remote);
                    }
                }
            }
        }

        let state = self.handler.initial_state(&remote);
        let context = self
            .registry
            .register_datagram(Arc::clone(&self.socket), remote, state)?;
        self.endpoints
            .insert(remote, context.unique_id().to_string());
        Ok(context)
    }

    fn dispatch(&self, payload: Bytes, remote: SocketEndpoint) {
        let context = match self.context_for(remote) {
            Ok(context) => context,
            Err(e) => {
                warn!("Dropping datagram from {}: {}", remote, e);
                return;
            }
        };
        context.touch();

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            if let Err(e) = handler.handle_datagram(Arc::clone(&context), payload).await {
                debug!("Datagram handler for {} failed: {}", context.unique_id(), e);
            }
        });
    }

    fn prune_endpoints(&self) {
        self.endpoints.retain(|_, id| {
            self.registry
                .find_member(id)
                .is_some_and(|context| context.is_open())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextReader;
    use crate::fault::fault_channel;
    use crate::registry::RegistryConfig;
    use async_trait::async_trait;
    use netcore_socket::{AddressFamily, IpAddress};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Echo;

    #[async_trait]
    impl ConnectionHandler for Echo {
        type State = usize;

        fn initial_state(&self, _remote: &SocketEndpoint) -> usize {
            0
        }

        async fn handle(
            &self,
            context: Arc<ConnectionContext<usize>>,
            mut reader: ContextReader<usize>,
        ) -> Result<(), SessionError> {
            let mut buf = [0u8; 1024];
            loop {
                let read = reader.receive(&mut buf).await?;
                if read == 0 {
                    return Ok(());
                }
                *context.state_mut().await += read;
                context.send_from_server(&buf[..read]).await?;
            }
        }

        async fn handle_datagram(
            &self,
            context: Arc<ConnectionContext<usize>>,
            payload: Bytes,
        ) -> Result<(), SessionError> {
            context.send_from_server(&payload).await.map(|_| ())
        }
    }

    fn config(name: &str, tls_required: bool) -> ListenerConfig {
        ListenerConfig {
            name: name.to_string(),
            endpoint: SocketEndpoint::new(IpAddress::loopback(AddressFamily::IPv4), 0),
            tls_required,
        }
    }

    fn registry(name: &str, max_clients: Option<usize>) -> Arc<ContextRegistry<usize>> {
        let (bridge, _rx) = fault_channel();
        Arc::new(ContextRegistry::new(
            RegistryConfig {
                server_name: name.to_string(),
                max_clients,
                ..Default::default()
            },
            bridge,
        ))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_tcp_echo_registers_and_cleans_up() {
        let registry = registry("echo", None);
        let listener =
            TcpContextListener::bind(config("echo", false), Arc::clone(&registry), Arc::new(Echo))
                .unwrap();
        let addr = listener.local_endpoint().unwrap().to_socket_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let contexts = registry.find_all_member();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].server_name(), "echo");
        assert_eq!(*contexts[0].state().await, 4);
        assert_eq!(
            contexts[0].get_client_ip_endpoint().unwrap(),
            SocketEndpoint::from(client.local_addr().unwrap())
        );

        drop(client);
        wait_until(|| registry.is_empty()).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let registry = registry("drain", None);
        let listener =
            TcpContextListener::bind(config("drain", false), Arc::clone(&registry), Arc::new(Echo))
                .unwrap();
        let addr = listener.local_endpoint().unwrap().to_socket_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        wait_until(|| registry.len() == 1).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(registry.is_empty());

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_tls_required_without_certificate() {
        let registry = registry("secure", None);
        let listener =
            TcpContextListener::bind(config("secure", true), registry, Arc::new(Echo)).unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(matches!(
            listener.run(shutdown_rx).await,
            Err(SessionError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_udp_maps_endpoint_to_one_context() {
        let registry = registry("dgram", None);
        let listener =
            UdpContextListener::bind(config("dgram", false), Arc::clone(&registry), Arc::new(Echo))
                .unwrap();
        let addr = listener.local_endpoint().unwrap().to_socket_addr();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 16];
        for payload in [&b"one"[..], &b"two"[..]] {
            client.send_to(payload, addr).await.unwrap();
            let (len, _) = client.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], payload);
        }
        assert_eq!(registry.len(), 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_udp_closed_context_is_replaced_not_leaked() {
        let registry = registry("dgram", Some(1));
        let listener =
            UdpContextListener::bind(config("dgram", false), Arc::clone(&registry), Arc::new(Echo))
                .unwrap();
        let peer: SocketEndpoint = "127.0.0.1:45000".parse().unwrap();

        let first = listener.context_for(peer).unwrap();
        assert!(first.close().await);
        assert!(registry.is_empty());

        let second = listener.context_for(peer).unwrap();
        assert_ne!(first.unique_id(), second.unique_id());
        listener.prune_endpoints();

        assert_eq!(registry.len(), 1);
        assert!(registry.find_member(first.unique_id()).is_none());
        assert!(Arc::ptr_eq(&listener.context_for(peer).unwrap(), &second));
        assert_eq!(listener.endpoints.len(), 1);

        second.close().await;
        listener.prune_endpoints();
        assert!(listener.endpoints.is_empty());
    }
}
