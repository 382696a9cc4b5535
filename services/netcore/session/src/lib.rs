//! Connection contexts, registry and listeners for netcore.
//!
//! This crate turns accepted TCP/TLS connections and UDP clients into
//! registered [`ConnectionContext`]s that protocol handlers can read from,
//! write to and evict by identifier.
//!
//! ## Features
//!
//! - **Contexts**: identity, remote endpoint, typed handler state, liveness
//! - **Registry**: concurrent add/remove/find by unique identifier
//! - **Fault bridge**: transport failures delivered on one channel per owner
//! - **Liveness sweep**: periodic eviction of idle connections
//! - **Listeners**: TCP (optionally TLS) and UDP accept loops
//!
//! ## Example
//!
//! ```rust,no_run
//! use netcore_session::{
//!     fault_channel, ContextRegistry, ListenerConfig, LivenessSweep, RegistryConfig,
//!     SweepConfig, TcpContextListener,
//! };
//! # use netcore_session::{ConnectionContext, ConnectionHandler, ContextReader, SessionError};
//! # use netcore_socket::SocketEndpoint;
//! # use std::sync::Arc;
//! # struct Echo;
//! # #[async_trait::async_trait]
//! # impl ConnectionHandler for Echo {
//! #     type State = ();
//! #     fn initial_state(&self, _: &SocketEndpoint) {}
//! #     async fn handle(&self, _: Arc<ConnectionContext<()>>, _: ContextReader<()>) -> Result<(), SessionError> { Ok(()) }
//! # }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (faults, mut fault_rx) = fault_channel();
//! let registry = Arc::new(ContextRegistry::new(RegistryConfig::default(), faults));
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! let listener = TcpContextListener::bind(
//!     ListenerConfig {
//!         name: "echo".to_string(),
//!         endpoint: "0.0.0.0:7000".parse()?,
//!         tls_required: false,
//!     },
//!     Arc::clone(&registry),
//!     Arc::new(Echo),
//! )?;
//! tokio::spawn(listener.run(shutdown_rx.clone()));
//! tokio::spawn(LivenessSweep::new(registry, SweepConfig::default()).run(shutdown_rx));
//!
//! while let Some(fault) = fault_rx.recv().await {
//!     println!("{} failed during {:?}: {}", fault.context_id, fault.operation, fault.message);
//! }
//! # drop(shutdown_tx);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod error;
pub mod fault;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod sweep;
pub mod transport;

// Re-export main types
pub use context::{
    ConnectionContext, ConnectionState, ContextInfo, ContextReader, DEFAULT_CLOSE_TIMEOUT,
};
pub use error::SessionError;
pub use fault::{
    fault_channel, Fault, FaultBridge, FaultKind, FaultReceiver, FaultSlot, Operation,
    PendingOperation,
};
pub use handler::ConnectionHandler;
pub use listener::{ListenerConfig, TcpContextListener, UdpContextListener, MAX_DATAGRAM};
pub use registry::{CloseReason, ContextEvent, ContextRegistry, RegistryConfig};
pub use sweep::{LivenessSweep, SweepConfig};
pub use transport::{bind_udp, listen_tcp, IoStream};

// Re-export TLS functionality when available
#[cfg(feature = "tls")]
pub use transport::tls::{accept_tls, load_server_config, make_server_config, tls_acceptor, TlsServer};
