//! Concurrent index of live connection contexts.
//!
//! The map is the only shared mutable state of the connection layer. Map
//! operations never hold a shard lock across an await: contexts are taken
//! out of the map first and torn down afterwards, so a slow peer never
//! stalls lookups.
//!
//! Every admitted context carries a hook back into the map. Closing the
//! context, directly or through a transport fault, removes its entry, so
//! lookups only ever see open contexts.

use crate::context::{
    ConnectionContext, ContextInfo, ContextReader, Deregister, DEFAULT_CLOSE_TIMEOUT,
};
use crate::error::SessionError;
use crate::fault::FaultBridge;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use netcore_socket::SocketEndpoint;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a context was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed on request of the handler or owner
    Explicit,
    /// Evicted by the liveness sweep
    TimedOut,
    /// Closed after a transport fault
    Fault,
    /// Closed during process shutdown
    Shutdown,
}

/// Lifecycle notifications emitted by the registry
#[derive(Debug, Clone)]
pub enum ContextEvent {
    /// A context was added
    Registered {
        /// Unique identifier
        id: String,
        /// Client endpoint
        remote: SocketEndpoint,
    },
    /// A context was closed and removed
    Closed {
        /// Unique identifier
        id: String,
        /// Why it was closed
        reason: CloseReason,
    },
}

/// Registry settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Listener name recorded in every context
    pub server_name: String,
    /// Maximum number of live contexts; `None` is unlimited
    pub max_clients: Option<usize>,
    /// Bound on each context teardown
    pub close_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server_name: "default".to_string(),
            max_clients: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

/// Map from unique identifier to live context
pub struct ContextRegistry<S> {
    config: RegistryConfig,
    contexts: Arc<DashMap<String, Arc<ConnectionContext<S>>>>,
    faults: FaultBridge,
    events: Option<mpsc::UnboundedSender<ContextEvent>>,
}

impl<S> ContextRegistry<S> {
    /// Create an empty registry whose contexts report faults to `faults`
    pub fn new(config: RegistryConfig, faults: FaultBridge) -> Self {
        Self {
            config,
            contexts: Arc::new(DashMap::new()),
            faults,
            events: None,
        }
    }

    /// Emit lifecycle events on `events`
    pub fn with_events(mut self, events: mpsc::UnboundedSender<ContextEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Registry settings
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Fresh random identifier
    pub fn mint_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn emit(&self, event: ContextEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Context event receiver dropped");
            }
        }
    }

    fn check_capacity(&self) -> Result<(), SessionError> {
        match self.config.max_clients {
            Some(max) if self.len() >= max => Err(SessionError::TooManyClients(max)),
            _ => Ok(()),
        }
    }

    /// Whether another context can be admitted
    pub fn has_capacity(&self) -> bool {
        self.check_capacity().is_ok()
    }

    /// Remove a context without closing it
    pub fn remove(&self, id: &str) -> Option<Arc<ConnectionContext<S>>> {
        self.contexts.remove(id).map(|(_, context)| context)
    }

    /// Look up one open context
    pub fn find_member(&self, id: &str) -> Option<Arc<ConnectionContext<S>>> {
        self.contexts
            .get(id)
            .filter(|entry| entry.is_open())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Look up several contexts; unknown identifiers are skipped
    pub fn find_members<I: AsRef<str>>(&self, ids: &[I]) -> Vec<Arc<ConnectionContext<S>>> {
        ids.iter()
            .filter_map(|id| self.find_member(id.as_ref()))
            .collect()
    }

    /// Snapshot of every live context
    pub fn find_all_member(&self) -> Vec<Arc<ConnectionContext<S>>> {
        self.contexts
            .iter()
            .filter(|entry| entry.is_open())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of live contexts
    pub fn len(&self) -> usize {
        self.contexts.iter().filter(|entry| entry.is_open()).count()
    }

    /// Whether the registry holds no live context
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn info(&self, unique_id: String, remote: SocketEndpoint, secured: bool) -> ContextInfo {
        ContextInfo {
            unique_id,
            server_name: self.config.server_name.clone(),
            remote,
            secured,
        }
    }

    /// Remove a context and close it outside the map lock.
    ///
    /// Returns `false` if the identifier was not registered.
    pub async fn close_and_remove(&self, id: &str, reason: CloseReason) -> bool {
        let Some(context) = self.remove(id) else {
            return false;
        };
        context.close_within(self.config.close_timeout).await;
        debug!("Context {} removed ({:?})", id, reason);
        self.emit(ContextEvent::Closed {
            id: id.to_string(),
            reason,
        });
        true
    }

    /// Close and remove every context
    pub async fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<String> = self.contexts.iter().map(|entry| entry.key().clone()).collect();
        let closes = ids.iter().map(|id| self.close_and_remove(id, reason));
        let closed = futures::future::join_all(closes)
            .await
            .into_iter()
            .filter(|closed| *closed)
            .count();
        info!("Closed {} {} connections ({:?})", closed, self.config.server_name, reason);
        closed
    }
}

impl<S: Send + Sync + 'static> ContextRegistry<S> {
    /// Hook that removes `context` from this registry when it stops being
    /// open. An identifier since reused by another context is left alone.
    fn deregistration(&self, context: &Arc<ConnectionContext<S>>) -> Deregister {
        let contexts = Arc::downgrade(&self.contexts);
        let member = Arc::downgrade(context);
        let events = self.events.clone();
        let id = context.unique_id().to_string();
        Box::new(move |reason| {
            let Some(contexts) = contexts.upgrade() else {
                return;
            };
            let removed = contexts
                .remove_if(&id, |_, current| std::ptr::eq(Arc::as_ptr(current), member.as_ptr()))
                .is_some();
            if removed {
                debug!("Context {} left the registry ({:?})", id, reason);
                if let Some(events) = events {
                    let _ = events.send(ContextEvent::Closed { id, reason });
                }
            }
        })
    }

    /// Add a constructed context. Fails if the context is not open, its
    /// identifier is held by a live context or the client limit is reached.
    pub fn add(&self, context: Arc<ConnectionContext<S>>) -> Result<(), SessionError> {
        self.check_capacity()?;
        let Some(remote) = context.get_client_ip_endpoint() else {
            return Err(SessionError::NotConnected);
        };
        let id = context.unique_id().to_string();

        match self.contexts.entry(id.clone()) {
            Entry::Occupied(_) => return Err(SessionError::Collision(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&context));
            }
        }
        context.attach_registry(self.deregistration(&context));
        if !context.is_open() {
            // Closed between insert and attach
            context.leave_registry(CloseReason::Explicit);
            return Err(SessionError::NotConnected);
        }

        debug!("Registered context {}", id);
        self.emit(ContextEvent::Registered { id, remote });
        Ok(())
    }

    /// Wrap an accepted stream, mint an identifier for it and register it
    pub fn register_stream<T>(
        &self,
        io: T,
        remote: SocketEndpoint,
        secured: bool,
        state: S,
    ) -> Result<(Arc<ConnectionContext<S>>, ContextReader<S>), SessionError>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.check_capacity()?;
        loop {
            let id = Self::mint_id();
            if let Entry::Vacant(slot) = self.contexts.entry(id.clone()) {
                let info = self.info(id.clone(), remote, secured);
                let (context, reader) =
                    ConnectionContext::for_stream(info, io, state, self.faults.clone());
                context.attach_registry(self.deregistration(&context));
                slot.insert(Arc::clone(&context));
                info!("Registered {} connection {} from {}", self.config.server_name, id, remote);
                self.emit(ContextEvent::Registered { id, remote });
                return Ok((context, reader));
            }
            warn!("Identifier collision on {}, regenerating", id);
        }
    }

    /// Register a datagram client sharing `socket`
    pub fn register_datagram(
        &self,
        socket: Arc<UdpSocket>,
        remote: SocketEndpoint,
        state: S,
    ) -> Result<Arc<ConnectionContext<S>>, SessionError> {
        self.check_capacity()?;
        loop {
            let id = Self::mint_id();
            if let Entry::Vacant(slot) = self.contexts.entry(id.clone()) {
                let info = self.info(id.clone(), remote, false);
                let context =
                    ConnectionContext::for_datagram(info, socket, state, self.faults.clone());
                context.attach_registry(self.deregistration(&context));
                slot.insert(Arc::clone(&context));
                debug!("Registered datagram client {} as {}", remote, id);
                self.emit(ContextEvent::Registered { id, remote });
                return Ok(context);
            }
            warn!("Identifier collision on {}, regenerating", id);
        }
    }

}
