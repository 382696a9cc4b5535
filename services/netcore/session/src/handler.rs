//! Protocol handler seam.

use crate::context::{ConnectionContext, ContextReader};
use crate::error::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use netcore_socket::SocketEndpoint;
use std::sync::Arc;

/// Application protocol running on top of registered connections.
///
/// Listeners create the per-connection state with [`initial_state`], register
/// the context and then drive it through [`handle`] (streams) or
/// [`handle_datagram`] (one call per received datagram).
///
/// [`initial_state`]: ConnectionHandler::initial_state
/// [`handle`]: ConnectionHandler::handle
/// [`handle_datagram`]: ConnectionHandler::handle_datagram
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Per-connection state owned by the handler
    type State: Send + Sync + 'static;

    /// State for a newly accepted client
    fn initial_state(&self, remote: &SocketEndpoint) -> Self::State;

    /// Serve one stream connection until it ends
    async fn handle(
        &self,
        context: Arc<ConnectionContext<Self::State>>,
        reader: ContextReader<Self::State>,
    ) -> Result<(), SessionError>;

    /// Process one datagram from a datagram client
    async fn handle_datagram(
        &self,
        context: Arc<ConnectionContext<Self::State>>,
        payload: Bytes,
    ) -> Result<(), SessionError> {
        let _ = (context, payload);
        Ok(())
    }
}
