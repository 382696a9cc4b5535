//! Demo protocol: signed greeting followed by echo.
//!
//! Every stream client first receives `HELLO <context id> <token>\r\n`, where
//! the token signs the context id with the current greeting key, and then
//! gets each chunk it sends written back. Datagram clients get their
//! datagrams echoed.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use netcore_session::{ConnectionContext, ConnectionHandler, ContextReader, SessionError};
use netcore_socket::SocketEndpoint;
use netcore_storage::KeyStore;
use std::sync::Arc;

/// Key bucket holding the greeting keys
pub const GREETING_BUCKET: &str = "netcore-greeting";

const READ_BUFFER: usize = 4096;

/// Per-connection echo state
#[derive(Debug)]
pub struct EchoState {
    pub remote: SocketEndpoint,
    pub bytes_echoed: u64,
}

pub struct EchoHandler {
    keys: Arc<dyn KeyStore>,
}

impl EchoHandler {
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }

    async fn greeting(&self, id: &str) -> String {
        match netcore_wire::sign(self.keys.as_ref(), GREETING_BUCKET, id.as_bytes(), Utc::now()).await {
            Ok(token) => format!("HELLO {} {}\r\n", id, token),
            Err(e) => {
                crate::component_warn!("echo", "Greeting for {} left unsigned: {}", id, e);
                format!("HELLO {}\r\n", id)
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for EchoHandler {
    type State = EchoState;

    fn initial_state(&self, remote: &SocketEndpoint) -> EchoState {
        EchoState {
            remote: *remote,
            bytes_echoed: 0,
        }
    }

    async fn handle(
        &self,
        context: Arc<ConnectionContext<EchoState>>,
        mut reader: ContextReader<EchoState>,
    ) -> Result<(), SessionError> {
        let greeting = self.greeting(context.unique_id()).await;
        context.send_from_server(greeting.as_bytes()).await?;

        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let n = reader.receive(&mut buf).await?;
            if n == 0 {
                break;
            }
            context.send_from_server(&buf[..n]).await?;
            context.state_mut().await.bytes_echoed += n as u64;
        }

        let state = context.state().await;
        crate::component_debug!(
            "echo",
            "Connection {} from {} echoed {} bytes",
            context.unique_id(),
            state.remote,
            state.bytes_echoed
        );
        Ok(())
    }

    async fn handle_datagram(
        &self,
        context: Arc<ConnectionContext<EchoState>>,
        payload: Bytes,
    ) -> Result<(), SessionError> {
        if payload.is_empty() {
            return Ok(());
        }
        context.send_from_server(&payload).await?;
        context.state_mut().await.bytes_echoed += payload.len() as u64;
        Ok(())
    }
}
