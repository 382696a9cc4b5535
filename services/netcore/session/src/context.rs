//! Per-connection context.
//!
//! A [`ConnectionContext`] is shared (`Arc`) between the registry, the
//! liveness sweep and the protocol handler. The read half of a stream
//! connection is owned separately by a [`ContextReader`] so that reads never
//! contend with writes or with `close`.
//!
//! State machine: `Open -> Closing -> Closed`. Once `close` has started no
//! send succeeds; an in-flight send or receive is woken by the close signal
//! and gives up its half of the transport. A context that belongs to a
//! registry leaves it as soon as it stops being open, whether by `close` or
//! by a transport fault.

use crate::error::SessionError;
use crate::fault::{Fault, FaultBridge, FaultSlot, Operation, PendingOperation};
use crate::registry::CloseReason;
use bytes::Bytes;
use netcore_socket::SocketEndpoint;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

/// Default bound on the teardown performed by [`ConnectionContext::close`]
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle state of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered and usable
    Open,
    /// Teardown in progress
    Closing,
    /// Terminal
    Closed,
}

/// Identity of a context, fixed at construction
#[derive(Debug, Clone)]
pub struct ContextInfo {
    /// Registry identifier
    pub unique_id: String,
    /// Name of the listener that accepted the connection
    pub server_name: String,
    /// Client endpoint
    pub remote: SocketEndpoint,
    /// Whether the transport is TLS-wrapped
    pub secured: bool,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Removes a context from the registry that admitted it
pub(crate) type Deregister = Box<dyn FnOnce(CloseReason) + Send>;

enum Transport {
    Stream(Mutex<Option<BoxedWriter>>),
    Datagram(Arc<UdpSocket>),
}

/// Live connection record shared by the registry and protocol handlers
pub struct ConnectionContext<S> {
    info: ContextInfo,
    connection_id: RwLock<String>,
    state: AtomicU8,
    transport: Transport,
    created: Instant,
    last_activity_ms: AtomicU64,
    app_state: RwLock<S>,
    faults: FaultBridge,
    last_error: FaultSlot,
    closed: watch::Sender<bool>,
    deregister: std::sync::Mutex<Option<Deregister>>,
}

impl<S> std::fmt::Debug for ConnectionContext<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("unique_id", &self.info.unique_id)
            .field("remote", &self.info.remote)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl<S> ConnectionContext<S> {
    fn build(info: ContextInfo, transport: Transport, state: S, faults: FaultBridge) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            connection_id: RwLock::new(info.unique_id.clone()),
            info,
            state: AtomicU8::new(OPEN),
            transport,
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            app_state: RwLock::new(state),
            faults,
            last_error: FaultSlot::new(),
            closed,
            deregister: std::sync::Mutex::new(None),
        }
    }

    /// Wrap a connected byte stream.
    ///
    /// Returns the shared context (write side) and the reader that owns the
    /// read side.
    pub fn for_stream<T>(
        info: ContextInfo,
        io: T,
        state: S,
        faults: FaultBridge,
    ) -> (Arc<Self>, ContextReader<S>)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let writer: BoxedWriter = Box::new(write_half);
        let context = Arc::new(Self::build(
            info,
            Transport::Stream(Mutex::new(Some(writer))),
            state,
            faults,
        ));
        let reader = ContextReader {
            context: Arc::clone(&context),
            reader: Some(Box::new(read_half)),
            closed: context.closed.subscribe(),
        };
        (context, reader)
    }

    /// Context for a datagram client sharing the listener's socket
    pub fn for_datagram(
        info: ContextInfo,
        socket: Arc<UdpSocket>,
        state: S,
        faults: FaultBridge,
    ) -> Arc<Self> {
        Arc::new(Self::build(info, Transport::Datagram(socket), state, faults))
    }

    /// Registry identifier, immutable for the context's life
    pub fn unique_id(&self) -> &str {
        &self.info.unique_id
    }

    /// Protocol-level connection identifier
    pub async fn connection_id(&self) -> String {
        self.connection_id.read().await.clone()
    }

    /// Reassign the protocol-level connection identifier
    pub async fn set_connection_id(&self, id: impl Into<String>) {
        *self.connection_id.write().await = id.into();
    }

    /// Name of the listener that accepted the connection
    pub fn server_name(&self) -> &str {
        &self.info.server_name
    }

    /// Whether the transport is TLS-wrapped
    pub fn is_secured(&self) -> bool {
        self.info.secured
    }

    /// Whether the context uses a shared datagram socket
    pub fn is_datagram(&self) -> bool {
        matches!(self.transport, Transport::Datagram(_))
    }

    /// Current lifecycle state
    pub fn connection_state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            OPEN => ConnectionState::Open,
            CLOSING => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    /// Whether the context is open
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Client endpoint, or `None` once the context is no longer open
    pub fn get_client_ip_endpoint(&self) -> Option<SocketEndpoint> {
        self.is_open().then_some(self.info.remote)
    }

    /// Shared access to the handler's state
    pub async fn state(&self) -> RwLockReadGuard<'_, S> {
        self.app_state.read().await
    }

    /// Exclusive access to the handler's state
    pub async fn state_mut(&self) -> RwLockWriteGuard<'_, S> {
        self.app_state.write().await
    }

    /// Record activity now. Last activity never moves backwards.
    pub fn touch(&self) {
        let elapsed = Instant::now().saturating_duration_since(self.created);
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.fetch_max(millis, Ordering::AcqRel);
    }

    /// Instant of the last recorded activity
    pub fn last_activity(&self) -> Instant {
        self.created + Duration::from_millis(self.last_activity_ms.load(Ordering::Acquire))
    }

    /// Whether more than `timeout_minutes` have passed since the last
    /// activity. Negative values mean no timeout. Does not close anything.
    pub fn has_timed_out(&self, timeout_minutes: i64) -> bool {
        let Ok(minutes) = u64::try_from(timeout_minutes) else {
            return false;
        };
        let limit = Duration::from_secs(minutes.saturating_mul(60));
        Instant::now().saturating_duration_since(self.last_activity()) > limit
    }

    pub(crate) fn attach_registry(&self, hook: Deregister) {
        *self.deregister.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Run the registry hook, at most once
    pub(crate) fn leave_registry(&self, reason: CloseReason) {
        let hook = self
            .deregister
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook(reason);
        }
    }

    /// Most recent fault observed on this context
    pub fn get_last_error(&self) -> Option<Fault> {
        self.last_error.last()
    }

    /// Write `data` to the client; returns the number of bytes written.
    pub async fn send_from_server(&self, data: &[u8]) -> Result<usize, SessionError> {
        if data.is_empty() {
            return Err(SessionError::InvalidArgument("data must not be empty"));
        }
        if !self.is_open() {
            return Err(SessionError::NotConnected);
        }

        match &self.transport {
            Transport::Stream(writer) => {
                let mut guard = writer.lock().await;
                if !self.is_open() {
                    guard.take();
                    return Err(SessionError::NotConnected);
                }
                let Some(stream) = guard.as_mut() else {
                    return Err(SessionError::NotConnected);
                };

                let mut closed = self.closed.subscribe();
                let outcome = tokio::select! {
                    result = async {
                        stream.write_all(data).await?;
                        stream.flush().await
                    } => Some(result),
                    _ = closed.wait_for(|closed| *closed) => None,
                };

                match outcome {
                    Some(Ok(())) => {
                        self.touch();
                        Ok(data.len())
                    }
                    Some(Err(e)) => {
                        guard.take();
                        Err(self.fail(Operation::Send, e))
                    }
                    None => {
                        guard.take();
                        Err(SessionError::NotConnected)
                    }
                }
            }
            Transport::Datagram(socket) => {
                match socket.send_to(data, self.info.remote.to_socket_addr()).await {
                    Ok(sent) => {
                        self.touch();
                        Ok(sent)
                    }
                    Err(e) => Err(self.fail(Operation::Send, e)),
                }
            }
        }
    }

    /// Close the context, bounding teardown by [`DEFAULT_CLOSE_TIMEOUT`]
    pub async fn close(&self) -> bool {
        self.close_within(DEFAULT_CLOSE_TIMEOUT).await
    }

    /// Close the context, bounding teardown by `limit`.
    ///
    /// Idempotent: returns `true` only for the call that performed the close.
    pub async fn close_within(&self, limit: Duration) -> bool {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.closed.send_replace(true);
        self.leave_registry(CloseReason::Explicit);
        let deadline = Instant::now() + limit;

        if let Transport::Stream(writer) = &self.transport {
            // An in-flight send that holds the lock past the deadline drops the
            // writer itself once it observes the close signal.
            let taken = match timeout_at(deadline, writer.lock()).await {
                Ok(mut guard) => guard.take(),
                Err(_) => None,
            };
            if let Some(mut stream) = taken {
                let error = match timeout_at(deadline, stream.shutdown()).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e),
                    Err(_) => Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "shutdown timed out",
                    )),
                };
                if let Some(e) = error {
                    self.report(Operation::Close, &SessionError::Transport(e));
                }
            }
        }

        self.state.store(CLOSED, Ordering::Release);
        info!("Closed connection {} ({})", self.info.unique_id, self.info.remote);
        true
    }

    fn report(&self, operation: Operation, error: &SessionError) {
        let fault = Fault::from_error(&self.info.unique_id, operation, error);
        self.faults.report(&self.last_error, fault);
    }

    fn fail(&self, operation: Operation, error: std::io::Error) -> SessionError {
        let error = SessionError::Transport(error);
        self.report(operation, &error);

        if self
            .state
            .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.closed.send_replace(true);
            if let Transport::Stream(writer) = &self.transport {
                if let Ok(mut guard) = writer.try_lock() {
                    guard.take();
                }
            }
            self.leave_registry(CloseReason::Fault);
        }
        error
    }
}

impl<S: Send + Sync + 'static> ConnectionContext<S> {
    /// Send on a separate task; the result is delivered through the returned
    /// [`PendingOperation`]. Every failure is also reported through the fault
    /// bridge.
    pub fn send_detached(self: &Arc<Self>, data: Bytes) -> PendingOperation<usize> {
        let (tx, pending) = PendingOperation::channel();
        let context = Arc::clone(self);
        tokio::spawn(async move {
            let result = context.send_from_server(&data).await;
            match &result {
                // Already reported when the transport failed
                Err(SessionError::Transport(_)) | Ok(_) => {}
                Err(e) => context.report(Operation::Send, e),
            }
            let _ = tx.send(result);
        });
        pending
    }
}

/// Owner of the read half of a stream context
pub struct ContextReader<S> {
    context: Arc<ConnectionContext<S>>,
    reader: Option<BoxedReader>,
    closed: watch::Receiver<bool>,
}

impl<S> ContextReader<S> {
    /// Context this reader belongs to
    pub fn context(&self) -> &Arc<ConnectionContext<S>> {
        &self.context
    }

    /// Read from the client into `buf`.
    ///
    /// Returns `Ok(0)` at end of stream or once the context has been closed.
    /// Transport failures are reported through the fault bridge, close the
    /// context and are returned.
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        if !self.context.is_open() {
            self.reader = None;
            return Ok(0);
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };

        let outcome = tokio::select! {
            result = reader.read(buf) => Some(result),
            _ = self.closed.wait_for(|closed| *closed) => None,
        };

        match outcome {
            Some(Ok(0)) => {
                debug!("Client {} closed its side", self.context.unique_id());
                self.reader = None;
                Ok(0)
            }
            Some(Ok(read)) => {
                self.context.touch();
                Ok(read)
            }
            Some(Err(e)) => {
                self.reader = None;
                Err(self.context.fail(Operation::Receive, e))
            }
            None => {
                self.reader = None;
                Ok(0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{fault_channel, FaultKind};
    use netcore_socket::IpAddress;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tokio::io::{DuplexStream, ReadBuf};

    fn info(id: &str) -> ContextInfo {
        ContextInfo {
            unique_id: id.to_string(),
            server_name: "test".to_string(),
            remote: "10.0.0.7:4000".parse().unwrap(),
            secured: false,
        }
    }

    fn stream_context(id: &str) -> (Arc<ConnectionContext<u32>>, ContextReader<u32>, DuplexStream) {
        let (server, client) = tokio::io::duplex(1024);
        let (bridge, _rx) = fault_channel();
        let (ctx, reader) = ConnectionContext::for_stream(info(id), server, 0u32, bridge);
        (ctx, reader, client)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (ctx, mut reader, mut client) = stream_context("ctx-1");
        assert_eq!(ctx.unique_id(), "ctx-1");
        assert_eq!(ctx.connection_state(), ConnectionState::Open);
        assert_eq!(
            ctx.get_client_ip_endpoint().unwrap().address,
            IpAddress::parse("10.0.0.7").unwrap()
        );

        assert_eq!(ctx.send_from_server(b"hello").await.unwrap(), 5);
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        client.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 16];
        let read = reader.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..read], b"pong");
    }

    #[tokio::test]
    async fn test_empty_send_is_argument_error() {
        let (ctx, _reader, _client) = stream_context("ctx-arg");
        assert!(matches!(
            ctx.send_from_server(b"").await,
            Err(SessionError::InvalidArgument(_))
        ));
        assert!(ctx.get_last_error().is_none());
        assert!(ctx.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (ctx, mut reader, mut client) = stream_context("ctx-close");
        assert!(ctx.close().await);
        assert!(!ctx.close().await);
        assert_eq!(ctx.connection_state(), ConnectionState::Closed);
        assert!(ctx.get_client_ip_endpoint().is_none());

        assert!(matches!(
            ctx.send_from_server(b"late").await,
            Err(SessionError::NotConnected)
        ));
        let mut buf = [0u8; 4];
        assert_eq!(reader.receive(&mut buf).await.unwrap(), 0);

        // Writer shutdown reaches the client as end of stream
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_receive() {
        let (ctx, mut reader, _client) = stream_context("ctx-wake");
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.receive(&mut buf).await
        });
        tokio::task::yield_now().await;

        assert!(ctx.close().await);
        assert_eq!(pending.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transport_fault_reported_once() {
        let (server, client) = tokio::io::duplex(64);
        let (bridge, mut faults) = fault_channel();
        let (ctx, _reader) = ConnectionContext::for_stream(info("ctx-fault"), server, (), bridge);
        drop(client);

        let err = ctx.send_from_server(b"to nowhere").await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.context_id, "ctx-fault");
        assert_eq!(fault.operation, Operation::Send);
        assert_eq!(fault.kind, FaultKind::Transport);
        assert!(faults.try_recv().is_err());

        assert_eq!(ctx.connection_state(), ConnectionState::Closed);
        assert_eq!(ctx.get_last_error().unwrap().context_id, "ctx-fault");
        assert!(matches!(
            ctx.send_from_server(b"again").await,
            Err(SessionError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_timed_out() {
        let (ctx, _reader, _client) = stream_context("ctx-idle");
        assert!(!ctx.has_timed_out(10));
        assert!(!ctx.has_timed_out(-1));

        tokio::time::advance(Duration::from_secs(10 * 60 + 1)).await;
        assert!(ctx.has_timed_out(10));
        assert!(!ctx.has_timed_out(-1));

        ctx.touch();
        assert!(!ctx.has_timed_out(10));
        assert!(!ctx.has_timed_out(0));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ctx.has_timed_out(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_activity_moves_forward() {
        let (ctx, _reader, _client) = stream_context("ctx-mono");
        let start = ctx.last_activity();
        tokio::time::advance(Duration::from_secs(30)).await;
        ctx.touch();
        let later = ctx.last_activity();
        assert!(later > start);
        ctx.touch();
        assert!(ctx.last_activity() >= later);
    }

    #[tokio::test]
    async fn test_state_and_connection_id() {
        let (ctx, _reader, _client) = stream_context("ctx-state");
        assert_eq!(ctx.connection_id().await, "ctx-state");
        ctx.set_connection_id("resumed-7").await;
        assert_eq!(ctx.connection_id().await, "resumed-7");
        assert_eq!(ctx.unique_id(), "ctx-state");

        *ctx.state_mut().await += 3;
        assert_eq!(*ctx.state().await, 3);
    }

    #[tokio::test]
    async fn test_send_detached() {
        let (ctx, _reader, mut client) = stream_context("ctx-detached");
        let pending = ctx.send_detached(Bytes::from_static(b"async"));
        assert_eq!(pending.await.unwrap(), 5);

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"async");
    }

    #[tokio::test]
    async fn test_detached_send_after_close_is_reported() {
        let (server, _client) = tokio::io::duplex(64);
        let (bridge, mut faults) = fault_channel();
        let (ctx, _reader) = ConnectionContext::for_stream(info("ctx-late"), server, (), bridge);
        assert!(ctx.close().await);

        let result = ctx.send_detached(Bytes::from_static(b"late")).await;
        assert!(matches!(result, Err(SessionError::NotConnected)));

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.context_id, "ctx-late");
        assert_eq!(fault.operation, Operation::Send);
        assert_eq!(fault.kind, FaultKind::NotConnected);
        assert_eq!(ctx.get_last_error().unwrap().kind, FaultKind::NotConnected);
    }

    #[tokio::test]
    async fn test_detached_empty_send_is_reported() {
        let (server, _client) = tokio::io::duplex(64);
        let (bridge, mut faults) = fault_channel();
        let (ctx, _reader) = ConnectionContext::for_stream(info("ctx-empty"), server, (), bridge);

        let result = ctx.send_detached(Bytes::new()).await;
        assert!(matches!(result, Err(SessionError::InvalidArgument(_))));

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.kind, FaultKind::Other);
        assert!(ctx.is_open());
    }

    /// Stream whose write side refuses to shut down
    struct StuckShutdown;

    impl AsyncRead for StuckShutdown {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for StuckShutdown {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut TaskContext<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer gone",
            )))
        }
    }

    #[tokio::test]
    async fn test_failed_shutdown_is_reported_as_close_fault() {
        let (bridge, mut faults) = fault_channel();
        let (ctx, _reader) =
            ConnectionContext::for_stream(info("ctx-shutdown"), StuckShutdown, (), bridge);
        assert_eq!(ctx.send_from_server(b"bye").await.unwrap(), 3);

        assert!(ctx.close().await);
        assert_eq!(ctx.connection_state(), ConnectionState::Closed);

        let fault = faults.recv().await.unwrap();
        assert_eq!(fault.context_id, "ctx-shutdown");
        assert_eq!(fault.operation, Operation::Close);
        assert_eq!(fault.kind, FaultKind::Transport);
        assert!(faults.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_datagram_context_sends_to_remote() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (bridge, _rx) = fault_channel();

        let ctx = ConnectionContext::for_datagram(
            ContextInfo {
                unique_id: "udp-1".to_string(),
                server_name: "udp".to_string(),
                remote: client.local_addr().unwrap().into(),
                secured: false,
            },
            server,
            (),
            bridge,
        );
        assert!(ctx.is_datagram());
        assert_eq!(ctx.send_from_server(b"dgram").await.unwrap(), 5);

        let mut buf = [0u8; 16];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"dgram");

        assert!(ctx.close().await);
        assert!(matches!(
            ctx.send_from_server(b"x").await,
            Err(SessionError::NotConnected)
        ));
    }
}
