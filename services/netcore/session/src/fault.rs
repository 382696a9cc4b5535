//! Asynchronous fault delivery from connection I/O to its owner.
//!
//! Every transport failure on a context is recorded once in the context's
//! [`FaultSlot`] (so [`get_last_error`] keeps returning it) and pushed onto an
//! unbounded channel read by the owner through a [`FaultReceiver`]. Reporting
//! never awaits, so the I/O path that raised the fault cannot be blocked or
//! re-entered by the notification.
//!
//! [`get_last_error`]: crate::ConnectionContext::get_last_error

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Operation that raised a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Writing to the client
    Send,
    /// Reading from the client
    Receive,
    /// Tearing the transport down
    Close,
}

/// Broad category of a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// OS-level transport failure
    Transport,
    /// Operation attempted on a context that is no longer open
    NotConnected,
    /// Anything else surfaced by a detached operation
    Other,
}

/// One observed fault
#[derive(Debug, Clone)]
pub struct Fault {
    /// Unique identifier of the failing context
    pub context_id: String,
    /// Operation that failed
    pub operation: Operation,
    /// Fault category
    pub kind: FaultKind,
    /// Human readable description
    pub message: String,
    /// OS error code, when the fault came from the OS
    pub os_code: Option<i32>,
    /// Wall-clock time the fault was observed
    pub at: DateTime<Utc>,
}

impl Fault {
    /// Build a fault record from a session error
    pub fn from_error(context_id: &str, operation: Operation, error: &SessionError) -> Self {
        let kind = match error {
            SessionError::Transport(_) | SessionError::Socket(_) => FaultKind::Transport,
            SessionError::NotConnected => FaultKind::NotConnected,
            _ => FaultKind::Other,
        };
        Self {
            context_id: context_id.to_string(),
            operation,
            kind,
            message: error.to_string(),
            os_code: error.os_code(),
            at: Utc::now(),
        }
    }
}

/// Per-context storage for the most recent fault
#[derive(Debug, Clone, Default)]
pub struct FaultSlot {
    last: Arc<Mutex<Option<Fault>>>,
}

impl FaultSlot {
    /// Create an empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored fault
    pub fn record(&self, fault: Fault) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(fault);
    }

    /// Most recent fault, if any
    pub fn last(&self) -> Option<Fault> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Sending side of the fault channel, cloned into every context
#[derive(Debug, Clone)]
pub struct FaultBridge {
    tx: mpsc::UnboundedSender<Fault>,
}

/// Owner side of the fault channel
pub type FaultReceiver = mpsc::UnboundedReceiver<Fault>;

/// Create a connected bridge/receiver pair
pub fn fault_channel() -> (FaultBridge, FaultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FaultBridge { tx }, rx)
}

impl FaultBridge {
    /// Record `fault` in `slot` and notify the owner.
    ///
    /// Never blocks. A dropped receiver only loses the notification; the slot
    /// still holds the fault.
    pub fn report(&self, slot: &FaultSlot, fault: Fault) {
        debug!(
            "Fault on context {} during {:?}: {}",
            fault.context_id, fault.operation, fault.message
        );
        slot.record(fault.clone());
        if self.tx.send(fault).is_err() {
            warn!("Fault receiver dropped; notification discarded");
        }
    }
}

/// Result slot for an operation dispatched onto its own task.
///
/// Resolves to [`SessionError::Aborted`] if the task ends without reporting.
#[derive(Debug)]
pub struct PendingOperation<T> {
    rx: oneshot::Receiver<Result<T, SessionError>>,
}

impl<T> PendingOperation<T> {
    /// Create a pending operation and the sender that completes it
    pub fn channel() -> (oneshot::Sender<Result<T, SessionError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl<T> Future for PendingOperation<T> {
    type Output = Result<T, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SessionError::Aborted)))
    }
}
