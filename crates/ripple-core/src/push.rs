//! Push: one in-flight request/reply correlation unit.
//!
//! A push is bound to one envelope and to the join generation active when it
//! was created. It resolves to exactly one terminal status, exactly once:
//! whichever of reply arrival and timer expiry happens first wins, and the
//! losing path is a no-op. Waiters subscribe individually; dropping a
//! waiter's receiver abandons that wait without affecting resolution.

use std::time::Duration;

use ripple_protocol::Envelope;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::SocketError;

/// Terminal status of a push.
#[derive(Debug, Clone)]
pub enum PushStatus {
    /// Server accepted the request.
    Ok(Value),
    /// Server rejected the request.
    Error(Value),
    /// No reply within the configured window.
    Timeout,
    /// Transport closed while the request was outstanding.
    ConnectionLost,
    /// Channel was left while the request was outstanding.
    Left,
}

impl PushStatus {
    /// Convert into the caller-facing result.
    pub fn into_result(self) -> Result<Value, SocketError> {
        match self {
            PushStatus::Ok(value) => Ok(value),
            PushStatus::Error(value) => Err(SocketError::PushRejected(value)),
            PushStatus::Timeout => Err(SocketError::PushTimeout),
            PushStatus::ConnectionLost => Err(SocketError::ConnectionLost),
            PushStatus::Left => Err(SocketError::ChannelLeft),
        }
    }
}

/// One outgoing request awaiting a correlated reply or timeout.
#[derive(Debug)]
pub struct Push {
    envelope: Envelope,
    timeout: Duration,
    status: Option<PushStatus>,
    waiters: Vec<oneshot::Sender<PushStatus>>,
}

impl Push {
    /// Create a pending push for the given envelope.
    #[must_use]
    pub fn new(envelope: Envelope, timeout: Duration) -> Self {
        Self {
            envelope,
            timeout,
            status: None,
            waiters: Vec::new(),
        }
    }

    /// Get the envelope.
    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Get the envelope for correlation stamping (ref, join_ref).
    pub fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    /// Get the request reference, if assigned.
    #[must_use]
    pub fn reference(&self) -> Option<&str> {
        self.envelope.reference.as_deref()
    }

    /// Get the captured join generation, if assigned.
    #[must_use]
    pub fn join_ref(&self) -> Option<&str> {
        self.envelope.join_ref.as_deref()
    }

    /// Get the reply window.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check whether a terminal status has been reached.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status.is_some()
    }

    /// Register a waiter.
    ///
    /// Subscribing to an already-resolved push yields the terminal status
    /// immediately.
    pub fn subscribe(&mut self) -> oneshot::Receiver<PushStatus> {
        let (tx, rx) = oneshot::channel();
        match &self.status {
            Some(status) => {
                let _ = tx.send(status.clone());
            }
            None => self.waiters.push(tx),
        }
        rx
    }

    /// Resolve to a terminal status.
    ///
    /// Returns `false` (and does nothing) if the push is already resolved.
    pub fn resolve(&mut self, status: PushStatus) -> bool {
        if self.status.is_some() {
            return false;
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(status.clone());
        }
        self.status = Some(status);
        true
    }
}
