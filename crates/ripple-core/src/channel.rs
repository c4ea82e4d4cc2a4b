//! Channel: per-topic state machine.
//!
//! A channel owns its join generation, its in-flight and buffered pushes,
//! its presence map, and its event subscriptions. All mutation happens
//! inside the socket's serialization domain; the public [`Channel`] handle
//! only sends commands into it.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::ChannelConfig;
use crate::error::SocketError;
use crate::presence::{Presence, PresenceDiff, PresenceState};
use crate::push::{Push, PushStatus};
use crate::socket::Command;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Initial state, and terminal after a leave.
    Closed,
    /// Join request in flight.
    Joining,
    /// Join acknowledged for the current generation.
    Joined,
    /// Leave request in flight.
    Leaving,
    /// Join failed or the connection dropped; eligible for rejoin.
    Errored,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Closed => "closed",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
            ChannelState::Errored => "errored",
        };
        write!(f, "{name}")
    }
}

/// Presence change delivered to presence subscribers.
#[derive(Debug, Clone)]
pub enum PresenceUpdate {
    /// Full snapshot replaced the local map.
    Sync(PresenceState),
    /// One diff was folded into the map; carries only that diff's entries.
    Diff(PresenceDiff),
}

/// Removable handle to an event subscription.
///
/// Dropping the handle only stops reading; the registration stays until
/// [`Channel::off`] removes it explicitly.
#[derive(Debug)]
pub struct EventSubscription {
    id: u64,
    event: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventSubscription {
    /// Get the subscription identifier, used with [`Channel::off`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the subscribed event name.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Receive the next payload for the subscribed event.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_next(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }
}

/// Removable handle to a presence subscription.
#[derive(Debug)]
pub struct PresenceSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<PresenceUpdate>,
}

impl PresenceSubscription {
    /// Get the subscription identifier, used with [`Channel::off`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next presence change.
    pub async fn next(&mut self) -> Option<PresenceUpdate> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_next(&mut self) -> Option<PresenceUpdate> {
        self.rx.try_recv().ok()
    }
}

struct Binding {
    id: u64,
    event: String,
    tx: mpsc::UnboundedSender<Value>,
}

/// Channel state owned by the socket task.
pub(crate) struct ChannelCore {
    pub(crate) topic: String,
    pub(crate) config: ChannelConfig,
    pub(crate) state: ChannelState,
    /// Current join generation; replies tagged with any other generation
    /// are stale.
    pub(crate) join_ref: Option<String>,
    /// The single outstanding (or last terminal) join push.
    pub(crate) join_push: Option<Push>,
    pub(crate) leave_push: Option<Push>,
    /// In-flight pushes by ref.
    pub(crate) pending: std::collections::HashMap<String, Push>,
    /// Pushes waiting for the next successful join.
    pub(crate) buffered: Vec<Push>,
    pub(crate) presence: Presence,
    pub(crate) rejoin_scheduled: bool,
    pub(crate) rejoin_attempts: u32,
    bindings: Vec<Binding>,
    presence_bindings: Vec<(u64, mpsc::UnboundedSender<PresenceUpdate>)>,
    next_binding_id: u64,
}

impl ChannelCore {
    pub(crate) fn new(topic: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            topic: topic.into(),
            config,
            state: ChannelState::Closed,
            join_ref: None,
            join_push: None,
            leave_push: None,
            pending: std::collections::HashMap::new(),
            buffered: Vec::new(),
            presence: Presence::new(),
            rejoin_scheduled: false,
            rejoin_attempts: 0,
            bindings: Vec::new(),
            presence_bindings: Vec::new(),
            next_binding_id: 0,
        }
    }

    /// Reply window for this channel's pushes.
    pub(crate) fn push_timeout(&self, default: Duration) -> Duration {
        self.config.push_timeout.unwrap_or(default)
    }

    /// Register an event subscription; callbacks fire in registration order.
    pub(crate) fn bind(&mut self, event: impl Into<String>) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_binding_id += 1;
        let id = self.next_binding_id;
        let event = event.into();
        self.bindings.push(Binding {
            id,
            event: event.clone(),
            tx,
        });
        EventSubscription { id, event, rx }
    }

    /// Register a presence subscription.
    pub(crate) fn bind_presence(&mut self) -> PresenceSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_binding_id += 1;
        let id = self.next_binding_id;
        self.presence_bindings.push((id, tx));
        PresenceSubscription { id, rx }
    }

    /// Remove a subscription by id. Returns `true` if one was removed.
    pub(crate) fn unbind(&mut self, id: u64) -> bool {
        let before = self.bindings.len() + self.presence_bindings.len();
        self.bindings.retain(|b| b.id != id);
        self.presence_bindings.retain(|(bid, _)| *bid != id);
        before != self.bindings.len() + self.presence_bindings.len()
    }

    /// Dispatch an event to matching subscribers, in registration order.
    ///
    /// Unbounded sends: a slow subscriber never stalls the inbound loop.
    pub(crate) fn dispatch(&self, event: &str, payload: &Value) {
        for binding in self.bindings.iter().filter(|b| b.event == event) {
            let _ = binding.tx.send(payload.clone());
        }
    }

    /// Notify presence subscribers.
    pub(crate) fn notify_presence(&self, update: &PresenceUpdate) {
        for (_, tx) in &self.presence_bindings {
            let _ = tx.send(update.clone());
        }
    }

    /// Resolve every outstanding push (join, leave, in-flight, buffered)
    /// with the given status.
    pub(crate) fn resolve_outstanding(&mut self, status: &PushStatus) {
        if let Some(push) = self.join_push.as_mut() {
            push.resolve(status.clone());
        }
        if let Some(push) = self.leave_push.as_mut() {
            push.resolve(status.clone());
        }
        for (_, mut push) in self.pending.drain() {
            push.resolve(status.clone());
        }
        for mut push in self.buffered.drain(..) {
            push.resolve(status.clone());
        }
        debug!(topic = %self.topic, "Outstanding pushes resolved");
    }
}

/// Handle to a channel, backed by the owning socket's command loop.
#[derive(Debug, Clone)]
pub struct Channel {
    topic: String,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub(crate) fn new(topic: impl Into<String>, cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            topic: topic.into(),
            cmd_tx,
        }
    }

    /// Get the channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SocketError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| SocketError::SocketClosed)?;
        rx.await.map_err(|_| SocketError::SocketClosed)
    }

    async fn await_push(
        &self,
        waiter: oneshot::Receiver<PushStatus>,
    ) -> Result<Value, SocketError> {
        waiter
            .await
            .map_err(|_| SocketError::SocketClosed)?
            .into_result()
    }

    /// Join the channel.
    ///
    /// Concurrent calls while a join is in flight all observe the same
    /// result; only one join frame is sent per generation.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::JoinRejected`] when the server refuses the
    /// join, or the terminal failure of the join push.
    pub async fn join(&self) -> Result<Value, SocketError> {
        let waiter = self
            .request(|reply| Command::Join {
                topic: self.topic.clone(),
                reply,
            })
            .await??;

        match waiter.await.map_err(|_| SocketError::SocketClosed)? {
            PushStatus::Error(value) => Err(SocketError::JoinRejected(value)),
            other => other.into_result(),
        }
    }

    /// Leave the channel.
    ///
    /// The channel ends up `closed` regardless of the leave reply's outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only if the leave could not be initiated.
    pub async fn leave(&self) -> Result<(), SocketError> {
        let waiter = self
            .request(|reply| Command::Leave {
                topic: self.topic.clone(),
                reply,
            })
            .await??;

        // Reply, timeout, or connection loss: closed either way.
        let _ = waiter.await;
        Ok(())
    }

    /// Send an event to the server and wait for the correlated reply.
    ///
    /// # Errors
    ///
    /// Returns [`SocketError::ChannelUnavailable`] synchronously while the
    /// channel cannot carry pushes, otherwise the push's terminal failure.
    pub async fn push(&self, event: &str, payload: Value) -> Result<Value, SocketError> {
        self.push_inner(event, payload, None, false).await
    }

    /// [`Channel::push`] with an explicit reply window.
    ///
    /// # Errors
    ///
    /// See [`Channel::push`].
    pub async fn push_with_timeout(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, SocketError> {
        self.push_inner(event, payload, Some(timeout), false).await
    }

    /// Send a broadcast.
    ///
    /// With `ack_broadcasts` disabled this resolves `Ok` as soon as the
    /// frame is handed to the transport; with it enabled it behaves exactly
    /// like [`Channel::push`].
    ///
    /// # Errors
    ///
    /// See [`Channel::push`].
    pub async fn broadcast(&self, event: &str, payload: Value) -> Result<Value, SocketError> {
        self.push_inner(event, payload, None, true).await
    }

    async fn push_inner(
        &self,
        event: &str,
        payload: Value,
        timeout: Option<Duration>,
        broadcast: bool,
    ) -> Result<Value, SocketError> {
        let waiter = self
            .request(|reply| Command::Push {
                topic: self.topic.clone(),
                event: event.to_string(),
                payload,
                timeout,
                broadcast,
                reply,
            })
            .await??;
        self.await_push(waiter).await
    }

    /// Subscribe to an event by exact name.
    ///
    /// # Errors
    ///
    /// Fails only when the channel no longer exists.
    pub async fn on(&self, event: &str) -> Result<EventSubscription, SocketError> {
        self.request(|reply| Command::Bind {
            topic: self.topic.clone(),
            event: event.to_string(),
            reply,
        })
        .await?
    }

    /// Remove a subscription registered with [`Channel::on`] or
    /// [`Channel::on_presence`].
    ///
    /// # Errors
    ///
    /// Fails only when the channel no longer exists.
    pub async fn off(&self, id: u64) -> Result<bool, SocketError> {
        self.request(|reply| Command::Unbind {
            topic: self.topic.clone(),
            id,
            reply,
        })
        .await?
    }

    /// Subscribe to presence changes.
    ///
    /// # Errors
    ///
    /// Fails only when the channel no longer exists.
    pub async fn on_presence(&self) -> Result<PresenceSubscription, SocketError> {
        self.request(|reply| Command::BindPresence {
            topic: self.topic.clone(),
            reply,
        })
        .await?
    }

    /// Get a snapshot of the channel's presence map.
    ///
    /// # Errors
    ///
    /// Fails only when the channel no longer exists.
    pub async fn presence(&self) -> Result<PresenceState, SocketError> {
        self.request(|reply| Command::PresenceSnapshot {
            topic: self.topic.clone(),
            reply,
        })
        .await?
    }

    /// Register own presence metadata with the server.
    ///
    /// # Errors
    ///
    /// See [`Channel::push`].
    pub async fn track(&self, meta: Value) -> Result<Value, SocketError> {
        let waiter = self
            .request(|reply| Command::Track {
                topic: self.topic.clone(),
                meta,
                reply,
            })
            .await??;
        self.await_push(waiter).await
    }

    /// Remove own presence metadata from the server.
    ///
    /// # Errors
    ///
    /// See [`Channel::push`].
    pub async fn untrack(&self) -> Result<Value, SocketError> {
        let waiter = self
            .request(|reply| Command::Untrack {
                topic: self.topic.clone(),
                reply,
            })
            .await??;
        self.await_push(waiter).await
    }

    /// Get the current channel state.
    ///
    /// # Errors
    ///
    /// Fails only when the channel no longer exists.
    pub async fn state(&self) -> Result<ChannelState, SocketError> {
        self.request(|reply| Command::ChannelState {
            topic: self.topic.clone(),
            reply,
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dispatch_matches_exact_event_name() {
        let mut core = ChannelCore::new("room:lobby", ChannelConfig::default());
        let mut shout = core.bind("shout");
        let mut other = core.bind("whisper");

        core.dispatch("shout", &json!({"body": "hi"}));

        assert_eq!(shout.try_next(), Some(json!({"body": "hi"})));
        assert_eq!(other.try_next(), None);
    }

    #[test]
    fn test_unbind_shrinks_subscriber_list() {
        let mut core = ChannelCore::new("room:lobby", ChannelConfig::default());
        let mut first = core.bind("shout");
        let mut second = core.bind("shout");

        assert!(core.unbind(first.id()));
        core.dispatch("shout", &json!(1));

        assert_eq!(first.try_next(), None);
        assert_eq!(second.try_next(), Some(json!(1)));

        // Unknown id removes nothing.
        assert!(!core.unbind(9999));
    }

    #[test]
    fn test_resolve_outstanding_covers_all_pushes() {
        use ripple_protocol::Envelope;

        let mut core = ChannelCore::new("room:lobby", ChannelConfig::default());
        let timeout = Duration::from_secs(5);

        let mut join = Push::new(Envelope::join("room:lobby", Value::Null), timeout);
        let join_rx = join.subscribe();
        core.join_push = Some(join);

        let mut sent = Push::new(
            Envelope::new("room:lobby", "shout", Value::Null).with_ref("2"),
            timeout,
        );
        let sent_rx = sent.subscribe();
        core.pending.insert("2".to_string(), sent);

        let mut queued = Push::new(Envelope::new("room:lobby", "shout", Value::Null), timeout);
        let queued_rx = queued.subscribe();
        core.buffered.push(queued);

        core.resolve_outstanding(&PushStatus::ConnectionLost);

        for rx in [join_rx, sent_rx, queued_rx] {
            assert!(matches!(
                rx.blocking_recv().unwrap(),
                PushStatus::ConnectionLost
            ));
        }
        assert!(core.pending.is_empty());
        assert!(core.buffered.is_empty());
    }
}
