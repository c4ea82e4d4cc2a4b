//! Socket: connection lifecycle and cross-channel bookkeeping.
//!
//! One socket owns one transport connection, the ref and join-generation
//! counters, and the channel registry. Every mutation happens inside a
//! single task fed by a command channel — the engine's serialization
//! domain. Heartbeat ticks, push timeouts, reconnect backoff, and inbound
//! frames are all delivered as commands by spawned helpers that hold only a
//! weak handle to the loop, so dropping the last [`Socket`]/[`Channel`]
//! handle shuts the engine down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ripple_protocol::{
    events, Envelope, EnvelopeCodec, Reply, ReplyStatus, WireMessage, CONTROL_TOPIC,
};
use ripple_transport::{ConnSink, ConnStream, Transport};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::TokenProvider;
use crate::channel::{
    Channel, ChannelCore, ChannelState, EventSubscription, PresenceSubscription, PresenceUpdate,
};
use crate::config::{ChannelConfig, SocketConfig};
use crate::error::SocketError;
use crate::presence::{PresenceDiff, PresenceState};
use crate::push::{Push, PushStatus};

/// Connection status of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    /// No transport open.
    Disconnected,
    /// Connect attempt in flight.
    Connecting,
    /// Transport open and heartbeating.
    Connected,
}

/// Commands processed by the socket task.
pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), SocketError>>,
    },
    Disconnect {
        reason: String,
        reply: oneshot::Sender<()>,
    },
    CreateChannel {
        topic: String,
        config: ChannelConfig,
        reply: oneshot::Sender<Channel>,
    },
    Status {
        reply: oneshot::Sender<SocketStatus>,
    },
    ChannelState {
        topic: String,
        reply: oneshot::Sender<Result<ChannelState, SocketError>>,
    },
    Join {
        topic: String,
        reply: oneshot::Sender<Result<oneshot::Receiver<PushStatus>, SocketError>>,
    },
    Leave {
        topic: String,
        reply: oneshot::Sender<Result<oneshot::Receiver<PushStatus>, SocketError>>,
    },
    Push {
        topic: String,
        event: String,
        payload: Value,
        timeout: Option<Duration>,
        broadcast: bool,
        reply: oneshot::Sender<Result<oneshot::Receiver<PushStatus>, SocketError>>,
    },
    Track {
        topic: String,
        meta: Value,
        reply: oneshot::Sender<Result<oneshot::Receiver<PushStatus>, SocketError>>,
    },
    Untrack {
        topic: String,
        reply: oneshot::Sender<Result<oneshot::Receiver<PushStatus>, SocketError>>,
    },
    Bind {
        topic: String,
        event: String,
        reply: oneshot::Sender<Result<EventSubscription, SocketError>>,
    },
    Unbind {
        topic: String,
        id: u64,
        reply: oneshot::Sender<Result<bool, SocketError>>,
    },
    BindPresence {
        topic: String,
        reply: oneshot::Sender<Result<PresenceSubscription, SocketError>>,
    },
    PresenceSnapshot {
        topic: String,
        reply: oneshot::Sender<Result<PresenceState, SocketError>>,
    },
    Inbound {
        epoch: u64,
        message: WireMessage,
    },
    TransportClosed {
        epoch: u64,
    },
    HeartbeatTick {
        epoch: u64,
    },
    PushTimeout {
        topic: String,
        reference: String,
    },
    Rejoin {
        topic: String,
        epoch: u64,
    },
    TryConnect {
        epoch: u64,
    },
}

/// Handle to a running socket. Cheap to clone; the engine shuts down when
/// the last socket and channel handle is dropped.
#[derive(Debug, Clone)]
pub struct Socket {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Socket {
    /// Spawn the engine for the given endpoint.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        config: SocketConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn TokenProvider>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let core = SocketCore::new(url.into(), config, transport, auth, cmd_tx.downgrade());
        tokio::spawn(core.run(cmd_rx));
        Self { cmd_tx }
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

    /// Open the transport and rejoin previously joined channels.
    ///
    /// A failed attempt is surfaced to the caller and also arms the
    /// reconnect policy, which keeps retrying until success or an explicit
    /// [`Socket::disconnect`].
    ///
    /// # Errors
    ///
    /// Returns the auth or transport failure of this attempt.
    pub async fn connect(&self) -> Result<(), SocketError> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Close the transport and stop reconnecting.
    ///
    /// Channels are marked errored but keep their configuration, so a later
    /// [`Socket::connect`] rejoins them.
    ///
    /// # Errors
    ///
    /// Fails only when the engine task is gone.
    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<(), SocketError> {
        self.request(|reply| Command::Disconnect {
            reason: reason.into(),
            reply,
        })
        .await
    }

    /// Get (or create) the channel for a topic. Topics are unique per
    /// socket; an existing channel keeps its original configuration.
    ///
    /// # Errors
    ///
    /// Fails only when the engine task is gone.
    pub async fn channel(
        &self,
        topic: impl Into<String>,
        config: ChannelConfig,
    ) -> Result<Channel, SocketError> {
        let topic = topic.into();
        self.request(|reply| Command::CreateChannel {
            topic,
            config,
            reply,
        })
        .await
    }

    /// Get the current connection status.
    ///
    /// # Errors
    ///
    /// Fails only when the engine task is gone.
    pub async fn status(&self) -> Result<SocketStatus, SocketError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

enum ReplyTarget {
    Join,
    Leave,
}

enum EventFollowUp {
    None,
    Remove,
    Rejoin,
}

struct SocketCore {
    url: String,
    config: SocketConfig,
    codec: EnvelopeCodec,
    transport: Arc<dyn Transport>,
    auth: Arc<dyn TokenProvider>,
    /// Weak handle for timers and the reader; strong handles live only in
    /// `Socket`/`Channel` so the engine can observe their teardown.
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    status: SocketStatus,
    sink: Option<Box<dyn ConnSink>>,
    /// Connection generation; stale readers and timers carry an old value.
    epoch: u64,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    heartbeat_ref: Option<String>,
    missed_heartbeats: u32,
    ref_counter: u64,
    generation_counter: u64,
    channels: HashMap<String, ChannelCore>,
    reconnect_attempts: u32,
    reconnect_timer: Option<JoinHandle<()>>,
    manual_disconnect: bool,
}

impl SocketCore {
    fn new(
        url: String,
        config: SocketConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn TokenProvider>,
        cmd_tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let codec = EnvelopeCodec::new(config.wire_format);
        Self {
            url,
            config,
            codec,
            transport,
            auth,
            cmd_tx,
            status: SocketStatus::Disconnected,
            sink: None,
            epoch: 0,
            reader: None,
            heartbeat: None,
            heartbeat_ref: None,
            missed_heartbeats: 0,
            ref_counter: 0,
            generation_counter: 0,
            channels: HashMap::new(),
            reconnect_attempts: 0,
            reconnect_timer: None,
            manual_disconnect: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            self.handle(cmd).await;
        }
        // Last handle dropped.
        if let Some(handle) = self.reconnect_timer.take() {
            handle.abort();
        }
        self.teardown_link().await;
        debug!("Socket task finished");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { reply } => {
                self.manual_disconnect = false;
                if self.status == SocketStatus::Connected {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let result = self.do_connect().await;
                if result.is_err() {
                    self.schedule_reconnect();
                }
                let _ = reply.send(result);
            }
            Command::Disconnect { reason, reply } => {
                self.manual_disconnect = true;
                if let Some(handle) = self.reconnect_timer.take() {
                    handle.abort();
                }
                self.reconnect_attempts = 0;
                self.teardown_link().await;
                self.mark_channels_disconnected();
                info!(reason = %reason, "Socket disconnected");
                let _ = reply.send(());
            }
            Command::CreateChannel {
                topic,
                config,
                reply,
            } => {
                if !self.channels.contains_key(&topic) {
                    debug!(topic = %topic, "Channel created");
                    self.channels
                        .insert(topic.clone(), ChannelCore::new(topic.clone(), config));
                }
                if let Some(cmd_tx) = self.cmd_tx.upgrade() {
                    let _ = reply.send(Channel::new(topic, cmd_tx));
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status);
            }
            Command::ChannelState { topic, reply } => {
                let result = match self.channels.get(&topic) {
                    Some(channel) => Ok(channel.state),
                    None => Err(missing_channel(&topic)),
                };
                let _ = reply.send(result);
            }
            Command::Join { topic, reply } => {
                let result = self.handle_join(&topic).await;
                let _ = reply.send(result);
            }
            Command::Leave { topic, reply } => {
                let result = self.handle_leave(&topic).await;
                let _ = reply.send(result);
            }
            Command::Push {
                topic,
                event,
                payload,
                timeout,
                broadcast,
                reply,
            } => {
                let result = self
                    .handle_push(&topic, event, payload, timeout, broadcast)
                    .await;
                let _ = reply.send(result);
            }
            Command::Track { topic, meta, reply } => {
                let key = self
                    .channels
                    .get(&topic)
                    .map(|channel| channel.config.presence_key.clone());
                let result = match key {
                    Some(key) => {
                        let payload = json!({ "key": key, "meta": meta });
                        self.handle_push(
                            &topic,
                            events::PRESENCE_TRACK.to_string(),
                            payload,
                            None,
                            false,
                        )
                        .await
                    }
                    None => Err(missing_channel(&topic)),
                };
                let _ = reply.send(result);
            }
            Command::Untrack { topic, reply } => {
                let key = self
                    .channels
                    .get(&topic)
                    .map(|channel| channel.config.presence_key.clone());
                let result = match key {
                    Some(key) => {
                        let payload = json!({ "key": key });
                        self.handle_push(
                            &topic,
                            events::PRESENCE_UNTRACK.to_string(),
                            payload,
                            None,
                            false,
                        )
                        .await
                    }
                    None => Err(missing_channel(&topic)),
                };
                let _ = reply.send(result);
            }
            Command::Bind {
                topic,
                event,
                reply,
            } => {
                let result = match self.channels.get_mut(&topic) {
                    Some(channel) => Ok(channel.bind(event)),
                    None => Err(missing_channel(&topic)),
                };
                let _ = reply.send(result);
            }
            Command::Unbind { topic, id, reply } => {
                let result = match self.channels.get_mut(&topic) {
                    Some(channel) => Ok(channel.unbind(id)),
                    None => Err(missing_channel(&topic)),
                };
                let _ = reply.send(result);
            }
            Command::BindPresence { topic, reply } => {
                let result = match self.channels.get_mut(&topic) {
                    Some(channel) => Ok(channel.bind_presence()),
                    None => Err(missing_channel(&topic)),
                };
                let _ = reply.send(result);
            }
            Command::PresenceSnapshot { topic, reply } => {
                let result = match self.channels.get(&topic) {
                    Some(channel) => Ok(channel.presence.snapshot()),
                    None => Err(missing_channel(&topic)),
                };
                let _ = reply.send(result);
            }
            Command::Inbound { epoch, message } => {
                self.handle_inbound(epoch, message).await;
            }
            Command::TransportClosed { epoch } => {
                if epoch != self.epoch {
                    return;
                }
                debug!("Transport closed");
                self.fail_connection().await;
            }
            Command::HeartbeatTick { epoch } => {
                self.handle_heartbeat_tick(epoch).await;
            }
            Command::PushTimeout { topic, reference } => {
                self.handle_push_timeout(&topic, &reference).await;
            }
            Command::Rejoin { topic, epoch } => {
                let eligible = self
                    .channels
                    .get_mut(&topic)
                    .map(|channel| {
                        let was_scheduled = channel.rejoin_scheduled;
                        channel.rejoin_scheduled = false;
                        was_scheduled && channel.state == ChannelState::Errored
                    })
                    .unwrap_or(false);
                if !eligible || epoch != self.epoch || self.status != SocketStatus::Connected {
                    return;
                }
                if let Err(e) = self.start_join(&topic).await {
                    warn!(topic = %topic, error = %e, "Rejoin failed");
                }
            }
            Command::TryConnect { epoch } => {
                if epoch == self.epoch {
                    // This timer just fired; forget it so a failed attempt
                    // can schedule the next one.
                    self.reconnect_timer = None;
                }
                if epoch != self.epoch
                    || self.manual_disconnect
                    || self.status == SocketStatus::Connected
                {
                    return;
                }
                if let Err(e) = self.do_connect().await {
                    debug!(error = %e, "Reconnect attempt failed");
                    self.schedule_reconnect();
                }
            }
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────────

    async fn do_connect(&mut self) -> Result<(), SocketError> {
        self.status = SocketStatus::Connecting;

        // Token is re-read on every attempt; refresh is the provider's job.
        let token = match self.auth.current_token().await {
            Ok(token) => token,
            Err(e) => {
                self.status = SocketStatus::Disconnected;
                return Err(e.into());
            }
        };

        let url = build_url(&self.url, token.as_deref());
        match self.transport.connect(&url, &[]).await {
            Ok(conn) => {
                self.epoch += 1;
                self.sink = Some(conn.sink);
                self.spawn_reader(conn.stream);
                self.spawn_heartbeat();
                self.heartbeat_ref = None;
                self.missed_heartbeats = 0;
                self.reconnect_attempts = 0;
                self.status = SocketStatus::Connected;
                info!(transport = self.transport.name(), "Socket connected");
                self.rejoin_all().await;
                Ok(())
            }
            Err(e) => {
                self.status = SocketStatus::Disconnected;
                debug!(error = %e, "Connect attempt failed");
                Err(e.into())
            }
        }
    }

    async fn teardown_link(&mut self) {
        self.epoch += 1;
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing transport");
            }
        }
        self.heartbeat_ref = None;
        self.missed_heartbeats = 0;
        self.status = SocketStatus::Disconnected;
    }

    /// Transport died underneath us: resolve everything in flight, mark
    /// channels for rejoin, and enter one reconnect cycle.
    async fn fail_connection(&mut self) {
        if self.status != SocketStatus::Connected {
            return;
        }
        self.teardown_link().await;
        self.mark_channels_disconnected();
        if !self.manual_disconnect {
            self.schedule_reconnect();
        }
    }

    fn mark_channels_disconnected(&mut self) {
        let mut leaving = Vec::new();
        for (topic, channel) in &mut self.channels {
            channel.resolve_outstanding(&PushStatus::ConnectionLost);
            channel.rejoin_scheduled = false;
            if channel.state == ChannelState::Leaving {
                leaving.push(topic.clone());
            } else {
                channel.state = ChannelState::Errored;
            }
        }
        // A leaving channel ends up closed no matter what.
        for topic in leaving {
            self.remove_channel(&topic);
        }
    }

    fn schedule_reconnect(&mut self) {
        if self
            .reconnect_timer
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }
        self.reconnect_attempts += 1;
        let delay = self.config.backoff.delay(self.reconnect_attempts);
        info!(
            attempt = self.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Reconnect scheduled"
        );
        let cmd_tx = self.cmd_tx.clone();
        let epoch = self.epoch;
        self.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(Command::TryConnect { epoch });
            }
        }));
    }

    fn spawn_reader(&mut self, mut stream: Box<dyn ConnStream>) {
        let cmd_tx = self.cmd_tx.clone();
        let epoch = self.epoch;
        self.reader = Some(tokio::spawn(async move {
            loop {
                let result = stream.next().await;
                let Some(tx) = cmd_tx.upgrade() else { break };
                match result {
                    Ok(Some(message)) => {
                        if tx.send(Command::Inbound { epoch, message }).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(Command::TransportClosed { epoch });
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Transport receive error");
                        let _ = tx.send(Command::TransportClosed { epoch });
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_heartbeat(&mut self) {
        let cmd_tx = self.cmd_tx.clone();
        let epoch = self.epoch;
        let interval = self.config.heartbeat_interval;
        self.heartbeat = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(tx) = cmd_tx.upgrade() else { break };
                if tx.send(Command::HeartbeatTick { epoch }).is_err() {
                    break;
                }
            }
        }));
    }

    async fn handle_heartbeat_tick(&mut self, epoch: u64) {
        if epoch != self.epoch || self.status != SocketStatus::Connected {
            return;
        }

        if self.heartbeat_ref.is_some() {
            self.missed_heartbeats += 1;
            if self.missed_heartbeats >= self.config.heartbeat_max_missed {
                warn!(
                    missed = self.missed_heartbeats,
                    "Heartbeat unanswered, forcing reconnect"
                );
                self.fail_connection().await;
            }
            return;
        }

        let reference = self.next_ref();
        let mut envelope = Envelope::heartbeat().with_ref(reference.clone());
        match self.send_envelope(&mut envelope).await {
            Ok(()) => {
                trace!(reference = %reference, "Heartbeat sent");
                self.heartbeat_ref = Some(reference);
            }
            Err(e) => {
                warn!(error = %e, "Heartbeat send failed");
                self.fail_connection().await;
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────

    fn next_ref(&mut self) -> String {
        self.ref_counter += 1;
        self.ref_counter.to_string()
    }

    fn next_generation(&mut self) -> String {
        self.generation_counter += 1;
        self.generation_counter.to_string()
    }

    /// Assign a ref if absent, serialize, and write. Never buffers.
    async fn send_envelope(&mut self, envelope: &mut Envelope) -> Result<(), SocketError> {
        if envelope.reference.is_none() {
            envelope.reference = Some(self.next_ref());
        }
        let frame = self.codec.encode(envelope)?;
        let Some(sink) = self.sink.as_mut() else {
            return Err(SocketError::NotConnected);
        };
        trace!(topic = %envelope.topic, event = %envelope.event, "Frame out");
        sink.send(frame).await?;
        Ok(())
    }

    fn spawn_push_timer(&self, topic: String, reference: String, timeout: Duration) {
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(Command::PushTimeout { topic, reference });
            }
        });
    }

    // ── Channel operations ────────────────────────────────────────────

    async fn handle_join(
        &mut self,
        topic: &str,
    ) -> Result<oneshot::Receiver<PushStatus>, SocketError> {
        let state = match self.channels.get(topic) {
            Some(channel) => channel.state,
            None => return Err(missing_channel(topic)),
        };

        match state {
            // An in-flight or terminal join result is shared by every
            // caller; no second join frame goes out.
            ChannelState::Joining | ChannelState::Joined => {
                if let Some(push) = self
                    .channels
                    .get_mut(topic)
                    .and_then(|channel| channel.join_push.as_mut())
                {
                    return Ok(push.subscribe());
                }
                self.start_join(topic).await
            }
            ChannelState::Closed | ChannelState::Errored => self.start_join(topic).await,
            ChannelState::Leaving => Err(SocketError::ChannelUnavailable {
                topic: topic.to_string(),
                state,
            }),
        }
    }

    /// Allocate a fresh join generation and send the join push.
    async fn start_join(
        &mut self,
        topic: &str,
    ) -> Result<oneshot::Receiver<PushStatus>, SocketError> {
        if !self.channels.contains_key(topic) {
            return Err(missing_channel(topic));
        }

        // Token is re-read at every rejoin.
        let token = match self.auth.current_token().await {
            Ok(token) => token,
            Err(e) => {
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.state = ChannelState::Errored;
                }
                return Err(e.into());
            }
        };

        let join_ref = self.next_generation();
        let reference = self.next_ref();
        let default_timeout = self.config.default_push_timeout;

        let (payload, timeout) = match self.channels.get_mut(topic) {
            Some(channel) => {
                channel.join_ref = Some(join_ref.clone());
                channel.state = ChannelState::Joining;
                channel.rejoin_scheduled = false;
                (
                    join_payload(&channel.config, token.as_deref()),
                    channel.push_timeout(default_timeout),
                )
            }
            None => return Err(missing_channel(topic)),
        };

        let mut envelope = Envelope::join(topic, payload)
            .with_ref(reference.clone())
            .with_join_ref(join_ref.clone());

        match self.send_envelope(&mut envelope).await {
            Ok(()) => {
                debug!(topic = %topic, join_ref = %join_ref, "Join sent");
                self.spawn_push_timer(topic.to_string(), reference, timeout);
                let mut push = Push::new(envelope, timeout);
                let waiter = push.subscribe();
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.join_push = Some(push);
                }
                Ok(waiter)
            }
            Err(e) => {
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.state = ChannelState::Errored;
                }
                Err(e)
            }
        }
    }

    async fn rejoin_all(&mut self) {
        let topics: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, channel)| {
                matches!(
                    channel.state,
                    ChannelState::Joining | ChannelState::Joined | ChannelState::Errored
                )
            })
            .map(|(topic, _)| topic.clone())
            .collect();

        for topic in topics {
            if let Err(e) = self.start_join(&topic).await {
                warn!(topic = %topic, error = %e, "Rejoin failed");
            }
        }
    }

    async fn handle_leave(
        &mut self,
        topic: &str,
    ) -> Result<oneshot::Receiver<PushStatus>, SocketError> {
        let default_timeout = self.config.default_push_timeout;
        let (timeout, join_ref) = match self.channels.get_mut(topic) {
            Some(channel) => {
                // Every other outstanding push resolves as left.
                channel.resolve_outstanding(&PushStatus::Left);
                channel.state = ChannelState::Leaving;
                (
                    channel.push_timeout(default_timeout),
                    channel.join_ref.clone(),
                )
            }
            None => return Err(missing_channel(topic)),
        };

        let reference = self.next_ref();
        let mut envelope = Envelope::leave(topic).with_ref(reference.clone());
        if let Some(join_ref) = join_ref {
            envelope = envelope.with_join_ref(join_ref);
        }

        match self.send_envelope(&mut envelope).await {
            Ok(()) => {
                debug!(topic = %topic, "Leave sent");
                self.spawn_push_timer(topic.to_string(), reference, timeout);
                let mut push = Push::new(envelope, timeout);
                let waiter = push.subscribe();
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.leave_push = Some(push);
                }
                Ok(waiter)
            }
            Err(_) => {
                // Nothing to tell the server: close immediately.
                let (tx, waiter) = oneshot::channel();
                let _ = tx.send(PushStatus::Ok(Value::Null));
                self.remove_channel(topic);
                Ok(waiter)
            }
        }
    }

    async fn handle_push(
        &mut self,
        topic: &str,
        event: String,
        payload: Value,
        timeout: Option<Duration>,
        broadcast: bool,
    ) -> Result<oneshot::Receiver<PushStatus>, SocketError> {
        let default_timeout = self.config.default_push_timeout;
        let (state, timeout, ack_broadcasts, join_ref) = match self.channels.get(topic) {
            Some(channel) => (
                channel.state,
                timeout.unwrap_or_else(|| channel.push_timeout(default_timeout)),
                channel.config.ack_broadcasts,
                channel.join_ref.clone(),
            ),
            None => return Err(missing_channel(topic)),
        };
        let fire_and_forget = broadcast && !ack_broadcasts;

        match state {
            ChannelState::Joined => {
                let reference = self.next_ref();
                let mut envelope = Envelope::new(topic, event, payload).with_ref(reference.clone());
                if let Some(join_ref) = join_ref {
                    envelope = envelope.with_join_ref(join_ref);
                }
                self.send_envelope(&mut envelope).await?;

                let mut push = Push::new(envelope, timeout);
                if fire_and_forget {
                    // Frame is on the wire; no reply expected.
                    push.resolve(PushStatus::Ok(Value::Null));
                    return Ok(push.subscribe());
                }

                let waiter = push.subscribe();
                self.spawn_push_timer(topic.to_string(), reference.clone(), timeout);
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.pending.insert(reference, push);
                }
                Ok(waiter)
            }
            ChannelState::Joining => {
                // Buffered for flush once the join is acknowledged.
                let mut push = Push::new(Envelope::new(topic, event, payload), timeout);
                if fire_and_forget {
                    push.resolve(PushStatus::Ok(Value::Null));
                }
                let waiter = push.subscribe();
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.buffered.push(push);
                }
                Ok(waiter)
            }
            state => Err(SocketError::ChannelUnavailable {
                topic: topic.to_string(),
                state,
            }),
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────

    async fn handle_inbound(&mut self, epoch: u64, message: WireMessage) {
        if epoch != self.epoch {
            trace!("Dropping frame from stale connection");
            return;
        }

        let envelope = match self.codec.decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Decode failures never take the connection down.
                warn!(error = %e, "Dropping malformed frame");
                return;
            }
        };

        trace!(topic = %envelope.topic, event = %envelope.event, "Frame in");

        if envelope.is_reply() {
            self.handle_reply(envelope).await;
        } else {
            self.handle_event(envelope);
        }
    }

    async fn handle_reply(&mut self, envelope: Envelope) {
        if envelope.topic == CONTROL_TOPIC {
            if envelope.reference == self.heartbeat_ref {
                trace!("Heartbeat acknowledged");
                self.heartbeat_ref = None;
                self.missed_heartbeats = 0;
            }
            return;
        }

        let reply = match Reply::from_payload(&envelope.payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "Dropping malformed reply");
                return;
            }
        };
        let status = match reply.status {
            ReplyStatus::Ok => PushStatus::Ok(reply.response),
            ReplyStatus::Error => PushStatus::Error(reply.response),
        };

        let Some(reference) = envelope.reference else {
            debug!(topic = %envelope.topic, "Dropping reply without ref");
            return;
        };
        let topic = envelope.topic;

        let target = {
            let Some(channel) = self.channels.get_mut(&topic) else {
                debug!(topic = %topic, "Reply for unknown topic");
                return;
            };

            // A reply is accepted only for the channel's current join
            // generation; anything else is from before a rejoin.
            if envelope.join_ref.is_some() && envelope.join_ref != channel.join_ref {
                debug!(topic = %topic, reference = %reference, "Discarding stale-generation reply");
                return;
            }

            if channel
                .join_push
                .as_ref()
                .and_then(Push::reference)
                .is_some_and(|r| r == reference)
            {
                ReplyTarget::Join
            } else if channel
                .leave_push
                .as_ref()
                .and_then(Push::reference)
                .is_some_and(|r| r == reference)
            {
                ReplyTarget::Leave
            } else if let Some(mut push) = channel.pending.remove(&reference) {
                push.resolve(status);
                return;
            } else {
                // Late or duplicate: the push already reached its terminal
                // status.
                debug!(topic = %topic, reference = %reference, "Reply with no pending push");
                return;
            }
        };

        match target {
            ReplyTarget::Join => self.complete_join(&topic, status).await,
            ReplyTarget::Leave => self.complete_leave(&topic, status),
        }
    }

    /// Terminal outcome of a join push (reply, timeout, or teardown).
    async fn complete_join(&mut self, topic: &str, status: PushStatus) {
        let newly_resolved = self
            .channels
            .get_mut(topic)
            .and_then(|channel| channel.join_push.as_mut())
            .map(|push| push.resolve(status.clone()))
            .unwrap_or(false);
        if !newly_resolved {
            return;
        }

        match status {
            PushStatus::Ok(_) => {
                self.flush_buffered(topic).await;
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.state = ChannelState::Joined;
                    channel.rejoin_attempts = 0;
                }
                info!(topic = %topic, "Channel joined");
            }
            PushStatus::Error(_) | PushStatus::Timeout => {
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.state = ChannelState::Errored;
                }
                warn!(topic = %topic, "Channel join failed");
                self.schedule_rejoin(topic);
            }
            PushStatus::ConnectionLost | PushStatus::Left => {
                if let Some(channel) = self.channels.get_mut(topic) {
                    channel.state = ChannelState::Errored;
                }
            }
        }
    }

    /// Send pushes buffered while the join was in flight, stamped with the
    /// generation that just got acknowledged.
    async fn flush_buffered(&mut self, topic: &str) {
        let (join_ref, buffered) = match self.channels.get_mut(topic) {
            Some(channel) => (
                channel.join_ref.clone(),
                channel.buffered.drain(..).collect::<Vec<_>>(),
            ),
            None => return,
        };

        for mut push in buffered {
            let reference = self.next_ref();
            {
                let envelope = push.envelope_mut();
                envelope.reference = Some(reference.clone());
                envelope.join_ref = join_ref.clone();
            }
            let mut envelope = push.envelope().clone();
            match self.send_envelope(&mut envelope).await {
                Ok(()) => {
                    if push.is_resolved() {
                        // Fire-and-forget broadcast: already ok.
                        continue;
                    }
                    let timeout = push.timeout();
                    self.spawn_push_timer(topic.to_string(), reference.clone(), timeout);
                    if let Some(channel) = self.channels.get_mut(topic) {
                        channel.pending.insert(reference, push);
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Buffered push send failed");
                    push.resolve(PushStatus::ConnectionLost);
                }
            }
        }
    }

    fn complete_leave(&mut self, topic: &str, status: PushStatus) {
        if let Some(push) = self
            .channels
            .get_mut(topic)
            .and_then(|channel| channel.leave_push.as_mut())
        {
            push.resolve(status);
        }
        self.remove_channel(topic);
        info!(topic = %topic, "Channel left");
    }

    fn remove_channel(&mut self, topic: &str) {
        if self.channels.remove(topic).is_some() {
            debug!(topic = %topic, "Channel removed");
        }
    }

    fn handle_event(&mut self, envelope: Envelope) {
        let topic = envelope.topic.clone();
        if topic == CONTROL_TOPIC {
            return;
        }

        let follow_up = {
            let Some(channel) = self.channels.get_mut(&topic) else {
                debug!(topic = %topic, "Event for unknown topic");
                return;
            };

            match envelope.event.as_str() {
                events::PRESENCE_STATE => {
                    match serde_json::from_value::<PresenceState>(envelope.payload) {
                        Ok(state) => {
                            channel.presence.replace(state.clone());
                            channel.notify_presence(&PresenceUpdate::Sync(state));
                        }
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "Dropping malformed presence state");
                        }
                    }
                    EventFollowUp::None
                }
                events::PRESENCE_DIFF => {
                    match serde_json::from_value::<PresenceDiff>(envelope.payload) {
                        Ok(diff) => {
                            channel.presence.apply(&diff);
                            channel.notify_presence(&PresenceUpdate::Diff(diff));
                        }
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "Dropping malformed presence diff");
                        }
                    }
                    EventFollowUp::None
                }
                events::CLOSE => {
                    debug!(topic = %topic, "Server closed channel");
                    channel.dispatch(events::CLOSE, &envelope.payload);
                    channel.resolve_outstanding(&PushStatus::Left);
                    EventFollowUp::Remove
                }
                events::ERROR => {
                    warn!(topic = %topic, "Server reported channel error");
                    channel.dispatch(events::ERROR, &envelope.payload);
                    if matches!(channel.state, ChannelState::Joining | ChannelState::Joined) {
                        channel.state = ChannelState::Errored;
                        EventFollowUp::Rejoin
                    } else {
                        EventFollowUp::None
                    }
                }
                event => {
                    channel.dispatch(event, &envelope.payload);
                    EventFollowUp::None
                }
            }
        };

        match follow_up {
            EventFollowUp::None => {}
            EventFollowUp::Remove => self.remove_channel(&topic),
            EventFollowUp::Rejoin => self.schedule_rejoin(&topic),
        }
    }

    // ── Timers ────────────────────────────────────────────────────────

    async fn handle_push_timeout(&mut self, topic: &str, reference: &str) {
        let target = {
            let Some(channel) = self.channels.get_mut(topic) else {
                return;
            };

            if channel
                .join_push
                .as_ref()
                .is_some_and(|push| push.reference() == Some(reference) && !push.is_resolved())
            {
                Some(ReplyTarget::Join)
            } else if channel
                .leave_push
                .as_ref()
                .is_some_and(|push| push.reference() == Some(reference) && !push.is_resolved())
            {
                Some(ReplyTarget::Leave)
            } else if let Some(mut push) = channel.pending.remove(reference) {
                debug!(topic = %topic, reference = %reference, "Push timed out");
                push.resolve(PushStatus::Timeout);
                None
            } else {
                None
            }
        };

        match target {
            Some(ReplyTarget::Join) => {
                debug!(topic = %topic, "Join timed out");
                self.complete_join(topic, PushStatus::Timeout).await;
            }
            Some(ReplyTarget::Leave) => {
                debug!(topic = %topic, "Leave timed out");
                self.complete_leave(topic, PushStatus::Timeout);
            }
            None => {}
        }
    }

    fn schedule_rejoin(&mut self, topic: &str) {
        if self.status != SocketStatus::Connected {
            // The reconnect flow rejoins everything itself.
            return;
        }
        let epoch = self.epoch;
        let backoff = self.config.backoff.clone();
        let Some(channel) = self.channels.get_mut(topic) else {
            return;
        };
        if channel.rejoin_scheduled || channel.state != ChannelState::Errored {
            return;
        }
        channel.rejoin_scheduled = true;
        channel.rejoin_attempts += 1;
        let delay = backoff.delay(channel.rejoin_attempts);
        debug!(topic = %topic, delay_ms = delay.as_millis() as u64, "Rejoin scheduled");

        let cmd_tx = self.cmd_tx.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(Command::Rejoin { topic, epoch });
            }
        });
    }
}

fn missing_channel(topic: &str) -> SocketError {
    SocketError::ChannelUnavailable {
        topic: topic.to_string(),
        state: ChannelState::Closed,
    }
}

fn build_url(base: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let separator = if base.contains('?') { '&' } else { '?' };
            format!("{base}{separator}token={token}")
        }
        None => base.to_string(),
    }
}

/// Join payload: channel configuration plus the auth token.
fn join_payload(config: &ChannelConfig, token: Option<&str>) -> Value {
    let mut payload = Map::new();
    payload.insert("params".to_string(), config.params.clone());
    payload.insert(
        "broadcast".to_string(),
        json!({ "ack": config.ack_broadcasts, "self": config.broadcast_self }),
    );
    if config.presence {
        payload.insert("presence".to_string(), json!({ "key": config.presence_key }));
    }
    if let Some(token) = token {
        payload.insert("token".to_string(), Value::String(token.to_string()));
    }
    Value::Object(payload)
}
