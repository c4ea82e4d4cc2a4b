//! Socket and channel configuration.

use std::time::Duration;

use rand::Rng;
use ripple_protocol::WireFormat;
use serde_json::Value;

/// Reconnect backoff policy: exponential growth with a cap and randomized
/// jitter to avoid thundering-herd reconnects.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on the computed delay.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub factor: f64,
    /// Jitter as a fraction of the computed delay (0.0 disables it).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    /// Compute the delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base = self.initial.as_millis() as f64 * self.factor.powi(exponent as i32);
        let capped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Disable jitter (deterministic delays, mainly for tests).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}

/// Socket configuration.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Keepalive cadence.
    pub heartbeat_interval: Duration,
    /// Unanswered heartbeat intervals tolerated before the connection is
    /// treated as dead.
    pub heartbeat_max_missed: u32,
    /// Reply window for pushes without an explicit timeout.
    pub default_push_timeout: Duration,
    /// Reconnect backoff policy.
    pub backoff: Backoff,
    /// Envelope serialization, matching the backend.
    pub wire_format: WireFormat,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_max_missed: 2,
            default_push_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
            wire_format: WireFormat::default(),
        }
    }
}

impl SocketConfig {
    /// Set the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the tolerated number of unanswered heartbeat intervals.
    #[must_use]
    pub fn with_heartbeat_max_missed(mut self, max_missed: u32) -> Self {
        self.heartbeat_max_missed = max_missed;
        self
    }

    /// Set the default push timeout.
    #[must_use]
    pub fn with_default_push_timeout(mut self, timeout: Duration) -> Self {
        self.default_push_timeout = timeout;
        self
    }

    /// Set the reconnect backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the wire format.
    #[must_use]
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }
}

/// Per-channel configuration, carried in the join payload.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Application parameters sent with the join request.
    pub params: Value,
    /// Require server acknowledgment for broadcasts.
    pub ack_broadcasts: bool,
    /// Receive own broadcasts back from the server.
    pub broadcast_self: bool,
    /// Enable presence tracking for this channel.
    pub presence: bool,
    /// Identity used for the own presence entry.
    pub presence_key: Option<String>,
    /// Reply window override for this channel's pushes.
    pub push_timeout: Option<Duration>,
}

impl ChannelConfig {
    /// Set the join parameters.
    #[must_use]
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Require server acknowledgment for broadcasts.
    #[must_use]
    pub fn with_ack_broadcasts(mut self, ack: bool) -> Self {
        self.ack_broadcasts = ack;
        self
    }

    /// Receive own broadcasts back from the server.
    #[must_use]
    pub fn with_broadcast_self(mut self, broadcast_self: bool) -> Self {
        self.broadcast_self = broadcast_self;
        self
    }

    /// Enable presence with the given identity key.
    #[must_use]
    pub fn with_presence(mut self, key: impl Into<String>) -> Self {
        self.presence = true;
        self.presence_key = Some(key.into());
        self
    }

    /// Override the reply window for this channel's pushes.
    #[must_use]
    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = Some(timeout);
        self
    }
}
