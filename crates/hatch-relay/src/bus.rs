//! ---
//! hatch_section: "02-messaging-data-model"
//! hatch_subsection: "module"
//! hatch_type: "source"
//! hatch_scope: "code"
//! hatch_description: "Typed multi-channel event relay."
//! hatch_version: "v0.0.0-prealpha"
//! hatch_owner: "tbd"
//! ---
use std::sync::Arc;

use strum::IntoEnumIterator;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, LogLevel};
use crate::event::{LogData, LogEvent, RelayEvent};
use crate::metrics::RelayMetricsExporter;
use crate::{RelayError, Result};

/// Upper bound for a per-channel buffer.
pub const MAX_CHANNEL_CAPACITY: usize = 65_536;

/// Cloneable publishing handle with one bounded buffer per channel.
///
/// Publishing never waits: when a subscriber falls `capacity` events behind,
/// the oldest undelivered events are overwritten and the subscriber is told
/// how many it missed.
#[derive(Clone)]
pub struct EventRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    senders: [broadcast::Sender<LogEvent>; Channel::COUNT],
    capacity: usize,
    metrics: Option<RelayMetricsExporter>,
}

impl EventRelay {
    /// Create a relay whose channels each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::build(capacity, None)
    }

    /// Create a relay that reports publishes and drops to Prometheus.
    pub fn with_metrics(capacity: usize, metrics: RelayMetricsExporter) -> Result<Self> {
        Self::build(capacity, Some(metrics))
    }

    fn build(capacity: usize, metrics: Option<RelayMetricsExporter>) -> Result<Self> {
        if capacity == 0 || capacity > MAX_CHANNEL_CAPACITY {
            return Err(RelayError::InvalidCapacity(capacity));
        }
        let senders = std::array::from_fn(|_| broadcast::channel(capacity).0);
        Ok(Self {
            inner: Arc::new(RelayInner {
                senders,
                capacity,
                metrics,
            }),
        })
    }

    /// Publish an event to every current subscriber of its channel.
    pub fn publish(&self, level: LogLevel, event: RelayEvent) {
        let envelope = LogEvent::new(level, event);
        mirror_to_tracing(&envelope);
        let channel = envelope.channel;
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_published(channel);
        }
        // No subscribers is not an error for a fire-and-forget relay.
        let _ = self.inner.senders[channel.index()].send(envelope);
    }

    /// Publish a plain log line on `channel`.
    pub fn log(&self, channel: Channel, level: LogLevel, data: impl Into<LogData>) {
        self.publish(level, RelayEvent::log(channel, data));
    }

    /// Log on `channel` at `trace` level.
    pub fn trace(&self, channel: Channel, data: impl Into<LogData>) {
        self.log(channel, LogLevel::Trace, data);
    }

    /// Log on `channel` at `debug` level.
    pub fn debug(&self, channel: Channel, data: impl Into<LogData>) {
        self.log(channel, LogLevel::Debug, data);
    }

    /// Log on `channel` at `info` level.
    pub fn info(&self, channel: Channel, data: impl Into<LogData>) {
        self.log(channel, LogLevel::Info, data);
    }

    /// Log on `channel` at `warn` level.
    pub fn warn(&self, channel: Channel, data: impl Into<LogData>) {
        self.log(channel, LogLevel::Warn, data);
    }

    /// Log on `channel` at `error` level.
    pub fn error(&self, channel: Channel, data: impl Into<LogData>) {
        self.log(channel, LogLevel::Error, data);
    }

    /// Subscribe to events published on `channel` from now on.
    pub fn subscribe(&self, channel: Channel) -> Subscription {
        Subscription {
            channel,
            receiver: self.inner.senders[channel.index()].subscribe(),
            dropped: 0,
            metrics: self.inner.metrics.clone(),
        }
    }

    /// One subscription per channel.
    pub fn subscribe_all(&self) -> Vec<Subscription> {
        Channel::iter().map(|channel| self.subscribe(channel)).collect()
    }
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRelay")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

fn mirror_to_tracing(event: &LogEvent) {
    let channel = event.channel.as_ref();
    let relay = event.event.topic();
    let msg = event.msg();
    match event.level {
        LogLevel::Trace => trace!(channel, relay, "{msg}"),
        LogLevel::Debug => debug!(channel, relay, "{msg}"),
        LogLevel::Info => info!(channel, relay, "{msg}"),
        LogLevel::Warn => warn!(channel, relay, "{msg}"),
        LogLevel::Error => error!(channel, relay, "{msg}"),
    }
}

/// Receiving side of one channel.
pub struct Subscription {
    channel: Channel,
    receiver: broadcast::Receiver<LogEvent>,
    dropped: u64,
    metrics: Option<RelayMetricsExporter>,
}

impl Subscription {
    /// Channel this subscription listens on.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Total events this subscriber lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Wait for the next event. Returns `None` once every relay handle is gone.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => self.record_lag(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn record_lag(&mut self, skipped: u64) {
        self.dropped += skipped;
        if let Some(metrics) = &self.metrics {
            metrics.observe_dropped(self.channel, skipped);
        }
        debug!(channel = %self.channel, skipped, "relay subscriber lagged; oldest events dropped");
    }
}
