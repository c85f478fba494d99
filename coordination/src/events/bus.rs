//! Message bus abstraction and the in-process broadcast implementation.
//!
//! The engine only talks to a [`MessageBus`]; the broker behind it is an
//! injected handle. [`EventBus`] keeps one Tokio broadcast channel per
//! logical channel, which is enough for a single-process deployment and for
//! tests. An external broker plugs in by implementing the same trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{BusPayload, Channel, Frame};
use crate::config::ChannelNames;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(Channel),
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe transport between the moderator, agents and observers.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a frame on its channel. Returns the number of receivers that
    /// saw it (zero is not an error).
    async fn publish(&self, frame: Frame) -> BusResult<usize>;

    /// Subscribe to every frame published on `channel` from now on.
    fn subscribe(&self, channel: Channel) -> BusResult<broadcast::Receiver<Frame>>;
}

/// Shared reference to a bus
pub type SharedBus = Arc<dyn MessageBus>;

/// In-process bus: one broadcast channel per logical channel.
pub struct EventBus {
    senders: HashMap<Channel, broadcast::Sender<Frame>>,
    names: ChannelNames,
}

impl EventBus {
    /// Create a bus with default topic names
    pub fn new() -> Self {
        Self::with_names(ChannelNames::default())
    }

    /// Create a bus whose topics are logged under configured names
    pub fn with_names(names: ChannelNames) -> Self {
        Self::with_capacity(names, CHANNEL_CAPACITY)
    }

    pub fn with_capacity(names: ChannelNames, capacity: usize) -> Self {
        let senders = Channel::ALL
            .into_iter()
            .map(|channel| (channel, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self { senders, names }
    }

    /// Create a shared reference to this bus
    pub fn shared(self) -> SharedBus {
        Arc::new(self)
    }

    /// Get the number of current subscribers on a channel
    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.senders
            .get(&channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, channel: Channel) -> BusResult<&broadcast::Sender<Frame>> {
        self.senders
            .get(&channel)
            .ok_or(BusError::ChannelClosed(channel))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for EventBus {
    async fn publish(&self, frame: Frame) -> BusResult<usize> {
        let channel = frame.channel;
        let topic = self.names.name(channel);
        match self.sender(channel)?.send(frame) {
            Ok(count) => {
                debug!(topic, receivers = count, "Frame published");
                Ok(count)
            }
            Err(_) => {
                // No receivers is fine; nobody is listening yet
                debug!(topic, "Frame published (no receivers)");
                Ok(0)
            }
        }
    }

    fn subscribe(&self, channel: Channel) -> BusResult<broadcast::Receiver<Frame>> {
        Ok(self.sender(channel)?.subscribe())
    }
}

/// Encode and publish a payload on its home channel.
pub async fn publish_payload(bus: &dyn MessageBus, payload: &BusPayload) -> BusResult<usize> {
    let frame = Frame::encode(payload).map_err(|e| BusError::Encode(e.to_string()))?;
    bus.publish(frame).await
}

/// Retry schedule for publishes: `attempts` retries after the first try,
/// sleeping `base_backoff * 2^n` between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_backoff: Duration) -> Self {
        Self {
            attempts,
            base_backoff,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// Publish a payload, retrying transient failures with exponential backoff.
/// Encoding errors are returned immediately.
pub async fn publish_with_retry(
    bus: &dyn MessageBus,
    payload: &BusPayload,
    policy: RetryPolicy,
) -> BusResult<usize> {
    let frame = Frame::encode(payload).map_err(|e| BusError::Encode(e.to_string()))?;
    let mut attempt = 0;
    loop {
        match bus.publish(frame.clone()).await {
            Ok(count) => return Ok(count),
            Err(e @ BusError::Encode(_)) => return Err(e),
            Err(e) if attempt >= policy.attempts => {
                warn!(kind = payload.kind(), attempts = attempt + 1, "Publish failed: {}", e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.backoff(attempt);
                debug!(
                    kind = payload.kind(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Publish failed, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Frame filter for per-debate subscriptions
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by debate ID
    pub debate_id: Option<String>,
}

impl EventFilter {
    /// Create a new empty filter (matches all frames)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by debate ID
    pub fn debate(mut self, debate_id: &str) -> Self {
        self.debate_id = Some(debate_id.to_string());
        self
    }

    /// Frames without a routing hint pass; the decoder checks them.
    pub fn matches(&self, frame: &Frame) -> bool {
        match (&self.debate_id, &frame.debate_id) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

/// Filtered receiver that only yields matching frames
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<Frame>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<Frame>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching frame
    pub async fn recv(&mut self) -> Result<Frame, broadcast::error::RecvError> {
        loop {
            let frame = self.receiver.recv().await?;
            if self.filter.matches(&frame) {
                return Ok(frame);
            }
        }
    }
}

/// Extension trait for subscribing with filters
pub trait MessageBusExt {
    fn subscribe_filtered(&self, channel: Channel, filter: EventFilter)
        -> BusResult<FilteredReceiver>;
}

impl<B: MessageBus + ?Sized> MessageBusExt for B {
    fn subscribe_filtered(
        &self,
        channel: Channel,
        filter: EventFilter,
    ) -> BusResult<FilteredReceiver> {
        Ok(FilteredReceiver::new(self.subscribe(channel)?, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::{HeartbeatEvent, ResponseEvent};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn response(debate_id: &str) -> BusPayload {
        BusPayload::Response(ResponseEvent::new(debate_id, "claude", 0, "answer", 0.7))
    }

    /// Fails the first `failures` publishes, then delegates.
    struct FlakyBus {
        inner: EventBus,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, frame: Frame) -> BusResult<usize> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(BusError::Unavailable("connection refused".into()));
            }
            self.inner.publish(frame).await
        }

        fn subscribe(&self, channel: Channel) -> BusResult<broadcast::Receiver<Frame>> {
            self.inner.subscribe(channel)
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe_per_channel() {
        let bus = EventBus::new();
        let mut responses = bus.subscribe(Channel::Responses).unwrap();
        let mut heartbeats = bus.subscribe(Channel::Heartbeat).unwrap();

        let count = publish_payload(&bus, &response("d-1")).await.unwrap();
        assert_eq!(count, 1);

        let frame = responses.recv().await.unwrap();
        assert_eq!(frame.channel, Channel::Responses);
        assert!(heartbeats.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        let count = publish_payload(&bus, &BusPayload::Heartbeat(HeartbeatEvent::now("a")))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(Channel::Moderation), 0);
        let _rx1 = bus.subscribe(Channel::Moderation).unwrap();
        let _rx2 = bus.subscribe(Channel::Moderation).unwrap();
        assert_eq!(bus.subscriber_count(Channel::Moderation), 2);
        assert_eq!(bus.subscriber_count(Channel::Arbitration), 0);
    }

    #[tokio::test]
    async fn test_filtered_receiver_by_debate() {
        let bus = EventBus::new();
        let mut rx = bus
            .subscribe_filtered(Channel::Responses, EventFilter::new().debate("d-2"))
            .unwrap();

        publish_payload(&bus, &response("d-1")).await.unwrap();
        publish_payload(&bus, &response("d-2")).await.unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.debate_id.as_deref(), Some("d-2"));
    }

    #[test]
    fn test_filter_passes_frames_without_hint() {
        let filter = EventFilter::new().debate("d-1");
        assert!(filter.matches(&Frame::raw(Channel::Responses, "{}")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let bus = FlakyBus {
            inner: EventBus::new(),
            failures: 2,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        publish_with_retry(&bus, &response("d-1"), policy)
            .await
            .unwrap();
        assert_eq!(bus.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let bus = FlakyBus {
            inner: EventBus::new(),
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::new(2, Duration::from_millis(100));
        let err = publish_with_retry(&bus, &response("d-1"), policy)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Unavailable(_)));
        assert_eq!(bus.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        assert_eq!(policy.backoff(0), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(800));
    }
}
