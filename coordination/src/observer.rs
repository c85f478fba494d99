//! Observer connections: per-connection fan-out of bus traffic.
//!
//! Each connection owns one task holding a receiver on every observable
//! channel. Frames are forwarded to the connection's sink only while the
//! connection is subscribed to their channel, so subscribe/unsubscribe is a
//! set update and never touches the bus. Order is preserved per channel.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{BusResult, Channel, Frame, MessageBus};

type Subscriptions = Arc<RwLock<BTreeSet<Channel>>>;

/// A live observer connection.
pub struct ObserverConnection {
    id: String,
    subscriptions: Subscriptions,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ObserverConnection {
    /// Start the fan-out task. Frames for subscribed channels go to `sink`;
    /// the task stops when `cancel` fires or the sink is dropped.
    pub fn spawn(
        bus: &dyn MessageBus,
        sink: mpsc::Sender<Frame>,
        initial: &[Channel],
        cancel: CancellationToken,
    ) -> BusResult<Self> {
        let id = format!("observer-{}", Uuid::new_v4());
        let subscriptions: Subscriptions = Arc::new(RwLock::new(BTreeSet::new()));

        let moderation = bus.subscribe(Channel::Moderation)?;
        let responses = bus.subscribe(Channel::Responses)?;
        let arbitration = bus.subscribe(Channel::Arbitration)?;

        let task = tokio::spawn(fan_out(
            id.clone(),
            subscriptions.clone(),
            sink,
            moderation,
            responses,
            arbitration,
            cancel.clone(),
        ));

        let connection = Self {
            id,
            subscriptions,
            cancel,
            task,
        };
        for channel in initial {
            connection.subscribe(*channel);
        }
        info!(observer = %connection.id, channels = ?connection.subscriptions(), "Observer connected");
        Ok(connection)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start forwarding `channel`. Returns false if already subscribed or
    /// the channel is not observable.
    pub fn subscribe(&self, channel: Channel) -> bool {
        if !Channel::OBSERVABLE.contains(&channel) {
            return false;
        }
        let added = match self.subscriptions.write() {
            Ok(mut subs) => subs.insert(channel),
            Err(poisoned) => poisoned.into_inner().insert(channel),
        };
        if added {
            debug!(observer = %self.id, %channel, "Subscribed");
        }
        added
    }

    /// Stop forwarding `channel`. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, channel: Channel) -> bool {
        let removed = match self.subscriptions.write() {
            Ok(mut subs) => subs.remove(&channel),
            Err(poisoned) => poisoned.into_inner().remove(&channel),
        };
        if removed {
            debug!(observer = %self.id, %channel, "Unsubscribed");
        }
        removed
    }

    pub fn subscriptions(&self) -> Vec<Channel> {
        match self.subscriptions.read() {
            Ok(subs) => subs.iter().copied().collect(),
            Err(poisoned) => poisoned.into_inner().iter().copied().collect(),
        }
    }

    /// Stop the fan-out task and wait for it.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

fn is_subscribed(subscriptions: &Subscriptions, channel: Channel) -> bool {
    match subscriptions.read() {
        Ok(subs) => subs.contains(&channel),
        Err(poisoned) => poisoned.into_inner().contains(&channel),
    }
}

/// Forward one received frame. Returns false when the task should stop.
async fn relay(
    observer: &str,
    result: Result<Frame, broadcast::error::RecvError>,
    subscriptions: &Subscriptions,
    sink: &mpsc::Sender<Frame>,
) -> bool {
    match result {
        Ok(frame) => {
            if !is_subscribed(subscriptions, frame.channel) {
                return true;
            }
            sink.send(frame).await.is_ok()
        }
        Err(broadcast::error::RecvError::Lagged(n)) => {
            warn!(observer, skipped = n, "Observer lagged, some frames dropped");
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

async fn fan_out(
    id: String,
    subscriptions: Subscriptions,
    sink: mpsc::Sender<Frame>,
    mut moderation: broadcast::Receiver<Frame>,
    mut responses: broadcast::Receiver<Frame>,
    mut arbitration: broadcast::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let keep_going = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = sink.closed() => false,
            result = moderation.recv() => relay(&id, result, &subscriptions, &sink).await,
            result = responses.recv() => relay(&id, result, &subscriptions, &sink).await,
            result = arbitration.recv() => relay(&id, result, &subscriptions, &sink).await,
        };
        if !keep_going {
            break;
        }
    }
    info!(observer = %id, "Observer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{publish_payload, BusPayload, EventBus, HeartbeatEvent, ResponseEvent};
    use std::time::Duration;

    fn response(debate_id: &str) -> BusPayload {
        BusPayload::Response(ResponseEvent::new(debate_id, "claude", 0, "answer", 0.7))
    }

    async fn next(rx: &mut mpsc::Receiver<Frame>) -> Option<Frame> {
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_forwards_subscribed_channels_only() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(16);
        let observer =
            ObserverConnection::spawn(&bus, tx, &[Channel::Moderation], CancellationToken::new())
                .unwrap();

        publish_payload(&bus, &response("d-1")).await.unwrap();
        assert!(next(&mut rx).await.is_none());

        assert!(observer.subscribe(Channel::Responses));
        assert!(!observer.subscribe(Channel::Responses));
        publish_payload(&bus, &response("d-1")).await.unwrap();
        let frame = next(&mut rx).await.unwrap();
        assert_eq!(frame.channel, Channel::Responses);

        assert!(observer.unsubscribe(Channel::Responses));
        assert!(!observer.unsubscribe(Channel::Responses));
        publish_payload(&bus, &response("d-1")).await.unwrap();
        assert!(next(&mut rx).await.is_none());

        observer.close().await;
    }

    #[tokio::test]
    async fn test_heartbeat_not_observable() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(16);
        let observer = ObserverConnection::spawn(
            &bus,
            tx,
            &[Channel::Heartbeat],
            CancellationToken::new(),
        )
        .unwrap();
        assert!(observer.subscriptions().is_empty());

        publish_payload(&bus, &BusPayload::Heartbeat(HeartbeatEvent::now("claude")))
            .await
            .unwrap();
        assert!(next(&mut rx).await.is_none());
        observer.close().await;
    }

    #[tokio::test]
    async fn test_per_channel_order_preserved() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::channel(64);
        let observer =
            ObserverConnection::spawn(&bus, tx, &[Channel::Responses], CancellationToken::new())
                .unwrap();

        for i in 0..10 {
            publish_payload(&bus, &response(&format!("d-{}", i)))
                .await
                .unwrap();
        }
        for i in 0..10 {
            let frame = next(&mut rx).await.unwrap();
            assert_eq!(frame.debate_id, Some(format!("d-{}", i)));
        }
        observer.close().await;
    }

    #[tokio::test]
    async fn test_stops_when_sink_dropped() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel(1);
        let observer =
            ObserverConnection::spawn(&bus, tx, &[Channel::Moderation], CancellationToken::new())
                .unwrap();
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), observer.task)
            .await
            .unwrap()
            .unwrap();
    }
}
