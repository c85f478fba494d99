//! Heartbeat emission and ingestion tasks.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::monitor::SharedLiveness;
use crate::events::{
    decode_heartbeat, publish_payload, BusPayload, BusResult, Channel, HeartbeatEvent, SharedBus,
};

/// Publish a heartbeat for `agent_id` every `interval` until cancelled.
///
/// Used by agent integrations running in-process. A failed publish is logged
/// and the next tick tries again; missing one beat is harmless as long as
/// the expiry spans more than one interval.
pub fn spawn_heartbeat(
    bus: SharedBus,
    agent_id: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(agent_id = %agent_id, interval_ms = interval.as_millis() as u64, "Heartbeat emitter started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(agent_id = %agent_id, "Heartbeat emitter stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let beat = BusPayload::Heartbeat(HeartbeatEvent::now(agent_id.clone()));
                    if let Err(e) = publish_payload(bus.as_ref(), &beat).await {
                        warn!(agent_id = %agent_id, error = %e, "Failed to publish heartbeat");
                    }
                }
            }
        }
    })
}

/// Feed heartbeats from the bus into the liveness monitor until cancelled.
pub fn spawn_ingest(
    bus: &SharedBus,
    liveness: SharedLiveness,
    cancel: CancellationToken,
) -> BusResult<JoinHandle<()>> {
    let mut rx = bus.subscribe(Channel::Heartbeat)?;
    Ok(tokio::spawn(async move {
        info!("Heartbeat ingestion started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => match result {
                    Ok(frame) => match decode_heartbeat(&frame) {
                        Ok(beat) => liveness.record(&beat.agent_id, beat.timestamp),
                        Err(e) => warn!(error = %e, "Dropping malformed heartbeat"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Heartbeat ingestion lagged, some heartbeats dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Heartbeat channel closed, stopping ingestion");
                        break;
                    }
                },
            }
        }
        info!("Heartbeat ingestion stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, Frame};
    use crate::liveness::{Liveness, LivenessMonitor};

    async fn wait_for<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_emitter_feeds_monitor() {
        let bus = EventBus::new().shared();
        let liveness = LivenessMonitor::new(Duration::from_secs(15)).shared();
        let cancel = CancellationToken::new();

        let ingest = spawn_ingest(&bus, liveness.clone(), cancel.clone()).unwrap();
        let emitter = spawn_heartbeat(
            bus.clone(),
            "claude".into(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        wait_for(|| matches!(liveness.status("claude"), Liveness::Alive { .. })).await;

        cancel.cancel();
        emitter.await.unwrap();
        ingest.await.unwrap();
    }

    #[tokio::test]
    async fn test_ingest_drops_malformed() {
        let bus = EventBus::new().shared();
        let liveness = LivenessMonitor::new(Duration::from_secs(15)).shared();
        let cancel = CancellationToken::new();
        let ingest = spawn_ingest(&bus, liveness.clone(), cancel.clone()).unwrap();

        bus.publish(Frame::raw(Channel::Heartbeat, "garbage"))
            .await
            .unwrap();
        publish_payload(bus.as_ref(), &BusPayload::Heartbeat(HeartbeatEvent::now("gpt")))
            .await
            .unwrap();

        wait_for(|| liveness.last_heartbeat("gpt").is_some()).await;
        assert_eq!(liveness.agents(), vec!["gpt".to_string()]);

        cancel.cancel();
        ingest.await.unwrap();
    }
}
