//! Agent liveness: heartbeats in, staleness verdicts out.
//!
//! Agents publish a heartbeat every `HEARTBEAT_INTERVAL` seconds. The
//! ingestion task records them in a [`LivenessMonitor`]; the moderator asks
//! it whether the next speaker is still around before handing over the turn.
//! An agent is stale once its latest heartbeat is older than
//! `HEARTBEAT_EXPIRY`.

pub mod heartbeat;
pub mod monitor;

pub use heartbeat::{spawn_heartbeat, spawn_ingest};
pub use monitor::{AgentHealth, Liveness, LivenessMonitor, SharedLiveness};
