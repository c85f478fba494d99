//! Debate service: control surface over all running debates.
//!
//! Starts debates (one runner task each), routes control commands to them,
//! serves snapshots for listing and inspection, and evicts old finished
//! debates. Agent integrations can also submit responses and heartbeats
//! through it; those go over the bus like any external agent's would.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::debate::{
    Debate, DebateRunner, DebateSummary, Moderator, ModeratorCommand,
};
use crate::events::{
    publish_payload, BusError, BusPayload, Channel, EventFilter, Frame, HeartbeatEvent,
    MessageBusExt, ResponseEvent, RetryPolicy, SharedBus,
};
use crate::liveness::{spawn_ingest, AgentHealth, LivenessMonitor, SharedLiveness};
use crate::similarity::SharedOracle;

/// Queued control commands per debate.
const COMMAND_CAPACITY: usize = 32;

/// Error type for service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Debate not found: {0}")]
    DebateNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Debate {0} is no longer running")]
    NotRunning(String),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Shared reference to DebateService
pub type SharedDebateService = Arc<DebateService>;

struct DebateHandle {
    snapshot: watch::Receiver<Debate>,
    commands: mpsc::Sender<ModeratorCommand>,
    cancel: CancellationToken,
}

impl DebateHandle {
    fn current(&self) -> Debate {
        self.snapshot.borrow().clone()
    }
}

/// Registry and control surface for debates.
pub struct DebateService {
    config: Arc<EngineConfig>,
    bus: SharedBus,
    oracle: SharedOracle,
    liveness: SharedLiveness,
    debates: DashMap<String, DebateHandle>,
    cancel: CancellationToken,
}

impl DebateService {
    pub fn new(config: EngineConfig, bus: SharedBus, oracle: SharedOracle) -> Self {
        let liveness = LivenessMonitor::new(config.heartbeat_expiry()).shared();
        Self {
            config: Arc::new(config),
            bus,
            oracle,
            liveness,
            debates: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Create a shared reference to this service
    pub fn shared(self) -> SharedDebateService {
        Arc::new(self)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bus(&self) -> SharedBus {
        self.bus.clone()
    }

    pub fn liveness(&self) -> SharedLiveness {
        self.liveness.clone()
    }

    /// Start feeding bus heartbeats into the liveness monitor.
    pub fn start_heartbeat_ingest(&self) -> ServiceResult<JoinHandle<()>> {
        Ok(spawn_ingest(
            &self.bus,
            self.liveness.clone(),
            self.cancel.child_token(),
        )?)
    }

    // =========================================================================
    // Debate Lifecycle
    // =========================================================================

    /// Create a debate and start moderating it. Must be called from within
    /// a Tokio runtime.
    pub fn start_debate(&self, query: &str, agents: &[String]) -> ServiceResult<Debate> {
        if query.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "query must not be empty".to_string(),
            ));
        }
        let id = format!("debate-{}", Uuid::new_v4());
        let participants: Vec<String> = agents.iter().map(|a| a.trim().to_string()).collect();
        let debate = Debate::new(id.clone(), query.trim(), participants)
            .map_err(|e| ServiceError::InvalidRequest(e.reason))?;

        // Agents get one expiry window to show up before being skipped
        let now = Utc::now();
        for agent in &debate.participants {
            self.liveness.touch_if_absent(agent, now);
        }

        // Subscribe before spawning so no early response is missed
        let responses = self
            .bus
            .subscribe_filtered(Channel::Responses, EventFilter::new().debate(&id))?;
        let (snapshot_tx, snapshot_rx) = watch::channel(debate.clone());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let cancel = self.cancel.child_token();

        let moderator = Moderator::new(
            debate.clone(),
            self.config.clone(),
            self.oracle.clone(),
            self.liveness.clone(),
        );
        let runner = DebateRunner::new(
            moderator,
            self.bus.clone(),
            responses,
            command_rx,
            snapshot_tx,
            cancel.clone(),
            RetryPolicy::new(self.config.publish_retries, self.config.publish_backoff()),
            self.config.debate_timeout(),
        );
        tokio::spawn(runner.run());

        self.debates.insert(
            id.clone(),
            DebateHandle {
                snapshot: snapshot_rx,
                commands: command_tx,
                cancel,
            },
        );
        info!(debate_id = %id, participants = ?debate.participants, "Debate created");

        self.prune_finished();
        Ok(debate)
    }

    /// Inject a follow-up question into a running debate.
    pub async fn submit_query(&self, debate_id: &str, text: &str) -> ServiceResult<()> {
        if text.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "query must not be empty".to_string(),
            ));
        }
        self.send(debate_id, ModeratorCommand::Query(text.trim().to_string()))
            .await
    }

    pub async fn pause_debate(&self, debate_id: &str, reason: &str) -> ServiceResult<()> {
        self.send(debate_id, ModeratorCommand::Pause(reason.to_string()))
            .await
    }

    pub async fn resume_debate(&self, debate_id: &str) -> ServiceResult<()> {
        self.send(debate_id, ModeratorCommand::Resume).await
    }

    pub async fn abort_debate(&self, debate_id: &str, reason: &str) -> ServiceResult<()> {
        self.send(debate_id, ModeratorCommand::Abort(reason.to_string()))
            .await
    }

    async fn send(&self, debate_id: &str, command: ModeratorCommand) -> ServiceResult<()> {
        // Clone the sender so no map guard is held across the await
        let sender = self
            .debates
            .get(debate_id)
            .map(|h| h.commands.clone())
            .ok_or_else(|| ServiceError::DebateNotFound(debate_id.to_string()))?;
        debug!(debate_id, command = ?command, "Routing command");
        sender
            .send(command)
            .await
            .map_err(|_| ServiceError::NotRunning(debate_id.to_string()))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Debates, newest first. Finished ones only when asked for.
    pub fn list_debates(&self, include_completed: bool) -> Vec<DebateSummary> {
        let mut summaries: Vec<DebateSummary> = self
            .debates
            .iter()
            .map(|entry| entry.value().current().summary())
            .filter(|summary| include_completed || !summary.status.is_finished())
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Full snapshot of one debate.
    pub fn get_debate(&self, debate_id: &str) -> ServiceResult<Debate> {
        self.debates
            .get(debate_id)
            .map(|h| h.current())
            .ok_or_else(|| ServiceError::DebateNotFound(debate_id.to_string()))
    }

    /// Watch a debate's snapshots as they change.
    pub fn watch_debate(&self, debate_id: &str) -> ServiceResult<watch::Receiver<Debate>> {
        self.debates
            .get(debate_id)
            .map(|h| h.snapshot.clone())
            .ok_or_else(|| ServiceError::DebateNotFound(debate_id.to_string()))
    }

    pub fn agent_health(&self, agent_id: &str) -> AgentHealth {
        self.liveness.health(agent_id)
    }

    /// Raw subscription to one bus channel.
    pub fn subscribe(&self, channel: Channel) -> ServiceResult<broadcast::Receiver<Frame>> {
        Ok(self.bus.subscribe(channel)?)
    }

    // =========================================================================
    // Agent integration
    // =========================================================================

    /// Publish a response on behalf of an agent.
    pub async fn submit_response(&self, event: ResponseEvent) -> ServiceResult<usize> {
        Ok(publish_payload(self.bus.as_ref(), &BusPayload::Response(event)).await?)
    }

    /// Publish a heartbeat on behalf of an agent.
    pub async fn heartbeat(&self, agent_id: &str) -> ServiceResult<usize> {
        if agent_id.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "agent_id must not be empty".to_string(),
            ));
        }
        let beat = BusPayload::Heartbeat(HeartbeatEvent::now(agent_id.trim()));
        Ok(publish_payload(self.bus.as_ref(), &beat).await?)
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Drop the oldest finished debates beyond the retention cap.
    pub fn prune_finished(&self) -> usize {
        let mut finished: Vec<(String, chrono::DateTime<Utc>)> = self
            .debates
            .iter()
            .filter_map(|entry| {
                let debate = entry.value().snapshot.borrow();
                let is_finished = debate.status.is_finished();
                let finished_at = debate.completed_at.unwrap_or(debate.created_at);
                drop(debate);
                is_finished.then(|| (entry.key().clone(), finished_at))
            })
            .collect();

        let excess = finished.len().saturating_sub(self.config.max_history_size);
        if excess == 0 {
            return 0;
        }
        finished.sort_by(|a, b| a.1.cmp(&b.1));
        for (id, _) in finished.into_iter().take(excess) {
            self.debates.remove(&id);
            debug!(debate_id = %id, "Evicted finished debate");
        }
        info!(evicted = excess, "Pruned finished debates");
        excess
    }

    /// Cancel every debate task and background task.
    pub fn shutdown(&self) {
        let running = self
            .debates
            .iter()
            .filter(|entry| !entry.value().snapshot.borrow().status.is_finished())
            .count();
        if running > 0 {
            warn!(running, "Shutting down with debates still running");
        }
        for entry in self.debates.iter() {
            entry.value().cancel.cancel();
        }
        self.cancel.cancel();
    }
}
