//! MCP server for the debate moderation engine
//!
//! Exposes the debate control surface as MCP tools over stdio:
//! - `start_debate`, `submit_query`, `pause_debate`, `resume_debate`, `abort_debate`
//! - `list_debates`, `get_debate`, `agent_health`
//! - `submit_response`, `heartbeat` for agent integrations
//! - `subscribe`, `unsubscribe`, `poll_events` for observing the bus
//!
//! # Usage
//!
//! ```bash
//! # Defaults, overridden by environment variables
//! debate-coordination
//!
//! # TOML config file plus CLI overrides
//! debate-coordination --config engine.toml --max-rounds 6 --oracle cosine
//!
//! # Verbose logging (stderr; stdout carries MCP traffic)
//! RUST_LOG=debate_coordination=debug debate-coordination
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use debate_coordination::events::{decode, Channel, Frame, ResponseEvent};
use debate_coordination::{
    DebateService, EngineConfig, EventBus, ObserverConnection, OracleKind, SharedDebateService,
};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use tokio::io::{stdin, stdout};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Frames buffered for `poll_events` between polls
const OBSERVER_BUFFER: usize = 1024;
/// Default number of events returned by one `poll_events` call
const DEFAULT_POLL_LIMIT: usize = 50;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file (environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Round ceiling (overrides MAX_DEBATE_ROUNDS)
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Rounds required before convergence counts (overrides MIN_DEBATE_ROUNDS)
    #[arg(long)]
    min_rounds: Option<u32>,

    /// Similarity oracle: jaccard or cosine (overrides SIMILARITY_ORACLE)
    #[arg(long)]
    oracle: Option<OracleKind>,

    /// Channels forwarded to poll_events from startup
    #[arg(long, value_delimiter = ',', default_value = "moderation,arbitration")]
    observe: Vec<Channel>,
}

// ============================================================================
// MCP Request Types
// ============================================================================

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct StartDebateRequest {
    #[schemars(description = "The question or problem the agents should debate")]
    query: String,
    #[schemars(description = "Participating agent ids, in speaking order (at least one, unique)")]
    agents: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SubmitQueryRequest {
    #[schemars(description = "Debate to inject the follow-up into")]
    debate_id: String,
    #[schemars(description = "Follow-up question for the participants")]
    query: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SubmitResponseRequest {
    #[schemars(description = "Debate the response belongs to")]
    debate_id: String,
    #[schemars(description = "Responding agent id")]
    agent_id: String,
    #[schemars(description = "Round the response is for (must be the current round)")]
    round: u32,
    #[schemars(description = "Response text")]
    content: String,
    #[schemars(description = "Self-reported confidence in [0, 1]")]
    confidence: f64,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AgentRequest {
    #[schemars(description = "Agent id")]
    agent_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ListDebatesRequest {
    #[schemars(description = "Include completed and aborted debates (default: false)")]
    include_completed: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DebateIdRequest {
    #[schemars(description = "Debate id returned by start_debate")]
    debate_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ControlRequest {
    #[schemars(description = "Debate id returned by start_debate")]
    debate_id: String,
    #[schemars(description = "Optional reason, included in the moderation signal")]
    reason: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ChannelRequest {
    #[schemars(
        description = "Channel to (un)subscribe: moderation, responses, arbitration, or a configured channel name"
    )]
    channel: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct PollEventsRequest {
    #[schemars(description = "Maximum events to return (default: 50)")]
    max: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ObservedEvent {
    channel: Channel,
    payload: serde_json::Value,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Clone)]
struct DebateServer {
    service: SharedDebateService,
    observer: Arc<ObserverConnection>,
    inbox: Arc<Mutex<mpsc::Receiver<Frame>>>,
    tool_router: ToolRouter<Self>,
}

impl DebateServer {
    fn new(
        service: SharedDebateService,
        observer: ObserverConnection,
        inbox: mpsc::Receiver<Frame>,
    ) -> Self {
        Self {
            service,
            observer: Arc::new(observer),
            inbox: Arc::new(Mutex::new(inbox)),
            tool_router: Self::tool_router(),
        }
    }

    fn resolve_channel(&self, name: &str) -> Result<Channel, String> {
        self.service
            .config()
            .channels
            .resolve(name)
            .ok_or_else(|| format!("Unknown channel '{}'", name))
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| e.to_string())
}

#[tool_router]
impl DebateServer {
    #[tool(
        description = "Start a debate between the given agents. Returns the debate id and who speaks first. Agents then publish responses (see submit_response) and heartbeats."
    )]
    async fn start_debate(
        &self,
        Parameters(req): Parameters<StartDebateRequest>,
    ) -> Result<String, String> {
        let debate = self
            .service
            .start_debate(&req.query, &req.agents)
            .map_err(|e| e.to_string())?;
        to_json(&debate.summary())
    }

    #[tool(description = "Inject a follow-up question into a running debate")]
    async fn submit_query(
        &self,
        Parameters(req): Parameters<SubmitQueryRequest>,
    ) -> Result<String, String> {
        self.service
            .submit_query(&req.debate_id, &req.query)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&serde_json::json!({ "debate_id": req.debate_id, "queued": true }))
    }

    #[tool(
        description = "Publish an agent's response on the responses channel. It is validated and moderated asynchronously; check get_debate or poll_events for the outcome."
    )]
    async fn submit_response(
        &self,
        Parameters(req): Parameters<SubmitResponseRequest>,
    ) -> Result<String, String> {
        let event = ResponseEvent::new(
            req.debate_id.clone(),
            req.agent_id,
            req.round,
            req.content,
            req.confidence,
        );
        let receivers = self
            .service
            .submit_response(event)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&serde_json::json!({ "debate_id": req.debate_id, "receivers": receivers }))
    }

    #[tool(description = "Publish a liveness heartbeat for an agent")]
    async fn heartbeat(&self, Parameters(req): Parameters<AgentRequest>) -> Result<String, String> {
        self.service
            .heartbeat(&req.agent_id)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&self.service.agent_health(&req.agent_id))
    }

    #[tool(description = "List debates, newest first. Active and paused only unless include_completed is set.")]
    async fn list_debates(
        &self,
        Parameters(req): Parameters<ListDebatesRequest>,
    ) -> Result<String, String> {
        to_json(&self.service.list_debates(req.include_completed.unwrap_or(false)))
    }

    #[tool(description = "Full snapshot of a debate: turn state, history, follow-ups, and the arbitration result once concluded")]
    async fn get_debate(
        &self,
        Parameters(req): Parameters<DebateIdRequest>,
    ) -> Result<String, String> {
        let debate = self
            .service
            .get_debate(&req.debate_id)
            .map_err(|e| e.to_string())?;
        to_json(&debate)
    }

    #[tool(description = "Pause a debate. Responses are dropped until it is resumed; state is kept.")]
    async fn pause_debate(
        &self,
        Parameters(req): Parameters<ControlRequest>,
    ) -> Result<String, String> {
        let reason = req.reason.unwrap_or_else(|| "operator request".to_string());
        self.service
            .pause_debate(&req.debate_id, &reason)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&serde_json::json!({ "debate_id": req.debate_id, "requested": "pause" }))
    }

    #[tool(description = "Resume a paused debate")]
    async fn resume_debate(
        &self,
        Parameters(req): Parameters<DebateIdRequest>,
    ) -> Result<String, String> {
        self.service
            .resume_debate(&req.debate_id)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&serde_json::json!({ "debate_id": req.debate_id, "requested": "resume" }))
    }

    #[tool(description = "Abort a debate without arbitration. Irreversible.")]
    async fn abort_debate(
        &self,
        Parameters(req): Parameters<ControlRequest>,
    ) -> Result<String, String> {
        let reason = req.reason.unwrap_or_else(|| "operator request".to_string());
        self.service
            .abort_debate(&req.debate_id, &reason)
            .await
            .map_err(|e| e.to_string())?;
        to_json(&serde_json::json!({ "debate_id": req.debate_id, "requested": "abort" }))
    }

    #[tool(description = "Liveness of an agent: alive, stale or unknown, with last heartbeat")]
    async fn agent_health(
        &self,
        Parameters(req): Parameters<AgentRequest>,
    ) -> Result<String, String> {
        to_json(&self.service.agent_health(&req.agent_id))
    }

    #[tool(description = "Forward a bus channel to poll_events")]
    async fn subscribe(
        &self,
        Parameters(req): Parameters<ChannelRequest>,
    ) -> Result<String, String> {
        let channel = self.resolve_channel(&req.channel)?;
        if !Channel::OBSERVABLE.contains(&channel) {
            return Err(format!("Channel '{}' cannot be observed", channel));
        }
        self.observer.subscribe(channel);
        to_json(&self.observer.subscriptions())
    }

    #[tool(description = "Stop forwarding a bus channel to poll_events")]
    async fn unsubscribe(
        &self,
        Parameters(req): Parameters<ChannelRequest>,
    ) -> Result<String, String> {
        let channel = self.resolve_channel(&req.channel)?;
        self.observer.unsubscribe(channel);
        to_json(&self.observer.subscriptions())
    }

    #[tool(description = "Drain buffered events from subscribed channels, oldest first")]
    async fn poll_events(
        &self,
        Parameters(req): Parameters<PollEventsRequest>,
    ) -> Result<String, String> {
        let limit = req.max.unwrap_or(DEFAULT_POLL_LIMIT).max(1);
        let mut inbox = self.inbox.lock().await;
        let mut events = Vec::new();
        while events.len() < limit {
            let Ok(frame) = inbox.try_recv() else {
                break;
            };
            match decode(&frame) {
                Ok(payload) => events.push(ObservedEvent {
                    channel: frame.channel,
                    payload: serde_json::to_value(&payload).map_err(|e| e.to_string())?,
                }),
                Err(e) => tracing::warn!(channel = %frame.channel, error = %e, "Skipping malformed frame"),
            }
        }
        to_json(&events)
    }
}

#[tool_handler]
impl ServerHandler for DebateServer {
    fn get_info(&self) -> ServerInfo {
        let instructions = "Debate moderation and arbitration engine.\n\
             1. `start_debate` with a query and agent ids → debate id and first speaker\n\
             2. Agents call `heartbeat` periodically and `submit_response` for the current round\n\
             3. Watch progress with `poll_events` (moderation and arbitration by default) or `get_debate`\n\
             4. Steer with `submit_query`, `pause_debate`, `resume_debate`, `abort_debate`\n\
             A debate ends with an arbitration result: converged, forced (round ceiling or idle timeout), \
             or deadlocked (repeated kill switches or no clear majority).";

        ServerInfo {
            instructions: Some(instructions.to_string()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("debate_coordination=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    // Defaults → file → environment → CLI, validated before anything starts
    let mut config = EngineConfig::load(args.config.as_deref())?;
    if let Some(max) = args.max_rounds {
        config.max_debate_rounds = max;
    }
    if let Some(min) = args.min_rounds {
        config.min_debate_rounds = min;
    }
    if let Some(oracle) = args.oracle {
        config.similarity_oracle = oracle;
    }
    config.validate()?;

    tracing::info!(
        min_rounds = config.min_debate_rounds,
        max_rounds = config.max_debate_rounds,
        oracle = %config.similarity_oracle,
        heartbeat_expiry_secs = config.heartbeat_expiry_secs,
        debate_timeout_secs = config.debate_timeout_secs,
        "Starting debate coordination MCP server"
    );

    let bus = EventBus::with_names(config.channels.clone()).shared();
    let oracle = config.similarity_oracle.build();
    let service = DebateService::new(config, bus.clone(), oracle).shared();
    let ingest = service.start_heartbeat_ingest()?;

    let observer_cancel = CancellationToken::new();
    let (sink, inbox) = mpsc::channel(OBSERVER_BUFFER);
    let observer =
        ObserverConnection::spawn(bus.as_ref(), sink, &args.observe, observer_cancel.clone())?;

    let server = DebateServer::new(service.clone(), observer, inbox);
    let transport = (stdin(), stdout());
    let running = server.serve(transport).await?;

    running.waiting().await?;

    tracing::info!("MCP session closed, shutting down");
    observer_cancel.cancel();
    service.shutdown();
    let _ = ingest.await;

    Ok(())
}
