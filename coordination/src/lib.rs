//! Debate Coordination Library
//!
//! Moderates structured debates between independent reasoning agents and
//! arbitrates their outcome:
//!
//! - **Turn state machine**: propose → critique → refine → conclude per round,
//!   rotating speakers ([`debate::TurnState`])
//! - **Guardrails**: repetition (loop) detection and a no-progress kill switch
//!   ([`debate::GuardrailEngine`])
//! - **Liveness**: heartbeat tracking; stale agents have their turn skipped
//!   ([`liveness::LivenessMonitor`])
//! - **Arbitration**: similarity-weighted majority with ranked dissent
//!   ([`arbitration::ArbitrationEngine`])
//! - **Bus plumbing**: tagged payloads over injected pub/sub channels
//!   ([`events::MessageBus`])
//!
//! # Usage
//!
//! ```ignore
//! use debate_coordination::{DebateService, EngineConfig, EventBus};
//!
//! let config = EngineConfig::from_env()?;
//! let bus = EventBus::with_names(config.channels.clone()).shared();
//! let oracle = config.similarity_oracle.build();
//! let service = DebateService::new(config, bus, oracle).shared();
//! service.start_heartbeat_ingest()?;
//!
//! let debate = service.start_debate(
//!     "Should the session cache be sharded by tenant?",
//!     &["claude".into(), "gpt".into(), "grok".into()],
//! )?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod arbitration;
pub mod config;
pub mod debate;
pub mod events;
pub mod liveness;
pub mod observer;
pub mod service;
pub mod similarity;

pub use arbitration::{ArbitrationEngine, ArbitrationResult, ResultStatus};
pub use config::{ConfigError, EngineConfig};
pub use debate::{Debate, DebateStatus, Moderator, Phase};
pub use events::{Channel, EventBus, MessageBus, SharedBus};
pub use liveness::{LivenessMonitor, SharedLiveness};
pub use observer::ObserverConnection;
pub use service::{DebateService, ServiceError, SharedDebateService};
pub use similarity::{OracleKind, SharedOracle, SimilarityOracle};
