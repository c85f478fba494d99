//! Debate moderation: turn state machine, guardrails, convergence.
//!
//! A debate walks through four phases per round while the speaker rotates
//! over the participants:
//!
//! ```text
//!            advance          advance          advance
//! Propose ──────────▶ Critique ──────▶ Refine ──────▶ Conclude
//!    ▲                                                    │
//!    └──────────────── advance (round + 1) ───────────────┘
//!
//! loop detected  → jump one phase forward (capped at Conclude)
//! kill switch    → back to Propose, same round
//! stale speaker  → skip to the next participant
//! ```
//!
//! Arbitration ends the debate on convergence (after the minimum rounds),
//! at the round ceiling, on idle timeout, or once the kill switch has fired
//! more often than allowed.

pub mod consensus;
pub mod guardrails;
pub mod moderator;
pub mod runner;
pub mod session;
pub mod state;

pub use consensus::{min_pairwise_similarity, ConsensusOutcome, ConsensusProtocol};
pub use guardrails::{deadlock_summary, GuardrailConfig, GuardrailEngine, GuardrailOutcome};
pub use moderator::{DropReason, Moderator, TurnReport};
pub use runner::{DebateRunner, ModeratorCommand};
pub use session::{
    Debate, DebateEvent, DebateStatus, DebateSummary, FollowUp, Response, TransitionError,
};
pub use state::{Phase, TurnState};
