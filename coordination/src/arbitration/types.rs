//! Arbitration inputs and outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a debate reached arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// All positions converged.
    Converged,
    /// Round ceiling or idle timeout forced a decision.
    Forced,
    /// Kill-switch ceiling reached, or no clear majority.
    Deadlocked,
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::Forced => write!(f, "forced"),
            Self::Deadlocked => write!(f, "deadlocked"),
        }
    }
}

/// What triggered arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationTrigger {
    Converged,
    /// One position's confidence clearly leads the rest.
    StrongConfidence,
    MaxRounds,
    IdleTimeout,
    DeadlockCeiling,
}

impl ArbitrationTrigger {
    pub fn status(self) -> ResultStatus {
        match self {
            Self::Converged => ResultStatus::Converged,
            Self::StrongConfidence | Self::MaxRounds | Self::IdleTimeout => ResultStatus::Forced,
            Self::DeadlockCeiling => ResultStatus::Deadlocked,
        }
    }
}

impl std::fmt::Display for ArbitrationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::StrongConfidence => write!(f, "strong_confidence"),
            Self::MaxRounds => write!(f, "max_rounds"),
            Self::IdleTimeout => write!(f, "idle_timeout"),
            Self::DeadlockCeiling => write!(f, "deadlock_ceiling"),
        }
    }
}

/// One agent's weighted position in the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub agent_id: String,
    pub content: String,
    /// Weight after similarity adjustment.
    pub confidence: f64,
}

/// The winning position and who folded into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MajorityPosition {
    pub agent_id: String,
    pub content: String,
    /// Mean weight of the majority and its supporters.
    pub confidence: f64,
    /// Agents whose weight fell within the confidence margin.
    #[serde(default)]
    pub supporters: Vec<String>,
    /// Agents below the margin whose content still agrees with the majority.
    #[serde(default)]
    pub concurring: Vec<String>,
}

/// Final verdict published on the arbitration channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrationResult {
    pub debate_id: String,
    pub round: u32,
    pub status: ResultStatus,
    pub trigger: ArbitrationTrigger,
    pub majority: MajorityPosition,
    /// Strongest minority views, heaviest first.
    pub dissent: Vec<Position>,
    /// Majority weight after the status discount.
    pub decision_confidence: f64,
    /// No position cleared the confidence threshold.
    #[serde(default)]
    pub ambiguous: bool,
    pub timestamp: DateTime<Utc>,
}

/// Error type for arbitration operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArbitrationError {
    #[error("No positions available for arbitration")]
    NoPositions,
}

/// Result type for arbitration operations
pub type ArbitrationOutcome<T> = Result<T, ArbitrationError>;
