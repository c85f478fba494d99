//! Debate snapshot and its transition function.
//!
//! A [`Debate`] is a value. [`Debate::transition`] takes the current value
//! and a [`DebateEvent`] and returns the next value, or an error when the
//! event does not apply. The moderator owns the authoritative copy and
//! applies events in arrival order; everything else sees clones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{Phase, TurnState};
use crate::arbitration::ArbitrationResult;

/// Lifecycle status of a debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStatus {
    Active,
    Paused,
    Completed,
    Aborted,
}

impl DebateStatus {
    /// Completed or aborted; no further transitions.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for DebateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// An accepted agent response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub agent_id: String,
    pub debate_id: String,
    pub round: u32,
    pub phase: Phase,
    pub content: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// A follow-up question injected mid-debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub text: String,
    pub round: u32,
    pub timestamp: DateTime<Utc>,
}

/// Everything that can happen to a debate.
#[derive(Debug, Clone, PartialEq)]
pub enum DebateEvent {
    /// Append an accepted response to history.
    ResponseRecorded(Response),
    /// Normal turn completion.
    Advanced,
    /// Repetition detected; pivot phase.
    LoopPivot,
    /// No progress; reset to propose.
    KillSwitch,
    /// Current speaker skipped for liveness.
    SpeakerSkipped,
    QueryInjected(FollowUp),
    Paused,
    Resumed,
    Completed {
        result: Option<ArbitrationResult>,
        at: DateTime<Utc>,
    },
    Aborted {
        at: DateTime<Utc>,
    },
}

impl DebateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ResponseRecorded(_) => "response_recorded",
            Self::Advanced => "advanced",
            Self::LoopPivot => "loop_pivot",
            Self::KillSwitch => "kill_switch",
            Self::SpeakerSkipped => "speaker_skipped",
            Self::QueryInjected(_) => "query_injected",
            Self::Paused => "paused",
            Self::Resumed => "resumed",
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Error for events that do not apply to the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    pub status: DebateStatus,
    pub event: &'static str,
    pub reason: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot apply {} to {} debate: {}",
            self.event, self.status, self.reason
        )
    }
}

impl std::error::Error for TransitionError {}

/// Debate snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Debate {
    pub id: String,
    pub query: String,
    pub participants: Vec<String>,
    pub status: DebateStatus,
    pub turn: TurnState,
    pub history: Vec<Response>,
    pub queries: Vec<FollowUp>,
    /// Kill-switch firings so far.
    pub kill_switch_resets: u32,
    /// Loop pivots so far.
    #[serde(default)]
    pub loop_pivots: u32,
    pub result: Option<ArbitrationResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Debate {
    /// Create an active debate at round 0, propose phase. Participants must
    /// be non-empty and unique.
    pub fn new(
        id: impl Into<String>,
        query: impl Into<String>,
        participants: Vec<String>,
    ) -> Result<Self, TransitionError> {
        let invalid = |reason: String| TransitionError {
            status: DebateStatus::Active,
            event: "create",
            reason,
        };
        if participants.is_empty() {
            return Err(invalid("at least one participant is required".to_string()));
        }
        for (i, agent) in participants.iter().enumerate() {
            if agent.trim().is_empty() {
                return Err(invalid("participant ids must not be empty".to_string()));
            }
            if participants[..i].contains(agent) {
                return Err(invalid(format!("duplicate participant '{}'", agent)));
            }
        }

        Ok(Self {
            id: id.into(),
            query: query.into(),
            participants,
            status: DebateStatus::Active,
            turn: TurnState::initial(),
            history: Vec::new(),
            queries: Vec::new(),
            kill_switch_resets: 0,
            loop_pivots: 0,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        })
    }

    pub fn round(&self) -> u32 {
        self.turn.round
    }

    pub fn phase(&self) -> Phase {
        self.turn.phase
    }

    /// Agent whose turn it is.
    pub fn current_speaker(&self) -> &str {
        self.participants
            .get(self.turn.speaker_index)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_participant(&self, agent_id: &str) -> bool {
        self.participants.iter().any(|p| p == agent_id)
    }

    /// Latest response per participant, in participant order. Agents that
    /// never answered are absent.
    pub fn positions(&self) -> Vec<&Response> {
        self.participants
            .iter()
            .filter_map(|agent| self.history.iter().rev().find(|r| &r.agent_id == agent))
            .collect()
    }

    /// Apply an event, producing the next snapshot.
    pub fn transition(&self, event: &DebateEvent) -> Result<Debate, TransitionError> {
        let reject = |reason: &str| TransitionError {
            status: self.status,
            event: event.name(),
            reason: reason.to_string(),
        };
        if self.status.is_finished() {
            return Err(reject("debate is finished"));
        }

        let n = self.participants.len();
        let mut next = self.clone();
        match event {
            DebateEvent::ResponseRecorded(response) => {
                if self.status != DebateStatus::Active {
                    return Err(reject("debate is not active"));
                }
                if response.debate_id != self.id {
                    return Err(reject("response belongs to another debate"));
                }
                if !self.is_participant(&response.agent_id) {
                    return Err(reject("agent is not a participant"));
                }
                if response.round != self.round() {
                    return Err(reject("response is not for the current round"));
                }
                if !(0.0..=1.0).contains(&response.confidence) {
                    return Err(reject("confidence must be within [0, 1]"));
                }
                if response.content.trim().is_empty() {
                    return Err(reject("response content is empty"));
                }
                next.history.push(response.clone());
            }
            DebateEvent::Advanced
            | DebateEvent::LoopPivot
            | DebateEvent::KillSwitch
            | DebateEvent::SpeakerSkipped => {
                if self.status != DebateStatus::Active {
                    return Err(reject("debate is not active"));
                }
                next.turn = match event {
                    DebateEvent::Advanced => self.turn.advance(n),
                    DebateEvent::LoopPivot => {
                        next.loop_pivots += 1;
                        self.turn.on_loop(n)
                    }
                    DebateEvent::KillSwitch => {
                        next.kill_switch_resets += 1;
                        self.turn.on_deadlock(n)
                    }
                    _ => self.turn.skip(n),
                };
            }
            DebateEvent::QueryInjected(follow_up) => {
                next.queries.push(follow_up.clone());
            }
            DebateEvent::Paused => {
                if self.status != DebateStatus::Active {
                    return Err(reject("only active debates can be paused"));
                }
                next.status = DebateStatus::Paused;
            }
            DebateEvent::Resumed => {
                if self.status != DebateStatus::Paused {
                    return Err(reject("only paused debates can be resumed"));
                }
                next.status = DebateStatus::Active;
            }
            DebateEvent::Completed { result, at } => {
                next.status = DebateStatus::Completed;
                next.result = result.clone();
                next.completed_at = Some(*at);
            }
            DebateEvent::Aborted { at } => {
                next.status = DebateStatus::Aborted;
                next.completed_at = Some(*at);
            }
        }
        Ok(next)
    }

    /// Compact view for listings.
    pub fn summary(&self) -> DebateSummary {
        DebateSummary {
            id: self.id.clone(),
            query: self.query.clone(),
            status: self.status,
            round: self.round(),
            phase: self.phase(),
            speaker: self.current_speaker().to_string(),
            participants: self.participants.clone(),
            responses: self.history.len(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Listing entry for a debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateSummary {
    pub id: String,
    pub query: String,
    pub status: DebateStatus,
    pub round: u32,
    pub phase: Phase,
    pub speaker: String,
    pub participants: Vec<String>,
    pub responses: usize,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
