//! Turn state machine: phases, speaker rotation, progress counter.
//!
//! Every transition here is a pure function of the current [`TurnState`] and
//! the participant count. The moderator decides *which* transition to apply;
//! this module only defines what each one does.

use serde::{Deserialize, Serialize};

/// Phase within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Propose,
    Critique,
    Refine,
    Conclude,
}

impl Phase {
    /// Phases in round order.
    pub const CYCLE: [Phase; 4] = [
        Phase::Propose,
        Phase::Critique,
        Phase::Refine,
        Phase::Conclude,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::Propose => 0,
            Self::Critique => 1,
            Self::Refine => 2,
            Self::Conclude => 3,
        }
    }

    /// Next phase, wrapping from conclude back to propose.
    pub fn next(self) -> Phase {
        Self::CYCLE[(self.index() + 1) % Self::CYCLE.len()]
    }

    /// Next phase, staying at conclude.
    pub fn next_capped(self) -> Phase {
        if self.is_terminal() {
            self
        } else {
            self.next()
        }
    }

    /// Whether this phase closes the round.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Conclude)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Propose => write!(f, "propose"),
            Self::Critique => write!(f, "critique"),
            Self::Refine => write!(f, "refine"),
            Self::Conclude => write!(f, "conclude"),
        }
    }
}

/// Position of a debate within its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TurnState {
    pub phase: Phase,
    /// Zero-based; never decreases.
    pub round: u32,
    /// Index into the participant list.
    pub speaker_index: usize,
    /// Turns taken since the round last wrapped.
    pub turns_since_progress: u32,
}

fn rotate(index: usize, participants: usize) -> usize {
    (index + 1) % participants.max(1)
}

impl TurnState {
    /// Start of round 0, first participant to speak.
    pub fn initial() -> Self {
        Self::default()
    }

    /// Normal turn completion. Phase moves forward; wrapping from conclude
    /// starts the next round and clears the progress counter.
    pub fn advance(self, participants: usize) -> Self {
        let phase = self.phase.next();
        let wrapped = phase == Phase::Propose;
        Self {
            phase,
            round: if wrapped { self.round + 1 } else { self.round },
            speaker_index: rotate(self.speaker_index, participants),
            turns_since_progress: if wrapped {
                0
            } else {
                self.turns_since_progress + 1
            },
        }
    }

    /// Repetition pivot: force the next phase (capped at conclude) without
    /// starting a new round.
    pub fn on_loop(self, participants: usize) -> Self {
        Self {
            phase: self.phase.next_capped(),
            round: self.round,
            speaker_index: rotate(self.speaker_index, participants),
            turns_since_progress: self.turns_since_progress + 1,
        }
    }

    /// Kill switch: back to propose within the same round.
    pub fn on_deadlock(self, participants: usize) -> Self {
        Self {
            phase: Phase::Propose,
            round: self.round,
            speaker_index: rotate(self.speaker_index, participants),
            turns_since_progress: 0,
        }
    }

    /// Pass the turn over a speaker that is not responding. No response was
    /// processed, so the progress counter is left alone.
    pub fn skip(self, participants: usize) -> Self {
        Self {
            speaker_index: rotate(self.speaker_index, participants),
            ..self
        }
    }

    pub fn detect_deadlock(&self, ceiling: u32) -> bool {
        self.turns_since_progress >= ceiling
    }
}
