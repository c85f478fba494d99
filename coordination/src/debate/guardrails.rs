//! Loop and deadlock guardrails.

use serde::{Deserialize, Serialize};

use super::session::{Debate, Response};
use super::state::TurnState;
use crate::config::EngineConfig;
use crate::similarity::SharedOracle;

/// Responses quoted in a kill-switch summary.
const SUMMARY_WINDOW: usize = 3;

/// What the guardrails decided after a recorded response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GuardrailOutcome {
    /// Proceed with a normal advance.
    Continue,
    /// The two latest responses repeat each other.
    LoopDetected { similarity: f64 },
    /// Too many turns without progress.
    Deadlock { turns_since_progress: u32 },
}

impl std::fmt::Display for GuardrailOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::LoopDetected { similarity } => {
                write!(f, "loop_detected (similarity {:.2})", similarity)
            }
            Self::Deadlock {
                turns_since_progress,
            } => write!(f, "deadlock ({} turns)", turns_since_progress),
        }
    }
}

/// Configuration for debate guardrails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailConfig {
    /// Similarity above which consecutive responses are a loop.
    pub repetition_threshold: f64,
    /// Turns without progress that trip the kill switch.
    pub deadlock_turn_ceiling: u32,
    pub deadlock_detection: bool,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for GuardrailConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            repetition_threshold: config.repetition_threshold,
            deadlock_turn_ceiling: config.deadlock_turn_ceiling,
            deadlock_detection: config.enable_deadlock_detection,
        }
    }
}

/// Evaluates guardrails against a debate snapshot.
pub struct GuardrailEngine {
    config: GuardrailConfig,
    oracle: SharedOracle,
}

impl GuardrailEngine {
    pub fn new(config: GuardrailConfig, oracle: SharedOracle) -> Self {
        Self { config, oracle }
    }

    /// Similarity of the two most recent responses when it exceeds the
    /// repetition threshold.
    pub fn detect_loop(&self, history: &[Response]) -> Option<f64> {
        let [.., previous, latest] = history else {
            return None;
        };
        let similarity = self.oracle.similarity(&previous.content, &latest.content);
        (similarity > self.config.repetition_threshold).then_some(similarity)
    }

    pub fn detect_deadlock(&self, turn: &TurnState) -> bool {
        self.config.deadlock_detection && turn.detect_deadlock(self.config.deadlock_turn_ceiling)
    }

    /// Check the debate right after a response was recorded.
    ///
    /// Loops win over deadlocks. A turn taken in the conclude phase closes
    /// the round, so it is never treated as a stall.
    pub fn evaluate(&self, debate: &Debate) -> GuardrailOutcome {
        if let Some(similarity) = self.detect_loop(&debate.history) {
            return GuardrailOutcome::LoopDetected { similarity };
        }
        if !debate.phase().is_terminal() && self.detect_deadlock(&debate.turn) {
            return GuardrailOutcome::Deadlock {
                turns_since_progress: debate.turn.turns_since_progress,
            };
        }
        GuardrailOutcome::Continue
    }
}

/// Announcement for a kill switch: the last few responses, oldest first.
pub fn deadlock_summary(history: &[Response]) -> String {
    let start = history.len().saturating_sub(SUMMARY_WINDOW);
    let recent: Vec<String> = history[start..]
        .iter()
        .map(|r| format!("{}: {}", r.agent_id, preview(&r.content, 120)))
        .collect();
    format!("Deadlock detected. Summary: {}", recent.join(" | "))
}

/// First `max` characters of `text`, with an ellipsis when cut.
pub(crate) fn preview(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::Phase;
    use crate::similarity::{JaccardOracle, OracleKind};
    use chrono::Utc;
    use std::sync::Arc;

    fn response(agent: &str, content: &str) -> Response {
        Response {
            agent_id: agent.into(),
            debate_id: "d-1".into(),
            round: 0,
            phase: Phase::Propose,
            content: content.into(),
            confidence: 0.5,
            timestamp: Utc::now(),
        }
    }

    fn engine() -> GuardrailEngine {
        GuardrailEngine::new(GuardrailConfig::default(), OracleKind::Jaccard.build())
    }

    #[test]
    fn test_loop_needs_two_responses() {
        let engine = engine();
        assert_eq!(engine.detect_loop(&[]), None);
        assert_eq!(engine.detect_loop(&[response("a", "same words")]), None);
    }

    #[test]
    fn test_loop_on_identical_responses() {
        let engine = engine();
        let history = [response("a", "shard by tenant"), response("b", "Shard by tenant.")];
        assert_eq!(engine.detect_loop(&history), Some(1.0));
    }

    #[test]
    fn test_loop_symmetric() {
        let engine = engine();
        let a = response("a", "shard the cache by tenant id");
        let b = response("b", "shard the cache by tenant id");
        let forward = engine.detect_loop(&[a.clone(), b.clone()]);
        let backward = engine.detect_loop(&[b, a]);
        assert_eq!(forward, backward);
        assert!(forward.is_some());
    }

    #[test]
    fn test_loop_threshold_is_strict() {
        let config = GuardrailConfig {
            repetition_threshold: 0.5,
            ..Default::default()
        };
        let engine = GuardrailEngine::new(config, Arc::new(JaccardOracle));
        // {a, b, c} vs {b, c, d} = 0.5, not above 0.5
        let history = [response("x", "a b c"), response("y", "b c d")];
        assert_eq!(engine.detect_loop(&history), None);
    }

    #[test]
    fn test_only_latest_pair_counts() {
        let engine = engine();
        let history = [
            response("a", "same answer"),
            response("b", "same answer"),
            response("c", "something else entirely"),
        ];
        assert_eq!(engine.detect_loop(&history), None);
    }

    #[test]
    fn test_deadlock_respects_flag() {
        let turn = TurnState {
            turns_since_progress: 3,
            ..TurnState::initial()
        };
        assert!(engine().detect_deadlock(&turn));

        let disabled = GuardrailEngine::new(
            GuardrailConfig {
                deadlock_detection: false,
                ..Default::default()
            },
            OracleKind::Jaccard.build(),
        );
        assert!(!disabled.detect_deadlock(&turn));
    }

    #[test]
    fn test_evaluate_exempts_conclude() {
        let mut debate =
            Debate::new("d-1", "q", vec!["a".into(), "b".into()]).unwrap();
        debate.history.push(response("a", "alpha"));
        debate.turn = TurnState {
            phase: Phase::Conclude,
            round: 0,
            speaker_index: 1,
            turns_since_progress: 3,
        };
        assert_eq!(engine().evaluate(&debate), GuardrailOutcome::Continue);

        debate.turn.phase = Phase::Refine;
        assert_eq!(
            engine().evaluate(&debate),
            GuardrailOutcome::Deadlock {
                turns_since_progress: 3
            }
        );
    }

    #[test]
    fn test_deadlock_summary_last_three() {
        let history = [
            response("a", "one"),
            response("b", "two"),
            response("c", "three"),
            response("a", "four"),
        ];
        let summary = deadlock_summary(&history);
        assert_eq!(
            summary,
            "Deadlock detected. Summary: b: two | c: three | a: four"
        );
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("short", 10), "short");
    }
}
