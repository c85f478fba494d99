//! Convergence detection across participants' latest positions.

use serde::{Deserialize, Serialize};

use super::session::{Debate, Response};
use crate::config::EngineConfig;
use crate::similarity::SimilarityOracle;

/// Result of a convergence check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConsensusOutcome {
    /// Fewer than the minimum rounds have completed.
    TooEarly { rounds: u32 },
    /// Some participants have not stated a position yet.
    Incomplete { missing: Vec<String> },
    /// Every pair of positions reached the threshold.
    Converged { min_similarity: f64 },
    /// At least one pair is below the threshold.
    Divergent { min_similarity: f64 },
}

impl ConsensusOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }
}

impl std::fmt::Display for ConsensusOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooEarly { rounds } => write!(f, "too_early ({} rounds)", rounds),
            Self::Incomplete { missing } => write!(f, "incomplete (missing {})", missing.join(", ")),
            Self::Converged { min_similarity } => {
                write!(f, "converged (min similarity {:.2})", min_similarity)
            }
            Self::Divergent { min_similarity } => {
                write!(f, "divergent (min similarity {:.2})", min_similarity)
            }
        }
    }
}

/// Convergence rule: after `min_rounds`, every participant has a position
/// and all pairs are at least `convergence_threshold` similar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProtocol {
    pub convergence_threshold: f64,
    pub min_rounds: u32,
}

impl Default for ConsensusProtocol {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ConsensusProtocol {
    fn from(config: &EngineConfig) -> Self {
        Self {
            convergence_threshold: config.convergence_threshold,
            min_rounds: config.min_debate_rounds,
        }
    }
}

impl ConsensusProtocol {
    pub fn evaluate(&self, debate: &Debate, oracle: &dyn SimilarityOracle) -> ConsensusOutcome {
        if debate.round() < self.min_rounds {
            return ConsensusOutcome::TooEarly {
                rounds: debate.round(),
            };
        }

        let positions = debate.positions();
        if positions.len() < debate.participants.len() {
            let missing = debate
                .participants
                .iter()
                .filter(|agent| !positions.iter().any(|p| &p.agent_id == *agent))
                .cloned()
                .collect();
            return ConsensusOutcome::Incomplete { missing };
        }
        // A lone participant has nobody to agree with
        if positions.len() < 2 {
            return ConsensusOutcome::Incomplete {
                missing: Vec::new(),
            };
        }

        let min_similarity = min_pairwise_similarity(&positions, oracle);
        if min_similarity >= self.convergence_threshold {
            ConsensusOutcome::Converged { min_similarity }
        } else {
            ConsensusOutcome::Divergent { min_similarity }
        }
    }

    /// Early-decision rule: after `min_rounds`, with every participant
    /// holding a position, the most confident position leads the runner-up
    /// by more than `margin`. Returns that lead.
    pub fn confidence_lead(&self, debate: &Debate, margin: f64) -> Option<f64> {
        if debate.round() < self.min_rounds {
            return None;
        }
        let positions = debate.positions();
        if positions.len() < debate.participants.len() {
            return None;
        }
        let mut confidences: Vec<f64> = positions.iter().map(|p| p.confidence).collect();
        confidences.sort_by(|a, b| b.total_cmp(a));
        let [first, second, ..] = confidences.as_slice() else {
            return None;
        };
        let lead = first - second;
        (lead > margin).then_some(lead)
    }
}

/// Lowest similarity over all pairs; 1.0 for fewer than two positions.
pub fn min_pairwise_similarity(positions: &[&Response], oracle: &dyn SimilarityOracle) -> f64 {
    let mut min = 1.0_f64;
    for (i, a) in positions.iter().enumerate() {
        for b in &positions[i + 1..] {
            min = min.min(oracle.similarity(&a.content, &b.content));
        }
    }
    min
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::{DebateEvent, Phase};
    use crate::similarity::JaccardOracle;
    use chrono::Utc;

    fn debate_with(responses: &[(&str, &str)], round: u32) -> Debate {
        let scored: Vec<(&str, &str, f64)> =
            responses.iter().map(|(a, c)| (*a, *c, 0.5)).collect();
        debate_scored(&scored, round)
    }

    fn debate_scored(responses: &[(&str, &str, f64)], round: u32) -> Debate {
        let mut debate = Debate::new(
            "d-1",
            "q",
            vec!["claude".into(), "gpt".into(), "grok".into()],
        )
        .unwrap();
        debate.turn.round = round;
        for (agent, content, confidence) in responses {
            debate = debate
                .transition(&DebateEvent::ResponseRecorded(Response {
                    agent_id: agent.to_string(),
                    debate_id: "d-1".into(),
                    round,
                    phase: Phase::Propose,
                    content: content.to_string(),
                    confidence: *confidence,
                    timestamp: Utc::now(),
                }))
                .unwrap();
        }
        debate
    }

    fn protocol(min_rounds: u32) -> ConsensusProtocol {
        ConsensusProtocol {
            convergence_threshold: 0.8,
            min_rounds,
        }
    }

    #[test]
    fn test_too_early() {
        let debate = debate_with(&[("claude", "x"), ("gpt", "x"), ("grok", "x")], 1);
        let outcome = protocol(2).evaluate(&debate, &JaccardOracle);
        assert_eq!(outcome, ConsensusOutcome::TooEarly { rounds: 1 });
    }

    #[test]
    fn test_incomplete_lists_missing() {
        let debate = debate_with(&[("claude", "x"), ("grok", "x")], 2);
        let outcome = protocol(2).evaluate(&debate, &JaccardOracle);
        assert_eq!(
            outcome,
            ConsensusOutcome::Incomplete {
                missing: vec!["gpt".into()]
            }
        );
    }

    #[test]
    fn test_converged() {
        let debate = debate_with(
            &[
                ("claude", "shard by tenant"),
                ("gpt", "shard by tenant"),
                ("grok", "Shard by tenant!"),
            ],
            0,
        );
        let outcome = protocol(0).evaluate(&debate, &JaccardOracle);
        assert!(outcome.is_converged(), "{}", outcome);
    }

    #[test]
    fn test_divergent() {
        let debate = debate_with(
            &[
                ("claude", "shard by tenant"),
                ("gpt", "shard by tenant"),
                ("grok", "use a single replicated node"),
            ],
            3,
        );
        let outcome = protocol(2).evaluate(&debate, &JaccardOracle);
        assert!(matches!(outcome, ConsensusOutcome::Divergent { .. }));
    }

    #[test]
    fn test_single_participant_never_converges() {
        let mut debate = Debate::new("d-1", "q", vec!["solo".into()]).unwrap();
        debate.history.push(Response {
            agent_id: "solo".into(),
            debate_id: "d-1".into(),
            round: 0,
            phase: Phase::Propose,
            content: "answer".into(),
            confidence: 1.0,
            timestamp: Utc::now(),
        });
        assert!(!protocol(0).evaluate(&debate, &JaccardOracle).is_converged());
    }

    #[test]
    fn test_confidence_lead() {
        let debate = debate_scored(
            &[("claude", "a", 0.9), ("gpt", "b", 0.5), ("grok", "c", 0.6)],
            2,
        );
        let lead = protocol(2).confidence_lead(&debate, 0.25).unwrap();
        assert!((lead - 0.3).abs() < 1e-9);
        assert!(protocol(3).confidence_lead(&debate, 0.25).is_none());
        assert!(protocol(2).confidence_lead(&debate, 0.35).is_none());
    }

    #[test]
    fn test_confidence_lead_needs_every_position() {
        let debate = debate_scored(&[("claude", "a", 0.95), ("gpt", "b", 0.1)], 2);
        assert!(protocol(0).confidence_lead(&debate, 0.25).is_none());
    }
}
