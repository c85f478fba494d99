//! Weighted arbitration over the participants' final positions.
//!
//! Each position's weight is its self-reported confidence scaled by how
//! close it sits to the other positions:
//!
//! ```text
//! weight = confidence × min(1, mean_similarity_to_others / convergence_threshold)
//! ```
//!
//! The heaviest position is the majority. Positions within
//! `confidence_threshold` of its weight fold in as supporters; lighter ones
//! that still disagree with it (similarity below `consensus_threshold`)
//! become dissent. When even the heaviest weight is below
//! `confidence_threshold` there is no usable majority, and the most
//! self-confident response is returned as a deadlocked, ambiguous result.

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::{
    ArbitrationError, ArbitrationOutcome, ArbitrationResult, ArbitrationTrigger,
    MajorityPosition, Position, ResultStatus,
};
use crate::config::EngineConfig;
use crate::debate::Response;
use crate::similarity::SimilarityOracle;

/// Decision-confidence discount for forced results.
const FORCED_DISCOUNT: f64 = 0.85;
/// Decision-confidence discount for deadlocked results.
const DEADLOCKED_DISCOUNT: f64 = 0.70;
/// Confidence margin scale once the kill switch has fired.
const DEADLOCK_CONFIDENCE_FACTOR: f64 = 0.6;
/// Consensus cutoff scale once a loop has been detected.
const LOOP_CONSENSUS_FACTOR: f64 = 2.0;

/// Configuration for arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrationConfig {
    pub confidence_threshold: f64,
    pub consensus_threshold: f64,
    pub convergence_threshold: f64,
    pub max_dissent_views: usize,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl ArbitrationConfig {
    /// Thresholds adjusted for a debate's guardrail history. After a kill
    /// switch the confidence margin shrinks so a weaker majority can still
    /// win. After a loop the consensus cutoff rises so only near-identical
    /// positions fold into the majority.
    pub fn relaxed(&self, kill_switch_resets: u32, loop_pivots: u32) -> Self {
        let mut config = self.clone();
        if kill_switch_resets > 0 {
            config.confidence_threshold *= DEADLOCK_CONFIDENCE_FACTOR;
        }
        if loop_pivots > 0 {
            config.consensus_threshold =
                (config.consensus_threshold * LOOP_CONSENSUS_FACTOR).min(1.0);
        }
        config
    }
}

impl From<&EngineConfig> for ArbitrationConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            consensus_threshold: config.consensus_threshold,
            convergence_threshold: config.convergence_threshold,
            max_dissent_views: config.max_dissent_views,
        }
    }
}

/// A position with its computed weight.
#[derive(Debug, Clone)]
struct Weighted<'a> {
    response: &'a Response,
    weight: f64,
}

/// Ordering for majority selection: weight, then confidence, then the
/// earlier response.
fn rank(a: &Weighted<'_>, b: &Weighted<'_>) -> Ordering {
    a.weight
        .total_cmp(&b.weight)
        .then(a.response.confidence.total_cmp(&b.response.confidence))
        .then(b.response.timestamp.cmp(&a.response.timestamp))
}

fn discount(status: ResultStatus) -> f64 {
    match status {
        ResultStatus::Converged => 1.0,
        ResultStatus::Forced => FORCED_DISCOUNT,
        ResultStatus::Deadlocked => DEADLOCKED_DISCOUNT,
    }
}

/// Stateless arbitration over a set of positions.
pub struct ArbitrationEngine {
    config: ArbitrationConfig,
}

impl ArbitrationEngine {
    pub fn new(config: ArbitrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    /// Weight of each position, in input order.
    pub fn weights(&self, positions: &[Response], oracle: &dyn SimilarityOracle) -> Vec<f64> {
        let n = positions.len();
        positions
            .iter()
            .enumerate()
            .map(|(i, position)| {
                if n < 2 {
                    return position.confidence;
                }
                let total: f64 = positions
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, other)| oracle.similarity(&position.content, &other.content))
                    .sum();
                let mean = total / (n - 1) as f64;
                let factor = if self.config.convergence_threshold > 0.0 {
                    (mean / self.config.convergence_threshold).min(1.0)
                } else {
                    1.0
                };
                position.confidence * factor
            })
            .collect()
    }

    /// Arbitrate the final positions of a debate (one per agent).
    pub fn arbitrate(
        &self,
        debate_id: &str,
        round: u32,
        positions: &[Response],
        trigger: ArbitrationTrigger,
        oracle: &dyn SimilarityOracle,
    ) -> ArbitrationOutcome<ArbitrationResult> {
        if positions.is_empty() {
            return Err(ArbitrationError::NoPositions);
        }

        let weighted: Vec<Weighted<'_>> = positions
            .iter()
            .zip(self.weights(positions, oracle))
            .map(|(response, weight)| Weighted { response, weight })
            .collect();

        let Some(best) = weighted.iter().max_by(|a, b| rank(a, b)) else {
            return Err(ArbitrationError::NoPositions);
        };

        if best.weight < self.config.confidence_threshold {
            return Ok(self.ambiguous(debate_id, round, &weighted, trigger));
        }

        let mut supporters = Vec::new();
        let mut concurring = Vec::new();
        let mut supporter_weights = vec![best.weight];
        let mut dissent: Vec<&Weighted<'_>> = Vec::new();

        for other in &weighted {
            if std::ptr::eq(other, best) {
                continue;
            }
            if best.weight - other.weight <= self.config.confidence_threshold {
                supporters.push(other.response.agent_id.clone());
                supporter_weights.push(other.weight);
                continue;
            }
            let similarity = oracle.similarity(&best.response.content, &other.response.content);
            if similarity < self.config.consensus_threshold {
                dissent.push(other);
            } else {
                concurring.push(other.response.agent_id.clone());
            }
        }

        dissent.sort_by(|a, b| rank(b, a));
        dissent.truncate(self.config.max_dissent_views);

        let status = trigger.status();
        let aggregated = supporter_weights.iter().sum::<f64>() / supporter_weights.len() as f64;

        debug!(
            debate_id,
            majority = %best.response.agent_id,
            weight = best.weight,
            supporters = supporters.len(),
            dissent = dissent.len(),
            "Arbitration complete"
        );

        Ok(ArbitrationResult {
            debate_id: debate_id.to_string(),
            round,
            status,
            trigger,
            majority: MajorityPosition {
                agent_id: best.response.agent_id.clone(),
                content: best.response.content.clone(),
                confidence: aggregated,
                supporters,
                concurring,
            },
            dissent: dissent
                .into_iter()
                .map(|w| Position {
                    agent_id: w.response.agent_id.clone(),
                    content: w.response.content.clone(),
                    confidence: w.weight,
                })
                .collect(),
            decision_confidence: best.weight * discount(status),
            ambiguous: false,
            timestamp: Utc::now(),
        })
    }

    /// Fallback when no position clears the confidence threshold.
    fn ambiguous(
        &self,
        debate_id: &str,
        round: u32,
        weighted: &[Weighted<'_>],
        trigger: ArbitrationTrigger,
    ) -> ArbitrationResult {
        // Non-empty by construction; ranked by self-confidence alone
        let fallback = weighted
            .iter()
            .max_by(|a, b| {
                a.response
                    .confidence
                    .total_cmp(&b.response.confidence)
                    .then(b.response.timestamp.cmp(&a.response.timestamp))
            })
            .unwrap_or(&weighted[0]);

        warn!(
            debate_id,
            %trigger,
            fallback = %fallback.response.agent_id,
            weight = fallback.weight,
            "No position cleared the confidence threshold, falling back"
        );

        ArbitrationResult {
            debate_id: debate_id.to_string(),
            round,
            status: ResultStatus::Deadlocked,
            trigger,
            majority: MajorityPosition {
                agent_id: fallback.response.agent_id.clone(),
                content: fallback.response.content.clone(),
                confidence: fallback.weight,
                supporters: Vec::new(),
                concurring: Vec::new(),
            },
            dissent: Vec::new(),
            decision_confidence: fallback.weight * DEADLOCKED_DISCOUNT,
            ambiguous: true,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::Phase;
    use crate::similarity::JaccardOracle;
    use chrono::Duration;
    use std::collections::HashMap;

    /// Oracle returning fixed similarities by content pair.
    struct TableOracle(HashMap<(String, String), f64>);

    impl TableOracle {
        fn new(entries: &[(&str, &str, f64)]) -> Self {
            let mut table = HashMap::new();
            for (a, b, s) in entries {
                table.insert((a.to_string(), b.to_string()), *s);
                table.insert((b.to_string(), a.to_string()), *s);
            }
            Self(table)
        }
    }

    impl SimilarityOracle for TableOracle {
        fn similarity(&self, a: &str, b: &str) -> f64 {
            if a == b {
                return 1.0;
            }
            self.0
                .get(&(a.to_string(), b.to_string()))
                .copied()
                .unwrap_or(0.0)
        }

        fn name(&self) -> &'static str {
            "table"
        }
    }

    fn position(agent: &str, content: &str, confidence: f64, offset_ms: i64) -> Response {
        Response {
            agent_id: agent.into(),
            debate_id: "d-1".into(),
            round: 2,
            phase: Phase::Conclude,
            content: content.into(),
            confidence,
            timestamp: Utc::now() + Duration::milliseconds(offset_ms),
        }
    }

    fn engine() -> ArbitrationEngine {
        ArbitrationEngine::new(ArbitrationConfig::default())
    }

    #[test]
    fn test_no_positions() {
        let err = engine()
            .arbitrate("d-1", 0, &[], ArbitrationTrigger::MaxRounds, &JaccardOracle)
            .unwrap_err();
        assert_eq!(err, ArbitrationError::NoPositions);
    }

    #[test]
    fn test_single_position_keeps_confidence() {
        let positions = [position("solo", "answer", 0.6, 0)];
        let result = engine()
            .arbitrate("d-1", 4, &positions, ArbitrationTrigger::MaxRounds, &JaccardOracle)
            .unwrap();
        assert_eq!(result.status, ResultStatus::Forced);
        assert_eq!(result.majority.agent_id, "solo");
        assert!((result.majority.confidence - 0.6).abs() < 1e-9);
        assert!((result.decision_confidence - 0.6 * 0.85).abs() < 1e-9);
        assert!(result.dissent.is_empty());
    }

    #[test]
    fn test_converged_all_agree() {
        let oracle = TableOracle::new(&[("A", "B", 0.85), ("A", "C", 0.9), ("B", "C", 0.82)]);
        let positions = [
            position("claude", "A", 0.9, 0),
            position("gpt", "B", 0.85, 1),
            position("grok", "C", 0.2, 2),
        ];
        let result = engine()
            .arbitrate("d-1", 2, &positions, ArbitrationTrigger::Converged, &oracle)
            .unwrap();
        assert_eq!(result.status, ResultStatus::Converged);
        assert_eq!(result.majority.agent_id, "claude");
        assert_eq!(result.majority.supporters, vec!["gpt".to_string()]);
        assert_eq!(result.majority.concurring, vec!["grok".to_string()]);
        assert!(result.dissent.is_empty());
        assert!((result.majority.confidence - 0.875).abs() < 1e-9);
        assert!((result.decision_confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_isolated_position_is_scaled_down() {
        let oracle = TableOracle::new(&[("A", "B", 0.8), ("A", "C", 0.0), ("B", "C", 0.0)]);
        let positions = [
            position("a", "A", 0.8, 0),
            position("b", "B", 0.8, 1),
            position("c", "C", 0.95, 2),
        ];
        let weights = engine().weights(&positions, &oracle);
        // a, b: mean 0.4 / 0.8 = 0.5 -> 0.4; c: mean 0 -> 0
        assert!((weights[0] - 0.4).abs() < 1e-9);
        assert!((weights[1] - 0.4).abs() < 1e-9);
        assert_eq!(weights[2], 0.0);
    }

    #[test]
    fn test_dissent_ranked_and_truncated() {
        let config = ArbitrationConfig {
            max_dissent_views: 2,
            convergence_threshold: 0.0,
            ..Default::default()
        };
        let positions = [
            position("lead", "X", 0.95, 0),
            position("d1", "Y", 0.3, 1),
            position("d2", "Z", 0.6, 2),
            position("d3", "W", 0.5, 3),
        ];
        let result = ArbitrationEngine::new(config)
            .arbitrate("d-1", 4, &positions, ArbitrationTrigger::MaxRounds, &JaccardOracle)
            .unwrap();
        assert_eq!(result.majority.agent_id, "lead");
        let dissent: Vec<&str> = result.dissent.iter().map(|d| d.agent_id.as_str()).collect();
        assert_eq!(dissent, vec!["d2", "d3"]);
        for d in &result.dissent {
            assert!(d.confidence <= result.decision_confidence / 0.85 + 1e-9);
        }
    }

    #[test]
    fn test_tie_breaks_on_confidence_then_time() {
        let config = ArbitrationConfig {
            convergence_threshold: 0.0,
            ..Default::default()
        };
        let positions = [
            position("late", "X", 0.7, 10),
            position("early", "Y", 0.7, 0),
        ];
        let result = ArbitrationEngine::new(config)
            .arbitrate("d-1", 4, &positions, ArbitrationTrigger::MaxRounds, &JaccardOracle)
            .unwrap();
        assert_eq!(result.majority.agent_id, "early");
    }

    #[test]
    fn test_ambiguous_falls_back_to_most_confident() {
        // Disjoint positions: every weight collapses to zero
        let positions = [
            position("a", "alpha", 0.6, 0),
            position("b", "beta", 0.9, 1),
            position("c", "gamma", 0.3, 2),
        ];
        let result = engine()
            .arbitrate("d-1", 4, &positions, ArbitrationTrigger::MaxRounds, &JaccardOracle)
            .unwrap();
        assert!(result.ambiguous);
        assert_eq!(result.status, ResultStatus::Deadlocked);
        assert_eq!(result.trigger, ArbitrationTrigger::MaxRounds);
        assert_eq!(result.majority.agent_id, "b");
        assert!(result.dissent.is_empty());
    }

    #[test]
    fn test_deadlock_discount() {
        let positions = [position("solo", "answer", 1.0, 0)];
        let result = engine()
            .arbitrate(
                "d-1",
                1,
                &positions,
                ArbitrationTrigger::DeadlockCeiling,
                &JaccardOracle,
            )
            .unwrap();
        assert_eq!(result.status, ResultStatus::Deadlocked);
        assert!(!result.ambiguous);
        assert!((result.decision_confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_relaxed_thresholds() {
        let base = ArbitrationConfig::default();
        let same = base.relaxed(0, 0);
        assert_eq!(same.confidence_threshold, base.confidence_threshold);
        assert_eq!(same.consensus_threshold, base.consensus_threshold);

        let after_deadlock = base.relaxed(2, 0);
        assert!((after_deadlock.confidence_threshold - 0.15).abs() < 1e-9);
        assert_eq!(after_deadlock.consensus_threshold, base.consensus_threshold);

        let after_loop = base.relaxed(0, 1);
        assert_eq!(after_loop.confidence_threshold, base.confidence_threshold);
        assert_eq!(after_loop.consensus_threshold, 1.0);
    }

    #[test]
    fn test_relaxed_margin_admits_weak_majority() {
        let positions = [position("solo", "answer", 0.2, 0)];
        let strict = engine()
            .arbitrate(
                "d-1",
                3,
                &positions,
                ArbitrationTrigger::DeadlockCeiling,
                &JaccardOracle,
            )
            .unwrap();
        assert!(strict.ambiguous);

        let relaxed = ArbitrationEngine::new(engine().config().relaxed(1, 0))
            .arbitrate(
                "d-1",
                3,
                &positions,
                ArbitrationTrigger::DeadlockCeiling,
                &JaccardOracle,
            )
            .unwrap();
        assert!(!relaxed.ambiguous);
        assert_eq!(relaxed.majority.agent_id, "solo");
    }

    #[test]
    fn test_raised_consensus_turns_concurrence_into_dissent() {
        let oracle = TableOracle::new(&[("A", "B", 0.9), ("A", "C", 0.85), ("B", "C", 0.85)]);
        let positions = [
            position("claude", "A", 0.9, 0),
            position("gpt", "B", 0.8, 1),
            position("grok", "C", 0.2, 2),
        ];
        let base = engine()
            .arbitrate("d-1", 4, &positions, ArbitrationTrigger::MaxRounds, &oracle)
            .unwrap();
        assert_eq!(base.majority.concurring, vec!["grok".to_string()]);
        assert!(base.dissent.is_empty());

        let raised = ArbitrationEngine::new(engine().config().relaxed(0, 1))
            .arbitrate("d-1", 4, &positions, ArbitrationTrigger::MaxRounds, &oracle)
            .unwrap();
        assert!(raised.majority.concurring.is_empty());
        assert_eq!(raised.dissent.len(), 1);
        assert_eq!(raised.dissent[0].agent_id, "grok");
    }
}
