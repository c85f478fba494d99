//! Moderator: the synchronous core of a running debate.
//!
//! Owns the authoritative [`Debate`] and turns inbound responses and
//! commands into transitions plus the signals/results to publish. It never
//! touches the bus itself; the runner task does that, which keeps every
//! decision here testable without a runtime.
//!
//! Per accepted response:
//!
//! ```text
//! record → signal → guardrails ─┬─ loop      → pivot phase       ─┐
//!                               ├─ deadlock  → kill switch        ├→ arbitration? ─┬─ yes → result
//!                               └─ continue  → advance            ┘                └─ no  → skip stale speakers
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::consensus::ConsensusProtocol;
use super::guardrails::{deadlock_summary, preview, GuardrailConfig, GuardrailEngine, GuardrailOutcome};
use super::session::{Debate, DebateEvent, DebateStatus, FollowUp, Response, TransitionError};
use crate::arbitration::{ArbitrationConfig, ArbitrationEngine, ArbitrationResult, ArbitrationTrigger};
use crate::config::EngineConfig;
use crate::events::{ModerationSignal, ResponseEvent, SignalFlag};
use crate::liveness::{Liveness, SharedLiveness};
use crate::similarity::SharedOracle;

/// Why a response or command was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NotActive(DebateStatus),
    WrongDebate,
    UnknownAgent,
    Duplicate,
    /// Response for a round that already closed.
    LateRound { current: u32, got: u32 },
    /// Response for a round that has not started.
    FutureRound { current: u32, got: u32 },
    Rejected(String),
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotActive(status) => write!(f, "debate is {}", status),
            Self::WrongDebate => write!(f, "response belongs to another debate"),
            Self::UnknownAgent => write!(f, "agent is not a participant"),
            Self::Duplicate => write!(f, "duplicate response"),
            Self::LateRound { current, got } => {
                write!(f, "late response for round {} (current {})", got, current)
            }
            Self::FutureRound { current, got } => {
                write!(f, "response for future round {} (current {})", got, current)
            }
            Self::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// What the moderator did with one input.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    /// The input changed the debate.
    pub accepted: bool,
    pub dropped: Option<DropReason>,
    /// Signals to publish, in order.
    pub signals: Vec<ModerationSignal>,
    /// Arbitration result to publish, if the debate just concluded.
    pub result: Option<ArbitrationResult>,
}

impl TurnReport {
    fn applied(signals: Vec<ModerationSignal>) -> Self {
        Self {
            accepted: true,
            signals,
            ..Default::default()
        }
    }

    fn dropped(reason: DropReason) -> Self {
        Self {
            dropped: Some(reason),
            ..Default::default()
        }
    }
}

impl From<TransitionError> for DropReason {
    fn from(e: TransitionError) -> Self {
        DropReason::Rejected(e.to_string())
    }
}

/// Synchronous debate moderator.
pub struct Moderator {
    debate: Debate,
    config: Arc<EngineConfig>,
    guardrails: GuardrailEngine,
    consensus: ConsensusProtocol,
    arbitration: ArbitrationEngine,
    oracle: SharedOracle,
    liveness: SharedLiveness,
    /// (round, agent, timestamp) of every accepted response.
    seen: HashSet<(u32, String, DateTime<Utc>)>,
}

impl Moderator {
    pub fn new(
        debate: Debate,
        config: Arc<EngineConfig>,
        oracle: SharedOracle,
        liveness: SharedLiveness,
    ) -> Self {
        Self {
            guardrails: GuardrailEngine::new(GuardrailConfig::from(config.as_ref()), oracle.clone()),
            consensus: ConsensusProtocol::from(config.as_ref()),
            arbitration: ArbitrationEngine::new(ArbitrationConfig::from(config.as_ref())),
            debate,
            config,
            oracle,
            liveness,
            seen: HashSet::new(),
        }
    }

    pub fn debate(&self) -> &Debate {
        &self.debate
    }

    /// Announce the debate and hand the first turn to a live participant.
    pub fn open(&mut self) -> TurnReport {
        let mut signals = vec![self.signal(
            format!(
                "Debate started: {} - {} opens with a proposal.",
                preview(&self.debate.query, 200),
                self.debate.current_speaker()
            ),
            None,
        )];
        self.assign_live_speaker(&mut signals);
        TurnReport::applied(signals)
    }

    /// Process one decoded response.
    pub fn on_response(&mut self, event: ResponseEvent) -> TurnReport {
        if let Err(reason) = self.admit(&event) {
            match reason {
                DropReason::Duplicate => {
                    debug!(debate_id = %self.debate.id, agent_id = %event.agent_id, "Duplicate response ignored")
                }
                _ => warn!(
                    debate_id = %self.debate.id,
                    agent_id = %event.agent_id,
                    round = event.round,
                    reason = %reason,
                    "Response dropped"
                ),
            }
            return TurnReport::dropped(reason);
        }

        let agent_id = event.agent_id.clone();
        let phase = self.debate.phase();
        let round_before = self.debate.round();
        let response = Response {
            agent_id: event.agent_id,
            debate_id: event.debate_id,
            round: event.round,
            phase,
            content: event.content,
            confidence: event.confidence,
            timestamp: event.timestamp,
        };
        if let Err(e) = self.apply(DebateEvent::ResponseRecorded(response)) {
            return TurnReport::dropped(e.into());
        }
        self.seen.insert((event.round, agent_id.clone(), event.timestamp));

        info!(
            debate_id = %self.debate.id,
            agent_id = %agent_id,
            round = round_before,
            phase = %phase,
            confidence = event.confidence,
            "Response accepted"
        );

        let mut signals = vec![self.signal(
            format!("{} responded in the {} phase.", agent_id, phase),
            None,
        )];

        match self.guardrails.evaluate(&self.debate) {
            GuardrailOutcome::LoopDetected { similarity } => {
                self.apply_or_log(DebateEvent::LoopPivot);
                warn!(debate_id = %self.debate.id, agent_id = %agent_id, similarity, "Loop detected");
                signals.push(self.signal(
                    format!(
                        "Loop detected (similarity {:.2}) - moving to the {} phase. {} up next.",
                        similarity,
                        self.debate.phase(),
                        self.debate.current_speaker()
                    ),
                    Some(SignalFlag::LoopDetected),
                ));
                if self.debate.loop_pivots == 1 {
                    signals.push(self.signal(
                        "Repetition observed - arbitration will demand closer agreement."
                            .to_string(),
                        Some(SignalFlag::ForcingDecision),
                    ));
                }
            }
            GuardrailOutcome::Deadlock {
                turns_since_progress,
            } => {
                let summary = deadlock_summary(&self.debate.history);
                self.apply_or_log(DebateEvent::KillSwitch);
                warn!(
                    debate_id = %self.debate.id,
                    turns_since_progress,
                    resets = self.debate.kill_switch_resets,
                    "Kill switch triggered"
                );
                signals.push(self.signal(summary, Some(SignalFlag::KillSwitch)));
                if self.debate.kill_switch_resets == 1 {
                    signals.push(self.signal(
                        "Deadlock observed - arbitration confidence margin lowered.".to_string(),
                        Some(SignalFlag::ThresholdAdjusted),
                    ));
                }
            }
            GuardrailOutcome::Continue => {
                self.apply_or_log(DebateEvent::Advanced);
                let message = if self.debate.round() > round_before {
                    format!(
                        "Round {} complete - round {} begins. {} up next.",
                        round_before,
                        self.debate.round(),
                        self.debate.current_speaker()
                    )
                } else {
                    format!("{} turn complete - next up.", agent_id)
                };
                signals.push(self.signal(message, None));
            }
        }

        let result = match self.arbitration_trigger() {
            Some(trigger) => self.conclude(trigger, &mut signals),
            None => {
                self.assign_live_speaker(&mut signals);
                None
            }
        };

        TurnReport {
            accepted: true,
            dropped: None,
            signals,
            result,
        }
    }

    /// Record a follow-up question and announce it.
    pub fn on_query(&mut self, text: &str) -> TurnReport {
        let follow_up = FollowUp {
            text: text.to_string(),
            round: self.debate.round(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.apply(DebateEvent::QueryInjected(follow_up)) {
            return TurnReport::dropped(e.into());
        }
        info!(debate_id = %self.debate.id, round = self.debate.round(), "Follow-up query injected");
        let signal = self.signal(format!("Follow-up query: {}", text), Some(SignalFlag::Query));
        TurnReport::applied(vec![signal])
    }

    pub fn pause(&mut self, reason: &str) -> TurnReport {
        if let Err(e) = self.apply(DebateEvent::Paused) {
            return TurnReport::dropped(e.into());
        }
        info!(debate_id = %self.debate.id, reason, "Debate paused");
        let signal = self.signal(format!("Debate paused: {}", reason), Some(SignalFlag::Paused));
        TurnReport::applied(vec![signal])
    }

    pub fn resume(&mut self) -> TurnReport {
        if let Err(e) = self.apply(DebateEvent::Resumed) {
            return TurnReport::dropped(e.into());
        }
        info!(debate_id = %self.debate.id, "Debate resumed");
        let mut signals = vec![self.signal(
            format!("Debate resumed. {} up next.", self.debate.current_speaker()),
            Some(SignalFlag::Resumed),
        )];
        self.assign_live_speaker(&mut signals);
        TurnReport::applied(signals)
    }

    pub fn abort(&mut self, reason: &str) -> TurnReport {
        if let Err(e) = self.apply(DebateEvent::Aborted { at: Utc::now() }) {
            return TurnReport::dropped(e.into());
        }
        info!(debate_id = %self.debate.id, reason, "Debate aborted");
        let signal = self.signal(format!("Debate aborted: {}", reason), None);
        TurnReport::applied(vec![signal])
    }

    /// No accepted response within the idle timeout: force arbitration.
    pub fn on_idle_timeout(&mut self) -> TurnReport {
        if self.debate.status != DebateStatus::Active {
            return TurnReport::dropped(DropReason::NotActive(self.debate.status));
        }
        warn!(
            debate_id = %self.debate.id,
            timeout_secs = self.config.debate_timeout_secs,
            "Debate idle, forcing arbitration"
        );
        let mut signals = vec![self.signal(
            format!(
                "No response for {}s - forcing arbitration.",
                self.config.debate_timeout_secs
            ),
            Some(SignalFlag::Timeout),
        )];
        let result = self.conclude(ArbitrationTrigger::IdleTimeout, &mut signals);
        TurnReport {
            accepted: true,
            dropped: None,
            signals,
            result,
        }
    }

    fn admit(&self, event: &ResponseEvent) -> Result<(), DropReason> {
        if self.debate.status != DebateStatus::Active {
            return Err(DropReason::NotActive(self.debate.status));
        }
        if event.debate_id != self.debate.id {
            return Err(DropReason::WrongDebate);
        }
        if !self.debate.is_participant(&event.agent_id) {
            return Err(DropReason::UnknownAgent);
        }
        let current = self.debate.round();
        if event.round < current {
            return Err(DropReason::LateRound {
                current,
                got: event.round,
            });
        }
        if event.round > current {
            return Err(DropReason::FutureRound {
                current,
                got: event.round,
            });
        }
        let key = (event.round, event.agent_id.clone(), event.timestamp);
        if self.seen.contains(&key) {
            return Err(DropReason::Duplicate);
        }
        Ok(())
    }

    fn apply(&mut self, event: DebateEvent) -> Result<(), TransitionError> {
        self.debate = self.debate.transition(&event)?;
        Ok(())
    }

    fn apply_or_log(&mut self, event: DebateEvent) {
        if let Err(e) = self.apply(event) {
            warn!(debate_id = %self.debate.id, error = %e, "Transition rejected");
        }
    }

    /// Deadlock ceiling, then round ceiling, then convergence, then a clear
    /// confidence lead.
    fn arbitration_trigger(&self) -> Option<ArbitrationTrigger> {
        if self.debate.kill_switch_resets > self.config.max_deadlock_resets {
            return Some(ArbitrationTrigger::DeadlockCeiling);
        }
        if self.debate.round() >= self.config.max_debate_rounds {
            return Some(ArbitrationTrigger::MaxRounds);
        }
        let outcome = self.consensus.evaluate(&self.debate, self.oracle.as_ref());
        debug!(debate_id = %self.debate.id, outcome = %outcome, "Consensus check");
        if outcome.is_converged() {
            return Some(ArbitrationTrigger::Converged);
        }
        self.consensus
            .confidence_lead(&self.debate, self.config.confidence_threshold)
            .map(|lead| {
                debug!(debate_id = %self.debate.id, lead, "Confidence lead");
                ArbitrationTrigger::StrongConfidence
            })
    }

    fn conclude(
        &mut self,
        trigger: ArbitrationTrigger,
        signals: &mut Vec<ModerationSignal>,
    ) -> Option<ArbitrationResult> {
        if trigger == ArbitrationTrigger::StrongConfidence {
            signals.push(self.signal(
                format!(
                    "Strong confidence differential in round {} - concluding early.",
                    self.debate.round()
                ),
                Some(SignalFlag::StrongConfidence),
            ));
        }
        let positions: Vec<Response> = self.debate.positions().into_iter().cloned().collect();
        let engine = ArbitrationEngine::new(
            self.arbitration
                .config()
                .relaxed(self.debate.kill_switch_resets, self.debate.loop_pivots),
        );
        let result = match engine.arbitrate(
            &self.debate.id,
            self.debate.round(),
            &positions,
            trigger,
            self.oracle.as_ref(),
        ) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(debate_id = %self.debate.id, %trigger, error = %e, "Arbitration produced no result");
                None
            }
        };

        self.apply_or_log(DebateEvent::Completed {
            result: result.clone(),
            at: Utc::now(),
        });

        let message = match &result {
            Some(r) => {
                info!(
                    debate_id = %self.debate.id,
                    %trigger,
                    status = %r.status,
                    majority = %r.majority.agent_id,
                    decision_confidence = r.decision_confidence,
                    dissent = r.dissent.len(),
                    "Debate concluded"
                );
                format!(
                    "Debate concluded ({}): {} holds the majority.",
                    r.status, r.majority.agent_id
                )
            }
            None => {
                info!(debate_id = %self.debate.id, %trigger, "Debate concluded without positions");
                "Debate concluded without any positions.".to_string()
            }
        };
        signals.push(self.signal(message, None));
        result
    }

    /// Skip over stale speakers until a live one holds the turn. Each skip
    /// is announced. Gives up after one full rotation.
    fn assign_live_speaker(&mut self, signals: &mut Vec<ModerationSignal>) {
        let now = Utc::now();
        for _ in 0..self.debate.participants.len() {
            let speaker = self.debate.current_speaker().to_string();
            let Liveness::Stale { age_ms } = self.liveness.status_at(&speaker, now) else {
                return;
            };
            warn!(debate_id = %self.debate.id, agent_id = %speaker, age_ms, "Skipping stale agent");
            self.apply_or_log(DebateEvent::SpeakerSkipped);
            signals.push(self.signal(
                format!(
                    "{} is unresponsive (last heartbeat {}s ago) - turn skipped. {} up next.",
                    speaker,
                    age_ms / 1000,
                    self.debate.current_speaker()
                ),
                Some(SignalFlag::AgentStale),
            ));
        }
        warn!(debate_id = %self.debate.id, "No live participants");
        signals.push(self.signal(
            "No live participants - waiting for heartbeats.".to_string(),
            Some(SignalFlag::AgentStale),
        ));
    }

    fn signal(&self, message: String, flag: Option<SignalFlag>) -> ModerationSignal {
        ModerationSignal {
            timestamp: Utc::now(),
            debate_id: self.debate.id.clone(),
            round: self.debate.round(),
            phase: self.debate.phase(),
            speaker: self.debate.current_speaker().to_string(),
            message,
            flag,
        }
    }
}
