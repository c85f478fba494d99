//! Wire payloads carried on the bus.
//!
//! Every frame holds a JSON document tagged with `kind`. Decoding checks the
//! tag against the channel the frame arrived on and validates required
//! fields, so nothing downstream has to re-check ids or confidence ranges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arbitration::ArbitrationResult;
use crate::debate::Phase;

/// Logical bus channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Moderator signals (turn changes, loop and kill-switch notices)
    Moderation,
    /// Agent responses
    Responses,
    /// Arbitration results
    Arbitration,
    /// Agent heartbeats
    Heartbeat,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Moderation,
        Channel::Responses,
        Channel::Arbitration,
        Channel::Heartbeat,
    ];

    /// Channels an observer may subscribe to.
    pub const OBSERVABLE: [Channel; 3] =
        [Channel::Moderation, Channel::Responses, Channel::Arbitration];
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Moderation => write!(f, "moderation"),
            Channel::Responses => write!(f, "responses"),
            Channel::Arbitration => write!(f, "arbitration"),
            Channel::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "moderation" => Ok(Channel::Moderation),
            "responses" => Ok(Channel::Responses),
            "arbitration" => Ok(Channel::Arbitration),
            "heartbeat" => Ok(Channel::Heartbeat),
            other => Err(format!("unknown channel '{}'", other)),
        }
    }
}

/// One message on the bus: raw JSON plus routing hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: Channel,
    /// Routing hint for per-debate filtering. Not trusted; the decoded
    /// payload carries the authoritative id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debate_id: Option<String>,
    pub payload: String,
}

impl Frame {
    /// Serialize a payload onto its home channel.
    pub fn encode(payload: &BusPayload) -> Result<Self, serde_json::Error> {
        Ok(Self {
            channel: payload.channel(),
            debate_id: payload.debate_id().map(str::to_string),
            payload: serde_json::to_string(payload)?,
        })
    }

    /// A frame carrying arbitrary text. Used by integrations that publish
    /// pre-encoded JSON, and by tests feeding malformed input.
    pub fn raw(channel: Channel, payload: impl Into<String>) -> Self {
        Self {
            channel,
            debate_id: None,
            payload: payload.into(),
        }
    }
}

/// Closed set of payloads, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusPayload {
    Response(ResponseEvent),
    Heartbeat(HeartbeatEvent),
    Signal(ModerationSignal),
    Arbitration(ArbitrationResult),
}

impl BusPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            BusPayload::Response(_) => "response",
            BusPayload::Heartbeat(_) => "heartbeat",
            BusPayload::Signal(_) => "signal",
            BusPayload::Arbitration(_) => "arbitration",
        }
    }

    /// The only channel this payload may travel on.
    pub fn channel(&self) -> Channel {
        match self {
            BusPayload::Response(_) => Channel::Responses,
            BusPayload::Heartbeat(_) => Channel::Heartbeat,
            BusPayload::Signal(_) => Channel::Moderation,
            BusPayload::Arbitration(_) => Channel::Arbitration,
        }
    }

    pub fn debate_id(&self) -> Option<&str> {
        match self {
            BusPayload::Response(r) => Some(&r.debate_id),
            BusPayload::Heartbeat(_) => None,
            BusPayload::Signal(s) => Some(&s.debate_id),
            BusPayload::Arbitration(a) => Some(&a.debate_id),
        }
    }
}

/// An agent's contribution to a debate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub debate_id: String,
    pub agent_id: String,
    pub round: u32,
    pub content: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl ResponseEvent {
    pub fn new(
        debate_id: impl Into<String>,
        agent_id: impl Into<String>,
        round: u32,
        content: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            debate_id: debate_id.into(),
            agent_id: agent_id.into(),
            round,
            content: content.into(),
            confidence,
            timestamp: Utc::now(),
        }
    }

    fn validate(&self) -> Result<(), MalformedMessage> {
        require_id("debate_id", &self.debate_id)?;
        require_id("agent_id", &self.agent_id)?;
        if self.content.trim().is_empty() {
            return Err(MalformedMessage::InvalidField {
                field: "content",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(MalformedMessage::InvalidField {
                field: "confidence",
                reason: format!("{} is outside [0, 1]", self.confidence),
            });
        }
        Ok(())
    }
}

/// Liveness ping from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEvent {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatEvent {
    pub fn now(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Marker attached to notable moderator signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFlag {
    LoopDetected,
    KillSwitch,
    AgentStale,
    Query,
    Paused,
    Resumed,
    Timeout,
    /// Arbitration confidence margin lowered after a kill switch.
    ThresholdAdjusted,
    /// Arbitration consensus cutoff raised after a loop.
    ForcingDecision,
    StrongConfidence,
}

impl std::fmt::Display for SignalFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalFlag::LoopDetected => write!(f, "loop_detected"),
            SignalFlag::KillSwitch => write!(f, "kill_switch"),
            SignalFlag::AgentStale => write!(f, "agent_stale"),
            SignalFlag::Query => write!(f, "query"),
            SignalFlag::Paused => write!(f, "paused"),
            SignalFlag::Resumed => write!(f, "resumed"),
            SignalFlag::Timeout => write!(f, "timeout"),
            SignalFlag::ThresholdAdjusted => write!(f, "threshold_adjusted"),
            SignalFlag::ForcingDecision => write!(f, "forcing_decision"),
            SignalFlag::StrongConfidence => write!(f, "strong_confidence"),
        }
    }
}

/// Moderator announcement on the moderation channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationSignal {
    pub timestamp: DateTime<Utc>,
    pub debate_id: String,
    pub round: u32,
    pub phase: Phase,
    /// Agent whose turn it is after this signal.
    pub speaker: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<SignalFlag>,
}

/// Why an inbound frame was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Payload kind '{kind}' is not allowed on the {channel} channel")]
    WrongChannel { kind: &'static str, channel: Channel },

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

fn require_id(field: &'static str, value: &str) -> Result<(), MalformedMessage> {
    if value.trim().is_empty() {
        return Err(MalformedMessage::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Parse and validate a frame.
pub fn decode(frame: &Frame) -> Result<BusPayload, MalformedMessage> {
    let payload: BusPayload = serde_json::from_str(&frame.payload)
        .map_err(|e| MalformedMessage::InvalidJson(e.to_string()))?;

    if payload.channel() != frame.channel {
        return Err(MalformedMessage::WrongChannel {
            kind: payload.kind(),
            channel: frame.channel,
        });
    }

    match &payload {
        BusPayload::Response(response) => response.validate()?,
        BusPayload::Heartbeat(heartbeat) => require_id("agent_id", &heartbeat.agent_id)?,
        BusPayload::Signal(signal) => require_id("debate_id", &signal.debate_id)?,
        BusPayload::Arbitration(result) => require_id("debate_id", &result.debate_id)?,
    }
    Ok(payload)
}

/// Decode a frame that must carry a response.
pub fn decode_response(frame: &Frame) -> Result<ResponseEvent, MalformedMessage> {
    match decode(frame)? {
        BusPayload::Response(response) => Ok(response),
        other => Err(MalformedMessage::WrongChannel {
            kind: other.kind(),
            channel: frame.channel,
        }),
    }
}

/// Decode a frame that must carry a heartbeat.
pub fn decode_heartbeat(frame: &Frame) -> Result<HeartbeatEvent, MalformedMessage> {
    match decode(frame)? {
        BusPayload::Heartbeat(heartbeat) => Ok(heartbeat),
        other => Err(MalformedMessage::WrongChannel {
            kind: other.kind(),
            channel: frame.channel,
        }),
    }
}
