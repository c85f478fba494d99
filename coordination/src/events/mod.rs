//! Bus plumbing: channels, wire payloads and the publish/subscribe transport.
//!
//! ```text
//! ┌──────────────┐  responses   ┌──────────────┐  moderation   ┌──────────────┐
//! │    Agents    │─────────────▶│  Moderator   │──────────────▶│  Observers   │
//! │              │  heartbeat   │   (task per  │  arbitration  │  (fan-out    │
//! │              │─────────────▶│    debate)   │──────────────▶│   per conn)  │
//! └──────────────┘              └──────────────┘               └──────────────┘
//! ```
//!
//! Payloads are a closed, `kind`-tagged union ([`BusPayload`]). Frames are
//! decoded and validated once at the boundary ([`decode`]); anything that
//! fails is dropped with a warning and never reaches a debate.

pub mod bus;
pub mod types;

pub use bus::{
    publish_payload, publish_with_retry, BusError, BusResult, EventBus, EventFilter,
    FilteredReceiver, MessageBus, MessageBusExt, RetryPolicy, SharedBus,
};
pub use types::{
    decode, decode_heartbeat, decode_response, BusPayload, Channel, Frame, HeartbeatEvent,
    MalformedMessage, ModerationSignal, ResponseEvent, SignalFlag,
};
