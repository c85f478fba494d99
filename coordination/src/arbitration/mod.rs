//! Arbitration: turning a debate's final positions into a verdict.
//!
//! Invoked by the moderator when a debate converges, hits the round ceiling,
//! idles out, or exhausts its kill-switch budget. The result carries the
//! majority position, ranked dissent and a discounted decision confidence.

pub mod engine;
pub mod types;

pub use engine::{ArbitrationConfig, ArbitrationEngine};
pub use types::{
    ArbitrationError, ArbitrationOutcome, ArbitrationResult, ArbitrationTrigger,
    MajorityPosition, Position, ResultStatus,
};
