//! Last-heartbeat map and staleness checks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Liveness of one agent at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Liveness {
    Alive { age_ms: i64 },
    Stale { age_ms: i64 },
    /// Never seen a heartbeat.
    Unknown,
}

impl Liveness {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Alive { .. } => write!(f, "alive"),
            Self::Stale { .. } => write!(f, "stale"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Health report for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub liveness: Liveness,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub expiry_secs: u64,
    pub checked_at: DateTime<Utc>,
}

/// Shared reference to a LivenessMonitor
pub type SharedLiveness = Arc<LivenessMonitor>;

/// Concurrent map of agent id to latest heartbeat.
pub struct LivenessMonitor {
    beats: DashMap<String, DateTime<Utc>>,
    expiry: chrono::Duration,
    expiry_std: Duration,
}

impl LivenessMonitor {
    pub fn new(expiry: Duration) -> Self {
        Self {
            beats: DashMap::new(),
            expiry: chrono::Duration::from_std(expiry)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            expiry_std: expiry,
        }
    }

    pub fn shared(self) -> SharedLiveness {
        Arc::new(self)
    }

    /// Record a heartbeat. Older timestamps never overwrite newer ones, and
    /// timestamps ahead of the local clock are clamped to it.
    pub fn record(&self, agent_id: &str, at: DateTime<Utc>) {
        let now = Utc::now();
        if at > now {
            warn!(agent_id, %at, "Heartbeat stamped in the future, clamping to now");
        }
        let at = at.min(now);
        self.beats
            .entry(agent_id.to_string())
            .and_modify(|last| {
                if at > *last {
                    *last = at;
                }
            })
            .or_insert(at);
        debug!(agent_id, %at, "Heartbeat recorded");
    }

    /// Record `at` only for agents never seen before.
    pub fn touch_if_absent(&self, agent_id: &str, at: DateTime<Utc>) {
        self.beats
            .entry(agent_id.to_string())
            .or_insert(at.min(Utc::now()));
    }

    pub fn last_heartbeat(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.beats.get(agent_id).map(|r| *r.value())
    }

    /// Stale when `now - last > expiry`.
    pub fn status_at(&self, agent_id: &str, now: DateTime<Utc>) -> Liveness {
        match self.last_heartbeat(agent_id) {
            None => Liveness::Unknown,
            Some(last) => {
                let age = now - last;
                let age_ms = age.num_milliseconds().max(0);
                if age > self.expiry {
                    Liveness::Stale { age_ms }
                } else {
                    Liveness::Alive { age_ms }
                }
            }
        }
    }

    pub fn status(&self, agent_id: &str) -> Liveness {
        self.status_at(agent_id, Utc::now())
    }

    pub fn health(&self, agent_id: &str) -> AgentHealth {
        let now = Utc::now();
        AgentHealth {
            agent_id: agent_id.to_string(),
            liveness: self.status_at(agent_id, now),
            last_heartbeat: self.last_heartbeat(agent_id),
            expiry_secs: self.expiry_std.as_secs(),
            checked_at: now,
        }
    }

    pub fn forget(&self, agent_id: &str) {
        self.beats.remove(agent_id);
    }

    /// All tracked agent ids.
    pub fn agents(&self) -> Vec<String> {
        self.beats.iter().map(|r| r.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn monitor() -> LivenessMonitor {
        LivenessMonitor::new(Duration::from_secs(15))
    }

    #[test]
    fn test_unknown_agent() {
        assert_eq!(monitor().status("ghost"), Liveness::Unknown);
    }

    #[test]
    fn test_alive_then_stale() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.record("claude", now);
        assert!(matches!(
            monitor.status_at("claude", now + ChronoDuration::seconds(15)),
            Liveness::Alive { .. }
        ));
        assert_eq!(
            monitor.status_at("claude", now + ChronoDuration::seconds(16)),
            Liveness::Stale { age_ms: 16_000 }
        );
    }

    #[test]
    fn test_out_of_order_heartbeat_ignored() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.record("claude", now);
        monitor.record("claude", now - ChronoDuration::seconds(60));
        assert_eq!(monitor.last_heartbeat("claude"), Some(now));
    }

    #[test]
    fn test_touch_if_absent() {
        let monitor = monitor();
        let old = Utc::now() - ChronoDuration::seconds(60);
        monitor.record("claude", old);
        monitor.touch_if_absent("claude", Utc::now());
        monitor.touch_if_absent("gpt", Utc::now());
        assert_eq!(monitor.last_heartbeat("claude"), Some(old));
        assert!(monitor.status("claude").is_stale());
        assert!(!monitor.status("gpt").is_stale());
    }

    #[test]
    fn test_future_heartbeat_clamped_to_now() {
        let monitor = monitor();
        let now = Utc::now();
        monitor.record("grok", now + ChronoDuration::days(365));
        assert!(monitor.last_heartbeat("grok").unwrap() <= Utc::now());

        // One skewed heartbeat must not keep a silent agent alive
        let later = now + ChronoDuration::hours(1);
        assert!(monitor.status_at("grok", later).is_stale());

        // A later honest heartbeat still moves it forward
        let fresh = Utc::now();
        monitor.record("grok", fresh);
        assert_eq!(monitor.last_heartbeat("grok"), Some(fresh));
    }

    #[test]
    fn test_health_and_forget() {
        let monitor = monitor();
        monitor.record("claude", Utc::now());
        let health = monitor.health("claude");
        assert_eq!(health.expiry_secs, 15);
        assert!(health.last_heartbeat.is_some());
        assert_eq!(monitor.agents(), vec!["claude".to_string()]);

        monitor.forget("claude");
        assert_eq!(monitor.health("claude").liveness, Liveness::Unknown);
    }

    #[test]
    fn test_concurrent_records() {
        let monitor = Arc::new(monitor());
        let base = Utc::now();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    monitor.record("shared", base + ChronoDuration::seconds(i));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            monitor.last_heartbeat("shared"),
            Some(base + ChronoDuration::seconds(7))
        );
    }
}
