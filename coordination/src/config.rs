//! Engine configuration: thresholds, round ceilings, liveness windows.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables. [`EngineConfig::validate`] runs last and rejects
//! anything out of range, so a bad deployment fails at startup instead of
//! mid-debate.
//!
//! # Environment variables
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `CONFIDENCE_THRESHOLD` | `confidence_threshold` | 0.25 |
//! | `CONSENSUS_THRESHOLD` | `consensus_threshold` | 0.80 |
//! | `CONVERGENCE_THRESHOLD` | `convergence_threshold` | 0.80 |
//! | `REPETITION_THRESHOLD` | `repetition_threshold` | 0.87 |
//! | `MIN_DEBATE_ROUNDS` | `min_debate_rounds` | 2 |
//! | `MAX_DEBATE_ROUNDS` | `max_debate_rounds` | 4 |
//! | `MAX_DISSENT_VIEWS` | `max_dissent_views` | 3 |
//! | `DEADLOCK_TURN_CEILING` | `deadlock_turn_ceiling` | 3 |
//! | `ENABLE_DEADLOCK_DETECTION` | `enable_deadlock_detection` | true |
//! | `MAX_DEADLOCK_RESETS` | `max_deadlock_resets` | 3 |
//! | `HEARTBEAT_INTERVAL` | `heartbeat_interval_secs` | 10 |
//! | `HEARTBEAT_EXPIRY` | `heartbeat_expiry_secs` | 15 |
//! | `DEBATE_TIMEOUT` | `debate_timeout_secs` (0 disables) | 30 |
//! | `MAX_HISTORY_SIZE` | `max_history_size` | 10 |
//! | `SIMILARITY_ORACLE` | `similarity_oracle` | jaccard |
//! | `PUBLISH_RETRIES` | `publish_retries` | 3 |
//! | `PUBLISH_BACKOFF_MS` | `publish_backoff_ms` | 200 |
//! | `REDIS_CHANNEL_MOD` | `channels.moderation` | moderation_channel |
//! | `REDIS_CHANNEL_RES` | `channels.responses` | responses_channel |
//! | `REDIS_CHANNEL_ARB` | `channels.arbitration` | arbitration_channel |
//! | `REDIS_CHANNEL_HEARTBEAT` | `channels.heartbeat` | heartbeat_channel |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::Channel;
use crate::similarity::OracleKind;

/// Error type for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("{key} out of range: {reason}")]
    OutOfRange { key: &'static str, reason: String },

    #[error("Failed to read config file {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    ParseFailed { path: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Recognized engine options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Weight margin within which a response folds into the majority.
    pub confidence_threshold: f64,
    /// Similarity to the majority below which a response counts as dissent.
    pub consensus_threshold: f64,
    /// Pairwise similarity every position must reach for convergence.
    pub convergence_threshold: f64,
    /// Similarity between consecutive responses that counts as a loop.
    pub repetition_threshold: f64,
    /// Rounds that must complete before convergence may end a debate.
    pub min_debate_rounds: u32,
    /// Hard ceiling; reaching it forces arbitration.
    pub max_debate_rounds: u32,
    /// Maximum dissent entries in an arbitration result.
    pub max_dissent_views: usize,
    /// Turns without phase progress before the kill switch fires.
    pub deadlock_turn_ceiling: u32,
    /// Whether deadlock detection runs at all.
    pub enable_deadlock_detection: bool,
    /// Kill-switch resets tolerated before arbitration is deadlocked.
    pub max_deadlock_resets: u32,
    /// Interval between heartbeats emitted by agent integrations.
    pub heartbeat_interval_secs: u64,
    /// Age after which an agent without heartbeats is stale.
    pub heartbeat_expiry_secs: u64,
    /// Idle time without an accepted response before a debate is forced
    /// to conclude. Zero disables the timeout.
    pub debate_timeout_secs: u64,
    /// Finished debates kept in memory before the oldest are evicted.
    pub max_history_size: usize,
    /// Which similarity oracle backs loop and convergence detection.
    pub similarity_oracle: OracleKind,
    /// Publish attempts after the first failure.
    pub publish_retries: u32,
    /// Base backoff between publish attempts (doubles per attempt).
    pub publish_backoff_ms: u64,
    /// Topic names the logical channels are published under.
    pub channels: ChannelNames,
}

/// Topic names for the four logical channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelNames {
    pub moderation: String,
    pub responses: String,
    pub arbitration: String,
    pub heartbeat: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            moderation: "moderation_channel".to_string(),
            responses: "responses_channel".to_string(),
            arbitration: "arbitration_channel".to_string(),
            heartbeat: "heartbeat_channel".to_string(),
        }
    }
}

impl ChannelNames {
    /// Topic name for a logical channel.
    pub fn name(&self, channel: Channel) -> &str {
        match channel {
            Channel::Moderation => &self.moderation,
            Channel::Responses => &self.responses,
            Channel::Arbitration => &self.arbitration,
            Channel::Heartbeat => &self.heartbeat,
        }
    }

    /// Map a topic name, or a logical name like `moderation`, back to its channel.
    pub fn resolve(&self, name: &str) -> Option<Channel> {
        let name = name.trim();
        Channel::ALL
            .into_iter()
            .find(|channel| self.name(*channel) == name)
            .or_else(|| name.parse().ok())
    }

    fn validate(&self) -> ConfigResult<()> {
        for channel in Channel::ALL {
            let name = self.name(channel);
            if name.trim().is_empty() {
                return Err(ConfigError::OutOfRange {
                    key: "REDIS_CHANNEL_*",
                    reason: format!("{} channel name is empty", channel),
                });
            }
            let duplicates = Channel::ALL
                .into_iter()
                .filter(|other| self.name(*other) == name)
                .count();
            if duplicates > 1 {
                return Err(ConfigError::OutOfRange {
                    key: "REDIS_CHANNEL_*",
                    reason: format!("channel name {:?} is used twice", name),
                });
            }
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            consensus_threshold: 0.80,
            convergence_threshold: 0.80,
            repetition_threshold: 0.87,
            min_debate_rounds: 2,
            max_debate_rounds: 4,
            max_dissent_views: 3,
            deadlock_turn_ceiling: 3,
            enable_deadlock_detection: true,
            max_deadlock_resets: 3,
            heartbeat_interval_secs: 10,
            heartbeat_expiry_secs: 15,
            debate_timeout_secs: 30,
            max_history_size: 10,
            similarity_oracle: OracleKind::Jaccard,
            publish_retries: 3,
            publish_backoff_ms: 200,
            channels: ChannelNames::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then the optional TOML file, then the process environment.
    /// The result is validated.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment, validated.
    pub fn from_env() -> ConfigResult<Self> {
        Self::load(None)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        toml::from_str(source).map_err(|e| ConfigError::ParseFailed {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Read and parse a TOML config file. Not validated.
    pub fn from_toml_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Apply overrides from a key lookup (the environment in production,
    /// a map in tests). Unparseable values are errors, not silently ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "CONFIDENCE_THRESHOLD", &mut self.confidence_threshold)?;
        override_parsed(&lookup, "CONSENSUS_THRESHOLD", &mut self.consensus_threshold)?;
        override_parsed(&lookup, "CONVERGENCE_THRESHOLD", &mut self.convergence_threshold)?;
        override_parsed(&lookup, "REPETITION_THRESHOLD", &mut self.repetition_threshold)?;
        override_parsed(&lookup, "MIN_DEBATE_ROUNDS", &mut self.min_debate_rounds)?;
        override_parsed(&lookup, "MAX_DEBATE_ROUNDS", &mut self.max_debate_rounds)?;
        override_parsed(&lookup, "MAX_DISSENT_VIEWS", &mut self.max_dissent_views)?;
        override_parsed(&lookup, "DEADLOCK_TURN_CEILING", &mut self.deadlock_turn_ceiling)?;
        override_flag(
            &lookup,
            "ENABLE_DEADLOCK_DETECTION",
            &mut self.enable_deadlock_detection,
        )?;
        override_parsed(&lookup, "MAX_DEADLOCK_RESETS", &mut self.max_deadlock_resets)?;
        override_parsed(&lookup, "HEARTBEAT_INTERVAL", &mut self.heartbeat_interval_secs)?;
        override_parsed(&lookup, "HEARTBEAT_EXPIRY", &mut self.heartbeat_expiry_secs)?;
        override_parsed(&lookup, "DEBATE_TIMEOUT", &mut self.debate_timeout_secs)?;
        override_parsed(&lookup, "MAX_HISTORY_SIZE", &mut self.max_history_size)?;
        override_parsed(&lookup, "SIMILARITY_ORACLE", &mut self.similarity_oracle)?;
        override_parsed(&lookup, "PUBLISH_RETRIES", &mut self.publish_retries)?;
        override_parsed(&lookup, "PUBLISH_BACKOFF_MS", &mut self.publish_backoff_ms)?;
        override_parsed(&lookup, "REDIS_CHANNEL_MOD", &mut self.channels.moderation)?;
        override_parsed(&lookup, "REDIS_CHANNEL_RES", &mut self.channels.responses)?;
        override_parsed(&lookup, "REDIS_CHANNEL_ARB", &mut self.channels.arbitration)?;
        override_parsed(&lookup, "REDIS_CHANNEL_HEARTBEAT", &mut self.channels.heartbeat)?;
        Ok(())
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> ConfigResult<()> {
        check_unit("CONFIDENCE_THRESHOLD", self.confidence_threshold)?;
        check_unit("CONSENSUS_THRESHOLD", self.consensus_threshold)?;
        check_unit("CONVERGENCE_THRESHOLD", self.convergence_threshold)?;
        check_unit("REPETITION_THRESHOLD", self.repetition_threshold)?;

        if self.max_debate_rounds == 0 {
            return Err(ConfigError::OutOfRange {
                key: "MAX_DEBATE_ROUNDS",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.min_debate_rounds > self.max_debate_rounds {
            return Err(ConfigError::OutOfRange {
                key: "MIN_DEBATE_ROUNDS",
                reason: format!(
                    "{} exceeds MAX_DEBATE_ROUNDS ({})",
                    self.min_debate_rounds, self.max_debate_rounds
                ),
            });
        }
        if self.deadlock_turn_ceiling == 0 {
            return Err(ConfigError::OutOfRange {
                key: "DEADLOCK_TURN_CEILING",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::OutOfRange {
                key: "HEARTBEAT_INTERVAL",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.heartbeat_expiry_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::OutOfRange {
                key: "HEARTBEAT_EXPIRY",
                reason: format!(
                    "{}s is shorter than HEARTBEAT_INTERVAL ({}s); every agent would be stale",
                    self.heartbeat_expiry_secs, self.heartbeat_interval_secs
                ),
            });
        }
        self.channels.validate()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_expiry(&self) -> Duration {
        Duration::from_secs(self.heartbeat_expiry_secs)
    }

    /// Idle timeout, `None` when disabled.
    pub fn debate_timeout(&self) -> Option<Duration> {
        (self.debate_timeout_secs > 0).then(|| Duration::from_secs(self.debate_timeout_secs))
    }

    pub fn publish_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_backoff_ms)
    }
}

fn check_unit(key: &'static str, value: f64) -> ConfigResult<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfRange {
            key,
            reason: format!("{} is outside [0, 1]", value),
        });
    }
    Ok(())
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

fn override_flag<F>(lookup: &F, key: &str, slot: &mut bool) -> ConfigResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                    reason: "expected true/false".to_string(),
                })
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.convergence_threshold, 0.80);
        assert_eq!(config.repetition_threshold, 0.87);
        assert_eq!(config.deadlock_turn_ceiling, 3);
        assert_eq!(config.max_debate_rounds, 4);
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(lookup(&[
                ("MAX_DEBATE_ROUNDS", "6"),
                ("CONVERGENCE_THRESHOLD", " 0.9 "),
                ("ENABLE_DEADLOCK_DETECTION", "false"),
                ("SIMILARITY_ORACLE", "cosine"),
            ]))
            .unwrap();
        assert_eq!(config.max_debate_rounds, 6);
        assert_eq!(config.convergence_threshold, 0.9);
        assert!(!config.enable_deadlock_detection);
        assert_eq!(config.similarity_oracle, OracleKind::Cosine);
    }

    #[test]
    fn test_unparseable_override_is_error() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(lookup(&[("MAX_DEBATE_ROUNDS", "four")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_DEBATE_ROUNDS"));
    }

    #[test]
    fn test_threshold_out_of_range() {
        let config = EngineConfig {
            consensus_threshold: 1.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange {
                key: "CONSENSUS_THRESHOLD",
                ..
            }
        ));

        let config = EngineConfig {
            repetition_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_round_ceiling_rejected() {
        let config = EngineConfig {
            max_debate_rounds: 0,
            min_debate_rounds: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::OutOfRange {
                key: "MAX_DEBATE_ROUNDS",
                ..
            }
        ));
    }

    #[test]
    fn test_min_rounds_above_max_rejected() {
        let config = EngineConfig {
            min_debate_rounds: 5,
            max_debate_rounds: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_expiry_shorter_than_interval_rejected() {
        let config = EngineConfig {
            heartbeat_interval_secs: 10,
            heartbeat_expiry_secs: 5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::OutOfRange {
                key: "HEARTBEAT_EXPIRY",
                ..
            }
        ));
    }

    #[test]
    fn test_debate_timeout_zero_disables() {
        let config = EngineConfig {
            debate_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.debate_timeout().is_none());
        assert_eq!(
            EngineConfig::default().debate_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_channel_names_resolve() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(lookup(&[("REDIS_CHANNEL_MOD", "mod_v2")]))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.channels.resolve("mod_v2"), Some(Channel::Moderation));
        assert_eq!(
            config.channels.resolve("arbitration_channel"),
            Some(Channel::Arbitration)
        );
        assert_eq!(config.channels.resolve("responses"), Some(Channel::Responses));
        assert_eq!(config.channels.resolve("nope"), None);
    }

    #[test]
    fn test_duplicate_channel_names_rejected() {
        let mut config = EngineConfig::default();
        config.channels.arbitration = config.channels.moderation.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_file_partial_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "max_debate_rounds = 8\nsimilarity_oracle = \"cosine\"\nmax_dissent_views = 1\n",
        )
        .unwrap();

        let config = EngineConfig::from_toml_file(&path).unwrap();
        assert_eq!(config.max_debate_rounds, 8);
        assert_eq!(config.max_dissent_views, 1);
        assert_eq!(config.similarity_oracle, OracleKind::Cosine);
        // untouched keys keep defaults
        assert_eq!(config.confidence_threshold, 0.25);
    }

    #[test]
    fn test_toml_parse_error() {
        let err = EngineConfig::from_toml_str("max_debate_rounds = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_toml_file(Path::new("/nonexistent/engine.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }
}
