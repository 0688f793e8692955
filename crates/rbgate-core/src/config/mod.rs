//! Configuration parsing and management.
//!
//! Configuration is read from a TOML file. Every section and every field
//! has a default, so an empty file is a valid configuration.
//!
//! ```toml
//! [sequencer]
//! step_timeout_ms = 50
//! poll_interval_ms = 1
//! settle_interval_ms = 20
//! rails_timeout_ms = 100
//!
//! [policy]
//! min_isolation_battery_percent = 20
//! veto_while_charging = true
//!
//! [link]
//! socket_path = "/run/rbgate/link.sock"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML is invalid.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Serialization failed.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RbgateConfig {
    /// Power sequencer timing.
    #[serde(default)]
    pub sequencer: SequencerConfig,

    /// Isolation guard policy.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Link transport.
    #[serde(default)]
    pub link: LinkConfig,
}

impl RbgateConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.sequencer;
        if s.step_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "sequencer.step_timeout_ms must be non-zero".to_string(),
            ));
        }
        if s.poll_interval_ms == 0 || s.poll_interval_ms >= s.step_timeout_ms {
            return Err(ConfigError::Validation(format!(
                "sequencer.poll_interval_ms must be in 1..{}",
                s.step_timeout_ms
            )));
        }
        if s.rails_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "sequencer.rails_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.policy.min_isolation_battery_percent > 100 {
            return Err(ConfigError::Validation(
                "policy.min_isolation_battery_percent must be at most 100".to_string(),
            ));
        }
        Ok(())
    }
}

/// Power sequencer timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequencerConfig {
    /// Bound on each switch/isolator step.
    pub step_timeout_ms: u64,
    /// Readback polling interval.
    pub poll_interval_ms: u64,
    /// Minimum wait after closing both paths before isolators enable.
    pub settle_interval_ms: u64,
    /// Bound on waiting for rails to report nominal after settling.
    pub rails_timeout_ms: u64,
}

impl SequencerConfig {
    /// Step timeout as a [`Duration`].
    #[must_use]
    pub const fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Poll interval as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Settle interval as a [`Duration`].
    #[must_use]
    pub const fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    /// Rails timeout as a [`Duration`].
    #[must_use]
    pub const fn rails_timeout(&self) -> Duration {
        Duration::from_millis(self.rails_timeout_ms)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 50,
            poll_interval_ms: 1,
            settle_interval_ms: 20,
            rails_timeout_ms: 100,
        }
    }
}

/// Isolation guard policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Battery percentage below which isolation is vetoed.
    pub min_isolation_battery_percent: u8,
    /// Veto isolation while the charger is active.
    pub veto_while_charging: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_isolation_battery_percent: 20,
            veto_while_charging: true,
        }
    }
}

/// Link transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    /// Unix socket the untrusted domain connects to.
    pub socket_path: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/rbgate/link.sock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = RbgateConfig::from_toml("").unwrap();
        assert_eq!(config, RbgateConfig::default());
        assert_eq!(config.sequencer.step_timeout(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_section() {
        let config = RbgateConfig::from_toml(
            r"
            [policy]
            min_isolation_battery_percent = 35
            ",
        )
        .unwrap();
        assert_eq!(config.policy.min_isolation_battery_percent, 35);
        assert!(config.policy.veto_while_charging);
        assert_eq!(config.sequencer, SequencerConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = RbgateConfig::from_toml(
            r"
            [sequencer]
            retry_count = 3
            ",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_zero_step_timeout_rejected() {
        let err = RbgateConfig::from_toml(
            r"
            [sequencer]
            step_timeout_ms = 0
            ",
        )
        .unwrap_err();
        assert!(err.to_string().contains("step_timeout_ms"));
    }

    #[test]
    fn test_poll_interval_must_be_below_step_timeout() {
        let err = RbgateConfig::from_toml(
            r"
            [sequencer]
            step_timeout_ms = 10
            poll_interval_ms = 10
            ",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_battery_percent_range() {
        let err = RbgateConfig::from_toml(
            r"
            [policy]
            min_isolation_battery_percent = 101
            ",
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_isolation_battery_percent"));
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let mut config = RbgateConfig::default();
        config.sequencer.settle_interval_ms = 75;
        config.link.socket_path = PathBuf::from("/tmp/link.sock");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml().unwrap().as_bytes())
            .unwrap();

        let loaded = RbgateConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let err = RbgateConfig::from_file(Path::new("/nonexistent/rbgate.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
