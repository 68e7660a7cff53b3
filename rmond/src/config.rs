//! Agent configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields a working agent. Durations are written as seconds:
//!
//! ```json
//! {
//!   "connect_retry": 30.0,
//!   "collect_period": 20.0,
//!   "reaper_period": 5.0,
//!   "sink": { "period_unit": 1.0, "send_timeout": 2.0, "max_datagram": 65507 }
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Timing and delivery settings of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Delay before retrying a failed or lost collector connection.
    #[serde(with = "duration_serde")]
    pub connect_retry: Duration,

    /// Interval between usage polls of each entity.
    #[serde(with = "duration_serde")]
    pub collect_period: Duration,

    /// Interval between sweeps for exhausted subscriptions.
    #[serde(with = "duration_serde")]
    pub reaper_period: Duration,

    /// Push delivery settings.
    pub sink: SinkConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_secs(30),
            collect_period: Duration::from_secs(20),
            reaper_period: Duration::from_secs(5),
            sink: SinkConfig::default(),
        }
    }
}

/// Push delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Length of one unit of a subscription's push period.
    #[serde(with = "duration_serde")]
    pub period_unit: Duration,

    /// Upper bound on one datagram send.
    #[serde(with = "duration_serde")]
    pub send_timeout: Duration,

    /// Largest datagram the transport will emit.
    pub max_datagram: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            period_unit: Duration::from_secs(1),
            send_timeout: Duration::from_secs(2),
            max_datagram: 65_507,
        }
    }
}

impl AgentConfig {
    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be loaded, and [`ConfigError::Invalid`] if a value is out of
    /// range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every period is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("connect_retry", self.connect_retry),
            ("collect_period", self.collect_period),
            ("reaper_period", self.reaper_period),
            ("sink.period_unit", self.sink.period_unit),
            ("sink.send_timeout", self.sink.send_timeout),
        ];
        for (name, period) in periods {
            if period.is_zero() {
                return Err(ConfigError::Invalid {
                    reason: format!("{name} must be greater than zero"),
                });
            }
        }
        if self.sink.max_datagram == 0 {
            return Err(ConfigError::Invalid {
                reason: "sink.max_datagram must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Serde support for Duration fields, as seconds (f64).
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.connect_retry, Duration::from_secs(30));
        assert_eq!(config.collect_period, Duration::from_secs(20));
        assert_eq!(config.reaper_period, Duration::from_secs(5));
        assert_eq!(config.sink.max_datagram, 65_507);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"collect_period": 0.5, "sink": {{"period_unit": 0.01}}}}"#).unwrap();

        let config = AgentConfig::load(file.path()).unwrap();
        assert_eq!(config.collect_period, Duration::from_millis(500));
        assert_eq!(config.sink.period_unit, Duration::from_millis(10));
        assert_eq!(config.connect_retry, Duration::from_secs(30));
        assert_eq!(config.sink.send_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"reaper_period": 0}}"#).unwrap();
        let err = AgentConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
        assert!(err.to_string().contains("reaper_period"));
    }

    #[test]
    fn test_negative_duration_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"connect_retry": -1}}"#).unwrap();
        let err = AgentConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_serde_round_trip_uses_seconds() {
        let json = serde_json::to_value(AgentConfig::default()).unwrap();
        assert_eq!(json["connect_retry"], 30.0);
        assert_eq!(json["sink"]["period_unit"], 1.0);
    }
}
