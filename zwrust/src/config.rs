//! Driver configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use zwrust_core::constants::{MAX_MAX_TRIES, MAX_TRIES, RETRY_TIMEOUT_MS};
use zwrust_transport::LinkConfig;

use crate::error::{Error, Result};

/// Settings of one [`Driver`](crate::Driver)
///
/// Every field has a default, so a JSON document only needs the keys it
/// changes:
///
/// ```
/// use zwrust::DriverConfig;
///
/// let config = DriverConfig::from_json(r#"{ "max_attempts": 5, "language": "de" }"#).unwrap();
/// assert_eq!(config.max_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Wait for ACK, response and callback of one transaction
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Send attempts before a message is dropped
    pub max_attempts: u8,

    /// Network key for Security command class nodes
    pub network_key: Option<[u8; 16]>,

    /// Length of one polling round
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    /// Directory holding `zwcfg_0x<home>.json`; no persistence when unset
    pub state_dir: Option<PathBuf>,

    /// Reopen delay during the initial window
    #[serde(with = "duration_ms")]
    pub reopen_short: Duration,

    /// Reopen attempts using the short delay
    pub reopen_short_attempts: u32,

    /// Reopen delay after the initial window
    #[serde(with = "duration_ms")]
    pub reopen_long: Duration,

    /// Language passed to the localization collaborator
    pub language: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let link = LinkConfig::default();
        Self {
            timeout: Duration::from_millis(RETRY_TIMEOUT_MS),
            max_attempts: MAX_TRIES,
            network_key: None,
            poll_interval: Duration::from_secs(30),
            state_dir: None,
            reopen_short: link.short_backoff,
            reopen_short_attempts: link.short_attempts,
            reopen_long: link.long_backoff,
            language: "en".to_string(),
        }
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set transaction timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set send attempts per message
    pub fn with_max_attempts(mut self, attempts: u8) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the network key used for secure nodes
    pub fn with_network_key(mut self, key: [u8; 16]) -> Self {
        self.network_key = Some(key);
        self
    }

    /// Set the polling round length
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Persist network state under `dir`
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Set the transport reopen schedule
    pub fn with_reopen_backoff(mut self, short: Duration, short_attempts: u32, long: Duration) -> Self {
        self.reopen_short = short;
        self.reopen_short_attempts = short_attempts;
        self.reopen_long = long;
        self
    }

    /// Set the label language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the driver cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 || self.max_attempts >= MAX_MAX_TRIES {
            return Err(Error::Config(format!(
                "max_attempts must be between 1 and {}, got {}",
                MAX_MAX_TRIES - 1,
                self.max_attempts
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll_interval must be non-zero".into()));
        }
        Ok(())
    }

    /// Settings for the background link task
    pub fn link_config(&self) -> LinkConfig {
        LinkConfig::default().with_backoff(
            self.reopen_short,
            self.reopen_short_attempts,
            self.reopen_long,
        )
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.reopen_short, Duration::from_secs(5));
        assert_eq!(config.reopen_short_attempts, 25);
        assert_eq!(config.reopen_long, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DriverConfig::new()
            .with_timeout(Duration::from_secs(2))
            .with_max_attempts(5)
            .with_network_key([0x11; 16])
            .with_state_dir("/var/lib/zwrust")
            .with_reopen_backoff(Duration::from_millis(100), 3, Duration::from_secs(1));

        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.network_key, Some([0x11; 16]));

        let link = config.link_config();
        assert_eq!(link.short_attempts, 3);
        assert_eq!(link.backoff(4), Duration::from_secs(1));
    }

    #[test]
    fn test_from_json() {
        let config =
            DriverConfig::from_json(r#"{ "timeout": 2500, "poll_interval": 60000 }"#).unwrap();

        assert_eq!(config.timeout, Duration::from_millis(2500));
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 3);

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(DriverConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_bad_attempts() {
        assert!(matches!(
            DriverConfig::from_json(r#"{ "max_attempts": 9 }"#),
            Err(Error::Config(_))
        ));
        assert!(DriverConfig::from_json(r#"{ "timeout": "soon" }"#).is_err());
    }
}
