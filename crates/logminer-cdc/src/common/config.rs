//! Mining loop configuration
//!
//! ```rust
//! use logminer_cdc::common::{AckPolicy, MinerConfig};
//!
//! let config = MinerConfig::builder()
//!     .include(["SALES.ORDERS", "HR.*"])
//!     .window_increment(5_000_000)
//!     .ack_policy(AckPolicy::PerWindow)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.include_list.len(), 2);
//! ```

use crate::common::{CdcError, Dialect, FilterMode, ObjectPattern, Result, DEFAULT_WINDOW_INCREMENT};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest accepted poll interval.
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

/// When the acknowledged position is written to the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// After every delivered event
    #[default]
    PerEvent,
    /// Once per completed window, at its upper bound
    PerWindow,
}

/// Configuration of the mining loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Patterns of objects to mine (empty = all)
    pub include_list: Vec<String>,
    /// Patterns of objects to skip
    pub exclude_list: Vec<String>,
    /// Which catalog names the patterns match
    pub filter_mode: FilterMode,
    /// Position range per mining session
    pub window_increment: u64,
    /// Only mine archived segments younger than this (0 = unbounded)
    pub retention_hours: u32,
    /// Pause between windows once caught up with the log tail
    pub poll_interval_ms: u64,
    /// Checkpoint granularity
    pub ack_policy: AckPolicy,
    /// Feedback interval; 0 disables the feedback worker
    pub feedback_interval_ms: u64,
    /// Pause before re-offering a rejected event
    pub consumer_retry_delay_ms: u64,
    /// First recovery backoff
    pub recovery_backoff_base_ms: u64,
    /// Recovery backoff ceiling
    pub recovery_backoff_max_ms: u64,
    /// Source label stamped on events; the backend name when unset
    pub source_name: Option<String>,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            include_list: Vec::new(),
            exclude_list: Vec::new(),
            filter_mode: FilterMode::Tables,
            window_increment: DEFAULT_WINDOW_INCREMENT,
            retention_hours: 0,
            poll_interval_ms: 1000,
            ack_policy: AckPolicy::PerEvent,
            feedback_interval_ms: 10_000,
            consumer_retry_delay_ms: 100,
            recovery_backoff_base_ms: 500,
            recovery_backoff_max_ms: 30_000,
            source_name: None,
        }
    }
}

impl MinerConfig {
    pub fn builder() -> MinerConfigBuilder {
        MinerConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_increment == 0 {
            return Err(CdcError::config("window_increment must be positive"));
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            return Err(CdcError::config(format!(
                "poll_interval_ms must be at least {}",
                MIN_POLL_INTERVAL_MS
            )));
        }
        if self.recovery_backoff_base_ms > self.recovery_backoff_max_ms {
            return Err(CdcError::config(
                "recovery_backoff_base_ms exceeds recovery_backoff_max_ms",
            ));
        }
        // Pattern syntax does not depend on the dialect; folding does.
        for pattern in self.include_list.iter().chain(&self.exclude_list) {
            ObjectPattern::parse(pattern, Dialect::Oracle)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` when the feedback worker is disabled.
    pub fn feedback_interval(&self) -> Option<Duration> {
        (self.feedback_interval_ms > 0).then(|| Duration::from_millis(self.feedback_interval_ms))
    }

    pub fn consumer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.consumer_retry_delay_ms)
    }

    pub fn recovery_backoff_base(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_base_ms)
    }

    pub fn recovery_backoff_max(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_max_ms)
    }
}

/// Builder for [`MinerConfig`].
#[derive(Default)]
pub struct MinerConfigBuilder {
    config: MinerConfig,
}

impl MinerConfigBuilder {
    /// Add include patterns.
    pub fn include<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .include_list
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Add exclude patterns.
    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .exclude_list
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub fn filter_mode(mut self, mode: FilterMode) -> Self {
        self.config.filter_mode = mode;
        self
    }

    pub fn window_increment(mut self, increment: u64) -> Self {
        self.config.window_increment = increment;
        self
    }

    pub fn retention_hours(mut self, hours: u32) -> Self {
        self.config.retention_hours = hours;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.config.ack_policy = policy;
        self
    }

    /// Feedback interval; `Duration::ZERO` disables feedback.
    pub fn feedback_interval(mut self, interval: Duration) -> Self {
        self.config.feedback_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn consumer_retry_delay(mut self, delay: Duration) -> Self {
        self.config.consumer_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn recovery_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.recovery_backoff_base_ms = base.as_millis() as u64;
        self.config.recovery_backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn source_name(mut self, name: impl Into<String>) -> Self {
        self.config.source_name = Some(name.into());
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<MinerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MinerConfig::default();
        assert_eq!(config.window_increment, 10_000_000);
        assert_eq!(config.retention_hours, 0);
        assert_eq!(config.ack_policy, AckPolicy::PerEvent);
        assert_eq!(config.feedback_interval(), Some(Duration::from_secs(10)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(MinerConfig::builder().window_increment(0).build().is_err());
        assert!(MinerConfig::builder()
            .poll_interval(Duration::from_millis(1))
            .build()
            .is_err());
        assert!(MinerConfig::builder()
            .recovery_backoff(Duration::from_secs(60), Duration::from_secs(1))
            .build()
            .is_err());
        assert!(matches!(
            MinerConfig::builder().include(["sales.*.x"]).build(),
            Err(CdcError::Filter(_))
        ));
    }

    #[test]
    fn test_feedback_disabled() {
        let config = MinerConfig::builder()
            .feedback_interval(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(config.feedback_interval(), None);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: MinerConfig = serde_json::from_str(
            r#"{"include_list": ["SALES.ORDERS"], "ack_policy": "per_window", "retention_hours": 24}"#,
        )
        .unwrap();
        assert_eq!(config.include_list, vec!["SALES.ORDERS"]);
        assert_eq!(config.ack_policy, AckPolicy::PerWindow);
        assert_eq!(config.retention_hours, 24);
        assert_eq!(config.window_increment, DEFAULT_WINDOW_INCREMENT);
    }
}
