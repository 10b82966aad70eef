//! Engine configuration.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Configuration for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Project name used when the topology does not set one.
    pub project_name: String,

    /// Directory relative bind mounts and build contexts resolve against.
    pub base_dir: PathBuf,

    /// How long a service waits for each dependency condition.
    pub readiness_timeout_ms: u64,

    /// How often readiness waits re-check the registry.
    pub poll_interval_ms: u64,

    /// Grace period before a stopping container is killed.
    pub stop_timeout_secs: u64,

    /// What `up` does after a service fails.
    pub failure_policy: FailurePolicy,

    /// Retry policy for transient runtime errors during `up`.
    pub retry: RetryPolicy,

    /// Labels added to every container, network and volume.
    pub labels: IndexMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_name: "convoy".to_string(),
            base_dir: PathBuf::from("."),
            readiness_timeout_ms: 60_000,
            poll_interval_ms: 250,
            stop_timeout_secs: 10,
            failure_policy: FailurePolicy::default(),
            retry: RetryPolicy::default(),
            labels: IndexMap::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Returns the readiness timeout.
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    /// Returns the readiness poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the stop grace period.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.project_name.is_empty() {
            return Err(OrchestratorError::configuration("project_name cannot be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(OrchestratorError::configuration("poll_interval_ms must be positive"));
        }
        if self.readiness_timeout_ms < self.poll_interval_ms {
            return Err(OrchestratorError::configuration(
                "readiness_timeout_ms must not be shorter than poll_interval_ms",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(OrchestratorError::configuration("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Builder for `EngineConfig`.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Sets the project name.
    pub fn project_name(mut self, name: impl Into<String>) -> Self {
        self.config.project_name = name.into();
        self
    }

    /// Sets the base directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.base_dir = dir.into();
        self
    }

    /// Sets the readiness timeout.
    pub fn readiness_timeout(mut self, timeout: Duration) -> Self {
        self.config.readiness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the readiness poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the stop timeout.
    pub fn stop_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stop_timeout_secs = secs;
        self
    }

    /// Sets the failure policy.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.labels.insert(key.into(), value.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// What `up` does once a service has failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep starting services that do not depend on the failed one.
    #[default]
    Continue,
    /// Start nothing further; remaining services are reported as skipped.
    Abort,
}

/// Backoff strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed {
        /// Delay in milliseconds.
        delay_ms: u64,
    },
    /// Exponential backoff with maximum.
    Exponential {
        /// Initial delay in milliseconds.
        initial_ms: u64,
        /// Maximum delay in milliseconds.
        max_ms: u64,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            initial_ms: 500,
            max_ms: 10_000,
        }
    }
}

/// Bounded retry of transient runtime errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay strategy between attempts.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
        }
    }

    /// A policy with a fixed delay.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
        }
    }

    /// Returns the delay before retry number `retry` (0-based), or `None`
    /// once the attempts are used up.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry + 1 >= self.max_attempts {
            return None;
        }

        let delay = match self.backoff {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { initial_ms, max_ms } => {
                let factor = 2u64.saturating_pow(retry);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        };
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::builder()
            .project_name("shop")
            .readiness_timeout(Duration::from_millis(200))
            .poll_interval(Duration::from_millis(10))
            .failure_policy(FailurePolicy::Abort)
            .label("team", "payments")
            .build();

        assert_eq!(config.project_name, "shop");
        assert_eq!(config.readiness_timeout(), Duration::from_millis(200));
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.labels.get("team"), Some(&"payments".to_string()));
        config.validate().unwrap();
    }

    #[test]
    fn test_engine_config_validation() {
        let config = EngineConfig::builder().project_name("").build();
        assert!(config.validate().is_err());

        let config = EngineConfig::builder()
            .readiness_timeout(Duration::from_millis(10))
            .poll_interval(Duration::from_millis(100))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_fixed_backoff() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), None);
    }

    #[test]
    fn test_retry_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 6,
            backoff: Backoff::Exponential {
                initial_ms: 100,
                max_ms: 1000,
            },
        };

        let delays: Vec<_> = (0..6).map(|i| policy.delay_for(i)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(400)),
                Some(Duration::from_millis(800)),
                Some(Duration::from_millis(1000)),
                None,
            ]
        );
    }

    #[test]
    fn test_retry_none() {
        assert_eq!(RetryPolicy::none().delay_for(0), None);
    }

    #[test]
    fn test_config_deserialize() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"failure_policy":"abort","retry":{"max_attempts":5,"backoff":{"kind":"fixed","delay_ms":50}}}"#,
        )
        .unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.retry, RetryPolicy::fixed(5, Duration::from_millis(50)));
        assert_eq!(config.poll_interval_ms, 250);
    }
}
