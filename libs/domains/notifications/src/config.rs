//! Engine configuration.

use crate::retry::RetryPolicy;
use core_config::{env_flag, env_list, env_parse, env_parse_opt, ConfigError, FromEnv};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Dispatch engine settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of delivery workers.
    pub workers: usize,
    /// Global cap on simultaneous transport invocations.
    pub max_concurrent_sends: usize,
    /// Maximum number of queued tasks.
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Upper bound for a single transport invocation.
    pub send_timeout: Duration,
    /// Default timeout for enrichment fetches.
    pub enrichment_timeout: Duration,
    /// How long outcomes of completed requests are kept. `None` keeps them forever.
    pub outcome_retention: Option<Duration>,
    pub denied_domains: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_concurrent_sends: 4,
            queue_capacity: 10_000,
            retry: RetryPolicy::default(),
            send_timeout: Duration::from_secs(30),
            enrichment_timeout: Duration::from_millis(5_000),
            outcome_retention: None,
            denied_domains: Vec::new(),
        }
    }
}

impl DispatchConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_concurrent_sends(mut self, max: usize) -> Self {
        self.max_concurrent_sends = max;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_enrichment_timeout(mut self, timeout: Duration) -> Self {
        self.enrichment_timeout = timeout;
        self
    }

    pub fn with_outcome_retention(mut self, retention: Duration) -> Self {
        self.outcome_retention = Some(retention);
        self
    }

    pub fn with_denied_domains(mut self, domains: Vec<String>) -> Self {
        self.denied_domains = domains;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, details: String| ConfigError::ParseError {
            key: key.to_string(),
            details,
        };
        let positive = |key: &str, value: u128| {
            if value == 0 {
                Err(invalid(key, "must be greater than zero".to_string()))
            } else {
                Ok(())
            }
        };
        positive("MONKEY_WORKERS", self.workers as u128)?;
        positive("MONKEY_MAX_CONCURRENT_SENDS", self.max_concurrent_sends as u128)?;
        positive("MONKEY_QUEUE_CAPACITY", self.queue_capacity as u128)?;
        positive("MONKEY_MAX_ATTEMPTS", self.retry.max_attempts as u128)?;
        positive("MONKEY_SEND_TIMEOUT_SECS", self.send_timeout.as_millis())?;
        positive("MONKEY_ENRICHMENT_TIMEOUT_MS", self.enrichment_timeout.as_millis())?;
        if self.max_concurrent_sends > Semaphore::MAX_PERMITS {
            return Err(invalid(
                "MONKEY_MAX_CONCURRENT_SENDS",
                format!("must be at most {}", Semaphore::MAX_PERMITS),
            ));
        }
        Ok(())
    }
}

impl FromEnv for DispatchConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retry_defaults = RetryPolicy::default();

        let retry = RetryPolicy {
            max_attempts: env_parse("MONKEY_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            base_delay: Duration::from_millis(env_parse(
                "MONKEY_BACKOFF_BASE_MS",
                retry_defaults.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(env_parse(
                "MONKEY_BACKOFF_MAX_MS",
                retry_defaults.max_delay.as_millis() as u64,
            )?),
            max_elapsed: Duration::from_secs(env_parse(
                "MONKEY_RETRY_BUDGET_SECS",
                retry_defaults.max_elapsed.as_secs(),
            )?),
            jitter: env_flag("MONKEY_BACKOFF_JITTER", retry_defaults.jitter),
        };

        let config = Self {
            workers: env_parse("MONKEY_WORKERS", defaults.workers)?,
            max_concurrent_sends: env_parse(
                "MONKEY_MAX_CONCURRENT_SENDS",
                defaults.max_concurrent_sends,
            )?,
            queue_capacity: env_parse("MONKEY_QUEUE_CAPACITY", defaults.queue_capacity)?,
            retry,
            send_timeout: Duration::from_secs(env_parse(
                "MONKEY_SEND_TIMEOUT_SECS",
                defaults.send_timeout.as_secs(),
            )?),
            enrichment_timeout: Duration::from_millis(env_parse(
                "MONKEY_ENRICHMENT_TIMEOUT_MS",
                defaults.enrichment_timeout.as_millis() as u64,
            )?),
            outcome_retention: env_parse_opt::<u64>("MONKEY_OUTCOME_RETENTION_SECS")?
                .map(Duration::from_secs),
            denied_domains: env_list("MONKEY_DENIED_DOMAINS"),
        };

        config.validate()?;
        Ok(config)
    }
}
