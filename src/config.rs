use anyhow::{bail, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::BatchPolicy;
use crate::coordinator::audit::AuditSink;
use crate::coordinator::retry::RetryPolicy;
use crate::coordinator::transition::{CoordinationOptions, TransitionCoordinator};
use crate::locking::LockService;
use crate::storage::IsolationLevel;

const DEFAULT_CONFIG_FILE: &str = "transition-coordinator.toml";
const ENV_PREFIX: &str = "TRANSITION_COORDINATOR";

/// Engine configuration. Missing keys fall back to the defaults below.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub locking: LockingConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LockingConfig {
    /// How long a lock is held before it expires on its own
    pub hold_timeout_ms: u64,
    /// How long one acquisition attempt waits
    pub wait_timeout_ms: u64,
    /// Isolation level requested for coordinated writes
    pub isolation: Option<IsolationLevel>,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            hold_timeout_ms: 10_000,
            wait_timeout_ms: 5_000,
            isolation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total lock acquisition attempts
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 5_000,
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log level when `RUST_LOG` is unset
    pub log_level: String,
    /// Log a metrics summary after each batch run
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `transition-coordinator.toml` in the working directory, if present
    /// 3. Environment variables, e.g. `TRANSITION_COORDINATOR_RETRY__MAX_RETRIES`
    pub fn load() -> Result<Self> {
        let file = Path::new(DEFAULT_CONFIG_FILE);
        let file = file.exists().then_some(file);
        Self::build(file, Self::environment())
    }

    /// Load from an explicit file; environment variables still override it
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::build(Some(path.as_ref()), Self::environment())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn build(file: Option<&Path>, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }
        builder = builder.add_source(environment);

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            bail!("retry.max_retries must be at least 1");
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            bail!(
                "retry.max_backoff_ms ({}) is below retry.base_backoff_ms ({})",
                self.retry.max_backoff_ms,
                self.retry.base_backoff_ms
            );
        }
        if self.batch.max_workers == 0 {
            bail!("batch.max_workers must be at least 1");
        }
        Ok(())
    }

    pub fn coordination_options(&self) -> CoordinationOptions {
        CoordinationOptions {
            lock_timeout: Duration::from_millis(self.locking.hold_timeout_ms),
            blocking_timeout: Duration::from_millis(self.locking.wait_timeout_ms),
            isolation: self.locking.isolation,
            max_retries: self.retry.max_retries,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
            self.retry.jitter,
        )
    }

    pub fn parallel_policy(&self, atomic: bool) -> BatchPolicy {
        BatchPolicy::Parallel {
            max_workers: self.batch.max_workers,
            atomic,
        }
    }

    /// Coordinator wired with this configuration's retry and stats settings
    pub fn coordinator(
        &self,
        locks: Arc<dyn LockService>,
        audit: Arc<dyn AuditSink>,
    ) -> TransitionCoordinator {
        TransitionCoordinator::new(locks, audit)
            .with_retry_policy(self.retry_policy())
            .with_stats_logging(self.observability.metrics_enabled)
    }
}
