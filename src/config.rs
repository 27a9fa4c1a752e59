//! Configuration types for steadykv stores.
//!
//! - [`StoreConfig`] - Per-store timeouts, retries and fallback policy
//! - [`ConfigFile`] - Root of a `config.toml` file (`[store]` table)
//!
//! All fields have defaults, so an empty file (or no file) is a valid
//! configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::constants;
use crate::reliability::{LivenessProbe, NoopProbe, PollingProbe, RetryConfig, needs_liveness_probe};

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// When to run the liveness probe before opening the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    #[default]
    Never,
    Always,
    /// Probe only engines whose `user_agent` is known to hang on open.
    Auto,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub transaction_timeout_ms: u64,
    pub open_timeout_ms: u64,
    /// Maximum attempts per backend call, including the first one.
    pub transaction_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Serve reads and acknowledge writes from the cache once the backend
    /// failed, instead of returning the error.
    pub enable_in_memory_fallback: bool,
    pub liveness_probe: ProbeMode,
    pub probe_interval_ms: u64,
    pub probe_max_attempts: u32,
    /// Identifies the engine for [`ProbeMode::Auto`].
    pub user_agent: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: constants::DEFAULT_TRANSACTION_TIMEOUT_MS,
            open_timeout_ms: constants::DEFAULT_OPEN_TIMEOUT_MS,
            transaction_retries: constants::DEFAULT_TRANSACTION_RETRIES,
            retry_delay_ms: constants::DEFAULT_RETRY_DELAY_MS,
            retry_max_delay_ms: constants::DEFAULT_RETRY_MAX_DELAY_MS,
            enable_in_memory_fallback: true,
            liveness_probe: ProbeMode::Never,
            probe_interval_ms: constants::DEFAULT_PROBE_INTERVAL_MS,
            probe_max_attempts: constants::DEFAULT_PROBE_MAX_ATTEMPTS,
            user_agent: None,
        }
    }
}

impl StoreConfig {
    /// Set the per-operation deadline.
    #[must_use]
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the attempt budget of each backend call.
    #[must_use]
    pub fn with_transaction_retries(mut self, retries: u32) -> Self {
        self.transaction_retries = retries;
        self
    }

    /// Enable or disable serving from the cache on backend failure.
    #[must_use]
    pub fn with_in_memory_fallback(mut self, enabled: bool) -> Self {
        self.enable_in_memory_fallback = enabled;
        self
    }

    /// Set the liveness probe mode.
    #[must_use]
    pub fn with_liveness_probe(mut self, mode: ProbeMode) -> Self {
        self.liveness_probe = mode;
        self
    }

    /// Set the engine identification used by [`ProbeMode::Auto`].
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    /// Retry policy of backend calls.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::immediate(self.transaction_retries)
            .with_initial_delay(Duration::from_millis(self.retry_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }

    /// Liveness probe matching `liveness_probe`.
    pub fn probe(&self) -> Arc<dyn LivenessProbe> {
        if self.probe_enabled() {
            Arc::new(PollingProbe {
                interval: Duration::from_millis(self.probe_interval_ms),
                max_attempts: self.probe_max_attempts,
            })
        } else {
            Arc::new(NoopProbe)
        }
    }

    /// Whether opening runs the liveness probe first.
    pub fn probe_enabled(&self) -> bool {
        match self.liveness_probe {
            ProbeMode::Never => false,
            ProbeMode::Always => true,
            ProbeMode::Auto => self
                .user_agent
                .as_deref()
                .is_some_and(needs_liveness_probe),
        }
    }

    /// Validate configuration.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - A timeout is zero
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.transaction_timeout_ms == 0 {
            errors.push(
                "transaction_timeout_ms cannot be 0. Every backend call would time out\n  \
                 Recommended: 300-1000"
                    .to_string(),
            );
        }

        if self.open_timeout_ms == 0 {
            errors.push("open_timeout_ms cannot be 0".to_string());
        }

        if self.transaction_retries == 0 {
            warnings.push(
                "transaction_retries is 0 and will be treated as 1 (a single attempt)".to_string(),
            );
        }

        if self.retry_max_delay_ms < self.retry_delay_ms {
            warnings.push(format!(
                "retry_max_delay_ms ({}) is lower than retry_delay_ms ({}); \
                 every delay will be capped at {}ms",
                self.retry_max_delay_ms, self.retry_delay_ms, self.retry_max_delay_ms
            ));
        }

        if self.liveness_probe == ProbeMode::Auto && self.user_agent.is_none() {
            warnings.push(
                "liveness_probe is \"auto\" but no user_agent is set; the probe is skipped"
                    .to_string(),
            );
        }

        if self.probe_enabled() {
            if self.probe_interval_ms == 0 {
                warnings.push("probe_interval_ms is 0 and will be treated as 1ms".to_string());
            }
            if self.probe_max_attempts == 0 {
                warnings.push(
                    "probe_max_attempts is 0: the liveness probe will always fail and the \
                     store will start in degraded mode"
                        .to_string(),
                );
            }
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }
}

/// `config.toml` structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub store: StoreConfig,
}

impl ConfigFile {
    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - Fields have invalid types
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Like [`ConfigFile::load_from`], but a missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be loaded.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(path)
    }
}
