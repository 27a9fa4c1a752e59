//! Liveness probes run before opening a backend.
//!
//! Some engines hang forever on open until they have been poked with a
//! cheap introspection call. [`PollingProbe`] issues that call on a fixed
//! tick and fails fast when none of them ever answers, so the real open is
//! never attempted against an engine that would hang.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::constants;
use crate::error::{Result, StoreError};

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Strategy checking that a backend responds at all.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Resolves once the backend is known to respond.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Timeout`] if the backend never answered.
    async fn check(&self, backend: &dyn Backend) -> Result<()>;
}

/// Probe for backends without the hang issue.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

#[async_trait]
impl LivenessProbe for NoopProbe {
    async fn check(&self, _backend: &dyn Backend) -> Result<()> {
        Ok(())
    }
}

/// Calls `list_databases` every `interval`, up to `max_attempts` times.
///
/// The first call to complete, successfully or not, proves the backend is
/// alive. Calls still in flight when the probe ends are dropped.
#[derive(Debug, Clone, Copy)]
pub struct PollingProbe {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollingProbe {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(constants::DEFAULT_PROBE_INTERVAL_MS),
            max_attempts: constants::DEFAULT_PROBE_MAX_ATTEMPTS,
        }
    }
}

#[async_trait]
impl LivenessProbe for PollingProbe {
    async fn check(&self, backend: &dyn Backend) -> Result<()> {
        let mut in_flight = FuturesUnordered::new();
        // `interval` panics on a zero period.
        let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut issued = 0u32;

        loop {
            tokio::select! {
                biased;

                Some(answer) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(err) = answer {
                        debug!(error = %err, "Liveness probe answered with an error");
                    }
                    debug!(attempts = issued, "Backend is responsive");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if issued >= self.max_attempts {
                        warn!(attempts = issued, "Couldn't list databases");
                        return Err(StoreError::timeout("probe"));
                    }
                    issued += 1;
                    in_flight.push(backend.list_databases());
                }
            }
        }
    }
}

/// Whether an engine identified by `user_agent` needs a liveness probe.
///
/// Only Safari is known to hang on open; Chromium-based agents also carry a
/// `Safari/` token and are excluded.
#[must_use]
pub fn needs_liveness_probe(user_agent: &str) -> bool {
    user_agent.contains("Safari/")
        && !user_agent.contains("Chrome/")
        && !user_agent.contains("Chromium/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultyBackend, MemoryBackend};
    use crate::error::BackendErrorKind;
    use std::sync::Arc;

    fn faulty() -> FaultyBackend {
        FaultyBackend::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_succeeds_when_fifth_call_answers() {
        let backend = faulty();
        backend.hang_probe(Some(4));

        let start = tokio::time::Instant::now();
        PollingProbe::default().check(&backend).await.unwrap();

        assert_eq!(backend.probe_calls(), 5);
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_fails_when_backend_answers_too_late() {
        let backend = faulty();
        backend.hang_probe(Some(14));

        let err = PollingProbe::default().check(&backend).await.unwrap_err();

        assert_eq!(err, StoreError::timeout("probe"));
        assert_eq!(backend.probe_calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_fails_when_backend_never_answers() {
        let backend = faulty();
        backend.hang_probe(None);

        let start = tokio::time::Instant::now();
        let err = PollingProbe::default().check(&backend).await.unwrap_err();

        assert_eq!(err, StoreError::timeout("probe"));
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_counts_as_alive() {
        let backend = faulty();
        backend.fail_probe(BackendErrorKind::Unknown, None);

        PollingProbe::default().check(&backend).await.unwrap();
        assert_eq!(backend.probe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_ticks_every_millisecond() {
        let backend = faulty();
        backend.hang_probe(None);
        let polling = PollingProbe {
            interval: Duration::ZERO,
            max_attempts: 3,
        };

        let start = tokio::time::Instant::now();
        let err = polling.check(&backend).await.unwrap_err();

        assert_eq!(err, StoreError::timeout("probe"));
        assert_eq!(backend.probe_calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(3));
    }

    #[tokio::test]
    async fn test_noop_probe_never_calls_backend() {
        let backend = faulty();
        NoopProbe.check(&backend).await.unwrap();
        assert_eq!(backend.probe_calls(), 0);
    }

    #[test]
    fn test_needs_liveness_probe() {
        let safari = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                      (KHTML, like Gecko) Version/17.1 Safari/605.1.15";
        let chrome = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                      (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
        let firefox = "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";

        assert!(needs_liveness_probe(safari));
        assert!(!needs_liveness_probe(chrome));
        assert!(!needs_liveness_probe(firefox));
    }
}
