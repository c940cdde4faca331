//! Tracing setup and guard counters
//!
//! Everything in the crate logs through `tracing`; [`init_tracing`] is a
//! convenience for binaries and tests that do not install their own
//! subscriber. [`GuardMetrics`] keeps lock-free counters per orchestrator so
//! callers can export them to whatever metrics system they use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{ConfigError, ConfigResult};

/// Install a global `fmt` subscriber configured from `config`
///
/// `RUST_LOG` takes precedence over `config.level` when set. Returns
/// `Ok(false)` if another subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> ConfigResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|err| {
            ConfigError::invalid(format!("invalid log level `{}`: {err}", config.level))
        })?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    Ok(installed.is_ok())
}

/// Counters for one orchestrator
#[derive(Debug, Default)]
pub struct GuardMetrics {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejected: AtomicU64,
    succeeded: AtomicU64,
    exhausted: AtomicU64,
    fatal: AtomicU64,
    cancelled: AtomicU64,
    backoff_ms: AtomicU64,
}

/// Point-in-time copy of [`GuardMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GuardMetricsSnapshot {
    /// Logical calls started
    pub calls: u64,
    /// Transport invocations
    pub attempts: u64,
    /// Backoff pauses taken between attempts
    pub retries: u64,
    pub rate_limited: u64,
    pub circuit_rejected: u64,
    pub succeeded: u64,
    pub exhausted: u64,
    pub fatal: u64,
    pub cancelled: u64,
    /// Total time spent backing off, in milliseconds
    pub backoff_ms: u64,
}

impl GuardMetricsSnapshot {
    /// Share of finished calls that succeeded
    pub fn success_rate(&self) -> f64 {
        let finished = self.succeeded
            + self.exhausted
            + self.fatal
            + self.cancelled
            + self.rate_limited
            + self.circuit_rejected;
        if finished == 0 {
            0.0
        } else {
            self.succeeded as f64 / finished as f64
        }
    }
}

impl GuardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backoff(&self, delay: Duration) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.backoff_ms.fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_rejected(&self) {
        self.circuit_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fatal(&self) {
        self.fatal.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> GuardMetricsSnapshot {
        GuardMetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejected: self.circuit_rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            backoff_ms: self.backoff_ms.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.calls,
            &self.attempts,
            &self.retries,
            &self.rate_limited,
            &self.circuit_rejected,
            &self.succeeded,
            &self.exhausted,
            &self.fatal,
            &self.cancelled,
            &self.backoff_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
