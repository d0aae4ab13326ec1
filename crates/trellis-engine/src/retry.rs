use std::time::Duration;

use trellis_core::config::RetryConfig;
use trellis_core::error::ErrorKind;

/// Outcome of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Decide whether to re-attempt a node.
///
/// `node_retries` is the number of retries this node already used;
/// `run_retries` is the run-wide retry counter from telemetry.
pub fn decide(
    kind: ErrorKind,
    node_retries: u64,
    run_retries: u64,
    max_retries: u64,
    config: &RetryConfig,
) -> RetryDecision {
    if !kind.is_retryable() || node_retries >= max_retries || run_retries >= max_retries {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry {
        delay: calculate_backoff(node_retries, config),
    }
}

/// `base_ms * multiplier^retry`, capped at `max_backoff_ms`.
pub fn calculate_backoff(retry: u64, config: &RetryConfig) -> Duration {
    let exp = i32::try_from(retry).unwrap_or(i32::MAX);
    let raw = config.base_ms as f64 * config.multiplier.powi(exp);
    let mut ms = raw.min(config.max_backoff_ms as f64);
    if config.jitter {
        // Only stretch: a delay is never shorter than the nominal backoff.
        ms *= 1.0 + rand::random::<f64>() * 0.2;
    }
    Duration::from_millis(ms as u64)
}
