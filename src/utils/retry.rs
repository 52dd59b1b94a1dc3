//! Retry utilities: backoff builders for transient bus failures.
//!
//! Uses `backon` for exponential backoff with jitter. Consumer reconnects
//! size their backoff from configuration; this module holds the standard
//! builders for caller-side retries.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Standard backoff for transient publish failures (broker briefly down,
/// confirm not received).
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 5
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}
