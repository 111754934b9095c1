#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use rand::Rng;
use std::time::Duration;

const BASE_MS: u64 = 1_000;
const FACTOR: u32 = 2;
const CAP_MS: u64 = 60_000;
const JITTER_RATIO: f64 = 0.2;

/// Exponential backoff with base 1s, factor 2, cap 60s, ±20% jitter, applied
/// on every non-permanent `fail` and every `releaseStalled` release (spec
/// §4.1).
#[must_use]
pub fn backoff_duration(retry_count: u32) -> Duration {
    let unjittered_ms = BASE_MS
        .saturating_mul(FACTOR.saturating_pow(retry_count.min(32)) as u64)
        .min(CAP_MS);
    let jitter_span = (unjittered_ms as f64 * JITTER_RATIO) as i64;
    let jitter = if jitter_span > 0 {
        rand::rng().random_range(-jitter_span..=jitter_span)
    } else {
        0
    };
    let jittered = (unjittered_ms as i64 + jitter).max(0) as u64;
    Duration::from_millis(jittered.min(CAP_MS + jitter_span.unsigned_abs()))
}
