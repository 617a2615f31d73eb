//! Retry policy (§4.4).
//!
//! The teacher has no retry logic at all — a failed part PUT just fails
//! the whole upload. Grounded instead on
//! `examples/other_examples/62938d65_gustcol-smartcopy__src-storage-native_s3.rs.rs`'s
//! `exponential_backoff_delay`, the closest precedent in the pack for
//! capped exponential backoff around a storage PUT, extended with
//! optional jitter (§4.4) via `rand`.

use std::time::Duration;

use rand::Rng;

use crate::config::EngineConfig;
use crate::error::EngineError;

const MAX_BACKOFF_MS: u64 = 64_000;

/// Whether `retry_count` has already exhausted `max_retries` (§3, §4.4):
/// parts move to `Failed` once `retry_count >= max_retries` attempts have
/// failed.
pub fn retries_exhausted(retry_count: u32, max_retries: u32) -> bool {
    retry_count >= max_retries
}

/// Delay before the next attempt for a part that has already failed
/// `retry_count` times. Constant backoff repeats `retry_delay_ms` each
/// time; exponential backoff doubles per attempt, capped at 64s, with up
/// to 20% jitter layered on top so that many parts failing at once don't
/// all retry in lockstep.
pub fn delay_for(retry_count: u32, cfg: &EngineConfig) -> Duration {
    let base_ms = if cfg.use_exponential_backoff {
        let shift = retry_count.min(16);
        (cfg.retry_delay_ms.saturating_mul(1u64 << shift)).min(MAX_BACKOFF_MS)
    } else {
        cfg.retry_delay_ms
    };
    let jitter_ms = rand::thread_rng().gen_range(0..=(base_ms / 5).max(1));
    Duration::from_millis(base_ms + jitter_ms)
}

/// `true` if this error justifies burning a retry attempt rather than
/// failing the part immediately (§7 "Recoverable error").
pub fn should_retry(error: &EngineError, retry_count: u32, max_retries: u32) -> bool {
    error.recoverable() && !retries_exhausted(retry_count, max_retries)
}
