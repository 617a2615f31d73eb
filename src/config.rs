//! Engine configuration (§6).

use crate::constraints::ConstraintSet;

/// S3 multipart upload requires parts between 5 MiB and 5 GiB (except the
/// last part, which may be smaller).
pub const MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunk_size: u64,
    pub max_concurrent_parts: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub use_exponential_backoff: bool,
    pub default_constraints: ConstraintSet,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: MIN_CHUNK_SIZE,
            max_concurrent_parts: 3,
            max_retries: 3,
            retry_delay_ms: 1000,
            use_exponential_backoff: true,
            default_constraints: ConstraintSet::default(),
        }
    }
}

impl EngineConfig {
    /// Clamp `chunk_size` into the S3-legal range, matching the bound named
    /// in §6's configuration table.
    pub fn normalized_chunk_size(&self) -> u64 {
        self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
    }
}
