//! Data model (§3): `UploadSession`, `UploadPart`, and their status enums.
//!
//! Struct shape follows `dickwu-r2`'s `db::UploadSession` /
//! `db::CompletedPart` (`db/sessions.rs`) directly — `derive(Debug, Clone,
//! Serialize, Deserialize)`, snake_case fields persisted as-is — extended
//! with the columns the fuller spec's `UploadPart` needs that the
//! teacher's slimmer `completed_parts` table never tracked (byte ranges,
//! per-part status, retry count). Status enums follow the teacher's
//! `MoveStatus` pattern (`move_transfer/types.rs`): a `#[serde(rename =
//! "...")]`'d enum with a hand-written `Display` impl and round-trip
//! tests.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "paused_constraint_violation")]
    PausedConstraintViolation,
    #[serde(rename = "completing")]
    Completing,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "aborted")]
    Aborted,
}

impl SessionStatus {
    /// Terminal statuses admit no further transitions (§3 invariant 7).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }

    /// §4.1 `get_recoverable_sessions` / `get_active_sessions` predicate.
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            SessionStatus::Completed | SessionStatus::Aborted | SessionStatus::Failed
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Paused => "paused",
            SessionStatus::PausedConstraintViolation => "paused_constraint_violation",
            SessionStatus::Completing => "completing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "pending" => SessionStatus::Pending,
            "in_progress" => SessionStatus::InProgress,
            "paused" => SessionStatus::Paused,
            "paused_constraint_violation" => SessionStatus::PausedConstraintViolation,
            "completing" => SessionStatus::Completing,
            "completed" => SessionStatus::Completed,
            "failed" => SessionStatus::Failed,
            "aborted" => SessionStatus::Aborted,
            other => {
                return Err(EngineError::Internal(format!(
                    "unrecognized session status in store: {other}"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "uploading")]
    Uploading,
    #[serde(rename = "uploaded")]
    Uploaded,
    #[serde(rename = "failed")]
    Failed,
}

impl std::fmt::Display for PartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PartStatus::Pending => "pending",
            PartStatus::Uploading => "uploading",
            PartStatus::Uploaded => "uploaded",
            PartStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PartStatus {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "pending" => PartStatus::Pending,
            "uploading" => PartStatus::Uploading,
            "uploaded" => PartStatus::Uploaded,
            "failed" => PartStatus::Failed,
            other => {
                return Err(EngineError::Internal(format!(
                    "unrecognized part status in store: {other}"
                )))
            }
        })
    }
}

/// Four absolute backend endpoint URLs, captured at session creation so a
/// later resume does not require the caller to re-supply them (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    pub initiate: String,
    pub presign_part: String,
    pub complete: String,
    pub abort: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub upload_id: Option<String>,
    pub local_path: String,
    pub remote_path: Option<String>,
    pub file_name: String,
    pub content_type: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_parts: u32,
    pub status: SessionStatus,
    pub endpoints: Endpoints,
    pub max_retries: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub error_message: Option<String>,
    pub constraints_blob: String,
    pub pause_reason: Option<String>,
    pub constraint_violated_at: Option<i64>,
    pub stop_reason_code: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPart {
    pub part_id: String,
    pub session_id: String,
    pub part_number: u32,
    pub start_byte: u64,
    pub end_byte: u64,
    pub part_size: u64,
    pub status: PartStatus,
    pub etag: Option<String>,
    pub uploaded_bytes: u64,
    pub retry_count: u32,
    pub updated_at: i64,
}

/// Splits `total_size` into ascending, non-overlapping, gap-free byte
/// ranges of at most `chunk_size` each (§3 invariant 1, §8 boundary
/// behaviours: a size that is an exact multiple of `chunk_size` yields a
/// last part exactly `chunk_size` bytes, never smaller).
pub fn part_ranges(total_size: u64, chunk_size: u64) -> Vec<(u64, u64)> {
    if total_size == 0 {
        return Vec::new();
    }
    let mut ranges = Vec::new();
    let mut start = 0u64;
    while start < total_size {
        let end = std::cmp::min(start + chunk_size, total_size);
        ranges.push((start, end));
        start = end;
    }
    ranges
}
