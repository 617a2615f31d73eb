//! Durable Store (§4.1): crash-safe persistence and atomic transitions for
//! sessions and parts, plus observation streams.

mod turso_store;

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::EngineResult;
use crate::model::{SessionStatus, UploadPart, UploadSession};

pub use turso_store::TursoStore;

pub type SessionSnapshot = (UploadSession, Vec<UploadPart>);
pub type SnapshotStream = Pin<Box<dyn Stream<Item = SessionSnapshot> + Send>>;
pub type ActiveSnapshotsStream = Pin<Box<dyn Stream<Item = Vec<SessionSnapshot>> + Send>>;

/// Crash-safe persistence for sessions and parts (§4.1 contract).
///
/// Implementations must uphold §3's invariants across crashes and
/// concurrent operations: in particular, `claim_next_pending_part` must be
/// serializable with respect to itself for the same session (invariant 6).
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_session(&self, session: &UploadSession) -> EngineResult<()>;
    async fn insert_parts(&self, parts: &[UploadPart]) -> EngineResult<()>;

    async fn get_session(&self, session_id: &str) -> EngineResult<Option<UploadSession>>;
    async fn get_session_with_parts(
        &self,
        session_id: &str,
    ) -> EngineResult<Option<SessionSnapshot>>;

    async fn find_active_session_for_path(
        &self,
        local_path: &str,
    ) -> EngineResult<Option<UploadSession>>;

    async fn get_recoverable_sessions(&self) -> EngineResult<Vec<UploadSession>>;
    async fn get_active_sessions(&self) -> EngineResult<Vec<UploadSession>>;

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        ts: i64,
    ) -> EngineResult<()>;

    async fn update_session_status_with_error(
        &self,
        session_id: &str,
        status: SessionStatus,
        message: &str,
        ts: i64,
    ) -> EngineResult<()>;

    async fn update_session_for_constraint_violation(
        &self,
        session_id: &str,
        reason: &str,
        stop_reason_code: u32,
        ts: i64,
    ) -> EngineResult<()>;

    async fn clear_constraint_violation(&self, session_id: &str, ts: i64) -> EngineResult<()>;

    async fn update_session_constraints(
        &self,
        session_id: &str,
        constraints_blob: &str,
        ts: i64,
    ) -> EngineResult<()>;

    /// Records the backend-assigned remote path once `complete` succeeds.
    /// Not named directly in §4.1's operation list, but required to make
    /// good on §4.5's `complete` contract ("returns Success with final
    /// remote path") across a later `get_session` read.
    async fn update_session_remote_path(
        &self,
        session_id: &str,
        remote_path: &str,
        ts: i64,
    ) -> EngineResult<()>;

    /// Atomic select-one-Pending-part-and-mark-Uploading (§3 invariant 6).
    async fn claim_next_pending_part(&self, session_id: &str) -> EngineResult<Option<UploadPart>>;

    async fn update_part_status(
        &self,
        part_id: &str,
        status: crate::model::PartStatus,
        etag: Option<String>,
        uploaded_bytes: u64,
        ts: i64,
    ) -> EngineResult<()>;

    async fn reset_uploading_parts(&self, session_id: &str) -> EngineResult<()>;
    async fn reset_failed_parts(&self, session_id: &str) -> EngineResult<()>;

    /// Bumps a part's `retry_count` after a transient failure without
    /// releasing its claim — `status` stays `Uploading` so the part remains
    /// owned by the task that is about to retry it and can't be re-claimed
    /// out from under that task by the scheduler's claim loop (§3 invariant
    /// 6, §4.4).
    async fn increment_part_retry(&self, part_id: &str, ts: i64) -> EngineResult<()>;

    /// Marks a part `Failed` once its retry budget is exhausted (§3, §4.4).
    async fn fail_part(&self, part_id: &str, ts: i64) -> EngineResult<()>;

    async fn get_all_parts(&self, session_id: &str) -> EngineResult<Vec<UploadPart>>;
    async fn get_uploaded_parts(&self, session_id: &str) -> EngineResult<Vec<UploadPart>>;
    async fn get_uploaded_parts_count(&self, session_id: &str) -> EngineResult<u32>;
    async fn get_total_uploaded_bytes(&self, session_id: &str) -> EngineResult<u64>;

    async fn delete_old_completed_sessions(&self, before_ts: i64) -> EngineResult<usize>;

    fn observe_session_with_parts(&self, session_id: &str) -> SnapshotStream;
    fn observe_active_sessions_with_parts(&self) -> ActiveSnapshotsStream;
}
