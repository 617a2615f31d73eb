//! External collaborator interfaces (§6 egress).
//!
//! Grounded on `dog-blob::upload::UploadCoordinator`
//! (`examples/Jitpomi-dogrs/dog-blob/src/upload.rs`), the pack's
//! precedent for modelling an external collaborator as an
//! `#[async_trait]` trait — a shape the teacher never needs because it
//! calls concrete async functions directly, but which this spec's
//! explicit "named interface only" collaborators (§1) require.

use async_trait::async_trait;

use crate::constraints::ConstraintSet;

/// Supplies a bearer token for backend RPCs, consulted on every call so
/// rotation never requires reconstructing the client (§6, §9).
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Option<String>;
}

/// A `TokenProvider` that never has a token, for backends that don't
/// require authentication.
pub struct NoToken;

#[async_trait]
impl TokenProvider for NoToken {
    async fn token(&self) -> Option<String> {
        None
    }
}

/// The host platform's background job scheduler (§1 "out of scope",
/// §6 egress). The engine never constructs or assumes a concrete
/// implementation; any runner honouring these calls suffices.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule_upload(
        &self,
        local_path: &str,
        endpoints: &crate::model::Endpoints,
        constraints: Option<ConstraintSet>,
    );

    async fn schedule_resume(
        &self,
        session_id: &str,
        constraints: Option<ConstraintSet>,
        initial_delay_ms: u64,
    );

    async fn cancel_by_session(&self, session_id: &str);

    async fn enable_auto_recovery(&self, interval_ms: u64);

    async fn run_recovery_now(&self);
}

/// A `Scheduler` that does nothing — useful when the caller drives
/// `execute`/`resume` itself rather than delegating to a background
/// runner.
pub struct NoopScheduler;

#[async_trait]
impl Scheduler for NoopScheduler {
    async fn schedule_upload(
        &self,
        _local_path: &str,
        _endpoints: &crate::model::Endpoints,
        _constraints: Option<ConstraintSet>,
    ) {
    }

    async fn schedule_resume(
        &self,
        _session_id: &str,
        _constraints: Option<ConstraintSet>,
        _initial_delay_ms: u64,
    ) {
    }

    async fn cancel_by_session(&self, _session_id: &str) {}

    async fn enable_auto_recovery(&self, _interval_ms: u64) {}

    async fn run_recovery_now(&self) {}
}
