//! Session Engine (§4.5): the top-level upload state machine.
//!
//! `SessionEngine` is constructed explicitly (store, backend client,
//! scheduler, config, cancellation registry) rather than reached through
//! `lazy_static!` globals — the teacher's `move_transfer/worker.rs` keeps
//! its `MOVE_CANCEL_REGISTRY`/`MOVE_PAUSE_REGISTRY` as process-wide
//! statics because it's a long-lived Tauri process; a library has no such
//! runtime to hang a static off, so the registry here is an instance
//! field guarded by `tokio::sync::Mutex`, matching the teacher's own
//! `Mutex<HashMap<String, Arc<AtomicBool>>>` shape.

pub mod recovery;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_core::Stream;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::backend::{
    AbortRequest, BackendClient, CompleteRequest, CompletedPart, InitiateRequest,
};
use crate::collaborators::Scheduler;
use crate::config::EngineConfig;
use crate::constraints::{self, ConstraintSet};
use crate::error::{EngineError, EngineResult};
use crate::ids;
use crate::model::{Endpoints, PartStatus, SessionStatus, UploadSession};
use crate::progress::Progress;
use crate::scheduler::PartScheduler;
use crate::store::Store;

#[derive(Debug, Clone)]
pub enum EngineOutcome {
    Success {
        session_id: String,
        remote_path: Option<String>,
        location: Option<String>,
    },
    Paused {
        session_id: String,
        uploaded_parts: u32,
        total_parts: u32,
    },
    Error {
        message: String,
        recoverable: bool,
    },
    Cancelled {
        session_id: String,
    },
}

pub struct SessionEngine {
    store: Arc<dyn Store>,
    backend: Arc<dyn BackendClient>,
    scheduler: Arc<dyn Scheduler>,
    config: EngineConfig,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl SessionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        backend: Arc<dyn BackendClient>,
        scheduler: Arc<dyn Scheduler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            backend,
            scheduler,
            config,
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    async fn flag_for(&self, session_id: &str) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().await;
        flags
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    async fn reset_flag(&self, session_id: &str) {
        let mut flags = self.cancel_flags.lock().await;
        flags.insert(session_id.to_string(), Arc::new(AtomicBool::new(false)));
    }

    async fn trigger_cancel(&self, session_id: &str) {
        let flags = self.cancel_flags.lock().await;
        if let Some(flag) = flags.get(session_id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// `start` (§4.5): idempotent entry point — resumes an already
    /// in-flight session for `local_path` if one exists, otherwise
    /// initializes and executes a new one.
    pub async fn start(
        &self,
        local_path: &str,
        endpoints: Endpoints,
        constraints: Option<ConstraintSet>,
    ) -> EngineOutcome {
        if let Err(e) = tokio::fs::metadata(local_path).await {
            return EngineOutcome::Error {
                message: format!("cannot read {local_path}: {e}"),
                recoverable: false,
            };
        }

        match self.store.find_active_session_for_path(local_path).await {
            Ok(Some(existing)) => {
                info!("resuming existing session {} for {local_path}", existing.session_id);
                return self.execute(&existing.session_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                return EngineOutcome::Error {
                    message: e.to_string(),
                    recoverable: e.recoverable(),
                }
            }
        }

        let constraints = constraints.unwrap_or_else(|| self.config.default_constraints.clone());
        match self.initialize(local_path, endpoints, constraints).await {
            Ok(session_id) => self.execute(&session_id).await,
            Err(e) => EngineOutcome::Error {
                message: e.to_string(),
                recoverable: e.recoverable(),
            },
        }
    }

    /// `initialize` (§4.5): assigns session identity, calls Initiate, and
    /// persists the session plus every part row atomically (relative to
    /// observers — both inserts happen before any other engine call can
    /// observe the session id).
    pub async fn initialize(
        &self,
        local_path: &str,
        endpoints: Endpoints,
        constraints: ConstraintSet,
    ) -> EngineResult<String> {
        let metadata = tokio::fs::metadata(local_path).await?;
        let total_size = metadata.len();

        if total_size == 0 {
            return Err(EngineError::InvalidInput(
                "file is empty; multipart upload requires at least one byte".into(),
            ));
        }

        let chunk_size = self.config.normalized_chunk_size();
        let ranges = crate::model::part_ranges(total_size, chunk_size);
        let total_parts = ranges.len() as u32;

        let file_name = std::path::Path::new(local_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let content_type = "application/octet-stream".to_string();

        let initiate_response = self
            .backend
            .initiate(
                &endpoints,
                InitiateRequest {
                    file_name: &file_name,
                    content_type: &content_type,
                },
            )
            .await?;

        let session_id = ids::new_session_id();
        let now = now();
        let session = UploadSession {
            session_id: session_id.clone(),
            upload_id: Some(initiate_response.upload_id),
            local_path: local_path.to_string(),
            remote_path: Some(initiate_response.file_path),
            file_name,
            content_type,
            total_size,
            chunk_size,
            total_parts,
            status: SessionStatus::Pending,
            endpoints,
            max_retries: self.config.max_retries,
            created_at: now,
            updated_at: now,
            error_message: None,
            constraints_blob: constraints.to_blob(),
            pause_reason: None,
            constraint_violated_at: None,
            stop_reason_code: None,
        };

        let parts = ranges
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| crate::model::UploadPart {
                part_id: ids::part_id(&session_id, (i + 1) as u32),
                session_id: session_id.clone(),
                part_number: (i + 1) as u32,
                start_byte: start,
                end_byte: end,
                part_size: end - start,
                status: PartStatus::Pending,
                etag: None,
                uploaded_bytes: 0,
                retry_count: 0,
                updated_at: now,
            })
            .collect::<Vec<_>>();

        self.store.insert_session(&session).await?;
        self.store.insert_parts(&parts).await?;

        info!("initialized session {session_id} for {local_path} ({total_parts} parts)");
        Ok(session_id)
    }

    /// `execute` (§4.5): runs the scheduler to completion (or pause /
    /// cancellation / failure), then acts on its verdict.
    pub async fn execute(&self, session_id: &str) -> EngineOutcome {
        let session = match self.store.get_session(session_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                return EngineOutcome::Error {
                    message: format!("no such session: {session_id}"),
                    recoverable: false,
                }
            }
            Err(e) => {
                return EngineOutcome::Error {
                    message: e.to_string(),
                    recoverable: e.recoverable(),
                }
            }
        };

        if session.status.is_terminal() {
            return EngineOutcome::Error {
                message: format!("session {session_id} is already {}", session.status),
                recoverable: false,
            };
        }

        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::InProgress, now())
            .await
        {
            return EngineOutcome::Error {
                message: e.to_string(),
                recoverable: e.recoverable(),
            };
        }

        // Stale `Uploading` rows left behind by a killed process or a
        // cancelled sibling task are reconciled here rather than only in
        // `recover()` (§4.3, §5): `claim_next_pending_part` only ever sees
        // `Pending` rows, so without this an interrupted part would never
        // be re-claimed and `complete` would later fail on a missing ETag.
        if let Err(e) = self.store.reset_uploading_parts(session_id).await {
            return EngineOutcome::Error {
                message: e.to_string(),
                recoverable: e.recoverable(),
            };
        }

        self.reset_flag(session_id).await;
        let cancel_flag = self.flag_for(session_id).await;

        let part_scheduler = PartScheduler::new(
            self.store.clone(),
            self.backend.clone(),
            self.config.clone(),
        );
        let verdict = part_scheduler.run(&session, cancel_flag.clone()).await;

        if cancel_flag.load(Ordering::SeqCst) {
            // `pause`/`cancel`/a constraint-violation stop raced with the
            // scheduler and won; the session's current status (set by
            // whichever of those set the flag) decides the outcome rather
            // than the scheduler's own verdict.
            return match self.store.get_session(session_id).await {
                Ok(Some(current)) if current.status == SessionStatus::Aborted => {
                    EngineOutcome::Cancelled {
                        session_id: session_id.to_string(),
                    }
                }
                Ok(Some(current)) => {
                    let uploaded = self
                        .store
                        .get_uploaded_parts_count(session_id)
                        .await
                        .unwrap_or(0);
                    EngineOutcome::Paused {
                        session_id: session_id.to_string(),
                        uploaded_parts: uploaded,
                        total_parts: current.total_parts,
                    }
                }
                _ => EngineOutcome::Cancelled {
                    session_id: session_id.to_string(),
                },
            };
        }

        match verdict {
            Ok(()) => self.complete(&session).await,
            Err(EngineError::Cancelled) => EngineOutcome::Cancelled {
                session_id: session_id.to_string(),
            },
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .store
                    .update_session_status_with_error(
                        session_id,
                        SessionStatus::Failed,
                        &message,
                        now(),
                    )
                    .await;
                warn!("session {session_id} failed: {message}");
                EngineOutcome::Error {
                    message,
                    recoverable: e.recoverable(),
                }
            }
        }
    }

    /// `pause` (§4.5): allowed only from {Pending, InProgress}.
    pub async fn pause(&self, session_id: &str) -> EngineResult<()> {
        let session = self.require_session(session_id).await?;
        if !matches!(session.status, SessionStatus::Pending | SessionStatus::InProgress) {
            return Err(EngineError::InvalidState(format!(
                "cannot pause session in state {}",
                session.status
            )));
        }
        self.trigger_cancel(session_id).await;
        self.store.reset_uploading_parts(session_id).await?;
        self.store
            .update_session_status(session_id, SessionStatus::Paused, now())
            .await?;
        Ok(())
    }

    /// `resume` (§4.5): allowed from {Pending, Paused, Failed,
    /// PausedConstraintViolation}; does not itself call `execute`.
    pub async fn resume(&self, session_id: &str) -> EngineResult<()> {
        let session = self.require_session(session_id).await?;
        if !matches!(
            session.status,
            SessionStatus::Pending
                | SessionStatus::Paused
                | SessionStatus::Failed
                | SessionStatus::PausedConstraintViolation
        ) {
            return Err(EngineError::InvalidState(format!(
                "cannot resume session in state {}",
                session.status
            )));
        }

        if tokio::fs::metadata(&session.local_path).await.is_err() {
            self.store
                .update_session_status_with_error(
                    session_id,
                    SessionStatus::Failed,
                    "source file no longer exists",
                    now(),
                )
                .await?;
            return Err(EngineError::InvalidState(
                "source file no longer exists".into(),
            ));
        }

        if session.status == SessionStatus::Failed {
            self.store.reset_failed_parts(session_id).await?;
        }
        if session.status == SessionStatus::PausedConstraintViolation {
            self.store.clear_constraint_violation(session_id, now()).await?;
        }

        self.store
            .update_session_status(session_id, SessionStatus::Pending, now())
            .await?;
        Ok(())
    }

    /// `cancel` (§4.5): allowed from any non-terminal status.
    pub async fn cancel(&self, session_id: &str) -> EngineResult<()> {
        let session = self.require_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "session {session_id} is already {}",
                session.status
            )));
        }

        self.trigger_cancel(session_id).await;

        if let (Some(upload_id), Some(file_path)) = (&session.upload_id, &session.remote_path) {
            if let Err(e) = self
                .backend
                .abort(&session.endpoints, AbortRequest { upload_id, file_path })
                .await
            {
                warn!("best-effort abort RPC for session {session_id} failed: {e}");
            }
        }

        self.store
            .update_session_status(session_id, SessionStatus::Aborted, now())
            .await?;
        Ok(())
    }

    /// `complete` (§4.5): called once the scheduler reports every part
    /// uploaded. Re-verifies that invariant rather than trusting the
    /// scheduler's return value, since parts could in principle have been
    /// raced into a different state by a concurrent pause/cancel.
    async fn complete(&self, session: &UploadSession) -> EngineOutcome {
        let session_id = &session.session_id;
        if let Err(e) = self
            .store
            .update_session_status(session_id, SessionStatus::Completing, now())
            .await
        {
            return EngineOutcome::Error {
                message: e.to_string(),
                recoverable: e.recoverable(),
            };
        }

        let uploaded = match self.store.get_uploaded_parts(session_id).await {
            Ok(parts) => parts,
            Err(e) => {
                return EngineOutcome::Error {
                    message: e.to_string(),
                    recoverable: e.recoverable(),
                }
            }
        };

        if uploaded.len() as u32 != session.total_parts || uploaded.iter().any(|p| p.etag.is_none()) {
            let message = "missing ETags".to_string();
            let _ = self
                .store
                .update_session_status_with_error(session_id, SessionStatus::Failed, &message, now())
                .await;
            return EngineOutcome::Error {
                message,
                recoverable: false,
            };
        }

        let completed_parts: Vec<CompletedPart> = uploaded
            .into_iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag.unwrap_or_default(),
            })
            .collect();

        let upload_id = match &session.upload_id {
            Some(id) => id.clone(),
            None => {
                return EngineOutcome::Error {
                    message: "session has no upload_id".into(),
                    recoverable: false,
                }
            }
        };
        let file_path = match &session.remote_path {
            Some(p) => p.clone(),
            None => {
                return EngineOutcome::Error {
                    message: "session has no remote file_path".into(),
                    recoverable: false,
                }
            }
        };

        match self
            .backend
            .complete(
                &session.endpoints,
                CompleteRequest {
                    upload_id: &upload_id,
                    file_path: &file_path,
                    parts: &completed_parts,
                },
            )
            .await
        {
            Ok(response) => {
                let remote_path = response.file_path.unwrap_or(file_path);
                let _ = self
                    .store
                    .update_session_remote_path(session_id, &remote_path, now())
                    .await;
                let _ = self
                    .store
                    .update_session_status(session_id, SessionStatus::Completed, now())
                    .await;
                info!("session {session_id} completed");
                EngineOutcome::Success {
                    session_id: session_id.clone(),
                    remote_path: Some(remote_path),
                    location: response.location,
                }
            }
            Err(e) => {
                let message = e.to_string();
                let _ = self
                    .store
                    .update_session_status_with_error(session_id, SessionStatus::Failed, &message, now())
                    .await;
                EngineOutcome::Error {
                    message,
                    recoverable: e.recoverable(),
                }
            }
        }
    }

    /// §4.6: called by the host when the external Scheduler reports a
    /// constraint-violation stop for `session_id`.
    pub async fn handle_constraint_violation(
        &self,
        session_id: &str,
        stop_reason_code: u32,
        reason: Option<String>,
    ) -> EngineResult<()> {
        let session = self.require_session(session_id).await?;
        if !matches!(session.status, SessionStatus::Pending | SessionStatus::InProgress) {
            return Ok(());
        }

        self.trigger_cancel(session_id).await;
        self.store.reset_uploading_parts(session_id).await?;

        let message = reason.unwrap_or_else(|| constraints::message_for_code(stop_reason_code).to_string());
        self.store
            .update_session_for_constraint_violation(session_id, &message, stop_reason_code, now())
            .await?;

        let constraints = ConstraintSet::from_blob(&session.constraints_blob);
        if constraints.auto_resume_when_satisfied {
            self.scheduler
                .schedule_resume(session_id, Some(constraints.clone()), constraints.auto_resume_delay_ms)
                .await;
        }
        Ok(())
    }

    /// `get_constraint_violated` (§4.5/§4.6).
    pub async fn get_constraint_violated(&self) -> EngineResult<Vec<UploadSession>> {
        let sessions = self.store.get_active_sessions().await?;
        Ok(sessions
            .into_iter()
            .filter(|s| s.status == SessionStatus::PausedConstraintViolation)
            .collect())
    }

    /// `resume_constraint_violated` (§4.5): clears the violation and
    /// resumes, without itself invoking `execute`.
    pub async fn resume_constraint_violated(&self, session_id: &str) -> EngineResult<()> {
        let session = self.require_session(session_id).await?;
        if session.status != SessionStatus::PausedConstraintViolation {
            return Err(EngineError::InvalidState(format!(
                "session {session_id} is not paused for a constraint violation (is {})",
                session.status
            )));
        }
        self.resume(session_id).await
    }

    /// `update_constraints` (§4.6): replaces the default constraints used
    /// for new sessions and optionally re-applies to every non-terminal
    /// existing session.
    pub async fn update_constraints(
        &self,
        new: ConstraintSet,
        apply_to_existing: bool,
    ) -> EngineResult<()> {
        if !apply_to_existing {
            return Ok(());
        }

        let blob = new.to_blob();
        let sessions = self.store.get_active_sessions().await?;
        for session in sessions {
            if !matches!(
                session.status,
                SessionStatus::Pending
                    | SessionStatus::InProgress
                    | SessionStatus::Paused
                    | SessionStatus::PausedConstraintViolation
            ) {
                continue;
            }

            self.store
                .update_session_constraints(&session.session_id, &blob, now())
                .await?;

            if session.status == SessionStatus::InProgress {
                self.trigger_cancel(&session.session_id).await;
                self.store.reset_uploading_parts(&session.session_id).await?;
                self.store
                    .update_session_status(&session.session_id, SessionStatus::Paused, now())
                    .await?;
            }

            self.scheduler
                .schedule_resume(&session.session_id, Some(new.clone()), 0)
                .await;
        }
        Ok(())
    }

    /// `cleanup_old` (§4.5): deletes sessions terminal for longer than
    /// `older_than_ms`.
    pub async fn cleanup_old(&self, older_than_ms: i64) -> EngineResult<usize> {
        let before_ts = now() - older_than_ms / 1000;
        self.store.delete_old_completed_sessions(before_ts).await
    }

    pub fn observe_progress(
        &self,
        session_id: &str,
    ) -> Pin<Box<dyn Stream<Item = Progress> + Send>> {
        use tokio_stream::StreamExt as _;
        let mut inner = self.store.observe_session_with_parts(session_id);
        Box::pin(async_stream::stream! {
            while let Some((session, parts)) = inner.next().await {
                yield Progress::from_snapshot(&session, &parts);
            }
        })
    }

    pub fn observe_all(&self) -> Pin<Box<dyn Stream<Item = Vec<Progress>> + Send>> {
        use tokio_stream::StreamExt as _;
        let mut inner = self.store.observe_active_sessions_with_parts();
        Box::pin(async_stream::stream! {
            while let Some(snapshots) = inner.next().await {
                yield snapshots
                    .iter()
                    .map(|(session, parts)| Progress::from_snapshot(session, parts))
                    .collect::<Vec<_>>();
            }
        })
    }

    async fn require_session(&self, session_id: &str) -> EngineResult<UploadSession> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(session_id.to_string()))
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn backend(&self) -> &Arc<dyn BackendClient> {
        &self.backend
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        CompleteResponse, PresignPartRequest, PresignPartResponse,
    };
    use crate::collaborators::NoopScheduler;
    use crate::error::EngineResult as Result_;
    use crate::store::TursoStore;
    use std::collections::HashMap as Map;
    use std::sync::atomic::AtomicU32;
    use tokio::io::AsyncWriteExt;

    struct FakeBackend {
        forbidden_part: Option<u32>,
        complete_calls: AtomicU32,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                forbidden_part: None,
                complete_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl BackendClient for FakeBackend {
        async fn initiate(
            &self,
            _endpoints: &Endpoints,
            request: InitiateRequest<'_>,
        ) -> Result_<crate::backend::InitiateResponse> {
            Ok(crate::backend::InitiateResponse {
                upload_id: format!("upload-for-{}", request.file_name),
                file_path: format!("key-for-{}", request.file_name),
                key: None,
                bucket: None,
            })
        }

        async fn presign_part(
            &self,
            _endpoints: &Endpoints,
            request: PresignPartRequest<'_>,
        ) -> Result_<PresignPartResponse> {
            if self.forbidden_part == Some(request.part_number) {
                return Err(EngineError::HttpClient {
                    status: 403,
                    message: "forbidden".into(),
                });
            }
            Ok(PresignPartResponse {
                presigned_url: format!("https://store.example/{}", request.part_number),
                part_number: request.part_number,
                headers: Map::new(),
            })
        }

        async fn put_part(
            &self,
            _url: &str,
            _headers: &Map<String, String>,
            _content_type: &str,
            _body: Vec<u8>,
        ) -> Result_<String> {
            Ok("etag-1".into())
        }

        async fn complete(
            &self,
            _endpoints: &Endpoints,
            _request: CompleteRequest<'_>,
        ) -> Result_<CompleteResponse> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompleteResponse {
                file_path: Some("bucket/key".into()),
                location: Some("https://store.example/bucket/key".into()),
                etag: None,
            })
        }

        async fn abort(&self, _endpoints: &Endpoints, _request: AbortRequest<'_>) -> Result_<()> {
            Ok(())
        }
    }

    async fn temp_file(bytes: usize) -> String {
        let path = std::env::temp_dir().join(format!("engine-test-{}", uuid::Uuid::new_v4()));
        let mut f = tokio::fs::File::create(&path).await.unwrap();
        f.write_all(&vec![3u8; bytes]).await.unwrap();
        path.to_str().unwrap().to_string()
    }

    fn endpoints() -> Endpoints {
        Endpoints {
            initiate: "x".into(),
            presign_part: "x".into(),
            complete: "x".into(),
            abort: "x".into(),
        }
    }

    async fn engine(backend: FakeBackend) -> SessionEngine {
        let store: Arc<dyn Store> = Arc::new(TursoStore::open(":memory:").await.unwrap());
        SessionEngine::new(
            store,
            Arc::new(backend),
            Arc::new(NoopScheduler) as Arc<dyn Scheduler>,
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn start_initializes_executes_and_completes() {
        let path = temp_file(12 * 1024 * 1024).await;
        let engine = engine(FakeBackend::new()).await;

        let outcome = engine.start(&path, endpoints(), None).await;
        match outcome {
            EngineOutcome::Success { remote_path, .. } => {
                assert_eq!(remote_path.as_deref(), Some("bucket/key"));
            }
            other => panic!("expected Success, got {other:?}"),
        }

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn start_is_idempotent_for_an_in_flight_session() {
        let path = temp_file(12 * 1024 * 1024).await;
        let engine = engine(FakeBackend::new()).await;

        let session_id = engine.initialize(&path, endpoints(), ConstraintSet::default()).await.unwrap();
        engine
            .store()
            .update_session_status(&session_id, SessionStatus::Paused, now())
            .await
            .unwrap();

        let outcome = engine.start(&path, endpoints(), None).await;
        match outcome {
            EngineOutcome::Success { session_id: resumed, .. } => {
                assert_eq!(resumed, session_id);
            }
            other => panic!("expected Success resuming the same session, got {other:?}"),
        }

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn initialize_rejects_empty_files() {
        let path = temp_file(0).await;
        let engine = engine(FakeBackend::new()).await;

        let err = engine
            .initialize(&path, endpoints(), ConstraintSet::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn a_non_recoverable_part_error_fails_the_session() {
        let path = temp_file(5 * 1024 * 1024).await;
        let mut backend = FakeBackend::new();
        backend.forbidden_part = Some(1);
        let engine = engine(backend).await;

        let outcome = engine.start(&path, endpoints(), None).await;
        match outcome {
            EngineOutcome::Error { recoverable, .. } => assert!(!recoverable),
            other => panic!("expected Error, got {other:?}"),
        }

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn pause_then_resume_round_trips_through_pending_parts() {
        let path = temp_file(12 * 1024 * 1024).await;
        let engine = engine(FakeBackend::new()).await;

        let session_id = engine.initialize(&path, endpoints(), ConstraintSet::default()).await.unwrap();
        engine
            .store()
            .update_session_status(&session_id, SessionStatus::InProgress, now())
            .await
            .unwrap();
        let part = engine
            .store()
            .claim_next_pending_part(&session_id)
            .await
            .unwrap()
            .unwrap();

        engine.pause(&session_id).await.unwrap();

        let session = engine.store().get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        let parts = engine.store().get_all_parts(&session_id).await.unwrap();
        assert!(parts.iter().find(|p| p.part_id == part.part_id).unwrap().status == PartStatus::Pending);

        engine.resume(&session_id).await.unwrap();
        let session = engine.store().get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn cancel_aborts_and_marks_session_terminal() {
        let path = temp_file(5 * 1024 * 1024).await;
        let engine = engine(FakeBackend::new()).await;

        let session_id = engine.initialize(&path, endpoints(), ConstraintSet::default()).await.unwrap();
        engine.cancel(&session_id).await.unwrap();

        let session = engine.store().get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Aborted);
        assert!(engine.cancel(&session_id).await.is_err());

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn constraint_violation_pauses_and_schedules_auto_resume() {
        let path = temp_file(5 * 1024 * 1024).await;
        let engine = engine(FakeBackend::new()).await;

        let session_id = engine.initialize(&path, endpoints(), ConstraintSet::default()).await.unwrap();
        engine
            .store()
            .update_session_status(&session_id, SessionStatus::InProgress, now())
            .await
            .unwrap();

        engine
            .handle_constraint_violation(&session_id, 3, None)
            .await
            .unwrap();

        let session = engine.store().get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::PausedConstraintViolation);
        assert_eq!(session.pause_reason.as_deref(), Some("Battery low"));

        let violated = engine.get_constraint_violated().await.unwrap();
        assert_eq!(violated.len(), 1);
        assert_eq!(violated[0].session_id, session_id);

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn cleanup_old_deletes_only_terminal_sessions_past_the_threshold() {
        let path = temp_file(5 * 1024 * 1024).await;
        let engine = engine(FakeBackend::new()).await;

        let session_id = engine.initialize(&path, endpoints(), ConstraintSet::default()).await.unwrap();
        engine.cancel(&session_id).await.unwrap();

        // Negative threshold pushes the cutoff a few seconds into the
        // future so this doesn't race the session's own `updated_at`
        // timestamp, which shares the same one-second resolution.
        let deleted = engine.cleanup_old(-5_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(engine.store().get_session(&session_id).await.unwrap().is_none());

        tokio::fs::remove_file(&path).await.ok();
    }
}
