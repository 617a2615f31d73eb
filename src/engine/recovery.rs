//! Recovery (§4.7): reconciles sessions left mid-flight by a crash.

use log::{info, warn};

use super::SessionEngine;
use crate::error::EngineResult;
use crate::model::SessionStatus;

/// Runs the four-step procedure from spec.md over every session
/// `get_recoverable_sessions()` returns, and returns the ids it
/// successfully prepared for a subsequent `resume`.
pub async fn recover(engine: &SessionEngine) -> EngineResult<Vec<String>> {
    let sessions = engine.store().get_recoverable_sessions().await?;
    let mut prepared = Vec::new();

    for session in sessions {
        let session_id = session.session_id.clone();

        // 1. Reset parts mid-flight at the time of the crash.
        engine.store().reset_uploading_parts(&session_id).await?;

        // 2. The local file may have been moved or deleted while the
        // process was down.
        if tokio::fs::metadata(&session.local_path).await.is_err() {
            engine
                .store()
                .update_session_status_with_error(
                    &session_id,
                    SessionStatus::Failed,
                    "source file no longer exists",
                    now(),
                )
                .await?;
            warn!("session {session_id} failed recovery: source file missing");
            continue;
        }

        // 3. Normalise status so an explicit resume is always required;
        // manual recovery overrides any standing constraint violation.
        match session.status {
            SessionStatus::InProgress | SessionStatus::Pending => {
                engine
                    .store()
                    .update_session_status(&session_id, SessionStatus::Paused, now())
                    .await?;
            }
            SessionStatus::PausedConstraintViolation => {
                engine.store().clear_constraint_violation(&session_id, now()).await?;
                engine
                    .store()
                    .update_session_status(&session_id, SessionStatus::Paused, now())
                    .await?;
            }
            _ => {}
        }

        // 4. Hand back to `resume`, which validates state transitions and
        // resets Failed parts / clears constraint fields as needed.
        engine.resume(&session_id).await?;
        info!("recovered session {session_id}");
        prepared.push(session_id);
    }

    Ok(prepared)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AbortRequest, BackendClient, CompleteRequest, CompleteResponse, InitiateRequest,
        InitiateResponse, PresignPartRequest, PresignPartResponse,
    };
    use crate::collaborators::{NoopScheduler, Scheduler};
    use crate::config::EngineConfig;
    use crate::constraints::ConstraintSet;
    use crate::error::EngineResult as Result_;
    use crate::model::{Endpoints, PartStatus};
    use crate::store::{Store, TursoStore};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::io::AsyncWriteExt;

    struct NeverCalledBackend;

    #[async_trait]
    impl BackendClient for NeverCalledBackend {
        async fn initiate(
            &self,
            _endpoints: &Endpoints,
            _request: InitiateRequest<'_>,
        ) -> Result_<InitiateResponse> {
            unimplemented!()
        }
        async fn presign_part(
            &self,
            _endpoints: &Endpoints,
            _request: PresignPartRequest<'_>,
        ) -> Result_<PresignPartResponse> {
            unimplemented!()
        }
        async fn put_part(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
            _content_type: &str,
            _body: Vec<u8>,
        ) -> Result_<String> {
            unimplemented!()
        }
        async fn complete(
            &self,
            _endpoints: &Endpoints,
            _request: CompleteRequest<'_>,
        ) -> Result_<CompleteResponse> {
            unimplemented!()
        }
        async fn abort(&self, _endpoints: &Endpoints, _request: AbortRequest<'_>) -> Result_<()> {
            Ok(())
        }
    }

    async fn engine_with_session(
        local_path: String,
        status: SessionStatus,
    ) -> (SessionEngine, String) {
        let store: Arc<dyn Store> = Arc::new(TursoStore::open(":memory:").await.unwrap());
        let session_id = "recover-1".to_string();
        let now_ts = now();
        let session = crate::model::UploadSession {
            session_id: session_id.clone(),
            upload_id: Some("U1".into()),
            local_path,
            remote_path: None,
            file_name: "f.bin".into(),
            content_type: "application/octet-stream".into(),
            total_size: 5 * 1024 * 1024,
            chunk_size: 5 * 1024 * 1024,
            total_parts: 1,
            status,
            endpoints: Endpoints {
                initiate: "x".into(),
                presign_part: "x".into(),
                complete: "x".into(),
                abort: "x".into(),
            },
            max_retries: 3,
            created_at: now_ts,
            updated_at: now_ts,
            error_message: None,
            constraints_blob: ConstraintSet::default().to_blob(),
            pause_reason: None,
            constraint_violated_at: None,
            stop_reason_code: None,
        };
        let part = crate::model::UploadPart {
            part_id: "recover-1:1".into(),
            session_id: session_id.clone(),
            part_number: 1,
            start_byte: 0,
            end_byte: 5 * 1024 * 1024,
            part_size: 5 * 1024 * 1024,
            status: PartStatus::Uploading,
            etag: None,
            uploaded_bytes: 0,
            retry_count: 0,
            updated_at: now_ts,
        };
        store.insert_session(&session).await.unwrap();
        store.insert_parts(&[part]).await.unwrap();

        let engine = SessionEngine::new(
            store,
            Arc::new(NeverCalledBackend),
            Arc::new(NoopScheduler) as Arc<dyn Scheduler>,
            EngineConfig::default(),
        );
        (engine, session_id)
    }

    #[tokio::test]
    async fn resets_uploading_parts_and_pauses_in_progress_sessions() {
        let path = std::env::temp_dir().join(format!("recovery-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::File::create(&path)
            .await
            .unwrap()
            .write_all(&[0u8; 16])
            .await
            .unwrap();
        let (engine, session_id) =
            engine_with_session(path.to_str().unwrap().to_string(), SessionStatus::InProgress).await;

        let prepared = recover(&engine).await.unwrap();
        assert_eq!(prepared, vec![session_id.clone()]);

        let session = engine.store().get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Pending);

        let parts = engine.store().get_all_parts(&session_id).await.unwrap();
        assert_eq!(parts[0].status, PartStatus::Pending);

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn fails_sessions_whose_source_file_is_gone() {
        let missing_path = std::env::temp_dir().join(format!("gone-{}", uuid::Uuid::new_v4()));
        let (engine, session_id) = engine_with_session(
            missing_path.to_str().unwrap().to_string(),
            SessionStatus::InProgress,
        )
        .await;

        let prepared = recover(&engine).await.unwrap();
        assert!(prepared.is_empty());

        let session = engine.store().get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
    }
}
