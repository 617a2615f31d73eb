//! Part Scheduler (§4.3): bounded-concurrency execution of an upload
//! session's remaining parts.
//!
//! Generalizes the teacher's "slice the part list up front, spawn
//! `CONCURRENCY` tasks behind a `Semaphore`" loop (`upload.rs::
//! upload_multipart`) into a claim loop: rather than knowing all pending
//! part numbers ahead of time, each task asks the store for the next
//! `Pending` part (§3 invariant 6), which is what makes this resumable
//! after a crash without re-deriving "which parts are left" by hand.
//! Cancellation uses the same `Arc<AtomicBool>` flag convention as
//! `move_transfer/worker.rs` and `download/worker.rs`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::Semaphore;

use crate::backend::{BackendClient, PresignPartRequest};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{PartStatus, UploadPart, UploadSession};
use crate::retry;
use crate::store::Store;

pub struct PartScheduler {
    store: Arc<dyn Store>,
    backend: Arc<dyn BackendClient>,
    config: EngineConfig,
}

impl PartScheduler {
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn BackendClient>, config: EngineConfig) -> Self {
        Self {
            store,
            backend,
            config,
        }
    }

    /// Drains every `Pending` part of `session` with at most
    /// `config.max_concurrent_parts` uploads in flight, returning the
    /// first unrecoverable error encountered, if any. A cancelled run
    /// stops claiming new parts but lets already-spawned uploads finish
    /// or fail on their own, matching the teacher's cooperative-cancel
    /// contract (uploads in flight are not torn down mid-request).
    pub async fn run(&self, session: &UploadSession, cancel_flag: Arc<AtomicBool>) -> EngineResult<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_parts));
        let mut handles = Vec::new();

        loop {
            if cancel_flag.load(Ordering::SeqCst) {
                break;
            }
            let part = match self.store.claim_next_pending_part(&session.session_id).await? {
                Some(part) => part,
                None => break,
            };
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Internal("part semaphore closed".into()))?;

            let store = self.store.clone();
            let backend = self.backend.clone();
            let config = self.config.clone();
            let session = session.clone();
            let cancel_flag = cancel_flag.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                upload_part_with_retry(&store, &backend, &config, &session, part, &cancel_flag).await
            });
            handles.push(handle);
        }

        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(EngineError::Internal(format!(
                            "part upload task panicked: {join_err}"
                        )));
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn upload_part_with_retry(
    store: &Arc<dyn Store>,
    backend: &Arc<dyn BackendClient>,
    config: &EngineConfig,
    session: &UploadSession,
    part: UploadPart,
    cancel_flag: &Arc<AtomicBool>,
) -> EngineResult<()> {
    let mut retry_count = part.retry_count;
    loop {
        if cancel_flag.load(Ordering::SeqCst) {
            // Not yet in flight — reset this claimed part back to Pending
            // ourselves rather than relying solely on the session-wide
            // `reset_uploading_parts` a racing pause/cancel/constraint-stop
            // already issued (§4.3: "any permit-waiting task that wakes up
            // to find a terminal signal must reset its claimed part").
            store
                .update_part_status(&part.part_id, PartStatus::Pending, None, 0, now())
                .await?;
            return Err(EngineError::Cancelled);
        }

        match upload_part_once(backend, session, &part).await {
            Ok(etag) => {
                store
                    .update_part_status(
                        &part.part_id,
                        PartStatus::Uploaded,
                        Some(etag),
                        part.part_size,
                        now(),
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => {
                if retry::should_retry(&e, retry_count, config.max_retries) {
                    warn!(
                        "part {} of session {} failed (attempt {}): {e}; retrying",
                        part.part_number, session.session_id, retry_count + 1
                    );
                    store.increment_part_retry(&part.part_id, now()).await?;
                    retry_count += 1;
                    tokio::time::sleep(retry::delay_for(retry_count, config)).await;
                    continue;
                }
                store.fail_part(&part.part_id, now()).await?;
                return Err(e);
            }
        }
    }
}

async fn upload_part_once(
    backend: &Arc<dyn BackendClient>,
    session: &UploadSession,
    part: &UploadPart,
) -> EngineResult<String> {
    let upload_id = session
        .upload_id
        .as_deref()
        .ok_or_else(|| EngineError::InvalidState("session has no upload_id".into()))?;
    let file_path = session
        .remote_path
        .as_deref()
        .ok_or_else(|| EngineError::InvalidState("session has no remote file_path".into()))?;

    let mut file = File::open(&session.local_path).await?;
    file.seek(SeekFrom::Start(part.start_byte)).await?;
    let mut buffer = vec![0u8; part.part_size as usize];
    file.read_exact(&mut buffer).await?;

    let presigned = backend
        .presign_part(
            &session.endpoints,
            PresignPartRequest {
                upload_id,
                file_path,
                part_number: part.part_number,
            },
        )
        .await?;

    debug!(
        "uploading part {} of session {} ({} bytes)",
        part.part_number, session.session_id, part.part_size
    );

    backend
        .put_part(
            &presigned.presigned_url,
            &presigned.headers,
            &session.content_type,
            buffer,
        )
        .await
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        AbortRequest, CompleteRequest, CompleteResponse, InitiateRequest, InitiateResponse,
    };
    use crate::ids::part_id;
    use crate::model::{part_ranges, Endpoints, SessionStatus};
    use crate::store::TursoStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use tokio::io::AsyncWriteExt;

    struct FlakyBackend {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl BackendClient for FlakyBackend {
        async fn initiate(
            &self,
            _endpoints: &Endpoints,
            _request: InitiateRequest<'_>,
        ) -> EngineResult<InitiateResponse> {
            unimplemented!("not exercised by the scheduler")
        }

        async fn presign_part(
            &self,
            _endpoints: &Endpoints,
            request: PresignPartRequest<'_>,
        ) -> EngineResult<crate::backend::PresignPartResponse> {
            Ok(crate::backend::PresignPartResponse {
                presigned_url: format!("https://store.example/part/{}", request.part_number),
                part_number: request.part_number,
                headers: HashMap::new(),
            })
        }

        async fn put_part(
            &self,
            _url: &str,
            _headers: &HashMap<String, String>,
            _content_type: &str,
            _body: Vec<u8>,
        ) -> EngineResult<String> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::Transport("connection reset".into()));
            }
            Ok("etag-ok".into())
        }

        async fn complete(
            &self,
            _endpoints: &Endpoints,
            _request: CompleteRequest<'_>,
        ) -> EngineResult<CompleteResponse> {
            unimplemented!("not exercised by the scheduler")
        }

        async fn abort(&self, _endpoints: &Endpoints, _request: AbortRequest<'_>) -> EngineResult<()> {
            unimplemented!("not exercised by the scheduler")
        }
    }

    async fn write_temp_file(bytes: &[u8]) -> String {
        let path = std::env::temp_dir().join(format!("scheduler-test-{}", uuid::Uuid::new_v4()));
        let mut f = tokio::fs::File::create(&path).await.unwrap();
        f.write_all(bytes).await.unwrap();
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

    async fn seeded_session(store: &TursoStore, local_path: String, size: u64, chunk: u64) -> UploadSession {
        let session = UploadSession {
            session_id: "sched1".into(),
            upload_id: Some("U1".into()),
            local_path,
            remote_path: Some("bucket/sched1-key".into()),
            file_name: "f.bin".into(),
            content_type: "application/octet-stream".into(),
            total_size: size,
            chunk_size: chunk,
            total_parts: part_ranges(size, chunk).len() as u32,
            status: SessionStatus::InProgress,
            endpoints: endpoints(),
            max_retries: 3,
            created_at: 0,
            updated_at: 0,
            error_message: None,
            constraints_blob: "{}".into(),
            pause_reason: None,
            constraint_violated_at: None,
            stop_reason_code: None,
        };
        let parts: Vec<UploadPart> = part_ranges(size, chunk)
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| UploadPart {
                part_id: part_id(&session.session_id, (i + 1) as u32),
                session_id: session.session_id.clone(),
                part_number: (i + 1) as u32,
                start_byte: start,
                end_byte: end,
                part_size: end - start,
                status: PartStatus::Pending,
                etag: None,
                uploaded_bytes: 0,
                retry_count: 0,
                updated_at: 0,
            })
            .collect();
        store.insert_session(&session).await.unwrap();
        store.insert_parts(&parts).await.unwrap();
        session
    }

    #[tokio::test]
    async fn uploads_every_pending_part() {
        let local_path = write_temp_file(&vec![7u8; 12 * 1024 * 1024]).await;
        let concrete = TursoStore::open(":memory:").await.unwrap();
        let session = seeded_session(&concrete, local_path.clone(), 12 * 1024 * 1024, 5 * 1024 * 1024).await;
        let store: Arc<dyn Store> = Arc::new(concrete);
        let backend: Arc<dyn BackendClient> = Arc::new(FlakyBackend {
            fail_times: AtomicU32::new(0),
        });
        let config = EngineConfig::default();
        let scheduler = PartScheduler::new(store.clone(), backend, config);

        scheduler
            .run(&session, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        let parts = store.get_all_parts(&session.session_id).await.unwrap();
        assert!(parts.iter().all(|p| p.status == PartStatus::Uploaded));

        tokio::fs::remove_file(&local_path).await.ok();
    }

    #[tokio::test]
    async fn retries_transient_failures_before_succeeding() {
        let local_path = write_temp_file(&vec![9u8; 5 * 1024 * 1024]).await;
        let concrete = TursoStore::open(":memory:").await.unwrap();
        let session = seeded_session(&concrete, local_path.clone(), 5 * 1024 * 1024, 5 * 1024 * 1024).await;
        let store: Arc<dyn Store> = Arc::new(concrete);
        let backend: Arc<dyn BackendClient> = Arc::new(FlakyBackend {
            fail_times: AtomicU32::new(2),
        });
        let mut config = EngineConfig::default();
        config.retry_delay_ms = 1;
        let scheduler = PartScheduler::new(store.clone(), backend, config);

        scheduler
            .run(&session, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        let parts = store.get_all_parts(&session.session_id).await.unwrap();
        assert_eq!(parts[0].status, PartStatus::Uploaded);
        assert_eq!(parts[0].retry_count, 2);

        tokio::fs::remove_file(&local_path).await.ok();
    }

    #[tokio::test]
    async fn fails_part_once_retry_budget_is_exhausted() {
        let local_path = write_temp_file(&vec![1u8; 5 * 1024 * 1024]).await;
        let concrete = TursoStore::open(":memory:").await.unwrap();
        let session = seeded_session(&concrete, local_path.clone(), 5 * 1024 * 1024, 5 * 1024 * 1024).await;
        let store: Arc<dyn Store> = Arc::new(concrete);
        let backend: Arc<dyn BackendClient> = Arc::new(FlakyBackend {
            fail_times: AtomicU32::new(u32::MAX / 2),
        });
        let mut config = EngineConfig::default();
        config.max_retries = 2;
        config.retry_delay_ms = 1;
        let scheduler = PartScheduler::new(store.clone(), backend, config);

        let result = scheduler.run(&session, Arc::new(AtomicBool::new(false))).await;
        assert!(result.is_err());

        let parts = store.get_all_parts(&session.session_id).await.unwrap();
        assert_eq!(parts[0].status, PartStatus::Failed);

        tokio::fs::remove_file(&local_path).await.ok();
    }

    #[tokio::test]
    async fn a_claimed_part_is_reset_to_pending_when_cancelled_before_upload() {
        let local_path = write_temp_file(&vec![2u8; 5 * 1024 * 1024]).await;
        let concrete = TursoStore::open(":memory:").await.unwrap();
        let session = seeded_session(&concrete, local_path.clone(), 5 * 1024 * 1024, 5 * 1024 * 1024).await;
        let store: Arc<dyn Store> = Arc::new(concrete);
        let backend: Arc<dyn BackendClient> = Arc::new(FlakyBackend {
            fail_times: AtomicU32::new(0),
        });
        let config = EngineConfig::default();

        let part = store
            .claim_next_pending_part(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(part.status, PartStatus::Uploading);

        let cancel_flag = Arc::new(AtomicBool::new(true));
        let result = upload_part_with_retry(&store, &backend, &config, &session, part.clone(), &cancel_flag).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));

        let parts = store.get_all_parts(&session.session_id).await.unwrap();
        assert_eq!(parts[0].status, PartStatus::Pending);
        assert!(parts[0].etag.is_none());

        tokio::fs::remove_file(&local_path).await.ok();
    }
}
