//! turso-backed implementation of [`Store`].
//!
//! Grounded directly on `dickwu-r2/src-tauri/src/db/mod.rs` and
//! `db/sessions.rs`: a single `turso::Connection` behind a
//! `tokio::sync::Mutex` (the teacher's own comment notes turso's page
//! cache races under concurrent access). That same mutex guard is reused
//! here as the proof of §3 invariant 6 — `claim_next_pending_part` holds
//! it across the `SELECT` and the conditional `UPDATE`, so no other task
//! can observe the claimed row in between; there is no second connection
//! to race with.
//!
//! Unlike the teacher, which stashes its connection in a
//! `static OnceLock`, this store is explicitly constructed and owns its
//! connection directly — per §9's redesign note preferring explicit
//! construction over global singletons in a library.

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use turso::{Builder, Connection};

use crate::error::{EngineError, EngineResult};
use crate::model::{Endpoints, PartStatus, SessionStatus, UploadPart, UploadSession};

use super::{ActiveSnapshotsStream, SessionSnapshot, SnapshotStream, Store};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS upload_sessions (
    session_id TEXT PRIMARY KEY,
    upload_id TEXT,
    local_path TEXT NOT NULL,
    remote_path TEXT,
    file_name TEXT NOT NULL,
    content_type TEXT NOT NULL,
    total_size INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    total_parts INTEGER NOT NULL,
    status TEXT NOT NULL,
    endpoint_initiate TEXT NOT NULL,
    endpoint_presign TEXT NOT NULL,
    endpoint_complete TEXT NOT NULL,
    endpoint_abort TEXT NOT NULL,
    max_retries INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    error_message TEXT,
    constraints_blob TEXT NOT NULL,
    pause_reason TEXT,
    constraint_violated_at INTEGER,
    stop_reason_code INTEGER
);

CREATE INDEX IF NOT EXISTS idx_sessions_status ON upload_sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_local_path ON upload_sessions(local_path);

CREATE TABLE IF NOT EXISTS upload_parts (
    part_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES upload_sessions(session_id) ON DELETE CASCADE,
    part_number INTEGER NOT NULL,
    start_byte INTEGER NOT NULL,
    end_byte INTEGER NOT NULL,
    part_size INTEGER NOT NULL,
    status TEXT NOT NULL,
    etag TEXT,
    uploaded_bytes INTEGER NOT NULL,
    retry_count INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(session_id, part_number)
);

CREATE INDEX IF NOT EXISTS idx_parts_session ON upload_parts(session_id);
";

pub struct TursoStore {
    conn: Arc<Mutex<Connection>>,
    // Bumped on every write; observation streams wake on change and
    // re-read a fresh snapshot. Mirrors the teacher's event-emission
    // style (`app.emit("upload-progress", ...)`) but as a pull-based
    // lazy sequence instead of a push to a GUI, per §4.1's "lazy,
    // restartable sequence" requirement — grounded on `async-stream`'s
    // use for the same role in `dog-blob`/`dog-queue`.
    notify: watch::Sender<u64>,
}

impl TursoStore {
    pub async fn open(path: &str) -> EngineResult<Self> {
        let db = Builder::new_local(path)
            .build()
            .await
            .map_err(EngineError::from)?;
        let conn = db.connect().map_err(EngineError::from)?;
        conn.execute("PRAGMA foreign_keys = ON;", ())
            .await
            .map_err(EngineError::from)?;
        conn.execute_batch(SCHEMA_SQL)
            .await
            .map_err(EngineError::from)?;
        let (notify, _) = watch::channel(0u64);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify,
        })
    }

    fn bump(&self) {
        self.notify.send_modify(|rev| *rev = rev.wrapping_add(1));
    }

    fn row_to_session(row: &turso::Row) -> EngineResult<UploadSession> {
        let status_str: String = row.get(9)?;
        Ok(UploadSession {
            session_id: row.get(0)?,
            upload_id: row.get(1)?,
            local_path: row.get(2)?,
            remote_path: row.get(3)?,
            file_name: row.get(4)?,
            content_type: row.get(5)?,
            total_size: row.get::<i64>(6)? as u64,
            chunk_size: row.get::<i64>(7)? as u64,
            total_parts: row.get::<i64>(8)? as u32,
            status: status_str.parse()?,
            endpoints: Endpoints {
                initiate: row.get(10)?,
                presign_part: row.get(11)?,
                complete: row.get(12)?,
                abort: row.get(13)?,
            },
            max_retries: row.get::<i64>(14)? as u32,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            error_message: row.get(17)?,
            constraints_blob: row.get(18)?,
            pause_reason: row.get(19)?,
            constraint_violated_at: row.get(20)?,
            stop_reason_code: row.get::<Option<i64>>(21)?.map(|v| v as u32),
        })
    }

    fn row_to_part(row: &turso::Row) -> EngineResult<UploadPart> {
        let status_str: String = row.get(6)?;
        Ok(UploadPart {
            part_id: row.get(0)?,
            session_id: row.get(1)?,
            part_number: row.get::<i64>(2)? as u32,
            start_byte: row.get::<i64>(3)? as u64,
            end_byte: row.get::<i64>(4)? as u64,
            part_size: row.get::<i64>(5)? as u64,
            status: status_str.parse()?,
            etag: row.get(7)?,
            uploaded_bytes: row.get::<i64>(8)? as u64,
            retry_count: row.get::<i64>(9)? as u32,
            updated_at: row.get(10)?,
        })
    }

    const SESSION_COLUMNS: &'static str = "session_id, upload_id, local_path, remote_path, \
        file_name, content_type, total_size, chunk_size, total_parts, status, \
        endpoint_initiate, endpoint_presign, endpoint_complete, endpoint_abort, \
        max_retries, created_at, updated_at, error_message, constraints_blob, \
        pause_reason, constraint_violated_at, stop_reason_code";

    const PART_COLUMNS: &'static str = "part_id, session_id, part_number, start_byte, \
        end_byte, part_size, status, etag, uploaded_bytes, retry_count, updated_at";

    async fn fetch_parts(&self, session_id: &str) -> EngineResult<Vec<UploadPart>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM upload_parts WHERE session_id = ?1 ORDER BY part_number",
            Self::PART_COLUMNS
        );
        let mut rows = conn.query(&sql, turso::params![session_id]).await?;
        let mut parts = Vec::new();
        while let Some(row) = rows.next().await? {
            parts.push(Self::row_to_part(&row)?);
        }
        Ok(parts)
    }
}

#[async_trait]
impl Store for TursoStore {
    async fn insert_session(&self, session: &UploadSession) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "INSERT INTO upload_sessions ({}) VALUES \
             (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
            Self::SESSION_COLUMNS
        );
        conn.execute(
            &sql,
            turso::params![
                session.session_id.clone(),
                session.upload_id.clone(),
                session.local_path.clone(),
                session.remote_path.clone(),
                session.file_name.clone(),
                session.content_type.clone(),
                session.total_size as i64,
                session.chunk_size as i64,
                session.total_parts as i64,
                session.status.to_string(),
                session.endpoints.initiate.clone(),
                session.endpoints.presign_part.clone(),
                session.endpoints.complete.clone(),
                session.endpoints.abort.clone(),
                session.max_retries as i64,
                session.created_at,
                session.updated_at,
                session.error_message.clone(),
                session.constraints_blob.clone(),
                session.pause_reason.clone(),
                session.constraint_violated_at,
                session.stop_reason_code.map(|v| v as i64),
            ],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn insert_parts(&self, parts: &[UploadPart]) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "INSERT INTO upload_parts ({}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            Self::PART_COLUMNS
        );
        for part in parts {
            conn.execute(
                &sql,
                turso::params![
                    part.part_id.clone(),
                    part.session_id.clone(),
                    part.part_number as i64,
                    part.start_byte as i64,
                    part.end_byte as i64,
                    part.part_size as i64,
                    part.status.to_string(),
                    part.etag.clone(),
                    part.uploaded_bytes as i64,
                    part.retry_count as i64,
                    part.updated_at,
                ],
            )
            .await?;
        }
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> EngineResult<Option<UploadSession>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE session_id = ?1",
            Self::SESSION_COLUMNS
        );
        let mut rows = conn.query(&sql, turso::params![session_id]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_session_with_parts(
        &self,
        session_id: &str,
    ) -> EngineResult<Option<SessionSnapshot>> {
        let session = match self.get_session(session_id).await? {
            Some(s) => s,
            None => return Ok(None),
        };
        let parts = self.fetch_parts(session_id).await?;
        Ok(Some((session, parts)))
    }

    async fn find_active_session_for_path(
        &self,
        local_path: &str,
    ) -> EngineResult<Option<UploadSession>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE local_path = ?1 \
             AND status NOT IN ('completed','aborted','failed') \
             ORDER BY created_at DESC LIMIT 1",
            Self::SESSION_COLUMNS
        );
        let mut rows = conn.query(&sql, turso::params![local_path]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::row_to_session(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_recoverable_sessions(&self) -> EngineResult<Vec<UploadSession>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM upload_sessions WHERE status IN \
             ('pending','in_progress','paused','paused_constraint_violation') \
             ORDER BY created_at",
            Self::SESSION_COLUMNS
        );
        let mut rows = conn.query(&sql, ()).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(Self::row_to_session(&row)?);
        }
        Ok(out)
    }

    async fn get_active_sessions(&self) -> EngineResult<Vec<UploadSession>> {
        // Same set as recoverable for constraint-propagation purposes (§4.1).
        self.get_recoverable_sessions().await
    }

    async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        ts: i64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_sessions SET status = ?1, updated_at = ?2 WHERE session_id = ?3",
            turso::params![status.to_string(), ts, session_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn update_session_status_with_error(
        &self,
        session_id: &str,
        status: SessionStatus,
        message: &str,
        ts: i64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_sessions SET status = ?1, error_message = ?2, updated_at = ?3 \
             WHERE session_id = ?4",
            turso::params![status.to_string(), message, ts, session_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn update_session_for_constraint_violation(
        &self,
        session_id: &str,
        reason: &str,
        stop_reason_code: u32,
        ts: i64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_sessions SET status = ?1, pause_reason = ?2, \
             stop_reason_code = ?3, constraint_violated_at = ?4, updated_at = ?4 \
             WHERE session_id = ?5",
            turso::params![
                SessionStatus::PausedConstraintViolation.to_string(),
                reason,
                stop_reason_code as i64,
                ts,
                session_id
            ],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn clear_constraint_violation(&self, session_id: &str, ts: i64) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_sessions SET pause_reason = NULL, stop_reason_code = NULL, \
             constraint_violated_at = NULL, updated_at = ?1 WHERE session_id = ?2",
            turso::params![ts, session_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn update_session_constraints(
        &self,
        session_id: &str,
        constraints_blob: &str,
        ts: i64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_sessions SET constraints_blob = ?1, updated_at = ?2 \
             WHERE session_id = ?3",
            turso::params![constraints_blob, ts, session_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn update_session_remote_path(
        &self,
        session_id: &str,
        remote_path: &str,
        ts: i64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_sessions SET remote_path = ?1, updated_at = ?2 WHERE session_id = ?3",
            turso::params![remote_path, ts, session_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn claim_next_pending_part(&self, session_id: &str) -> EngineResult<Option<UploadPart>> {
        // Holding the single mutex guard across the SELECT and the
        // conditional UPDATE is what makes this atomic (§3 invariant 6) —
        // see the module doc comment.
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT part_id FROM upload_parts WHERE session_id = ?1 AND status = 'pending' \
                 ORDER BY part_number LIMIT 1",
                turso::params![session_id],
            )
            .await?;
        let part_id: String = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => return Ok(None),
        };
        drop(rows);

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE upload_parts SET status = 'uploading', updated_at = ?1 \
             WHERE part_id = ?2 AND status = 'pending'",
            turso::params![now, part_id.clone()],
        )
        .await?;

        let sql = format!(
            "SELECT {} FROM upload_parts WHERE part_id = ?1",
            Self::PART_COLUMNS
        );
        let mut rows = conn.query(&sql, turso::params![part_id]).await?;
        let claimed = match rows.next().await? {
            Some(row) => Some(Self::row_to_part(&row)?),
            None => None,
        };
        drop(rows);
        drop(conn);
        self.bump();
        Ok(claimed)
    }

    async fn update_part_status(
        &self,
        part_id: &str,
        status: PartStatus,
        etag: Option<String>,
        uploaded_bytes: u64,
        ts: i64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_parts SET status = ?1, etag = ?2, uploaded_bytes = ?3, \
             updated_at = ?4 WHERE part_id = ?5",
            turso::params![
                status.to_string(),
                etag,
                uploaded_bytes as i64,
                ts,
                part_id
            ],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn reset_uploading_parts(&self, session_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE upload_parts SET status = 'pending', updated_at = ?1 \
             WHERE session_id = ?2 AND status = 'uploading'",
            turso::params![now, session_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn increment_part_retry(&self, part_id: &str, ts: i64) -> EngineResult<()> {
        // Leaves `status = 'uploading'` — the retrying task still owns this
        // part and is about to attempt it again itself. Resetting to
        // `pending` here would let the claim loop in `scheduler.rs` hand the
        // same part_number to a second task while this one sleeps on its
        // backoff (§3 invariant 6 / §8 property 4).
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_parts SET retry_count = retry_count + 1, \
             updated_at = ?1 WHERE part_id = ?2",
            turso::params![ts, part_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn fail_part(&self, part_id: &str, ts: i64) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE upload_parts SET status = 'failed', updated_at = ?1 WHERE part_id = ?2",
            turso::params![ts, part_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn reset_failed_parts(&self, session_id: &str) -> EngineResult<()> {
        let conn = self.conn.lock().await;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "UPDATE upload_parts SET status = 'pending', retry_count = 0, updated_at = ?1 \
             WHERE session_id = ?2 AND status = 'failed'",
            turso::params![now, session_id],
        )
        .await?;
        drop(conn);
        self.bump();
        Ok(())
    }

    async fn get_all_parts(&self, session_id: &str) -> EngineResult<Vec<UploadPart>> {
        self.fetch_parts(session_id).await
    }

    async fn get_uploaded_parts(&self, session_id: &str) -> EngineResult<Vec<UploadPart>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM upload_parts WHERE session_id = ?1 AND status = 'uploaded' \
             ORDER BY part_number",
            Self::PART_COLUMNS
        );
        let mut rows = conn.query(&sql, turso::params![session_id]).await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(Self::row_to_part(&row)?);
        }
        Ok(out)
    }

    async fn get_uploaded_parts_count(&self, session_id: &str) -> EngineResult<u32> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM upload_parts WHERE session_id = ?1 AND status = 'uploaded'",
                turso::params![session_id],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(count as u32)
    }

    async fn get_total_uploaded_bytes(&self, session_id: &str) -> EngineResult<u64> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COALESCE(SUM(part_size), 0) FROM upload_parts \
                 WHERE session_id = ?1 AND status = 'uploaded'",
                turso::params![session_id],
            )
            .await?;
        let total: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(total as u64)
    }

    async fn delete_old_completed_sessions(&self, before_ts: i64) -> EngineResult<usize> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT session_id FROM upload_sessions \
                 WHERE status IN ('completed','aborted','failed') AND updated_at < ?1",
                turso::params![before_ts],
            )
            .await?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            ids.push(row.get::<String>(0)?);
        }
        for id in &ids {
            conn.execute(
                "DELETE FROM upload_parts WHERE session_id = ?1",
                turso::params![id.clone()],
            )
            .await?;
            conn.execute(
                "DELETE FROM upload_sessions WHERE session_id = ?1",
                turso::params![id.clone()],
            )
            .await?;
        }
        drop(conn);
        if !ids.is_empty() {
            self.bump();
        }
        Ok(ids.len())
    }

    fn observe_session_with_parts(&self, session_id: &str) -> SnapshotStream {
        let mut rx = self.notify.subscribe();
        let conn = self.conn.clone();
        let session_id = session_id.to_string();
        Box::pin(stream! {
            loop {
                let snapshot = {
                    let store = TursoStore { conn: conn.clone(), notify: watch::channel(0).0 };
                    store.get_session_with_parts(&session_id).await
                };
                if let Ok(Some(snapshot)) = snapshot {
                    let done = snapshot.0.status.is_terminal();
                    yield snapshot;
                    if done {
                        break;
                    }
                } else if matches!(snapshot, Ok(None)) {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    fn observe_active_sessions_with_parts(&self) -> ActiveSnapshotsStream {
        let mut rx = self.notify.subscribe();
        let conn = self.conn.clone();
        Box::pin(stream! {
            loop {
                let store = TursoStore { conn: conn.clone(), notify: watch::channel(0).0 };
                let sessions = store.get_active_sessions().await.unwrap_or_default();
                let mut snapshots = Vec::with_capacity(sessions.len());
                for session in sessions {
                    if let Ok(parts) = store.fetch_parts(&session.session_id).await {
                        snapshots.push((session, parts));
                    }
                }
                yield snapshots;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
