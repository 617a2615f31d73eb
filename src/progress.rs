//! Progress Projection (§4.8): a pure function over a session/parts
//! snapshot, used both for the UI tick and for `observe_*` subscribers.
//!
//! Mirrors the shape of the teacher's `UploadProgress` struct in
//! `upload.rs`, generalized from "percent + speed" to the fuller
//! per-status breakdown §4.8 calls for, and made a pure projection rather
//! than something computed inline inside the upload loop.

use serde::Serialize;

use crate::model::{PartStatus, SessionStatus, UploadPart, UploadSession};

#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub session_id: String,
    pub status: SessionStatus,
    pub total_parts: u32,
    pub uploaded_parts: u32,
    pub failed_parts: u32,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub percent: u8,
    /// Part number of the first `Uploading` part, if any (§4.8).
    pub current_part_number: Option<u32>,
    pub error_message: Option<String>,
}

impl Progress {
    pub fn from_snapshot(session: &UploadSession, parts: &[UploadPart]) -> Self {
        let uploaded_parts = parts
            .iter()
            .filter(|p| p.status == PartStatus::Uploaded)
            .count() as u32;
        let failed_parts = parts
            .iter()
            .filter(|p| p.status == PartStatus::Failed)
            .count() as u32;
        let uploaded_bytes: u64 = parts
            .iter()
            .filter(|p| p.status == PartStatus::Uploaded)
            .map(|p| p.part_size)
            .sum();
        let percent = if session.total_size == 0 {
            0
        } else {
            ((uploaded_bytes as f64 / session.total_size as f64) * 100.0).round() as u8
        };
        let current_part_number = parts
            .iter()
            .filter(|p| p.status == PartStatus::Uploading)
            .map(|p| p.part_number)
            .min();
        Self {
            session_id: session.session_id.clone(),
            status: session.status,
            total_parts: session.total_parts,
            uploaded_parts,
            failed_parts,
            total_bytes: session.total_size,
            uploaded_bytes,
            percent: percent.min(100),
            current_part_number,
            error_message: session.error_message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoints;

    fn session() -> UploadSession {
        UploadSession {
            session_id: "s1".into(),
            upload_id: Some("U1".into()),
            local_path: "/tmp/a.bin".into(),
            remote_path: None,
            file_name: "a.bin".into(),
            content_type: "application/octet-stream".into(),
            total_size: 20 * 1024 * 1024,
            chunk_size: 5 * 1024 * 1024,
            total_parts: 4,
            status: SessionStatus::InProgress,
            endpoints: Endpoints {
                initiate: "x".into(),
                presign_part: "x".into(),
                complete: "x".into(),
                abort: "x".into(),
            },
            max_retries: 3,
            created_at: 0,
            updated_at: 0,
            error_message: None,
            constraints_blob: "{}".into(),
            pause_reason: None,
            constraint_violated_at: None,
            stop_reason_code: None,
        }
    }

    fn part(number: u32, size: u64, status: PartStatus) -> UploadPart {
        UploadPart {
            part_id: format!("s1:{number}"),
            session_id: "s1".into(),
            part_number: number,
            start_byte: 0,
            end_byte: size,
            part_size: size,
            status,
            etag: None,
            uploaded_bytes: if status == PartStatus::Uploaded { size } else { 0 },
            retry_count: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn percent_reflects_uploaded_bytes() {
        let session = session();
        let parts = vec![
            part(1, 5 * 1024 * 1024, PartStatus::Uploaded),
            part(2, 5 * 1024 * 1024, PartStatus::Uploaded),
            part(3, 5 * 1024 * 1024, PartStatus::Uploading),
            part(4, 5 * 1024 * 1024, PartStatus::Pending),
        ];
        let progress = Progress::from_snapshot(&session, &parts);
        assert_eq!(progress.uploaded_parts, 2);
        assert_eq!(progress.percent, 50);
        assert_eq!(progress.current_part_number, Some(3));
    }

    #[test]
    fn zero_byte_session_reports_zero_percent_without_dividing_by_zero() {
        let mut session = session();
        session.total_size = 0;
        let progress = Progress::from_snapshot(&session, &[]);
        assert_eq!(progress.percent, 0);
    }
}
