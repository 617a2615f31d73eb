//! Customer Backend Client (§4.2): the four RPCs the engine issues to the
//! caller-operated HTTP backend, plus the wire DTOs they exchange.
//!
//! The teacher's own "backend" is S3/R2 itself, addressed with hand-rolled
//! SigV4 presigned URLs (`upload.rs::generate_presigned_url`). This spec
//! moves presigning behind a customer HTTP service (§1), so there is no
//! signing code here at all — only the four JSON RPC shapes and the part
//! PUT against whatever URL `presign_part` returns.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::model::Endpoints;

pub use http::HttpBackendClient;

#[derive(Debug, Clone, Serialize)]
pub struct InitiateRequest<'a> {
    pub file_name: &'a str,
    pub content_type: &'a str,
}

/// §4.2 #1: `{upload_id, file_path, key?, bucket?}`. `key`/`bucket` are
/// accepted but not otherwise consulted — the engine addresses the upload
/// purely by `upload_id` plus the `file_path` it echoes back on every
/// later RPC.
#[derive(Debug, Clone, Deserialize)]
pub struct InitiateResponse {
    pub upload_id: String,
    pub file_path: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresignPartRequest<'a> {
    pub upload_id: &'a str,
    pub file_path: &'a str,
    pub part_number: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresignPartResponse {
    pub presigned_url: String,
    #[serde(default)]
    pub part_number: u32,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteRequest<'a> {
    pub upload_id: &'a str,
    pub file_path: &'a str,
    pub parts: &'a [CompletedPart],
}

/// §4.2 #3: `{file_path, location?, etag?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompleteResponse {
    #[serde(default)]
    pub file_path: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AbortRequest<'a> {
    pub upload_id: &'a str,
    pub file_path: &'a str,
}

/// The backend is free to answer either with a bare payload or one
/// wrapped in a `{success, message, data}` envelope (§4.2, §6). `serde`
/// picks whichever shape parses; there is no discriminant field to key
/// off, so this has to be untagged rather than a `#[serde(tag = "...")]`
/// enum.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BackendEnvelope<T> {
    Wrapped {
        success: bool,
        #[serde(default)]
        message: Option<String>,
        data: T,
    },
    Bare(T),
}

impl<T> BackendEnvelope<T> {
    pub fn into_data(self) -> T {
        match self {
            BackendEnvelope::Wrapped { data, .. } => data,
            BackendEnvelope::Bare(data) => data,
        }
    }
}

/// Client for the four backend RPCs (§4.2). Implementations never sign
/// anything themselves — the backend returns already-presigned part
/// URLs, and the engine just follows them.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn initiate(
        &self,
        endpoints: &Endpoints,
        request: InitiateRequest<'_>,
    ) -> EngineResult<InitiateResponse>;

    async fn presign_part(
        &self,
        endpoints: &Endpoints,
        request: PresignPartRequest<'_>,
    ) -> EngineResult<PresignPartResponse>;

    /// Streams `local_path`'s `[start_byte, end_byte)` slice to the
    /// presigned URL and returns the ETag the object store reports for
    /// the uploaded part. `content_type` is the session's content type
    /// (§4.2 #5) and is sent as the `Content-Type` header unless `headers`
    /// already names one, since a backend that signed the URL against a
    /// specific content type will reject a PUT that doesn't send it.
    async fn put_part(
        &self,
        url: &str,
        headers: &std::collections::HashMap<String, String>,
        content_type: &str,
        body: Vec<u8>,
    ) -> EngineResult<String>;

    async fn complete(
        &self,
        endpoints: &Endpoints,
        request: CompleteRequest<'_>,
    ) -> EngineResult<CompleteResponse>;

    async fn abort(&self, endpoints: &Endpoints, request: AbortRequest<'_>) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_unwraps_wrapped_shape() {
        let json = r#"{"success":true,"message":"ok","data":{"upload_id":"U1","file_path":"k1"}}"#;
        let env: BackendEnvelope<InitiateResponse> = serde_json::from_str(json).unwrap();
        assert_eq!(env.into_data().upload_id, "U1");
    }

    #[test]
    fn envelope_unwraps_bare_shape() {
        let json = r#"{"upload_id":"U2","file_path":"k2"}"#;
        let env: BackendEnvelope<InitiateResponse> = serde_json::from_str(json).unwrap();
        assert_eq!(env.into_data().upload_id, "U2");
    }
}
