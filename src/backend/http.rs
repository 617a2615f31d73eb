//! reqwest-based [`BackendClient`] (§4.2).
//!
//! Timeouts and the overall request/response handling style follow the
//! teacher's `Client::builder()...build()` (`upload.rs`) and its part-PUT
//! loop almost verbatim — only the URL source changes: the teacher calls
//! its own `generate_presigned_url`, this client calls the customer
//! backend and PUTs to whatever URL comes back.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::collaborators::TokenProvider;
use crate::error::{EngineError, EngineResult};
use crate::model::Endpoints;

use super::{
    AbortRequest, BackendClient, BackendEnvelope, CompleteRequest, CompleteResponse,
    InitiateRequest, InitiateResponse, PresignPartRequest, PresignPartResponse,
};

/// Lower bounds from §4.2: connect timeout at least 30s, write at least
/// 120s, read at least 60s. The teacher never sets timeouts at all
/// (`Client::builder().build()`); this crate's backend calls cross a
/// customer-operated network boundary where that default is too
/// optimistic.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct HttpBackendClient {
    client: Client,
    token_provider: Arc<dyn TokenProvider>,
}

impl HttpBackendClient {
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(EngineError::from)?;
        Ok(Self {
            client,
            token_provider,
        })
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token_provider.token().await {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> EngineResult<T> {
        let request = self
            .authorized(self.client.post(url).header("Accept", "application/json"))
            .await
            .json(body);
        let response = request.send().await.map_err(EngineError::from)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }
        let envelope: BackendEnvelope<T> = response.json().await.map_err(|e| {
            EngineError::Protocol(format!("malformed backend response: {e}"))
        })?;
        Ok(envelope.into_data())
    }
}

fn classify_status(status: reqwest::StatusCode, message: String) -> EngineError {
    if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
        EngineError::HttpServer {
            status: status.as_u16(),
            message,
        }
    } else {
        EngineError::HttpClient {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn initiate(
        &self,
        endpoints: &Endpoints,
        request: InitiateRequest<'_>,
    ) -> EngineResult<InitiateResponse> {
        self.post_json(&endpoints.initiate, &request).await
    }

    async fn presign_part(
        &self,
        endpoints: &Endpoints,
        request: PresignPartRequest<'_>,
    ) -> EngineResult<PresignPartResponse> {
        self.post_json(&endpoints.presign_part, &request).await
    }

    async fn put_part(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        content_type: &str,
        body: Vec<u8>,
    ) -> EngineResult<String> {
        let has_content_type = headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("content-type"));
        let mut request = self.client.put(url);
        if !has_content_type {
            request = request.header("Content-Type", content_type);
        }
        for (key, value) in headers {
            request = request.header(key, value);
        }
        let response = request.body(body).send().await.map_err(EngineError::from)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }
        let etag = response
            .headers()
            .get("ETag")
            .or_else(|| response.headers().get("etag"))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(etag)
    }

    async fn complete(
        &self,
        endpoints: &Endpoints,
        request: CompleteRequest<'_>,
    ) -> EngineResult<CompleteResponse> {
        self.post_json(&endpoints.complete, &request).await
    }

    async fn abort(&self, endpoints: &Endpoints, request: AbortRequest<'_>) -> EngineResult<()> {
        let response = self
            .authorized(self.client.post(&endpoints.abort).header("Accept", "application/json"))
            .await
            .json(&request)
            .send()
            .await
            .map_err(EngineError::from)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_status(status, message));
        }
        Ok(())
    }
}
