//! Retrying HTTP client for the external record-keeping platform.
//!
//! Every other component reads/writes the platform through this wrapper. It
//! owns the transient-retry policy and the single refresh-on-401; callers see
//! exactly one classified [`RemoteError`] per logical operation.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use docforge_auth::TokenManager;
use docforge_core::{CorrelationId, FileId, RecordId};

use crate::error::RemoteError;
use crate::retry::{classify_status, HttpRetryPolicy, RetryDecision};

/// Header propagating the correlation id to the platform.
pub const CORRELATION_HEADER: &str = "X-Correlation-Id";

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    records: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct GuardedUpdateResponse {
    updated: bool,
}

/// Thin retrying wrapper around the platform's REST surface.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    retry: HttpRetryPolicy,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenManager>) -> Self {
        let base_url = base_url.into();
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            retry: HttpRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: HttpRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Query records of an object type with a platform filter expression.
    pub async fn query(
        &self,
        object: &str,
        filter: &Value,
        cid: CorrelationId,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = format!("{}/api/data/{object}/query", self.base_url);
        let resp = self
            .send(cid, || self.http.post(&url).json(filter))
            .await?;
        let parsed: QueryResponse = Self::decode(resp).await?;
        Ok(parsed.records)
    }

    /// Create a record, returning the platform-assigned id.
    pub async fn create(
        &self,
        object: &str,
        fields: &Value,
        cid: CorrelationId,
    ) -> Result<String, RemoteError> {
        let url = format!("{}/api/data/{object}", self.base_url);
        let resp = self
            .send(cid, || self.http.post(&url).json(fields))
            .await?;
        let parsed: CreatedResponse = Self::decode(resp).await?;
        Ok(parsed.id)
    }

    /// Unconditional field update on a record.
    pub async fn update(
        &self,
        object: &str,
        id: &str,
        fields: &Value,
        cid: CorrelationId,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/api/data/{object}/{id}", self.base_url);
        self.send(cid, || self.http.patch(&url).json(fields))
            .await?;
        Ok(())
    }

    /// Conditional update: `set` is applied only where `guard` still matches,
    /// and the platform reports whether the write won. This is the
    /// mutual-exclusion primitive the lease depends on.
    pub async fn update_guarded(
        &self,
        object: &str,
        id: &str,
        set: &Value,
        guard: &Value,
        cid: CorrelationId,
    ) -> Result<bool, RemoteError> {
        let url = format!("{}/api/data/{object}/{id}/conditional", self.base_url);
        let body = serde_json::json!({ "set": set, "guard": guard });
        let resp = self
            .send(cid, || self.http.post(&url).json(&body))
            .await?;
        let parsed: GuardedUpdateResponse = Self::decode(resp).await?;
        Ok(parsed.updated)
    }

    /// Upload a binary file, returning its opaque file id.
    pub async fn upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        cid: CorrelationId,
    ) -> Result<FileId, RemoteError> {
        let url = format!("{}/api/files", self.base_url);
        let resp = self
            .send(cid, || {
                self.http
                    .post(&url)
                    .query(&[("name", filename)])
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(bytes.clone())
            })
            .await?;
        let parsed: CreatedResponse = Self::decode(resp).await?;
        Ok(FileId::new(parsed.id))
    }

    /// Download a stored file's content.
    pub async fn download(
        &self,
        file_id: &FileId,
        cid: CorrelationId,
    ) -> Result<Vec<u8>, RemoteError> {
        let url = format!("{}/api/files/{}/content", self.base_url, file_id);
        let resp = self.send(cid, || self.http.get(&url)).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Associate a stored file with a business record under a relation key.
    pub async fn link(
        &self,
        file_id: &FileId,
        record_id: &RecordId,
        relation_key: &str,
        cid: CorrelationId,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/api/links", self.base_url);
        let body = serde_json::json!({
            "fileId": file_id.as_str(),
            "recordId": record_id.as_str(),
            "relation": relation_key,
        });
        self.send(cid, || self.http.post(&url).json(&body)).await?;
        Ok(())
    }

    /// Delete a record (housekeeping surface; the engine never deletes jobs).
    pub async fn delete(
        &self,
        object: &str,
        id: &str,
        cid: CorrelationId,
    ) -> Result<(), RemoteError> {
        let url = format!("{}/api/data/{object}/{id}", self.base_url);
        self.send(cid, || self.http.delete(&url)).await?;
        Ok(())
    }

    /// Send with bearer auth, transient retries, and one refresh-on-401.
    async fn send<F>(
        &self,
        cid: CorrelationId,
        make: F,
    ) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            attempt += 1;
            let bearer = self
                .tokens
                .bearer()
                .await
                .map_err(|e| RemoteError::Auth(e.to_string()))?;

            let result = make()
                .bearer_auth(bearer)
                .header(CORRELATION_HEADER, cid.to_string())
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if self.retry.attempts_left(attempt) {
                        let delay = self.retry.delay_after(attempt);
                        tracing::warn!(correlation_id = %cid, attempt, error = %e, "platform call failed, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(RemoteError::Network(e.to_string()));
                }
            };

            let status = resp.status().as_u16();
            match classify_status(status) {
                RetryDecision::Ok => return Ok(resp),
                RetryDecision::RefreshToken => {
                    if refreshed {
                        // A fresh token was already tried once: the
                        // credential itself is bad, do not loop.
                        return Err(RemoteError::Auth(
                            "platform rejected a freshly acquired token".to_string(),
                        ));
                    }
                    refreshed = true;
                    tracing::warn!(correlation_id = %cid, "401 from platform, refreshing token");
                    self.tokens.invalidate().await;
                    continue;
                }
                RetryDecision::Fail => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(RemoteError::Api { status, body });
                }
                RetryDecision::Retry => {
                    if self.retry.attempts_left(attempt) {
                        let delay = self.retry.delay_after(attempt);
                        tracing::warn!(correlation_id = %cid, attempt, status, "transient platform error, retrying");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    return Err(RemoteError::Network(format!(
                        "gave up after {attempt} attempts, last status {status}: {body}"
                    )));
                }
            }
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, RemoteError> {
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}
