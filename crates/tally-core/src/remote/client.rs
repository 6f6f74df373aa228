//! HTTP client for the remote document store

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};

use crate::config::SyncSettings;
use crate::error::{Error, Result};

use super::types::{
    BulkDocsRequest, BulkDocsRow, ChangesResponse, DatabaseInfoResponse, PutDocumentResponse,
};
use super::{
    BulkWriteResult, ChangesPage, ConnectionStatus, DatabaseInfo, RemoteDocument, RemoteError,
    RemoteStore, ServerInfo,
};

/// Per-request timeout; an elapsed timeout counts as one retryable failure
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP implementation of [`RemoteStore`]
///
/// Transient failures (network errors, timeouts, 5xx) are retried with
/// exponential backoff up to the configured attempt ceiling; client errors
/// are surfaced immediately.
pub struct CouchClient {
    http: reqwest::Client,
    server_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl CouchClient {
    /// Build a client from validated settings
    pub fn new(settings: &SyncSettings) -> Result<Self> {
        settings.validate()?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| Error::Remote(RemoteError::Network(error.to_string())))?;

        Ok(Self {
            http,
            server_url: settings.server_url.trim().trim_end_matches('/').to_string(),
            database: settings.database.trim().to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            retry_attempts: settings.retry_attempts,
            retry_delay: settings.retry_delay(),
        })
    }

    fn database_url(&self) -> String {
        format!("{}/{}", self.server_url, self.database)
    }

    fn document_url(&self, document_id: &str) -> String {
        format!("{}/{}", self.database_url(), urlencoding::encode(document_id))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut builder = self.http.request(method, url);
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        builder
    }

    /// Run `call` with exponential backoff on transient failures
    async fn with_retry<T, F, Fut>(&self, operation: &str, call: F) -> std::result::Result<T, RemoteError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let mut delay = self.retry_delay;
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.retry_attempts => {
                    attempt += 1;
                    tracing::debug!(
                        operation,
                        attempt,
                        "transient remote failure, retrying in {delay:?}: {error}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[async_trait]
impl RemoteStore for CouchClient {
    async fn validate_connection(&self) -> ConnectionStatus {
        let response = match self
            .request(Method::GET, &format!("{}/", self.server_url))
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) => {
                return ConnectionStatus {
                    connected: false,
                    server_info: None,
                    error: Some(transport_error(&error).to_string()),
                }
            }
        };

        if !response.status().is_success() {
            return ConnectionStatus {
                connected: false,
                server_info: None,
                error: Some(format!("server returned HTTP {}", response.status().as_u16())),
            };
        }

        let server_info = response.json::<ServerInfo>().await.ok();
        ConnectionStatus {
            connected: true,
            server_info,
            error: None,
        }
    }

    async fn database_exists(&self) -> std::result::Result<bool, RemoteError> {
        self.with_retry("database_exists", || async {
            let response = self
                .request(Method::HEAD, &self.database_url())
                .send()
                .await
                .map_err(|e| transport_error(&e))?;

            match response.status() {
                status if status.is_success() => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                _ => Err(status_error(response).await),
            }
        })
        .await
    }

    async fn create_database(&self) -> std::result::Result<bool, RemoteError> {
        self.with_retry("create_database", || async {
            let response = self
                .request(Method::PUT, &self.database_url())
                .send()
                .await
                .map_err(|e| transport_error(&e))?;

            match response.status() {
                status if status.is_success() => Ok(true),
                // Database already exists
                StatusCode::PRECONDITION_FAILED => Ok(true),
                _ => Err(status_error(response).await),
            }
        })
        .await
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> std::result::Result<Option<RemoteDocument>, RemoteError> {
        self.with_retry("get_document", || async {
            let response = self
                .request(Method::GET, &self.document_url(document_id))
                .send()
                .await
                .map_err(|e| transport_error(&e))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let document = response
                .json::<RemoteDocument>()
                .await
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            Ok(Some(document))
        })
        .await
    }

    async fn put_document(
        &self,
        document: &RemoteDocument,
    ) -> std::result::Result<String, RemoteError> {
        self.with_retry("put_document", || async {
            let response = self
                .request(Method::PUT, &self.document_url(&document.document_id))
                .json(document)
                .send()
                .await
                .map_err(|e| transport_error(&e))?;

            if response.status() == StatusCode::CONFLICT {
                return Err(RemoteError::Conflict);
            }
            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let put = response
                .json::<PutDocumentResponse>()
                .await
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            Ok(put.rev)
        })
        .await
    }

    async fn bulk_write(
        &self,
        documents: &[RemoteDocument],
    ) -> std::result::Result<Vec<BulkWriteResult>, RemoteError> {
        self.with_retry("bulk_write", || async {
            let response = self
                .request(Method::POST, &format!("{}/_bulk_docs", self.database_url()))
                .json(&BulkDocsRequest { docs: documents })
                .send()
                .await
                .map_err(|e| transport_error(&e))?;

            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let rows = response
                .json::<Vec<BulkDocsRow>>()
                .await
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            Ok(rows.into_iter().map(Into::into).collect())
        })
        .await
    }

    async fn changes_since(
        &self,
        since: Option<&str>,
        limit: usize,
    ) -> std::result::Result<ChangesPage, RemoteError> {
        self.with_retry("changes_since", || async {
            let mut builder = self
                .request(Method::GET, &format!("{}/_changes", self.database_url()))
                .query(&[("include_docs", "true"), ("limit", &limit.to_string())]);
            if let Some(cursor) = since {
                builder = builder.query(&[("since", cursor)]);
            }

            let response = builder.send().await.map_err(|e| transport_error(&e))?;
            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let changes = response
                .json::<ChangesResponse>()
                .await
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            Ok(changes.into())
        })
        .await
    }

    async fn database_info(&self) -> std::result::Result<DatabaseInfo, RemoteError> {
        self.with_retry("database_info", || async {
            let response = self
                .request(Method::GET, &self.database_url())
                .send()
                .await
                .map_err(|e| transport_error(&e))?;

            if !response.status().is_success() {
                return Err(status_error(response).await);
            }

            let info = response
                .json::<DatabaseInfoResponse>()
                .await
                .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;
            Ok(info.into())
        })
        .await
    }
}

fn transport_error(error: &reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(error.to_string())
    }
}

async fn status_error(response: reqwest::Response) -> RemoteError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    RemoteError::Status {
        status,
        message: compact_text(&body),
    }
}

/// Truncate response bodies to keep error messages readable
fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}
