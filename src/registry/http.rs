//! HTTP implementation of [`RegistryClient`] on top of reqwest.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::registry::{Page, RecordKind, RegistryClient};

/// Registry client speaking the registry's JSON-over-HTTP API.
pub struct HttpRegistryClient {
    http: Client,
    config: RegistryConfig,
}

impl HttpRegistryClient {
    /// Build a client from registry configuration.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RegistryError::Transport {
                url: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn with_headers(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request
            .header("X-App-Id", self.config.app_id.as_str())
            .header("X-App-Token", self.config.app_token.expose_secret());
        if let Some(token) = &self.config.user_token {
            request = request.header("X-User-Token", token.expose_secret());
        }
        request
    }

    /// Send a request, retrying transport-level failures with a short
    /// randomized backoff. HTTP error statuses are never retried.
    async fn send<F>(&self, path: &str, build: F) -> Result<Response, RegistryError>
    where
        F: Fn(&Client, String) -> RequestBuilder,
    {
        let url = self.url(path);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let request = self.with_headers(build(&self.http, url.clone()));
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => {
                    return Err(RegistryError::Timeout {
                        url: path.to_string(),
                        timeout: self.config.request_timeout,
                    });
                }
                Err(e) if attempt < self.config.max_retries => {
                    let backoff_ms = rand::thread_rng()
                        .gen_range(self.config.retry_backoff_min_ms..=self.config.retry_backoff_max_ms);
                    warn!(
                        url = %path,
                        attempt,
                        backoff_ms,
                        error = %e,
                        "Registry request failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
                Err(e) => {
                    return Err(RegistryError::Transport {
                        url: path.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> Result<T, RegistryError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| RegistryError::Transport {
            url: path.to_string(),
            reason: e.to_string(),
        })?;

        if status == StatusCode::FORBIDDEN {
            return Err(RegistryError::Forbidden {
                url: path.to_string(),
                body,
            });
        }
        if status.is_client_error() || status.is_server_error() {
            return Err(RegistryError::Http {
                status: status.as_u16(),
                url: path.to_string(),
                body,
            });
        }

        debug!(url = %path, status = status.as_u16(), bytes = body.len(), "Registry response");
        serde_json::from_str(&body).map_err(|e| RegistryError::InvalidResponse {
            url: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RegistryError> {
        let response = self.send(path, |http, url| http.get(url)).await?;
        Self::decode(path, response).await
    }
}

/// Path of a non-paged dictionary resource.
fn dictionary_path(kind: RecordKind) -> Option<&'static str> {
    match kind {
        RecordKind::Language => Some("/api/v1/dictionary/languages"),
        RecordKind::Country => Some("/api/v1/dictionary/countries"),
        RecordKind::Discipline => Some("/api/v1/dictionary/disciplines"),
        _ => None,
    }
}

/// Path of a pageable resource.
fn page_path(kind: RecordKind) -> Option<&'static str> {
    match kind {
        RecordKind::Institution => Some("/api/v1/institutions/polon/page"),
        RecordKind::Source => Some("/api/v1/journals/page"),
        RecordKind::Publisher => Some("/api/v1/publishers/page"),
        RecordKind::Conference => Some("/api/v1/conferences/page"),
        RecordKind::Author => Some("/api/v1/person/page"),
        RecordKind::Publication => Some("/api/v1/institutionProfile/publications/page"),
        RecordKind::Statement => Some("/api/v1/institutionProfile/statements/page"),
        RecordKind::Fee => Some("/api/v1/institutionProfile/publications/fees/page"),
        _ => None,
    }
}

/// Path of a batched lookup resource.
fn batch_path(kind: RecordKind) -> Option<&'static str> {
    match kind {
        RecordKind::Publication => Some("/api/v1/publications/batch"),
        RecordKind::Author => Some("/api/v1/person/batch"),
        RecordKind::Source => Some("/api/v1/journals/batch"),
        _ => None,
    }
}

fn unsupported(kind: RecordKind, what: &str) -> RegistryError {
    RegistryError::InvalidResponse {
        url: String::new(),
        reason: format!("{kind} has no {what} endpoint"),
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn probe(&self) -> Result<(), RegistryError> {
        let _: serde_json::Value = self.get_json("/api/v1/dictionary/languages").await?;
        Ok(())
    }

    async fn fetch_dictionary(
        &self,
        kind: RecordKind,
    ) -> Result<Vec<serde_json::Value>, RegistryError> {
        let path = dictionary_path(kind).ok_or_else(|| unsupported(kind, "dictionary"))?;
        self.get_json(path).await
    }

    async fn fetch_page(
        &self,
        kind: RecordKind,
        page: u32,
        page_size: u32,
    ) -> Result<Page, RegistryError> {
        let path = page_path(kind).ok_or_else(|| unsupported(kind, "paged"))?;
        self.get_json(&format!("{path}?page={page}&size={page_size}"))
            .await
    }

    async fn fetch_batch(
        &self,
        kind: RecordKind,
        ids: &[String],
    ) -> Result<Vec<serde_json::Value>, RegistryError> {
        let path = batch_path(kind).ok_or_else(|| unsupported(kind, "batch"))?;
        let body = serde_json::json!({ "ids": ids });
        let response = self
            .send(path, |http, url| http.post(url).json(&body))
            .await?;
        Self::decode(path, response).await
    }
}
