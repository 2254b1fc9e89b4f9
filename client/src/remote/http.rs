//! HTTP remote adapter.

use super::RemoteAdapter;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use tillsync_engine::{
    PullQuery, PullResponse, PushRequest, PushResponse, SnapshotResponse, SyncLogEntry,
};

/// Talks to `tillsync-server` over JSON/HTTP.
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url,
            auth_token,
            client,
        })
    }

    /// Build from configuration. Request deadlines are applied by the
    /// orchestrator, so the client itself has no timeout.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::new(config.remote_url.clone(), config.auth_token.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = self
            .authorize(request)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl RemoteAdapter for HttpRemote {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        self.send(self.client.post(self.url("/sync/push")).json(request))
            .await
    }

    async fn pull_since(&self, query: &PullQuery) -> Result<PullResponse> {
        self.send(self.client.get(self.url("/sync/pull")).query(query))
            .await
    }

    async fn fetch_snapshot(&self) -> Result<SnapshotResponse> {
        self.send(self.client.get(self.url("/sync/snapshot"))).await
    }

    async fn append_logs(&self, entries: &[SyncLogEntry]) -> Result<()> {
        #[derive(Deserialize)]
        struct Appended {
            #[allow(dead_code)]
            appended: usize,
        }

        let _: Appended = self
            .send(self.client.post(self.url("/sync/logs")).json(entries))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<String>,
}

/// Map a non-success HTTP status to the error taxonomy.
fn classify_status(status: StatusCode, body: &str) -> SyncError {
    let message = parse_api_error(status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthRequired(message),
        // A missing endpoint means the remote is not the service we expect.
        StatusCode::CONFLICT | StatusCode::NOT_FOUND => SyncError::SchemaMismatch(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            SyncError::Validation(message)
        }
        _ => SyncError::Transient(message),
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(error) = payload.error {
            return match payload.details {
                Some(details) => format!("{} ({}): {}", error.trim(), status.as_u16(), details),
                None => format!("{} ({})", error.trim(), status.as_u16()),
            };
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}
