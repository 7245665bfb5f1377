//! HTTP client for the remote authoritative sync service.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use super::remote::{PullBatch, PushRequest, PushResponse, SyncRemote};
use crate::error::{LatticeError, Result};

/// [`SyncRemote`] implementation speaking the `sync/pages` HTTP protocol.
///
/// Timestamps are ISO-8601 strings on the wire. The bearer credential is
/// attached to every request when present; without one the server answers
/// 401 and the caller decides whether to continue local-only.
pub struct HttpSyncRemote {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSyncRemote {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

/// Map an HTTP status onto the error taxonomy; success statuses pass
/// through.
pub(crate) fn check_status(resp: reqwest::Response, context: &str) -> Result<reqwest::Response> {
    use reqwest::StatusCode;
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED => Err(LatticeError::AuthenticationRequired),
        StatusCode::FORBIDDEN => Err(LatticeError::Forbidden(context.to_string())),
        StatusCode::NOT_FOUND => Err(LatticeError::NotFound(context.to_string())),
        s => Err(LatticeError::Network(format!(
            "{context}: unexpected status {s}"
        ))),
    }
}

#[async_trait]
impl SyncRemote for HttpSyncRemote {
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<PullBatch> {
        let url = format!("{}/sync/pages", self.base_url);
        let mut req = self.request(self.client.get(&url));
        if let Some(cursor) = since {
            req = req.query(&[("since", cursor.to_rfc3339_opts(SecondsFormat::Millis, true))]);
        }

        let resp = check_status(req.send().await?, "sync/pages pull")?;
        let batch = resp
            .json::<PullBatch>()
            .await
            .map_err(|e| LatticeError::MalformedResponse(e.to_string()))?;
        Ok(batch)
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        let url = format!("{}/sync/pages", self.base_url);
        let req = self.request(self.client.post(&url)).json(&request);

        let resp = check_status(req.send().await?, "sync/pages push")?;
        let response = resp
            .json::<PushResponse>()
            .await
            .map_err(|e| LatticeError::MalformedResponse(e.to_string()))?;
        Ok(response)
    }
}
