//! Per-page document endpoint client.
//!
//! Private-mode sessions fetch the latest remote document state on start
//! and save debounced snapshots back. A missing document is a distinct
//! not-found outcome (`Ok(None)`), never an error for callers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::sync::http::check_status;

/// A document fetched from the remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub state: Vec<u8>,
    pub version: i64,
}

/// The on-demand remote document endpoint.
#[async_trait]
pub trait DocumentRemote: Send + Sync {
    /// `Ok(None)` when the page has no document yet.
    async fn fetch_document(&self, page_id: &str) -> Result<Option<RemoteDocument>>;

    /// Save a snapshot; returns the server-assigned version. `content_text`
    /// lets the service maintain previews/search without decoding CRDT
    /// bytes; `version` is optimistic-concurrency reporting only.
    async fn save_document(
        &self,
        page_id: &str,
        state: &[u8],
        content_text: Option<&str>,
        version: Option<i64>,
    ) -> Result<i64>;
}

#[derive(Debug, Deserialize)]
struct DocumentPayload {
    document_state: String,
    version: i64,
}

#[derive(Debug, Serialize)]
struct SaveDocumentRequest<'a> {
    document_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct SaveDocumentResponse {
    version: i64,
}

/// HTTP implementation of the `pages/{id}/content` endpoint.
pub struct HttpDocumentRemote {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpDocumentRemote {
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

#[async_trait]
impl DocumentRemote for HttpDocumentRemote {
    async fn fetch_document(&self, page_id: &str) -> Result<Option<RemoteDocument>> {
        let url = format!("{}/pages/{}/content", self.base_url, page_id);
        let resp = self.request(self.client.get(&url)).send().await?;

        // Missing document: valid "no content yet" outcome.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = check_status(resp, "pages/{id}/content fetch")?;
        let payload = resp
            .json::<DocumentPayload>()
            .await
            .map_err(|e| LatticeError::MalformedResponse(e.to_string()))?;
        let state = BASE64
            .decode(payload.document_state.as_bytes())
            .map_err(|e| LatticeError::MalformedResponse(format!("bad document_state: {e}")))?;
        Ok(Some(RemoteDocument {
            state,
            version: payload.version,
        }))
    }

    async fn save_document(
        &self,
        page_id: &str,
        state: &[u8],
        content_text: Option<&str>,
        version: Option<i64>,
    ) -> Result<i64> {
        let url = format!("{}/pages/{}/content", self.base_url, page_id);
        let body = SaveDocumentRequest {
            document_state: BASE64.encode(state),
            content_text,
            version,
        };
        let resp = self.request(self.client.put(&url)).json(&body).send().await?;
        let resp = check_status(resp, "pages/{id}/content save")?;
        let response = resp
            .json::<SaveDocumentResponse>()
            .await
            .map_err(|e| LatticeError::MalformedResponse(e.to_string()))?;
        Ok(response.version)
    }
}

#[derive(Debug, Default)]
struct StoredDocument {
    state: Vec<u8>,
    content_text: Option<String>,
    version: i64,
}

/// In-memory document endpoint for tests and local development.
///
/// Counts saves so debounce coalescing is observable, and can be switched
/// offline to exercise the local-only path.
#[derive(Debug, Default)]
pub struct InMemoryDocumentRemote {
    documents: Mutex<HashMap<String, StoredDocument>>,
    save_count: AtomicUsize,
    offline: std::sync::atomic::AtomicBool,
}

impl InMemoryDocumentRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate unreachability: every call fails with a network error until
    /// switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn stored_state(&self, page_id: &str) -> Option<Vec<u8>> {
        let documents = self.documents.lock().unwrap();
        documents.get(page_id).map(|d| d.state.clone())
    }

    pub fn stored_text(&self, page_id: &str) -> Option<String> {
        let documents = self.documents.lock().unwrap();
        documents.get(page_id).and_then(|d| d.content_text.clone())
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(LatticeError::Network("document endpoint offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentRemote for InMemoryDocumentRemote {
    async fn fetch_document(&self, page_id: &str) -> Result<Option<RemoteDocument>> {
        self.check_online()?;
        let documents = self.documents.lock().unwrap();
        Ok(documents.get(page_id).map(|d| RemoteDocument {
            state: d.state.clone(),
            version: d.version,
        }))
    }

    async fn save_document(
        &self,
        page_id: &str,
        state: &[u8],
        content_text: Option<&str>,
        version: Option<i64>,
    ) -> Result<i64> {
        self.check_online()?;
        let mut documents = self.documents.lock().unwrap();
        let entry = documents.entry(page_id.to_string()).or_default();
        entry.state = state.to_vec();
        entry.content_text = content_text.map(str::to_string);
        entry.version = version.unwrap_or(entry.version + 1);
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(entry.version)
    }
}
