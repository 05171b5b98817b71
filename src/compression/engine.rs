//! Compression engine contract and HTTP client.
//!
//! The engine is opaque to the proxy. It is told about every message
//! (`remember`) and, once a session crosses the threshold, asked for the
//! subset worth keeping (`recall`). Its internal scoring policy is its own.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ProxyError, Result};
use crate::provider::{Message, Role};
use crate::session::{MemoryHandle, SessionId};

/// Boxed future returned by engine calls.
pub type EngineFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Context attached to a remembered message.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryMetadata {
    /// Owning session
    pub session_id: SessionId,
    /// Sender category
    pub role: Role,
    /// Zero-based position in the session's conversation
    pub position: u64,
}

/// Recall parameters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RecallParams {
    /// Maximum messages to return
    pub limit: usize,
    /// Minimum importance score (0.0-1.0) for a message to be kept
    pub min_importance: f32,
}

/// Narrow contract to the external compression service.
pub trait CompressionEngine: Send + Sync {
    /// Append a message to a session's memory.
    fn remember<'a>(
        &'a self,
        memory: &'a MemoryHandle,
        message: &'a Message,
        metadata: MemoryMetadata,
    ) -> EngineFuture<'a, ()>;

    /// Return the retained messages for `query`, in conversation order.
    ///
    /// An empty result is allowed; the gate treats it like a failure.
    fn recall<'a>(
        &'a self,
        memory: &'a MemoryHandle,
        query: &'a str,
        params: RecallParams,
    ) -> EngineFuture<'a, Vec<Message>>;

    /// Release a session's memory after it expired.
    fn forget<'a>(&'a self, _memory: &'a MemoryHandle) -> EngineFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Engine name for logs.
    fn name(&self) -> &'static str;
}

/// Wire shape of a recalled message.
#[derive(Debug, Deserialize)]
struct RecalledMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct RecallResponse {
    #[serde(default)]
    messages: Vec<RecalledMessage>,
}

/// Client for an external compression service over HTTP.
///
/// Endpoints (relative to the base URL): `POST /remember`, `POST /recall`,
/// `POST /forget`. The proxy's own API key, if configured, is sent as a
/// bearer token; client credentials are never forwarded here.
pub struct HttpEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpEngine {
    /// Create an engine client.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ProxyError::CompressionEngine(format!("Failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}/{endpoint}", self.base_url))
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::CompressionEngine(format!("{endpoint} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ProxyError::CompressionEngine(format!(
                "{endpoint} returned {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

impl CompressionEngine for HttpEngine {
    fn remember<'a>(
        &'a self,
        memory: &'a MemoryHandle,
        message: &'a Message,
        metadata: MemoryMetadata,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.post(
                "remember",
                json!({
                    "memory": memory,
                    "content": message.text(),
                    "metadata": metadata,
                }),
            )
            .await?;
            Ok(())
        })
    }

    fn recall<'a>(
        &'a self,
        memory: &'a MemoryHandle,
        query: &'a str,
        params: RecallParams,
    ) -> EngineFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let response = self
                .post(
                    "recall",
                    json!({
                        "memory": memory,
                        "query": query,
                        "top_k": params.limit,
                        "min_importance": params.min_importance,
                    }),
                )
                .await?;

            let parsed: RecallResponse = response.json().await.map_err(|e| {
                ProxyError::CompressionEngine(format!("invalid recall response: {e}"))
            })?;

            Ok(parsed
                .messages
                .into_iter()
                .take(params.limit)
                .map(|m| {
                    let role = m.role.as_deref().map(Role::parse).unwrap_or(Role::User);
                    Message::new(role, m.content)
                })
                .collect())
        })
    }

    fn forget<'a>(&'a self, memory: &'a MemoryHandle) -> EngineFuture<'a, ()> {
        Box::pin(async move {
            self.post("forget", json!({ "memory": memory })).await?;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
