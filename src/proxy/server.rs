//! Forwarding proxy server.
//!
//! # Request pipeline
//!
//! ```text
//! Client              ctxproxy                                   Provider
//!   |                    |                                           |
//!   |-- POST /v1/... --->| detect provider (unknown -> 400)          |
//!   |                    | extract messages                          |
//!   |                    | session = get_or_create(fingerprint)      |
//!   |                    | gate.evaluate(session, messages)          |
//!   |                    |------------ original or reduced body ---->|
//!   |                    |<------------------ response --------------|
//!   |                    | metrics.record, session.touch             |
//!   |<-- response + -----|                                           |
//!   |    x-ctxproxy-savings                                          |
//! ```
//!
//! Requests to a provider's non-conversation paths skip the session work
//! and are relayed as-is.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use crate::compression::{CompressionEngine, CompressionGate};
use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::metrics::{MetricsAggregator, MetricsSummary, RequestRecord, SessionMetrics};
use crate::provider::{
    extract_messages, replace_messages, request_model, ProviderDetector, ProviderKind,
};
use crate::session::{SessionId, SessionStore};

use super::forward::Upstream;
use super::header::{SavingsHeader, SAVINGS_HEADER};

/// Sessions listed under `top_sessions` in `/metrics`.
const TOP_SESSIONS: usize = 10;

/// Shared proxy state
pub struct ProxyState {
    config: Config,
    detector: ProviderDetector,
    upstream: Upstream,
    store: SessionStore,
    gate: CompressionGate,
    metrics: MetricsAggregator,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyState {
    fn new(config: Config, engine: Arc<dyn CompressionEngine>) -> Result<Self> {
        config.validate()?;

        let upstream = Upstream::new(
            config
                .providers
                .iter()
                .map(|(kind, p)| (*kind, p.base_url.clone())),
            config.server.upstream_timeout(),
        )?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            detector: config.detector(),
            upstream,
            store: SessionStore::new(),
            gate: CompressionGate::new(engine, config.gate_config()),
            metrics: MetricsAggregator::new(config.pricing_table()),
            shutdown_tx,
            config,
        })
    }

    /// Remove idle sessions and release their engine memory.
    async fn sweep(&self) -> usize {
        let expired = self
            .store
            .sweep_expired(self.config.session.idle_timeout());
        let engine = self.gate.engine();
        let deadline = self.gate.config().timeout;

        let releases = expired.iter().map(|(id, memory)| async move {
            match timeout(deadline, engine.forget(memory)).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    tracing::warn!(session = %id.short(), "Failed to release engine memory: {}", e);
                },
                Err(_) => {
                    tracing::warn!(session = %id.short(), "Releasing engine memory timed out");
                },
            }
        });
        join_all(releases).await;

        if !expired.is_empty() {
            tracing::info!(
                expired = expired.len(),
                remaining = self.store.len(),
                "Swept idle sessions"
            );
        }
        expired.len()
    }
}

/// Forwarding proxy server
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Create a server with the engine named in the configuration.
    pub fn new(config: Config) -> Result<Self> {
        let engine = config.build_engine()?;
        Self::with_engine(config, engine)
    }

    /// Create a server over a specific compression engine.
    pub fn with_engine(config: Config, engine: Arc<dyn CompressionEngine>) -> Result<Self> {
        Ok(Self {
            state: Arc::new(ProxyState::new(config, engine)?),
        })
    }

    /// Get the router for the proxy
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/sessions", get(sessions_handler))
            .fallback(proxy_handler)
            .layer(DefaultBodyLimit::max(self.state.config.server.max_body_size))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until ctrl-c or [`ProxyServer::shutdown`].
    pub async fn run(&self) -> Result<()> {
        let addr = self.state.config.server.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ProxyError::Server(format!("Failed to bind {addr}: {e}")))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        let config = &self.state.config;

        tracing::info!("ctxproxy listening on http://{}", local);
        for (provider, p) in &config.providers {
            tracing::info!("Upstream {}: {}", provider, p.base_url);
        }
        tracing::info!(
            "Compression: enabled={}, engine={}, threshold={}, result_limit={}",
            config.compression.enabled,
            self.state.gate.engine().name(),
            config.compression.threshold,
            config.compression.result_limit
        );

        let sweeper = spawn_sweeper(self.state.clone());
        let mut shutdown_rx = self.state.shutdown_tx.subscribe();

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received ctrl-c, shutting down"),
                    _ = shutdown_rx.recv() => tracing::info!("Shutdown requested"),
                }
            })
            .await
            .map_err(|e| ProxyError::Server(format!("Server error: {e}")));

        self.shutdown();
        let _ = sweeper.await;
        result
    }

    /// Listen address from the configuration.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.state
            .config
            .server
            .listen_addr()
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid listen address: {e}")))
    }

    /// Global metrics.
    pub fn metrics(&self) -> &MetricsAggregator {
        &self.state.metrics
    }

    /// Session store.
    pub fn sessions(&self) -> &SessionStore {
        &self.state.store
    }

    /// Run one expiry sweep now; returns the number of sessions removed.
    pub async fn sweep_expired(&self) -> usize {
        self.state.sweep().await
    }

    /// Send shutdown signal
    pub fn shutdown(&self) {
        let _ = self.state.shutdown_tx.send(());
    }
}

fn spawn_sweeper(state: Arc<ProxyState>) -> JoinHandle<()> {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.session.sweep_interval());
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    state.sweep().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("Session sweeper stopped");
    })
}

// === Handlers ===

async fn health_handler(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "ctxproxy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.store.len(),
        "engine": state.gate.engine().name(),
    }))
}

#[derive(Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    summary: MetricsSummary,
    top_sessions: Vec<SessionMetrics>,
}

async fn metrics_handler(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(MetricsResponse {
        summary: state.metrics.summary(),
        top_sessions: state.metrics.top_sessions(TOP_SESSIONS),
    })
}

async fn sessions_handler(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(json!({
        "count": state.store.len(),
        "total_created": state.store.total_created(),
        "sessions": state.store.snapshots().await,
    }))
}

/// Every path not served locally belongs to a provider.
async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!("request", id = %Uuid::new_v4(), %method, path = uri.path());
    match handle_request(&state, method, uri, headers, body)
        .instrument(span)
        .await
    {
        Ok(response) => response,
        Err(e) => {
            if e.is_client_error() {
                tracing::debug!("Rejected request: {}", e);
            } else {
                state.metrics.record_error();
                tracing::warn!("Request failed: {}", e);
            }
            e.into_response()
        },
    }
}

async fn handle_request(
    state: &ProxyState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let start = Instant::now();
    let path = uri.path();

    let payload: Option<Value> = if body.is_empty() {
        None
    } else {
        serde_json::from_slice(&body).ok()
    };

    let provider = state.detector.detect(path, &headers, payload.as_ref());
    if provider == ProviderKind::Unknown {
        return Err(ProxyError::UnknownProvider(format!(
            "no configured provider matches {method} {path}"
        )));
    }

    if method != Method::POST || !provider.is_conversation_path(path) {
        let upstream = state
            .upstream
            .relay(provider, method, &uri, &headers, body)
            .await?;
        return Ok(upstream.into_response());
    }

    let payload = payload.ok_or_else(|| {
        ProxyError::MalformedPayload("request body is not a JSON object".to_string())
    })?;
    let messages = extract_messages(provider, &payload)?;
    let model = request_model(provider, path, &payload);

    let credential = provider.credential(&headers, uri.query());
    let session = state
        .store
        .get_or_create(SessionId::from_credential(credential.as_deref()));
    if session.was_created() {
        tracing::info!(
            session = %session.id().short(),
            %provider,
            authenticated = credential.is_some(),
            "New session"
        );
    }

    let outcome = state.gate.evaluate(&session, messages).await;

    let forwarded = if outcome.compressed {
        let mut payload = payload;
        replace_messages(provider, &mut payload, &outcome.messages)?;
        Bytes::from(serde_json::to_vec(&payload)?)
    } else {
        body
    };

    let relayed = state
        .upstream
        .relay(provider, method, &uri, &headers, forwarded)
        .await;
    session.touch();
    let upstream = relayed?;

    let savings = state.metrics.record(&RequestRecord {
        session_id: session.id().clone(),
        provider,
        model,
        tokens_before: outcome.tokens_before,
        tokens_after: outcome.tokens_after,
        compressed: outcome.compressed,
        latency: start.elapsed(),
    });
    session
        .lock()
        .await
        .record_savings(savings.tokens_saved, savings.cost_saved_nanos);

    tracing::debug!(
        session = %session.id().short(),
        status = upstream.status.as_u16(),
        compressed = outcome.compressed,
        tokens_saved = savings.tokens_saved,
        latency_ms = start.elapsed().as_millis() as u64,
        "Request complete"
    );

    let mut response = upstream.into_response();
    response.headers_mut().insert(
        SAVINGS_HEADER,
        SavingsHeader::new(&outcome, savings).to_header_value(),
    );
    Ok(response)
}
