//! End-to-end proxy tests.
//!
//! A stub upstream provider runs on an ephemeral port and records every
//! request it receives; the proxy router is driven in-process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use ctxproxy::compression::{
    CompressionEngine, EngineFuture, LocalEngine, MemoryMetadata, RecallParams,
};
use ctxproxy::session::{MemoryHandle, SessionId};
use ctxproxy::{Config, Message, ProxyError, ProxyServer, SavingsHeader, SAVINGS_HEADER};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

const UPSTREAM_BODY: &str = r#"{"id":"msg_stub","content":[{"type":"text","text":"ok"}]}"#;

struct Received {
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

/// Upstream stand-in that records requests.
#[derive(Default)]
struct StubUpstream {
    calls: AtomicUsize,
    received: Mutex<Vec<Received>>,
}

impl StubUpstream {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_body(&self) -> Bytes {
        self.received.lock().unwrap().last().unwrap().body.clone()
    }

    fn last_header(&self, name: &str) -> Option<String> {
        self.received
            .lock()
            .unwrap()
            .last()
            .unwrap()
            .headers
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }
}

async fn stub_handler(
    State(stub): State<Arc<StubUpstream>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    stub.calls.fetch_add(1, Ordering::SeqCst);

    // Tests pick the upstream status through a request header
    let status = headers
        .get("x-stub-status")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u16>().ok())
        .and_then(|s| StatusCode::from_u16(s).ok())
        .unwrap_or(StatusCode::OK);

    stub.received.lock().unwrap().push(Received {
        path: uri.path().to_string(),
        headers,
        body,
    });

    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::HeaderName::from_static("x-upstream"), "stub"),
        ],
        UPSTREAM_BODY,
    )
        .into_response()
}

async fn spawn_upstream() -> (String, Arc<StubUpstream>) {
    let stub = Arc::new(StubUpstream::default());
    let app = Router::new()
        .fallback(stub_handler)
        .with_state(stub.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), stub)
}

fn config(base_url: &str) -> Config {
    let mut config = Config::default();
    for provider in config.providers.values_mut() {
        provider.base_url = base_url.to_string();
    }
    config
}

/// Engine that keeps only the latest message.
struct LatestOnly;

impl CompressionEngine for LatestOnly {
    fn remember<'a>(
        &'a self,
        _memory: &'a MemoryHandle,
        _message: &'a Message,
        _metadata: MemoryMetadata,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn recall<'a>(
        &'a self,
        _memory: &'a MemoryHandle,
        query: &'a str,
        _params: RecallParams,
    ) -> EngineFuture<'a, Vec<Message>> {
        Box::pin(async move { Ok(vec![Message::user(query)]) })
    }

    fn name(&self) -> &'static str {
        "latest-only"
    }
}

/// Engine that is always down.
struct Unavailable;

impl CompressionEngine for Unavailable {
    fn remember<'a>(
        &'a self,
        _memory: &'a MemoryHandle,
        _message: &'a Message,
        _metadata: MemoryMetadata,
    ) -> EngineFuture<'a, ()> {
        Box::pin(async { Err(ProxyError::CompressionEngine("connection refused".into())) })
    }

    fn recall<'a>(
        &'a self,
        _memory: &'a MemoryHandle,
        _query: &'a str,
        _params: RecallParams,
    ) -> EngineFuture<'a, Vec<Message>> {
        Box::pin(async { Err(ProxyError::CompressionEngine("connection refused".into())) })
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

fn anthropic_request(api_key: &str, body: Value) -> Request<Body> {
    Request::post("/v1/messages")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn savings(headers: &HeaderMap) -> SavingsHeader {
    let value = headers
        .get(SAVINGS_HEADER)
        .expect("savings header")
        .to_str()
        .unwrap();
    SavingsHeader::parse(value).expect("parsable savings header")
}

/// Ten single-message requests: the tenth is the first to compress
#[tokio::test]
async fn test_tenth_message_triggers_compression() {
    let (base, stub) = spawn_upstream().await;
    let server = ProxyServer::with_engine(config(&base), Arc::new(LocalEngine::new())).unwrap();
    let app = server.router();

    let body = json!({
        "model": "claude-3-5-sonnet-20241022",
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "hello world"}]
    });

    for i in 1..=9 {
        let (status, headers, _) = send(&app, anthropic_request("sk-ant-e2e", body.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let s = savings(&headers);
        assert!(!s.compressed, "request {i} must pass through");
        assert_eq!(s.tokens_before, 2);
        assert_eq!(s.tokens_saved, 0);
        assert_eq!(stub.last_body(), Bytes::from(body.to_string()));
    }

    let (status, headers, _) = send(&app, anthropic_request("sk-ant-e2e", body)).await;
    assert_eq!(status, StatusCode::OK);

    let s = savings(&headers);
    assert!(s.compressed);
    assert_eq!(s.tokens_before, 20);
    assert_eq!(s.tokens_after, 2);
    assert_eq!(s.tokens_saved, 18);
    assert!(s.cost_saved > 0.0);
    assert_eq!(stub.calls(), 10);

    let id = SessionId::from_credential(Some("sk-ant-e2e"));
    let session = server.sessions().get(&id).await.unwrap();
    assert_eq!(session.message_count, 10);
    assert_eq!(session.requests, 10);
    assert_eq!(session.tokens_saved, 18);
    assert_eq!(server.metrics().total_tokens_saved(), 18);
}

/// A reduced body is re-serialized with a matching content-length
#[tokio::test]
async fn test_compressed_body_has_fresh_content_length() {
    let (base, stub) = spawn_upstream().await;
    let mut config = config(&base);
    config.compression.threshold = 3;
    let server = ProxyServer::with_engine(config, Arc::new(LatestOnly)).unwrap();

    let original = json!({
        "model": "gpt-4o",
        "messages": [
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "first question about lifetimes"},
            {"role": "assistant", "content": "a long answer about borrowing rules"},
            {"role": "user", "content": "and what about async?"}
        ]
    });
    let request = Request::post("/v1/chat/completions")
        .header(header::AUTHORIZATION, "Bearer sk-openai-e2e")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(original.to_string()))
        .unwrap();

    let (status, headers, _) = send(&server.router(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(savings(&headers).compressed);

    let forwarded = stub.last_body();
    let forwarded_json: Value = serde_json::from_slice(&forwarded).unwrap();
    assert_eq!(
        forwarded_json["messages"],
        json!([{"role": "user", "content": "and what about async?"}])
    );
    assert_eq!(forwarded_json["model"], "gpt-4o");
    assert!(forwarded.len() < original.to_string().len());
    assert_eq!(
        stub.last_header("content-length"),
        Some(forwarded.len().to_string())
    );
    assert_eq!(
        stub.last_header("authorization").as_deref(),
        Some("Bearer sk-openai-e2e")
    );
}

/// Unknown provider is rejected before any upstream call
#[tokio::test]
async fn test_unknown_provider_never_reaches_upstream() {
    let (base, stub) = spawn_upstream().await;
    let server = ProxyServer::with_engine(config(&base), Arc::new(LocalEngine::new())).unwrap();

    let request = Request::post("/api/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"prompt":"hi"}"#))
        .unwrap();

    let (status, _, body) = send(&server.router(), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"]["type"], "unknown_provider");
    assert_eq!(stub.calls(), 0);
    assert!(server.sessions().is_empty());
}

/// Missing message list is a client error without upstream call
#[tokio::test]
async fn test_missing_messages_is_malformed() {
    let (base, stub) = spawn_upstream().await;
    let server = ProxyServer::with_engine(config(&base), Arc::new(LocalEngine::new())).unwrap();

    let (status, _, body) = send(
        &server.router(),
        anthropic_request("sk-ant-e2e", json!({"model": "claude-3-haiku", "messages": "hi"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"]["type"], "malformed_payload");
    assert_eq!(stub.calls(), 0);
}

/// Upstream status, body and headers come back unchanged
#[tokio::test]
async fn test_upstream_response_is_transparent() {
    let (base, _stub) = spawn_upstream().await;
    let server = ProxyServer::with_engine(config(&base), Arc::new(LocalEngine::new())).unwrap();

    let mut request = anthropic_request(
        "sk-ant-e2e",
        json!({"model": "claude-3-haiku", "messages": [{"role": "user", "content": "hi"}]}),
    );
    request
        .headers_mut()
        .insert("x-stub-status", "429".parse().unwrap());

    let (status, headers, body) = send(&server.router(), request).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body, Bytes::from_static(UPSTREAM_BODY.as_bytes()));
    assert_eq!(headers.get("x-upstream").unwrap(), "stub");
    assert!(!savings(&headers).compressed);
}

/// Engine failure forwards the original bytes
#[tokio::test]
async fn test_engine_failure_fails_open() {
    let (base, stub) = spawn_upstream().await;
    let mut config = config(&base);
    config.compression.threshold = 1;
    let server = ProxyServer::with_engine(config, Arc::new(Unavailable)).unwrap();

    // Unusual spacing would not survive a re-serialization
    let raw = "{ \"model\" : \"gpt-4o-mini\",\n  \"messages\": [ {\"role\":\"user\", \"content\":\"hello   there\"} ] }";
    let request = Request::post("/v1/chat/completions")
        .header(header::AUTHORIZATION, "Bearer sk-fail-open")
        .body(Body::from(raw))
        .unwrap();

    let (status, headers, _) = send(&server.router(), request).await;
    assert_eq!(status, StatusCode::OK);

    let s = savings(&headers);
    assert!(!s.compressed);
    assert_eq!(s.tokens_saved, 0);
    assert_eq!(stub.last_body(), Bytes::from_static(raw.as_bytes()));
}

/// Model listing is relayed without session work
#[tokio::test]
async fn test_non_conversation_path_is_relayed() {
    let (base, stub) = spawn_upstream().await;
    let server = ProxyServer::with_engine(config(&base), Arc::new(LocalEngine::new())).unwrap();

    let request = Request::get("/v1/models")
        .header(header::AUTHORIZATION, "Bearer sk-proj-abc")
        .body(Body::empty())
        .unwrap();

    let (status, headers, _) = send(&server.router(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(SAVINGS_HEADER).is_none());
    assert_eq!(stub.calls(), 1);
    assert_eq!(stub.received.lock().unwrap()[0].path, "/v1/models");
    assert!(server.sessions().is_empty());
    assert_eq!(server.metrics().total_requests(), 0);
}

/// Google requests keep the model path and query key
#[tokio::test]
async fn test_google_request_uses_native_shape() {
    let (base, stub) = spawn_upstream().await;
    let mut config = config(&base);
    config.compression.threshold = 2;
    let server = ProxyServer::with_engine(config, Arc::new(LatestOnly)).unwrap();

    let body = json!({
        "contents": [
            {"role": "user", "parts": [{"text": "summarize this file"}]},
            {"role": "model", "parts": [{"text": "it parses TOML"}]},
            {"role": "user", "parts": [{"text": "now the tests"}]}
        ]
    });
    let request = Request::post("/v1beta/models/gemini-1.5-pro:generateContent?key=AIzaE2E")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let (status, headers, _) = send(&server.router(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(savings(&headers).compressed);

    let forwarded: Value = serde_json::from_slice(&stub.last_body()).unwrap();
    assert_eq!(
        forwarded["contents"],
        json!([{"role": "user", "parts": [{"text": "now the tests"}]}])
    );
    assert!(server
        .sessions()
        .contains(&SessionId::from_credential(Some("AIzaE2E"))));
}

/// Concurrent first requests with one credential share one session
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_create_one_session() {
    let (base, stub) = spawn_upstream().await;
    let server = ProxyServer::with_engine(config(&base), Arc::new(LocalEngine::new())).unwrap();
    let app = server.router();

    let mut handles = Vec::new();
    for i in 0..16 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let body = json!({
                "model": "claude-3-haiku",
                "messages": [{"role": "user", "content": format!("question {i}")}]
            });
            send(&app, anthropic_request("sk-ant-race", body)).await.0
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    assert_eq!(stub.calls(), 16);
    assert_eq!(server.sessions().len(), 1);
    assert_eq!(server.sessions().total_created(), 1);

    let session = server
        .sessions()
        .get(&SessionId::from_credential(Some("sk-ant-race")))
        .await
        .unwrap();
    assert_eq!(session.message_count, 16);
    assert_eq!(session.requests, 16);
}

/// Two sessions saving concurrently sum to the global totals
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_sessions_sum_to_global_totals() {
    let (base, _stub) = spawn_upstream().await;
    let mut config = config(&base);
    config.compression.threshold = 1;
    let server = ProxyServer::with_engine(config, Arc::new(LatestOnly)).unwrap();
    let app = server.router();

    let mut handles = Vec::new();
    for key in ["sk-ant-one", "sk-ant-two"] {
        for i in 0..10 {
            let app = app.clone();
            handles.push(tokio::spawn(async move {
                let body = json!({
                    "model": "claude-3-5-sonnet-20241022",
                    "messages": [
                        {"role": "user", "content": format!("context for request {i} with padding words")},
                        {"role": "user", "content": "short"}
                    ]
                });
                send(&app, anthropic_request(key, body)).await.0
            }));
        }
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), StatusCode::OK);
    }

    let one = server
        .metrics()
        .session(&SessionId::from_credential(Some("sk-ant-one")))
        .unwrap();
    let two = server
        .metrics()
        .session(&SessionId::from_credential(Some("sk-ant-two")))
        .unwrap();

    assert_eq!(one.requests + two.requests, 20);
    assert!(one.tokens_saved > 0 && two.tokens_saved > 0);
    assert_eq!(
        one.tokens_saved + two.tokens_saved,
        server.metrics().total_tokens_saved()
    );
    assert_eq!(
        one.cost_saved_nanos + two.cost_saved_nanos,
        server.metrics().total_cost_saved_nanos()
    );
}

/// Upstream failure surfaces as 502 and is counted
#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let mut config = config("http://127.0.0.1:9");
    config.server.upstream_timeout_secs = 2;
    let server = ProxyServer::with_engine(config, Arc::new(LocalEngine::new())).unwrap();

    let (status, _, body) = send(
        &server.router(),
        anthropic_request(
            "sk-ant-down",
            json!({"model": "claude-3-haiku", "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["error"]["type"], "upstream_unavailable");
    assert_eq!(server.metrics().total_errors(), 1);
    assert_eq!(server.metrics().total_requests(), 0);
}

/// Idle sessions are swept and their engine memory released
#[tokio::test]
async fn test_idle_session_is_swept() {
    let (base, _stub) = spawn_upstream().await;
    let mut config = config(&base);
    config.session.idle_timeout_secs = 1;
    let engine = Arc::new(LocalEngine::new());
    let server = ProxyServer::with_engine(config, engine.clone()).unwrap();

    send(
        &server.router(),
        anthropic_request(
            "sk-ant-idle",
            json!({"model": "claude-3-haiku", "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;
    assert_eq!(server.sessions().len(), 1);
    assert_eq!(engine.memory_count(), 1);

    assert_eq!(server.sweep_expired().await, 0);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(server.sweep_expired().await, 1);

    assert!(server.sessions().is_empty());
    assert_eq!(engine.memory_count(), 0);
    // Savings totals outlive the session
    assert_eq!(server.metrics().total_requests(), 1);
}

/// Sessions endpoint lists fingerprints, never credentials
#[tokio::test]
async fn test_sessions_endpoint_hides_credentials() {
    let (base, _stub) = spawn_upstream().await;
    let server = ProxyServer::with_engine(config(&base), Arc::new(LocalEngine::new())).unwrap();
    let app = server.router();

    send(
        &app,
        anthropic_request(
            "sk-ant-secret",
            json!({"model": "claude-3-haiku", "messages": [{"role": "user", "content": "hi"}]}),
        ),
    )
    .await;

    let (status, _, body) = send(
        &app,
        Request::get("/sessions").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!String::from_utf8_lossy(&body).contains("sk-ant-secret"));

    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["count"], 1);
    assert_eq!(
        json["sessions"][0]["session_id"],
        SessionId::from_credential(Some("sk-ant-secret")).as_str()
    );
}
