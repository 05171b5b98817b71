//! Upstream relay.
//!
//! Requests go to `<provider base URL><original path and query>` with the
//! client's headers, including its credential, passed through. Headers that
//! describe the original connection or body length are dropped and
//! recomputed by the transport.

use std::collections::HashMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use reqwest::Client;

use crate::error::{ProxyError, Result};
use crate::provider::ProviderKind;

/// Connection-scoped headers never relayed in either direction.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Copy headers for relaying, minus hop-by-hop headers, `host` and
/// `content-length`.
pub fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if *name == header::HOST || *name == header::CONTENT_LENGTH || HOP_BY_HOP.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Buffered upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    /// Upstream status, unchanged
    pub status: StatusCode,
    /// Upstream headers minus hop-by-hop and length headers
    pub headers: HeaderMap,
    /// Upstream body, unchanged
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Convert into a client response.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// HTTP client bound to the configured provider base URLs.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    base_urls: HashMap<ProviderKind, String>,
}

impl Upstream {
    /// Create a client with the given request deadline.
    pub fn new(
        base_urls: impl IntoIterator<Item = (ProviderKind, String)>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Server(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_urls: base_urls
                .into_iter()
                .map(|(kind, url)| (kind, url.trim_end_matches('/').to_string()))
                .collect(),
        })
    }

    /// Target URL for a request, or `None` if the provider has no base URL.
    pub fn target_url(&self, provider: ProviderKind, uri: &Uri) -> Option<String> {
        let base = self.base_urls.get(&provider)?;
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        Some(format!("{base}{path_and_query}"))
    }

    /// Send a request upstream and buffer the response.
    pub async fn relay(
        &self,
        provider: ProviderKind,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let url = self
            .target_url(provider, uri)
            .ok_or_else(|| ProxyError::UnknownProvider(format!("{provider} is not configured")))?;

        tracing::debug!(%provider, %method, %url, bytes = body.len(), "Forwarding upstream");

        let response = self
            .client
            .request(method, &url)
            .headers(relay_headers(headers))
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = relay_headers(response.headers());
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_relay_headers_strip_length_and_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));
        headers.insert(header::HOST, HeaderValue::from_static("localhost:8080"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-123"));
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let out = relay_headers(&headers);
        assert!(out.get(header::CONTENT_LENGTH).is_none());
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(out.get("x-api-key").unwrap(), "sk-ant-123");
        assert_eq!(out.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_target_url_keeps_path_and_query() {
        let upstream = Upstream::new(
            [(
                ProviderKind::Google,
                "https://generativelanguage.googleapis.com/".to_string(),
            )],
            Duration::from_secs(1),
        )
        .unwrap();

        let uri: Uri = "/v1beta/models/gemini-pro:generateContent?key=AIza123"
            .parse()
            .unwrap();
        assert_eq!(
            upstream.target_url(ProviderKind::Google, &uri).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent?key=AIza123"
        );
        assert!(upstream.target_url(ProviderKind::OpenAI, &uri).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_unavailable() {
        let upstream = Upstream::new(
            [(ProviderKind::OpenAI, "http://127.0.0.1:9".to_string())],
            Duration::from_millis(500),
        )
        .unwrap();

        let uri: Uri = "/v1/chat/completions".parse().unwrap();
        let err = upstream
            .relay(
                ProviderKind::OpenAI,
                Method::POST,
                &uri,
                &HeaderMap::new(),
                Bytes::from_static(b"{}"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::UpstreamUnavailable { .. }));
        assert!(!err.is_client_error());
    }
}
