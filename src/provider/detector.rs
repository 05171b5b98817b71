//! Request classification.
//!
//! Detection precedence: path first, then credential headers, then body
//! shape. Each stage only considers providers that have an upstream
//! configured; anything else ends in [`ProviderKind::Unknown`].

use axum::http::HeaderMap;
use serde_json::Value;

use super::{strip_bearer, ProviderKind};

const ANTHROPIC_PATHS: &[&str] = &["/v1/messages", "/v1/complete"];
const OPENAI_PATHS: &[&str] = &["/v1/chat/completions", "/v1/completions", "/v1/embeddings"];
const GOOGLE_PATH_PREFIXES: &[&str] = &["/v1beta/models", "/v1/models/"];

const ANTHROPIC_MODEL_PREFIXES: &[&str] = &["claude-"];
const OPENAI_MODEL_PREFIXES: &[&str] = &["gpt-", "chatgpt-", "o1", "o3", "o4", "text-", "davinci"];
const GOOGLE_MODEL_PREFIXES: &[&str] = &["gemini-", "models/gemini-"];

/// Classifies inbound requests into a [`ProviderKind`].
///
/// Stateless; safe to share between request tasks without synchronization.
#[derive(Debug, Clone)]
pub struct ProviderDetector {
    enabled: Vec<ProviderKind>,
}

impl Default for ProviderDetector {
    fn default() -> Self {
        Self::new(ProviderKind::KNOWN)
    }
}

impl ProviderDetector {
    /// Create a detector restricted to the given providers.
    pub fn new(enabled: impl IntoIterator<Item = ProviderKind>) -> Self {
        Self {
            enabled: enabled
                .into_iter()
                .filter(|p| *p != ProviderKind::Unknown)
                .collect(),
        }
    }

    /// Providers this detector may return.
    pub fn enabled(&self) -> &[ProviderKind] {
        &self.enabled
    }

    /// Classify a request.
    pub fn detect(&self, path: &str, headers: &HeaderMap, body: Option<&Value>) -> ProviderKind {
        self.from_path(path)
            .or_else(|| self.from_headers(headers))
            .or_else(|| body.and_then(|b| self.from_body(b)))
            .unwrap_or(ProviderKind::Unknown)
    }

    fn accept(&self, provider: ProviderKind) -> Option<ProviderKind> {
        self.enabled.contains(&provider).then_some(provider)
    }

    fn from_path(&self, path: &str) -> Option<ProviderKind> {
        let path = path.to_lowercase();
        let matches = |candidates: &[&str]| {
            candidates
                .iter()
                .any(|p| path == *p || path.starts_with(&format!("{p}/")))
        };

        if matches(ANTHROPIC_PATHS) {
            return self.accept(ProviderKind::Anthropic);
        }
        if matches(OPENAI_PATHS) {
            return self.accept(ProviderKind::OpenAI);
        }
        if GOOGLE_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
            return self.accept(ProviderKind::Google);
        }
        None
    }

    fn from_headers(&self, headers: &HeaderMap) -> Option<ProviderKind> {
        if headers.contains_key("x-api-key") || headers.contains_key("anthropic-version") {
            if let Some(p) = self.accept(ProviderKind::Anthropic) {
                return Some(p);
            }
        }
        if headers.contains_key("x-goog-api-key") {
            if let Some(p) = self.accept(ProviderKind::Google) {
                return Some(p);
            }
        }

        let key = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(strip_bearer)?;

        // sk-ant- must be checked before the generic sk- prefix
        let provider = if key.starts_with("sk-ant-") {
            ProviderKind::Anthropic
        } else if key.starts_with("AIza") {
            ProviderKind::Google
        } else if key.starts_with("sk-") {
            ProviderKind::OpenAI
        } else {
            return None;
        };
        self.accept(provider)
    }

    fn from_body(&self, body: &Value) -> Option<ProviderKind> {
        if let Some(model) = body.get("model").and_then(Value::as_str) {
            let model = model.to_lowercase();
            let has_prefix = |prefixes: &[&str]| prefixes.iter().any(|p| model.starts_with(p));

            let by_model = if has_prefix(ANTHROPIC_MODEL_PREFIXES) {
                Some(ProviderKind::Anthropic)
            } else if has_prefix(GOOGLE_MODEL_PREFIXES) {
                Some(ProviderKind::Google)
            } else if has_prefix(OPENAI_MODEL_PREFIXES) {
                Some(ProviderKind::OpenAI)
            } else {
                None
            };
            if let Some(p) = by_model.and_then(|p| self.accept(p)) {
                return Some(p);
            }
        }

        if body.get("contents").is_some_and(Value::is_array) {
            return self.accept(ProviderKind::Google);
        }
        if body.get("messages").is_some_and(Value::is_array) {
            // Anthropic carries the system prompt next to, not inside, messages
            if body.get("system").is_some() || body.get("max_tokens").is_some() {
                return self.accept(ProviderKind::Anthropic);
            }
        }
        None
    }
}
