//! Provider detection and payload normalization.
//!
//! Inbound requests arrive in the provider's native shape (no custom
//! envelope). This module classifies a request into a [`ProviderKind`] and
//! turns its conversation payload into an ordered list of [`Message`]s, and
//! back again after compression.
//!
//! | Provider  | Conversation path                     | Credential header                 |
//! |-----------|---------------------------------------|-----------------------------------|
//! | Anthropic | `/v1/messages`                        | `x-api-key`                       |
//! | OpenAI    | `/v1/chat/completions`                | `Authorization: Bearer`           |
//! | Google    | `/v1beta/models/{model}:generateContent` | `x-goog-api-key` or `?key=`    |

mod detector;
mod messages;

use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

pub use detector::ProviderDetector;
pub use messages::{extract_messages, replace_messages, request_model, Content, Message, Role};

/// Closed set of upstream provider variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Anthropic Messages API
    Anthropic,
    /// OpenAI Chat Completions API
    OpenAI,
    /// Google Gemini generateContent API
    Google,
    /// Nothing matched; requests must be rejected
    Unknown,
}

impl ProviderKind {
    /// Providers the proxy can forward to.
    pub const KNOWN: [ProviderKind; 3] = [
        ProviderKind::Anthropic,
        ProviderKind::OpenAI,
        ProviderKind::Google,
    ];

    /// Lowercase provider name, also the key used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAI => "openai",
            ProviderKind::Google => "google",
            ProviderKind::Unknown => "unknown",
        }
    }

    /// Whether the path is this provider's conversation endpoint.
    ///
    /// Other paths of a detected provider (model listing, embeddings, legacy
    /// completions) are relayed without session or compression work.
    pub fn is_conversation_path(&self, path: &str) -> bool {
        match self {
            ProviderKind::Anthropic => path == "/v1/messages",
            ProviderKind::OpenAI => path == "/v1/chat/completions",
            ProviderKind::Google => {
                path.ends_with(":generateContent") || path.ends_with(":streamGenerateContent")
            },
            ProviderKind::Unknown => false,
        }
    }

    /// Extract the client credential this provider authenticates with.
    ///
    /// The value is returned without a `Bearer ` prefix so the same key yields
    /// the same session regardless of which header carried it.
    pub fn credential(&self, headers: &HeaderMap, query: Option<&str>) -> Option<String> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let bearer = || header("authorization").map(|v| strip_bearer(&v).to_string());

        match self {
            ProviderKind::Anthropic => header("x-api-key").or_else(bearer),
            ProviderKind::OpenAI => bearer(),
            ProviderKind::Google => header("x-goog-api-key")
                .or_else(|| query.and_then(query_key))
                .or_else(bearer),
            ProviderKind::Unknown => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAI),
            "google" | "gemini" => Ok(ProviderKind::Google),
            _ => Err(format!("Unknown provider: {s}")),
        }
    }
}

/// Strip an optional `Bearer ` scheme from an authorization value.
pub(crate) fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}

fn query_key(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "key")
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_conversation_paths() {
        assert!(ProviderKind::Anthropic.is_conversation_path("/v1/messages"));
        assert!(!ProviderKind::Anthropic.is_conversation_path("/v1/messages/count_tokens"));
        assert!(ProviderKind::OpenAI.is_conversation_path("/v1/chat/completions"));
        assert!(!ProviderKind::OpenAI.is_conversation_path("/v1/embeddings"));
        assert!(ProviderKind::Google
            .is_conversation_path("/v1beta/models/gemini-1.5-pro:generateContent"));
        assert!(!ProviderKind::Google.is_conversation_path("/v1beta/models"));
    }

    #[test]
    fn test_credential_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-123"));
        assert_eq!(
            ProviderKind::Anthropic.credential(&headers, None).as_deref(),
            Some("sk-ant-123")
        );
        assert_eq!(ProviderKind::OpenAI.credential(&headers, None), None);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-abc"));
        assert_eq!(
            ProviderKind::OpenAI.credential(&headers, None).as_deref(),
            Some("sk-abc")
        );

        let headers = HeaderMap::new();
        assert_eq!(
            ProviderKind::Google
                .credential(&headers, Some("alt=json&key=AIzaXYZ"))
                .as_deref(),
            Some("AIzaXYZ")
        );
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer sk-1"), "sk-1");
        assert_eq!(strip_bearer("bearer  sk-1 "), "sk-1");
        assert_eq!(strip_bearer("sk-1"), "sk-1");
        assert_eq!(strip_bearer("Bear"), "Bear");
    }

    #[test]
    fn test_provider_from_str() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAI);
        assert_eq!("claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!("mistral".parse::<ProviderKind>().is_err());
    }
}
