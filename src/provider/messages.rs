//! Conversation extraction and substitution.
//!
//! Normalizes provider payloads into an ordered `Vec<Message>` and writes a
//! (possibly reduced) list back in the provider's native shape. Fields the
//! proxy does not interpret (`name`, `tool_calls`, cache hints, ...) ride
//! along in [`Message::extra`] so substitution never drops them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ProviderKind;
use crate::error::{ProxyError, Result};

/// Sender category of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    /// System / developer instructions
    System,
    /// End user
    User,
    /// Model output (`assistant` or Google's `model`)
    Assistant,
    /// Tool result
    Tool,
    /// Any role the proxy does not interpret; kept verbatim
    Other(String),
}

impl Role {
    /// Parse a provider role string.
    pub fn parse(role: &str) -> Self {
        match role {
            "system" | "developer" => Role::System,
            "user" => Role::User,
            "assistant" | "model" => Role::Assistant,
            "tool" => Role::Tool,
            other => Role::Other(other.to_string()),
        }
    }

    /// Canonical role string.
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Other(s) => s,
        }
    }

    fn for_provider(&self, provider: ProviderKind) -> &str {
        match (provider, self) {
            (ProviderKind::Google, Role::Assistant) => "model",
            _ => self.as_str(),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::parse(&s)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message content.
///
/// Multi-part content (images, tool use blocks, Gemini parts) is not
/// interpreted; it is carried as the original JSON and only its text parts
/// count towards the token estimate.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// Plain text
    Text(String),
    /// Provider-specific structured content, passed through untouched
    Opaque(Value),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    /// Text view of the content.
    pub fn text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Opaque(value) => opaque_text(value),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Content::Text(s) => Value::String(s.clone()),
            Content::Opaque(v) => v.clone(),
        }
    }
}

fn opaque_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Sender category
    pub role: Role,
    /// Payload
    pub content: Content,
    /// Provider fields not interpreted by the proxy
    pub extra: Map<String, Value>,
}

impl Message {
    /// Create a plain text message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Content::Text(content.into()),
            extra: Map::new(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Text view of the content.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Field holding the conversation for a provider.
fn list_field(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Google => "contents",
        _ => "messages",
    }
}

/// Extract the ordered conversation from a request body.
///
/// Fails with [`ProxyError::MalformedPayload`] when the message list is absent
/// or not an array. Missing content on an individual message is an empty text.
pub fn extract_messages(provider: ProviderKind, body: &Value) -> Result<Vec<Message>> {
    if provider == ProviderKind::Unknown {
        return Err(ProxyError::UnknownProvider(
            "cannot extract messages for an unknown provider".to_string(),
        ));
    }

    let field = list_field(provider);
    let list = body
        .get(field)
        .ok_or_else(|| ProxyError::MalformedPayload(format!("missing `{field}` field")))?
        .as_array()
        .ok_or_else(|| ProxyError::MalformedPayload(format!("`{field}` is not an array")))?;

    list.iter()
        .enumerate()
        .map(|(i, item)| {
            let obj = item.as_object().ok_or_else(|| {
                ProxyError::MalformedPayload(format!("`{field}[{i}]` is not an object"))
            })?;
            Ok(parse_message(provider, obj))
        })
        .collect()
}

fn parse_message(provider: ProviderKind, obj: &Map<String, Value>) -> Message {
    let mut extra = obj.clone();
    let role = extra
        .remove("role")
        .and_then(|r| r.as_str().map(Role::parse))
        .unwrap_or(Role::User);

    let content = match provider {
        ProviderKind::Google => match extra.remove("parts") {
            Some(Value::Array(parts)) => google_parts_content(parts),
            Some(Value::Null) | None => Content::default(),
            Some(other) => Content::Opaque(other),
        },
        _ => match extra.remove("content") {
            Some(Value::String(s)) => Content::Text(s),
            Some(Value::Null) | None => Content::default(),
            Some(other) => Content::Opaque(other),
        },
    };

    Message {
        role,
        content,
        extra,
    }
}

fn google_parts_content(parts: Vec<Value>) -> Content {
    let text_only = parts
        .iter()
        .all(|p| p.as_object().is_some_and(|o| o.len() == 1 && o.contains_key("text")));
    if text_only && parts.len() == 1 {
        let text = parts[0]
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Content::Text(text)
    } else {
        Content::Opaque(Value::Array(parts))
    }
}

fn render_message(provider: ProviderKind, message: &Message) -> Value {
    let mut obj = message.extra.clone();
    obj.insert(
        "role".to_string(),
        Value::String(message.role.for_provider(provider).to_string()),
    );
    match provider {
        ProviderKind::Google => {
            let parts = match &message.content {
                Content::Text(s) => serde_json::json!([{ "text": s }]),
                Content::Opaque(v) => v.clone(),
            };
            obj.insert("parts".to_string(), parts);
        },
        _ => {
            obj.insert("content".to_string(), message.content.to_value());
        },
    }
    Value::Object(obj)
}

/// Replace the conversation in a request body, keeping every other field.
pub fn replace_messages(provider: ProviderKind, body: &mut Value, messages: &[Message]) -> Result<()> {
    let field = list_field(provider);
    let obj = body
        .as_object_mut()
        .ok_or_else(|| ProxyError::MalformedPayload("request body is not an object".to_string()))?;

    let rendered = messages
        .iter()
        .map(|m| render_message(provider, m))
        .collect();
    obj.insert(field.to_string(), Value::Array(rendered));
    Ok(())
}

/// Model named by a request, if any.
///
/// Google carries the model in the path (`/v1beta/models/{model}:generateContent`).
pub fn request_model(provider: ProviderKind, path: &str, body: &Value) -> Option<String> {
    if let Some(model) = body.get("model").and_then(Value::as_str) {
        return Some(model.to_string());
    }
    if provider == ProviderKind::Google {
        let (_, rest) = path.split_once("/models/")?;
        let model = rest.split(':').next().unwrap_or(rest);
        if !model.is_empty() {
            return Some(model.to_string());
        }
    }
    None
}
