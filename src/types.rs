//! Request types accepted by the proxy.
//!
//! One schema covers both the OpenAI and the Anthropic dialect. Fields the
//! proxy does not inspect are kept in `extra` and forwarded as received.

use crate::normalize::normalize_model_id;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Plain text or a list of content parts; forwarded untouched.
    #[serde(default)]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(content.into()),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: None,
            temperature: None,
            max_tokens: None,
            response_format: None,
            metadata: None,
            extra: Map::new(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Wire dialect of an inbound endpoint. Each dialect smuggles the session id
/// through a different field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `POST /chat/completions`, session id in `response_format.type`.
    OpenAi,
    /// `POST /v1/messages`, session id in `metadata.user_id`.
    Anthropic,
}

impl Dialect {
    pub fn correlation_id(self, request: &ChatRequest) -> Option<String> {
        let (field, key) = match self {
            Self::OpenAi => (request.response_format.as_ref(), "type"),
            Self::Anthropic => (request.metadata.as_ref(), "user_id"),
        };
        field
            .and_then(|v| v.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    /// Extract the session id, drop the carrier field and qualify the model id.
    /// The returned request is what goes upstream.
    pub fn prepare(self, mut request: ChatRequest) -> (ChatRequest, Option<String>) {
        let correlation_id = self.correlation_id(&request);
        match self {
            Self::OpenAi => request.response_format = None,
            Self::Anthropic => request.metadata = None,
        }
        request.model = normalize_model_id(&request.model);
        (request, correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> ChatRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn openai_session_comes_from_response_format() {
        let req = parse(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "response_format": {"type": "session-42"}
        }));
        let (prepared, session) = Dialect::OpenAi.prepare(req);
        assert_eq!(session.as_deref(), Some("session-42"));
        assert!(prepared.response_format.is_none());
        assert_eq!(prepared.model, "openai/gpt-4o");
    }

    #[test]
    fn anthropic_session_comes_from_metadata() {
        let req = parse(json!({
            "model": "claude-3-haiku-20240307",
            "messages": [{"role": "user", "content": "hi"}],
            "metadata": {"user_id": "u-7"}
        }));
        assert_eq!(Dialect::OpenAi.correlation_id(&req), None);
        let (prepared, session) = Dialect::Anthropic.prepare(req);
        assert_eq!(session.as_deref(), Some("u-7"));
        assert!(prepared.metadata.is_none());
        assert_eq!(prepared.model, "anthropic/claude-3-haiku");
    }

    #[test]
    fn unknown_fields_and_message_order_survive() {
        let req = parse(json!({
            "model": "x",
            "messages": [
                {"role": "system", "content": "s"},
                {"role": "user", "content": [{"type": "text", "text": "u"}]},
                {"role": "assistant", "content": "a", "name": "bot"}
            ],
            "top_p": 0.5,
            "stream": null
        }));
        assert!(!req.is_streaming());
        let (prepared, session) = Dialect::OpenAi.prepare(req);
        assert!(session.is_none());

        let out = serde_json::to_value(&prepared).unwrap();
        assert_eq!(out["top_p"], json!(0.5));
        let roles: Vec<&str> = out["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant"]);
        assert_eq!(out["messages"][2]["name"], "bot");
        assert!(out.get("response_format").is_none());
    }

    #[test]
    fn empty_session_id_is_ignored() {
        let req = parse(json!({
            "model": "x",
            "messages": [],
            "response_format": {"type": ""}
        }));
        assert_eq!(Dialect::OpenAi.correlation_id(&req), None);
    }
}
