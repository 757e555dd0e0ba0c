//! Model backend abstraction layer
//!
//! This module provides the common interface for the local model servers the
//! assistant talks to. The [`ChatBackend`] trait is what the router and the
//! tool loop depend on; [`llama_server::LlamaServerBackend`] is the production
//! implementation and tests plug in scripted backends.
//!
//! Backends stream: `stream_chat` resolves once the request has been accepted
//! and then yields text chunks as the model produces them.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use sdk::errors::EngineError;
use sdk::types::{ActionRequest, ConversationTurn};
use serde_json::{Map, Value};

pub mod llama_server;
pub mod router;
pub mod summarizer;

pub use llama_server::LlamaServerBackend;
pub use router::{ModelRouter, RouteReason, RoutingDecision};
pub use summarizer::BackendSummarizer;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Stream of generated text chunks
pub type ChunkStream = BoxStream<'static, Result<String>>;

/// Errors that can occur while talking to a backend
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,
}

impl LLMError {
    /// Whether this failure means the backend could not be reached or died
    /// mid-answer, as opposed to the backend rejecting the request.
    ///
    /// Only transport failures are worth retrying on another backend.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LLMError::ProviderUnavailable(_) | LLMError::NetworkError(_) | LLMError::Timeout
        )
    }
}

impl From<LLMError> for EngineError {
    fn from(err: LLMError) -> Self {
        match err {
            LLMError::Timeout => EngineError::BackendTimeout,
            other => EngineError::Backend(other.to_string()),
        }
    }
}

/// Sampling settings sent with every request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            max_tokens: 256,
        }
    }
}

/// A model server that can stream a chat completion
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Stable identifier, as used in config and routing (e.g. "3b", "7b")
    fn id(&self) -> &str;

    /// Start generating a reply to `messages`.
    ///
    /// Connection and HTTP-status failures surface here; failures after the
    /// first byte surface as `Err` items in the stream.
    async fn stream_chat(
        &self,
        messages: &[ConversationTurn],
        options: &GenerationOptions,
    ) -> Result<ChunkStream>;

    /// Check if the backend is currently reachable
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }

    /// Generate a whole reply, for callers that do not relay chunks.
    async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: &GenerationOptions,
    ) -> Result<String> {
        let mut stream = self.stream_chat(messages, options).await?;
        let mut reply = String::new();
        while let Some(chunk) = stream.next().await {
            reply.push_str(&chunk?);
        }
        Ok(reply)
    }
}

/// Extracts a tool-call from model output or typed user input.
///
/// Handles the formats small local models actually produce:
/// 1. Raw JSON: `{"action": "...", "params": {...}}`
/// 2. Fenced JSON (with or without trailing text): ` ```json\n{...}\n``` `
/// 3. JSON embedded in prose, found with a balanced-brace scan
///
/// The `{"function": "...", "arguments": {...}}` spelling is accepted too.
/// Returns `None` when nothing decodes to a request; whether the named action
/// exists is the executor's call.
pub fn parse_tool_call(content: &str) -> Option<ActionRequest> {
    let trimmed = content.trim();
    if !trimmed.contains('{') {
        return None;
    }

    // Pattern 1: Raw JSON
    if let Some(request) = try_parse_action_json(trimmed) {
        return Some(request);
    }

    // Pattern 2: Extract from markdown code fences (even with trailing text)
    if let Some(inner) = extract_fenced_json(trimmed) {
        if let Some(request) = try_parse_action_json(inner.trim()) {
            return Some(request);
        }
    }

    // Pattern 3: First balanced object in the prose that decodes
    trimmed
        .char_indices()
        .filter(|(_, ch)| *ch == '{')
        .filter_map(|(pos, _)| extract_balanced_json(&trimmed[pos..]))
        .find_map(try_parse_action_json)
}

/// Try to parse a string as an action object.
fn try_parse_action_json(s: &str) -> Option<ActionRequest> {
    let json: Value = serde_json::from_str(s).ok()?;
    let object = json.as_object()?;

    let (action, params) = if let Some(action) = object.get("action") {
        (action.as_str()?, object.get("params"))
    } else {
        (object.get("function")?.as_str()?, object.get("arguments"))
    };

    let action = action.trim();
    if action.is_empty() {
        return None;
    }

    let params = match params {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        // Some models send the arguments as a JSON-encoded string
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw).ok()? {
            Value::Object(map) => map,
            _ => return None,
        },
        Some(_) => return None,
    };

    Some(ActionRequest {
        action: action.to_string(),
        params: params.into_iter().collect(),
    })
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_raw_action() {
        let request =
            parse_tool_call(r#"{"action": "read_file", "params": {"path": "src/main.rs"}}"#).unwrap();
        assert_eq!(request.action, "read_file");
        assert_eq!(request.params.get("path"), Some(&json!("src/main.rs")));
    }

    #[test]
    fn test_parse_action_without_params() {
        let request = parse_tool_call(r#"  {"action": "get_time"}  "#).unwrap();
        assert_eq!(request.action, "get_time");
        assert!(request.params.is_empty());
    }

    #[test]
    fn test_parse_fenced_action() {
        let content = "```json\n{\"action\": \"list_files\", \"params\": {\"path\": \".\"}}\n```\nSaya akan melihat isi folder.";
        let request = parse_tool_call(content).unwrap();
        assert_eq!(request.action, "list_files");
    }

    #[test]
    fn test_parse_embedded_action() {
        let content = r#"Baik, saya cek dulu. {"action": "get_system_status", "params": {}} Tunggu sebentar."#;
        let request = parse_tool_call(content).unwrap();
        assert_eq!(request.action, "get_system_status");
    }

    #[test]
    fn test_parse_function_spelling() {
        let request =
            parse_tool_call(r#"{"function": "read_file", "arguments": {"path": "a.txt"}}"#).unwrap();
        assert_eq!(request.action, "read_file");
        assert_eq!(request.param_str("path").unwrap(), "a.txt");

        let request =
            parse_tool_call(r#"{"function": "read_file", "arguments": "{\"path\": \"b.txt\"}"}"#)
                .unwrap();
        assert_eq!(request.param_str("path").unwrap(), "b.txt");
    }

    #[test]
    fn test_plain_text_is_not_a_tool_call() {
        assert!(parse_tool_call("Rust adalah bahasa pemrograman sistem.").is_none());
        assert!(parse_tool_call("fn main() { println!(\"hi\"); }").is_none());
        assert!(parse_tool_call(r#"{"name": "not an action"}"#).is_none());
        assert!(parse_tool_call(r#"{"action": 42}"#).is_none());
        assert!(parse_tool_call(r#"{"action": "read_file", "params": [1, 2]}"#).is_none());
    }

    #[test]
    fn test_balanced_scan_respects_strings() {
        let content = r#"Note {"action": "read_file", "params": {"path": "a}b.txt"}} end"#;
        let request = parse_tool_call(content).unwrap();
        assert_eq!(request.param_str("path").unwrap(), "a}b.txt");
    }

    #[test]
    fn test_transport_classification() {
        assert!(LLMError::Timeout.is_transport());
        assert!(LLMError::NetworkError("reset".into()).is_transport());
        assert!(LLMError::ProviderUnavailable("503".into()).is_transport());
        assert!(!LLMError::InvalidRequest("400".into()).is_transport());
    }

    #[test]
    fn test_error_conversion() {
        assert!(matches!(EngineError::from(LLMError::Timeout), EngineError::BackendTimeout));
        assert!(matches!(
            EngineError::from(LLMError::InvalidRequest("x".into())),
            EngineError::Backend(_)
        ));
    }
}
