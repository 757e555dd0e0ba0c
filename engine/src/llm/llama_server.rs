//! llama.cpp server backend
//!
//! Talks to `llama-server`'s OpenAI-compatible endpoint on the local machine
//! (typically one process per model, e.g. a 3B on :8080 and a 7B on :8081).
//!
//! Key features:
//! - Streaming via `POST /v1/chat/completions` with `stream: true`
//! - SSE decoding of `data: {json}` lines up to `data: [DONE]`
//! - Health check on `GET /health`
//! - Error mapping: connect/timeout/5xx are transport failures, 4xx are not

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sdk::types::ConversationTurn;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ChatBackend, ChunkStream, GenerationOptions, LLMError, Result};
use crate::config::BackendConfig;

/// llama-server backend configuration
#[derive(Debug, Clone)]
pub struct LlamaServerBackend {
    /// Identifier used by the router (e.g. "3b")
    id: String,

    /// Base URL without trailing slash (e.g. "http://127.0.0.1:8080")
    base_url: String,

    /// Path requested by the health check
    health_path: String,

    /// Model name sent with requests, if the server hosts several
    model: Option<String>,

    /// Per-request limit for the health check
    health_timeout: Duration,

    /// HTTP client for API requests
    client: Client,
}

impl LlamaServerBackend {
    /// Create a backend from its config entry.
    ///
    /// Only the connect phase is bounded by the client; generation length is
    /// bounded by the caller's deadline.
    pub fn new(
        config: &BackendConfig,
        connect_timeout: Duration,
        health_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| LLMError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            id: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            health_path: config.health_path.clone(),
            model: config.model.clone(),
            health_timeout,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_send_error(&self, e: reqwest::Error) -> LLMError {
        if e.is_timeout() {
            LLMError::Timeout
        } else if e.is_connect() {
            LLMError::ProviderUnavailable(format!(
                "Cannot connect to llama-server '{}' at {}. Is it running?",
                self.id, self.base_url
            ))
        } else {
            LLMError::NetworkError(e.to_string())
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [ConversationTurn],
    temperature: f64,
    max_tokens: u32,
    stream: bool,
}

#[async_trait]
impl ChatBackend for LlamaServerBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream_chat(
        &self,
        messages: &[ConversationTurn],
        options: &GenerationOptions,
    ) -> Result<ChunkStream> {
        debug!(
            "llama-server request: backend={}, messages={}, total_chars={}",
            self.id,
            messages.len(),
            messages.iter().map(|m| m.content.len()).sum::<usize>()
        );

        let request = ChatCompletionRequest {
            model: self.model.as_deref(),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream: true,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.id, status, &error_text));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map(|b| b.to_vec()).map_err(|e| {
                    if e.is_timeout() {
                        LLMError::Timeout
                    } else {
                        LLMError::NetworkError(e.to_string())
                    }
                })
            })
            .boxed();

        Ok(sse_chunks(bytes))
    }

    async fn check_health(&self) -> bool {
        let url = format!("{}{}", self.base_url, self.health_path);
        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check for '{}' failed: {}", self.id, e);
                false
            }
        }
    }
}

fn status_error(id: &str, status: StatusCode, body: &str) -> LLMError {
    let body: String = body.chars().take(200).collect();
    let message = format!("llama-server '{}' returned {}: {}", id, status, body);
    if status.is_server_error() {
        LLMError::ProviderUnavailable(message)
    } else {
        LLMError::InvalidRequest(message)
    }
}

/// One decoded server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
enum SseEvent {
    Content(String),
    Error(String),
    Done,
}

/// Splits a byte stream into SSE lines and decodes them.
///
/// Bytes are buffered until a full line is available, so multi-byte UTF-8
/// characters split across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            events.extend(parse_sse_line(&String::from_utf8_lossy(&line)));
        }
        events
    }

    /// Decodes a trailing line that had no newline
    fn finish(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_sse_line(&String::from_utf8_lossy(&rest))
            .into_iter()
            .collect()
    }
}

/// Decodes a single SSE line; comments, blank lines and other fields yield
/// nothing, and malformed payloads are skipped.
fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    let value: Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => {
            warn!("Skipping malformed stream event: {}", e);
            return None;
        }
    };

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| error.to_string());
        return Some(SseEvent::Error(message));
    }

    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .filter(|content| !content.is_empty())
        .map(|content| SseEvent::Content(content.to_string()))
}

struct SseState {
    bytes: BoxStream<'static, Result<Vec<u8>>>,
    decoder: SseDecoder,
    queue: VecDeque<Result<String>>,
    finished: bool,
}

impl SseState {
    /// Queues decoded events; returns true once the stream is over
    fn absorb(&mut self, events: Vec<SseEvent>) -> bool {
        for event in events {
            match event {
                SseEvent::Content(text) => self.queue.push_back(Ok(text)),
                SseEvent::Error(message) => {
                    self.queue
                        .push_back(Err(LLMError::ProviderUnavailable(message)));
                    return true;
                }
                SseEvent::Done => return true,
            }
        }
        false
    }
}

/// Turns raw response bytes into text chunks, ending at `[DONE]`.
///
/// A body that ends without `[DONE]` means the server went away mid-answer and
/// is reported as a network error.
fn sse_chunks(bytes: BoxStream<'static, Result<Vec<u8>>>) -> ChunkStream {
    let state = SseState {
        bytes,
        decoder: SseDecoder::default(),
        queue: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.push(&bytes);
                    state.finished = state.absorb(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => {
                    let events = state.decoder.finish();
                    if !state.absorb(events) {
                        state.queue.push_back(Err(LLMError::NetworkError(
                            "stream ended before [DONE]".to_string(),
                        )));
                    }
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}
