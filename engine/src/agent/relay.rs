//! Streaming relay and tool loop
//!
//! Runs one exchange on a background task and forwards every generated chunk
//! to the caller through a bounded channel as soon as it arrives:
//!
//! 1. Build the prompt: system prompt, long-term summary, recent window, message
//! 2. Stream a generation from the routed backend (bounded by a deadline)
//! 3. If the output is a tool-call for an allowed action: run it, add the
//!    result to the prompt, and go again (at most `max_tool_iterations` times)
//! 4. Otherwise the output is the final reply; record the exchange in memory
//!
//! The stream ends once the exchange is recorded, retention included, so the
//! next message always sees it in its prompt.
//!
//! A transport failure on the complex backend is retried once on the default
//! backend. If the caller drops the stream, generation stops and nothing is
//! recorded.

use super::core::{AgentSettings, ReplyStream};
use crate::actions::{ActionExecutor, ActionOutcome};
use crate::llm::{parse_tool_call, LLMError, ModelRouter, RoutingDecision};
use crate::memory::MemoryStore;
use futures::StreamExt;
use sdk::errors::{EngineError, EngineErrorExt};
use sdk::types::ConversationTurn;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn, Instrument};

/// Chunks buffered between the generating task and a slow reader
const RELAY_BUFFER: usize = 32;

/// Sent when the tool loop ends without a final answer
pub const REASONING_LIMIT_NOTICE: &str = "\n[reasoning limit reached: no final answer]";

/// Prefix of tool results fed back to the model
const TOOL_RESULT_PREFIX: &str = "[TOOL RESULT]\n";

/// Prefix of the long-term summary in the prompt
const LONG_TERM_PREFIX: &str = "Ringkasan percakapan sebelumnya:\n";

/// One user message on its way through the loop
pub(crate) struct Exchange {
    pub session: String,
    pub message: String,
    pub decision: RoutingDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeEnd {
    Answered,
    AwaitingConfirmation,
    ReasoningLimit,
    Failed,
    Disconnected,
}

enum GenerationFailure {
    /// The caller dropped the reply stream
    Disconnected,
    Backend(LLMError),
}

pub(crate) struct ToolLoop {
    pub router: Arc<ModelRouter>,
    pub executor: Arc<ActionExecutor>,
    pub memory: Arc<MemoryStore>,
    pub settings: Arc<AgentSettings>,
}

impl ToolLoop {
    /// Starts the exchange on a background task in the current span.
    pub(crate) fn spawn(self, exchange: Exchange) -> ReplyStream {
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        tokio::spawn(self.run(exchange, tx).in_current_span());
        ReceiverStream::new(rx).boxed()
    }

    async fn run(self, exchange: Exchange, tx: mpsc::Sender<String>) {
        let Exchange {
            session,
            message,
            decision,
        } = exchange;
        let started = Instant::now();
        let max_iterations = self.settings.max_tool_iterations;

        let mut prompt = self.build_prompt(&decision.backend_id, &message);
        let mut backend_id = decision.backend_id;
        let mut fell_back = false;
        let mut final_reply = None;
        let mut end = ExchangeEnd::ReasoningLimit;

        'iterations: for iteration in 1..=max_iterations {
            debug!(
                "Tool loop iteration {}/{} on backend '{}'",
                iteration, max_iterations, backend_id
            );

            let text = loop {
                let error = match self.generate(&backend_id, &prompt, &tx).await {
                    Ok(text) => break text,
                    Err(GenerationFailure::Disconnected) => {
                        end = ExchangeEnd::Disconnected;
                        break 'iterations;
                    }
                    Err(GenerationFailure::Backend(e)) => e,
                };

                let fallback = if error.is_transport() && !fell_back {
                    self.router.fallback_for(&backend_id)
                } else {
                    None
                };
                let Some(next) = fallback else {
                    error!("Backend '{}' failed: {}", backend_id, error);
                    let hint = EngineError::from(error);
                    let _ = tx
                        .send(format!("\n[model unavailable: {}]", hint.user_hint()))
                        .await;
                    end = ExchangeEnd::Failed;
                    break 'iterations;
                };

                warn!(
                    "Backend '{}' failed ({}), falling back to '{}'",
                    backend_id, error, next
                );
                let notice = format!("\n[{} unavailable, switching to {}]\n", backend_id, next);
                backend_id = next.to_string();
                fell_back = true;
                if tx.send(notice).await.is_err() {
                    end = ExchangeEnd::Disconnected;
                    break 'iterations;
                }
            };

            let Some(request) = parse_tool_call(&text) else {
                final_reply = Some(text);
                end = ExchangeEnd::Answered;
                break;
            };

            let action = request.action.clone();
            match self.executor.dispatch(&session, request).await {
                ActionOutcome::NotAnAction => {
                    debug!("Model named '{}', not an allowed action", action);
                    final_reply = Some(text);
                    end = ExchangeEnd::Answered;
                    break;
                }
                ActionOutcome::ConfirmationRequired(question) => {
                    let _ = tx.send(format!("\n\n{}", question)).await;
                    end = ExchangeEnd::AwaitingConfirmation;
                    break;
                }
                outcome => {
                    info!("Model ran action '{}' in iteration {}", action, iteration);
                    let result = outcome.text().unwrap_or_default();
                    prompt.push(ConversationTurn::assistant(text));
                    prompt.push(ConversationTurn::user(format!("{}{}", TOOL_RESULT_PREFIX, result)));
                    if tx.send("\n\n".to_string()).await.is_err() {
                        end = ExchangeEnd::Disconnected;
                        break;
                    }
                }
            }
        }

        if end == ExchangeEnd::ReasoningLimit {
            warn!("{}", EngineError::ReasoningLimitReached(max_iterations));
            let _ = tx.send(REASONING_LIMIT_NOTICE.to_string()).await;
        }

        match final_reply {
            Some(reply) if end == ExchangeEnd::Answered && !reply.trim().is_empty() => {
                self.memory
                    .append(&message, reply.trim(), Some(&backend_id))
                    .await;
            }
            _ => debug!("Exchange not recorded in memory"),
        }

        info!(
            outcome = ?end,
            backend = %backend_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Exchange finished"
        );
    }

    fn build_prompt(&self, backend_id: &str, message: &str) -> Vec<ConversationTurn> {
        let mut prompt = vec![ConversationTurn::system(&self.settings.system_prompt)];
        if let Some(summary) = self.memory.long_term_summary(Some(backend_id)) {
            prompt.push(ConversationTurn::system(format!("{}{}", LONG_TERM_PREFIX, summary)));
        }
        prompt.extend(
            self.memory
                .recent_window(Some(backend_id), self.settings.window_turns),
        );
        prompt.push(ConversationTurn::user(message));
        prompt
    }

    /// Streams one generation to the caller and returns the whole text.
    async fn generate(
        &self,
        backend_id: &str,
        prompt: &[ConversationTurn],
        tx: &mpsc::Sender<String>,
    ) -> Result<String, GenerationFailure> {
        let backend = self.router.backend(backend_id).ok_or_else(|| {
            GenerationFailure::Backend(LLMError::InvalidRequest(format!(
                "unknown backend '{}'",
                backend_id
            )))
        })?;
        let deadline = Instant::now() + self.settings.generation_timeout;

        let started = tokio::select! {
            _ = tx.closed() => return Err(GenerationFailure::Disconnected),
            started = timeout_at(deadline, backend.stream_chat(prompt, &self.settings.generation)) => started,
        };
        let mut stream = match started {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(GenerationFailure::Backend(e)),
            Err(_) => return Err(GenerationFailure::Backend(LLMError::Timeout)),
        };

        let mut text = String::new();
        loop {
            let next = tokio::select! {
                _ = tx.closed() => return Err(GenerationFailure::Disconnected),
                next = timeout_at(deadline, stream.next()) => next,
            };
            match next {
                Ok(Some(Ok(chunk))) => {
                    text.push_str(&chunk);
                    if tx.send(chunk).await.is_err() {
                        return Err(GenerationFailure::Disconnected);
                    }
                }
                Ok(Some(Err(e))) => return Err(GenerationFailure::Backend(e)),
                Ok(None) => return Ok(text),
                Err(_) => return Err(GenerationFailure::Backend(LLMError::Timeout)),
            }
        }
    }
}
