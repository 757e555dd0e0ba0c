//! Agent Core
//!
//! The single entry point hosts call for every chat message. `handle` takes a
//! message through these steps, first match wins:
//!
//! 1. Reject empty messages and unknown backend choices (synchronously)
//! 2. Resolve a pending confirmation for the session
//! 3. Run a tool-call the user typed directly
//! 4. Answer fast-path intents (time, status, listing) without a model
//! 5. Route to a backend and run the streaming tool loop
//!
//! Steps 2-4 reply with a single chunk and leave memory untouched.

use futures::stream::{self, BoxStream};
use futures::StreamExt;
use sdk::errors::EngineError;
use sdk::types::ActionRequest;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use super::relay::{Exchange, ToolLoop};
use crate::actions::{ActionExecutor, ActionHandlers, ActionPolicy};
use crate::config::Config;
use crate::fs_guard::FileSystemGuard;
use crate::intent;
use crate::llm::{BackendSummarizer, GenerationOptions, ModelRouter};
use crate::memory::MemoryStore;

/// Text chunks of one reply, in order
pub type ReplyStream = BoxStream<'static, String>;

/// Settings for the tool loop
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub system_prompt: String,

    /// Model turns per exchange, tool calls included
    pub max_tool_iterations: usize,

    /// Recent turns included in the prompt
    pub window_turns: usize,

    pub generation: GenerationOptions,

    /// Limit on a single generation, first byte to last
    pub generation_timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.agent.system_prompt.clone(),
            max_tool_iterations: config.agent.max_tool_iterations,
            window_turns: config.memory.window_turns,
            generation: GenerationOptions {
                temperature: config.llm.temperature,
                max_tokens: config.llm.max_tokens,
            },
            generation_timeout: Duration::from_secs(config.llm.generation_timeout_secs),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&Config::default_config())
    }
}

/// The assistant: routing, actions, memory and the tool loop behind one call
#[derive(Clone)]
pub struct Agent {
    router: Arc<ModelRouter>,
    executor: Arc<ActionExecutor>,
    memory: Arc<MemoryStore>,
    settings: Arc<AgentSettings>,
}

impl Agent {
    pub fn new(
        router: ModelRouter,
        executor: ActionExecutor,
        memory: Arc<MemoryStore>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            router: Arc::new(router),
            executor: Arc::new(executor),
            memory,
            settings: Arc::new(settings),
        }
    }

    /// Wires every component from a validated config and loads the history.
    ///
    /// # Errors
    ///
    /// Fails if a backend client cannot be built or the workspace cannot be
    /// resolved.
    pub async fn from_config(config: &Config) -> Result<Self, EngineError> {
        let router = ModelRouter::from_config(&config.llm, &config.routing)?;
        let settings = AgentSettings::from_config(config);

        let guard = FileSystemGuard::new(config.core.workspace.clone())?;
        let handlers = ActionHandlers::new(
            guard,
            config.agent.max_file_bytes,
            config.agent.review_template.clone(),
        );
        let executor = ActionExecutor::new(
            ActionPolicy::from_config(&config.agent.allowed_actions),
            handlers,
        );

        let mut memory = MemoryStore::from_config(config);
        if let Some(backend) = router.backend(router.default_id()) {
            memory = memory.with_summarizer(Arc::new(BackendSummarizer::new(
                backend,
                settings.generation,
                settings.generation_timeout,
            )));
        }
        memory.load().await;

        info!(
            "Agent ready: backends {:?}, workspace {:?}",
            router.backend_ids(),
            config.core.workspace
        );
        Ok(Self::new(router, executor, Arc::new(memory), settings))
    }

    /// Handles one chat message and returns the reply as a stream of chunks.
    ///
    /// `backend` is an explicit backend id, or `None`/`"auto"` to let the
    /// router choose.
    ///
    /// # Errors
    ///
    /// `EmptyMessage` or `UnknownBackend`, before anything else happens.
    /// Every later failure is reported as text inside the stream.
    pub async fn handle(
        &self,
        session: &str,
        message: &str,
        backend: Option<&str>,
    ) -> Result<ReplyStream, EngineError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let decision = self.router.route(message, backend)?;

        let request_id = Uuid::new_v4();
        let span = info_span!("exchange", %request_id, session = %session);

        async move {
            info!(
                backend = %decision.backend_id,
                "Handling message ({} chars)",
                message.chars().count()
            );

            let outcome = self.executor.handle_message(session, message).await;
            if let Some(text) = outcome.text() {
                debug!("Answered by the action executor");
                return Ok(single_chunk(text));
            }

            if let Some(kind) = intent::detect(message) {
                let outcome = self
                    .executor
                    .dispatch(session, ActionRequest::new(kind.name()))
                    .await;
                if let Some(text) = outcome.text() {
                    info!(action = %kind, "Answered on the fast path");
                    return Ok(single_chunk(text));
                }
            }

            let tool_loop = ToolLoop {
                router: Arc::clone(&self.router),
                executor: Arc::clone(&self.executor),
                memory: Arc::clone(&self.memory),
                settings: Arc::clone(&self.settings),
            };
            Ok(tool_loop.spawn(Exchange {
                session: session.to_string(),
                message: message.to_string(),
                decision,
            }))
        }
        .instrument(span)
        .await
    }

    /// Checks every backend; ids map to up (`true`) or down.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        self.router.health_check().await
    }

    /// True once a confirmed `shutdown` action ran
    pub fn shutdown_requested(&self) -> bool {
        self.executor
            .handlers()
            .shutdown_flag()
            .load(Ordering::SeqCst)
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }
}

fn single_chunk(text: &str) -> ReplyStream {
    stream::iter([text.to_string()]).boxed()
}
