//! Integration tests for the agent facade and the streaming tool loop
//!
//! Scripted in-process backends stand in for llama-server so every branch of
//! the loop (tool calls, fallback, limits, confirmations) runs deterministically.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use aira_engine::actions::{ActionExecutor, ActionHandlers, ActionKind, ActionPolicy, ActionRule, DEFAULT_SESSION};
use aira_engine::agent::{Agent, AgentSettings, ReplyStream, REASONING_LIMIT_NOTICE};
use aira_engine::config::RoutingConfig;
use aira_engine::fs_guard::FileSystemGuard;
use aira_engine::llm::{ChatBackend, ChunkStream, GenerationOptions, LLMError, ModelRouter, Result as LLMResult};
use aira_engine::memory::{is_summary, MemoryStore, RetentionPolicy, Summarizer};
use sdk::errors::EngineError;
use sdk::types::{ConversationTurn, TurnRole};

/// What a scripted backend does on one call
enum Script {
    /// Stream these chunks, then end normally
    Reply(Vec<&'static str>),
    /// Fail before the first byte with a transport error
    Refuse,
    /// Stream these chunks, then fail with a transport error
    DieMidStream(Vec<&'static str>),
    /// Stream these chunks, then never finish
    Stall(Vec<&'static str>),
}

struct ScriptedBackend {
    id: String,
    script: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<Vec<ConversationTurn>>>,
}

impl ScriptedBackend {
    fn new(id: &str, script: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            script: Mutex::new(script.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompt(&self, call: usize) -> Vec<ConversationTurn> {
        self.prompts.lock().unwrap()[call].clone()
    }
}

fn chunks(parts: Vec<&'static str>) -> Vec<LLMResult<String>> {
    parts.into_iter().map(|p| Ok(p.to_string())).collect()
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn stream_chat(
        &self,
        messages: &[ConversationTurn],
        _options: &GenerationOptions,
    ) -> LLMResult<ChunkStream> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Script::Reply(parts)) => Ok(stream::iter(chunks(parts)).boxed()),
            Some(Script::Refuse) => Err(LLMError::ProviderUnavailable("connection refused".to_string())),
            Some(Script::DieMidStream(parts)) => {
                let mut items = chunks(parts);
                items.push(Err(LLMError::NetworkError("connection reset".to_string())));
                Ok(stream::iter(items).boxed())
            }
            Some(Script::Stall(parts)) => Ok(stream::iter(chunks(parts)).chain(stream::pending()).boxed()),
            None => Err(LLMError::InvalidRequest("script exhausted".to_string())),
        }
    }
}

struct Harness {
    _temp: TempDir,
    agent: Agent,
    small: Arc<ScriptedBackend>,
    big: Arc<ScriptedBackend>,
    history: PathBuf,
}

fn test_settings() -> AgentSettings {
    AgentSettings {
        system_prompt: "Kamu adalah AIRA.".to_string(),
        max_tool_iterations: 2,
        window_turns: 6,
        generation: GenerationOptions::default(),
        generation_timeout: Duration::from_secs(5),
    }
}

fn harness(small: Vec<Script>, big: Vec<Script>) -> Harness {
    harness_with(small, big, false, test_settings())
}

fn harness_with(small: Vec<Script>, big: Vec<Script>, partitioned: bool, settings: AgentSettings) -> Harness {
    harness_with_memory(small, big, settings, |history| {
        MemoryStore::new(history, RetentionPolicy::HardTrim { max_turns: 40 }, partitioned)
    })
}

fn harness_with_memory(
    small: Vec<Script>,
    big: Vec<Script>,
    settings: AgentSettings,
    memory: impl FnOnce(PathBuf) -> MemoryStore,
) -> Harness {
    let temp = TempDir::new().unwrap();
    let workspace = temp.path().join("workspace");
    std::fs::create_dir(&workspace).unwrap();
    std::fs::write(workspace.join("notes.txt"), "catatan rahasia proyek").unwrap();

    let guard = FileSystemGuard::new(workspace).unwrap();
    let handlers = ActionHandlers::new(guard, 8000, "Review {filename}:\n{content}".to_string());
    let policy = ActionPolicy::new(
        ActionKind::ALL
            .iter()
            .map(|kind| {
                (
                    *kind,
                    ActionRule {
                        requires_confirmation: *kind == ActionKind::Shutdown,
                    },
                )
            })
            .collect(),
    );
    let executor = ActionExecutor::new(policy, handlers);

    let small = ScriptedBackend::new("3b", small);
    let big = ScriptedBackend::new("7b", big);
    let router = ModelRouter::new(
        vec![
            Arc::clone(&small) as Arc<dyn ChatBackend>,
            Arc::clone(&big) as Arc<dyn ChatBackend>,
        ],
        "3b",
        Some("7b".to_string()),
        RoutingConfig::default(),
        Duration::from_millis(200),
    )
    .unwrap();

    let history = temp.path().join("chat_history.json");
    let memory = Arc::new(memory(history.clone()));

    Harness {
        agent: Agent::new(router, executor, memory, settings),
        _temp: temp,
        small,
        big,
        history,
    }
}

async fn collect(stream: ReplyStream) -> String {
    stream.collect::<Vec<String>>().await.concat()
}

async fn ask(harness: &Harness, message: &str) -> String {
    let stream = harness
        .agent
        .handle(DEFAULT_SESSION, message, None)
        .await
        .unwrap();
    collect(stream).await
}

const COMPLEX_MESSAGE: &str = "Tolong refactor kode ini:\n```rust\nfn main() { let x = 1; }\n```";

#[tokio::test]
async fn test_plain_answer_is_streamed_and_recorded() {
    let h = harness(vec![Script::Reply(vec!["Rust ", "itu ", "aman."])], vec![]);

    let stream = h.agent.handle(DEFAULT_SESSION, "apa itu Rust?", None).await.unwrap();
    let parts: Vec<String> = stream.collect().await;
    assert_eq!(parts, vec!["Rust ", "itu ", "aman."]);

    let turns = h.agent.memory().turns(None);
    assert_eq!(
        turns,
        vec![
            ConversationTurn::user("apa itu Rust?"),
            ConversationTurn::assistant("Rust itu aman."),
        ]
    );
    assert!(h.history.exists());
    assert_eq!(h.big.calls(), 0);
}

#[tokio::test]
async fn test_prompt_contains_system_prompt_and_history() {
    let h = harness(
        vec![Script::Reply(vec!["Halo!"]), Script::Reply(vec!["Namamu Budi."])],
        vec![],
    );

    ask(&h, "halo, namaku Budi").await;
    ask(&h, "siapa namaku?").await;

    let prompt = h.small.prompt(1);
    assert_eq!(prompt[0].role, TurnRole::System);
    assert_eq!(prompt[0].content, "Kamu adalah AIRA.");
    assert_eq!(prompt[1], ConversationTurn::user("halo, namaku Budi"));
    assert_eq!(prompt[2], ConversationTurn::assistant("Halo!"));
    assert_eq!(prompt.last(), Some(&ConversationTurn::user("siapa namaku?")));
}

#[tokio::test]
async fn test_tool_loop_reads_file_then_answers() {
    let h = harness(
        vec![
            Script::Reply(vec![r#"{"action": "read_file", "params": {"path": "notes.txt"}}"#]),
            Script::Reply(vec!["File itu berisi catatan proyek."]),
        ],
        vec![],
    );

    let reply = ask(&h, "apa isi notes.txt?").await;
    assert!(reply.ends_with("File itu berisi catatan proyek."));

    let second_prompt = h.small.prompt(1);
    let tool_result = second_prompt.last().unwrap();
    assert_eq!(tool_result.role, TurnRole::User);
    assert!(tool_result.content.starts_with("[TOOL RESULT]"));
    assert!(tool_result.content.contains("catatan rahasia proyek"));

    // Only the question and the final answer are remembered
    let turns = h.agent.memory().turns(None);
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1].content, "File itu berisi catatan proyek.");
}

#[tokio::test]
async fn test_reasoning_limit_records_nothing() {
    let h = harness(
        vec![
            Script::Reply(vec![r#"{"action": "get_time"}"#]),
            Script::Reply(vec![r#"{"action": "get_time"}"#]),
            Script::Reply(vec!["never reached"]),
        ],
        vec![],
    );

    let reply = ask(&h, "tolong cek sesuatu untukku").await;
    assert!(reply.ends_with(REASONING_LIMIT_NOTICE));
    assert_eq!(h.small.calls(), 2);
    assert!(h.agent.memory().is_empty(None));
}

#[tokio::test]
async fn test_unknown_action_from_model_is_final_answer() {
    let h = harness(vec![Script::Reply(vec![r#"{"action": "format_disk"}"#])], vec![]);

    let reply = ask(&h, "hapus semuanya").await;
    assert_eq!(reply, r#"{"action": "format_disk"}"#);
    assert_eq!(h.small.calls(), 1);
    assert_eq!(h.agent.memory().len(None), 2);
}

#[tokio::test]
async fn test_fallback_to_default_on_transport_failure() {
    let h = harness_with(
        vec![Script::Reply(vec!["jawaban ", "cadangan"])],
        vec![Script::Refuse],
        true,
        test_settings(),
    );

    let reply = ask(&h, COMPLEX_MESSAGE).await;
    assert!(reply.contains("[7b unavailable, switching to 3b]"));
    assert!(reply.ends_with("jawaban cadangan"));
    assert_eq!(h.big.calls(), 1);
    assert_eq!(h.small.calls(), 1);

    // Same payload on the retry
    assert_eq!(h.small.prompt(0), h.big.prompt(0));

    // Recorded under the backend that actually answered
    assert_eq!(h.agent.memory().len(Some("3b")), 2);
    assert_eq!(h.agent.memory().len(Some("7b")), 0);
}

#[tokio::test]
async fn test_fallback_after_mid_stream_failure() {
    let h = harness(
        vec![Script::Reply(vec!["jawaban lengkap"])],
        vec![Script::DieMidStream(vec!["setengah "])],
    );

    let reply = ask(&h, COMPLEX_MESSAGE).await;
    assert!(reply.starts_with("setengah "));
    assert!(reply.contains("switching to 3b"));
    assert!(reply.ends_with("jawaban lengkap"));

    let turns = h.agent.memory().turns(None);
    assert_eq!(turns[1].content, "jawaban lengkap");
}

#[tokio::test]
async fn test_fallback_happens_only_once() {
    let h = harness(vec![Script::Refuse], vec![Script::Refuse]);

    let reply = ask(&h, COMPLEX_MESSAGE).await;
    assert!(reply.contains("switching to 3b"));
    assert!(reply.contains("[model unavailable:"));
    assert_eq!(h.small.calls(), 1);
    assert_eq!(h.big.calls(), 1);
    assert!(h.agent.memory().is_empty(None));
}

#[tokio::test]
async fn test_default_backend_failure_has_no_fallback() {
    let h = harness(vec![Script::Refuse], vec![Script::Reply(vec!["unused"])]);

    let reply = ask(&h, "halo").await;
    assert!(reply.contains("[model unavailable:"));
    assert!(!reply.contains("switching"));
    assert_eq!(h.big.calls(), 0);
}

#[tokio::test]
async fn test_explicit_backend_override() {
    let h = harness(vec![], vec![Script::Reply(vec!["dari 7b"])]);

    let stream = h.agent.handle(DEFAULT_SESSION, "halo", Some("7b")).await.unwrap();
    assert_eq!(collect(stream).await, "dari 7b");
    assert_eq!(h.small.calls(), 0);
}

#[tokio::test]
async fn test_generation_deadline_counts_as_failure() {
    let mut settings = test_settings();
    settings.generation_timeout = Duration::from_millis(200);
    let h = harness_with(vec![Script::Stall(vec!["mulai..."])], vec![], false, settings);

    let reply = tokio::time::timeout(Duration::from_secs(5), ask(&h, "halo"))
        .await
        .expect("relay should give up at the deadline");
    assert!(reply.starts_with("mulai..."));
    assert!(reply.contains("[model unavailable:"));
    assert!(h.agent.memory().is_empty(None));
}

#[tokio::test]
async fn test_dropped_stream_records_nothing() {
    let h = harness(vec![Script::Stall(vec!["sebagian"])], vec![]);

    let mut stream = h.agent.handle(DEFAULT_SESSION, "ceritakan sesuatu", None).await.unwrap();
    assert_eq!(stream.next().await.as_deref(), Some("sebagian"));
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.agent.memory().is_empty(None));
    assert!(!h.history.exists());
}

#[tokio::test]
async fn test_time_question_uses_fast_path() {
    let h = harness(vec![Script::Reply(vec!["unused"])], vec![]);

    let reply = ask(&h, "jam berapa sekarang").await;
    assert!(reply.starts_with("Hari ini "));
    assert!(reply.contains(", jam "));
    assert!(!reply.contains('{'));
    assert_eq!(h.small.calls(), 0);
    assert_eq!(h.big.calls(), 0);
    assert!(h.agent.memory().is_empty(None));
}

#[tokio::test]
async fn test_typed_tool_call_runs_without_model() {
    let h = harness(vec![], vec![]);

    let reply = ask(&h, r#"{"action": "read_file", "params": {"path": "notes.txt"}}"#).await;
    assert!(reply.contains("catatan rahasia proyek"));
    assert_eq!(h.small.calls(), 0);
    assert!(h.agent.memory().is_empty(None));
}

#[tokio::test]
async fn test_typed_tool_call_outside_workspace_fails() {
    let h = harness(vec![], vec![]);

    let reply = ask(&h, r#"{"action": "read_file", "params": {"path": "../../etc/passwd"}}"#).await;
    assert!(reply.starts_with("action failed: "));
    assert!(!reply.contains("root:"));
}

#[tokio::test]
async fn test_shutdown_requires_confirmation() {
    let h = harness(vec![], vec![]);

    let reply = ask(&h, r#"{"action": "shutdown"}"#).await;
    assert!(reply.contains("needs confirmation"));
    assert!(!h.agent.shutdown_requested());

    ask(&h, "ya").await;
    assert!(h.agent.shutdown_requested());
}

#[tokio::test]
async fn test_pending_confirmation_consumes_next_message() {
    let h = harness(vec![], vec![]);

    ask(&h, r#"{"action": "shutdown"}"#).await;
    let reply = ask(&h, "jam berapa sekarang").await;
    assert!(reply.contains("cancelled"));
    assert!(!h.agent.shutdown_requested());

    let reply = ask(&h, "jam berapa sekarang").await;
    assert!(reply.starts_with("Hari ini "));
}

#[tokio::test]
async fn test_model_requested_shutdown_waits_for_user() {
    let h = harness(vec![Script::Reply(vec![r#"{"action": "shutdown"}"#])], vec![]);

    let reply = ask(&h, "matikan servernya").await;
    assert!(reply.contains("needs confirmation"));
    assert!(!h.agent.shutdown_requested());
    assert!(h.agent.memory().is_empty(None));

    ask(&h, "yes").await;
    assert!(h.agent.shutdown_requested());
}

#[tokio::test]
async fn test_validation_errors_are_synchronous() {
    let h = harness(vec![Script::Reply(vec!["unused"])], vec![]);

    let err = h.agent.handle(DEFAULT_SESSION, "   ", None).await.err().unwrap();
    assert!(matches!(err, EngineError::EmptyMessage));

    let err = h.agent.handle(DEFAULT_SESSION, "halo", Some("70b")).await.err().unwrap();
    assert!(matches!(err, EngineError::UnknownBackend(_)));

    assert_eq!(h.small.calls(), 0);
    assert!(h.agent.memory().is_empty(None));
}

struct SlowSummarizer;

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(
        &self,
        _previous: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<String, EngineError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(format!("ringkasan {} giliran", turns.len()))
    }
}

#[tokio::test]
async fn test_stream_ends_after_summarized_exchange_is_persisted() {
    let h = harness_with_memory(
        vec![
            Script::Reply(vec!["a0"]),
            Script::Reply(vec!["a1"]),
            Script::Reply(vec!["a2"]),
        ],
        vec![],
        test_settings(),
        |history| {
            MemoryStore::new(history, RetentionPolicy::Summarize { max_turns: 4, keep: 2 }, false)
                .with_summarizer(Arc::new(SlowSummarizer))
        },
    );

    ask(&h, "q0").await;
    ask(&h, "q1").await;
    ask(&h, "q2").await;

    // No waiting: once the stream is drained the summary is already stored
    let turns = h.agent.memory().turns(None);
    assert!(is_summary(&turns[0]));
    assert_eq!(turns[0].content, "ringkasan 4 giliran");
    assert_eq!(&turns[1..], &[ConversationTurn::user("q2"), ConversationTurn::assistant("a2")]);

    let on_disk: Vec<ConversationTurn> =
        serde_json::from_str(&std::fs::read_to_string(&h.history).unwrap()).unwrap();
    assert_eq!(on_disk, turns);

    // The next prompt carries the summary
    ask(&h, "q3").await;
    assert!(h.small.prompt(3).iter().any(|t| t.content.contains("ringkasan 4 giliran")));
}
