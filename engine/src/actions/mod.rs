//! Action registry and executor
//!
//! Actions are the only side effects the assistant can trigger: reading the
//! clock, inspecting the host, and looking at files inside the workspace. A
//! request names an action and carries parameters; it arrives either from the
//! model (a tool-call in its output), from the user typing the same JSON, or
//! from the intent fast path.
//!
//! Every request goes through the [`ActionPolicy`] allow-list. Actions marked
//! `confirm` are parked per session until the next message from that session
//! either confirms (`ya`, `yes`, `ok`, ...) or cancels them.

pub mod handlers;
mod system;

pub use handlers::ActionHandlers;

use crate::config::ActionRuleConfig;
use crate::llm::parse_tool_call;
use sdk::errors::{EngineError, EngineErrorExt, ErrorKind};
use sdk::types::ActionRequest;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Session id used by single-user hosts
pub const DEFAULT_SESSION: &str = "default";

/// Replies that confirm a pending action (compared trimmed, case-insensitive)
const AFFIRMATIVE_REPLIES: &[&str] = &["ya", "iya", "y", "yes", "ok", "oke", "lanjut", "confirm"];

/// The closed set of actions the executor knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActionKind {
    GetTime,
    GetSystemStatus,
    ListFiles,
    ReadFile,
    AnalyzeFile,
    Shutdown,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::GetTime,
        ActionKind::GetSystemStatus,
        ActionKind::ListFiles,
        ActionKind::ReadFile,
        ActionKind::AnalyzeFile,
        ActionKind::Shutdown,
    ];

    /// Wire name used in tool-calls and in the allow-list
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::GetTime => "get_time",
            ActionKind::GetSystemStatus => "get_system_status",
            ActionKind::ListFiles => "list_files",
            ActionKind::ReadFile => "read_file",
            ActionKind::AnalyzeFile => "analyze_file",
            ActionKind::Shutdown => "shutdown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Example invocation shown when a required parameter is missing
    fn usage(self) -> String {
        match self {
            ActionKind::ReadFile | ActionKind::AnalyzeFile => format!(
                r#"Usage: {{"action": "{}", "params": {{"path": "src/main.rs"}}}}"#,
                self.name()
            ),
            ActionKind::ListFiles => {
                r#"Usage: {"action": "list_files", "params": {"path": "."}}"#.to_string()
            }
            other => format!(r#"Usage: {{"action": "{}"}}"#, other.name()),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-action rule from the allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionRule {
    pub requires_confirmation: bool,
}

/// Allow-list of runnable actions
///
/// Actions missing from the policy are treated as if the request were not an
/// action at all.
#[derive(Debug, Clone, Default)]
pub struct ActionPolicy {
    rules: BTreeMap<ActionKind, ActionRule>,
}

impl ActionPolicy {
    pub fn new(rules: BTreeMap<ActionKind, ActionRule>) -> Self {
        Self { rules }
    }

    /// Builds the policy from the `[agent.allowed_actions]` table.
    ///
    /// Names were checked during config validation; anything unknown that
    /// slips through is logged and skipped.
    pub fn from_config(allowed: &BTreeMap<String, ActionRuleConfig>) -> Self {
        let mut rules = BTreeMap::new();
        for (name, rule) in allowed {
            match ActionKind::from_name(name) {
                Some(kind) => {
                    rules.insert(
                        kind,
                        ActionRule {
                            requires_confirmation: rule.confirm,
                        },
                    );
                }
                None => warn!("Ignoring unknown action '{}' in allow-list", name),
            }
        }
        Self { rules }
    }

    pub fn rule(&self, kind: ActionKind) -> Option<ActionRule> {
        self.rules.get(&kind).copied()
    }

    pub fn is_allowed(&self, kind: ActionKind) -> bool {
        self.rules.contains_key(&kind)
    }
}

/// An action parked until the user confirms it
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub request: ActionRequest,
}

/// What happened to a message offered to the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Not a (known, allowed) action; the caller should keep going
    NotAnAction,
    /// The action ran and produced this text
    Executed(String),
    /// The action was parked; the text asks the user to confirm
    ConfirmationRequired(String),
    /// A pending action was declined
    Cancelled(String),
    /// A required parameter was missing; the text shows how to call it
    Usage(String),
    /// The handler failed; the text is `action failed: <reason>`
    Failed(String),
}

impl ActionOutcome {
    /// The text shown to the user, if any
    pub fn text(&self) -> Option<&str> {
        match self {
            ActionOutcome::NotAnAction => None,
            ActionOutcome::Executed(text)
            | ActionOutcome::ConfirmationRequired(text)
            | ActionOutcome::Cancelled(text)
            | ActionOutcome::Usage(text)
            | ActionOutcome::Failed(text) => Some(text),
        }
    }
}

/// Runs allow-listed actions and tracks confirmations per session
///
/// State machine per session: `Idle` until a confirm-gated action is
/// requested, then `AwaitingConfirmation` until the next message from the same
/// session, which is consumed entirely by the confirmation check.
pub struct ActionExecutor {
    policy: ActionPolicy,
    handlers: ActionHandlers,
    pending: Mutex<HashMap<String, PendingAction>>,
}

impl ActionExecutor {
    pub fn new(policy: ActionPolicy, handlers: ActionHandlers) -> Self {
        Self {
            policy,
            handlers,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn handlers(&self) -> &ActionHandlers {
        &self.handlers
    }

    /// Offers a raw user message to the executor.
    ///
    /// A pending confirmation for `session` always wins: the message resolves
    /// it and is not interpreted any further. Otherwise the message is run if
    /// it is a structured tool-call naming an allowed action.
    pub async fn handle_message(&self, session: &str, text: &str) -> ActionOutcome {
        if let Some(pending) = self.take_pending(session) {
            return self.resolve_pending(session, pending, text).await;
        }

        match parse_tool_call(text) {
            Some(request) => self.dispatch(session, request).await,
            None => ActionOutcome::NotAnAction,
        }
    }

    /// Runs a decoded request, parking it first if the rule asks for it.
    pub async fn dispatch(&self, session: &str, request: ActionRequest) -> ActionOutcome {
        let Some(kind) = ActionKind::from_name(&request.action) else {
            debug!("'{}' is not a known action", request.action);
            return ActionOutcome::NotAnAction;
        };
        let Some(rule) = self.policy.rule(kind) else {
            debug!("Action '{}' is not in the allow-list", kind);
            return ActionOutcome::NotAnAction;
        };

        if rule.requires_confirmation {
            info!(session = %session, action = %kind, "Action awaiting confirmation");
            self.set_pending(session, PendingAction { kind, request });
            return ActionOutcome::ConfirmationRequired(format!(
                "Action '{}' needs confirmation. Reply 'ya' to continue, anything else cancels.",
                kind
            ));
        }

        self.run(kind, &request).await
    }

    /// Whether `session` has a parked action
    pub fn has_pending(&self, session: &str) -> bool {
        self.lock_pending().contains_key(session)
    }

    async fn resolve_pending(&self, session: &str, pending: PendingAction, reply: &str) -> ActionOutcome {
        if is_affirmative(reply) {
            info!(session = %session, action = %pending.kind, "Pending action confirmed");
            self.run(pending.kind, &pending.request).await
        } else {
            info!(session = %session, action = %pending.kind, "Pending action cancelled");
            ActionOutcome::Cancelled(format!("Action '{}' cancelled.", pending.kind))
        }
    }

    async fn run(&self, kind: ActionKind, request: &ActionRequest) -> ActionOutcome {
        debug!("Running action '{}' with {} params", kind, request.params.len());
        match self.handlers.run(kind, request).await {
            Ok(text) => ActionOutcome::Executed(text),
            Err(EngineError::MissingParameter(param)) => ActionOutcome::Usage(format!(
                "Action '{}' needs parameter '{}'. {}",
                kind,
                param,
                kind.usage()
            )),
            Err(e) => {
                warn!("Action '{}' failed: {}", kind, e);
                ActionOutcome::Failed(format!("action failed: {}", failure_reason(&e)))
            }
        }
    }

    fn take_pending(&self, session: &str) -> Option<PendingAction> {
        self.lock_pending().remove(session)
    }

    fn set_pending(&self, session: &str, action: PendingAction) {
        self.lock_pending().insert(session.to_string(), action);
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingAction>> {
        // The map stays consistent even if a holder panicked mid-insert
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_affirmative(reply: &str) -> bool {
    let normalized = reply
        .trim()
        .trim_end_matches(['.', '!'])
        .to_lowercase();
    AFFIRMATIVE_REPLIES.contains(&normalized.as_str())
}

/// Security errors only show their hint; the path stays in the logs.
fn failure_reason(error: &EngineError) -> String {
    if error.kind() == ErrorKind::Security || matches!(error, EngineError::NotAFile(_)) {
        error.user_hint().to_string()
    } else {
        error.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_guard::FileSystemGuard;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn executor_with(rules: &[(ActionKind, bool)]) -> (TempDir, Arc<AtomicBool>, ActionExecutor) {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("notes.txt"), "hello").unwrap();
        let guard = FileSystemGuard::new(temp.path().to_path_buf()).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handlers = ActionHandlers::new(guard, 1024, "{filename}: {content}".to_string())
            .with_shutdown_flag(shutdown.clone());
        let policy = ActionPolicy::new(
            rules
                .iter()
                .map(|(kind, confirm)| {
                    (
                        *kind,
                        ActionRule {
                            requires_confirmation: *confirm,
                        },
                    )
                })
                .collect(),
        );
        (temp, shutdown, ActionExecutor::new(policy, handlers))
    }

    fn default_rules() -> Vec<(ActionKind, bool)> {
        ActionKind::ALL
            .iter()
            .map(|kind| (*kind, *kind == ActionKind::Shutdown))
            .collect()
    }

    #[test]
    fn test_action_names_round_trip() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ActionKind::from_name("rm_rf"), None);
    }

    #[test]
    fn test_affirmative_replies() {
        assert!(is_affirmative("ya"));
        assert!(is_affirmative("  YES "));
        assert!(is_affirmative("Oke!"));
        assert!(!is_affirmative("tidak"));
        assert!(!is_affirmative("ya tapi nanti"));
    }

    #[tokio::test]
    async fn test_plain_text_is_not_an_action() {
        let (_temp, _flag, executor) = executor_with(&default_rules());
        let outcome = executor.handle_message(DEFAULT_SESSION, "halo apa kabar").await;
        assert_eq!(outcome, ActionOutcome::NotAnAction);
    }

    #[tokio::test]
    async fn test_unlisted_action_is_not_an_action() {
        let (_temp, _flag, executor) = executor_with(&[(ActionKind::GetTime, false)]);
        let outcome = executor
            .handle_message(DEFAULT_SESSION, r#"{"action": "read_file", "params": {"path": "notes.txt"}}"#)
            .await;
        assert_eq!(outcome, ActionOutcome::NotAnAction);
    }

    #[tokio::test]
    async fn test_typed_tool_call_executes() {
        let (_temp, _flag, executor) = executor_with(&default_rules());
        let outcome = executor
            .handle_message(DEFAULT_SESSION, r#"{"action": "read_file", "params": {"path": "notes.txt"}}"#)
            .await;
        match outcome {
            ActionOutcome::Executed(text) => assert!(text.contains("hello")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_parameter_gives_usage() {
        let (_temp, _flag, executor) = executor_with(&default_rules());
        let outcome = executor
            .dispatch(DEFAULT_SESSION, ActionRequest::new("read_file"))
            .await;
        match outcome {
            ActionOutcome::Usage(text) => {
                assert!(text.contains("path"));
                assert!(text.contains("Usage"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_outside_workspace_fails_without_leaking_path() {
        let (_temp, _flag, executor) = executor_with(&default_rules());
        let request = ActionRequest::new("read_file").with_param("path", json!("../../etc/passwd"));
        let outcome = executor.dispatch(DEFAULT_SESSION, request).await;
        match outcome {
            ActionOutcome::Failed(text) => {
                assert!(text.starts_with("action failed: "));
                assert!(!text.contains("passwd"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_confirmation_then_yes_executes() {
        let (_temp, flag, executor) = executor_with(&default_rules());

        let outcome = executor
            .handle_message(DEFAULT_SESSION, r#"{"action": "shutdown"}"#)
            .await;
        assert!(matches!(outcome, ActionOutcome::ConfirmationRequired(_)));
        assert!(executor.has_pending(DEFAULT_SESSION));
        assert!(!flag.load(Ordering::SeqCst));

        let outcome = executor.handle_message(DEFAULT_SESSION, "ya").await;
        assert!(matches!(outcome, ActionOutcome::Executed(_)));
        assert!(!executor.has_pending(DEFAULT_SESSION));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_confirmation_then_anything_else_cancels() {
        let (_temp, flag, executor) = executor_with(&default_rules());

        executor
            .handle_message(DEFAULT_SESSION, r#"{"action": "shutdown"}"#)
            .await;
        // Even a valid tool-call is consumed by the confirmation check
        let outcome = executor
            .handle_message(DEFAULT_SESSION, r#"{"action": "get_time"}"#)
            .await;
        assert!(matches!(outcome, ActionOutcome::Cancelled(_)));
        assert!(!flag.load(Ordering::SeqCst));

        // Back to idle
        let outcome = executor.handle_message(DEFAULT_SESSION, "ya").await;
        assert_eq!(outcome, ActionOutcome::NotAnAction);
    }

    #[tokio::test]
    async fn test_pending_actions_are_per_session() {
        let (_temp, flag, executor) = executor_with(&default_rules());

        executor.handle_message("alice", r#"{"action": "shutdown"}"#).await;
        let outcome = executor.handle_message("bob", "ya").await;
        assert_eq!(outcome, ActionOutcome::NotAnAction);
        assert!(executor.has_pending("alice"));
        assert!(!flag.load(Ordering::SeqCst));
    }
}
