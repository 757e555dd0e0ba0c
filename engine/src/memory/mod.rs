//! Conversation Memory Store
//!
//! Holds the chat history across exchanges and process restarts. History is
//! kept either as one shared sequence or partitioned by backend id, bounded by
//! a [`RetentionPolicy`], and written to a single JSON file after every
//! exchange.
//!
//! Writers (append, persist, load) are serialized by an async mutex so that
//! appending both turns of an exchange and persisting them is one critical
//! section. Readers take a snapshot under a short read lock and always see
//! the history either before or after an exchange, never half of one.

mod retention;

pub use retention::{hard_trim, is_summary, split_summary, RetentionPolicy, Summarizer};

use crate::config::Config;
use sdk::errors::EngineError;
use sdk::types::ConversationTurn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Partition key used when history is not split by backend
pub const SHARED_PARTITION: &str = "default";

/// On-disk layout: a flat array, or an object of backend id to array
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredHistory {
    Flat(Vec<ConversationTurn>),
    Partitioned(BTreeMap<String, Vec<ConversationTurn>>),
}

pub struct MemoryStore {
    path: PathBuf,
    policy: RetentionPolicy,
    partition_by_backend: bool,
    summarizer: Option<Arc<dyn Summarizer>>,
    partitions: RwLock<BTreeMap<String, Vec<ConversationTurn>>>,
    writer: Mutex<()>,
}

impl MemoryStore {
    pub fn new(path: PathBuf, policy: RetentionPolicy, partition_by_backend: bool) -> Self {
        Self {
            path,
            policy,
            partition_by_backend,
            summarizer: None,
            partitions: RwLock::new(BTreeMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.history_path(),
            RetentionPolicy::from_config(&config.memory),
            config.memory.partition_by_backend,
        )
    }

    /// Summarizer used by the summarize policy.
    ///
    /// Without one the summarize policy degrades to hard trim.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Records one exchange and persists the result.
    ///
    /// Both turns land in the partition of `backend` (the backend that
    /// actually answered) and retention runs before the write.
    ///
    /// Under the summarize policy an append that overflows the cap waits for
    /// the summarizer, bounded by the summarizer's own timeout, while holding
    /// the writer lock. Callers that stream a reply (the agent) keep the
    /// stream open until this returns.
    pub async fn append(&self, user: &str, assistant: &str, backend: Option<&str>) {
        let _writer = self.writer.lock().await;
        let key = self.partition_key(backend);

        let mut turns = self.read().get(&key).cloned().unwrap_or_default();
        turns.push(ConversationTurn::user(user));
        turns.push(ConversationTurn::assistant(assistant));

        let turns = self.enforce(turns).await;
        debug!(partition = %key, turns = turns.len(), "Appended exchange");
        self.write().insert(key, turns);

        self.persist_locked().await;
    }

    /// The most recent `limit` conversation turns, oldest first.
    ///
    /// The long-term summary is not part of the window; see
    /// [`long_term_summary`](Self::long_term_summary).
    pub fn recent_window(&self, backend: Option<&str>, limit: usize) -> Vec<ConversationTurn> {
        let partitions = self.read();
        let Some(turns) = partitions.get(&self.partition_key(backend)) else {
            return Vec::new();
        };
        let (_, conversation) = split_summary(turns);
        let start = conversation.len().saturating_sub(limit);
        conversation[start..].to_vec()
    }

    /// Summary of turns that no longer fit, if the summarize policy made one
    pub fn long_term_summary(&self, backend: Option<&str>) -> Option<String> {
        let partitions = self.read();
        let turns = partitions.get(&self.partition_key(backend))?;
        split_summary(turns).0.map(|turn| turn.content.clone())
    }

    /// Every stored turn of a partition, summary included
    pub fn turns(&self, backend: Option<&str>) -> Vec<ConversationTurn> {
        self.read()
            .get(&self.partition_key(backend))
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self, backend: Option<&str>) -> usize {
        self.read()
            .get(&self.partition_key(backend))
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self, backend: Option<&str>) -> bool {
        self.len(backend) == 0
    }

    /// Writes the current state to disk. Failures are logged, never raised.
    pub async fn persist(&self) {
        let _writer = self.writer.lock().await;
        self.persist_locked().await;
    }

    /// Replaces the in-memory state with the history file.
    ///
    /// A missing, empty or unreadable file yields an empty history. Loaded
    /// partitions are cut to the cap. Returns the number of turns loaded.
    pub async fn load(&self) -> usize {
        let _writer = self.writer.lock().await;

        let loaded = match fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => match serde_json::from_str::<StoredHistory>(&contents) {
                Ok(stored) => self.unpack_stored(stored),
                Err(e) => {
                    warn!("Chat history at {:?} is corrupt, starting empty: {}", self.path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No chat history at {:?}", self.path);
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Failed to read chat history at {:?}: {}", self.path, e);
                BTreeMap::new()
            }
        };

        let cap = self.policy.max_turns();
        let loaded: BTreeMap<_, _> = loaded
            .into_iter()
            .map(|(key, turns)| (key, hard_trim(turns, cap)))
            .collect();
        let count = loaded.values().map(Vec::len).sum();
        info!("Loaded {} turns of chat history", count);

        *self.write() = loaded;
        count
    }

    fn partition_key(&self, backend: Option<&str>) -> String {
        match backend {
            Some(id) if self.partition_by_backend => id.to_string(),
            _ => SHARED_PARTITION.to_string(),
        }
    }

    fn unpack_stored(&self, stored: StoredHistory) -> BTreeMap<String, Vec<ConversationTurn>> {
        match stored {
            StoredHistory::Flat(turns) => BTreeMap::from([(SHARED_PARTITION.to_string(), turns)]),
            StoredHistory::Partitioned(map) if self.partition_by_backend => map,
            StoredHistory::Partitioned(map) => {
                BTreeMap::from([(SHARED_PARTITION.to_string(), merge_partitions(map))])
            }
        }
    }

    async fn enforce(&self, turns: Vec<ConversationTurn>) -> Vec<ConversationTurn> {
        let (max_turns, keep) = match self.policy {
            RetentionPolicy::HardTrim { max_turns } => return hard_trim(turns, max_turns),
            RetentionPolicy::Summarize { max_turns, keep } => (max_turns, keep),
        };
        if turns.len() <= max_turns {
            return turns;
        }
        let Some(summarizer) = self.summarizer.as_ref() else {
            return hard_trim(turns, max_turns);
        };

        let (previous, conversation) = split_summary(&turns);
        let split = conversation.len().saturating_sub(keep);
        let (overflow, kept) = conversation.split_at(split);

        match summarizer
            .summarize(previous.map(|t| t.content.as_str()), overflow)
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => {
                info!("Summarized {} old turns into long-term memory", overflow.len());
                let mut compacted = Vec::with_capacity(kept.len() + 1);
                compacted.push(ConversationTurn::system(summary.trim()));
                compacted.extend_from_slice(kept);
                compacted
            }
            Ok(_) => {
                warn!("Summarizer returned nothing, trimming instead");
                hard_trim(turns, max_turns)
            }
            Err(e) => {
                warn!("Summarization failed, trimming instead: {}", e);
                hard_trim(turns, max_turns)
            }
        }
    }

    /// Caller must hold the writer lock
    async fn persist_locked(&self) {
        let stored = {
            let partitions = self.read();
            if self.partition_by_backend {
                StoredHistory::Partitioned(partitions.clone())
            } else {
                StoredHistory::Flat(
                    partitions
                        .get(SHARED_PARTITION)
                        .cloned()
                        .unwrap_or_default(),
                )
            }
        };

        if let Err(e) = write_atomic(&self.path, &stored).await {
            warn!("Failed to persist chat history: {}", e);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<ConversationTurn>>> {
        self.partitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<ConversationTurn>>> {
        self.partitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Joins partitions into one sequence in key order.
///
/// Each partition may start with its own summary; those are merged into a
/// single summary at the head so the result still holds at most one.
fn merge_partitions(map: BTreeMap<String, Vec<ConversationTurn>>) -> Vec<ConversationTurn> {
    let mut summaries = Vec::new();
    let mut conversation = Vec::new();
    for turns in map.into_values() {
        let (summary, rest) = split_summary(&turns);
        if let Some(summary) = summary {
            summaries.push(summary.content.clone());
        }
        conversation.extend_from_slice(rest);
    }

    let mut merged = Vec::with_capacity(conversation.len() + 1);
    if !summaries.is_empty() {
        merged.push(ConversationTurn::system(summaries.join("\n\n")));
    }
    merged.extend(conversation);
    merged
}

/// Writes to a sibling temp file and renames it over `path`
async fn write_atomic(path: &Path, stored: &StoredHistory) -> Result<(), EngineError> {
    let json = serde_json::to_vec_pretty(stored)
        .map_err(|e| EngineError::Persistence(format!("Failed to serialize history: {}", e)))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::Persistence(format!("Failed to create {:?}: {}", parent, e)))?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    fs::write(&tmp, json)
        .await
        .map_err(|e| EngineError::Persistence(format!("Failed to write {:?}: {}", tmp, e)))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| EngineError::Persistence(format!("Failed to replace {:?}: {}", path, e)))?;

    Ok(())
}
