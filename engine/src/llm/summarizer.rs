//! Long-term memory summaries produced by a backend

use super::{ChatBackend, GenerationOptions};
use crate::memory::Summarizer;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::ConversationTurn;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SUMMARY_INSTRUCTIONS: &str = "Ringkas percakapan berikut menjadi catatan singkat. \
Simpan fakta teknis, keputusan, nama file, dan preferensi pengguna. \
Jawab hanya dengan ringkasan, tanpa pembuka.";

/// Summarizes old turns with one of the configured backends
pub struct BackendSummarizer {
    backend: Arc<dyn ChatBackend>,
    options: GenerationOptions,
    timeout: Duration,
}

impl BackendSummarizer {
    pub fn new(backend: Arc<dyn ChatBackend>, options: GenerationOptions, timeout: Duration) -> Self {
        Self {
            backend,
            options,
            timeout,
        }
    }
}

#[async_trait]
impl Summarizer for BackendSummarizer {
    async fn summarize(
        &self,
        previous: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<String, EngineError> {
        let mut transcript = String::new();
        if let Some(previous) = previous {
            transcript.push_str("Ringkasan sebelumnya:\n");
            transcript.push_str(previous);
            transcript.push_str("\n\n");
        }
        for turn in turns {
            transcript.push_str(&format!("{}: {}\n", turn.role, turn.content));
        }

        let messages = [
            ConversationTurn::system(SUMMARY_INSTRUCTIONS),
            ConversationTurn::user(transcript),
        ];

        debug!(
            "Summarizing {} turns with backend '{}'",
            turns.len(),
            self.backend.id()
        );
        let summary = tokio::time::timeout(self.timeout, self.backend.complete(&messages, &self.options))
            .await
            .map_err(|_| EngineError::BackendTimeout)??;

        Ok(summary.trim().to_string())
    }
}
