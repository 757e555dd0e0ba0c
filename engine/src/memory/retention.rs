//! Retention policies for conversation memory
//!
//! Both policies bound a partition to `max_turns`. Hard trim drops the oldest
//! turns; summarize folds them into a single system turn at the head of the
//! partition (the long-term summary) and keeps the most recent `keep` turns
//! verbatim.

use crate::config::{MemoryConfig, RetentionStrategy};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{ConversationTurn, TurnRole};

/// Condenses old turns into a summary
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `turns`, folding in the `previous` summary if there is one.
    async fn summarize(
        &self,
        previous: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<String, EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    HardTrim { max_turns: usize },
    Summarize { max_turns: usize, keep: usize },
}

impl RetentionPolicy {
    pub fn from_config(config: &MemoryConfig) -> Self {
        match config.strategy {
            RetentionStrategy::HardTrim => RetentionPolicy::HardTrim {
                max_turns: config.max_turns,
            },
            RetentionStrategy::Summarize => RetentionPolicy::Summarize {
                max_turns: config.max_turns,
                keep: config.summarize_keep,
            },
        }
    }

    pub fn max_turns(&self) -> usize {
        match self {
            RetentionPolicy::HardTrim { max_turns } | RetentionPolicy::Summarize { max_turns, .. } => {
                *max_turns
            }
        }
    }
}

/// Whether `turn` is the long-term summary slot
pub fn is_summary(turn: &ConversationTurn) -> bool {
    turn.role == TurnRole::System
}

/// Splits off a leading summary turn
pub fn split_summary(turns: &[ConversationTurn]) -> (Option<&ConversationTurn>, &[ConversationTurn]) {
    match turns.split_first() {
        Some((first, rest)) if is_summary(first) => (Some(first), rest),
        _ => (None, turns),
    }
}

/// Drops the oldest turns until at most `cap` remain.
///
/// A leading summary turn survives the trim. Idempotent.
pub fn hard_trim(mut turns: Vec<ConversationTurn>, cap: usize) -> Vec<ConversationTurn> {
    if turns.len() <= cap {
        return turns;
    }

    let has_summary = turns.first().is_some_and(is_summary);
    if has_summary && cap >= 1 {
        let excess = turns.len() - cap;
        turns.drain(1..=excess);
    } else {
        let excess = turns.len() - cap;
        turns.drain(..excess);
    }
    turns
}
