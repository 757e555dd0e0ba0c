//! Model Router
//!
//! Picks which local backend answers a message. Small models answer fast but
//! struggle with long technical questions, so the router scores each message
//! with a cheap heuristic and sends complex ones to the bigger model:
//!
//! - +1 when the message is longer than `length_threshold` characters
//! - +1 when it mentions a complex keyword (analysis, refactor, debug, ...)
//! - +1 when it contains code (a fence or code-like tokens)
//!
//! A score at or above `score_threshold` selects the complex backend. An
//! explicit backend choice from the caller always wins.

use super::{ChatBackend, LLMError, LlamaServerBackend};
use crate::config::{LLMConfig, RoutingConfig};
use futures::future::join_all;
use regex::Regex;
use sdk::errors::EngineError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Code-like tokens that mark a message as technical even without a fence
const CODE_PATTERN: &str = r"(?m)```|\b(?:fn|def|class|import|struct|impl|func|return|const|let|var)\s+\w|::|=>|->|\w+\([^)]*\)\s*[{;]|;\s*$|</?\w+>";

/// Why a backend was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// The caller named the backend
    Explicit,
    /// Only one backend can be chosen
    Single,
    /// Chosen by the complexity score
    Heuristic { score: u8 },
}

/// Result of routing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub backend_id: String,
    pub reason: RouteReason,
}

/// Router over the configured backends
pub struct ModelRouter {
    /// Backends in config order
    backends: Vec<Arc<dyn ChatBackend>>,

    default_id: String,

    /// Higher-capability backend, if one is configured
    complex_id: Option<String>,

    routing: RoutingConfig,

    code_pattern: Regex,

    health_timeout: Duration,
}

impl ModelRouter {
    /// Create a router over `backends`.
    ///
    /// # Errors
    ///
    /// `NoBackends` for an empty list, `UnknownBackend` when the default or
    /// complex id names no backend.
    pub fn new(
        backends: Vec<Arc<dyn ChatBackend>>,
        default_id: impl Into<String>,
        complex_id: Option<String>,
        routing: RoutingConfig,
        health_timeout: Duration,
    ) -> Result<Self, EngineError> {
        if backends.is_empty() {
            return Err(EngineError::NoBackends);
        }

        let default_id = default_id.into();
        let known = |id: &str| backends.iter().any(|b| b.id() == id);
        if !known(&default_id) {
            return Err(EngineError::UnknownBackend(default_id));
        }
        if let Some(id) = complex_id.as_deref() {
            if !known(id) {
                return Err(EngineError::UnknownBackend(id.to_string()));
            }
        }

        let code_pattern = Regex::new(CODE_PATTERN)
            .map_err(|e| EngineError::Config(format!("Invalid code pattern: {}", e)))?;

        Ok(Self {
            backends,
            default_id,
            complex_id,
            routing,
            code_pattern,
            health_timeout,
        })
    }

    /// Build llama-server backends from the `[llm]` section
    pub fn from_config(llm: &LLMConfig, routing: &RoutingConfig) -> Result<Self, EngineError> {
        let connect_timeout = Duration::from_secs(llm.connect_timeout_secs);
        let health_timeout = Duration::from_secs(llm.health_timeout_secs);

        let backends = llm
            .backends
            .iter()
            .map(|config| {
                LlamaServerBackend::new(config, connect_timeout, health_timeout)
                    .map(|backend| Arc::new(backend) as Arc<dyn ChatBackend>)
            })
            .collect::<Result<Vec<_>, LLMError>>()?;

        Self::new(
            backends,
            llm.default_backend.clone(),
            llm.complex_backend.clone(),
            routing.clone(),
            health_timeout,
        )
    }

    /// Complexity score of `text`, between 0 and 3
    pub fn score(&self, text: &str) -> u8 {
        let mut score = 0;

        if text.chars().count() > self.routing.length_threshold {
            score += 1;
        }

        let lowered = text.to_lowercase();
        if self
            .routing
            .complex_keywords
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
        {
            score += 1;
        }

        if self.code_pattern.is_match(text) {
            score += 1;
        }

        score
    }

    /// Choose the backend for `text`.
    ///
    /// `explicit` of `None`, `""` or `"auto"` means "let the router decide".
    ///
    /// # Errors
    ///
    /// `UnknownBackend` when `explicit` names no configured backend.
    pub fn route(&self, text: &str, explicit: Option<&str>) -> Result<RoutingDecision, EngineError> {
        let explicit = explicit
            .map(str::trim)
            .filter(|id| !id.is_empty() && !id.eq_ignore_ascii_case("auto"));

        if let Some(id) = explicit {
            if self.backend(id).is_none() {
                return Err(EngineError::UnknownBackend(id.to_string()));
            }
            debug!("Routing to explicitly chosen backend '{}'", id);
            return Ok(RoutingDecision {
                backend_id: id.to_string(),
                reason: RouteReason::Explicit,
            });
        }

        let complex_id = match self.complex_id.as_deref() {
            Some(id) if self.backends.len() > 1 && id != self.default_id => id,
            _ => {
                return Ok(RoutingDecision {
                    backend_id: self.default_id.clone(),
                    reason: RouteReason::Single,
                })
            }
        };

        let score = self.score(text);
        let backend_id = if score >= self.routing.score_threshold {
            complex_id
        } else {
            self.default_id.as_str()
        };
        info!("Routing score {} -> backend '{}'", score, backend_id);

        Ok(RoutingDecision {
            backend_id: backend_id.to_string(),
            reason: RouteReason::Heuristic { score },
        })
    }

    /// Backend to retry on after a transport failure of `failed_id`.
    ///
    /// Only the complex backend falls back, and only to the default.
    pub fn fallback_for(&self, failed_id: &str) -> Option<&str> {
        match self.complex_id.as_deref() {
            Some(complex) if complex == failed_id && complex != self.default_id => {
                Some(self.default_id.as_str())
            }
            _ => None,
        }
    }

    pub fn backend(&self, id: &str) -> Option<Arc<dyn ChatBackend>> {
        self.backends.iter().find(|b| b.id() == id).cloned()
    }

    pub fn backend_ids(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.id()).collect()
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// Check every backend concurrently, each bounded by the health timeout.
    ///
    /// A check that times out counts as down.
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let checks = self.backends.iter().map(|backend| {
            let backend = Arc::clone(backend);
            let limit = self.health_timeout;
            async move {
                let healthy = tokio::time::timeout(limit, backend.check_health())
                    .await
                    .unwrap_or(false);
                (backend.id().to_string(), healthy)
            }
        });

        join_all(checks).await.into_iter().collect()
    }
}
