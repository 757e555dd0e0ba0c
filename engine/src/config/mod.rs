//! Configuration management
//!
//! This module handles loading, validation, and management of the Aira configuration.
//! Configuration is stored in TOML format at ~/.aira/config.toml and is read
//! exactly once at startup; nothing in the request path re-reads it.
//!
//! # Configuration Sections
//!
//! - **core**: Workspace (sandbox root), log level, data directory
//! - **llm**: llama-server backends, sampling and timeout settings
//! - **routing**: Complexity heuristic used to pick a backend
//! - **memory**: Chat history file and retention policy
//! - **agent**: System prompt, tool loop bound, action allow-list
//!
//! # Path Expansion
//!
//! The configuration system automatically:
//! - Expands ~ to the user's home directory
//! - Canonicalizes the workspace path, creating it if it doesn't exist
//! - Creates the data directory if it doesn't exist
//!
//! # Examples
//!
//! ```no_run
//! use aira_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Workspace: {:?}", config.core.workspace);
//! println!("Default backend: {}", config.llm.default_backend);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::actions::ActionKind;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    pub core: CoreConfig,

    /// Inference backend configuration
    pub llm: LLMConfig,

    /// Backend selection heuristic
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Conversation memory configuration
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Agent behaviour and action allow-list
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Sandbox root for file actions (supports ~ expansion)
    pub workspace: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Inference backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Backend used when the heuristic does not ask for more capability
    pub default_backend: String,

    /// Higher-capability backend selected for complex requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complex_backend: Option<String>,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Maximum tokens generated per model call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Connection establishment timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound on one complete generation (seconds)
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,

    /// Health check timeout (seconds)
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Configured llama-server instances
    pub backends: Vec<BackendConfig>,
}

/// One llama-server instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Identifier used for routing and memory partitioning (e.g. "3b")
    pub id: String,

    /// Base URL of the server (e.g. http://127.0.0.1:8080)
    pub base_url: String,

    /// Health check path
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Model name sent in requests; llama-server ignores it when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Complexity heuristic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Messages longer than this (in characters) score one point
    #[serde(default = "default_length_threshold")]
    pub length_threshold: usize,

    /// Score at or above which the complex backend is selected
    #[serde(default = "default_score_threshold")]
    pub score_threshold: u8,

    /// Keywords that mark a request as a complex task
    #[serde(default = "default_complex_keywords")]
    pub complex_keywords: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            length_threshold: default_length_threshold(),
            score_threshold: default_score_threshold(),
            complex_keywords: default_complex_keywords(),
        }
    }
}

/// Retention strategy for conversation memory
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStrategy {
    /// Keep only the most recent turns
    HardTrim,

    /// Fold overflow into a single long-term summary turn
    Summarize,
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// History file, relative to the data directory unless absolute
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,

    /// Retention strategy
    #[serde(default = "default_strategy")]
    pub strategy: RetentionStrategy,

    /// Maximum retained turns per sequence (also the summarize trigger)
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Turns kept verbatim when summarizing
    #[serde(default = "default_summarize_keep")]
    pub summarize_keep: usize,

    /// Keep one sequence per backend instead of a shared one
    #[serde(default)]
    pub partition_by_backend: bool,

    /// Recent turns included in each prompt
    #[serde(default = "default_window_turns")]
    pub window_turns: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_file: default_history_file(),
            strategy: default_strategy(),
            max_turns: default_max_turns(),
            summarize_keep: default_summarize_keep(),
            partition_by_backend: false,
            window_turns: default_window_turns(),
        }
    }
}

/// Per-action policy entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ActionRuleConfig {
    /// Ask the user before running the action
    #[serde(default)]
    pub confirm: bool,
}

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// System prompt placed at the head of every model request
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Upper bound on model calls per request
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,

    /// Maximum bytes returned by file actions
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,

    /// Prompt template for analyze_file ({filename}, {content})
    #[serde(default = "default_review_template")]
    pub review_template: String,

    /// Actions the executor may run, keyed by action name
    #[serde(default = "default_allowed_actions")]
    pub allowed_actions: BTreeMap<String, ActionRuleConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_tool_iterations: default_max_tool_iterations(),
            max_file_bytes: default_max_file_bytes(),
            review_template: default_review_template(),
            allowed_actions: default_allowed_actions(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.aira")
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_temperature() -> f64 {
    0.4
}

fn default_max_tokens() -> u32 {
    256
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_generation_timeout() -> u64 {
    120
}

fn default_health_timeout() -> u64 {
    2
}

fn default_length_threshold() -> usize {
    300
}

fn default_score_threshold() -> u8 {
    2
}

fn default_complex_keywords() -> Vec<String> {
    [
        "analisis",
        "analysis",
        "analyze",
        "optimasi",
        "optimization",
        "optimize",
        "arsitektur",
        "architecture",
        "debug",
        "refactor",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_history_file() -> PathBuf {
    PathBuf::from("chat_history.json")
}

fn default_strategy() -> RetentionStrategy {
    RetentionStrategy::HardTrim
}

fn default_max_turns() -> usize {
    40
}

fn default_summarize_keep() -> usize {
    6
}

fn default_window_turns() -> usize {
    6
}

fn default_max_tool_iterations() -> usize {
    2
}

fn default_max_file_bytes() -> usize {
    8000
}

fn default_system_prompt() -> String {
    "Nama kamu adalah AIRA.
AI Brain coding pribadi.

Aturan umum:
- Jawaban teknis, ringkas, langsung ke inti.
- Jika diminta menulis kode, tulis dalam 1 blok kode lengkap.
- Jangan potong kode.
- Penjelasan boleh sebelum atau sesudah blok kode.

Tool usage rules:
- Jika menggunakan tool, balas hanya dalam format JSON:
  {\"action\": \"nama_action\", \"params\": {}}
- Tool yang tersedia: get_time, get_system_status, list_files {\"path\"},
  read_file {\"path\"}, analyze_file {\"path\"}, shutdown.
- Setelah menerima hasil tool, berikan jawaban final untuk user.
- Jangan memanggil tool tanpa alasan jelas."
        .to_string()
}

fn default_review_template() -> String {
    "Berikut isi file {filename}.
Lakukan review teknis dengan struktur berikut:
1. Fungsi utama file
2. Identifikasi bug
3. Saran refactor
4. Evaluasi kualitas arsitektur

Isi file:
{content}"
        .to_string()
}

fn default_allowed_actions() -> BTreeMap<String, ActionRuleConfig> {
    ActionKind::ALL
        .iter()
        .map(|kind| {
            (
                kind.name().to_string(),
                ActionRuleConfig {
                    confirm: *kind == ActionKind::Shutdown,
                },
            )
        })
        .collect()
}

fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig {
            id: "3b".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            health_path: default_health_path(),
            model: None,
        },
        BackendConfig {
            id: "7b".to_string(),
            base_url: "http://127.0.0.1:8081".to_string(),
            health_path: default_health_path(),
            model: None,
        },
    ]
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            default_backend: "3b".to_string(),
            complex_backend: Some("7b".to_string()),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            connect_timeout_secs: default_connect_timeout(),
            generation_timeout_secs: default_generation_timeout(),
            health_timeout_secs: default_health_timeout(),
            backends: default_backends(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.aira/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails (invalid paths, unknown backends or actions)
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();

        // Serialize before processing so the file keeps the portable ~ paths
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        config.validate_and_process()?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.aira/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".aira").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                workspace: PathBuf::from("~/ai_lokal/project"),
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            llm: LLMConfig::default(),
            routing: RoutingConfig::default(),
            memory: MemoryConfig::default(),
            agent: AgentConfig::default(),
        }
    }

    /// Absolute path of the chat history file
    pub fn history_path(&self) -> PathBuf {
        if self.memory.history_file.is_absolute() {
            self.memory.history_file.clone()
        } else {
            self.core.data_dir.join(&self.memory.history_file)
        }
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates log level, backends, retention and loop bounds
    /// - Rejects allow-list entries that name no known action
    /// - Expands ~ in paths and canonicalizes the workspace
    /// - Creates workspace and data directories if they don't exist
    pub fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        self.validate_backends()?;
        self.validate_memory()?;

        if self.agent.max_tool_iterations == 0 {
            return Err(EngineError::Config(
                "max_tool_iterations must be at least 1".to_string(),
            ));
        }

        for name in self.agent.allowed_actions.keys() {
            if ActionKind::from_name(name).is_none() {
                return Err(EngineError::Config(format!(
                    "Unknown action '{}' in allowed_actions. Known actions: {}",
                    name,
                    ActionKind::ALL
                        .iter()
                        .map(|k| k.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                )));
            }
        }

        // Expand and validate workspace path
        self.core.workspace = expand_path(&self.core.workspace)?;
        self.core.workspace = canonicalize_or_create(&self.core.workspace)?;

        if !self.core.workspace.is_dir() {
            return Err(EngineError::Config(format!(
                "Workspace path is not a directory: {:?}",
                self.core.workspace
            )));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }

    fn validate_backends(&self) -> Result<(), EngineError> {
        if self.llm.backends.is_empty() {
            return Err(EngineError::Config(
                "At least one backend must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.llm.backends {
            if backend.id.trim().is_empty() {
                return Err(EngineError::Config("Backend id must not be empty".to_string()));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(EngineError::Config(format!(
                    "Duplicate backend id '{}'",
                    backend.id
                )));
            }
            if !backend.base_url.starts_with("http://") && !backend.base_url.starts_with("https://")
            {
                return Err(EngineError::Config(format!(
                    "Backend '{}' base_url must start with http:// or https://",
                    backend.id
                )));
            }
        }

        if !seen.contains(self.llm.default_backend.as_str()) {
            return Err(EngineError::Config(format!(
                "default_backend '{}' is not a configured backend",
                self.llm.default_backend
            )));
        }

        if let Some(complex) = &self.llm.complex_backend {
            if !seen.contains(complex.as_str()) {
                return Err(EngineError::Config(format!(
                    "complex_backend '{}' is not a configured backend",
                    complex
                )));
            }
        }

        Ok(())
    }

    fn validate_memory(&self) -> Result<(), EngineError> {
        if self.memory.max_turns < 2 {
            return Err(EngineError::Config(
                "memory.max_turns must be at least 2".to_string(),
            ));
        }

        if self.memory.strategy == RetentionStrategy::Summarize
            && self.memory.summarize_keep >= self.memory.max_turns
        {
            return Err(EngineError::Config(
                "memory.summarize_keep must be smaller than memory.max_turns".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Canonicalize path, creating it if it doesn't exist
fn canonicalize_or_create(path: &Path) -> Result<PathBuf, EngineError> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(|e| {
            EngineError::Config(format!("Failed to create directory {:?}: {}", path, e))
        })?;
    }

    path.canonicalize()
        .map_err(|e| EngineError::PathCanonicalization(path.to_path_buf(), e.to_string()))
}
