//! Error types and handling
//!
//! This module provides the error types used throughout the Aira engine.
//! All errors implement the `EngineErrorExt` trait which provides user-friendly
//! hints and the error kind.
//!
//! # Error Kinds
//!
//! - **Validation**: empty message, unknown backend choice, missing parameters
//! - **Security**: a path escaped the sandbox or hit the deny list
//! - **Transport**: backend unreachable, timed out, or answered with garbage
//! - **Persistence**: the history file could not be read or written
//! - **Limit**: the tool loop ran out of iterations without a final answer
//!
//! None of these are fatal to the host process. The agent turns every one of
//! them into either a synchronous rejection or a short message in the reply
//! stream.

use std::path::PathBuf;
use thiserror::Error;

/// Coarse classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Security,
    Transport,
    Persistence,
    Limit,
    Internal,
}

/// Trait for engine error extensions
///
/// Provides additional context for errors: a user-friendly hint and the
/// coarse kind. All engine errors implement this trait.
pub trait EngineErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and never contains file
    /// contents, paths, or raw backend responses.
    fn user_hint(&self) -> &str;

    /// Returns the coarse error kind
    fn kind(&self) -> ErrorKind;
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, EngineErrorExt, ErrorKind};
/// use std::path::PathBuf;
///
/// let error = EngineError::PathOutsideWorkspace(PathBuf::from("/etc/passwd"));
/// assert_eq!(error.kind(), ErrorKind::Security);
///
/// let limit = EngineError::ReasoningLimitReached(2);
/// assert_eq!(limit.kind(), ErrorKind::Limit);
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Validation errors
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    // File system security errors
    #[error("Path denied: {0:?}")]
    PathDenied(PathBuf),

    #[error("Path outside workspace: {0:?}")]
    PathOutsideWorkspace(PathBuf),

    #[error("Path canonicalization failed for {0:?}: {1}")]
    PathCanonicalization(PathBuf, String),

    #[error("Not a regular file: {0:?}")]
    NotAFile(PathBuf),

    // Backend errors
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend timed out")]
    BackendTimeout,

    #[error("No backends configured")]
    NoBackends,

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Agent loop errors
    #[error("Reasoning limit reached after {0} iterations")]
    ReasoningLimitReached(usize),

    // Action handler errors
    #[error("Action failed: {0}")]
    ActionFailed(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::EmptyMessage => "Type a message first",
            Self::UnknownBackend(_) => "Pick one of the configured backends or leave it on auto",
            Self::MissingParameter(_) => "The action needs more parameters",

            Self::PathDenied(_) => "Access to this path is not allowed",
            Self::PathOutsideWorkspace(_) => "Files must be inside the workspace",
            Self::PathCanonicalization(_, _) => "Invalid path specified",
            Self::NotAFile(_) => "File not found",

            Self::Backend(_) => "Model server unavailable. Check that llama-server is running",
            Self::BackendTimeout => "Model server took too long to respond. Try again",
            Self::NoBackends => "No model server configured",

            Self::Persistence(_) => "Chat history could not be saved",

            Self::ReasoningLimitReached(_) => "The model did not reach an answer. Rephrase the question",

            Self::ActionFailed(_) => "Action failed",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyMessage
            | Self::UnknownBackend(_)
            | Self::MissingParameter(_) => ErrorKind::Validation,

            Self::PathDenied(_)
            | Self::PathOutsideWorkspace(_)
            | Self::PathCanonicalization(_, _) => ErrorKind::Security,

            Self::Backend(_) | Self::BackendTimeout | Self::NoBackends => ErrorKind::Transport,

            Self::Persistence(_) => ErrorKind::Persistence,

            Self::ReasoningLimitReached(_) => ErrorKind::Limit,

            Self::Config(_) | Self::NotAFile(_) | Self::ActionFailed(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }
}
