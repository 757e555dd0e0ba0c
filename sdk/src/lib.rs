//! Aira SDK
//!
//! Shared types and the error vocabulary used by the Aira engine and by the
//! transport layers that drive it.

/// Error types and handling
pub mod errors;

/// Conversation and action types
pub mod types;

// Re-export commonly used types
pub use errors::{EngineError, EngineErrorExt, ErrorKind};
pub use types::{ActionRequest, ConversationTurn, ParamError, TurnRole};
