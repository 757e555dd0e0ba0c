//! Agent facade and tool loop
//!
//! This module ties routing, actions and memory together behind
//! [`Agent::handle`], which streams the reply to one chat message.

pub mod core;
pub mod relay;

pub use self::core::{Agent, AgentSettings, ReplyStream};
pub use relay::REASONING_LIMIT_NOTICE;
