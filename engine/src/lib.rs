//! Aira Engine Library
//!
//! This library provides the core functionality of the Aira assistant.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// File system security module
pub mod fs_guard;

/// Action registry, executor and handlers
pub mod actions;

/// Fast-path intent detection
pub mod intent;

/// Conversation memory store
pub mod memory;

/// Model backend abstraction layer and router
pub mod llm;

/// Agent facade and streaming tool loop
pub mod agent;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
