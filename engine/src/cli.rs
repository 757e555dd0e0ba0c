//! CLI interface for Aira
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags of the `aira` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::actions::DEFAULT_SESSION;

/// Aira local assistant
///
/// Chats with local llama.cpp models, answers simple questions directly, and
/// can look at files inside the configured workspace.
#[derive(Parser, Debug)]
#[command(name = "aira")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive chat on stdin/stdout
    Chat {
        /// Backend id to use for every message (default: auto)
        #[arg(short, long, value_name = "ID")]
        backend: Option<String>,

        /// Session id for confirmations
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,
    },

    /// Send one message and print the reply
    Ask {
        /// The message to send
        message: String,

        /// Backend id (default: auto)
        #[arg(short, long, value_name = "ID")]
        backend: Option<String>,

        /// Session id for confirmations
        #[arg(short, long, default_value = DEFAULT_SESSION)]
        session: String,
    },

    /// Check which model servers are up
    Health,

    /// Show recent chat history
    History {
        /// Backend partition to show (only when history is partitioned)
        #[arg(short, long, value_name = "ID")]
        backend: Option<String>,

        /// Number of turns to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}
