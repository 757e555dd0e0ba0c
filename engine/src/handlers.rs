//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - chat: interactive line loop, replies streamed as they are generated
//! - ask: one message, one reply
//! - health: backend up/down report
//! - history: last N turns from the history file

use anyhow::{Context, Result};
use futures::StreamExt;
use sdk::errors::{EngineError, EngineErrorExt};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::agent::{Agent, ReplyStream};
use crate::config::Config;
use crate::memory::{is_summary, MemoryStore};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Writes every chunk as it arrives and returns the whole reply
pub async fn relay_to<W>(mut stream: ReplyStream, out: &mut W) -> Result<String>
where
    W: AsyncWrite + Unpin,
{
    let mut reply = String::new();
    while let Some(chunk) = stream.next().await {
        out.write_all(chunk.as_bytes())
            .await
            .context("Failed to write reply")?;
        out.flush().await.context("Failed to flush reply")?;
        reply.push_str(&chunk);
    }
    Ok(reply)
}

/// Send one message and print the reply
pub async fn handle_ask(
    agent: &Agent,
    session: &str,
    message: &str,
    backend: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let stream = match agent.handle(session, message, backend).await {
        Ok(stream) => stream,
        Err(e) => return report_rejection(&e, format),
    };

    match format {
        OutputFormat::Text => {
            let mut stdout = tokio::io::stdout();
            relay_to(stream, &mut stdout).await?;
            stdout.write_all(b"\n").await?;
        }
        OutputFormat::Json => {
            let mut sink = Vec::new();
            let reply = relay_to(stream, &mut sink).await?;
            let output = json!({
                "status": "ok",
                "session": session,
                "reply": reply,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    agent.memory().persist().await;
    Ok(())
}

/// Interactive chat until EOF, `exit`, Ctrl-C or a confirmed shutdown
pub async fn handle_chat(agent: &Agent, session: &str, backend: Option<&str>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    stdout
        .write_all(b"Aira siap. Ketik 'exit' untuk keluar.\n")
        .await?;

    loop {
        stdout.write_all(b"\n> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if matches!(message, "exit" | "quit" | "keluar") {
            break;
        }

        match agent.handle(session, message, backend).await {
            Ok(stream) => {
                relay_to(stream, &mut stdout).await?;
                stdout.write_all(b"\n").await?;
            }
            Err(e) => {
                tracing::debug!("Message rejected: {}", e);
                stdout
                    .write_all(format!("{}\n", e.user_hint()).as_bytes())
                    .await?;
            }
        }

        if agent.shutdown_requested() {
            tracing::info!("Shutdown confirmed, leaving chat");
            break;
        }
    }

    agent.memory().persist().await;
    Ok(())
}

/// Print backend health
pub async fn handle_health(agent: &Agent, format: OutputFormat) -> Result<()> {
    let health = agent.health_check().await;

    match format {
        OutputFormat::Text => {
            println!("Backends:");
            for (id, up) in &health {
                println!("  {:<8} {}", id, if *up { "up" } else { "down" });
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }
    Ok(())
}

/// Show the last `limit` turns of the history file
pub async fn handle_history(
    config: &Config,
    backend: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let memory = MemoryStore::from_config(config);
    memory.load().await;

    let turns = memory.turns(backend);
    let start = turns.len().saturating_sub(limit);
    let turns = &turns[start..];

    match format {
        OutputFormat::Text => {
            if turns.is_empty() {
                println!("No chat history");
                return Ok(());
            }
            println!("Chat history (last {} turns):", turns.len());
            for turn in turns {
                let label = if is_summary(turn) {
                    "summary".to_string()
                } else {
                    turn.role.to_string()
                };
                println!();
                println!("[{}]", label);
                println!("{}", turn.content);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(turns)?);
        }
    }
    Ok(())
}

fn report_rejection(error: &EngineError, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            eprintln!("✗ {}", error.user_hint());
        }
        OutputFormat::Json => {
            let output = json!({
                "status": "rejected",
                "error": error.to_string(),
                "hint": error.user_hint(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Err(anyhow::anyhow!("{}", error))
}
