// Aira local assistant
// Main entry point for the aira binary

use anyhow::Context;
use clap::Parser;
use aira_engine::agent::Agent;
use aira_engine::cli::{Cli, Command};
use aira_engine::config::Config;
use aira_engine::handlers::{handle_ask, handle_chat, handle_health, handle_history, OutputFormat};
use aira_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
    } else {
        Config::load_or_create()
    }
    .context("Failed to load configuration")?;

    // --log wins over the config; RUST_LOG wins over both
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Aira v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Handle commands
    match cli.command {
        Command::Chat { backend, session } => {
            let agent = Agent::from_config(&config)
                .await
                .context("Failed to start the assistant")?;
            handle_chat(&agent, &session, backend.as_deref()).await
        }

        Command::Ask {
            message,
            backend,
            session,
        } => {
            let agent = Agent::from_config(&config)
                .await
                .context("Failed to start the assistant")?;
            handle_ask(&agent, &session, &message, backend.as_deref(), format).await
        }

        Command::Health => {
            let agent = Agent::from_config(&config)
                .await
                .context("Failed to start the assistant")?;
            handle_health(&agent, format).await
        }

        Command::History { backend, limit } => {
            tracing::info!("Showing last {} turns", limit);
            handle_history(&config, backend.as_deref(), limit, format).await
        }
    }
}
