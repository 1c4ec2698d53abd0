use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use serde_json::Value;
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use state_sync::{ClientConfig, ClientEvent, ConnectionState, SaveOutcome, Source, SyncClient};

#[derive(Parser)]
#[command(name = "state-sync-cli")]
#[command(about = "Read, write and watch shared state on a state sync server", version)]
struct Cli {
    /// Server base URL (defaults to STATE_SYNC_URL or http://127.0.0.1:3000)
    #[arg(short, long, global = true)]
    url: Option<String>,

    /// Local fallback cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current state of a domain
    Get { domain: String },

    /// Replace the state of a domain; pass `-` to read JSON from stdin
    Put { domain: String, json: String },

    /// Follow live updates for the given domains
    Watch {
        #[arg(required = true)]
        domains: Vec<String>,

        /// Seconds between reconnect attempts
        #[arg(long)]
        reconnect_secs: Option<u64>,
    },

    /// Show server health
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env()?;
    if let Some(url) = &cli.url {
        let domains = config.domains.clone();
        let delay = config.reconnect_delay;
        config = ClientConfig::new(url, config.cache_dir.clone())?
            .with_domains(domains)
            .with_reconnect_delay(delay);
    }
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    match cli.command {
        Commands::Get { domain } => {
            let client = SyncClient::new(config)?;
            let loaded = client.load(&domain).await?;
            let origin = match loaded.source {
                Source::Cache => "local cache (server unreachable)".yellow(),
                _ => "server".green(),
            };
            match loaded.payload {
                Some(payload) => {
                    println!("{} {} from {}", "✓".green(), domain.bright_white(), origin);
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                }
                None => println!("{} No saved state for {}", "∅".bright_black(), domain.bright_white()),
            }
        }

        Commands::Put { domain, json } => {
            let text = if json == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                json
            };
            let payload: Value = serde_json::from_str(&text).context("payload is not valid JSON")?;

            let client = SyncClient::new(config)?;
            match client.save(&domain, payload).await? {
                SaveOutcome::Synced => println!("{} {} saved", "✓".green(), domain.bright_white()),
                SaveOutcome::SavedLocally => println!(
                    "{} {} saved locally, not yet synced",
                    "⚠".yellow(),
                    domain.bright_white()
                ),
            }
        }

        Commands::Watch {
            domains,
            reconnect_secs,
        } => {
            let mut config = config.with_domains(domains.clone());
            if let Some(secs) = reconnect_secs {
                config.reconnect_delay = std::time::Duration::from_secs(secs);
            }

            let client = SyncClient::new(config)?;
            let mut updates = client.updates();
            client.start();

            println!(
                "{} Watching {}",
                "👁".bright_blue(),
                domains.join(", ").bright_yellow()
            );

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = updates.recv() => match event {
                        Ok(event) => print_event(&event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            println!("{} skipped {} events", "⚠".yellow(), n);
                        }
                        Err(_) => break,
                    }
                }
            }

            client.shutdown().await;
        }

        Commands::Health => {
            let url = config.health_url()?;
            let body: Value = reqwest::get(url).await?.error_for_status()?.json().await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::StateChanged {
            domain,
            payload,
            source,
        } => {
            let time = chrono::Local::now().format("%H:%M:%S%.3f");
            println!(
                "{} {} {} {}",
                format!("[{}]", time).bright_black(),
                domain.bright_white().bold(),
                format!("({:?})", source).bright_black(),
                payload
            );
        }
        ClientEvent::Connection(state) => {
            let label = match state {
                ConnectionState::Connected => "connected".green(),
                ConnectionState::Connecting => "connecting".yellow(),
                ConnectionState::Disconnected => "disconnected".red(),
            };
            println!("{} {}", "↔".bright_blue(), label);
        }
    }
}
