use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use state_sync::{server, ServerConfig};

#[derive(Parser)]
#[command(name = "state-sync")]
#[command(about = "Durable shared JSON state with real-time WebSocket fan-out", version)]
#[command(after_help = "Endpoints:
  GET  /api/{domain}/state   Fetch the saved state of a domain
  POST /api/{domain}/state   Replace the state of a domain (JSON body)
  GET  /api/health           Uptime, connected clients and configuration
  GET  /ws                   Push channel: state_update events")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync server
    Serve {
        /// TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address, e.g. 0.0.0.0:3000
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Directory holding one record per domain
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Also write daily rolling logs here
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Some(cmd) => cmd,
        None => Commands::Serve {
            config: None,
            bind: None,
            data_dir: None,
            log_dir: None,
        },
    };

    match command {
        Commands::Serve {
            config,
            bind,
            data_dir,
            log_dir,
        } => {
            let mut config = ServerConfig::load(config.as_deref())?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(dir) = log_dir {
                config.log_dir = Some(dir);
            }

            let _guard = init_tracing(config.log_dir.as_deref());

            println!(
                "{}",
                format!("🌐 Starting state sync server on {}...", config.bind)
                    .cyan()
                    .bold()
            );
            println!(
                "{} Data directory: {}",
                "→".bright_blue(),
                config.data_dir.display().to_string().bright_yellow()
            );

            server::serve(config, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;

            println!("{}", "✓ Server stopped".green());
        }
    }

    Ok(())
}

fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(true).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "state-sync.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
