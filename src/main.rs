// ABOUTME: CLI entry point for change-relay
// ABOUTME: Parses commands, loads configuration and routes to the command handlers

use anyhow::Context;
use change_relay::commands;
use change_relay::config::RelayConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "change-relay")]
#[command(about = "Relay row changes between PostgreSQL databases over a durable queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the relay configuration file (defaults to <config dir>/change-relay/relay.toml)
    #[arg(long, env = "CHANGE_RELAY_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract changed rows from the source and send them to the queue
    Sync {
        /// Source database URL (overrides [source] url)
        #[arg(long, env = "SOURCE_URL")]
        source: Option<String>,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Receive envelopes from the queue and merge them into the target
    Deliver {
        /// Target database URL (overrides [target] url)
        #[arg(long, env = "TARGET_URL")]
        target: Option<String>,
        /// Process messages until the queue is empty, then exit
        #[arg(long)]
        once: bool,
        /// Maximum envelopes applied at once (overrides [delivery] max_concurrent)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Show per-table watermarks and queue depth
    Status,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("change-relay").join("relay.toml"))
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::load(&path),
        None => match default_config_path() {
            Some(path) if path.exists() => RelayConfig::load(&path),
            _ => {
                tracing::debug!("No config file found, using defaults");
                Ok(RelayConfig::default())
            }
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // We need to parse CLI args early to get the log level
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = load_config(cli.config).context("Failed to load configuration")?;

    match cli.command {
        Commands::Sync { source, once } => {
            commands::sync(commands::SyncOptions {
                config,
                source_url: source,
                once,
                allow_self_signed: cli.allow_self_signed_certs,
            })
            .await
        }
        Commands::Deliver {
            target,
            once,
            max_concurrent,
        } => {
            commands::deliver(commands::DeliverOptions {
                config,
                target_url: target,
                max_concurrent,
                once,
                allow_self_signed: cli.allow_self_signed_certs,
            })
            .await
        }
        Commands::Status => commands::status(&config).await,
    }
}
