//! matchcall - 1:1 voice/video calls between matched users
//!
//! A headless WebRTC call client plus the signaling relay it talks to.

mod calling;
mod config;
mod relay;
mod session;
mod signaling;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;

#[derive(Parser)]
#[command(name = "matchcall")]
#[command(about = "1:1 WebRTC call client and signaling relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity to register as (overrides the configured user id)
    #[arg(short, long, global = true)]
    user: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay server
    Relay {
        /// Address to listen on (defaults to the configured relay_listen)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Call another user and stay on the line until the call ends
    Call {
        /// User id to call
        target: String,

        /// Video call instead of voice
        #[arg(long)]
        video: bool,

        /// Hang up this many seconds after the call connects
        #[arg(long)]
        hangup_after: Option<u64>,
    },

    /// Wait for incoming calls
    Listen {
        /// Accept every incoming call without asking
        #[arg(long)]
        auto_accept: bool,
    },

    /// Show or update the configuration
    Config {
        /// Set the user id
        #[arg(long)]
        set_user: Option<String>,

        /// Set the relay WebSocket URL
        #[arg(long)]
        set_relay: Option<String>,

        /// Set the call-record service base URL
        #[arg(long)]
        set_records: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load_from(&config_path).context("Failed to load config")?;

    match cli.command {
        Commands::Relay { listen } => {
            let listen = listen.unwrap_or_else(|| config.relay_listen.clone());
            relay::serve(&listen).await?;
        }
        Commands::Call {
            target,
            video,
            hangup_after,
        } => {
            let user = match cli.user.as_deref() {
                Some(user) => user,
                None => config.require_user()?,
            };
            session::place_call(&config, user, &target, video, hangup_after).await?;
        }
        Commands::Listen { auto_accept } => {
            let user = match cli.user.as_deref() {
                Some(user) => user,
                None => config.require_user()?,
            };
            session::listen(&config, user, auto_accept).await?;
        }
        Commands::Config {
            set_user,
            set_relay,
            set_records,
        } => {
            let changed = set_user.is_some() || set_relay.is_some() || set_records.is_some();
            if let Some(user) = set_user {
                config.user_id = Some(user);
            }
            if let Some(relay) = set_relay {
                signaling::websocket::normalize_ws_url(&relay)?;
                config.relay_url = relay;
            }
            if let Some(records) = set_records {
                config.records_url = Some(records).filter(|url| !url.is_empty());
            }
            if changed {
                config.save_to(&config_path)?;
                tracing::info!("Saved {}", config_path.display());
            }
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        }
    }

    Ok(())
}
