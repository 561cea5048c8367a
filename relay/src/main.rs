use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use mailrelay_utils::{load_config, EmailEvent, Relay};
use tokio::io::AsyncReadExt;
use tracing::info;

#[derive(Parser)]
#[command(name = "mailrelay", version, about = "Relays inbound email to a private mailbox")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/mailrelay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Processes a batch of inbound records.
    Handle {
        /// JSON event file, read from stdin when absent.
        #[arg(short, long)]
        event: Option<PathBuf>,
    },

    /// Runs an already stored message through the relay again.
    Replay {
        /// Storage id of the message.
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let relay_config = config.validate()?;

    let store = config.storage.build();
    let mailer = config.mailer.build(&relay_config.domain)?;
    let publisher = config.publisher.build()?;
    let relay = Relay::new(relay_config, store, mailer, publisher);

    match cli.command {
        Command::Handle { event } => {
            let data = match event {
                Some(path) => tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut data = Vec::new();
                    tokio::io::stdin().read_to_end(&mut data).await?;
                    data
                }
            };
            let event = EmailEvent::from_json(&data).context("parsing event")?;
            info!(records = event.records.len(), "Handling event");
            relay.handle_event(&event).await?;
        }
        Command::Replay { id } => {
            let decision = relay.replay(&id).await?;
            info!(message_id = %id, decision = ?decision, "Replayed message");
        }
    }

    Ok(())
}
