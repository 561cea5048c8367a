use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mailrelay_utils::{load_config, Outbox, SendRequest};
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "mailrelay-outbox", version, about = "Manages queued outbound messages")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/mailrelay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists pending outbound messages.
    List,

    /// Prints a stored message.
    Get {
        /// Storage id of the message.
        id: String,
    },

    /// Sends a queued message.
    Send {
        /// Sender, e.g. "Peter Sanford <peter@proxy.example.com>".
        #[arg(long)]
        from: String,

        #[arg(long, required = true)]
        to: Vec<String>,

        #[arg(long)]
        cc: Vec<String>,

        #[arg(long)]
        bcc: Vec<String>,

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
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let relay_config = config.validate()?;

    let store = config.storage.build();
    let mailer = config.mailer.build(&relay_config.domain)?;
    let outbox = Outbox::new(store, mailer, relay_config.bucket);

    match cli.command {
        Command::List => {
            for entry in outbox.list().await? {
                let modified = entry
                    .last_modified
                    .map(|date| date.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                    .unwrap_or_default();
                println!("{} {}", entry.key, modified);
            }
        }
        Command::Get { id } => {
            let raw = outbox.get(&id).await?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&raw).await?;
            stdout.flush().await?;
        }
        Command::Send {
            from,
            to,
            cc,
            bcc,
            id,
        } => {
            if from.trim().is_empty() || id.trim().is_empty() {
                bail!("--from and --id must not be empty");
            }
            let sent_id = outbox
                .send(&SendRequest {
                    id,
                    from,
                    to,
                    cc,
                    bcc,
                })
                .await?;
            println!("Sent! id={sent_id}");
        }
    }

    Ok(())
}
