mod echo;
mod endpoints;
mod output;
mod probe;
mod send;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use xcomm_transport::{MessagePriority, MessageType, DEFAULT_MAX_FRAME_SIZE};

#[derive(Parser)]
#[command(name = "xcomm", version, about = "Talk to external systems over HTTP, WebSocket and TCP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Framed-TCP responder: answers every request with a RESPONSE.
    Echo {
        /// Port to listen on.
        #[arg(long, default_value = "9000")]
        port: u16,
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Largest frame body accepted, in bytes.
        #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
        max_frame_size: usize,
    },

    /// Connect every endpoint, run one health cycle, print status and metrics.
    Probe {
        /// JSON file holding an array of endpoints.
        #[arg(long)]
        endpoints: PathBuf,
    },

    /// Send one message to one registered system.
    Send {
        /// JSON file holding an array of endpoints.
        #[arg(long)]
        endpoints: PathBuf,
        /// `system_id` of the recipient.
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "request", value_parser = endpoints::parse_message_type)]
        message_type: MessageType,
        /// JSON payload (an object, or any value to be wrapped under "value").
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Priority level, 1 (low) to 5 (emergency).
        #[arg(long, default_value = "2", value_parser = endpoints::parse_priority)]
        priority: MessagePriority,
        /// Name this process sends as.
        #[arg(long, default_value = "xcomm")]
        source: String,
        /// How long to wait for replies after sending, in ms.
        #[arg(long, default_value = "2000")]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Echo {
            port,
            bind,
            max_frame_size,
        } => {
            echo::run(&bind, port, max_frame_size).await?;
        }

        Command::Probe { endpoints: path } => {
            let endpoints = endpoints::load(&path)?;
            probe::run(endpoints).await?;
        }

        Command::Send {
            endpoints: path,
            target,
            message_type,
            payload,
            priority,
            source,
            wait,
        } => {
            let endpoints = endpoints::load(&path)?;
            send::run(
                endpoints,
                send::SendConfig {
                    target,
                    message_type,
                    payload: serde_json::from_str(&payload)?,
                    priority,
                    source,
                    wait_ms: wait,
                },
            )
            .await?;
        }
    }

    Ok(())
}
