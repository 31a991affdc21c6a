//! vqueued — the vqueue daemon.
//!
//! Hosts one scaling agent per configured virtual queue against the
//! embedded redb backend, plus a few one-shot commands for poking at a
//! data directory by hand.
//!
//! redb locks its file, so the one-shot commands only work on a data
//! directory that no `vqueued run` has open. Against a running daemon
//! they fail with a "data directory in use" error.
//!
//! # Usage
//!
//! ```text
//! vqueued run --config /etc/vqueue/vqueue.toml
//!
//! # with the daemon stopped:
//! vqueued --data-dir /var/lib/vqueue create orders
//! vqueued --data-dir /var/lib/vqueue status orders
//! vqueued --data-dir /var/lib/vqueue send orders '{"id":1}'
//! vqueued --data-dir /var/lib/vqueue receive orders --wait-ms 2000
//! ```

mod commands;
mod daemon;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vqueue_backend::{QueueService, RedbQueueService};
use vqueue_core::BackendError;

const DB_FILE: &str = "vqueue.redb";

#[derive(Parser)]
#[command(name = "vqueued", about = "Virtual queue autoscaling daemon")]
struct Cli {
    /// Data directory for the one-shot commands.
    #[arg(long, global = true, default_value = "/var/lib/vqueue")]
    data_dir: PathBuf,

    /// Capacity of physical queues created by the one-shot commands.
    #[arg(long, global = true, default_value = "1024")]
    max_size_megabytes: u64,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one scaling agent per configured queue until Ctrl-C.
    Run {
        /// Path to vqueue.toml.
        #[arg(long)]
        config: PathBuf,
    },
    /// Create a virtual queue (its first shard).
    Create { name: String },
    /// Print the shards of a virtual queue as JSON.
    Status { name: String },
    /// Send one UTF-8 message.
    Send { name: String, body: String },
    /// Receive a batch of messages.
    Receive {
        name: String,
        /// How long to wait for the first message.
        #[arg(long, default_value = "1000")]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => daemon::run(&config).await,
        Command::Create { name } => {
            let service = open_service(&cli.data_dir, cli.max_size_megabytes)?;
            if commands::create(service, &name).await? {
                println!("created {name}");
            } else {
                println!("{name} already exists");
            }
            Ok(())
        }
        Command::Status { name } => {
            let service = open_service(&cli.data_dir, cli.max_size_megabytes)?;
            let status = commands::status(service, &name).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Send { name, body } => {
            let service = open_service(&cli.data_dir, cli.max_size_megabytes)?;
            let sequence = commands::send(service, &name, body).await?;
            println!("sent {name} #{sequence}");
            Ok(())
        }
        Command::Receive { name, wait_ms } => {
            let service = open_service(&cli.data_dir, cli.max_size_megabytes)?;
            let messages =
                commands::receive(service, &name, Duration::from_millis(wait_ms)).await?;
            for message in &messages {
                println!("{}", commands::render(message));
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,vqueued=debug,vqueue=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Open (creating if needed) the redb backend under `data_dir`.
pub(crate) fn open_service(
    data_dir: &Path,
    max_size_megabytes: u64,
) -> anyhow::Result<Arc<dyn QueueService>> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let path = data_dir.join(DB_FILE);
    let service = match RedbQueueService::open(&path, max_size_megabytes) {
        Ok(service) => service,
        Err(e @ BackendError::Unavailable(_)) => {
            return Err(e).with_context(|| {
                format!(
                    "data directory {} in use; stop `vqueued run` before using one-shot commands on it",
                    data_dir.display()
                )
            });
        }
        Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
    };
    Ok(Arc::new(service))
}
