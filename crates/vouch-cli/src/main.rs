use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use vouch_crypto::{FileKeyStore, TrustStore};

mod config;
mod simulate;

use config::CliConfig;

/// Used when `RUST_LOG` is unset. Pinning events are logged by `vouch_crypto`.
const DEFAULT_LOG_FILTER: &str = "vouch=info,vouch_core=info,vouch_crypto=info";

#[derive(Parser)]
#[command(name = "vouch", about = "Peer-to-peer voice calls with verified identities")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory, overrides config
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Signaling mailbox directory, overrides config
    #[arg(long)]
    mailbox_dir: Option<PathBuf>,

    /// Pinned key file, overrides config
    #[arg(long)]
    pins_file: Option<PathBuf>,

    /// Mailbox poll interval in milliseconds, overrides config
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a call between two local users over the mailbox directory
    Simulate {
        /// After the first call, give the callee a forged key for the caller
        #[arg(long)]
        impersonate: bool,

        /// Audio chunks to send each way once connected
        #[arg(long, default_value_t = 3)]
        chunks: u32,
    },
    /// List pinned contact keys
    Pins,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let args = Args::parse();

    let mut config = CliConfig::load(args.config.as_deref())?;

    // CLI overrides
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(dir) = args.mailbox_dir {
        config.mailbox_dir = Some(dir);
    }
    if let Some(file) = args.pins_file {
        config.pins_file = Some(file);
    }
    if let Some(ms) = args.poll_interval_ms {
        config.call.poll_interval_ms = ms;
    }

    info!(
        data_dir = %config.data_dir.display(),
        mailbox_dir = %config.mailbox_dir().display(),
        pins_file = %config.pins_file().display(),
        poll_interval_ms = config.call.poll_interval_ms,
        "configuration loaded"
    );

    match args.command {
        Command::Simulate {
            impersonate,
            chunks,
        } => simulate::run(&config, impersonate, chunks).await,
        Command::Pins => list_pins(&config),
    }
}

fn list_pins(config: &CliConfig) -> Result<()> {
    let path = config.pins_file();
    let trust = TrustStore::new(Arc::new(FileKeyStore::new(&path)));
    let pins = trust
        .pins()
        .with_context(|| format!("failed to read pins from {}", path.display()))?;

    if pins.is_empty() {
        println!("no pinned contacts in {}", path.display());
        return Ok(());
    }
    for (contact, fingerprint) in pins {
        match fingerprint {
            Some(fp) => println!("{contact}\n  {fp}"),
            None => println!("{contact}\n  <unreadable record>"),
        }
    }
    Ok(())
}
