use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use reeve_daemon::bridge::TelegramBridge;
use reeve_daemon::engine::{spawn_signal_listener, Engine};
use reeve_daemon::sentinel::Sentinel;
use reeve_domain::config::Config;

#[derive(Parser)]
#[command(name = "reeve", about = "Persistent personal-assistant scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pulse engine: scheduler plus HTTP ingress (default).
    Serve,
    /// Run the Telegram inbound bridge.
    Bridge,
    /// Send a failsafe alert via the configured sentinel backend.
    /// Exit code 0 = delivered, 1 = suppressed or failed.
    Sentinel {
        /// Alert message to deliver.
        message: String,
        /// Deduplication key; alerts sharing a key are rate-limited.
        #[arg(long)]
        cooldown_key: Option<String>,
        /// Cooldown period in seconds.
        #[arg(long, default_value_t = reeve_daemon::sentinel::DEFAULT_COOLDOWN_SECS)]
        cooldown: u64,
    },
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Arc::new(Config::from_env().context("loading configuration")?);
            Engine::new(config).run().await
        }
        Some(Command::Bridge) => {
            init_tracing();
            let config = Config::from_env().context("loading configuration")?;
            let mut bridge = TelegramBridge::new(&config).context("configuring bridge")?;

            let shutdown = CancellationToken::new();
            spawn_signal_listener(shutdown.clone());

            bridge.run(shutdown).await.context("telegram bridge failed")
        }
        Some(Command::Sentinel { message, cooldown_key, cooldown }) => {
            init_tracing();
            let config = Config::from_env().context("loading configuration")?;
            let sentinel = Sentinel::from_config(&config);

            // The sentinel path is synchronous by design; hop off the
            // async runtime for the blocking HTTP call.
            let delivered = tokio::task::spawn_blocking(move || {
                sentinel.alert(&message, cooldown_key.as_deref(), cooldown)
            })
            .await
            .unwrap_or(false);

            if delivered {
                eprintln!("Alert sent.");
                Ok(())
            } else {
                eprintln!("Alert not sent (no backend, cooldown, or delivery failure).");
                std::process::exit(1);
            }
        }
        Some(Command::Version) => {
            println!("reeve {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reeve_daemon=debug")),
        )
        .init();
}
