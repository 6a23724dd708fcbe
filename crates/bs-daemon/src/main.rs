//! balance-sentry daemon: refreshes account balances on a daily schedule.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bs_core::config::Config;
use bs_daemon::daemon::{spawn_signal_handler, Daemon};
use clap::Parser;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "balance-sentry", version, about = "Scheduled balance refresh daemon")]
struct Args {
    /// Config file (default: platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run one cycle immediately, persist, and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    bs_telemetry::logging::init_logging(
        "balance-sentry",
        &config.general.log_level,
        config.general.log_format,
    );
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "balance-sentry starting");

    let master_key = config.vault.master_key_from_env().with_context(|| {
        format!(
            "master key not set: export {} (see `bs generate-key`)",
            config.vault.master_key_env
        )
    })?;

    let mut daemon = Daemon::new(config, &master_key)?;
    drop(master_key);
    spawn_signal_handler(daemon.shutdown_handle());

    if args.once {
        let results = daemon.run_once().await?;
        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(jobs = results.len(), failed, "single cycle finished");
        return Ok(());
    }

    if let Err(e) = daemon.run().await {
        error!(error = %e, "daemon execution failed");
        return Err(e);
    }
    Ok(())
}
