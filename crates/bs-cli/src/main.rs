mod commands;

use std::path::PathBuf;

use anyhow::Context;
use bs_core::config::{Config, LogFormat};
use clap::{Parser, Subcommand};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// balance-sentry CLI -- manage the credential vault and inspect the snapshot.
#[derive(Parser, Debug)]
#[command(name = "bs", version, about)]
struct Cli {
    /// Config file (default: platform config dir).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a new random master key.
    GenerateKey,

    /// Store credentials for a job, read as a JSON object from stdin.
    Provision {
        /// Job key as configured in `[[jobs]]`.
        job: String,
    },

    /// List configured jobs and their provisioned credential fields.
    List,

    /// Print the effective configuration as TOML.
    Config,

    /// Print the persisted snapshot.
    Show {
        /// Print the raw document instead of a summary.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();
    bs_telemetry::logging::init_logging("bs", "warn", LogFormat::Human);

    let mut out = std::io::stdout().lock();
    match cli.command {
        Commands::GenerateKey => commands::keys::generate(&mut out),
        Commands::Provision { job } => {
            let config = load_config(cli.config.as_ref())?;
            let key = master_key(&config)?;
            commands::provision::run(&config, &key, &job, std::io::stdin().lock(), &mut out)
        }
        Commands::List => {
            let config = load_config(cli.config.as_ref())?;
            let key = master_key(&config)?;
            commands::list::run(&config, &key, &mut out)
        }
        Commands::Config => {
            let config = load_config(cli.config.as_ref())?;
            commands::config::run(&config, &mut out)
        }
        Commands::Show { json } => {
            let config = load_config(cli.config.as_ref())?;
            commands::show::run(&config, json, &mut out)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}

fn master_key(config: &Config) -> anyhow::Result<zeroize::Zeroizing<String>> {
    config
        .vault
        .master_key_from_env()
        .map(zeroize::Zeroizing::new)
        .with_context(|| {
            format!(
                "master key not set: export {} (create one with `bs generate-key`)",
                config.vault.master_key_env
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_provision_with_global_config() {
        let cli = Cli::try_parse_from(["bs", "provision", "oca", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Commands::Provision { ref job } if job == "oca"));
    }

    #[test]
    fn show_json_flag() {
        let cli = Cli::try_parse_from(["bs", "show", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Show { json: true }));
    }

    #[test]
    fn config_takes_no_arguments() {
        let cli = Cli::try_parse_from(["bs", "config", "-c", "/tmp/c.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Config));
        assert!(Cli::try_parse_from(["bs", "config", "extra"]).is_err());
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["bs"]).is_err());
        assert!(Cli::try_parse_from(["bs", "provision"]).is_err());
    }
}
