use std::io::{self, Write};

use anyhow::Context;
use bs_core::config::Config;
use bs_core::types::AggregateState;

/// Run the `show` subcommand. Reads the document directly, so it works while
/// the daemon is running and never modifies anything.
pub fn run(config: &Config, json: bool, out: &mut impl Write) -> anyhow::Result<()> {
    let path = &config.store.path;
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            writeln!(out, "no snapshot yet at {}", path.display())?;
            return Ok(());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let state: AggregateState = serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is not a valid snapshot", path.display()))?;

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&state)?)?;
        return Ok(());
    }

    match state.updated_at {
        Some(at) => writeln!(out, "updated {at}")?,
        None => writeln!(out, "never updated")?,
    }
    for (job, run) in &state.banks {
        let refreshed = run
            .updated_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "never".into());
        writeln!(out, "{job} (refreshed {refreshed})")?;
        for account in &run.accounts {
            writeln!(
                out,
                "  {:<10} {:<20} {} {}",
                account.kind, account.account_number, account.currency, account.balance.raw
            )?;
        }
        if let Some(err) = &run.last_error {
            writeln!(out, "  last error ({}) at {}: {}", err.kind, err.occurred_at, err.message)?;
        }
    }
    Ok(())
}
