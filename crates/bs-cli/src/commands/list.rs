use std::io::Write;

use anyhow::Context;
use bs_core::config::Config;
use bs_core::vault::{CredentialVault, VaultError};

/// Run the `list` subcommand: one line per configured job with the fields
/// it has and the ones it still needs, then vault entries no job uses.
pub fn run(config: &Config, master_key: &str, out: &mut impl Write) -> anyhow::Result<()> {
    let vault = CredentialVault::unlock(&config.vault, master_key)
        .context("failed to unlock credential vault")?;

    for job in &config.jobs {
        let provisioned = match vault.provisioned_fields(&job.key) {
            Ok(fields) => fields,
            Err(VaultError::MissingCredentials { .. }) => Vec::new(),
            Err(e) => return Err(e).with_context(|| format!("reading credentials for `{}`", job.key)),
        };
        let missing: Vec<&str> = job
            .credential_fields
            .iter()
            .filter(|f| !provisioned.contains(f))
            .map(String::as_str)
            .collect();

        let status = if provisioned.is_empty() {
            "not provisioned".to_string()
        } else if missing.is_empty() {
            "ok".to_string()
        } else {
            format!("missing {}", missing.join(", "))
        };
        writeln!(out, "{:<16} {:<24} [{}]", job.key, status, provisioned.join(", "))?;
    }

    let configured: Vec<&str> = config.jobs.iter().map(|j| j.key.as_str()).collect();
    for job in vault.list()? {
        if !configured.contains(&job.as_str()) {
            writeln!(out, "{job:<16} {:<24}", "not configured")?;
        }
    }
    Ok(())
}
