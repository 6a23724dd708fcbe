use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{bail, Context};
use bs_core::config::Config;
use bs_core::vault::CredentialVault;
use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

/// Run the `provision` subcommand.
///
/// `input` must hold a JSON object mapping field names to string values.
/// Every field the job declares in `credential_fields` is required; extra
/// fields are stored too.
pub fn run(
    config: &Config,
    master_key: &str,
    job: &str,
    mut input: impl Read,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let Some(job_config) = config.job(job) else {
        bail!("unknown job `{job}`: add a [[jobs]] entry first");
    };

    let mut raw = Zeroizing::new(String::new());
    input
        .read_to_string(&mut raw)
        .context("failed to read credentials from stdin")?;
    let mut fields = parse_fields(&raw)?;

    let missing: Vec<&str> = job_config
        .credential_fields
        .iter()
        .filter(|f| !fields.contains_key(*f))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        wipe(&mut fields);
        bail!("job `{job}` needs fields: {}", missing.join(", "));
    }
    for name in fields.keys().filter(|f| !job_config.credential_fields.contains(*f)) {
        warn!(job, field = %name, "field is not declared in credential_fields, storing anyway");
    }

    let vault = CredentialVault::unlock(&config.vault, master_key)
        .context("failed to unlock credential vault")?;
    let stored = vault.store(job, &fields);
    let names: Vec<String> = fields.keys().cloned().collect();
    wipe(&mut fields);
    stored.with_context(|| format!("failed to store credentials for `{job}`"))?;
    info!(job, fields = names.len(), "credentials stored");

    writeln!(out, "stored {} field(s) for {job}: {}", names.len(), names.join(", "))?;
    Ok(())
}

fn parse_fields(raw: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("stdin is not valid JSON")?;
    let serde_json::Value::Object(map) = value else {
        bail!("expected a JSON object of field names to values");
    };
    let mut fields = BTreeMap::new();
    for (name, value) in map {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => {
                fields.insert(name, s);
            }
            serde_json::Value::String(_) => bail!("field `{name}` is empty"),
            _ => bail!("field `{name}` must be a string"),
        }
    }
    if fields.is_empty() {
        bail!("no credential fields given");
    }
    Ok(fields)
}

fn wipe(fields: &mut BTreeMap<String, String>) {
    for value in fields.values_mut() {
        value.zeroize();
    }
}
