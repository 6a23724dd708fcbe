use std::io::Write;

use anyhow::Context;
use bs_core::config::Config;

/// Run the `config` subcommand: print the effective configuration, with
/// defaults and environment overrides applied, as TOML.
pub fn run(config: &Config, out: &mut impl Write) -> anyhow::Result<()> {
    let text = config.to_toml().context("failed to render config")?;
    write!(out, "{text}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{config, output};
    use tempfile::TempDir;

    #[test]
    fn prints_config_that_loads_back() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let mut buf = Vec::new();

        run(&config, &mut buf).unwrap();

        let text = output(buf);
        assert!(text.contains("[[jobs]]"));
        let path = dir.path().join("config.toml");
        std::fs::write(&path, &text).unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.jobs.len(), 2);
        assert_eq!(reloaded.job("oca").unwrap().credential_fields, ["document", "password"]);
        assert_eq!(reloaded.store.path, config.store.path);
    }
}
