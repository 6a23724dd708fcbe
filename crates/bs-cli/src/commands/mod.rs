pub mod config;
pub mod keys;
pub mod list;
pub mod provision;
pub mod show;

#[cfg(test)]
pub(crate) mod testing {
    use bs_core::config::{Config, JobConfig, JobKind};
    use tempfile::TempDir;

    /// Config with jobs `oca` (document + password) and `brou` (password),
    /// vault and store inside `dir`.
    pub fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.vault.dir = dir.path().join("creds");
        config.store.path = dir.path().join("accounts.json");
        config.jobs = vec![job("oca", &["document", "password"]), job("brou", &["password"])];
        config
    }

    fn job(key: &str, fields: &[&str]) -> JobConfig {
        JobConfig {
            key: key.into(),
            kind: JobKind::Command,
            command: Some(format!("/usr/lib/balance-sentry/{key}")),
            args: Vec::new(),
            credential_fields: fields.iter().map(|f| f.to_string()).collect(),
            timeout_secs: None,
            logo: None,
        }
    }

    pub fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }
}
