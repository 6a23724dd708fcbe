use std::time::Duration;

use bs_core::config::{Config, JobKind, LogFormat};

const SAMPLE: &str = r#"
[general]
log_level = "debug"
log_format = "json"

[schedule]
hours = ["20:00", "07:00"]
max_jitter_minutes = 15

[orchestrator]
default_timeout_secs = 120

[[jobs]]
key = "oca"
command = "/opt/scrapers/oca"
credential_fields = ["document", "password"]
logo = "oca.png"

[[jobs]]
key = "brou"
command = "/opt/scrapers/brou"
args = ["--fast"]
credential_fields = ["user", "password"]
timeout_secs = 600
"#;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.general.log_format, LogFormat::Human);
    assert_eq!(cfg.schedule.hours, vec!["07:00", "20:00"]);
    assert_eq!(cfg.schedule.max_jitter_minutes, 30);
    assert!(cfg.schedule.catch_up_missed);
    assert_eq!(cfg.vault.master_key_env, "CREDS_KEY");
    assert_eq!(cfg.orchestrator.max_attempts, 2);
    assert_eq!(cfg.orchestrator.default_timeout_secs, 300);
    assert!(!cfg.http.enabled);
    assert!(cfg.session.headless);
}

#[test]
fn parses_sample_file() {
    let mut cfg: Config = toml::from_str(SAMPLE).expect("parse sample");
    cfg.validate().expect("sample validates");

    assert_eq!(cfg.general.log_format, LogFormat::Json);
    assert_eq!(cfg.schedule.max_jitter(), Duration::from_secs(15 * 60));
    assert_eq!(cfg.jobs.len(), 2);
    assert_eq!(cfg.jobs[0].kind, JobKind::Command);
    assert_eq!(cfg.jobs[0].logo.as_deref(), Some("oca.png"));

    let brou = cfg.job("brou").expect("brou configured");
    assert_eq!(brou.args, vec!["--fast"]);
    assert_eq!(cfg.job_timeout(brou), Duration::from_secs(600));
    let oca = cfg.job("oca").expect("oca configured");
    assert_eq!(cfg.job_timeout(oca), Duration::from_secs(120));
}

#[test]
fn config_roundtrip() {
    let cfg: Config = toml::from_str(SAMPLE).expect("parse sample");
    let toml_str = cfg.to_toml().expect("serialize to toml");
    let mut parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.jobs.len(), cfg.jobs.len());
    assert_eq!(parsed.schedule.hours, cfg.schedule.hours);
    parsed.validate().expect("config validates");
}

#[test]
fn empty_job_list_fails_validation() {
    let mut cfg = Config::default();
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("no jobs"));
}

#[test]
fn command_job_without_command_fails_validation() {
    let mut cfg: Config = toml::from_str(
        r#"
[[jobs]]
key = "oca"
"#,
    )
    .expect("parse");
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("command"));
}

#[test]
fn zero_attempts_fails_validation() {
    let mut cfg: Config = toml::from_str(SAMPLE).expect("parse sample");
    cfg.orchestrator.max_attempts = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("max_attempts"));
}

#[test]
fn bad_allowed_ip_fails_validation() {
    let mut cfg: Config = toml::from_str(SAMPLE).expect("parse sample");
    cfg.http.allowed_ips = vec!["not-an-ip".into()];
    assert!(cfg.validate().is_err());
}

#[test]
fn load_from_missing_path_is_io_error() {
    let err = Config::load_from("/nonexistent/balance-sentry.toml").expect_err("must fail");
    assert!(err.to_string().starts_with("io:"));
}
