use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from `config.toml`.
///
/// **Security**: This struct NEVER stores the vault master key. The key is
/// read from the environment variable named by [`VaultConfig::master_key_env`]
/// exactly once at startup.
///
/// The value is built and validated once, then handed (by reference or clone)
/// to every component constructor. Nothing mutates it afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub http: HttpConfig,
    /// Jobs in execution order.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    /// Job selection from the `BANKS` override; resolved by `validate()`.
    #[serde(skip)]
    pub selected_jobs: Option<Vec<String>>,
}

impl Config {
    /// Load config from the default location, falling back to defaults when
    /// the file does not exist. Environment overrides are applied and the
    /// result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::parse_file(&path)?
        } else {
            tracing::info!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path, apply environment overrides, validate.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let mut cfg = Self::parse_file(&path.into())?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// `~/.config/balance-sentry/config.toml` (platform config dir).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("balance-sentry")
            .join("config.toml")
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the process environment in
    /// production, a map in tests). Empty values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(format) = get("BS_LOG_FORMAT") {
            match format.to_ascii_lowercase().as_str() {
                "json" => self.general.log_format = LogFormat::Json,
                "human" => self.general.log_format = LogFormat::Human,
                other => tracing::warn!(value = other, "ignoring unknown BS_LOG_FORMAT"),
            }
        }
        if let Some(hours) = get("SCHEDULE_HOURS") {
            self.schedule.hours = split_list(&hours);
        }
        if let Some(jitter) = get("RANDOM_DELAY_MIN") {
            match jitter.parse() {
                Ok(minutes) => self.schedule.max_jitter_minutes = minutes,
                Err(_) => tracing::warn!(value = %jitter, "ignoring invalid RANDOM_DELAY_MIN"),
            }
        }
        if let Some(banks) = get("BANKS") {
            self.selected_jobs = Some(split_list(&banks));
        }
        if let Some(dir) = get("CREDENTIALS_DIRECTORY") {
            self.vault.dir = PathBuf::from(dir);
        }
        if let Some(path) = get("BS_OUTPUT_JSON") {
            self.store.path = PathBuf::from(path);
        }
        if let Some(url) = get("BS_WEBDRIVER_URL") {
            self.session.webdriver_url = Some(url);
        }
        if let Some(headless) = get("HEADLESS") {
            self.session.headless = headless == "1" || headless.eq_ignore_ascii_case("true");
        }
        if let Some(port) = get("HTTP_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    let host = self
                        .http
                        .bind
                        .parse::<SocketAddr>()
                        .map(|addr| addr.ip().to_string())
                        .unwrap_or_else(|_| "0.0.0.0".to_string());
                    self.http.bind = format!("{host}:{port}");
                    self.http.enabled = true;
                }
                Err(_) => tracing::warn!(value = %port, "ignoring invalid HTTP_PORT"),
            }
        }
        if let Some(ips) = get("ALLOWED_IPS") {
            self.http.allowed_ips = split_list(&ips);
        }
    }

    /// Semantic validation for settings that are not fully expressible via
    /// type checks. Also resolves the `BANKS` job selection.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if let Some(selected) = self.selected_jobs.take() {
            let mut ordered = Vec::with_capacity(selected.len());
            for key in &selected {
                match self.jobs.iter().find(|j| &j.key == key) {
                    Some(job) => ordered.push(job.clone()),
                    None => {
                        return Err(ConfigError::Validation(format!(
                            "job `{key}` listed in BANKS has no [[jobs]] entry"
                        )))
                    }
                }
            }
            self.jobs = ordered;
        }

        self.schedule.times()?;
        if self.jobs.is_empty() {
            return Err(ConfigError::Validation(
                "no jobs configured: add at least one [[jobs]] entry".into(),
            ));
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            job.validate()?;
            if !seen.insert(job.key.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate job key `{}`",
                    job.key
                )));
            }
        }

        if self.orchestrator.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.max_attempts must be at least 1".into(),
            ));
        }
        if self.orchestrator.default_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.default_timeout_secs must be positive".into(),
            ));
        }

        self.http.socket_addr()?;
        self.http.allowed_addrs()?;
        Ok(())
    }

    /// Look up a job by key.
    pub fn job(&self, key: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.key == key)
    }

    /// Timeout applied to `job`, falling back to the orchestrator default.
    pub fn job_timeout(&self, job: &JobConfig) -> Duration {
        Duration::from_secs(
            job.timeout_secs
                .unwrap_or(self.orchestrator.default_timeout_secs),
        )
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Daily fire times, `HH:MM` local wall-clock time.
    #[serde(default = "default_schedule_hours")]
    pub hours: Vec<String>,
    /// Upper bound of the random delay added to each fire.
    #[serde(default = "default_max_jitter_minutes")]
    pub max_jitter_minutes: u32,
    /// Fire once at startup when today's run was missed.
    #[serde(default = "default_true")]
    pub catch_up_missed: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            hours: default_schedule_hours(),
            max_jitter_minutes: default_max_jitter_minutes(),
            catch_up_missed: true,
        }
    }
}

impl ScheduleConfig {
    /// Parse the configured times, sorted and deduplicated.
    pub fn times(&self) -> Result<Vec<NaiveTime>, ConfigError> {
        if self.hours.is_empty() {
            return Err(ConfigError::Validation(
                "schedule.hours must list at least one HH:MM time".into(),
            ));
        }
        let mut times = self
            .hours
            .iter()
            .map(|h| {
                NaiveTime::parse_from_str(h.trim(), "%H:%M").map_err(|e| {
                    ConfigError::Validation(format!("schedule.hours: invalid time `{h}`: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        times.sort();
        times.dedup();
        Ok(times)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_jitter_minutes) * 60)
    }
}

fn default_schedule_hours() -> Vec<String> {
    vec!["07:00".into(), "20:00".into()]
}
fn default_max_jitter_minutes() -> u32 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Directory holding `<job>.creds.json` files and the key-check token.
    #[serde(default = "default_vault_dir")]
    pub dir: PathBuf,
    /// Name of the environment variable holding the master key.
    #[serde(default = "default_master_key_env")]
    pub master_key_env: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            dir: default_vault_dir(),
            master_key_env: default_master_key_env(),
        }
    }
}

impl VaultConfig {
    /// Read the master key from the configured environment variable.
    pub fn master_key_from_env(&self) -> Option<String> {
        std::env::var(&self.master_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }
}

fn default_vault_dir() -> PathBuf {
    PathBuf::from("/etc/credstore/balance-sentry")
}
fn default_master_key_env() -> String {
    "CREDS_KEY".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/accounts.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Total attempts for transient failures (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// How long an in-flight job may keep running after shutdown is requested.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn default_timeout_secs() -> u64 {
    300
}
fn default_max_attempts() -> u32 {
    2
}
fn default_retry_backoff_secs() -> u64 {
    30
}
fn default_shutdown_grace_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remote WebDriver endpoint handed to job bodies.
    #[serde(default)]
    pub webdriver_url: Option<String>,
    #[serde(default = "default_true")]
    pub headless: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            webdriver_url: None,
            headless: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_bind")]
    pub bind: String,
    /// Client IPs allowed to read; empty allows everyone.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_http_bind(),
            allowed_ips: Vec::new(),
        }
    }
}

impl HttpConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::Validation(format!("http.bind `{}`: {e}", self.bind)))
    }

    pub fn allowed_addrs(&self) -> Result<Vec<IpAddr>, ConfigError> {
        self.allowed_ips
            .iter()
            .map(|ip| {
                ip.parse().map_err(|e| {
                    ConfigError::Validation(format!("http.allowed_ips: `{ip}`: {e}"))
                })
            })
            .collect()
    }
}

fn default_http_bind() -> String {
    "0.0.0.0:8000".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// External scraper process (see `bs-daemon`'s command job).
    #[default]
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job key. Also names the credential file and the snapshot entry.
    pub key: String,
    #[serde(default)]
    pub kind: JobKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Credential fields the job needs (e.g. `document`, `password`).
    #[serde(default)]
    pub credential_fields: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub logo: Option<String>,
}

impl JobConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_job_key(&self.key) {
            return Err(ConfigError::Validation(format!(
                "job key `{}` must be non-empty and use only [a-z0-9_-]",
                self.key
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::Validation(format!(
                "job `{}`: timeout_secs must be positive",
                self.key
            )));
        }
        match self.kind {
            JobKind::Command => {
                if self.command.as_deref().map_or(true, |c| c.trim().is_empty()) {
                    return Err(ConfigError::Validation(format!(
                        "job `{}`: command jobs need `command`",
                        self.key
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Job keys double as file names, so they are restricted to a safe alphabet.
pub fn is_valid_job_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
