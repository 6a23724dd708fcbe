//! Fixtures shared by the daemon integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bs_core::config::VaultConfig;
use bs_core::store::AggregateStore;
use bs_core::types::{AccountSnapshot, Amount};
use bs_core::vault::{generate_master_key, CredentialVault, DecryptedCredentialSet};
use bs_daemon::job::{JobBody, JobError, JobSpec, Session};
use tempfile::TempDir;
use tokio::sync::Notify;

pub fn account(number: &str, balance: f64) -> AccountSnapshot {
    AccountSnapshot {
        kind: "checking".into(),
        currency: "$".into(),
        account_number: number.into(),
        balance: Amount {
            raw: format!("$ {balance}"),
            number: Some(balance),
        },
        available: Amount {
            raw: format!("$ {balance}"),
            number: Some(balance),
        },
        logo: None,
    }
}

pub fn vault_config(dir: &TempDir) -> VaultConfig {
    VaultConfig {
        dir: dir.path().join("creds"),
        master_key_env: "BS_TEST_MASTER_KEY".into(),
    }
}

/// A tempdir with an unlocked vault and an empty store.
pub struct Fixture {
    pub dir: TempDir,
    pub master_key: String,
    pub vault: Arc<CredentialVault>,
    pub store: Arc<AggregateStore>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let master_key = generate_master_key().expect("key").to_string();
        let vault = CredentialVault::unlock(&vault_config(&dir), &master_key).expect("unlock");
        let store = AggregateStore::open(dir.path().join("accounts.json")).expect("open store");
        Self {
            dir,
            master_key,
            vault: Arc::new(vault),
            store: Arc::new(store),
        }
    }

    /// Provision `password` (and `document`) for each job.
    pub fn provision(&self, jobs: &[&str]) {
        for job in jobs {
            let mut fields = BTreeMap::new();
            fields.insert("document".to_string(), format!("{job}-doc"));
            fields.insert("password".to_string(), format!("{job}-secret"));
            self.vault.store(job, &fields).expect("store credentials");
        }
    }
}

pub fn spec(key: &str, timeout: Duration, body: impl JobBody + 'static) -> JobSpec {
    JobSpec {
        key: key.into(),
        required_fields: vec!["password".into()],
        timeout,
        logo: None,
        body: Arc::new(body),
    }
}

/// Returns fixed accounts and records which password it was handed.
pub struct Returns {
    pub accounts: Vec<AccountSnapshot>,
    pub seen: Arc<Mutex<Vec<(String, String)>>>,
}

impl Returns {
    pub fn new(accounts: Vec<AccountSnapshot>) -> Self {
        Self {
            accounts,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl JobBody for Returns {
    async fn run(
        &self,
        session: &Session,
        credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        let password = credentials.get("password").unwrap_or_default().to_string();
        self.seen
            .lock()
            .unwrap()
            .push((session.job_key().to_string(), password));
        Ok(self.accounts.clone())
    }
}

/// Sleeps before returning, long enough to hit any short timeout.
pub struct Sleeps(pub Duration);

#[async_trait]
impl JobBody for Sleeps {
    async fn run(
        &self,
        _session: &Session,
        _credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        tokio::time::sleep(self.0).await;
        Ok(vec![account("slow", 1.0)])
    }
}

/// Never completes.
pub struct Hangs;

#[async_trait]
impl JobBody for Hangs {
    async fn run(
        &self,
        _session: &Session,
        _credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

pub struct Panics;

#[async_trait]
impl JobBody for Panics {
    async fn run(
        &self,
        _session: &Session,
        _credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        panic!("selector not found");
    }
}

/// Fails with the error built by `make` on every call and counts the calls.
pub struct Fails {
    pub calls: Arc<AtomicU32>,
    make: fn() -> JobError,
}

impl Fails {
    pub fn new(make: fn() -> JobError) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            make,
        }
    }
}

#[async_trait]
impl JobBody for Fails {
    async fn run(
        &self,
        _session: &Session,
        _credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.make)())
    }
}

/// Fails with a session fault on the first call, succeeds afterwards.
pub struct FlakyOnce {
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobBody for FlakyOnce {
    async fn run(
        &self,
        _session: &Session,
        _credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(JobError::SessionFault("browser crashed".into()));
        }
        Ok(vec![account("flaky", 3.0)])
    }
}

/// Signals `started`, then waits for `release` before returning.
pub struct Gated {
    pub started: Arc<Notify>,
    pub release: Arc<Notify>,
    pub runs: Arc<AtomicU32>,
}

impl Gated {
    pub fn new() -> Self {
        Self {
            started: Arc::new(Notify::new()),
            release: Arc::new(Notify::new()),
            runs: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn handles(&self) -> (Arc<Notify>, Arc<Notify>, Arc<AtomicU32>) {
        (
            Arc::clone(&self.started),
            Arc::clone(&self.release),
            Arc::clone(&self.runs),
        )
    }
}

#[async_trait]
impl JobBody for Gated {
    async fn run(
        &self,
        _session: &Session,
        _credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        Ok(vec![account("gated", 7.0)])
    }
}

/// Sets its flag when dropped.
pub struct DropFlag(pub Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Holds a [`DropFlag`] next to its credentials and never returns, so the
/// flag flips only when the orchestrator drops the task.
pub struct HoldsUntilDropped {
    pub dropped: Arc<AtomicBool>,
    pub started: Arc<Notify>,
}

#[async_trait]
impl JobBody for HoldsUntilDropped {
    async fn run(
        &self,
        _session: &Session,
        credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        let _guard = DropFlag(Arc::clone(&self.dropped));
        let _password = credentials.get("password");
        self.started.notify_one();
        std::future::pending::<()>().await;
        Ok(Vec::new())
    }
}

/// Records whether `flag` was already set when it ran.
pub struct ObservesFlag {
    pub flag: Arc<AtomicBool>,
    pub observed: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl JobBody for ObservesFlag {
    async fn run(
        &self,
        _session: &Session,
        _credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        *self.observed.lock().unwrap() = Some(self.flag.load(Ordering::SeqCst));
        Ok(Vec::new())
    }
}
