//! The contract between the orchestrator and a job body, plus the single
//! automation session that bodies run in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bs_core::config::SessionConfig;
use bs_core::types::{AccountSnapshot, JobErrorKind};
use bs_core::vault::{DecryptedCredentialSet, VaultError};
use bs_harness::retry::Transient;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// Why a job attempt failed. Always caught by the orchestrator and recorded
/// in the job's `last_error`; never propagated further.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The source rejected the credentials. Retrying would only risk a
    /// lockout.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    /// Logged in, but the expected data could not be read.
    #[error("extraction failed: {0}")]
    ExtractionFailure(String),
    /// The automation session broke (browser crash, driver unreachable).
    #[error("session fault: {0}")]
    SessionFault(String),
    #[error(transparent)]
    Credentials(#[from] VaultError),
    #[error("cancelled by shutdown")]
    Cancelled,
}

impl JobError {
    pub fn kind(&self) -> JobErrorKind {
        match self {
            JobError::AuthFailure(_) => JobErrorKind::AuthFailure,
            JobError::Timeout(_) => JobErrorKind::Timeout,
            JobError::ExtractionFailure(_) => JobErrorKind::ExtractionFailure,
            JobError::SessionFault(_) => JobErrorKind::SessionFault,
            JobError::Credentials(_) => JobErrorKind::Credentials,
            JobError::Cancelled => JobErrorKind::Cancelled,
        }
    }
}

impl Transient for JobError {
    fn is_transient(&self) -> bool {
        matches!(self, JobError::SessionFault(_))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Exclusive lease on the automation session (one browser at a time).
///
/// Dropping the lease returns the session to the pool.
#[derive(Debug)]
pub struct Session {
    job_key: String,
    webdriver_url: Option<String>,
    headless: bool,
    _permit: OwnedSemaphorePermit,
}

impl Session {
    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn webdriver_url(&self) -> Option<&str> {
        self.webdriver_url.as_deref()
    }

    pub fn headless(&self) -> bool {
        self.headless
    }
}

#[derive(Debug, Clone)]
pub struct SessionPool {
    permits: Arc<Semaphore>,
    config: SessionConfig,
}

impl SessionPool {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            config,
        }
    }

    /// Wait for the session to be free and lease it to `job_key`.
    pub async fn acquire(&self, job_key: &str) -> Result<Session, JobError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| JobError::SessionFault("session pool closed".into()))?;
        Ok(Session {
            job_key: job_key.to_string(),
            webdriver_url: self.config.webdriver_url.clone(),
            headless: self.config.headless,
            _permit: permit,
        })
    }

    /// True while no job holds the session.
    pub fn is_idle(&self) -> bool {
        self.permits.available_permits() == 1
    }
}

// ---------------------------------------------------------------------------
// JobBody / JobSpec
// ---------------------------------------------------------------------------

/// Source-specific navigation and extraction.
///
/// Implementations must not keep `credentials` (or anything derived from
/// them) beyond the call.
#[async_trait]
pub trait JobBody: Send + Sync {
    async fn run(
        &self,
        session: &Session,
        credentials: &DecryptedCredentialSet,
    ) -> Result<Vec<AccountSnapshot>, JobError>;
}

/// A registered job: what to run and under which limits.
#[derive(Clone)]
pub struct JobSpec {
    pub key: String,
    pub required_fields: Vec<String>,
    pub timeout: Duration,
    pub logo: Option<String>,
    pub body: Arc<dyn JobBody>,
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("key", &self.key)
            .field("required_fields", &self.required_fields)
            .field("timeout", &self.timeout)
            .field("logo", &self.logo)
            .finish_non_exhaustive()
    }
}
