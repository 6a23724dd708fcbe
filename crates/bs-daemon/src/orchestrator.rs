use std::sync::Arc;
use std::time::Instant;

use bs_core::store::AggregateStore;
use bs_core::types::{AccountSnapshot, JobResult};
use bs_core::vault::CredentialVault;
use bs_harness::retry::RetryPolicy;
use bs_harness::shutdown::ShutdownSignal;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::job::{JobError, JobSpec, SessionPool};
use crate::registry::JobRegistry;

/// Runs every registered job once per cycle, one at a time.
///
/// Each job is isolated: its credentials are decrypted just before it runs
/// and dropped before the next job starts, its body runs on its own task
/// under the job timeout, and whatever happens (error, timeout, panic)
/// becomes a [`JobResult`] merged into the store for that job alone.
pub struct JobOrchestrator {
    registry: Arc<JobRegistry>,
    vault: Arc<CredentialVault>,
    store: Arc<AggregateStore>,
    sessions: SessionPool,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
}

impl JobOrchestrator {
    pub fn new(
        registry: Arc<JobRegistry>,
        vault: Arc<CredentialVault>,
        store: Arc<AggregateStore>,
        sessions: SessionPool,
        retry: RetryPolicy,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            registry,
            vault,
            store,
            sessions,
            retry,
            shutdown,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Run all jobs in registration order, merging each result as it
    /// completes. Jobs not yet started when shutdown is triggered are
    /// skipped and leave their entries untouched.
    pub async fn run_cycle(&self) -> Vec<JobResult> {
        let started = Instant::now();
        let mut results = Vec::with_capacity(self.registry.len());

        for spec in self.registry.jobs() {
            if self.shutdown.is_shutting_down() {
                info!(
                    skipped = self.registry.len() - results.len(),
                    "shutdown requested, not starting remaining jobs"
                );
                break;
            }
            let result = self.run_job(spec).await;
            self.store.merge(&result);
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        info!(
            succeeded,
            failed = results.len() - succeeded,
            elapsed_secs = started.elapsed().as_secs(),
            "cycle complete"
        );
        results
    }

    /// Run one job to a [`JobResult`], retrying transient failures.
    pub async fn run_job(&self, spec: &JobSpec) -> JobResult {
        let started = Instant::now();
        info!(job = %spec.key, timeout_secs = spec.timeout.as_secs(), "job starting");

        let outcome = self
            .retry
            .run(&self.shutdown, |attempt| self.attempt(spec, attempt))
            .await;

        let mut result = match outcome.result {
            Ok(accounts) => {
                let accounts = stamp_logo(accounts, spec.logo.as_deref());
                info!(
                    job = %spec.key,
                    accounts = accounts.len(),
                    attempts = outcome.attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job succeeded"
                );
                JobResult::success(&spec.key, accounts)
            }
            Err(e) => {
                warn!(
                    job = %spec.key,
                    kind = %e.kind(),
                    attempts = outcome.attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "job failed"
                );
                JobResult::failed(&spec.key, e.kind(), e.to_string())
            }
        };
        result.attempts = outcome.attempts;
        result.logo = spec.logo.clone();
        result
    }

    async fn attempt(
        &self,
        spec: &JobSpec,
        attempt: u32,
    ) -> Result<Vec<AccountSnapshot>, JobError> {
        if self.shutdown.is_aborting() {
            return Err(JobError::Cancelled);
        }
        debug!(job = %spec.key, attempt, "attempt starting");

        let credentials = self.vault.retrieve(&spec.key, &spec.required_fields)?;
        let session = tokio::select! {
            session = self.sessions.acquire(&spec.key) => session?,
            _ = self.shutdown.aborted() => return Err(JobError::Cancelled),
        };

        let body = Arc::clone(&spec.body);
        let mut handle = tokio::spawn(async move {
            let result = body.run(&session, &credentials).await;
            credentials.release();
            drop(session);
            result
        });

        // On timeout or abort the task is cancelled and awaited, so the
        // credentials and the session are gone before this returns.
        tokio::select! {
            joined = &mut handle => joined.unwrap_or_else(|e| Err(join_error(e))),
            _ = tokio::time::sleep(spec.timeout) => {
                handle.abort();
                let _ = handle.await;
                Err(JobError::Timeout(spec.timeout))
            }
            _ = self.shutdown.aborted() => {
                handle.abort();
                let _ = handle.await;
                Err(JobError::Cancelled)
            }
        }
    }
}

fn join_error(e: JoinError) -> JobError {
    if !e.is_panic() {
        return JobError::Cancelled;
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    JobError::ExtractionFailure(format!("job body panicked: {message}"))
}

fn stamp_logo(mut accounts: Vec<AccountSnapshot>, logo: Option<&str>) -> Vec<AccountSnapshot> {
    if let Some(logo) = logo {
        for account in accounts.iter_mut().filter(|a| a.logo.is_none()) {
            account.logo = Some(logo.to_string());
        }
    }
    accounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use bs_core::types::Amount;

    fn account(logo: Option<&str>) -> AccountSnapshot {
        AccountSnapshot {
            kind: "checking".into(),
            currency: "$".into(),
            account_number: "1".into(),
            balance: Amount {
                raw: "1".into(),
                number: Some(1.0),
            },
            available: Amount {
                raw: "1".into(),
                number: Some(1.0),
            },
            logo: logo.map(String::from),
        }
    }

    #[test]
    fn logo_is_stamped_only_where_missing() {
        let stamped = stamp_logo(vec![account(None), account(Some("visa.png"))], Some("oca.png"));
        assert_eq!(stamped[0].logo.as_deref(), Some("oca.png"));
        assert_eq!(stamped[1].logo.as_deref(), Some("visa.png"));
    }

    #[test]
    fn no_logo_configured_leaves_accounts_alone() {
        let stamped = stamp_logo(vec![account(None)], None);
        assert!(stamped[0].logo.is_none());
    }
}
