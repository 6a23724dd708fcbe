use std::sync::Arc;

use anyhow::{Context, Result};
use bs_core::config::Config;
use bs_core::store::AggregateStore;
use bs_core::types::JobResult;
use bs_core::vault::CredentialVault;
use bs_harness::retry::RetryPolicy;
use bs_harness::shutdown::ShutdownSignal;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::ScheduleClock;
use crate::http_api::{self, ApiState};
use crate::job::SessionPool;
use crate::orchestrator::JobOrchestrator;
use crate::registry::JobRegistry;
use crate::snapshot_bus::SnapshotBus;

/// What happened to a clock fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Started,
    /// A cycle was still running; this fire was dropped, not queued.
    Skipped,
}

/// Composes the schedule clock, the orchestrator, the store and the
/// snapshot bus into the long-running service.
///
/// At most one cycle is in flight. On shutdown the clock stops, the running
/// cycle gets the configured grace period, then it is aborted, and the
/// state is persisted one last time.
pub struct Daemon {
    config: Config,
    orchestrator: Arc<JobOrchestrator>,
    store: Arc<AggregateStore>,
    bus: SnapshotBus,
    shutdown: ShutdownSignal,
    cycle_gate: Arc<Semaphore>,
    in_flight: Option<JoinHandle<Vec<JobResult>>>,
}

impl Daemon {
    /// Unlock the vault, open the store and build the job registry from
    /// `config`. Fails before any job could run when the master key is
    /// wrong.
    pub fn new(config: Config, master_key: &str) -> Result<Self> {
        let registry = JobRegistry::from_config(&config).context("failed to build job registry")?;
        Self::with_registry(config, master_key, registry)
    }

    /// Like [`Daemon::new`] with an explicitly built registry.
    pub fn with_registry(config: Config, master_key: &str, registry: JobRegistry) -> Result<Self> {
        let vault = CredentialVault::unlock(&config.vault, master_key)
            .context("failed to unlock credential vault")?;
        let store = Arc::new(
            AggregateStore::open(&config.store.path).context("failed to open snapshot store")?,
        );
        let shutdown = ShutdownSignal::new();
        let retry = RetryPolicy::new(
            config.orchestrator.max_attempts,
            config.orchestrator.retry_backoff(),
        );
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(registry),
            Arc::new(vault),
            Arc::clone(&store),
            SessionPool::new(config.session.clone()),
            retry,
            shutdown.clone(),
        ));

        Ok(Self {
            config,
            orchestrator,
            store,
            bus: SnapshotBus::new(),
            shutdown,
            cycle_gate: Arc::new(Semaphore::new(1)),
            in_flight: None,
        })
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    pub fn snapshot_bus(&self) -> &SnapshotBus {
        &self.bus
    }

    /// Handle for triggering shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// True while a cycle holds the gate.
    pub fn is_busy(&self) -> bool {
        self.cycle_gate.available_permits() == 0
    }

    /// Start a cycle in the background unless one is already running.
    pub fn fire(&mut self) -> FireOutcome {
        if self.shutdown.is_shutting_down() {
            info!("shutdown in progress, ignoring fire");
            return FireOutcome::Skipped;
        }
        let permit = match Arc::clone(&self.cycle_gate).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("previous cycle still running, skipping this fire");
                return FireOutcome::Skipped;
            }
        };

        let orchestrator = Arc::clone(&self.orchestrator);
        let store = Arc::clone(&self.store);
        let bus = self.bus.clone();
        self.in_flight = Some(tokio::spawn(async move {
            let _permit = permit;
            run_cycle(&orchestrator, &store, &bus).await
        }));
        FireOutcome::Started
    }

    /// Wait for the in-flight cycle, if any, and return its results.
    ///
    /// Once shutdown is triggered the cycle gets the configured grace
    /// period; after that the abort phase starts and the cycle is awaited
    /// until its current job has been cancelled.
    pub async fn wait_in_flight(&mut self) -> Vec<JobResult> {
        let Some(mut handle) = self.in_flight.take() else {
            return Vec::new();
        };
        let grace = self.config.orchestrator.shutdown_grace();

        tokio::select! {
            joined = &mut handle => return cycle_results(joined),
            _ = self.shutdown.triggered() => {}
        }

        info!(grace_secs = grace.as_secs(), "waiting for in-flight cycle to finish");
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => cycle_results(joined),
            Err(_) => {
                self.shutdown.abort();
                cycle_results(handle.await)
            }
        }
    }

    /// Run a single cycle to completion, then persist and publish.
    pub async fn run_once(&mut self) -> Result<Vec<JobResult>> {
        if self.fire() == FireOutcome::Skipped {
            anyhow::bail!("could not start cycle");
        }
        let results = self.wait_in_flight().await;
        self.final_persist();
        Ok(results)
    }

    /// The scheduled loop. Returns after shutdown once the final persist
    /// has run.
    pub async fn run(mut self) -> Result<()> {
        let mut clock = ScheduleClock::from_config(&self.config.schedule)
            .context("invalid schedule")?;
        let mut rng = StdRng::from_os_rng();

        let http = if self.config.http.enabled {
            let state = Arc::new(ApiState {
                store: Arc::clone(&self.store),
                allowed_ips: self.config.http.allowed_addrs()?,
            });
            let addr = self.config.http.socket_addr()?;
            let shutdown = self.shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = http_api::serve(state, addr, shutdown).await {
                    error!(error = %e, "http read path failed");
                }
            }))
        } else {
            None
        };

        let startup = self.store.snapshot();
        if !startup.is_empty() {
            self.bus.publish(Arc::clone(&startup));
        }
        info!(
            hours = ?self.config.schedule.hours,
            max_jitter_minutes = self.config.schedule.max_jitter_minutes,
            jobs = self.orchestrator.registry().len(),
            store = %self.store.path().display(),
            "daemon started"
        );

        if self.config.schedule.catch_up_missed
            && clock.missed_run(startup.updated_at.as_ref(), &clock.now())
        {
            warn!(last_update = ?startup.updated_at, "missed run detected, starting a cycle now");
            self.fire();
        }

        loop {
            let target = clock.next_fire(&clock.now(), &mut rng);
            info!(next_fire = %target.format("%Y-%m-%d %H:%M:%S %:z"), "next cycle scheduled");
            if !clock.sleep_until(&target, &self.shutdown).await {
                break;
            }
            self.fire();
            clock.fired();
        }
        clock.stop();

        let _ = self.wait_in_flight().await;
        self.final_persist();
        if let Some(http) = http {
            let _ = http.await;
        }
        info!("daemon stopped");
        Ok(())
    }

    fn final_persist(&self) {
        if !self.store.is_dirty() {
            return;
        }
        if let Err(e) = self.store.persist() {
            error!(error = %e, "final persist failed, unsaved results are lost");
        }
    }
}

fn cycle_results(joined: Result<Vec<JobResult>, tokio::task::JoinError>) -> Vec<JobResult> {
    joined.unwrap_or_else(|e| {
        error!(error = %e, "cycle task failed");
        Vec::new()
    })
}

async fn run_cycle(
    orchestrator: &JobOrchestrator,
    store: &AggregateStore,
    bus: &SnapshotBus,
) -> Vec<JobResult> {
    let results = orchestrator.run_cycle().await;
    if results.is_empty() {
        return results;
    }
    if let Err(e) = store.persist() {
        // Kept in memory and flagged dirty; the next persist writes it.
        error!(error = %e, "persist after cycle failed");
    }
    bus.publish(store.snapshot());
    results
}

/// Trigger shutdown on SIGINT or SIGTERM. A second signal skips the grace
/// period.
pub fn spawn_signal_handler(shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        for _ in 0..2 {
            if let Err(e) = wait_for_signal().await {
                error!(error = %e, "failed to listen for shutdown signals");
                return;
            }
            if shutdown.is_shutting_down() {
                warn!("second signal received, aborting");
                shutdown.abort();
                return;
            }
            info!("signal received, shutting down");
            shutdown.trigger();
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
