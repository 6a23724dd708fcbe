use std::sync::Arc;

use bs_core::config::{Config, JobConfig, JobKind};

use crate::job::{JobBody, JobSpec};
use crate::jobs::CommandJob;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job `{0}` is registered twice")]
    Duplicate(String),
    #[error("job `{job}`: {reason}")]
    Invalid { job: String, reason: String },
}

/// The fixed, ordered set of jobs the daemon runs each cycle.
///
/// Built once at startup; every job kind maps to a concrete body type here.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Vec<JobSpec>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from the validated configuration, in order.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for job in &config.jobs {
            let body = body_for(job)?;
            registry.register(JobSpec {
                key: job.key.clone(),
                required_fields: job.credential_fields.clone(),
                timeout: config.job_timeout(job),
                logo: job.logo.clone(),
                body,
            })?;
        }
        tracing::info!(
            jobs = ?registry.keys().collect::<Vec<_>>(),
            "job registry built"
        );
        Ok(registry)
    }

    /// Append a job. Keys must be unique.
    pub fn register(&mut self, spec: JobSpec) -> Result<(), RegistryError> {
        if self.get(&spec.key).is_some() {
            return Err(RegistryError::Duplicate(spec.key));
        }
        self.jobs.push(spec);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.key == key)
    }

    pub fn jobs(&self) -> &[JobSpec] {
        &self.jobs
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(|j| j.key.as_str())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

fn body_for(job: &JobConfig) -> Result<Arc<dyn JobBody>, RegistryError> {
    match job.kind {
        JobKind::Command => {
            let program = job.command.clone().ok_or_else(|| RegistryError::Invalid {
                job: job.key.clone(),
                reason: "command jobs need `command`".into(),
            })?;
            Ok(Arc::new(CommandJob::new(program, job.args.clone())))
        }
    }
}
