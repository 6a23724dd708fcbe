use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, Local, Timelike};
use serde::{Deserialize, Serialize};

/// Timestamps are recorded in local time with an explicit offset, e.g.
/// `2026-01-30T22:30:00-03:00`.
pub type Timestamp = DateTime<FixedOffset>;

/// Current local time, truncated to whole seconds.
pub fn now() -> Timestamp {
    let now = Local::now().fixed_offset();
    now.with_nanosecond(0).unwrap_or(now)
}

// ---------------------------------------------------------------------------
// AccountSnapshot
// ---------------------------------------------------------------------------

/// A monetary amount as displayed by the source plus its parsed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    pub raw: String,
    /// `None` when `raw` could not be parsed.
    pub number: Option<f64>,
}

/// One account as extracted by a job body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    /// e.g. `checking`, `savings`, `credit`.
    #[serde(rename = "type")]
    pub kind: String,
    pub currency: String,
    pub account_number: String,
    pub balance: Amount,
    pub available: Amount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
}

// ---------------------------------------------------------------------------
// Job errors as recorded in the snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    AuthFailure,
    Timeout,
    ExtractionFailure,
    SessionFault,
    Credentials,
    Cancelled,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobErrorKind::AuthFailure => "auth_failure",
            JobErrorKind::Timeout => "timeout",
            JobErrorKind::ExtractionFailure => "extraction_failure",
            JobErrorKind::SessionFault => "session_fault",
            JobErrorKind::Credentials => "credentials",
            JobErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The persisted form of a job failure (`last_error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobErrorRecord {
    pub kind: JobErrorKind,
    pub message: String,
    pub occurred_at: Timestamp,
}

// ---------------------------------------------------------------------------
// JobResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
    Timeout,
}

/// Outcome of one job within one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub job_key: String,
    pub outcome: JobOutcome,
    /// Empty unless `outcome == Success`.
    pub accounts: Vec<AccountSnapshot>,
    pub error: Option<JobErrorRecord>,
    pub attempts: u32,
    pub completed_at: Timestamp,
    pub logo: Option<String>,
}

impl JobResult {
    pub fn success(job_key: impl Into<String>, accounts: Vec<AccountSnapshot>) -> Self {
        Self {
            job_key: job_key.into(),
            outcome: JobOutcome::Success,
            accounts,
            error: None,
            attempts: 1,
            completed_at: now(),
            logo: None,
        }
    }

    pub fn failed(job_key: impl Into<String>, kind: JobErrorKind, message: impl Into<String>) -> Self {
        let completed_at = now();
        let outcome = if kind == JobErrorKind::Timeout {
            JobOutcome::Timeout
        } else {
            JobOutcome::Failure
        };
        Self {
            job_key: job_key.into(),
            outcome,
            accounts: Vec::new(),
            error: Some(JobErrorRecord {
                kind,
                message: message.into(),
                occurred_at: completed_at,
            }),
            attempts: 1,
            completed_at,
            logo: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Success
    }
}

// ---------------------------------------------------------------------------
// AggregateState
// ---------------------------------------------------------------------------

/// Last known state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobRunState {
    /// When `accounts` was last refreshed successfully.
    pub updated_at: Option<Timestamp>,
    #[serde(default)]
    pub accounts: Vec<AccountSnapshot>,
    /// Set while the most recent run failed; cleared by the next success.
    #[serde(default)]
    pub last_error: Option<JobErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
}

/// The document persisted to disk and served to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AggregateState {
    pub updated_at: Option<Timestamp>,
    #[serde(default)]
    pub banks: BTreeMap<String, JobRunState>,
}

impl AggregateState {
    /// Apply one job result. Only the entry named by `result.job_key` changes.
    ///
    /// A failure keeps the entry's previous accounts and `updated_at` and
    /// records the error; a success replaces the accounts and clears it.
    pub fn apply(&mut self, result: &JobResult) {
        let entry = self.banks.entry(result.job_key.clone()).or_default();
        match result.outcome {
            JobOutcome::Success => {
                entry.updated_at = Some(result.completed_at);
                entry.accounts = result.accounts.clone();
                entry.last_error = None;
            }
            JobOutcome::Failure | JobOutcome::Timeout => {
                entry.last_error = result.error.clone();
            }
        }
        if result.logo.is_some() {
            entry.logo = result.logo.clone();
        }
        self.updated_at = Some(match self.updated_at {
            Some(prev) if prev > result.completed_at => prev,
            _ => result.completed_at,
        });
    }

    /// True until at least one job result has been recorded.
    pub fn is_empty(&self) -> bool {
        self.updated_at.is_none() && self.banks.is_empty()
    }

    /// Most recent successful refresh across all jobs.
    pub fn last_success(&self) -> Option<Timestamp> {
        self.banks.values().filter_map(|b| b.updated_at).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(number: &str) -> AccountSnapshot {
        AccountSnapshot {
            kind: "checking".into(),
            currency: "$".into(),
            account_number: number.into(),
            balance: Amount {
                raw: "$ 1.234,56".into(),
                number: Some(1234.56),
            },
            available: Amount {
                raw: "$ 1.000,00".into(),
                number: Some(1000.0),
            },
            logo: None,
        }
    }

    #[test]
    fn failure_keeps_previous_accounts() {
        let mut state = AggregateState::default();
        state.apply(&JobResult::success("oca", vec![account("1")]));
        let refreshed_at = state.banks["oca"].updated_at;

        state.apply(&JobResult::failed("oca", JobErrorKind::SessionFault, "browser crashed"));

        let oca = &state.banks["oca"];
        assert_eq!(oca.accounts, vec![account("1")]);
        assert_eq!(oca.updated_at, refreshed_at);
        assert_eq!(
            oca.last_error.as_ref().map(|e| e.kind),
            Some(JobErrorKind::SessionFault)
        );
    }

    #[test]
    fn success_clears_last_error() {
        let mut state = AggregateState::default();
        state.apply(&JobResult::failed("oca", JobErrorKind::AuthFailure, "bad password"));
        state.apply(&JobResult::success("oca", vec![account("2")]));
        assert!(state.banks["oca"].last_error.is_none());
        assert_eq!(state.banks["oca"].accounts.len(), 1);
    }

    #[test]
    fn timeout_kind_maps_to_timeout_outcome() {
        let result = JobResult::failed("brou", JobErrorKind::Timeout, "exceeded 300s");
        assert_eq!(result.outcome, JobOutcome::Timeout);
        assert!(result.accounts.is_empty());
    }

    #[test]
    fn serialized_account_uses_type_field() {
        let json = serde_json::to_value(account("9")).unwrap();
        assert_eq!(json["type"], "checking");
        assert_eq!(json["balance"]["number"], 1234.56);
        assert!(json.get("logo").is_none());
    }

    #[test]
    fn new_state_is_empty() {
        let state = AggregateState::default();
        assert!(state.is_empty());
        assert!(state.last_success().is_none());
    }
}
