//! Execution harness shared by the daemon and its jobs.
//!
//! - Two-phase shutdown coordination (drain, then abort)
//! - Bounded retry of transient failures with a fixed backoff

pub mod retry;
pub mod shutdown;
