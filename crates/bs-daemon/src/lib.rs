//! Scheduling and orchestration service for balance-sentry.
//!
//! - [`clock`] computes jittered daily fire times
//! - [`orchestrator`] runs the registered jobs one at a time, isolated from each other
//! - [`daemon`] ties the clock, the orchestrator and the store together and handles shutdown
//! - [`http_api`] optional read-only view of the current snapshot

pub mod clock;
pub mod daemon;
pub mod http_api;
pub mod job;
pub mod jobs;
pub mod orchestrator;
pub mod registry;
pub mod snapshot_bus;
