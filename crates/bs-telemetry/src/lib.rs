//! Logging setup for balance-sentry binaries.
//!
//! Human-readable output for terminals and JSON lines for log shippers, both
//! filtered through `RUST_LOG` with a configurable fallback level. Output
//! goes to stderr so command output on stdout stays machine-readable.

pub mod logging;
