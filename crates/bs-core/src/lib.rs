//! Shared types for balance-sentry, plus the encrypted credential vault and
//! the aggregate snapshot store.
//!
//! [`amount`] holds the parsing helpers job bodies use to turn scraped
//! display strings into [`types::Amount`]s and currency labels.

pub mod amount;
pub mod config;
pub mod crypto;
pub mod store;
pub mod types;
pub mod vault;
