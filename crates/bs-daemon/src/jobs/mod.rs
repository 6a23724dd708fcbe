//! Built-in job bodies.

pub mod command;

pub use command::CommandJob;
