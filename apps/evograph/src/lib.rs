//! # evograph
//!
//! The async shell around `evograph-core`: HTTP API, CLI, configuration and
//! the command dispatcher. The binary in `main.rs` is a thin wrapper.

pub mod api;
pub mod cli;
pub mod config;
pub mod dispatch;

pub use config::EvographConfig;
pub use dispatch::{CommandDispatcher, CommandEnvelope, CommandOutcome, RetryPolicy};
