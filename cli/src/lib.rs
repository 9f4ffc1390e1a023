//! Client for the Quarry CLI server.
//!
//! Two independent execution modes against the same external binary:
//! a persistent NUL-protocol server behind a single-flight command
//! queue ([`CliServer`]), and fresh one-shot processes producing
//! NUL-separated JSON event streams ([`runner::run_async_command`]).

pub mod commands;
pub mod distribution;
pub mod error;
pub mod runner;

mod client;
mod server;

pub use client::CliServer;
pub use error::{CliServerError, DistributionError, RunnerError};
pub use runner::{EventStream, run_async_command};
