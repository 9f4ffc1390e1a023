//! Core domain types shared by the Quarry engine client crates.

pub mod config;
pub mod ids;

pub use config::{ConfigError, EngineConfig};
pub use ids::{ProgressId, RunId};
