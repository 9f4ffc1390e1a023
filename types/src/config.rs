//! Engine client configuration.
//!
//! Deserialized from the host application's settings; every field has a
//! default so `{}` is a valid configuration. Validation is a separate,
//! explicit step — deserialization never rejects a value the UI may
//! still want to display back to the user.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Default worker-thread count passed to the query server.
const DEFAULT_NUM_THREADS: usize = 1;

fn default_num_threads() -> usize {
    DEFAULT_NUM_THREADS
}

/// Configuration for the Quarry engine client subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Path to the `quarry` executable. `None` means resolve from `PATH`.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Worker threads for the query server (`--threads N`).
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Memory budget for query evaluation in megabytes (`--ram=M`).
    /// `None` leaves the engine's own default in place.
    #[serde(default)]
    pub query_memory_mb: Option<u64>,
    /// Launch the query server with `--debug --tuple-counting`.
    #[serde(default)]
    pub debug: bool,
    /// Directory for the engine log and per-query side logs.
    /// `None` disables side logging.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: None,
            num_threads: DEFAULT_NUM_THREADS,
            query_memory_mb: None,
            debug: false,
            log_dir: None,
        }
    }
}

/// Validation errors for [`EngineConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("num_threads must be at least 1")]
    ZeroThreads,
    #[error("query_memory_mb must be at least 1 when set")]
    ZeroMemory,
}

impl EngineConfig {
    /// Check the configuration for values the engine would reject.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if self.query_memory_mb == Some(0) {
            return Err(ConfigError::ZeroMemory);
        }
        Ok(())
    }

    /// Arguments appended to `execute query-server`.
    #[must_use]
    pub fn query_server_args(&self) -> Vec<String> {
        let mut args = vec!["--threads".to_string(), self.num_threads.to_string()];
        if let Some(mb) = self.query_memory_mb {
            args.push(format!("--ram={mb}"));
        }
        if self.debug {
            args.push("--debug".to_string());
            args.push("--tuple-counting".to_string());
        }
        args
    }
}
