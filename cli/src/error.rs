//! Error taxonomy for the CLI-server queue and the one-shot runner.
//!
//! The split mirrors how callers recover: a [`DistributionError`] is
//! fatal for the operation (nothing to run), a failed command leaves
//! the queue usable for the next command, and a bad payload carries
//! enough raw context to be reported without re-running anything.

use thiserror::Error;

/// The engine executable could not be resolved.
#[derive(Debug, Error)]
#[error("could not find the Quarry executable '{searched}'; is the engine installed and on PATH?")]
pub struct DistributionError {
    pub(crate) searched: String,
    #[source]
    pub(crate) source: which::Error,
}

/// Errors from [`CliServer`](crate::CliServer) commands.
#[derive(Debug, Error)]
pub enum CliServerError {
    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error("failed to launch the CLI server: {0}")]
    Spawn(#[source] std::io::Error),

    /// The server died (or its response stream ended) before the
    /// response terminator arrived.
    #[error("{description} failed{}{}", fmt_code(.code), fmt_stderr(.stderr))]
    CommandFailed {
        description: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The response arrived but could not be interpreted.
    #[error("unexpected response from {description}: {detail}{}", fmt_stderr(.stderr))]
    BadResponse {
        description: String,
        detail: String,
        stderr: String,
    },

    /// The server handle was disposed; no further commands run.
    #[error("the CLI server has been disposed")]
    Disposed,
}

/// Errors from one-shot `--format jsonz` runs.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Distribution(#[from] DistributionError),

    #[error("failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A stdout record was not valid JSON.
    #[error("malformed event from '{command}': {source}; record: {record}")]
    BadEvent {
        command: String,
        record: String,
        #[source]
        source: serde_json::Error,
    },

    /// The process exited non-zero after the event stream ended.
    #[error("'{command}' exited abnormally{}", fmt_code(.code))]
    ProcessFailed {
        command: String,
        code: Option<i32>,
    },

    #[error("'{command}' was cancelled")]
    Cancelled { command: String },
}

fn fmt_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => " without an exit code".to_string(),
    }
}

fn fmt_stderr(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("; stderr: {}", stderr.trim())
    }
}

impl CliServerError {
    /// Whether the server process can be trusted after this error.
    ///
    /// A framing failure means the stream is dead or desynchronized;
    /// the queue discards the process so the next command respawns. A
    /// payload problem leaves the framing intact and the process
    /// usable.
    pub(crate) fn poisons_process(&self) -> bool {
        match self {
            Self::CommandFailed { .. } | Self::Spawn(_) => true,
            Self::Distribution(_) | Self::BadResponse { .. } | Self::Disposed => false,
        }
    }
}
