//! JSON-RPC client for the Quarry query server.
//!
//! The query server is the second long-lived engine process: unlike
//! the one-at-a-time CLI server it multiplexes many concurrent
//! requests over one stdio pipe pair, and pushes asynchronous
//! progress and evaluation-completed notifications back to us.

pub mod codec;
pub mod protocol;
pub mod types;

mod client;
mod process;

pub use client::{CompileQueryParams, QueryServer, RunQueriesParams};
pub use protocol::{EvaluationCompleted, ProgressUpdate, ResultType};
pub use types::QueryServerError;
