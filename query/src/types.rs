//! Public error type for the query-server client.

use thiserror::Error;

/// Errors from [`QueryServer`](crate::QueryServer) operations.
#[derive(Debug, Error)]
pub enum QueryServerError {
    #[error(transparent)]
    Config(#[from] quarry_types::ConfigError),

    #[error(transparent)]
    Distribution(#[from] quarry_cli::DistributionError),

    #[error("failed to launch the query server: {0}")]
    Spawn(#[source] std::io::Error),

    /// The server process died (or was restarted) while the request
    /// was outstanding; it will never be answered.
    #[error("the query server stopped before answering")]
    ServerStopped,

    /// The server answered with a JSON-RPC error object.
    #[error("query server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A request or response body could not be encoded/decoded.
    #[error("malformed query-server message: {0}")]
    Protocol(String),

    #[error("the request was cancelled")]
    Cancelled,
}
