//! Query-server JSON-RPC message types.
//!
//! Three traffic shapes arrive from the server: responses to our
//! requests (matched by id), `ql/progressUpdated` notifications
//! (matched by progress-id), and `evaluation/queryCompleted` — a
//! request *from* the server (matched by run-id) that we must answer
//! with an empty acknowledgement so it doesn't block.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use quarry_types::{ProgressId, RunId};

pub const PROGRESS_UPDATED_METHOD: &str = "ql/progressUpdated";
pub const QUERY_COMPLETED_METHOD: &str = "evaluation/queryCompleted";
pub const CANCEL_METHOD: &str = "$/cancelRequest";

pub const COMPILE_QUERY_METHOD: &str = "compilation/compileQuery";
pub const RUN_QUERIES_METHOD: &str = "evaluation/runQueries";
pub const CLEAR_CACHE_METHOD: &str = "evaluation/clearCache";
pub const REGISTER_DATABASES_METHOD: &str = "evaluation/registerDatabases";
pub const DEREGISTER_DATABASES_METHOD: &str = "evaluation/deregisterDatabases";

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: serde_json::Value,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: serde_json::Value,
}

impl Notification {
    pub fn new(method: &'static str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Every request parameter block is wrapped with the progress-id the
/// client allocated for it, so the server can tag its progress
/// notifications.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WithProgressId<T> {
    pub body: T,
    pub progress_id: ProgressId,
}

/// `ql/progressUpdated` notification payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub id: ProgressId,
    pub step: u64,
    pub max_step: u64,
    #[serde(default)]
    pub message: String,
}

/// `evaluation/queryCompleted` payload: the server finished (or gave
/// up on) one evaluation run.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationCompleted {
    pub run_id: RunId,
    pub result_type: ResultType,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub evaluation_time_ms: Option<u64>,
    /// Stamped by the client from the side-log router before
    /// dispatch; the server never sets it.
    #[serde(default)]
    pub log_file_location: Option<PathBuf>,
}

/// Outcome category of an evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultType {
    Success,
    CompilationError,
    Oom,
    Timeout,
    Cancellation,
    OtherError,
}

/// Classification of one incoming frame.
///
/// A closed union with exhaustive matching in the dispatcher; frames
/// that fit no arm are reported by the classifier as `None` and
/// dropped with a trace log.
#[derive(Debug)]
pub(crate) enum Incoming {
    /// Response to one of our requests.
    Response { id: u64, body: serde_json::Value },
    /// Request originated by the server; must be answered.
    ServerRequest {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Fire-and-forget notification from the server.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

pub(crate) fn classify(frame: &serde_json::Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let is_reply = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, is_reply) {
        (Some(id), None, true) => Some(Incoming::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id), Some(method), _) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(Incoming::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// The empty acknowledgement sent for `evaluation/queryCompleted`.
pub(crate) fn empty_ack(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {}
    })
}
