//! Query-server client facade.
//!
//! Owns the long-lived query-server process and multiplexes any
//! number of concurrent requests over its stdio pipes. Three tables
//! route traffic back to callers: pending responses by request id,
//! progress notifications by progress-id, and evaluation completions
//! by run-id. Every table entry is removed on every exit path; a
//! notification whose id is no longer (or never was) in its table is
//! dropped, never an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use quarry_cli::distribution;
use quarry_types::{EngineConfig, ProgressId, RunId};
use quarry_utils::{LINE_SEPARATORS, SideLog, SplitBuffer};

use crate::codec::{FrameReader, FrameWriter};
use crate::process::{ServerProcess, WriterCommand};
use crate::protocol::{
    self, EvaluationCompleted, Incoming, Notification, ProgressUpdate, Request, WithProgressId,
};
use crate::types::QueryServerError;

/// Arguments the engine expects to start the query server, before the
/// configuration-derived ones.
const QUERY_SERVER_ARGS: &[&str] = &["execute", "query-server"];

const WRITER_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK_BYTES: usize = 8 * 1024;

type PendingMap = tokio::sync::Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>;

/// State shared with the reader task.
struct Shared {
    pending: PendingMap,
    progress: Mutex<HashMap<ProgressId, mpsc::UnboundedSender<ProgressUpdate>>>,
    completions: Mutex<HashMap<RunId, oneshot::Sender<EvaluationCompleted>>>,
    side_log: Option<Arc<SideLog>>,
}

/// Client for the query-server JSON-RPC protocol.
pub struct QueryServer {
    program: PathBuf,
    args: Vec<String>,
    shared: Arc<Shared>,
    /// The live process; `None` between a failed restart and the next
    /// successful one. Replaced wholesale on restart.
    process: tokio::sync::Mutex<Option<ServerProcess>>,
    next_request_id: AtomicU64,
    next_progress_id: AtomicU64,
    next_run_id: AtomicU64,
}

impl std::fmt::Debug for QueryServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryServer")
            .field("program", &self.program)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl QueryServer {
    /// Spawn the query server and install the notification handlers.
    pub async fn start(
        config: &EngineConfig,
        side_log: Option<Arc<SideLog>>,
    ) -> Result<Self, QueryServerError> {
        config.validate()?;
        let program = distribution::resolve_executable(config)?;
        let mut args: Vec<String> = QUERY_SERVER_ARGS.iter().map(|s| (*s).to_string()).collect();
        args.extend(config.query_server_args());
        Self::with_command(program, args, side_log).await
    }

    async fn with_command(
        program: PathBuf,
        args: Vec<String>,
        side_log: Option<Arc<SideLog>>,
    ) -> Result<Self, QueryServerError> {
        let shared = Arc::new(Shared {
            pending: tokio::sync::Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
            side_log,
        });
        let process = spawn_server(&program, &args, &shared).await?;
        Ok(Self {
            program,
            args,
            shared,
            process: tokio::sync::Mutex::new(Some(process)),
            next_request_id: AtomicU64::new(0),
            next_progress_id: AtomicU64::new(0),
            next_run_id: AtomicU64::new(0),
        })
    }

    /// Allocate a run identifier for an evaluation about to be
    /// submitted.
    pub fn next_run_id(&self) -> RunId {
        RunId::new(self.next_run_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Register the callback for one evaluation run's completion.
    ///
    /// Must happen before the run is submitted, or the completion may
    /// race the registration and be dropped as unknown.
    pub fn register_callback(&self, run_id: RunId, callback: oneshot::Sender<EvaluationCompleted>) {
        let mut completions = self.shared.completions.lock().expect("completions poisoned");
        if completions.insert(run_id, callback).is_some() {
            tracing::warn!(%run_id, "replacing an existing completion callback");
        }
    }

    /// Drop interest in one evaluation run's completion.
    pub fn unregister_callback(&self, run_id: RunId) {
        self.shared
            .completions
            .lock()
            .expect("completions poisoned")
            .remove(&run_id);
    }

    /// Send one request and wait for its response.
    ///
    /// A fresh progress-id is allocated per call; `progress` (if any)
    /// receives that request's `ql/progressUpdated` notifications and
    /// is deregistered on every exit path — success, error response,
    /// transport failure, or cancellation — so the table cannot grow
    /// under load.
    pub async fn send_request(
        &self,
        method: &'static str,
        body: serde_json::Value,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    ) -> Result<serde_json::Value, QueryServerError> {
        let progress_id = ProgressId::new(self.next_progress_id.fetch_add(1, Ordering::Relaxed) + 1);
        if let Some(tx) = progress {
            self.shared
                .progress
                .lock()
                .expect("progress poisoned")
                .insert(progress_id, tx);
        }
        let result = self.request_inner(method, body, progress_id, cancel).await;
        self.shared
            .progress
            .lock()
            .expect("progress poisoned")
            .remove(&progress_id);
        result
    }

    async fn request_inner(
        &self,
        method: &'static str,
        body: serde_json::Value,
        progress_id: ProgressId,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, QueryServerError> {
        let writer_tx = {
            let process = self.process.lock().await;
            process
                .as_ref()
                .map(|p| p.writer_tx.clone())
                .ok_or(QueryServerError::ServerStopped)?
            // Lock released here: requests multiplex, they don't
            // serialize on the process handle.
        };

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let params = serde_json::to_value(WithProgressId { body, progress_id })
            .map_err(|e| QueryServerError::Protocol(e.to_string()))?;
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| QueryServerError::Protocol(e.to_string()))?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, reply_tx);

        if writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(QueryServerError::ServerStopped);
        }

        tokio::select! {
            response = &mut reply_rx => match response {
                Ok(body) => interpret_response(body),
                // Sender dropped: the reader died or a restart wiped
                // the table.
                Err(_) => Err(QueryServerError::ServerStopped),
            },
            () = cancel.cancelled() => {
                self.shared.pending.lock().await.remove(&id);
                // Best-effort: ask the server to stop working on it.
                // Locally we are done waiting either way.
                let cancel_frame = serde_json::to_value(Notification::new(
                    protocol::CANCEL_METHOD,
                    serde_json::json!({ "id": id }),
                ))
                .map_err(|e| QueryServerError::Protocol(e.to_string()))?;
                let _ = writer_tx.send(WriterCommand::Send(cancel_frame)).await;
                Err(QueryServerError::Cancelled)
            }
        }
    }

    /// Dispose the current server process and start a fresh one.
    ///
    /// Both callback tables are reset: requests in flight against the
    /// old process can never be answered.
    pub async fn restart(&self) -> Result<(), QueryServerError> {
        let mut process = self.process.lock().await;
        if let Some(old) = process.take() {
            old.dispose().await;
        }
        self.shared.pending.lock().await.clear();
        self.shared
            .progress
            .lock()
            .expect("progress poisoned")
            .clear();
        self.shared
            .completions
            .lock()
            .expect("completions poisoned")
            .clear();
        *process = Some(spawn_server(&self.program, &self.args, &self.shared).await?);
        Ok(())
    }

    /// Shut the server down for good.
    pub async fn dispose(self) {
        let mut process = self.process.lock().await;
        if let Some(p) = process.take() {
            p.dispose().await;
        }
    }

    // ── Typed operations ───────────────────────────────────────────

    /// Compile a query.
    ///
    /// Routes subsequent engine log output to the query's side log
    /// *before* the request goes out, so concurrent log writes land
    /// in the right file.
    pub async fn compile_query(
        &self,
        params: CompileQueryParams,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    ) -> Result<serde_json::Value, QueryServerError> {
        if let Some(side_log) = &self.shared.side_log {
            let name = params
                .query_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("query");
            side_log.set_active_query(Some(name));
        }
        let body = to_body(&params)?;
        self.send_request(protocol::COMPILE_QUERY_METHOD, body, cancel, progress)
            .await
    }

    /// Evaluate previously compiled queries. Register a completion
    /// callback for `params.run_id` first.
    pub async fn run_queries(
        &self,
        params: RunQueriesParams,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    ) -> Result<serde_json::Value, QueryServerError> {
        let body = to_body(&params)?;
        self.send_request(protocol::RUN_QUERIES_METHOD, body, cancel, progress)
            .await
    }

    /// Clear the evaluation cache for a database.
    pub async fn clear_cache(
        &self,
        database: &Path,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, QueryServerError> {
        let body = serde_json::json!({ "db": database, "dryRun": dry_run });
        self.send_request(protocol::CLEAR_CACHE_METHOD, body, cancel, None)
            .await
    }

    /// Tell the server about databases it will be asked to evaluate
    /// against.
    pub async fn register_databases(
        &self,
        databases: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, QueryServerError> {
        let body = serde_json::json!({ "databases": databases });
        self.send_request(protocol::REGISTER_DATABASES_METHOD, body, cancel, None)
            .await
    }

    /// Withdraw databases registered earlier.
    pub async fn deregister_databases(
        &self,
        databases: &[PathBuf],
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, QueryServerError> {
        let body = serde_json::json!({ "databases": databases });
        self.send_request(protocol::DEREGISTER_DATABASES_METHOD, body, cancel, None)
            .await
    }
}

/// Parameters for [`QueryServer::compile_query`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileQueryParams {
    pub query_path: PathBuf,
    pub output_path: PathBuf,
    pub library_path: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dbscheme: Option<PathBuf>,
}

/// Parameters for [`QueryServer::run_queries`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunQueriesParams {
    pub run_id: RunId,
    pub database: PathBuf,
    pub compiled_query: PathBuf,
    pub output_dir: PathBuf,
}

fn to_body<T: Serialize>(params: &T) -> Result<serde_json::Value, QueryServerError> {
    serde_json::to_value(params).map_err(|e| QueryServerError::Protocol(e.to_string()))
}

fn interpret_response(body: serde_json::Value) -> Result<serde_json::Value, QueryServerError> {
    if let Some(error) = body.get("error") {
        return Err(QueryServerError::Rpc {
            code: error.get("code").and_then(serde_json::Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
}

/// Spawn the server process and its writer/reader/stderr tasks.
async fn spawn_server(
    program: &Path,
    args: &[String],
    shared: &Arc<Shared>,
) -> Result<ServerProcess, QueryServerError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(QueryServerError::Spawn)?;
    tracing::debug!(program = %program.display(), pid = ?child.id(), "query server started");

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| QueryServerError::Spawn(std::io::Error::other("no stdin handle")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| QueryServerError::Spawn(std::io::Error::other("no stdout handle")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| QueryServerError::Spawn(std::io::Error::other("no stderr handle")))?;

    let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
    let writer_handle = tokio::spawn(async move {
        {
            let mut writer = FrameWriter::new(&mut stdin);
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(error = %e, "query server write failed");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        }
        // End stdin before the process is killed (disposal step 2).
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut stdin).await;
    });

    let reader_shared = shared.clone();
    let reader_writer_tx = writer_tx.clone();
    let reader_handle = tokio::spawn(async move {
        let mut reader = FrameReader::new(stdout);
        loop {
            match reader.read_frame().await {
                Ok(Some(frame)) => {
                    dispatch_frame(&reader_shared, &frame, &reader_writer_tx).await;
                }
                Ok(None) => {
                    tracing::info!("query server closed its stdout");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "query server read failed");
                    break;
                }
            }
        }
        // No more responses are coming: wake every waiter with an
        // error instead of letting them hang.
        reader_shared.pending.lock().await.clear();
    });

    let stderr_log = shared.side_log.clone();
    let stderr_handle = tokio::spawn(async move {
        let mut splitter = SplitBuffer::new(LINE_SEPARATORS);
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            let done = match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => {
                    splitter.end();
                    true
                }
                Ok(n) => {
                    splitter.add_chunk(&chunk[..n]);
                    false
                }
            };
            while let Some(line) = splitter.next_record() {
                if let Some(log) = stderr_log.as_deref() {
                    log.append_line(&line);
                } else {
                    tracing::debug!(target: "quarry::engine", "{line}");
                }
            }
            if done {
                return;
            }
        }
    });

    Ok(ServerProcess {
        child,
        writer_tx,
        writer_handle,
        reader_handle,
        stderr_handle,
    })
}

/// Route one incoming frame to its table.
async fn dispatch_frame(
    shared: &Shared,
    frame: &serde_json::Value,
    writer_tx: &mpsc::Sender<WriterCommand>,
) {
    let Some(incoming) = protocol::classify(frame) else {
        tracing::trace!("ignoring malformed query-server frame");
        return;
    };
    match incoming {
        Incoming::Response { id, body } => {
            let sender = shared.pending.lock().await.remove(&id);
            match sender {
                Some(tx) => {
                    let _ = tx.send(body);
                }
                // Settled already (e.g. cancelled): not an error.
                None => tracing::trace!(id, "response for a request no longer pending"),
            }
        }
        Incoming::ServerRequest { id, method, params } => {
            if method == protocol::QUERY_COMPLETED_METHOD {
                // Acknowledge first: the server must not block on us.
                let _ = writer_tx
                    .send(WriterCommand::Send(protocol::empty_ack(&id)))
                    .await;
                handle_completion(shared, params);
            } else {
                tracing::debug!(%method, "query server sent an unsupported request");
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("Method not found: {method}") }
                });
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
        }
        Incoming::Notification { method, params } => {
            if method == protocol::PROGRESS_UPDATED_METHOD {
                handle_progress(shared, params);
            } else {
                tracing::trace!(%method, "ignoring query-server notification");
            }
        }
    }
}

fn handle_completion(shared: &Shared, params: Option<serde_json::Value>) {
    let Some(params) = params else { return };
    let mut completed: EvaluationCompleted = match serde_json::from_value(params) {
        Ok(completed) => completed,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable evaluation completion");
            return;
        }
    };
    // Stamp where this run's log output went before handing it over.
    if let Some(side_log) = &shared.side_log {
        completed.log_file_location = side_log.active_query_log_path();
    }
    let callback = shared
        .completions
        .lock()
        .expect("completions poisoned")
        .remove(&completed.run_id);
    match callback {
        Some(tx) => {
            let _ = tx.send(completed);
        }
        None => {
            tracing::warn!(run_id = %completed.run_id, "completion for an unknown run id dropped");
        }
    }
}

fn handle_progress(shared: &Shared, params: Option<serde_json::Value>) {
    let Some(params) = params else { return };
    let update: ProgressUpdate = match serde_json::from_value(params) {
        Ok(update) => update,
        Err(e) => {
            tracing::debug!(error = %e, "unparseable progress notification");
            return;
        }
    };
    let progress = shared.progress.lock().expect("progress poisoned");
    if let Some(tx) = progress.get(&update.id) {
        let _ = tx.send(update);
    }
    // Unknown progress-id: the request settled (or never registered a
    // listener). Silently dropped.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultType;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn test_shared(side_log: Option<Arc<SideLog>>) -> Arc<Shared> {
        Arc::new(Shared {
            pending: tokio::sync::Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            completions: Mutex::new(HashMap::new()),
            side_log,
        })
    }

    fn writer_channel() -> (
        mpsc::Sender<WriterCommand>,
        mpsc::Receiver<WriterCommand>,
    ) {
        mpsc::channel(8)
    }

    fn sent_frame(command: WriterCommand) -> serde_json::Value {
        match command {
            WriterCommand::Send(frame) => frame,
            WriterCommand::Shutdown => panic!("expected Send, got Shutdown"),
        }
    }

    #[cfg(unix)]
    async fn stub_server(script: &str) -> QueryServer {
        QueryServer::with_command(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), script.to_string()],
            None,
        )
        .await
        .unwrap()
    }

    // ── Frame dispatch ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_response_routes_to_pending_and_removes_entry() {
        init_tracing();
        let shared = test_shared(None);
        let (writer_tx, _writer_rx) = writer_channel();
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(1, tx);

        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}});
        dispatch_frame(&shared, &frame, &writer_tx).await;

        assert_eq!(rx.await.unwrap()["result"]["ok"], true);
        assert!(shared.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_response_for_unknown_id_is_ignored() {
        let shared = test_shared(None);
        let (writer_tx, mut writer_rx) = writer_channel();
        let frame = serde_json::json!({"jsonrpc": "2.0", "id": 404, "result": {}});
        dispatch_frame(&shared, &frame, &writer_tx).await;
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completion_is_acked_and_dispatched_once() {
        let shared = test_shared(None);
        let (writer_tx, mut writer_rx) = writer_channel();
        let (tx, rx) = oneshot::channel();
        shared
            .completions
            .lock()
            .unwrap()
            .insert(RunId::new(5), tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 31,
            "method": protocol::QUERY_COMPLETED_METHOD,
            "params": {"runId": 5, "resultType": "SUCCESS"}
        });
        dispatch_frame(&shared, &frame, &writer_tx).await;

        let ack = sent_frame(writer_rx.try_recv().unwrap());
        assert_eq!(ack["id"], 31);
        assert!(ack["result"].as_object().unwrap().is_empty());

        let completed = rx.await.unwrap();
        assert_eq!(completed.run_id, RunId::new(5));
        assert_eq!(completed.result_type, ResultType::Success);
        assert!(shared.completions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_for_unknown_run_id_is_dropped() {
        let shared = test_shared(None);
        let (writer_tx, mut writer_rx) = writer_channel();
        // A different run's callback must not receive it.
        let (tx, mut rx) = oneshot::channel();
        shared
            .completions
            .lock()
            .unwrap()
            .insert(RunId::new(6), tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": protocol::QUERY_COMPLETED_METHOD,
            "params": {"runId": 99, "resultType": "SUCCESS"}
        });
        dispatch_frame(&shared, &frame, &writer_tx).await;

        // Still acknowledged, still no cross-delivery, still no panic.
        let _ack = sent_frame(writer_rx.try_recv().unwrap());
        assert!(rx.try_recv().is_err());
        assert_eq!(shared.completions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_is_stamped_with_log_location() {
        let tmp = tempfile::tempdir().unwrap();
        let side_log = Arc::new(SideLog::new(tmp.path()).unwrap());
        side_log.set_active_query(Some("FindBugs.ql"));
        let shared = test_shared(Some(side_log.clone()));
        let (writer_tx, _writer_rx) = writer_channel();
        let (tx, rx) = oneshot::channel();
        shared
            .completions
            .lock()
            .unwrap()
            .insert(RunId::new(1), tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": protocol::QUERY_COMPLETED_METHOD,
            "params": {"runId": 1, "resultType": "SUCCESS"}
        });
        dispatch_frame(&shared, &frame, &writer_tx).await;

        let completed = rx.await.unwrap();
        assert_eq!(
            completed.log_file_location,
            Some(side_log.query_log_path("FindBugs.ql"))
        );
    }

    #[tokio::test]
    async fn test_progress_routed_by_id_and_unknown_dropped() {
        let shared = test_shared(None);
        let (writer_tx, _writer_rx) = writer_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared
            .progress
            .lock()
            .unwrap()
            .insert(ProgressId::new(2), tx);

        let known = serde_json::json!({
            "jsonrpc": "2.0",
            "method": protocol::PROGRESS_UPDATED_METHOD,
            "params": {"id": 2, "step": 1, "maxStep": 4, "message": "compiling"}
        });
        dispatch_frame(&shared, &known, &writer_tx).await;
        let update = rx.try_recv().unwrap();
        assert_eq!(update.step, 1);
        assert_eq!(update.message, "compiling");

        let unknown = serde_json::json!({
            "jsonrpc": "2.0",
            "method": protocol::PROGRESS_UPDATED_METHOD,
            "params": {"id": 7, "step": 1, "maxStep": 4}
        });
        dispatch_frame(&shared, &unknown, &writer_tx).await;
        assert!(rx.try_recv().is_err(), "unknown id must not cross-deliver");
    }

    #[tokio::test]
    async fn test_unsupported_server_request_gets_method_not_found() {
        let shared = test_shared(None);
        let (writer_tx, mut writer_rx) = writer_channel();
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "evaluation/unknownThing",
            "params": {}
        });
        dispatch_frame(&shared, &frame, &writer_tx).await;
        let reply = sent_frame(writer_rx.try_recv().unwrap());
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], -32601);
    }

    // ── End-to-end against shell stubs ─────────────────────────────

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_roundtrip_through_echo_stub() {
        // `cat` bounces our request frame back; the dispatcher treats
        // the echo as an unsupported server request and replies
        // method-not-found, which `cat` bounces back again as *our*
        // response. The request therefore settles with code -32601 —
        // after a full trip through writer, codec, and dispatcher.
        let server = stub_server("cat").await;
        let cancel = CancellationToken::new();
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let err = server
            .send_request(
                protocol::RUN_QUERIES_METHOD,
                serde_json::json!({"database": "db"}),
                &cancel,
                Some(progress_tx),
            )
            .await
            .unwrap_err();
        match err {
            QueryServerError::Rpc { code, .. } => assert_eq!(code, -32601),
            other => panic!("expected Rpc error, got {other}"),
        }
        // The cleanup invariant: settling removed the progress entry.
        assert!(server.shared.progress.lock().unwrap().is_empty());
        server.dispose().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_clears_tables_and_fails_inflight() {
        init_tracing();
        let server = Arc::new(stub_server("sleep 60").await);
        let (tx, _rx) = oneshot::channel();
        server.register_callback(RunId::new(3), tx);

        let inflight = {
            let server = server.clone();
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                server
                    .send_request(
                        protocol::CLEAR_CACHE_METHOD,
                        serde_json::json!({}),
                        &cancel,
                        None,
                    )
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        server.restart().await.unwrap();
        assert!(matches!(
            inflight.await.unwrap(),
            Err(QueryServerError::ServerStopped)
        ));
        assert!(server.shared.completions.lock().unwrap().is_empty());
        assert!(server.shared.progress.lock().unwrap().is_empty());
        assert!(server.shared.pending.lock().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_settles_locally_and_cleans_tables() {
        // The stub consumes requests and never answers.
        let server = Arc::new(stub_server("cat >/dev/null").await);
        let cancel = CancellationToken::new();
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let inflight = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                server
                    .send_request(
                        protocol::RUN_QUERIES_METHOD,
                        serde_json::json!({}),
                        &cancel,
                        Some(progress_tx),
                    )
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        cancel.cancel();
        assert!(matches!(
            inflight.await.unwrap(),
            Err(QueryServerError::Cancelled)
        ));
        assert!(server.shared.pending.lock().await.is_empty());
        assert!(server.shared.progress.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compile_query_activates_side_log_routing() {
        let tmp = tempfile::tempdir().unwrap();
        let side_log = Arc::new(SideLog::new(tmp.path()).unwrap());
        let server = QueryServer::with_command(
            PathBuf::from("/bin/sh"),
            vec!["-c".to_string(), "cat".to_string()],
            Some(side_log.clone()),
        )
        .await
        .unwrap();

        let cancel = CancellationToken::new();
        let params = CompileQueryParams {
            query_path: PathBuf::from("queries/FindBugs.ql"),
            output_path: PathBuf::from("out/FindBugs.qlo"),
            library_path: Vec::new(),
            dbscheme: None,
        };
        // The echo stub turns this into an Rpc error; what matters is
        // that routing switched before the request was sent.
        let _ = server.compile_query(params, &cancel, None).await;
        assert_eq!(
            side_log.active_query_log_path(),
            Some(side_log.query_log_path("FindBugs.ql"))
        );
        server.dispose().await;
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "num_threads": 0
        }))
        .unwrap();
        let err = QueryServer::start(&config, None).await.unwrap_err();
        assert!(matches!(err, QueryServerError::Config(_)));
    }

    /// A client whose process slot is empty; no engine involved.
    fn stopped_server() -> QueryServer {
        QueryServer {
            program: PathBuf::from("unused"),
            args: Vec::new(),
            shared: test_shared(None),
            process: tokio::sync::Mutex::new(None),
            next_request_id: AtomicU64::new(0),
            next_progress_id: AtomicU64::new(0),
            next_run_id: AtomicU64::new(0),
        }
    }

    #[tokio::test]
    async fn test_run_id_allocation_is_monotonic() {
        let server = stopped_server();
        let a = server.next_run_id();
        let b = server.next_run_id();
        assert_eq!(a, RunId::new(1));
        assert!(b.value() > a.value());
    }

    #[tokio::test]
    async fn test_request_against_stopped_server_fails_cleanly() {
        let server = stopped_server();
        let cancel = CancellationToken::new();
        let (progress_tx, _progress_rx) = mpsc::unbounded_channel();
        let err = server
            .send_request(
                protocol::CLEAR_CACHE_METHOD,
                serde_json::json!({}),
                &cancel,
                Some(progress_tx),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryServerError::ServerStopped));
        // Even the failure path deregistered the progress entry.
        assert!(server.shared.progress.lock().unwrap().is_empty());
    }
}
