//! Query-server process wrapper.
//!
//! Owns the child process, the writer task feeding its stdin, the
//! reader task draining its stdout, and the stderr side-log task.
//! Disposal order is fixed and load-bearing: the RPC connection is
//! torn down first so no task touches the pipes of a dead process.

use tokio::process::Child;
use tokio::sync::mpsc;

pub(crate) enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

pub(crate) struct ServerProcess {
    pub child: Child,
    pub writer_tx: mpsc::Sender<WriterCommand>,
    pub writer_handle: tokio::task::JoinHandle<()>,
    pub reader_handle: tokio::task::JoinHandle<()>,
    pub stderr_handle: tokio::task::JoinHandle<()>,
}

impl ServerProcess {
    /// Tear the server down: RPC connection first, then stdin, then
    /// the process, then the output streams.
    pub async fn dispose(mut self) {
        // 1. RPC connection. The writer task shuts stdin down (step 2)
        //    on its way out; the reader is aborted so it stops pulling
        //    from a pipe we are about to invalidate.
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;
        if let Err(e) = self.writer_handle.await {
            tracing::debug!(error = %e, "query server writer task did not exit cleanly");
        }
        self.reader_handle.abort();

        // 3. Kill the process. Failing to kill an already-dead process
        //    must not propagate past disposal.
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "query server kill failed (already exited?)");
        }
        let _ = self.child.wait().await;

        // 4. Output streams.
        self.stderr_handle.abort();
    }
}
