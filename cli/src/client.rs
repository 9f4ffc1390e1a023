//! Single-flight command queue over the persistent CLI server.
//!
//! Callers enqueue commands from arbitrary concurrent call sites; an
//! owning actor task executes them strictly one at a time against one
//! long-lived child process, spawned lazily on first use and respawned
//! after any framing failure. A restart requested while a command is
//! in flight never preempts it: the actor finishes the current
//! exchange, then honors the restart before any queued command.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use quarry_types::EngineConfig;

use crate::distribution;
use crate::error::CliServerError;
use crate::server::{CommandOutput, ServerProcess};

/// Arguments the engine expects to start the NUL-protocol server.
const CLI_SERVER_ARGS: &[&str] = &["execute", "cli-server"];

struct Job {
    args: Vec<String>,
    description: String,
    reply: oneshot::Sender<Result<CommandOutput, CliServerError>>,
}

/// Handle to the CLI-server command queue.
///
/// All methods take `&self`; overlapping calls are serialized by the
/// queue, FIFO except for restarts. Dropping the handle (or calling
/// [`dispose`](Self::dispose)) shuts the server process down.
pub struct CliServer {
    job_tx: mpsc::UnboundedSender<Job>,
    restart_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    actor: tokio::task::JoinHandle<()>,
}

impl CliServer {
    /// Create the queue. The server process itself is spawned lazily
    /// by the first command.
    pub fn new(config: &EngineConfig) -> Result<Self, CliServerError> {
        let program = distribution::resolve_executable(config)?;
        let args = CLI_SERVER_ARGS.iter().map(|s| (*s).to_string()).collect();
        Ok(Self::with_command(program, args))
    }

    pub(crate) fn with_command(program: PathBuf, server_args: Vec<String>) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let actor = tokio::spawn(
            Actor {
                program,
                server_args,
                process: None,
            }
            .run(job_rx, restart_rx),
        );
        Self {
            job_tx,
            restart_tx,
            actor,
        }
    }

    /// Run one command against the CLI server and return its response
    /// payload.
    pub async fn run_command(
        &self,
        args: Vec<String>,
        description: &str,
    ) -> Result<String, CliServerError> {
        self.run_command_full(args, description)
            .await
            .map(|output| output.stdout)
    }

    /// Run one command and parse its response as JSON.
    pub async fn run_json_command<T: DeserializeOwned>(
        &self,
        args: Vec<String>,
        description: &str,
    ) -> Result<T, CliServerError> {
        let output = self.run_command_full(args, description).await?;
        serde_json::from_str(&output.stdout).map_err(|e| CliServerError::BadResponse {
            description: description.to_string(),
            detail: format!("response is not the expected JSON: {e}"),
            stderr: output.stderr,
        })
    }

    async fn run_command_full(
        &self,
        args: Vec<String>,
        description: &str,
    ) -> Result<CommandOutput, CliServerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            args,
            description: description.to_string(),
            reply: reply_tx,
        };
        self.job_tx
            .send(job)
            .map_err(|_| CliServerError::Disposed)?;
        reply_rx.await.map_err(|_| CliServerError::Disposed)?
    }

    /// Kill the server process and respawn it for the next command.
    ///
    /// If a command is executing, it is allowed to settle first; the
    /// restart then runs before any other queued command. Resolves
    /// once the old process is gone.
    pub async fn restart(&self) -> Result<(), CliServerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.restart_tx
            .send(ack_tx)
            .map_err(|_| CliServerError::Disposed)?;
        ack_rx.await.map_err(|_| CliServerError::Disposed)
    }

    /// Shut down the queue and the server process, waiting for the
    /// in-flight command (if any) to settle.
    pub async fn dispose(self) {
        drop(self.job_tx);
        drop(self.restart_tx);
        if let Err(e) = self.actor.await {
            tracing::warn!(error = %e, "CLI server actor did not shut down cleanly");
        }
    }

    /// PID of the live server process, if one is running.
    #[cfg(test)]
    pub(crate) async fn current_pid(&self) -> Option<u32> {
        // Observed through the queue so the answer is ordered with
        // respect to commands and restarts.
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            args: Vec::new(),
            description: "__pid__".to_string(),
            reply: reply_tx,
        };
        if self.job_tx.send(job).is_err() {
            return None;
        }
        match reply_rx.await {
            Ok(Ok(output)) => output.stdout.parse().ok(),
            _ => None,
        }
    }
}

struct Actor {
    program: PathBuf,
    server_args: Vec<String>,
    process: Option<ServerProcess>,
}

impl Actor {
    async fn run(
        mut self,
        mut job_rx: mpsc::UnboundedReceiver<Job>,
        mut restart_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    ) {
        loop {
            tokio::select! {
                // A pending restart always wins over queued commands:
                // it was scheduled while an earlier command was in
                // flight and must run before anything newer.
                biased;
                Some(ack) = restart_rx.recv() => {
                    self.restart().await;
                    let _ = ack.send(());
                }
                job = job_rx.recv() => {
                    let Some(job) = job else { break };
                    let result = self.execute(&job).await;
                    let _ = job.reply.send(result);
                }
            }
        }
        if let Some(process) = self.process.take() {
            process.dispose().await;
        }
    }

    async fn execute(&mut self, job: &Job) -> Result<CommandOutput, CliServerError> {
        let process = match self.process.as_mut() {
            Some(process) => process,
            None => {
                let process = ServerProcess::spawn(&self.program, &self.server_args).await?;
                self.process.insert(process)
            }
        };

        #[cfg(test)]
        if job.description == "__pid__" {
            return Ok(CommandOutput {
                stdout: process.pid().map(|p| p.to_string()).unwrap_or_default(),
                stderr: String::new(),
            });
        }

        process.clear_stderr();
        let result = process.exchange(&job.args, &job.description).await;
        if let Err(e) = &result
            && e.poisons_process()
            && let Some(process) = self.process.take()
        {
            tracing::debug!(description = %job.description, "discarding CLI server after failure");
            process.dispose().await;
        }
        result
    }

    async fn restart(&mut self) {
        tracing::info!("restarting CLI server");
        if let Some(process) = self.process.take() {
            process.dispose().await;
        }
        // The next command respawns lazily; nothing else to do here,
        // and the queue keeps draining even if the kill failed.
    }
}
