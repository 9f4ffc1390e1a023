//! One-shot `--format jsonz` command runner.
//!
//! Unlike the queued CLI-server protocol, every call here launches a
//! fresh short-lived process. Its stdout is a sequence of JSON
//! documents separated by `0x00` bytes; its stderr is human-readable
//! progress, line-split and routed to the side log. Events are
//! delivered lazily as they are parsed; the process exit status is
//! only checked (and only trustworthy) once the stream is drained.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use quarry_types::EngineConfig;
use quarry_utils::{LINE_SEPARATORS, NUL_SEPARATOR, SideLog, SplitBuffer};

use crate::distribution;
use crate::error::RunnerError;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Channel capacity for parsed events; applies backpressure to a
/// child that produces faster than the caller consumes.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Run `quarry <command...> --format jsonz -v --log-to-stderr <args...>`
/// and return the lazy event stream.
///
/// Cancelling `cancel` kills the process (and its process group on
/// Unix); the stream then simply ends early and the final drain
/// reports [`RunnerError::Cancelled`]. There is no ordering guarantee
/// between concurrent one-shot runs.
pub async fn run_async_command(
    config: &EngineConfig,
    command: &[&str],
    args: &[String],
    side_log: Option<Arc<SideLog>>,
    cancel: CancellationToken,
) -> Result<EventStream, RunnerError> {
    let program = distribution::resolve_executable(config)?;
    let command_name = command.join(" ");

    let mut cmd = Command::new(&program);
    cmd.args(command)
        .args(["--format", "jsonz", "-v", "--log-to-stderr"])
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    new_session(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
        command: command_name.clone(),
        source,
    })?;
    tracing::debug!(command = %command_name, pid = ?child.id(), "one-shot engine command started");

    let mut stdout = child.stdout.take().ok_or_else(|| RunnerError::Spawn {
        command: command_name.clone(),
        source: std::io::Error::other("no stdout handle"),
    })?;
    let mut stderr = child.stderr.take().ok_or_else(|| RunnerError::Spawn {
        command: command_name.clone(),
        source: std::io::Error::other("no stderr handle"),
    })?;
    let pid = child.id();

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let stdout_command = command_name.clone();
    let stdout_task = tokio::spawn(async move {
        let mut splitter = SplitBuffer::new(NUL_SEPARATOR);
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        loop {
            let done = match stdout.read(&mut chunk).await {
                Ok(0) | Err(_) => {
                    splitter.end();
                    true
                }
                Ok(n) => {
                    splitter.add_chunk(&chunk[..n]);
                    false
                }
            };
            while let Some(record) = splitter.next_record() {
                let event = serde_json::from_str(&record).map_err(|source| {
                    RunnerError::BadEvent {
                        command: stdout_command.clone(),
                        record,
                        source,
                    }
                });
                if event_tx.send(event).await.is_err() {
                    // Receiver gone; stop parsing.
                    return;
                }
            }
            if done {
                return;
            }
        }
    });

    let stderr_log = side_log.clone();
    let stderr_task = tokio::spawn(async move {
        let mut splitter = SplitBuffer::new(LINE_SEPARATORS);
        let mut chunk = [0u8; READ_CHUNK_BYTES];
        let emit = |line: String| {
            if let Some(log) = stderr_log.as_deref() {
                log.append_line(&line);
            } else {
                tracing::debug!(target: "quarry::engine", "{line}");
            }
        };
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
                emit(line);
            }
            if done {
                return;
            }
        }
    });

    // The reaper owns the child: it waits for a natural exit, or kills
    // the whole process group when cancellation fires.
    let reaper_cancel = cancel.clone();
    let reaper = tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => status,
            () = reaper_cancel.cancelled() => {
                #[cfg(unix)]
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                #[cfg(not(unix))]
                let _ = pid;
                let _ = child.start_kill();
                child.wait().await
            }
        }
    });

    Ok(EventStream {
        command: command_name,
        event_rx,
        stderr_task: Some(stderr_task),
        stdout_task: Some(stdout_task),
        reaper: Some(reaper),
        cancel,
        finished: false,
    })
}

/// Lazy, finite, non-restartable sequence of parsed JSON events.
#[derive(Debug)]
pub struct EventStream {
    command: String,
    event_rx: mpsc::Receiver<Result<serde_json::Value, RunnerError>>,
    stdout_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
    reaper: Option<tokio::task::JoinHandle<std::io::Result<std::process::ExitStatus>>>,
    cancel: CancellationToken,
    finished: bool,
}

impl EventStream {
    /// Next parsed event.
    ///
    /// `Ok(None)` means the stream is exhausted **and** the process
    /// exited cleanly; a non-zero exit (or cancellation) surfaces as
    /// an error from the draining call, even if every event before it
    /// was delivered. A `BadEvent` error only skips the offending
    /// record; later records are still delivered.
    pub async fn next_event(&mut self) -> Result<Option<serde_json::Value>, RunnerError> {
        if self.finished {
            return Ok(None);
        }
        match self.event_rx.recv().await {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(e)) => Err(e),
            None => {
                self.finished = true;
                self.wait_for_exit().await?;
                Ok(None)
            }
        }
    }

    /// Join the IO tasks and the reaper; both stdout and stderr run to
    /// completion (or cancellation) together before the exit status is
    /// interpreted.
    async fn wait_for_exit(&mut self) -> Result<(), RunnerError> {
        if let Some(task) = self.stdout_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.stderr_task.take() {
            let _ = task.await;
        }
        let status = match self.reaper.take() {
            Some(reaper) => reaper.await.ok().and_then(Result::ok),
            None => None,
        };
        if self.cancel.is_cancelled() {
            return Err(RunnerError::Cancelled {
                command: self.command.clone(),
            });
        }
        match status {
            Some(status) if status.success() => Ok(()),
            status => Err(RunnerError::ProcessFailed {
                command: self.command.clone(),
                code: status.and_then(|s| s.code()),
            }),
        }
    }
}

/// Put the child in its own session so the whole process tree can be
/// killed together on cancellation.
#[cfg(unix)]
fn new_session(cmd: &mut Command) {
    // SAFETY: setsid is async-signal-safe and called in the child
    // before exec.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Best-effort kill of the process group rooted at `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // The child was made a session leader, so pid == pgid.
    let result = unsafe { libc::killpg(pid as i32, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::debug!(pid, error = %err, "process-group kill failed");
        }
    }
}
