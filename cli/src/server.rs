//! NUL-protocol server process wrapper.
//!
//! One request is a JSON array of strings followed by a single `0x00`
//! byte on stdin; one response is everything on stdout up to the next
//! `0x00`. The wrapper scans the whole accumulated buffer for the
//! terminator (it need not arrive at a chunk boundary) and keeps any
//! bytes past it for the following response.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::CliServerError;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How long to wait for the exit status of a server whose response
/// stream ended before killing it outright.
const EXIT_WAIT: std::time::Duration = std::time::Duration::from_secs(2);

/// One command's result: the decoded response payload plus whatever
/// the server wrote to stderr while producing it.
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

pub(crate) struct ServerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    /// Stdout bytes past the previous response's terminator.
    read_buf: Vec<u8>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    stderr_task: tokio::task::JoinHandle<()>,
}

impl ServerProcess {
    pub async fn spawn(program: &Path, args: &[String]) -> Result<Self, CliServerError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(CliServerError::Spawn)?;
        tracing::debug!(program = %program.display(), pid = ?child.id(), "CLI server started");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CliServerError::Spawn(std::io::Error::other("no stdin handle")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CliServerError::Spawn(std::io::Error::other("no stdout handle")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| CliServerError::Spawn(std::io::Error::other("no stderr handle")))?;

        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_sink = stderr_buf.clone();
        let stderr_task = tokio::spawn(async move {
            let mut chunk = [0u8; READ_CHUNK_BYTES];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut buf = stderr_sink.lock().expect("stderr buffer lock poisoned");
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        });

        Ok(Self {
            child,
            stdin,
            stdout,
            read_buf: Vec::new(),
            stderr_buf,
            stderr_task,
        })
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Forget stderr captured for previous commands.
    pub fn clear_stderr(&self) {
        self.stderr_buf
            .lock()
            .expect("stderr buffer lock poisoned")
            .clear();
    }

    fn stderr_snapshot(&self) -> String {
        let buf = self.stderr_buf.lock().expect("stderr buffer lock poisoned");
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Send one command and read its NUL-terminated response.
    pub async fn exchange(
        &mut self,
        args: &[String],
        description: &str,
    ) -> Result<CommandOutput, CliServerError> {
        let mut request = serde_json::to_vec(args).map_err(|e| CliServerError::BadResponse {
            description: description.to_string(),
            detail: format!("could not encode request: {e}"),
            stderr: String::new(),
        })?;
        request.push(0);

        if let Err(e) = self.write_frame(&request).await {
            tracing::debug!(error = %e, "CLI server stdin write failed");
            return Err(self.command_failed(description).await);
        }

        // The terminator may arrive anywhere in a chunk; scan the
        // accumulated buffer, and keep bytes past it for the next
        // response. `scanned` avoids re-scanning on every chunk.
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.read_buf[scanned..].iter().position(|&b| b == 0) {
                let terminator = scanned + pos;
                let rest = self.read_buf.split_off(terminator + 1);
                let mut payload = std::mem::replace(&mut self.read_buf, rest);
                payload.truncate(terminator);
                let stdout =
                    String::from_utf8(payload).map_err(|e| CliServerError::BadResponse {
                        description: description.to_string(),
                        detail: format!("response is not valid UTF-8: {e}"),
                        stderr: self.stderr_snapshot(),
                    })?;
                return Ok(CommandOutput {
                    stdout,
                    stderr: self.stderr_snapshot(),
                });
            }
            scanned = self.read_buf.len();

            let mut chunk = [0u8; READ_CHUNK_BYTES];
            match self.stdout.read(&mut chunk).await {
                Ok(0) => return Err(self.command_failed(description).await),
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "CLI server stdout read failed");
                    return Err(self.command_failed(description).await);
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.stdin.write_all(frame).await?;
        self.stdin.flush().await
    }

    /// Build the error for a response stream that ended early.
    ///
    /// Waits briefly for the real exit code; a server that closed its
    /// stdout but keeps running is killed instead.
    async fn command_failed(&mut self, description: &str) -> CliServerError {
        let code = match tokio::time::timeout(EXIT_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => status.code(),
            _ => {
                let _ = self.child.start_kill();
                self.child.wait().await.ok().and_then(|status| status.code())
            }
        };
        CliServerError::CommandFailed {
            description: description.to_string(),
            code,
            stderr: self.stderr_snapshot(),
        }
    }

    /// Shut the server down.
    ///
    /// The documented clean-termination request is sent best-effort
    /// (the process may already have closed stdin), then teardown
    /// follows the fixed order: end stdin, kill, destroy stdout,
    /// destroy stderr.
    pub async fn dispose(mut self) {
        let mut shutdown = serde_json::to_vec(&["shutdown"]).unwrap_or_default();
        if !shutdown.is_empty() {
            shutdown.push(0);
            let _ = self.write_frame(&shutdown).await;
        }

        let _ = self.stdin.shutdown().await;
        drop(self.stdin);
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "CLI server kill failed (already exited?)");
        }
        let _ = self.child.wait().await;
        drop(self.stdout);
        self.stderr_task.abort();
    }
}
