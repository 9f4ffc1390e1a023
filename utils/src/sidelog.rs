//! Per-query side-log routing.
//!
//! The engine writes human-readable progress to stderr while it works.
//! Those lines always land in `engine.log`; while a query is being
//! compiled or evaluated they are additionally copied to a per-query
//! log file so each query's output can be surfaced on its own. Which
//! query is "active" is best-effort bookkeeping set by the caller just
//! before the corresponding request goes out.
//!
//! Logging must never fail the caller: every IO error here is reported
//! via `tracing::warn!` and swallowed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File name of the always-on engine log inside the log directory.
const ENGINE_LOG_NAME: &str = "engine.log";

struct ActiveQuery {
    name: String,
    file: Option<File>,
}

/// Router for engine log lines: everything to `engine.log`, plus a copy
/// to `<query>.log` while a query is active.
pub struct SideLog {
    dir: PathBuf,
    engine_log: Mutex<File>,
    // Lock order: `active` after `engine_log`, never the reverse.
    active: Mutex<Option<ActiveQuery>>,
}

/// Make a query name safe to use as a file stem.
fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

impl SideLog {
    /// Open (creating if needed) the log directory and `engine.log`.
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let engine_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(ENGINE_LOG_NAME))?;
        Ok(Self {
            dir,
            engine_log: Mutex::new(engine_log),
            active: Mutex::new(None),
        })
    }

    /// Path of the side log for the given query name.
    #[must_use]
    pub fn query_log_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.log", sanitize_file_stem(name)))
    }

    /// Path of the side log for the currently active query, if any.
    #[must_use]
    pub fn active_query_log_path(&self) -> Option<PathBuf> {
        let active = self.active.lock().expect("sidelog lock poisoned");
        active.as_ref().map(|a| self.query_log_path(&a.name))
    }

    /// Switch side-log routing to the given query (or to none).
    ///
    /// Must be called before the request whose output should land in
    /// the query's log is sent, so concurrent writes are routed to the
    /// right file.
    pub fn set_active_query(&self, name: Option<&str>) {
        let mut active = self.active.lock().expect("sidelog lock poisoned");
        *active = name.map(|name| {
            let path = self.query_log_path(name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| {
                    tracing::warn!(path = %path.display(), error = %e, "cannot open query side log");
                })
                .ok();
            ActiveQuery {
                name: name.to_string(),
                file,
            }
        });
    }

    /// Append one line to `engine.log` and, if set, the active query's
    /// side log.
    pub fn append_line(&self, line: &str) {
        {
            let mut engine_log = self.engine_log.lock().expect("sidelog lock poisoned");
            if let Err(e) = writeln!(engine_log, "{line}") {
                tracing::warn!(error = %e, "engine log write failed");
            }
        }
        let mut active = self.active.lock().expect("sidelog lock poisoned");
        if let Some(a) = active.as_mut()
            && let Some(file) = a.file.as_mut()
            && let Err(e) = writeln!(file, "{line}")
        {
            tracing::warn!(query = %a.name, error = %e, "query side log write failed");
            // Stop retrying a dead file handle.
            a.file = None;
        }
    }

    /// The log directory this router writes into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
