//! Typed wrappers for common engine commands.
//!
//! Thin shims over [`CliServer::run_json_command`]: each one knows the
//! argument spelling and the response shape, nothing more. UI
//! collaborators consume these instead of building argument vectors.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::client::CliServer;
use crate::error::CliServerError;

/// Response of `quarry version --format=json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub unpacked_location: Option<PathBuf>,
}

/// Response of `quarry resolve library-path`: everything the compiler
/// needs to know about a query's surroundings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySetup {
    #[serde(default)]
    pub library_path: Vec<PathBuf>,
    #[serde(default)]
    pub dbscheme: Option<PathBuf>,
    #[serde(default)]
    pub relative_name: Option<String>,
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

impl CliServer {
    /// Engine version, as reported by the engine itself.
    pub async fn version(&self) -> Result<VersionInfo, CliServerError> {
        self.run_json_command(
            vec!["version".to_string(), "--format=json".to_string()],
            "version check",
        )
        .await
    }

    /// Resolve the library path and dbscheme for a query.
    pub async fn resolve_library_path(
        &self,
        workspaces: &[PathBuf],
        query_path: &Path,
    ) -> Result<QuerySetup, CliServerError> {
        let mut args = vec![
            "resolve".to_string(),
            "library-path".to_string(),
            "--format=json".to_string(),
        ];
        for workspace in workspaces {
            args.push("--additional-packs".to_string());
            args.push(path_arg(workspace));
        }
        args.push("--query".to_string());
        args.push(path_arg(query_path));
        self.run_json_command(args, "resolving query library path")
            .await
    }

    /// Expand a query directory or suite into the queries it contains.
    pub async fn resolve_queries(&self, suite: &Path) -> Result<Vec<PathBuf>, CliServerError> {
        self.run_json_command(
            vec![
                "resolve".to_string(),
                "queries".to_string(),
                "--format=json".to_string(),
                path_arg(suite),
            ],
            "resolving queries",
        )
        .await
    }
}
