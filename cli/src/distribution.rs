//! Locating the Quarry engine executable.

use std::path::{Path, PathBuf};

use quarry_types::EngineConfig;

use crate::error::DistributionError;

/// Executable name looked up on `PATH` when the configuration does
/// not pin a path.
const DEFAULT_EXECUTABLE: &str = "quarry";

/// Resolve the engine executable for the given configuration.
///
/// A configured path is verified the same way a bare name is: `which`
/// checks existence and executability, so a stale configured path
/// fails here rather than at spawn time with a less useful error.
pub fn resolve_executable(config: &EngineConfig) -> Result<PathBuf, DistributionError> {
    let candidate: &Path = config
        .executable
        .as_deref()
        .unwrap_or(Path::new(DEFAULT_EXECUTABLE));
    which::which(candidate).map_err(|source| DistributionError {
        searched: candidate.display().to_string(),
        source,
    })
}
