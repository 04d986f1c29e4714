//! Wires the JSON-lines export sink's configuration (§4.2, §9). The
//! `Writer` itself does the writing; this module only resolves the path and
//! validates its parent directory exists, the way `outdir`/`errdir` are
//! validated before the event loop starts (§4 "Setup failure").

use std::path::{Path, PathBuf};

use pssh_core::PsshError;

/// Validates that `path`'s parent directory exists (or `path` has no
/// parent, meaning it's relative to the cwd) before the `Writer` thread
/// tries to open it.
pub fn resolve_export_path(path: Option<PathBuf>) -> Result<Option<PathBuf>, PsshError> {
    let Some(path) = path else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(PsshError::SetupFailure(format!(
                "export path's parent directory does not exist: {parent:?}"
            )));
        }
    }
    Ok(Some(path))
}

/// Validates an output/error directory exists before tasks start spawning
/// (§4 "Setup failure": missing output directory is fatal, not per-task).
pub fn validate_output_dir(dir: &Option<PathBuf>) -> Result<(), PsshError> {
    if let Some(dir) = dir {
        if !Path::new(dir).is_dir() {
            return Err(PsshError::SetupFailure(format!(
                "output directory does not exist: {dir:?}"
            )));
        }
    }
    Ok(())
}
