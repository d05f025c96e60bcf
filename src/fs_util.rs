//! Atomic filesystem helpers shared by the download/unzip/run/export
//! operators (spec §4.7), grounded in the `src/io.rs`
//! write-then-rename pattern (`open_for_big_write`/`finalize_big_write`),
//! generalized here into a `tmp-` shadow-file convention that matches the
//! original's `tmp-{output}` / `{output}.tmp` naming rather than a hidden
//! tempfile, since several downstream steps (e.g. shapefile sibling moves)
//! need to find the shadow file by name.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;

use crate::error::{BuildError, BuildResult};

/// Shadow path for an atomic write targeting `dest`: `tmp-{filename}` in the
/// same directory (matches `output/base.py`'s `convert_node_input_to_output_files`).
pub fn shadow_path(dest: &Path) -> PathBuf {
    let filename = dest.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
    dest.with_file_name(format!("tmp-{filename}"))
}

/// Ensures the parent directory of `path` exists.
pub fn ensure_parent_dir(path: &Path) -> BuildResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    Ok(())
}

/// Renames `shadow` into `dest`, removing any stale shadow file first. Used
/// after every operator finishes writing to its `tmp-`/`.tmp` path so a
/// half-written file is never mistaken for a finished one (spec §4.7's
/// "atomic rename on success" invariant, shared by every exporter and the
/// downloader/unzipper/runner).
pub fn finalize_atomic(shadow: &Path, dest: &Path) -> BuildResult<()> {
    ensure_parent_dir(dest)?;
    fs::rename(shadow, dest)
        .with_context(|| format!("renaming {} to {}", shadow.display(), dest.display()))?;
    Ok(())
}

/// Removes `path` if present, swallowing a missing-file error — mirrors the
/// original's repeated `if tmp_path.exists(): tmp_path.unlink()` guards.
pub fn remove_if_exists(path: &Path) -> BuildResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::from(e).context(format!("removing {}", path.display())).into()),
    }
}

/// Removes a directory tree if present, swallowing a missing-dir error —
/// used to clear a zip extraction work directory (`unzip.py`'s `work_dir`).
pub fn remove_dir_if_exists(path: &Path) -> BuildResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::from(e).context(format!("removing directory {}", path.display())).into()),
    }
}

/// Runs an external tool, classifying a non-zero exit as
/// `BuildError::ExternalTool` with captured stderr (spec §4.7's uniform
/// subprocess error shape across `ogr2ogr`/`osm-export-tool`/`tippecanoe`/
/// QGIS's bundled Python/`git`).
pub fn run_external(mut cmd: Command, tool: &str) -> BuildResult<()> {
    let output = cmd.output().with_context(|| format!("spawning `{tool}`"))?;
    if !output.status.success() {
        return Err(BuildError::ExternalTool {
            tool: tool.to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}
