//! File-conversion output operators (`Action::Output`, formats `geojson`,
//! `shp`, `qgis`), grounded in `output/base.py::convert_node_input_to_output_files`
//! and `output/qgis.py`. None of these touch the database directly — a
//! `geojson`/`shp` node's input is an already-exported GPKG sibling file
//! (spec §4.2's `OUTPUT_FORMATS_IMPLYING_GPKG` dependency), and the QGIS
//! project is generated by shelling out to QGIS's bundled Python. Kept
//! outside the `postgis` gate so a file-only export build still links.

use std::path::Path;
use std::process::Command;

use crate::error::BuildResult;
use crate::fs_util::{ensure_parent_dir, finalize_atomic, remove_if_exists, run_external, shadow_path};

/// The sibling files a `.shp` output carries alongside the main file —
/// `convert_node_input_to_output_files`'s `shp_extensions` list.
const SHP_SIDECAR_EXTENSIONS: &[&str] = &["dbf", "prj", "shx"];

/// Converts `input` (a GPKG or other ogr-readable file) to `output` via
/// `ogr2ogr`, atomically, carrying shapefile sidecar files along when the
/// output is a `.shp`.
pub fn convert_file(input: &Path, output: &Path, overwrite: bool) -> BuildResult<bool> {
    if output.exists() && !overwrite && sidecars_present(output) {
        return Ok(false);
    }
    if !input.exists() {
        return Err(crate::error::BuildError::not_found(format!("{}: input file does not exist", input.display())));
    }

    let shadow = shadow_path(output);
    remove_if_exists(&shadow)?;
    for ext in SHP_SIDECAR_EXTENSIONS {
        remove_if_exists(&shadow.with_extension(ext))?;
    }

    let mut cmd = Command::new("ogr2ogr");
    cmd.arg(&shadow).arg(input);
    run_external(cmd, "ogr2ogr")?;

    ensure_parent_dir(output)?;
    finalize_atomic(&shadow, output)?;

    if output.extension().and_then(|e| e.to_str()) == Some("shp") {
        for ext in SHP_SIDECAR_EXTENSIONS {
            let shadow_sidecar = shadow.with_extension(ext);
            if shadow_sidecar.exists() {
                finalize_atomic(&shadow_sidecar, &output.with_extension(ext))?;
            }
        }
    }
    Ok(true)
}

fn sidecars_present(output: &Path) -> bool {
    if output.extension().and_then(|e| e.to_str()) != Some("shp") {
        return true;
    }
    SHP_SIDECAR_EXTENSIONS.iter().all(|ext| output.with_extension(ext).exists())
}

/// Generates a QGIS project file for the build, always regenerated on every
/// run (spec §4.7's one deliberate exception to per-operator idempotence —
/// the original skips the existence check here on purpose).
pub fn generate_qgis_project(qgis_python: &Path, build_script: &Path, output: &Path) -> BuildResult<bool> {
    if !qgis_python.exists() {
        return Err(crate::error::BuildError::config(format!(
            "QGIS python interpreter not found at {} — set QGIS_PYTHON_PATH",
            qgis_python.display()
        )));
    }
    ensure_parent_dir(output)?;
    let mut cmd = Command::new(qgis_python);
    cmd.arg(build_script).arg(output);
    run_external(cmd, "qgis-python")?;
    Ok(true)
}
