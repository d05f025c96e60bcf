//! Run operator (`Action::Run`, spec §4.7), grounded in `processing/run.py`:
//! invokes the external extraction tool appropriate to a source's format —
//! `osm-export-tool` against an `.osm.pbf`/`.osm` extract for `NodeType::OsmRunner`,
//! or the Open Library dump importer script for `NodeType::OpenlibraryRunner`.
//! Both shell out through `fs_util::run_external`; neither touches the
//! database directly, so this module stays outside the `postgis` gate.

use std::path::Path;
use std::process::Command;

use crate::error::BuildResult;
use crate::fs_util::{finalize_atomic, run_external, shadow_path};
use crate::node::NodeType;

/// Style/structure document driving an OSM extraction: which tags become
/// which output layers (spec §4.2's `structure` custom property, passed
/// through to `osm-export-tool` as a YAML/JSON mapping file).
pub fn run(node_type: NodeType, input: &str, dest: &Path, structure_file: Option<&Path>, overwrite: bool) -> BuildResult<bool> {
    if dest.exists() && !overwrite {
        return Ok(false);
    }
    let shadow = shadow_path(dest);
    crate::fs_util::ensure_parent_dir(dest)?;

    match node_type {
        NodeType::OsmRunner => run_osm_export_tool(input, &shadow, structure_file)?,
        NodeType::OpenlibraryRunner => run_openlibrary_importer(input, &shadow)?,
        other => {
            return Err(crate::error::BuildError::config(format!("run operator: unsupported node type {other:?}")));
        }
    }

    finalize_atomic(&shadow, dest)
}

fn run_osm_export_tool(input: &str, shadow: &Path, structure_file: Option<&Path>) -> BuildResult<()> {
    let mut cmd = Command::new("osm-export-tool");
    cmd.arg(input).arg(shadow);
    if let Some(structure) = structure_file {
        cmd.arg(structure);
    }
    run_external(cmd, "osm-export-tool")
}

fn run_openlibrary_importer(input: &str, shadow: &Path) -> BuildResult<()> {
    let mut cmd = Command::new("python3");
    cmd.args(["-m", "openlibrary_importer"]).arg(input).arg("--out").arg(shadow);
    run_external(cmd, "openlibrary_importer")
}
