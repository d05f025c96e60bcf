//! Install operator (`Action::Install`, `Format::TILESERVER`, spec §4.7),
//! grounded in `install/tileserver.py::OpenSiteTileserver`: stages the
//! tileserver's static basemap assets, builds (once) a global coastline +
//! landcover basemap with `tilemaker`, merges the node's own OSM extract
//! into it, and clones the tileserver's font set from its upstream repo.
//! Every step is idempotent — re-running after a partial failure only
//! redoes the step whose output is missing, matching the original's
//! per-artifact existence checks rather than one all-or-nothing build.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;

use crate::error::BuildResult;
use crate::fs_util::{finalize_atomic, remove_dir_if_exists, remove_if_exists, run_external, shadow_path};

/// Paths the installer needs, mirroring `OpenSiteConstants`' tileserver
/// group: a source assets tree to stage once, and the destination
/// directories under the build output the node's files land in.
pub struct TileserverPaths {
    pub basemap_src: PathBuf,
    pub basemap_dest: PathBuf,
    pub sprites_src: PathBuf,
    pub sprites_dest: PathBuf,
    pub output_basemap_dir: PathBuf,
    pub tileserver_data_dir: PathBuf,
    pub tileserver_output_dir: PathBuf,
    pub fonts_dir: PathBuf,
    pub fonts_github_url: String,
    pub coastline_process: PathBuf,
    pub coastline_config: PathBuf,
    pub omt_process: PathBuf,
    pub omt_config: PathBuf,
    pub bbox: String,
}

/// Installs tileserver assets and the merged basemap for one OSM extract.
/// `osm_pbf` is the already-downloaded `.osm.pbf` this node depends on;
/// `basename` names the resulting `.mbtiles` (e.g. `great-britain-latest`).
pub fn install_tileserver(paths: &TileserverPaths, osm_pbf: &Path, basename: &str) -> BuildResult<bool> {
    fs::create_dir_all(&paths.output_basemap_dir).with_context(|| format!("creating {}", paths.output_basemap_dir.display()))?;
    fs::create_dir_all(&paths.tileserver_data_dir).with_context(|| format!("creating {}", paths.tileserver_data_dir.display()))?;

    if !osm_pbf.exists() {
        return Err(crate::error::BuildError::not_found(format!(
            "{}: missing from OSM downloads, required to install tileserver files",
            osm_pbf.display()
        )));
    }

    if !paths.basemap_dest.exists() {
        copy_dir_recursive(&paths.basemap_src, &paths.basemap_dest)?;
    }
    if !paths.sprites_dest.exists() {
        copy_dir_recursive(&paths.sprites_src, &paths.sprites_dest)?;
    }

    let basemap_mbtiles = paths.output_basemap_dir.join(format!("{basename}.mbtiles"));
    if !basemap_mbtiles.exists() {
        build_basemap(paths, osm_pbf, &basemap_mbtiles)?;
    }

    let tileserver_mbtiles = paths.tileserver_data_dir.join(format!("{basename}.mbtiles"));
    if !tileserver_mbtiles.exists() {
        fs::copy(&basemap_mbtiles, &tileserver_mbtiles)
            .with_context(|| format!("copying {} to {}", basemap_mbtiles.display(), tileserver_mbtiles.display()))?;
    }

    if !paths.fonts_dir.exists() {
        clone_fonts(paths)?;
    }

    Ok(true)
}

fn build_basemap(paths: &TileserverPaths, osm_pbf: &Path, basemap_mbtiles: &Path) -> BuildResult<()> {
    let shadow = shadow_path(basemap_mbtiles);
    remove_if_exists(&shadow)?;

    update_json_source_paths(&paths.coastline_config, &format!("{}/", paths.basemap_dest.display()))?;

    let mut cmd = Command::new("tilemaker");
    cmd.args(["--input"]).arg(osm_pbf);
    cmd.arg("--output").arg(&shadow);
    cmd.args(["--bbox", &paths.bbox]);
    cmd.arg("--process").arg(&paths.coastline_process);
    cmd.arg("--config").arg(&paths.coastline_config);
    run_external(cmd, "tilemaker")?;

    let mut cmd = Command::new("tilemaker");
    cmd.arg("--input").arg(osm_pbf);
    cmd.arg("--output").arg(&shadow);
    cmd.arg("--merge");
    cmd.arg("--process").arg(&paths.omt_process);
    cmd.arg("--config").arg(&paths.omt_config);
    run_external(cmd, "tilemaker")?;

    finalize_atomic(&shadow, basemap_mbtiles)
}

fn clone_fonts(paths: &TileserverPaths) -> BuildResult<()> {
    let work_dir = paths.tileserver_output_dir.join("tmp-fonts");
    remove_dir_if_exists(&work_dir)?;

    let mut cmd = Command::new("git");
    cmd.current_dir(&paths.tileserver_output_dir);
    cmd.args(["clone", &paths.fonts_github_url, "tmp-fonts"]);
    run_external(cmd, "git")?;

    let fonts_subdir = work_dir.join("fonts");
    fs::rename(&fonts_subdir, &paths.fonts_dir)
        .with_context(|| format!("moving {} to {}", fonts_subdir.display(), paths.fonts_dir.display()))?;
    remove_dir_if_exists(&work_dir)?;
    Ok(())
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> BuildResult<()> {
    fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry.with_context(|| format!("reading entry in {}", src.display()))?;
        let target = dest.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| format!("copying {} to {}", entry.path().display(), target.display()))?;
        }
    }
    Ok(())
}

/// Prefixes every `"source"` string field in a tilemaker config's JSON tree
/// with `prefix`, unless it's already prefixed. Rewritten atomically.
fn update_json_source_paths(path: &Path, prefix: &str) -> BuildResult<()> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut doc: serde_json::Value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    walk_and_prefix(&mut doc, prefix);

    let shadow = shadow_path(path);
    let body = serde_json::to_string_pretty(&doc).with_context(|| "serializing tilemaker config")?;
    fs::write(&shadow, body).with_context(|| format!("writing {}", shadow.display()))?;
    finalize_atomic(&shadow, path)
}

fn walk_and_prefix(value: &mut serde_json::Value, prefix: &str) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if key == "source" {
                    if let serde_json::Value::String(s) = v {
                        if !s.starts_with(prefix) {
                            *s = format!("{prefix}{s}");
                        }
                        continue;
                    }
                }
                walk_and_prefix(v, prefix);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk_and_prefix(item, prefix);
            }
        }
        _ => {}
    }
}
