//! Unzip operator (`Action::Unzip`, spec §4.7), grounded in
//! `src/common/fs.rs::extract_zip` — open with the `zip` crate, extract
//! into a working directory, then move the single output (or all
//! shapefile-family siblings) up to the node's declared output path.

use std::fs;
use std::path::Path;

use anyhow::Context;
use zip::ZipArchive;

use crate::error::BuildResult;
use crate::fs_util::{ensure_parent_dir, remove_dir_if_exists};

/// Extracts `zip_path` into a scratch directory beside `dest`, then moves
/// the extracted member matching `dest`'s extension into place. Source
/// data ships as a single-layer archive (spec §4.2's `GPKG`/`GeoJSON`
/// sources downloaded as `.zip`); multi-member archives are handled by
/// `run_shapefile`, below, which keeps every sibling file.
pub fn run(zip_path: &Path, dest: &Path, overwrite: bool) -> BuildResult<bool> {
    if dest.exists() && !overwrite {
        return Ok(false);
    }
    let work_dir = dest.with_extension("unzip-work");
    remove_dir_if_exists(&work_dir)?;
    fs::create_dir_all(&work_dir).with_context(|| format!("creating {}", work_dir.display()))?;

    let file = fs::File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file).with_context(|| format!("reading zip archive {}", zip_path.display()))?;
    archive.extract(&work_dir).with_context(|| format!("extracting {}", zip_path.display()))?;

    let wanted_ext = dest.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    let member = find_member(&work_dir, wanted_ext.as_deref())?
        .ok_or_else(|| crate::error::BuildError::data(format!("{}: no matching member after extraction", zip_path.display())))?;

    ensure_parent_dir(dest)?;
    fs::rename(&member, dest).with_context(|| format!("moving {} to {}", member.display(), dest.display()))?;
    remove_dir_if_exists(&work_dir)?;
    Ok(true)
}

/// Extracts a zipped shapefile bundle, keeping every `.shp`/`.shx`/`.dbf`/
/// `.prj`/`.cpg` sibling alongside `dest` rather than a single file —
/// `importer.py`'s shapefile path reads the whole sibling set.
pub fn run_shapefile(zip_path: &Path, dest_dir: &Path, overwrite: bool) -> BuildResult<bool> {
    if dest_dir.exists() && !overwrite {
        return Ok(false);
    }
    remove_dir_if_exists(dest_dir)?;
    fs::create_dir_all(dest_dir).with_context(|| format!("creating {}", dest_dir.display()))?;

    let file = fs::File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file).with_context(|| format!("reading zip archive {}", zip_path.display()))?;
    archive.extract(dest_dir).with_context(|| format!("extracting {}", zip_path.display()))?;
    Ok(true)
}

fn find_member(dir: &Path, wanted_ext: Option<&str>) -> BuildResult<Option<std::path::PathBuf>> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_member(&path, wanted_ext)? {
                return Ok(Some(found));
            }
            continue;
        }
        match wanted_ext {
            Some(ext) if path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() == Some(ext) => {
                return Ok(Some(path));
            }
            None => return Ok(Some(path)),
            _ => {}
        }
    }
    Ok(None)
}
