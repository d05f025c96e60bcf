//! Concatenate operator (`Action::Concatenate`, spec §4.7), grounded in
//! `processing/concatenate.py`: several same-format source files (one per
//! OSM/Open Library download tile) merged into a single file before import.
//! Text formats (`.osm`, `.geojson`) are concatenated by reading each input
//! and appending its feature members; `.yml`/`.yaml` inputs (the per-tile
//! extract manifests an OSM concatenator node merges, spec §4.4 pass 6) are
//! merged as plain mappings, later inputs overriding earlier ones' keys;
//! everything else is handed to `ogr2ogr`'s multi-input merge (`-append`),
//! matching the original's fallback path for formats it doesn't special-case.

use std::path::Path;
use std::process::Command;

use anyhow::Context;

use crate::error::BuildResult;
use crate::fs_util::{finalize_atomic, run_external, shadow_path};

/// Concatenates `inputs` into `dest`. `.geojson` inputs are merged by
/// unioning their `features` arrays (spec §4.2's OSM extracts ship as
/// per-tile GeoJSON); anything else goes through `ogr2ogr -append`.
pub fn run(inputs: &[String], dest: &Path, overwrite: bool) -> BuildResult<bool> {
    if dest.exists() && !overwrite {
        return Ok(false);
    }
    if inputs.is_empty() {
        return Err(crate::error::BuildError::data("concatenate: no inputs"));
    }

    let shadow = shadow_path(dest);
    crate::fs_util::ensure_parent_dir(dest)?;

    match dest.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("geojson") => concatenate_geojson(inputs, &shadow)?,
        Some(ext) if ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml") => concatenate_yaml(inputs, &shadow)?,
        _ => concatenate_via_ogr(inputs, &shadow)?,
    }

    finalize_atomic(&shadow, dest)?;
    Ok(true)
}

fn concatenate_geojson(inputs: &[String], shadow: &Path) -> BuildResult<()> {
    let mut merged = serde_json::Map::new();
    merged.insert("type".to_string(), serde_json::Value::String("FeatureCollection".to_string()));
    let mut features = Vec::new();

    for input in inputs {
        let text = std::fs::read_to_string(input).with_context(|| format!("reading {input}"))?;
        let doc: serde_json::Value = serde_json::from_str(&text).with_context(|| format!("parsing {input} as GeoJSON"))?;
        if let Some(arr) = doc.get("features").and_then(|v| v.as_array()) {
            features.extend(arr.iter().cloned());
        }
    }
    merged.insert("features".to_string(), serde_json::Value::Array(features));

    let body = serde_json::to_string(&serde_json::Value::Object(merged)).with_context(|| "serializing concatenated GeoJSON")?;
    std::fs::write(shadow, body).with_context(|| format!("writing {}", shadow.display()))?;
    Ok(())
}

/// Merges each input YAML document at the top level, later inputs
/// overriding earlier ones' keys, and writes the result back as YAML.
fn concatenate_yaml(inputs: &[String], shadow: &Path) -> BuildResult<()> {
    let mut merged = serde_yaml::Mapping::new();

    for input in inputs {
        let text = std::fs::read_to_string(input).with_context(|| format!("reading {input}"))?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {input} as YAML"))?;
        let Some(mapping) = doc.as_mapping() else {
            return Err(crate::error::BuildError::data(format!("{input}: expected a YAML mapping at the top level")));
        };
        for (key, value) in mapping {
            merged.insert(key.clone(), value.clone());
        }
    }

    let body = serde_yaml::to_string(&serde_yaml::Value::Mapping(merged)).with_context(|| "serializing concatenated YAML")?;
    std::fs::write(shadow, body).with_context(|| format!("writing {}", shadow.display()))?;
    Ok(())
}

fn concatenate_via_ogr(inputs: &[String], shadow: &Path) -> BuildResult<()> {
    let (first, rest) = inputs.split_first().expect("checked non-empty above");
    let mut cmd = Command::new("ogr2ogr");
    cmd.arg(shadow).arg(first);
    run_external(cmd, "ogr2ogr")?;

    for input in rest {
        let mut cmd = Command::new("ogr2ogr");
        cmd.args(["-append", "-update"]).arg(shadow).arg(input);
        run_external(cmd, "ogr2ogr")?;
    }
    Ok(())
}
