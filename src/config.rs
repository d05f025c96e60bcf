//! Configuration Loader (C2, spec §4.2): parse a YAML configuration
//! document, merge defaults and overrides, attach the result as a branch.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::constants::OUTPUT_FORMATS_IMPLYING_GPKG;
use crate::error::{BuildError, BuildResult};
use crate::graph::{Branch, Graph, NewNode};
use crate::identifier::{config_hash, source_table_id};
use crate::node::{CustomProperties, Format, NodeType, Urn};

/// Where a configuration document comes from. `Http` is resolved through
/// the same blocking client the `Fetch` operator uses (spec §4.2.1).
pub enum ConfigSource {
    Local(PathBuf),
    #[cfg(feature = "download")]
    Http(String),
}

impl ConfigSource {
    fn load_text(&self) -> BuildResult<String> {
        match self {
            ConfigSource::Local(path) => fs::read_to_string(path)
                .map_err(|e| BuildError::config(format!("reading {}: {e}", path.display()))),
            #[cfg(feature = "download")]
            ConfigSource::Http(url) => {
                let resp = reqwest::blocking::get(url)
                    .map_err(|e| BuildError::config(format!("GET {url}: {e}")))?
                    .error_for_status()
                    .map_err(|e| BuildError::config(format!("GET {url} returned error: {e}")))?;
                resp.text().map_err(|e| BuildError::config(format!("reading body of {url}: {e}")))
            }
        }
    }
}

pub struct ConfigLoader {
    defaults: Value,
    overrides: Value,
    seen_codes: HashSet<String>,
}

impl ConfigLoader {
    pub fn new(defaults: Value, overrides: Value) -> Self {
        ConfigLoader { defaults, overrides, seen_codes: HashSet::new() }
    }

    pub fn from_defaults_file(path: &Path, overrides: Value) -> BuildResult<Self> {
        let defaults = if path.exists() {
            let text = fs::read_to_string(path)
                .map_err(|e| BuildError::config(format!("reading defaults {}: {e}", path.display())))?;
            parse_yaml(&text)?
        } else {
            Value::Object(Map::new())
        };
        Ok(ConfigLoader::new(defaults, overrides))
    }

    /// Loads `source`, merges it with defaults/overrides, creates a branch
    /// node under `graph.root`, mirrors the whole document into a subtree,
    /// and assigns terminal-node identifiers. Returns the new branch's URN.
    pub fn load_into(&mut self, graph: &mut Graph, source: &ConfigSource) -> BuildResult<Urn> {
        let text = source.load_text()?;
        let doc = parse_yaml(&text)?;

        let code = doc
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| BuildError::config("configuration document is missing required key `code`"))?
            .to_string();

        if !self.seen_codes.insert(code.clone()) {
            return Err(BuildError::config(format!("duplicate branch code `{code}`")));
        }

        let merged = merge_config(&self.defaults, &doc, &self.overrides);
        let hash = config_hash(&merged);

        let branch_urn = graph.create_node(NewNode {
            name: code.clone(),
            title: merged.get("title").and_then(Value::as_str).map(str::to_string),
            node_type: NodeType::Branch,
            custom_properties: CustomProperties {
                branch: Some(code.clone()),
                hash: Some(hash.clone()),
                ckan: merged.get("ckan").and_then(Value::as_str).map(str::to_string),
                osm: merged.get("osm").and_then(Value::as_str).map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        });
        graph.node_mut(branch_urn)?.parent = Some(graph.root);
        graph.node_mut(graph.root)?.children.push(branch_urn);

        let branch = build_branch(branch_urn, &code, &merged, hash);
        graph.branches.insert(branch_urn, branch);

        let prefix = format!("{code}--");
        mirror_document(graph, branch_urn, &prefix, &merged)?;

        Ok(branch_urn)
    }
}

fn parse_yaml(text: &str) -> BuildResult<Value> {
    serde_yaml::from_str(text).map_err(|e| BuildError::config(format!("invalid YAML: {e}")))
}

/// "Overlay defaults (missing scalars in the doc) and overrides (unconditional
/// replacement)": the document's own keys win over defaults, but overrides
/// always win, even over the document.
fn merge_config(defaults: &Value, doc: &Value, overrides: &Value) -> Value {
    let mut merged = match (defaults, doc) {
        (Value::Object(d), Value::Object(b)) => {
            let mut out = d.clone();
            for (k, v) in b {
                out.insert(k.clone(), v.clone());
            }
            Value::Object(out)
        }
        _ => doc.clone(),
    };
    if let (Value::Object(out), Value::Object(over)) = (&mut merged, overrides) {
        for (k, v) in over {
            out.insert(k.clone(), v.clone());
        }
    }
    merged
}

fn build_branch(urn: Urn, code: &str, merged: &Value, hash: String) -> Branch {
    let style = merged
        .get("style")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let clip = merged.get("clip").and_then(Value::as_array).map(|a| {
        a.iter().filter_map(Value::as_str).map(str::to_string).collect()
    });

    let snapgrid = merged.get("snapgrid").and_then(Value::as_f64);

    let buffers = string_map(merged.get("buffers"));
    let distances = string_map(merged.get("distances"));

    let mut output_formats: Vec<String> = merged
        .get("outputformats")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default();
    expand_implied_formats(&mut output_formats);

    let mut math_context = HashMap::new();
    if let Value::Object(map) = merged {
        for (k, v) in map {
            if let Some(n) = v.as_f64() {
                math_context.insert(k.clone(), n);
            }
        }
    }

    Branch {
        urn,
        code: code.to_string(),
        config: merged.clone(),
        hash,
        style,
        clip,
        snapgrid,
        buffers,
        distances,
        math_context,
        output_formats,
    }
}

/// Expands §6.1's output-format implications ("`web` implies `mbtiles`,
/// `qgis|shp|geojson` imply `gpkg`") so the per-dataset export chain (C4
/// pass 12) builds every file the requested top-level formats actually
/// need, without the caller having to spell out the implied ones too.
fn expand_implied_formats(formats: &mut Vec<String>) {
    if formats.iter().any(|f| f == Format::OUT_WEB) && !formats.iter().any(|f| f == Format::OUT_MBTILES) {
        formats.push(Format::OUT_MBTILES.to_string());
    }
    if formats.iter().any(|f| OUTPUT_FORMATS_IMPLYING_GPKG.contains(&f.as_str())) && !formats.iter().any(|f| f == Format::OUT_GPKG) {
        formats.push(Format::OUT_GPKG.to_string());
    }
}

fn string_map(value: Option<&Value>) -> HashMap<String, String> {
    match value.and_then(Value::as_object) {
        Some(map) => map
            .iter()
            .filter_map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((k.clone(), s))
            })
            .collect(),
        None => HashMap::new(),
    }
}

/// Mirrors every key of the merged configuration document as a subtree under
/// `parent` (spec §4.2 step 5): a node per key, recursing through nested
/// mappings/sequences, with scalar leaves holding their value in
/// `custom_properties.value`. Which of these leaves end up as real dataset
/// imports is decided later, by the catalog binder (C3) matching `name`
/// against a package catalog — C2 itself does not distinguish them.
fn mirror_document(graph: &mut Graph, parent: Urn, prefix: &str, value: &Value) -> BuildResult<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                mirror_child(graph, parent, prefix, key, child)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                mirror_child(graph, parent, prefix, &i.to_string(), item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn mirror_child(graph: &mut Graph, parent: Urn, prefix: &str, key: &str, value: &Value) -> BuildResult<()> {
    let urn = graph.create_node(NewNode {
        name: key.to_string(),
        title: Some(key.to_string()),
        node_type: if matches!(value, Value::Object(_) | Value::Array(_)) {
            NodeType::Group
        } else {
            NodeType::Process
        },
        custom_properties: if matches!(value, Value::Object(_) | Value::Array(_)) {
            CustomProperties::default()
        } else {
            CustomProperties { value: Some(value.clone()), ..Default::default() }
        },
        ..Default::default()
    });
    graph.node_mut(urn)?.parent = Some(parent);
    graph.node_mut(parent)?.children.push(urn);

    match value {
        Value::Object(_) | Value::Array(_) => mirror_document(graph, urn, prefix, value)?,
        _ => {
            let output = source_table_id(prefix, key);
            graph.node_mut(urn)?.output = Some(output);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_doc(yaml: &str) -> (Graph, Urn) {
        let mut graph = Graph::new();
        let mut loader = ConfigLoader::new(Value::Object(Map::new()), Value::Object(Map::new()));
        let path = write_temp(yaml);
        let branch = loader.load_into(&mut graph, &ConfigSource::Local(path)).unwrap();
        (graph, branch)
    }

    fn write_temp(yaml: &str) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, yaml).unwrap();
        std::mem::forget(dir);
        path
    }

    #[test]
    fn mirrors_nested_structure_and_assigns_leaf_outputs() {
        let (graph, branch) = graph_with_doc("code: demo\nstructure:\n  x:\n    - a\n");
        let structure = graph.find_node("structure", Some(branch)).unwrap();
        assert_eq!(structure.node_type, NodeType::Group);
        let x = graph.find_node("x", Some(branch)).unwrap();
        assert_eq!(x.node_type, NodeType::Group);
        let a = graph.find_node("a", Some(branch)).unwrap();
        assert_eq!(a.node_type, NodeType::Process);
        assert!(a.output.as_ref().unwrap().starts_with("demo--"));
        assert!(a.is_terminal_node());
    }

    #[test]
    fn scalar_top_level_keys_become_leaf_nodes_with_value() {
        let (graph, branch) = graph_with_doc("code: demo\ntitle: Demo Branch\nstructure: {}\n");
        let title = graph.find_node("title", Some(branch)).unwrap();
        assert_eq!(title.custom_properties.value, Some(Value::from("Demo Branch")));
        assert!(title.output.is_some());
    }

    #[test]
    fn duplicate_code_is_rejected() {
        let mut graph = Graph::new();
        let mut loader = ConfigLoader::new(Value::Object(Map::new()), Value::Object(Map::new()));
        let path1 = write_temp("code: demo\nstructure: {}\n");
        let path2 = write_temp("code: demo\nstructure: {}\n");
        loader.load_into(&mut graph, &ConfigSource::Local(path1)).unwrap();
        let err = loader.load_into(&mut graph, &ConfigSource::Local(path2)).unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
    }

    #[test]
    fn overrides_win_over_document_and_defaults() {
        let mut graph = Graph::new();
        let defaults: Value = serde_json::from_str(r#"{"snapgrid": 10}"#).unwrap();
        let overrides: Value = serde_json::from_str(r#"{"snapgrid": 99}"#).unwrap();
        let mut loader = ConfigLoader::new(defaults, overrides);
        let path = write_temp("code: demo\nstructure: {}\n");
        let branch_urn = loader.load_into(&mut graph, &ConfigSource::Local(path)).unwrap();
        let branch = graph.branches.get(&branch_urn).unwrap();
        assert_eq!(branch.snapgrid, Some(99.0));
    }

    #[test]
    fn config_hash_is_stable_for_key_reordering() {
        let (g1, b1) = graph_with_doc("code: demo\ntitle: Demo\nstructure: {}\n");
        let (g2, b2) = graph_with_doc("title: Demo\ncode: demo\nstructure: {}\n");
        assert_eq!(
            g1.branches.get(&b1).unwrap().hash,
            g2.branches.get(&b2).unwrap().hash
        );
    }

    #[test]
    fn web_output_format_implies_mbtiles() {
        let (graph, branch) = graph_with_doc("code: demo\nstructure: {}\noutputformats: [web]\n");
        let formats = &graph.branches.get(&branch).unwrap().output_formats;
        assert!(formats.iter().any(|f| f == "web"));
        assert!(formats.iter().any(|f| f == "mbtiles"));
    }

    #[test]
    fn qgis_shp_geojson_output_formats_imply_gpkg() {
        let (graph, branch) = graph_with_doc("code: demo\nstructure: {}\noutputformats: [qgis, shp, geojson]\n");
        let formats = &graph.branches.get(&branch).unwrap().output_formats;
        assert!(formats.iter().any(|f| f == "gpkg"));
    }

    #[test]
    fn gpkg_output_format_is_not_duplicated_when_already_present() {
        let (graph, branch) = graph_with_doc("code: demo\nstructure: {}\noutputformats: [gpkg, shp]\n");
        let formats = &graph.branches.get(&branch).unwrap().output_formats;
        assert_eq!(formats.iter().filter(|f| f.as_str() == "gpkg").count(), 1);
    }
}
