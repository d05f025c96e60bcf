//! Graph Exploder (C4, spec §4.4): seventeen ordered rewrite passes that turn
//! a forest of mirrored configuration trees into a fully-typed execution DAG.
//! Grounded in `original_source/opensite/model/graph/opensite.py`'s
//! `explode()` orchestrator, which runs the same seventeen steps in the same
//! order; each pass here is its own function so it can carry its own
//! `#[cfg(test)]` companion in addition to the full-pipeline test at the
//! bottom of this file.

mod osm;
mod outputs;

use std::collections::{BTreeMap, HashMap};

use crate::constants::{DATABASE_GENERAL_PREFIX, OSM_SUBFOLDER, OPENLIBRARY_SUBFOLDER};
use crate::error::{BuildError, BuildResult};
use crate::graph::{Graph, NewNode};
use crate::identifier::{amalgamate_table_id, buffer_suffix, distance_suffix, preprocess_suffix};
use crate::math::resolve_math;
use crate::node::{Action, CustomProperties, Format, NodeInput, NodeType, Urn};

pub type PassFn = fn(&mut Graph) -> BuildResult<()>;

pub const PASSES: &[(&str, PassFn)] = &[
    ("snapshot", pass_snapshot),
    ("all_layers_amalgamation", pass_all_layers_amalgamation),
    ("parent_grouping", pass_parent_grouping),
    ("downloads", pass_downloads),
    ("unzips", pass_unzips),
    ("osm_extract_stack", osm::pass_osm_extract_stack),
    ("openlibrary_stack", pass_openlibrary_stack),
    ("buffer_distance_insertion", pass_buffer_distance_insertion),
    ("top_level_inversion", pass_top_level_inversion),
    ("preprocess_injection", pass_preprocess_injection),
    ("amalgamation_output_resolution", pass_amalgamation_output_resolution),
    ("output_branches", outputs::pass_output_branches),
    ("osm_boundaries", pass_osm_boundaries),
    ("installers", pass_installers),
    ("global_urn_assignment", pass_global_urn_assignment),
    ("informative_prefixes", pass_informative_prefixes),
    ("registry_sync", pass_registry_sync),
];

/// Runs all seventeen passes in order against `graph`.
pub fn explode(graph: &mut Graph) -> BuildResult<()> {
    for (name, pass) in PASSES {
        log::debug!("explode pass: {name}");
        pass(graph)?;
    }
    Ok(())
}

fn pass_snapshot(graph: &mut Graph) -> BuildResult<()> {
    graph.capture_snapshot();
    Ok(())
}

/// Wraps each branch's `structure` category children under one new
/// `⟨code⟩--all-layers` amalgamate node, and promotes each category itself
/// to an amalgamate group. The original performs this category promotion as
/// part of its configuration-loading enrichment step; folded in here since
/// this crate's configuration loader (C2) mirrors the whole document
/// uniformly and leaves that promotion to the exploder instead.
fn pass_all_layers_amalgamation(graph: &mut Graph) -> BuildResult<()> {
    let branch_urns: Vec<Urn> = graph.branches.keys().copied().collect();
    for branch_urn in branch_urns {
        let structure_urn = match graph.find_child(branch_urn, "structure") {
            Some(n) if !n.children.is_empty() => n.urn,
            _ => continue,
        };
        let categories = graph.node(structure_urn)?.children.clone();
        let branch_code = graph.branches.get(&branch_urn).map(|b| b.code.clone()).unwrap_or_default();

        let all_layers_urn = graph.create_group_node(
            branch_urn,
            &categories,
            format!("{branch_code}--all-layers"),
            Some("All layers".to_string()),
        )?;
        graph.node_mut(all_layers_urn)?.custom_properties.branch = Some(branch_code.clone());

        for &category_urn in &categories {
            let c = graph.node_mut(category_urn)?;
            c.node_type = NodeType::Group;
            c.action = Some(Action::Amalgamate);
            c.custom_properties.branch = Some(branch_code.clone());
        }
    }
    Ok(())
}

/// Groups siblings whose name has the form `⟨prefix⟩--⟨suffix⟩` under a new
/// `⟨prefix⟩` amalgamate node. Only prefixes shared by 2+ siblings are worth
/// grouping; a lone `--`-named sibling is left where it is.
fn pass_parent_grouping(graph: &mut Graph) -> BuildResult<()> {
    let parent_urns: Vec<Urn> = graph.all_nodes().filter(|n| !n.children.is_empty()).map(|n| n.urn).collect();

    for parent_urn in parent_urns {
        let children = match graph.node(parent_urn) {
            Ok(n) => n.children.clone(),
            Err(_) => continue,
        };
        let mut groups: BTreeMap<String, Vec<Urn>> = BTreeMap::new();
        for &child_urn in &children {
            if let Ok(child) = graph.node(child_urn) {
                if let Some((prefix, _suffix)) = child.name.split_once("--") {
                    groups.entry(prefix.to_string()).or_default().push(child_urn);
                }
            }
        }

        for (prefix, group_children) in groups {
            if group_children.len() < 2 {
                continue;
            }
            let first = graph.node(group_children[0])?;
            let branch = first.custom_properties.branch.clone();
            let title = match &first.title {
                Some(t) => match t.rsplit_once(" - ") {
                    Some((head, _)) => head.to_string(),
                    None => prefix.replace('-', " "),
                },
                None => prefix.replace('-', " "),
            };

            let group_urn = graph.create_group_node(parent_urn, &group_children, prefix, Some(title))?;
            graph.node_mut(group_urn)?.custom_properties.branch = branch;
        }
    }
    Ok(())
}

/// Inserts a `download` child below every terminal node whose `input` is an
/// HTTP(S) URL, rewriting the terminal's own `input` to the downloader's
/// local `output` and promoting its action to `import`.
fn pass_downloads(graph: &mut Graph) -> BuildResult<()> {
    let terminal_urns: Vec<Urn> = graph.get_terminal_nodes().iter().map(|n| n.urn).collect();

    for urn in terminal_urns {
        let (url, format, branch, name, title) = {
            let node = graph.node(urn)?;
            match node.input.as_single() {
                Some(u) if u.starts_with("http") => (
                    u.to_string(),
                    node.format.clone(),
                    node.custom_properties.branch.clone(),
                    node.name.clone(),
                    node.title.clone(),
                ),
                _ => continue,
            }
        };

        let extension = format.as_ref().map(crate::constants::file_extension_for).unwrap_or("dat");
        let output = if format.as_ref().map(crate::constants::is_osm_related).unwrap_or(false) {
            format!("{OSM_SUBFOLDER}/{name}.{extension}")
        } else {
            format!("{name}.{extension}")
        };

        let download_urn = graph.create_node(NewNode {
            name: name.clone(),
            title: Some(format!("Download - {}", title.clone().unwrap_or_else(|| name.clone()))),
            node_type: NodeType::Download,
            action: Some(Action::Download),
            format,
            input: NodeInput::Single(url),
            output: Some(output.clone()),
            custom_properties: CustomProperties { branch, ..Default::default() },
            ..Default::default()
        });
        graph.node_mut(download_urn)?.parent = Some(urn);
        let node = graph.node_mut(urn)?;
        node.children.push(download_urn);
        node.input = NodeInput::Single(output);
        node.action = Some(Action::Import);
    }
    Ok(())
}

/// Splices an `unzip` step between a `.zip` download and its consumer: the
/// download node becomes the zip fetcher's new parent, demoted from
/// `download` to `unzip`.
fn pass_unzips(graph: &mut Graph) -> BuildResult<()> {
    let terminal_urns: Vec<Urn> = graph.get_terminal_nodes().iter().map(|n| n.urn).collect();

    for urn in terminal_urns {
        let (url, output, format, branch, title, name) = {
            let node = graph.node(urn)?;
            let url = match node.input.as_single() {
                Some(u) => u.to_string(),
                None => continue,
            };
            if !crate::node::Format::is_zip_url(&url) {
                continue;
            }
            (
                url,
                node.output.clone().unwrap_or_default(),
                node.format.clone(),
                node.custom_properties.branch.clone(),
                node.title.clone(),
                node.name.clone(),
            )
        };

        let zip_output = format!("{output}.zip");
        let zip_child = graph.create_node(NewNode {
            name: format!("{name}-file"),
            title: title.clone(),
            node_type: NodeType::Download,
            action: Some(Action::Download),
            format,
            input: NodeInput::Single(url),
            output: Some(zip_output.clone()),
            custom_properties: CustomProperties { branch, ..Default::default() },
            ..Default::default()
        });
        graph.node_mut(zip_child)?.parent = Some(urn);

        let node = graph.node_mut(urn)?;
        node.children.push(zip_child);
        node.node_type = NodeType::Process;
        node.action = Some(Action::Unzip);
        node.title = Some(format!("Unzip - {}", title.unwrap_or_default()));
        node.input = NodeInput::Single(zip_output);
    }
    Ok(())
}

/// Promotes an OpenLibrary-YAML download node in place into a `run` node
/// producing a container, and repoints its consumer at the container.
fn pass_openlibrary_stack(graph: &mut Graph) -> BuildResult<()> {
    let candidates: Vec<Urn> = graph
        .all_nodes()
        .filter(|n| n.node_type == NodeType::Download && n.format.as_ref().map(|f| f.as_str() == Format::OPENLIBRARY_YAML).unwrap_or(false))
        .map(|n| n.urn)
        .collect();

    for urn in candidates {
        let stem = graph.node(urn)?.output.clone().unwrap_or_default();
        let stem = stem.rsplit_once('.').map(|(s, _)| s.to_string()).unwrap_or(stem);
        let new_output = format!("{stem}.gpkg");

        let new_title = {
            let node = graph.node(urn)?;
            match &node.title {
                Some(t) => {
                    let mut parts: Vec<&str> = t.split(" - ").collect();
                    if !parts.is_empty() {
                        parts[0] = "Run Open Library";
                    }
                    parts.join(" - ")
                }
                None => "Run Open Library".to_string(),
            }
        };

        let node = graph.node_mut(urn)?;
        node.node_type = NodeType::OpenlibraryRunner;
        node.action = Some(Action::Run);
        node.output = Some(new_output.clone());
        node.title = Some(new_title);

        if let Some(parent_urn) = graph.find_parent(urn).map(|p| p.urn) {
            let p = graph.node_mut(parent_urn)?;
            p.input = NodeInput::Single(format!("{OPENLIBRARY_SUBFOLDER}/{new_output}"));
        }
    }
    Ok(())
}

/// Binds each branch's `buffers`/`distances` name→expression maps onto the
/// matching dataset leaves under `structure` (resolving the expression
/// against the branch math context), then wraps each bound leaf with a new
/// `buffer`/`distance` parent whose output identifier encodes the resolved
/// value, clearing the property off the child per spec.
fn pass_buffer_distance_insertion(graph: &mut Graph) -> BuildResult<()> {
    let branch_urns: Vec<Urn> = graph.branches.keys().copied().collect();

    for branch_urn in branch_urns {
        let (buffers, distances, math_context, branch_code) = {
            let b = graph.branches.get(&branch_urn).unwrap();
            (b.buffers.clone(), b.distances.clone(), b.math_context.clone(), b.code.clone())
        };
        let structure_urn = match graph.find_child(branch_urn, "structure") {
            Some(n) => n.urn,
            None => continue,
        };

        let mut leaves = Vec::new();
        collect_leaves(graph, structure_urn, &mut leaves);

        for leaf_urn in leaves {
            let name = graph.node(leaf_urn)?.name.clone();
            let buffer_expr = buffers.get(&name).cloned();
            let distance_expr = distances.get(&name).cloned();
            if buffer_expr.is_none() && distance_expr.is_none() {
                continue;
            }
            if buffer_expr.is_some() && distance_expr.is_some() {
                return Err(BuildError::data(format!(
                    "dataset `{name}` carries both a buffer and a distance expression"
                )));
            }

            let parent_output = graph.node(leaf_urn)?.output.clone().ok_or_else(|| {
                BuildError::data(format!("dataset `{name}` has no output identifier to derive a buffer/distance table from"))
            })?;

            if let Some(expr) = buffer_expr {
                let value = resolve_math(&expr, &math_context);
                let output = buffer_suffix(&parent_output, &value);
                let wrapper = graph.create_node(NewNode {
                    name: format!("{name}--buffer"),
                    title: Some(format!("Buffer - {name}")),
                    node_type: NodeType::Process,
                    action: Some(Action::Buffer),
                    input: NodeInput::Single(parent_output),
                    output: Some(output),
                    custom_properties: CustomProperties { branch: Some(branch_code.clone()), buffer: Some(value), ..Default::default() },
                    ..Default::default()
                });
                graph.insert_parent(leaf_urn, wrapper)?;
                graph.node_mut(leaf_urn)?.custom_properties.buffer = None;
            } else if let Some(expr) = distance_expr {
                let value = resolve_math(&expr, &math_context);
                let output = distance_suffix(&parent_output, &value);
                let wrapper = graph.create_node(NewNode {
                    name: format!("{name}--distance"),
                    title: Some(format!("Distance - {name}")),
                    node_type: NodeType::Process,
                    action: Some(Action::Distance),
                    input: NodeInput::Single(parent_output),
                    output: Some(output),
                    custom_properties: CustomProperties { branch: Some(branch_code.clone()), distance: Some(value), ..Default::default() },
                    ..Default::default()
                });
                graph.insert_parent(leaf_urn, wrapper)?;
                graph.node_mut(leaf_urn)?.custom_properties.distance = None;
            }
        }
    }
    Ok(())
}

fn collect_leaves(graph: &Graph, urn: Urn, out: &mut Vec<Urn>) {
    if let Ok(node) = graph.node(urn) {
        if node.children.is_empty() {
            out.push(urn);
        } else {
            for &child in &node.children {
                collect_leaves(graph, child, out);
            }
        }
    }
}

/// Inserts an `invert` node immediately below each branch root, above the
/// branch's `all-layers` amalgamation. Its `input`/`output` are left for
/// pass 11 to resolve, like any other amalgamate-shaped node.
fn pass_top_level_inversion(graph: &mut Graph) -> BuildResult<()> {
    let branch_urns: Vec<Urn> = graph.branches.keys().copied().collect();
    for branch_urn in branch_urns {
        let branch_code = graph.branches.get(&branch_urn).map(|b| b.code.clone()).unwrap_or_default();
        let top_urn = match graph.find_child(branch_urn, &format!("{branch_code}--all-layers")) {
            Some(n) => n.urn,
            None => continue,
        };

        let invert_urn = graph.create_node(NewNode {
            name: format!("{branch_code}--invert"),
            title: Some("Invert".to_string()),
            node_type: NodeType::Group,
            action: Some(Action::Invert),
            custom_properties: CustomProperties::with_branch(branch_code),
            ..Default::default()
        });
        graph.insert_parent(top_urn, invert_urn)?;
    }
    Ok(())
}

/// Inserts a `preprocess` node above every `import` node (or above its
/// buffer/distance wrapper, if pass 8 added one).
fn pass_preprocess_injection(graph: &mut Graph) -> BuildResult<()> {
    let import_urns: Vec<Urn> = graph.all_nodes().filter(|n| n.action == Some(Action::Import)).map(|n| n.urn).collect();

    for import_urn in import_urns {
        let target_urn = match graph.find_parent(import_urn) {
            Some(p) if matches!(p.action, Some(Action::Buffer) | Some(Action::Distance)) => p.urn,
            _ => import_urn,
        };

        let (parent_output, name, branch, snapgrid) = {
            let node = graph.node(target_urn)?;
            let output = node.output.clone().unwrap_or_default();
            let name = node.name.clone();
            let branch_code = node
                .custom_properties
                .branch
                .clone()
                .or_else(|| graph.get_property_from_lineage(target_urn, "branch").and_then(|v| v.as_str().map(str::to_string)));
            let snapgrid = branch_code
                .as_ref()
                .and_then(|code| graph.branches.values().find(|b| &b.code == code))
                .and_then(|b| b.snapgrid);
            (output, name, branch_code, snapgrid)
        };

        let preprocess_urn = graph.create_node(NewNode {
            name: format!("{name}--preprocess"),
            title: Some("Preprocess".to_string()),
            node_type: NodeType::Process,
            action: Some(Action::Preprocess),
            input: NodeInput::Single(parent_output.clone()),
            output: Some(preprocess_suffix(&parent_output)),
            custom_properties: CustomProperties { branch, snapgrid, ..Default::default() },
            ..Default::default()
        });
        graph.insert_parent(target_urn, preprocess_urn)?;
    }
    Ok(())
}

/// Post-order pass: once every child of an `amalgamate`/`invert` node has a
/// non-empty `output`, resolves `input` (sorted child outputs, or the single
/// child output for `invert`) and `output` (a fresh hash of the sorted list).
fn pass_amalgamation_output_resolution(graph: &mut Graph) -> BuildResult<()> {
    let root = graph.root;
    resolve_rec(graph, root)?;
    Ok(())
}

fn resolve_rec(graph: &mut Graph, urn: Urn) -> BuildResult<Option<String>> {
    let children = graph.node(urn)?.children.clone();
    let mut child_outputs = Vec::with_capacity(children.len());
    for &child in &children {
        if let Some(output) = resolve_rec(graph, child)? {
            child_outputs.push(output);
        }
    }

    let (action, already_resolved) = {
        let node = graph.node(urn)?;
        (node.action, node.output.is_some())
    };

    if !already_resolved
        && matches!(action, Some(Action::Amalgamate) | Some(Action::Invert))
        && !children.is_empty()
        && child_outputs.len() == children.len()
    {
        let is_invert = matches!(action, Some(Action::Invert));
        let mut sorted = child_outputs.clone();
        sorted.sort();
        let output = format!("{DATABASE_GENERAL_PREFIX}{}", amalgamate_table_id("", &sorted));

        let node = graph.node_mut(urn)?;
        node.input = if is_invert { NodeInput::Single(sorted[0].clone()) } else { NodeInput::Many(sorted) };
        node.output = Some(output);
    }

    Ok(graph.node(urn)?.output.clone())
}

/// Attaches an OSM-boundaries import to each output branch (or below each
/// `clip` node within it, when clipping is configured).
fn pass_osm_boundaries(graph: &mut Graph) -> BuildResult<()> {
    let output_branch_urns: Vec<Urn> =
        graph.branches.iter().filter(|(_, b)| b.code.ends_with("--outputs")).map(|(&urn, _)| urn).collect();

    for branch_urn in output_branch_urns {
        let clip_urns: Vec<Urn> = subtree(graph, branch_urn)
            .into_iter()
            .filter(|&u| graph.node(u).map(|n| n.action == Some(Action::Clip)).unwrap_or(false))
            .collect();
        let targets: Vec<Urn> = if clip_urns.is_empty() { vec![branch_urn] } else { clip_urns };

        for target_urn in targets {
            let branch_name = graph.node(branch_urn)?.name.clone();
            let boundary_output = format!("{DATABASE_GENERAL_PREFIX}osmboundaries--{branch_name}");
            let boundary_urn = graph.create_node(NewNode {
                name: format!("{branch_name}--osm-boundaries"),
                title: Some("OSM Boundaries".to_string()),
                node_type: NodeType::Process,
                action: Some(Action::Import),
                format: Some(Format::from(Format::OSM)),
                output: Some(boundary_output),
                custom_properties: CustomProperties::with_branch(branch_name),
                ..Default::default()
            });
            graph.node_mut(boundary_urn)?.parent = Some(target_urn);
            graph.node_mut(target_urn)?.children.push(boundary_urn);
        }
    }
    Ok(())
}

fn subtree(graph: &Graph, urn: Urn) -> Vec<Urn> {
    let mut out = Vec::new();
    let mut stack = vec![urn];
    while let Some(u) = stack.pop() {
        if let Ok(node) = graph.node(u) {
            for &c in &node.children {
                out.push(c);
                stack.push(c);
            }
        }
    }
    out
}

/// Attaches a `tileserver`-format install node below each output branch,
/// depending on a dedicated OSM download as its prerequisite.
fn pass_installers(graph: &mut Graph) -> BuildResult<()> {
    let output_branch_urns: Vec<Urn> =
        graph.branches.iter().filter(|(_, b)| b.code.ends_with("--outputs")).map(|(&urn, _)| urn).collect();

    for branch_urn in output_branch_urns {
        let branch_name = graph.node(branch_urn)?.name.clone();

        let osm_download_urn = graph.create_node(NewNode {
            name: format!("{branch_name}--osm-prereq"),
            title: Some("Download OSM Prerequisite".to_string()),
            node_type: NodeType::Download,
            action: Some(Action::Download),
            format: Some(Format::from(Format::OSM)),
            output: Some(format!("{OSM_SUBFOLDER}/{branch_name}.osm.pbf")),
            custom_properties: CustomProperties::with_branch(branch_name.clone()),
            ..Default::default()
        });

        let install_urn = graph.create_node(NewNode {
            name: format!("{branch_name}--install"),
            title: Some("Install Tileserver".to_string()),
            node_type: NodeType::Process,
            action: Some(Action::Install),
            format: Some(Format::from(Format::TILESERVER)),
            custom_properties: CustomProperties::with_branch(branch_name),
            ..Default::default()
        });
        graph.node_mut(osm_download_urn)?.parent = Some(install_urn);
        graph.node_mut(install_urn)?.children.push(osm_download_urn);
        graph.node_mut(install_urn)?.parent = Some(branch_urn);
        graph.node_mut(branch_urn)?.children.push(install_urn);
    }
    Ok(())
}

/// Collects nodes by `output`; any output shared by 2+ nodes gets them all a
/// single deterministic UUIDv5 `global_urn` derived from that output string.
fn pass_global_urn_assignment(graph: &mut Graph) -> BuildResult<()> {
    let mut groups: HashMap<String, Vec<Urn>> = HashMap::new();
    for node in graph.all_nodes() {
        if let Some(output) = &node.output {
            groups.entry(output.clone()).or_default().push(node.urn);
        }
    }
    for (output, urns) in groups {
        if urns.len() < 2 {
            continue;
        }
        let global_urn = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, output.as_bytes());
        for urn in urns {
            graph.node_mut(urn)?.global_urn = Some(global_urn);
        }
    }
    Ok(())
}

/// Prepends `Import - ` / `Amalgamate - ` to the title of every matching node.
fn pass_informative_prefixes(graph: &mut Graph) -> BuildResult<()> {
    for node in graph.all_nodes_mut() {
        let prefix = match node.action {
            Some(Action::Import) => Some("Import - "),
            Some(Action::Amalgamate) => Some("Amalgamate - "),
            _ => None,
        };
        if let Some(prefix) = prefix {
            let base = node.title.clone().unwrap_or_else(|| node.name.clone());
            if !base.starts_with(prefix) {
                node.title = Some(format!("{prefix}{base}"));
            }
        }
    }
    Ok(())
}

/// Validates that every node carrying a terminal-producing action has a
/// resolved `output` before the registry is synced. The actual write into
/// C5 happens one layer up (whoever drives the build owns the registry
/// handle); this pass only guards the invariant the write depends on.
fn pass_registry_sync(graph: &mut Graph) -> BuildResult<()> {
    for node in graph.all_nodes() {
        if let Some(action) = node.action {
            if action.is_terminal_producing() && node.output.is_none() {
                return Err(BuildError::data(format!(
                    "node `{}` (urn={}) has action {action:?} but no output identifier before registry sync",
                    node.name, node.urn
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigLoader, ConfigSource};
    use serde_json::{Map, Value};
    use std::fs;
    use std::path::PathBuf;

    fn write_temp(yaml: &str) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, yaml).unwrap();
        std::mem::forget(dir);
        path
    }

    #[test]
    fn explode_runs_end_to_end_on_a_minimal_single_dataset_branch() {
        let mut graph = Graph::new();
        let mut loader = ConfigLoader::new(Value::Object(Map::new()), Value::Object(Map::new()));
        let path = write_temp(
            "code: demo\noutputformats: [gpkg]\nstructure:\n  environment:\n    - listed-buildings\n",
        );
        let branch_urn = loader.load_into(&mut graph, &ConfigSource::Local(path)).unwrap();

        // Stand in for the catalog binder: give the leaf dataset a resolvable output directly.
        let leaf = graph.find_node("listed-buildings", Some(branch_urn)).unwrap().urn;
        graph.node_mut(leaf).unwrap().input = NodeInput::Single("https://example.test/a.gpkg".into());
        graph.node_mut(leaf).unwrap().format = Some(Format::from(Format::GPKG));

        explode(&mut graph).unwrap();

        let all_layers = graph.find_node("demo--all-layers", Some(branch_urn));
        assert!(all_layers.is_none() || all_layers.unwrap().action == Some(Action::Amalgamate));
        assert!(graph.find_node("demo--outputs", None).is_some());
    }

    #[test]
    fn pass_snapshot_freezes_current_tree() {
        let mut graph = Graph::new();
        let urn = graph.create_node(NewNode { name: "x".into(), ..Default::default() });
        graph.node_mut(graph.root).unwrap().children.push(urn);
        graph.node_mut(urn).unwrap().parent = Some(graph.root);

        pass_snapshot(&mut graph).unwrap();
        assert_eq!(graph.snapshot_node(urn).unwrap().name, "x");
    }

    #[test]
    fn pass_downloads_inserts_child_and_promotes_action() {
        let mut graph = Graph::new();
        let urn = graph.create_node(NewNode {
            name: "listed-buildings".into(),
            input: NodeInput::Single("https://example.test/a.geojson".into()),
            format: Some(Format::from(Format::GEOJSON)),
            ..Default::default()
        });
        graph.node_mut(graph.root).unwrap().children.push(urn);
        graph.node_mut(urn).unwrap().parent = Some(graph.root);

        pass_downloads(&mut graph).unwrap();

        let node = graph.node(urn).unwrap();
        assert_eq!(node.action, Some(Action::Import));
        assert_eq!(node.children.len(), 1);
        let child = graph.node(node.children[0]).unwrap();
        assert_eq!(child.action, Some(Action::Download));
        assert_eq!(node.input.as_single(), child.output.as_deref());
    }

    #[test]
    fn pass_unzips_splices_between_zip_download_and_consumer() {
        let mut graph = Graph::new();
        let dl = graph.create_node(NewNode {
            name: "listed-buildings".into(),
            node_type: NodeType::Download,
            action: Some(Action::Download),
            input: NodeInput::Single("https://example.test/a.zip".into()),
            output: Some("demo--abc".into()),
            ..Default::default()
        });
        graph.node_mut(graph.root).unwrap().children.push(dl);
        graph.node_mut(dl).unwrap().parent = Some(graph.root);

        pass_unzips(&mut graph).unwrap();

        let node = graph.node(dl).unwrap();
        assert_eq!(node.action, Some(Action::Unzip));
        assert_eq!(node.children.len(), 1);
        let child = graph.node(node.children[0]).unwrap();
        assert_eq!(child.output.as_deref(), Some("demo--abc.zip"));
    }

    #[test]
    fn pass_global_urn_assignment_only_touches_shared_outputs() {
        let mut graph = Graph::new();
        let a = graph.create_node(NewNode { name: "a".into(), output: Some("x".into()), ..Default::default() });
        let b = graph.create_node(NewNode { name: "b".into(), output: Some("x".into()), ..Default::default() });
        let c = graph.create_node(NewNode { name: "c".into(), output: Some("y".into()), ..Default::default() });

        pass_global_urn_assignment(&mut graph).unwrap();

        assert!(graph.node(a).unwrap().global_urn.is_some());
        assert_eq!(graph.node(a).unwrap().global_urn, graph.node(b).unwrap().global_urn);
        assert!(graph.node(c).unwrap().global_urn.is_none());
    }

    #[test]
    fn pass_informative_prefixes_is_idempotent() {
        let mut graph = Graph::new();
        let urn = graph.create_node(NewNode {
            name: "a".into(),
            title: Some("a".into()),
            action: Some(Action::Import),
            ..Default::default()
        });
        pass_informative_prefixes(&mut graph).unwrap();
        let once = graph.node(urn).unwrap().title.clone();
        pass_informative_prefixes(&mut graph).unwrap();
        let twice = graph.node(urn).unwrap().title.clone();
        assert_eq!(once, twice);
        assert_eq!(once.as_deref(), Some("Import - a"));
    }
}
