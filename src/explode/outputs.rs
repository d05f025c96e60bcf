//! Pass 12, output branches (spec §4.4 item 12), grounded in
//! `original_source/opensite/model/graph/opensite.py`'s `add_outputs`: for
//! each data branch, build an isolated `⟨code⟩--outputs` sibling branch
//! holding a `postprocess → (clip?) → export*` chain per amalgamation/invert
//! node, collected under a per-dataset collector and finally wrapped by the
//! branch's global output formats: `json` whenever `web` or `qgis` is
//! requested (both "require json data file", `opensite.py:1263-1270`),
//! plus `web`/`qgis` themselves. Always runs, even for a branch with no
//! data children — it still needs the (possibly empty) global chain.

use std::collections::HashMap;

use serde_json::Value;

use crate::constants::{DATABASE_GENERAL_PREFIX, GLOBAL_OUTPUT_FORMATS};
use crate::error::BuildResult;
use crate::graph::{Branch, Graph, NewNode};
use crate::identifier::{amalgamate_table_id, clip_suffix, postprocess_suffix};
use crate::node::{Action, CustomProperties, Format, NodeInput, NodeType, Urn};

pub fn pass_output_branches(graph: &mut Graph) -> BuildResult<()> {
    let branch_urns: Vec<Urn> = graph.branches.keys().copied().collect();
    for data_branch_urn in branch_urns {
        build_output_branch(graph, data_branch_urn)?;
    }
    Ok(())
}

fn build_output_branch(graph: &mut Graph, data_branch_urn: Urn) -> BuildResult<()> {
    let (code, clip, output_formats, style) = {
        let b = graph.branches.get(&data_branch_urn).unwrap();
        (b.code.clone(), b.clip.clone(), b.output_formats.clone(), b.style.clone())
    };
    // Output branches are themselves produced by this pass; skip re-processing them.
    if code.ends_with("--outputs") {
        return Ok(());
    }

    let sources: Vec<Urn> = collect_subtree(graph, data_branch_urn)
        .into_iter()
        .filter(|&u| matches!(graph.node(u).map(|n| n.action), Ok(Some(Action::Amalgamate)) | Ok(Some(Action::Invert))))
        .collect();

    let output_branch_name = format!("{code}--outputs");
    let output_branch_urn = graph.create_node(NewNode {
        name: output_branch_name.clone(),
        title: Some(format!("{code} Outputs")),
        node_type: NodeType::Branch,
        custom_properties: CustomProperties::with_branch(output_branch_name.clone()),
        ..Default::default()
    });
    graph.node_mut(output_branch_urn)?.parent = Some(graph.root);
    graph.node_mut(graph.root)?.children.push(output_branch_urn);
    graph.branches.insert(
        output_branch_urn,
        Branch {
            urn: output_branch_urn,
            code: output_branch_name.clone(),
            config: Value::Null,
            hash: String::new(),
            style: style.clone(),
            clip: clip.clone(),
            snapgrid: None,
            buffers: HashMap::new(),
            distances: HashMap::new(),
            math_context: HashMap::new(),
            output_formats: output_formats.clone(),
        },
    );

    let mut collector_outputs: Vec<String> = Vec::new();

    for source_urn in sources {
        let Some(source_output) = graph.node(source_urn)?.output.clone() else { continue };
        let source_name = graph.node(source_urn)?.name.clone();

        let postprocess_output = postprocess_suffix(&source_output);
        let postprocess_urn = graph.create_node(NewNode {
            name: format!("{source_name}--postprocess"),
            title: Some(format!("Postprocess - {source_name}")),
            node_type: NodeType::Process,
            action: Some(Action::Postprocess),
            input: NodeInput::Single(source_output),
            output: Some(postprocess_output.clone()),
            custom_properties: CustomProperties::with_branch(output_branch_name.clone()),
            ..Default::default()
        });

        let (export_parent_urn, export_parent_output) = match &clip {
            Some(areas) if !areas.is_empty() => {
                let output = clip_suffix(&postprocess_output, areas);
                let urn = graph.create_node(NewNode {
                    name: format!("{source_name}--clip"),
                    title: Some(format!("Clip - {source_name}")),
                    node_type: NodeType::Process,
                    action: Some(Action::Clip),
                    input: NodeInput::Single(postprocess_output.clone()),
                    output: Some(output.clone()),
                    custom_properties: CustomProperties { branch: Some(output_branch_name.clone()), clip: Some(areas.clone()), ..Default::default() },
                    ..Default::default()
                });
                graph.node_mut(urn)?.parent = Some(postprocess_urn);
                graph.node_mut(postprocess_urn)?.children.push(urn);
                (urn, output)
            }
            _ => (postprocess_urn, postprocess_output.clone()),
        };

        for format_name in &output_formats {
            if GLOBAL_OUTPUT_FORMATS.contains(&format_name.as_str()) {
                continue;
            }
            let export_output = format!("{export_parent_output}.{}", export_extension(format_name));
            let export_urn = graph.create_node(NewNode {
                name: format!("{source_name}--export-{format_name}"),
                title: Some(format!("Export {format_name} - {source_name}")),
                node_type: NodeType::Process,
                action: Some(Action::Output),
                format: Some(Format::from(format_name.as_str())),
                input: NodeInput::Single(export_parent_output.clone()),
                output: Some(export_output),
                custom_properties: CustomProperties::with_branch(output_branch_name.clone()),
                ..Default::default()
            });
            graph.node_mut(export_urn)?.parent = Some(export_parent_urn);
            graph.node_mut(export_parent_urn)?.children.push(export_urn);
        }

        let structure_blob = build_structure_blob(graph, source_urn, &style);
        let collector_urn = graph.create_group_node(
            output_branch_urn,
            &[postprocess_urn],
            format!("{source_name}--collector"),
            Some(format!("Collector - {source_name}")),
        )?;
        {
            let c = graph.node_mut(collector_urn)?;
            c.custom_properties.branch = Some(output_branch_name.clone());
            c.custom_properties.structure = structure_blob;
            c.output = Some(postprocess_output.clone());
        }
        collector_outputs.push(postprocess_output);
    }

    // Both `web` and `qgis` "require [a] json data file" (the original's
    // own words, `opensite.py:1263-1270`): whenever either is requested,
    // emit the json global node first, ahead of the formats themselves.
    let mut global_formats: Vec<&str> = GLOBAL_OUTPUT_FORMATS.iter().copied().filter(|f| output_formats.iter().any(|o| o == f)).collect();
    if !global_formats.is_empty() {
        global_formats.insert(0, Format::OUT_JSON);
    }

    for format_name in global_formats {
        let mut outputs = collector_outputs.clone();
        outputs.sort();
        let global_output = format!("{DATABASE_GENERAL_PREFIX}{}.{format_name}", amalgamate_table_id("", &outputs));
        let global_urn = graph.create_node(NewNode {
            name: format!("{output_branch_name}--{format_name}"),
            title: Some(format!("{format_name} output")),
            node_type: NodeType::Process,
            action: Some(Action::Output),
            format: Some(Format::from(format_name)),
            input: NodeInput::Many(outputs),
            output: Some(global_output),
            custom_properties: CustomProperties::with_branch(output_branch_name.clone()),
            ..Default::default()
        });
        graph.node_mut(global_urn)?.parent = Some(output_branch_urn);
        graph.node_mut(output_branch_urn)?.children.push(global_urn);
    }

    Ok(())
}

fn export_extension(format_name: &str) -> &'static str {
    match format_name {
        Format::OUT_SHP => "shp",
        Format::OUT_GEOJSON => "geojson",
        Format::OUT_MBTILES => "mbtiles",
        Format::OUT_JSON => "json",
        _ => "gpkg",
    }
}

fn collect_subtree(graph: &Graph, urn: Urn) -> Vec<Urn> {
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

/// Recovers display metadata (name/title/children) for a category node from
/// the pre-explosion snapshot. Only genuine pre-explosion category nodes are
/// present there; nodes created by later passes (all-layers, parent groups,
/// invert) yield `None` and simply carry no structure blob.
fn build_structure_blob(graph: &Graph, source_urn: Urn, style: &HashMap<String, Value>) -> Option<Value> {
    let original = graph.snapshot_node(source_urn)?;
    let color = style.get(&original.name).cloned();
    Some(serde_json::json!({
        "name": original.name,
        "title": original.title,
        "level": "category",
        "color": color,
        "children": original.children,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Urn as U;

    fn make_amalgamate(graph: &mut Graph, parent: U, name: &str, output: &str) -> U {
        let urn = graph.create_node(NewNode {
            name: name.to_string(),
            node_type: NodeType::Group,
            action: Some(Action::Amalgamate),
            output: Some(output.to_string()),
            ..Default::default()
        });
        graph.node_mut(urn).unwrap().parent = Some(parent);
        graph.node_mut(parent).unwrap().children.push(urn);
        urn
    }

    #[test]
    fn builds_isolated_output_branch_with_export_chain_per_format() {
        let mut graph = Graph::new();
        let branch_urn = graph.create_node(NewNode {
            name: "demo".into(),
            node_type: NodeType::Branch,
            custom_properties: CustomProperties::with_branch("demo"),
            ..Default::default()
        });
        graph.node_mut(branch_urn).unwrap().parent = Some(graph.root);
        graph.node_mut(graph.root).unwrap().children.push(branch_urn);
        graph.branches.insert(
            branch_urn,
            Branch {
                urn: branch_urn,
                code: "demo".into(),
                config: Value::Null,
                hash: "h".into(),
                style: HashMap::new(),
                clip: None,
                snapgrid: None,
                buffers: HashMap::new(),
                distances: HashMap::new(),
                math_context: HashMap::new(),
                output_formats: vec!["gpkg".into(), "shp".into()],
            },
        );
        make_amalgamate(&mut graph, branch_urn, "environment", "demo--abc");

        pass_output_branches(&mut graph).unwrap();

        let output_branch = graph.find_node("demo--outputs", None).unwrap();
        assert_eq!(output_branch.node_type, NodeType::Branch);
        let collector = graph.find_node("environment--collector", None).unwrap();
        assert!(collector.output.is_some());
        let gpkg_export = graph.find_node("environment--export-gpkg", None);
        assert!(gpkg_export.is_some());
        let shp_export = graph.find_node("environment--export-shp", None);
        assert!(shp_export.is_some());
    }

    fn make_empty_branch(graph: &mut Graph, name: &str, output_formats: Vec<String>) -> U {
        let branch_urn = graph.create_node(NewNode {
            name: name.into(),
            node_type: NodeType::Branch,
            ..Default::default()
        });
        graph.node_mut(branch_urn).unwrap().parent = Some(graph.root);
        graph.node_mut(graph.root).unwrap().children.push(branch_urn);
        graph.branches.insert(
            branch_urn,
            Branch {
                urn: branch_urn,
                code: name.into(),
                config: Value::Null,
                hash: "h".into(),
                style: HashMap::new(),
                clip: None,
                snapgrid: None,
                buffers: HashMap::new(),
                distances: HashMap::new(),
                math_context: HashMap::new(),
                output_formats,
            },
        );
        branch_urn
    }

    /// Spec §8.3: "a branch with no data children produces an output
    /// branch with exactly the three global nodes (json + any global
    /// formats requested), no per-format chain." With no global formats
    /// requested, that's an output branch with no children at all.
    #[test]
    fn empty_branch_still_produces_an_output_branch() {
        let mut graph = Graph::new();
        make_empty_branch(&mut graph, "empty", vec![]);

        pass_output_branches(&mut graph).unwrap();
        let output_branch = graph.find_node("empty--outputs", None).unwrap();
        assert_eq!(output_branch.node_type, NodeType::Branch);
        assert!(output_branch.children.is_empty());
    }

    /// Same empty-branch case, but `web` was requested: the branch still
    /// has no per-dataset chain, but does get the `json`+`web` global pair
    /// (json because web "requires [a] json data file").
    #[test]
    fn empty_branch_with_web_requested_still_emits_json_and_web() {
        let mut graph = Graph::new();
        make_empty_branch(&mut graph, "empty", vec!["web".into()]);

        pass_output_branches(&mut graph).unwrap();
        let output_branch = graph.find_node("empty--outputs", None).unwrap();
        assert_eq!(output_branch.children.len(), 2);
        assert!(graph.find_node("empty--outputs--json", None).is_some());
        assert!(graph.find_node("empty--outputs--web", None).is_some());
    }

    /// `mbtiles` is not itself a global format (§6.1's implied-format
    /// expansion happens before this pass runs, in the config loader); once
    /// it's present in a branch's `output_formats`, it gets a per-dataset
    /// export chain like any other local format.
    #[test]
    fn mbtiles_in_output_formats_gets_a_per_dataset_export_chain() {
        let mut graph = Graph::new();
        let branch_urn = graph.create_node(NewNode {
            name: "demo".into(),
            node_type: NodeType::Branch,
            custom_properties: CustomProperties::with_branch("demo"),
            ..Default::default()
        });
        graph.node_mut(branch_urn).unwrap().parent = Some(graph.root);
        graph.node_mut(graph.root).unwrap().children.push(branch_urn);
        graph.branches.insert(
            branch_urn,
            Branch {
                urn: branch_urn,
                code: "demo".into(),
                config: Value::Null,
                hash: "h".into(),
                style: HashMap::new(),
                clip: None,
                snapgrid: None,
                buffers: HashMap::new(),
                distances: HashMap::new(),
                math_context: HashMap::new(),
                output_formats: vec!["web".into(), "mbtiles".into()],
            },
        );
        make_amalgamate(&mut graph, branch_urn, "environment", "demo--abc");

        pass_output_branches(&mut graph).unwrap();
        assert!(graph.find_node("environment--export-mbtiles", None).is_some());
    }
}
