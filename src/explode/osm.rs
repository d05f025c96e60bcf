//! Pass 6, OSM extract stack (spec §4.4 item 6), grounded in
//! `original_source/opensite/model/graph/opensite.py`'s `add_osmexporttool`:
//! datasets sharing one `osm` binary URL are rewritten into a concatenator +
//! downloader + runner triple, and the original consumer becomes an import
//! of the runner's output.

use std::collections::BTreeMap;

use crate::constants::{DATABASE_GENERAL_PREFIX, OSM_SUBFOLDER};
use crate::error::BuildResult;
use crate::graph::{Graph, NewNode};
use crate::identifier::amalgamate_table_id;
use crate::node::{Action, CustomProperties, Format, NodeInput, NodeType, Urn};

pub fn pass_osm_extract_stack(graph: &mut Graph) -> BuildResult<()> {
    let candidates: Vec<Urn> = graph
        .all_nodes()
        .filter(|n| n.node_type == NodeType::Download && n.format.as_ref().map(|f| f.as_str() == Format::OSM_YAML).unwrap_or(false))
        .map(|n| n.urn)
        .collect();

    let mut groups: BTreeMap<String, Vec<Urn>> = BTreeMap::new();
    for urn in candidates {
        if let Some(osm_url) = graph
            .get_property_from_lineage(urn, "osm")
            .and_then(|v| v.as_str().map(str::to_string))
        {
            groups.entry(osm_url).or_default().push(urn);
        }
    }

    for (osm_url, nodes) in groups {
        build_stack_for_group(graph, &osm_url, &nodes)?;
    }
    Ok(())
}

fn build_stack_for_group(graph: &mut Graph, osm_url: &str, nodes: &[Urn]) -> BuildResult<()> {
    let branch = graph.node(nodes[0])?.custom_properties.branch.clone();

    let mut outputs: Vec<String> =
        nodes.iter().filter_map(|&u| graph.node(u).ok().and_then(|n| n.output.clone())).collect();
    outputs.sort();
    outputs.dedup();

    let stem = amalgamate_table_id("", &outputs);
    let concat_output = format!("{DATABASE_GENERAL_PREFIX}{stem}.yml");
    let run_output = format!("{DATABASE_GENERAL_PREFIX}{stem}.gpkg");
    let osm_basename = osm_url.rsplit('/').next().unwrap_or(osm_url).to_string();

    let insertion_parent = graph.find_parent(nodes[0]).map(|p| p.urn).unwrap_or(graph.root);
    let concat_urn = graph.create_group_node(
        insertion_parent,
        nodes,
        format!("osm-concatenator--{osm_url}"),
        Some(format!("Concatenate OSM Configs - {osm_basename}")),
    )?;
    {
        let n = graph.node_mut(concat_urn)?;
        n.action = Some(Action::Concatenate);
        n.node_type = NodeType::OsmConcatenator;
        n.input = NodeInput::Many(outputs);
        n.output = Some(concat_output.clone());
        n.custom_properties.osm = Some(osm_url.to_string());
        n.custom_properties.branch = branch.clone();
    }

    let run_urn = graph.create_node(NewNode {
        name: format!("osm-runner--{osm_url}"),
        title: Some(format!("Run osm-export-tool - {osm_basename}")),
        node_type: NodeType::OsmRunner,
        action: Some(Action::Run),
        input: NodeInput::Single(concat_output),
        output: Some(run_output.clone()),
        custom_properties: CustomProperties { osm: Some(osm_url.to_string()), branch: branch.clone(), ..Default::default() },
        ..Default::default()
    });
    graph.insert_parent(concat_urn, run_urn)?;

    let down_urn = graph.create_node(NewNode {
        name: format!("osm-downloader--{osm_url}"),
        title: Some(format!("Download OSM Source - {osm_basename}")),
        node_type: NodeType::OsmDownloader,
        action: Some(Action::Download),
        format: Some(Format::from(Format::OSM)),
        input: NodeInput::Single(osm_url.to_string()),
        output: Some(format!("{OSM_SUBFOLDER}/{osm_basename}")),
        custom_properties: CustomProperties { osm: Some(osm_url.to_string()), branch, ..Default::default() },
        ..Default::default()
    });
    graph.node_mut(down_urn)?.parent = Some(run_urn);
    graph.node_mut(run_urn)?.children.push(down_urn);

    if let Some(runner_parent_urn) = graph.find_parent(run_urn).map(|p| p.urn) {
        let p = graph.node_mut(runner_parent_urn)?;
        p.action = Some(Action::Import);
        p.input = NodeInput::Single(run_output);
        p.custom_properties.osm = Some(osm_url.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::node::CustomProperties as CP;

    #[test]
    fn groups_by_shared_osm_url_and_wires_import_above_runner() {
        let mut graph = Graph::new();
        let branch = graph.create_node(NewNode {
            name: "demo".into(),
            node_type: NodeType::Branch,
            custom_properties: CP::with_branch("demo"),
            ..Default::default()
        });
        graph.node_mut(branch).unwrap().parent = Some(graph.root);
        graph.node_mut(graph.root).unwrap().children.push(branch);

        let consumer = graph.create_node(NewNode { name: "tip-height".into(), ..Default::default() });
        graph.node_mut(consumer).unwrap().parent = Some(branch);
        graph.node_mut(branch).unwrap().children.push(consumer);

        let dl = graph.create_node(NewNode {
            name: "tip-height".into(),
            node_type: NodeType::Download,
            format: Some(Format::from(Format::OSM_YAML)),
            output: Some("demo--abc.yml".into()),
            custom_properties: CustomProperties { branch: Some("demo".into()), osm: Some("https://example.test/gb.osm.pbf".into()), ..Default::default() },
            ..Default::default()
        });
        graph.node_mut(dl).unwrap().parent = Some(consumer);
        graph.node_mut(consumer).unwrap().children.push(dl);

        pass_osm_extract_stack(&mut graph).unwrap();

        let consumer_node = graph.node(consumer).unwrap();
        assert_eq!(consumer_node.action, Some(Action::Import));
        assert!(consumer_node.input.as_single().unwrap().ends_with(".gpkg"));
    }
}
