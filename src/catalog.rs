//! Metadata Binder (C3, spec §4.3): binds external catalog metadata (titles,
//! download URLs, formats, filters) onto nodes mirrored by the configuration
//! loader, by matching a node's `name` against a catalog view.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::BuildResult;
use crate::graph::Graph;
use crate::node::{Format, NodeInput};

/// One resource offered for a dataset: a candidate download, with the format
/// token used to rank it against a branch's format priority list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogResource {
    pub url: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogExtra {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogDataset {
    pub package_name: String,
    pub title: String,
    #[serde(default)]
    pub resources: Vec<CatalogResource>,
    #[serde(default)]
    pub extras: Vec<CatalogExtra>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogGroup {
    pub group_title: Option<String>,
    #[serde(default)]
    pub datasets: Vec<CatalogDataset>,
}

/// `package_name -> group` view returned by a catalog capability (spec
/// §4.3's "catalog view"). The `default` key is a catch-all group whose own
/// name never binds to a node.
pub type CatalogModel = HashMap<String, CatalogGroup>;

/// Out-of-scope collaborator for external dataset catalogs (CKAN and
/// equivalents). Implementations live outside this crate's test-visible
/// surface; this trait is the seam C3 binds against.
pub trait Catalog {
    fn query(&self) -> BuildResult<CatalogModel>;
}

struct BoundEntry {
    title: String,
    input: Option<String>,
    format: Option<String>,
    filter: Option<(String, Vec<String>)>,
    preprocess: Option<String>,
}

/// Picks the single best resource by position in `priority_formats`
/// (ascending — index 0 wins outright). Falls back to the first resource
/// when none of them carry a recognized format.
pub fn choose_priority_resource<'a>(
    resources: &'a [CatalogResource],
    priority_formats: &[String],
) -> Option<&'a CatalogResource> {
    let first = resources.first()?;
    let mut best = first;
    let mut best_index = priority_formats.len();

    for resource in resources {
        if let Some(index) = priority_formats.iter().position(|f| f == &resource.format) {
            if index < best_index {
                best_index = index;
                best = resource;
                if best_index == 0 {
                    return Some(best);
                }
            }
        }
    }
    Some(best)
}

/// Builds the `name -> metadata` lookup used by [`bind`], flattening groups
/// and their datasets' priority resource into one map.
fn build_lookup(model: &CatalogModel, priority_formats: &[String]) -> HashMap<String, BoundEntry> {
    let mut lookup = HashMap::new();

    for (group_name, group) in model {
        if group_name != "default" {
            lookup.insert(
                group_name.clone(),
                BoundEntry {
                    title: group.group_title.clone().unwrap_or_else(|| group_name.clone()),
                    input: None,
                    format: None,
                    filter: None,
                    preprocess: None,
                },
            );
        }

        for dataset in &group.datasets {
            if dataset.package_name.is_empty() {
                continue;
            }
            let resource = choose_priority_resource(&dataset.resources, priority_formats);
            let mut filter = None;
            let mut preprocess = None;
            for extra in &dataset.extras {
                if let Some(field) = extra.key.strip_prefix("FILTER:") {
                    filter = Some((field.to_string(), extra.value.split(';').map(str::to_string).collect()));
                } else if extra.key == "preprocess" {
                    preprocess = Some(extra.value.clone());
                }
            }
            lookup.insert(
                dataset.package_name.clone(),
                BoundEntry {
                    title: dataset.title.clone(),
                    input: resource.map(|r| r.url.clone()),
                    format: resource.map(|r| r.format.clone()),
                    filter,
                    preprocess,
                },
            );
        }
    }

    lookup
}

/// Walks every node in the graph once, binding any match found in `model`'s
/// flattened lookup. Returns the number of nodes updated.
pub fn bind(graph: &mut Graph, model: &CatalogModel, priority_formats: &[String]) -> usize {
    let lookup = build_lookup(model, priority_formats);
    let mut matches = 0;

    for node in graph.all_nodes_mut() {
        if let Some(entry) = lookup.get(&node.name) {
            node.title = Some(entry.title.clone());
            if let Some(input) = &entry.input {
                node.input = NodeInput::Single(input.clone());
            }
            if let Some(format) = &entry.format {
                node.format = Some(Format::from(format.as_str()));
            }
            if let Some((field, values)) = &entry.filter {
                node.custom_properties.filter =
                    Some(crate::node::FilterSpec { field: field.clone(), values: values.clone() });
            }
            if let Some(preprocess) = &entry.preprocess {
                if preprocess == "closed_lines_to_polygons" {
                    node.custom_properties.preprocess = Some(crate::node::PreprocessKind::ClosedLinesToPolygons);
                }
            }
            matches += 1;
        }
    }

    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Graph, NewNode};
    use crate::node::NodeType;

    fn model_with_one_dataset() -> CatalogModel {
        let mut model = CatalogModel::new();
        model.insert(
            "environment".to_string(),
            CatalogGroup {
                group_title: Some("Environment".to_string()),
                datasets: vec![CatalogDataset {
                    package_name: "listed-buildings".to_string(),
                    title: "Listed Buildings".to_string(),
                    resources: vec![
                        CatalogResource { url: "https://example.test/a.geojson".into(), format: "GeoJSON".into() },
                        CatalogResource { url: "https://example.test/a.gpkg".into(), format: "GPKG".into() },
                    ],
                    extras: vec![CatalogExtra { key: "FILTER:status".into(), value: "active;pending".into() }],
                }],
            },
        );
        model
    }

    #[test]
    fn priority_format_wins_over_list_order() {
        let resources = vec![
            CatalogResource { url: "a".into(), format: "GeoJSON".into() },
            CatalogResource { url: "b".into(), format: "GPKG".into() },
        ];
        let priority = vec!["GPKG".to_string(), "GeoJSON".to_string()];
        let chosen = choose_priority_resource(&resources, &priority).unwrap();
        assert_eq!(chosen.url, "b");
    }

    #[test]
    fn falls_back_to_first_resource_when_no_format_matches() {
        let resources = vec![CatalogResource { url: "a".into(), format: "Shapefile".into() }];
        let priority = vec!["GPKG".to_string()];
        let chosen = choose_priority_resource(&resources, &priority).unwrap();
        assert_eq!(chosen.url, "a");
    }

    #[test]
    fn binds_title_input_format_and_filter_by_name_match() {
        let mut graph = Graph::new();
        let urn = graph.create_node(NewNode {
            name: "listed-buildings".to_string(),
            node_type: NodeType::Process,
            ..Default::default()
        });

        let model = model_with_one_dataset();
        let priority = vec!["GPKG".to_string(), "GeoJSON".to_string()];
        let matches = bind(&mut graph, &model, &priority);

        assert_eq!(matches, 1); // only the dataset node exists in this graph
        let node = graph.node(urn).unwrap();
        assert_eq!(node.title.as_deref(), Some("Listed Buildings"));
        assert_eq!(node.input.as_single(), Some("https://example.test/a.gpkg"));
        assert_eq!(node.format.as_ref().unwrap().as_str(), "GPKG");
        let filter = node.custom_properties.filter.as_ref().unwrap();
        assert_eq!(filter.field, "status");
        assert_eq!(filter.values, vec!["active", "pending"]);
    }

    #[test]
    fn group_level_match_receives_title_only() {
        let mut graph = Graph::new();
        let urn = graph.create_node(NewNode {
            name: "environment".to_string(),
            node_type: NodeType::Group,
            ..Default::default()
        });

        let model = model_with_one_dataset();
        bind(&mut graph, &model, &[]);

        let node = graph.node(urn).unwrap();
        assert_eq!(node.title.as_deref(), Some("Environment"));
        assert!(node.input.is_empty());
        assert!(node.format.is_none());
    }
}
