use std::collections::HashMap;

use serde_json::Value;

use crate::error::{BuildError, BuildResult};
use crate::node::{Action, CustomProperties, LogEntry, Node, NodeInput, NodeStatus, NodeType, Urn};

/// The subtree rooted at a first-level child of the graph root (spec §3.2).
/// Created by the configuration loader (C2), enriched by the exploder (C4),
/// frozen thereafter for this run.
#[derive(Debug, Clone)]
pub struct Branch {
    pub urn: Urn,
    pub code: String,
    pub config: Value,
    pub hash: String,
    /// category -> { color, ... }
    pub style: HashMap<String, Value>,
    pub clip: Option<Vec<String>>,
    pub snapgrid: Option<f64>,
    /// dataset name -> buffer/distance expression, unresolved until §4.4 pass 8.
    pub buffers: HashMap<String, String>,
    pub distances: HashMap<String, String>,
    /// Math-variable context for symbolic expression resolution (top-level
    /// scalar keys of the merged document that are themselves numbers).
    pub math_context: HashMap<String, f64>,
    pub output_formats: Vec<String>,
}

/// Owning arena of nodes keyed by URN (REDESIGN FLAGS §9: "Tree with
/// back-references -> arena + indices"). `parent`/`children` on `Node` are
/// URN references resolved through this arena rather than pointers, so
/// structural mutation never has to walk up through borrowed references.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Option<Node>>,
    next_urn: Urn,
    pub root: Urn,
    pub branches: HashMap<Urn, Branch>,
    /// Frozen copy of every live node at the moment explode pass 1 ran,
    /// keyed by URN. Later passes (notably the output-branch pass) consult
    /// this to recover pre-explosion structure — category nesting, titles,
    /// style — that subsequent passes move or delete from the live tree.
    pub snapshot: Option<HashMap<Urn, Node>>,
}

/// Arguments accepted by `Graph::create_node`. Every field defaults so
/// callers only set what they need, mirroring the builder-ish
/// `Node::new`/struct-literal style used elsewhere (`MapLayer::new`).
#[derive(Debug, Default, Clone)]
pub struct NewNode {
    pub name: String,
    pub title: Option<String>,
    pub node_type: NodeType,
    pub action: Option<Action>,
    pub format: Option<crate::node::Format>,
    pub input: NodeInput,
    pub output: Option<String>,
    pub style: Option<Value>,
    pub custom_properties: CustomProperties,
}

impl Default for NodeType {
    fn default() -> Self {
        NodeType::Process
    }
}

impl Graph {
    pub fn new() -> Self {
        let mut g = Graph { nodes: Vec::new(), next_urn: 1, root: 0, branches: HashMap::new() };
        let root = g.create_node(NewNode {
            name: "root".to_string(),
            node_type: NodeType::Root,
            ..Default::default()
        });
        g.root = root;
        g
    }

    pub fn create_node(&mut self, attrs: NewNode) -> Urn {
        let urn = self.next_urn;
        self.next_urn += 1;

        let node = Node {
            urn,
            global_urn: None,
            name: attrs.name,
            title: attrs.title,
            node_type: attrs.node_type,
            action: attrs.action,
            format: attrs.format,
            input: attrs.input,
            output: attrs.output,
            style: attrs.style,
            custom_properties: attrs.custom_properties,
            status: NodeStatus::Unprocessed,
            log: Vec::new(),
            parent: None,
            children: Vec::new(),
            cached_remote_size: None,
            cached_local_size: None,
            cached_table_size: None,
        };

        if urn as usize >= self.nodes.len() {
            self.nodes.resize_with(urn as usize + 1, || None);
        }
        self.nodes[urn as usize] = Some(node);
        urn
    }

    pub fn node(&self, urn: Urn) -> BuildResult<&Node> {
        self.nodes
            .get(urn as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| BuildError::not_found(format!("no such node: urn={urn}")))
    }

    pub fn node_mut(&mut self, urn: Urn) -> BuildResult<&mut Node> {
        self.nodes
            .get_mut(urn as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| BuildError::not_found(format!("no such node: urn={urn}")))
    }

    pub fn find_node_by_urn(&self, urn: Urn) -> Option<&Node> {
        self.nodes.get(urn as usize).and_then(|slot| slot.as_ref())
    }

    /// All live nodes, in URN order (stable and deterministic — used
    /// wherever the original walked the tree recursively but order doesn't
    /// matter for correctness, e.g. `find_nodes_by_props`).
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn all_nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut().filter_map(|slot| slot.as_mut())
    }

    /// Recursive search for a node by name starting from `start` (defaults
    /// to root), depth-first in child order.
    pub fn find_node(&self, name: &str, start: Option<Urn>) -> Option<&Node> {
        let start = start.unwrap_or(self.root);
        self.find_node_rec(name, start)
    }

    fn find_node_rec(&self, name: &str, current: Urn) -> Option<&Node> {
        let node = self.find_node_by_urn(current)?;
        if node.name == name {
            return Some(node);
        }
        for &child in &node.children {
            if let Some(found) = self.find_node_rec(name, child) {
                return Some(found);
            }
        }
        None
    }

    pub fn find_parent(&self, urn: Urn) -> Option<&Node> {
        let node = self.find_node_by_urn(urn)?;
        node.parent.and_then(|p| self.find_node_by_urn(p))
    }

    pub fn find_child(&self, parent: Urn, name: &str) -> Option<&Node> {
        let parent = self.find_node_by_urn(parent)?;
        parent
            .children
            .iter()
            .filter_map(|&c| self.find_node_by_urn(c))
            .find(|c| c.name == name)
    }

    /// Matches every key against top-level attributes first, falling
    /// through to `custom_properties` (spec §4.1). Keys supported against
    /// top-level attributes: `global_urn`, `name`, `node_type`, `action`,
    /// `format`, `output`, `status`.
    pub fn find_nodes_by_props(&self, search: &HashMap<String, Value>) -> Vec<&Node> {
        self.all_nodes().filter(|n| node_matches_props(n, search)).collect()
    }

    /// Splices `new_parent` between `child` and its current parent. If
    /// `child` was root, `new_parent` becomes the new root.
    pub fn insert_parent(&mut self, child: Urn, new_parent: Urn) -> BuildResult<()> {
        let old_parent = self.find_parent(child).map(|p| p.urn);

        if let Some(old_parent) = old_parent {
            let op = self.node_mut(old_parent)?;
            if let Some(idx) = op.children.iter().position(|&c| c == child) {
                op.children[idx] = new_parent;
            }
        } else if self.root == child {
            self.root = new_parent;
        }

        {
            let np = self.node_mut(new_parent)?;
            if !np.children.contains(&child) {
                np.children.push(child);
            }
        }
        {
            let c = self.node_mut(child)?;
            c.parent = Some(new_parent);
        }
        {
            let np = self.node_mut(new_parent)?;
            np.parent = old_parent;
        }
        Ok(())
    }

    /// Removes `urn` and its whole subtree from both the tree and the URN
    /// registry. Never leaves a dangling parent pointer: the parent's
    /// children list is updated in the same call.
    pub fn delete_node(&mut self, urn: Urn) -> BuildResult<()> {
        let (parent, children) = {
            let node = self.node(urn)?;
            (node.parent, node.children.clone())
        };

        for child in children {
            self.delete_node(child)?;
        }

        if let Some(parent) = parent {
            if let Ok(p) = self.node_mut(parent) {
                p.children.retain(|&c| c != urn);
            }
        }

        if (urn as usize) < self.nodes.len() {
            self.nodes[urn as usize] = None;
        }
        Ok(())
    }

    /// Reparents `child_urns` under a newly created sibling group node.
    pub fn create_group_node(
        &mut self,
        parent_urn: Urn,
        child_urns: &[Urn],
        name: impl Into<String>,
        title: Option<String>,
    ) -> BuildResult<Urn> {
        let group = self.create_node(NewNode {
            name: name.into(),
            title,
            node_type: NodeType::Group,
            action: Some(Action::Amalgamate),
            ..Default::default()
        });

        for &child in child_urns {
            let old_parent = self.find_parent(child).map(|p| p.urn);
            if let Some(old_parent) = old_parent {
                let op = self.node_mut(old_parent)?;
                op.children.retain(|&c| c != child);
            }
            let c = self.node_mut(child)?;
            c.parent = Some(group);
        }

        {
            let g = self.node_mut(group)?;
            g.children = child_urns.to_vec();
        }
        {
            let p = self.node_mut(parent_urn)?;
            if !p.children.contains(&group) {
                p.children.push(group);
            }
        }
        {
            let g = self.node_mut(group)?;
            g.parent = Some(parent_urn);
        }

        Ok(group)
    }

    pub fn get_terminal_nodes(&self) -> Vec<&Node> {
        self.all_nodes().filter(|n| n.is_terminal_node()).collect()
    }

    /// Walks ancestors of `urn`, returning the first non-`None` hit for
    /// `key` in `custom_properties` (via `extra`, or the typed `branch`
    /// field when `key == "branch"`).
    pub fn get_property_from_lineage(&self, urn: Urn, key: &str) -> Option<Value> {
        let mut current = Some(urn);
        while let Some(u) = current {
            let node = self.find_node_by_urn(u)?;
            if let Some(v) = property_value(node, key) {
                return Some(v);
            }
            current = node.parent;
        }
        None
    }

    pub fn log(&self, _level: log::Level, msg: &str) {
        log::log!(_level, "{msg}");
    }

    /// Freezes every live node into `self.snapshot` (explode pass 1).
    pub fn capture_snapshot(&mut self) {
        let frozen = self.all_nodes().map(|n| (n.urn, n.clone())).collect();
        self.snapshot = Some(frozen);
    }

    pub fn snapshot_node(&self, urn: Urn) -> Option<&Node> {
        self.snapshot.as_ref()?.get(&urn)
    }
}

fn property_value(node: &Node, key: &str) -> Option<Value> {
    match key {
        "branch" => node.custom_properties.branch.clone().map(Value::from),
        "buffer" => node.custom_properties.buffer.clone().map(Value::from),
        "distance" => node.custom_properties.distance.clone().map(Value::from),
        "osm" => node.custom_properties.osm.clone().map(Value::from),
        "ckan" => node.custom_properties.ckan.clone().map(Value::from),
        "snapgrid" => node.custom_properties.snapgrid.map(Value::from),
        _ => node.custom_properties.extra.get(key).cloned(),
    }
}

fn node_matches_props(node: &Node, search: &HashMap<String, Value>) -> bool {
    for (key, expected) in search {
        let actual = match key.as_str() {
            "urn" => Some(Value::from(node.urn)),
            "global_urn" => node.global_urn.map(|g| Value::from(g.to_string())),
            "name" => Some(Value::from(node.name.clone())),
            "output" => node.output.clone().map(Value::from),
            "status" => Some(serde_json::to_value(node.status).unwrap()),
            "action" => node.action.map(|a| serde_json::to_value(a).unwrap()),
            "node_type" => Some(serde_json::to_value(node.node_type).unwrap()),
            "format" => node.format.as_ref().map(|f| Value::from(f.as_str())),
            _ => property_value(node, key),
        };
        if actual.as_ref() != Some(expected) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_unique_and_parentless() {
        let g = Graph::new();
        assert_eq!(g.all_nodes().count(), 1);
        let root = g.node(g.root).unwrap();
        assert!(root.parent.is_none());
    }

    #[test]
    fn create_node_assigns_unique_urns() {
        let mut g = Graph::new();
        let a = g.create_node(NewNode { name: "a".into(), ..Default::default() });
        let b = g.create_node(NewNode { name: "b".into(), ..Default::default() });
        assert_ne!(a, b);
        assert_eq!(g.all_nodes().count(), 3);
    }

    #[test]
    fn insert_parent_splices_above_child() {
        let mut g = Graph::new();
        let child = g.create_node(NewNode { name: "child".into(), ..Default::default() });
        g.node_mut(g.root).unwrap().children.push(child);
        g.node_mut(child).unwrap().parent = Some(g.root);

        let wrapper = g.create_node(NewNode { name: "wrapper".into(), ..Default::default() });
        g.insert_parent(child, wrapper).unwrap();

        assert_eq!(g.node(child).unwrap().parent, Some(wrapper));
        assert_eq!(g.node(wrapper).unwrap().parent, Some(g.root));
        assert!(g.node(g.root).unwrap().children.contains(&wrapper));
        assert!(!g.node(g.root).unwrap().children.contains(&child));
    }

    #[test]
    fn insert_parent_on_root_replaces_root() {
        let mut g = Graph::new();
        let old_root = g.root;
        let wrapper = g.create_node(NewNode { name: "wrapper".into(), ..Default::default() });
        g.insert_parent(old_root, wrapper).unwrap();
        assert_eq!(g.root, wrapper);
        assert_eq!(g.node(old_root).unwrap().parent, Some(wrapper));
    }

    #[test]
    fn delete_node_removes_subtree_and_orphans_nothing() {
        let mut g = Graph::new();
        let parent = g.create_node(NewNode { name: "p".into(), ..Default::default() });
        let child = g.create_node(NewNode { name: "c".into(), ..Default::default() });
        g.node_mut(g.root).unwrap().children.push(parent);
        g.node_mut(parent).unwrap().parent = Some(g.root);
        g.node_mut(parent).unwrap().children.push(child);
        g.node_mut(child).unwrap().parent = Some(parent);

        g.delete_node(parent).unwrap();

        assert!(g.find_node_by_urn(parent).is_none());
        assert!(g.find_node_by_urn(child).is_none());
        assert!(!g.node(g.root).unwrap().children.contains(&parent));
    }

    #[test]
    fn find_nodes_by_props_falls_through_to_custom_properties() {
        let mut g = Graph::new();
        let mut props = CustomProperties::default();
        props.branch = Some("demo".into());
        g.create_node(NewNode { name: "x".into(), custom_properties: props, ..Default::default() });

        let mut search = HashMap::new();
        search.insert("branch".to_string(), Value::from("demo"));
        let matches = g.find_nodes_by_props(&search);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].name, "x");
    }

    #[test]
    fn get_property_from_lineage_walks_ancestors() {
        let mut g = Graph::new();
        let mut props = CustomProperties::default();
        props.branch = Some("demo".into());
        let parent = g.create_node(NewNode { name: "p".into(), custom_properties: props, ..Default::default() });
        let child = g.create_node(NewNode { name: "c".into(), ..Default::default() });
        g.node_mut(g.root).unwrap().children.push(parent);
        g.node_mut(parent).unwrap().parent = Some(g.root);
        g.node_mut(parent).unwrap().children.push(child);
        g.node_mut(child).unwrap().parent = Some(parent);

        let value = g.get_property_from_lineage(child, "branch");
        assert_eq!(value, Some(Value::from("demo")));
    }
}
