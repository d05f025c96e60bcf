//! Ready-set computation and submission ordering (spec §4.6), split out from
//! [`super`] because it is pure graph logic — no pools, no channels — and so
//! can be unit-tested directly against a `Graph` the way `explode`'s passes
//! are, rather than only through a threaded integration test.

use std::collections::HashMap;

use crate::constants::downloads_priority;
use crate::graph::Graph;
use crate::node::{Action, Node, NodeStatus, Urn};

/// All nodes sharing `urn`'s `global_urn` (just `[urn]` when it has none) —
/// spec §3.1 "two nodes share a `global_urn` iff they share a byte-identical
/// `output`"; the scheduler treats the set as a single logical unit.
pub fn clones_of(graph: &Graph, urn: Urn) -> Vec<Urn> {
    let Some(node) = graph.find_node_by_urn(urn) else { return Vec::new() };
    match node.global_urn {
        None => vec![urn],
        Some(g) => graph.all_nodes().filter(|n| n.global_urn == Some(g)).map(|n| n.urn).collect(),
    }
}

/// A node is ready when it is itself `Unprocessed` and every child of
/// *every* clone sharing its `global_urn` is `Processed` (spec §4.6). For
/// `global_urn = None` this degenerates to "this node's own children are all
/// processed".
pub fn is_ready(graph: &Graph, urn: Urn) -> bool {
    let Some(node) = graph.find_node_by_urn(urn) else { return false };
    if node.status != NodeStatus::Unprocessed {
        return false;
    }
    clones_of(graph, urn).iter().all(|&clone| {
        let Some(clone_node) = graph.find_node_by_urn(clone) else { return false };
        clone_node
            .children
            .iter()
            .all(|&child| graph.find_node_by_urn(child).map(|c| c.status == NodeStatus::Processed).unwrap_or(false))
    })
}

/// Every currently-ready node, in URN order (the caller is responsible for
/// filtering out nodes whose equivalence class is already in flight before
/// calling [`sort_ready`]).
pub fn ready_urns(graph: &Graph) -> Vec<Urn> {
    graph.all_nodes().map(|n| n.urn).filter(|&urn| is_ready(graph, urn)).collect()
}

fn action_weight(action: Option<Action>) -> u8 {
    match action {
        Some(Action::Download) => 0,
        _ => 1,
    }
}

/// Lower index wins. Non-downloads (or downloads with an unrecognized
/// format) sort after every recognized format, in URN order relative to
/// each other — `sort_ready`'s final URN tie-break covers that.
fn download_priority_index(node: &Node) -> usize {
    if node.action != Some(Action::Download) {
        return usize::MAX;
    }
    match &node.format {
        Some(format) => downloads_priority().iter().position(|f| *f == format.as_str()).unwrap_or(usize::MAX),
        None => usize::MAX,
    }
}

/// Deterministic submission order within one ready batch (spec §4.6):
/// downloads first, then lower `DOWNLOADS_PRIORITY` index, then larger
/// cached size first (`unknown` treated as `0`), then URN for a total order.
pub fn sort_ready(graph: &Graph, mut ready: Vec<Urn>, sizes: &HashMap<Urn, u64>) -> Vec<Urn> {
    ready.sort_by(|&a, &b| {
        let na = graph.find_node_by_urn(a).expect("ready urn must exist");
        let nb = graph.find_node_by_urn(b).expect("ready urn must exist");
        action_weight(na.action)
            .cmp(&action_weight(nb.action))
            .then_with(|| download_priority_index(na).cmp(&download_priority_index(nb)))
            .then_with(|| sizes.get(&b).copied().unwrap_or(0).cmp(&sizes.get(&a).copied().unwrap_or(0)))
            .then_with(|| a.cmp(&b))
    });
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NewNode;
    use crate::node::{Format, NodeStatus};

    #[test]
    fn node_with_no_children_is_immediately_ready() {
        let mut g = Graph::new();
        let urn = g.create_node(NewNode { name: "a".into(), ..Default::default() });
        g.node_mut(g.root).unwrap().children.push(urn);
        g.node_mut(urn).unwrap().parent = Some(g.root);
        assert!(is_ready(&g, urn));
    }

    #[test]
    fn node_with_unprocessed_child_is_not_ready() {
        let mut g = Graph::new();
        let parent = g.create_node(NewNode { name: "p".into(), ..Default::default() });
        let child = g.create_node(NewNode { name: "c".into(), ..Default::default() });
        g.node_mut(parent).unwrap().children.push(child);
        g.node_mut(child).unwrap().parent = Some(parent);
        assert!(!is_ready(&g, parent));

        g.node_mut(child).unwrap().status = NodeStatus::Processed;
        assert!(is_ready(&g, parent));
    }

    #[test]
    fn clones_require_all_siblings_children_processed() {
        let mut g = Graph::new();
        let child_a = g.create_node(NewNode { name: "child-a".into(), ..Default::default() });
        let a = g.create_node(NewNode { name: "a".into(), output: Some("x".into()), ..Default::default() });
        let child_b = g.create_node(NewNode { name: "child-b".into(), ..Default::default() });
        let b = g.create_node(NewNode { name: "b".into(), output: Some("x".into()), ..Default::default() });

        g.node_mut(a).unwrap().children.push(child_a);
        g.node_mut(child_a).unwrap().parent = Some(a);
        g.node_mut(b).unwrap().children.push(child_b);
        g.node_mut(child_b).unwrap().parent = Some(b);

        let shared = uuid::Uuid::new_v4();
        g.node_mut(a).unwrap().global_urn = Some(shared);
        g.node_mut(b).unwrap().global_urn = Some(shared);

        // b's child isn't processed yet, so a is not ready even though
        // a's own child is.
        g.node_mut(child_a).unwrap().status = NodeStatus::Processed;
        assert!(!is_ready(&g, a));

        g.node_mut(child_b).unwrap().status = NodeStatus::Processed;
        assert!(is_ready(&g, a));
        assert!(is_ready(&g, b));
    }

    #[test]
    fn sort_ready_puts_downloads_before_everything_else() {
        let mut g = Graph::new();
        let import = g.create_node(NewNode { name: "import".into(), action: Some(Action::Import), ..Default::default() });
        let download = g.create_node(NewNode { name: "download".into(), action: Some(Action::Download), ..Default::default() });
        let ordered = sort_ready(&g, vec![import, download], &HashMap::new());
        assert_eq!(ordered, vec![download, import]);
    }

    #[test]
    fn sort_ready_breaks_ties_by_descending_size() {
        let mut g = Graph::new();
        let small = g.create_node(NewNode { name: "small".into(), action: Some(Action::Download), format: Some(Format::from(Format::GPKG)), ..Default::default() });
        let big = g.create_node(NewNode { name: "big".into(), action: Some(Action::Download), format: Some(Format::from(Format::GPKG)), ..Default::default() });
        let mut sizes = HashMap::new();
        sizes.insert(small, 10);
        sizes.insert(big, 1_000);
        let ordered = sort_ready(&g, vec![small, big], &sizes);
        assert_eq!(ordered, vec![big, small]);
    }

    #[test]
    fn sort_ready_orders_downloads_by_priority_format() {
        let mut g = Graph::new();
        let osm = g.create_node(NewNode { name: "osm".into(), action: Some(Action::Download), format: Some(Format::from(Format::OSM)), ..Default::default() });
        let osm_yaml = g.create_node(NewNode { name: "osm-yaml".into(), action: Some(Action::Download), format: Some(Format::from(Format::OSM_YAML)), ..Default::default() });
        let ordered = sort_ready(&g, vec![osm_yaml, osm], &HashMap::new());
        assert_eq!(ordered, vec![osm, osm_yaml]);
    }
}
