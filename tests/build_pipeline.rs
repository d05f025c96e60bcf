//! End-to-end coverage of the exploder pipeline feeding the scheduler
//! (spec §5.3's ambient test-tooling section), using `tempfile` fixtures
//! the way the crate's own inline unit tests do, but driving a whole
//! config-to-completion run rather than one pass or one sweep at a time.

use std::collections::HashSet;
use std::sync::Mutex;

use serde_json::{Map, Value};

use terraflow::config::{ConfigLoader, ConfigSource};
use terraflow::error::{BuildError, BuildResult};
use terraflow::explode;
use terraflow::graph::Graph;
use terraflow::node::{Action, Format, Node, NodeInput, NodeStatus};
use terraflow::scheduler::{CancellationToken, OperatorRunner, Scheduler, SchedulerConfig};

fn write_config(dir: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.yml");
    std::fs::write(&path, yaml).unwrap();
    path
}

/// Records every node it was asked to run and always succeeds — enough to
/// drive the scheduler's state machine without touching a filesystem or
/// database, matching how `scheduler::tests::CountingRunner` exercises the
/// scheduler in isolation, but here fed a graph that went through the real
/// exploder rather than one hand-built in the test.
struct StubRunner {
    ran: Mutex<Vec<String>>,
}

impl OperatorRunner for StubRunner {
    fn run(&self, node: &Node, _cancel: &CancellationToken) -> BuildResult<bool> {
        self.ran.lock().unwrap().push(node.name.clone());
        Ok(true)
    }
}

#[test]
fn a_single_dataset_branch_runs_to_completion_through_the_whole_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "code: demo\noutputformats: [gpkg]\nstructure:\n  environment:\n    - listed-buildings\n",
    );

    let mut graph = Graph::new();
    let mut loader = ConfigLoader::new(Value::Object(Map::new()), Value::Object(Map::new()));
    let branch_urn = loader.load_into(&mut graph, &ConfigSource::Local(path)).unwrap();

    // Stand in for the catalog binder (C3): give the leaf dataset a
    // resolvable source directly rather than running a live catalog query.
    let leaf = graph.find_node("listed-buildings", Some(branch_urn)).unwrap().urn;
    graph.node_mut(leaf).unwrap().input = NodeInput::Single("https://example.test/a.gpkg".into());
    graph.node_mut(leaf).unwrap().format = Some(Format::from(Format::GPKG));

    explode::explode(&mut graph).unwrap();

    let non_terminal_before: usize = graph.all_nodes().filter(|n| n.action.is_some()).count();
    assert!(non_terminal_before > 0, "exploder should have produced at least one actionable node");

    let scheduler = Scheduler::new(SchedulerConfig::fixed(2, 2), CancellationToken::new(None));
    let runner: std::sync::Arc<dyn OperatorRunner> = std::sync::Arc::new(StubRunner { ran: Mutex::new(Vec::new()) });
    scheduler.run(&mut graph, runner.clone(), runner, |_| {}).unwrap();

    for node in graph.all_nodes().filter(|n| n.action.is_some()) {
        assert_eq!(node.status, NodeStatus::Processed, "{} should have finished processing", node.name);
    }
}

#[test]
fn a_failing_import_stalls_the_run_without_panicking() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "code: demo\noutputformats: [gpkg]\nstructure:\n  environment:\n    - listed-buildings\n",
    );

    let mut graph = Graph::new();
    let mut loader = ConfigLoader::new(Value::Object(Map::new()), Value::Object(Map::new()));
    let branch_urn = loader.load_into(&mut graph, &ConfigSource::Local(path)).unwrap();
    let leaf = graph.find_node("listed-buildings", Some(branch_urn)).unwrap().urn;
    graph.node_mut(leaf).unwrap().input = NodeInput::Single("https://example.test/a.gpkg".into());
    graph.node_mut(leaf).unwrap().format = Some(Format::from(Format::GPKG));

    explode::explode(&mut graph).unwrap();

    struct FailImport {
        fail: HashSet<Action>,
    }
    impl OperatorRunner for FailImport {
        fn run(&self, node: &Node, _cancel: &CancellationToken) -> BuildResult<bool> {
            match node.action {
                Some(action) if self.fail.contains(&action) => Err(BuildError::data("simulated failure")),
                _ => Ok(true),
            }
        }
    }

    let scheduler = Scheduler::new(SchedulerConfig::fixed(2, 2), CancellationToken::new(None));
    let mut fail = HashSet::new();
    fail.insert(Action::Download);
    let runner: std::sync::Arc<dyn OperatorRunner> = std::sync::Arc::new(FailImport { fail });
    let err = scheduler.run(&mut graph, runner.clone(), runner, |_| {}).unwrap_err();

    assert!(matches!(err, BuildError::Stall(_)));
}
