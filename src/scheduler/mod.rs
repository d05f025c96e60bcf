//! Scheduler (C6, spec §4.6): a dependency-driven, two-pool cooperative
//! runner grounded in `original_source/opensite/queue/opensite.py`'s
//! `OpenSiteQueue` — `get_runnable_nodes`'s ready-set sweep, the
//! `IO_POOL`/`CPU_POOL` split, `shutdown_requested()`'s cooperative
//! cancellation check, and the `global_urn` clone-sync step after every
//! completion.
//!
//! Per REDESIGN FLAGS §9 ("Global scheduler state -> owned by scheduler
//! actor"), the `Graph` is owned and mutated only by the monitor thread
//! running [`Scheduler::run`]; pool workers receive an owned `Node` snapshot
//! and report back a `(Urn, Result<bool, BuildError>)` completion over a
//! `crossbeam_channel`, never touching the graph themselves.

pub mod ready;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use threadpool::ThreadPool;

use crate::error::{BuildError, BuildResult};
use crate::graph::Graph;
use crate::node::{Action, GlobalUrn, Node, NodeStatus, Urn};
use ready::{clones_of, ready_urns, sort_ready};

/// Cooperative stop signal (spec §4.6): an in-memory flag for same-process
/// callers (e.g. the control surface's `build.stop()`) plus an optional
/// on-disk sentinel path, polled at the coarse checkpoints named in spec §5
/// ("per chunk, per pagination page, per gridsquare") by whatever operator
/// implementation owns that loop. The scheduler itself only polls it once
/// per monitor-loop iteration.
#[derive(Clone)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
    sentinel: Option<PathBuf>,
}

impl CancellationToken {
    pub fn new(sentinel: Option<PathBuf>) -> Self {
        CancellationToken { flag: Arc::new(AtomicBool::new(false)), sentinel }
    }

    pub fn request_cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.sentinel.as_deref().is_some_and(|p| p.exists())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        CancellationToken::new(None)
    }
}

/// Pool sizing (spec §4.6): `io_pool_size = 4 * cpu_pool_size`,
/// `cpu_pool_size = max(1, #cpus - 1)` by default.
pub struct SchedulerConfig {
    pub io_pool_size: usize,
    pub cpu_pool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let cpu_pool_size = cpus.saturating_sub(1).max(1);
        SchedulerConfig { cpu_pool_size, io_pool_size: cpu_pool_size * 4 }
    }
}

impl SchedulerConfig {
    pub fn fixed(io_pool_size: usize, cpu_pool_size: usize) -> Self {
        SchedulerConfig { io_pool_size: io_pool_size.max(1), cpu_pool_size: cpu_pool_size.max(1) }
    }
}

/// The seam operators are dispatched through (REDESIGN FLAGS §9's `Operator`
/// trait, ambient per SPEC_FULL.md §4.7.1). One implementation backs the
/// I/O pool (`download`/`unzip`/`concatenate`/`install`) and one the CPU
/// pool (everything else); both are plain trait objects so a test can swap
/// in a stub without a live database or network.
pub trait OperatorRunner: Send + Sync {
    /// Executes the action named by `node.action` against the node's
    /// current (cloned) state. `Ok(true)` means work was actually done;
    /// `Ok(false)` means the operator found its target already in place and
    /// skipped (spec §4.7 idempotence) — both are "processed" to the
    /// scheduler, the distinction is for logging only.
    fn run(&self, node: &Node, cancel: &CancellationToken) -> BuildResult<bool>;

    /// Best-effort size hints for the scheduler's ready-batch ordering
    /// (spec §4.6 item 3). `None` is "unknown", folded to `0` by the caller.
    fn remote_size(&self, _node: &Node) -> Option<u64> {
        None
    }
    fn local_size(&self, _node: &Node) -> Option<u64> {
        None
    }
    fn table_size(&self, _node: &Node) -> Option<u64> {
        None
    }
}

struct Completion {
    urn: Urn,
    outcome: BuildResult<bool>,
}

pub struct Scheduler {
    io_pool: ThreadPool,
    cpu_pool: ThreadPool,
    cancel: CancellationToken,
    on_cancel_store: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, cancel: CancellationToken) -> Self {
        Scheduler {
            io_pool: ThreadPool::new(config.io_pool_size),
            cpu_pool: ThreadPool::new(config.cpu_pool_size),
            cancel,
            on_cancel_store: None,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers a hook run once when cancellation is first observed —
    /// the scheduler's half of spec §4.6's "additionally requests the
    /// database to cancel its active queries" (the other half, actually
    /// issuing `pg_terminate_backend`, is `SpatialStore::cancel_own_queries`;
    /// this crate doesn't hard-wire the scheduler to a concrete store so the
    /// caller supplies the closure).
    pub fn with_cancel_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancel_store = Some(Box::new(hook));
        self
    }

    /// Runs `graph` to completion (spec §4.6's full state machine):
    /// repeatedly promote no-action nodes, compute and submit the ready
    /// set in deterministic order, block for the next completion, and
    /// repeat until either nothing non-terminal remains (success),
    /// cancellation is observed (drains in-flight work, returns
    /// `BuildError::Cancelled`), or the ready set is empty on two
    /// consecutive sweeps while non-terminal nodes remain (`BuildError::Stall`).
    pub fn run(
        &self,
        graph: &mut Graph,
        io_runner: Arc<dyn OperatorRunner>,
        cpu_runner: Arc<dyn OperatorRunner>,
        mut on_progress: impl FnMut(&Graph),
    ) -> BuildResult<()> {
        let (tx, rx): (Sender<Completion>, Receiver<Completion>) = unbounded();
        let mut in_flight: HashSet<Urn> = HashSet::new();
        let mut in_flight_global: HashSet<GlobalUrn> = HashSet::new();
        let mut sizes: HashMap<Urn, u64> = HashMap::new();
        let mut stall_sweeps: usize = 0;

        loop {
            if self.cancel.is_cancelled() {
                if let Some(hook) = &self.on_cancel_store {
                    hook();
                }
                self.drain_in_flight(graph, &rx, &mut in_flight);
                return Err(BuildError::Cancelled);
            }

            self.promote_actionless_nodes(graph)?;

            let non_terminal = graph.all_nodes().filter(|n| !n.status.is_terminal()).count();
            if non_terminal == 0 && in_flight.is_empty() {
                return Ok(());
            }

            let ready: Vec<Urn> = ready_urns(graph)
                .into_iter()
                .filter(|&u| !in_flight.contains(&u))
                .filter(|&u| {
                    graph
                        .find_node_by_urn(u)
                        .and_then(|n| n.global_urn)
                        .map(|g| !in_flight_global.contains(&g))
                        .unwrap_or(true)
                })
                .collect();

            if ready.is_empty() {
                if in_flight.is_empty() {
                    stall_sweeps += 1;
                    if stall_sweeps >= 2 {
                        return Err(BuildError::Stall(non_terminal));
                    }
                    continue;
                }
            } else {
                stall_sweeps = 0;
                self.prefetch_sizes(graph, &ready, &io_runner, &cpu_runner, &mut sizes);
                let ordered = sort_ready(graph, ready, &sizes);

                for urn in ordered {
                    let node = graph.find_node_by_urn(urn).expect("ready urn must exist").clone();
                    // A sibling clone earlier in this same batch may have
                    // just claimed this equivalence class — defer to the
                    // next sweep rather than double-submit (spec §4.6
                    // "exactly one concurrent execution per `global_urn`").
                    if let Some(g) = node.global_urn {
                        if in_flight_global.contains(&g) {
                            continue;
                        }
                        in_flight_global.insert(g);
                    }
                    in_flight.insert(urn);
                    self.advance_clones(graph, urn, NodeStatus::Processing)?;

                    let is_io = node.action.map(Action::is_io_bound).unwrap_or(false);
                    let runner = if is_io { io_runner.clone() } else { cpu_runner.clone() };
                    let cancel = self.cancel.clone();
                    let tx = tx.clone();
                    let pool = if is_io { &self.io_pool } else { &self.cpu_pool };
                    pool.execute(move || {
                        let outcome = runner.run(&node, &cancel);
                        let _ = tx.send(Completion { urn, outcome });
                    });
                }
                on_progress(graph);
            }

            if !in_flight.is_empty() {
                let completion = rx
                    .recv()
                    .map_err(|e| BuildError::Other(anyhow::anyhow!("scheduler completion channel closed: {e}")))?;
                in_flight.remove(&completion.urn);

                if let Some(g) = graph.find_node_by_urn(completion.urn).and_then(|n| n.global_urn) {
                    let clone_still_running = clones_of(graph, completion.urn).iter().any(|c| in_flight.contains(c));
                    if !clone_still_running {
                        in_flight_global.remove(&g);
                    }
                }

                let next_status = match &completion.outcome {
                    Ok(_) => NodeStatus::Processed,
                    Err(_) => NodeStatus::Failed,
                };
                self.advance_clones(graph, completion.urn, next_status)?;
                if let Err(e) = &completion.outcome {
                    if let Ok(node) = graph.node_mut(completion.urn) {
                        node.add_log(format!("failed: {e}"));
                    }
                }
                on_progress(graph);
            }
        }
    }

    /// Nodes with no `action` transition straight to `processed` on
    /// selection (spec §4.6) rather than being submitted anywhere. Looped
    /// because promoting one can make a sibling (or the group itself) the
    /// new ready frontier.
    fn promote_actionless_nodes(&self, graph: &mut Graph) -> BuildResult<()> {
        loop {
            let promoted: Vec<Urn> = ready_urns(graph)
                .into_iter()
                .filter(|&u| graph.find_node_by_urn(u).map(|n| n.action.is_none()).unwrap_or(false))
                .collect();
            if promoted.is_empty() {
                return Ok(());
            }
            for urn in promoted {
                self.advance_clones(graph, urn, NodeStatus::Processed)?;
            }
        }
    }

    /// Writes `status` onto every clone atomically, honoring progress
    /// monotonicity (spec §8.1) — a clone already at or past `status` is
    /// left alone rather than erroring, since two clones can reach the same
    /// status through different call sites in the same sweep.
    fn advance_clones(&self, graph: &mut Graph, urn: Urn, status: NodeStatus) -> BuildResult<()> {
        for clone in clones_of(graph, urn) {
            let node = graph.node_mut(clone)?;
            if node.status.can_advance_to(status) {
                node.status = status;
            }
        }
        Ok(())
    }

    /// Bulk size pre-fetch (spec §4.6 item 3, §9 "process-wide caches ->
    /// node-local fields populated by a bulk pre-fetch phase"): issues one
    /// size query per not-yet-cached ready node on the I/O pool, in
    /// parallel, then blocks until all have reported.
    fn prefetch_sizes(
        &self,
        graph: &Graph,
        ready: &[Urn],
        io_runner: &Arc<dyn OperatorRunner>,
        cpu_runner: &Arc<dyn OperatorRunner>,
        sizes: &mut HashMap<Urn, u64>,
    ) {
        let (tx, rx) = unbounded::<(Urn, u64)>();
        let mut pending = 0usize;

        for &urn in ready {
            if sizes.contains_key(&urn) {
                continue;
            }
            let Some(node) = graph.find_node_by_urn(urn) else { continue };
            let node = node.clone();
            let is_io = node.action.map(Action::is_io_bound).unwrap_or(false);
            let runner = if is_io { io_runner.clone() } else { cpu_runner.clone() };
            let tx = tx.clone();
            pending += 1;
            self.io_pool.execute(move || {
                let size = runner.remote_size(&node).or_else(|| runner.local_size(&node)).or_else(|| runner.table_size(&node)).unwrap_or(0);
                let _ = tx.send((urn, size));
            });
        }
        drop(tx);

        for _ in 0..pending {
            if let Ok((urn, size)) = rx.recv() {
                sizes.insert(urn, size);
            }
        }
    }

    /// On cancellation: stop submitting new work and wait out whatever is
    /// already running (best-effort; native subprocesses are not signalled,
    /// spec §9 Open Question), folding every straggling completion into the
    /// graph before returning so a later progress snapshot is accurate.
    fn drain_in_flight(&self, graph: &mut Graph, rx: &Receiver<Completion>, in_flight: &mut HashSet<Urn>) {
        while !in_flight.is_empty() {
            match rx.recv() {
                Ok(completion) => {
                    in_flight.remove(&completion.urn);
                    let status = if completion.outcome.is_ok() { NodeStatus::Processed } else { NodeStatus::Failed };
                    let _ = self.advance_clones(graph, completion.urn, status);
                }
                Err(_) => break,
            }
        }
        self.io_pool.join();
        self.cpu_pool.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NewNode;
    use crate::node::NodeInput;
    use std::sync::Mutex;

    struct CountingRunner {
        ran: Mutex<Vec<String>>,
        fail: HashSet<String>,
    }

    impl OperatorRunner for CountingRunner {
        fn run(&self, node: &Node, _cancel: &CancellationToken) -> BuildResult<bool> {
            self.ran.lock().unwrap().push(node.name.clone());
            if self.fail.contains(&node.name) {
                return Err(BuildError::data("boom"));
            }
            Ok(true)
        }
    }

    fn runner(fail: &[&str]) -> Arc<dyn OperatorRunner> {
        Arc::new(CountingRunner { ran: Mutex::new(Vec::new()), fail: fail.iter().map(|s| s.to_string()).collect() })
    }

    #[test]
    fn runs_a_simple_chain_to_completion() {
        let mut g = Graph::new();
        let child = g.create_node(NewNode { name: "child".into(), action: Some(Action::Import), output: Some("x".into()), ..Default::default() });
        let parent = g.create_node(NewNode {
            name: "parent".into(),
            action: Some(Action::Amalgamate),
            input: NodeInput::Many(vec!["x".into()]),
            output: Some("y".into()),
            ..Default::default()
        });
        g.node_mut(g.root).unwrap().children.push(parent);
        g.node_mut(parent).unwrap().parent = Some(g.root);
        g.node_mut(parent).unwrap().children.push(child);
        g.node_mut(child).unwrap().parent = Some(parent);

        let scheduler = Scheduler::new(SchedulerConfig::fixed(2, 2), CancellationToken::new(None));
        let cpu = runner(&[]);
        let io = runner(&[]);
        scheduler.run(&mut g, io, cpu, |_| {}).unwrap();

        assert_eq!(g.node(child).unwrap().status, NodeStatus::Processed);
        assert_eq!(g.node(parent).unwrap().status, NodeStatus::Processed);
    }

    #[test]
    fn a_failed_node_leaves_dependents_unprocessed_and_stalls() {
        let mut g = Graph::new();
        let child = g.create_node(NewNode { name: "child".into(), action: Some(Action::Import), output: Some("x".into()), ..Default::default() });
        let parent = g.create_node(NewNode {
            name: "parent".into(),
            action: Some(Action::Amalgamate),
            input: NodeInput::Many(vec!["x".into()]),
            output: Some("y".into()),
            ..Default::default()
        });
        g.node_mut(g.root).unwrap().children.push(parent);
        g.node_mut(parent).unwrap().parent = Some(g.root);
        g.node_mut(parent).unwrap().children.push(child);
        g.node_mut(child).unwrap().parent = Some(parent);

        let scheduler = Scheduler::new(SchedulerConfig::fixed(2, 2), CancellationToken::new(None));
        let cpu = runner(&["child"]);
        let io = runner(&["child"]);
        let err = scheduler.run(&mut g, io, cpu, |_| {}).unwrap_err();

        assert!(matches!(err, BuildError::Stall(_)));
        assert_eq!(g.node(child).unwrap().status, NodeStatus::Failed);
        assert_eq!(g.node(parent).unwrap().status, NodeStatus::Unprocessed);
    }

    #[test]
    fn shared_global_urn_clones_run_exactly_once_and_sync_status() {
        let mut g = Graph::new();
        let a = g.create_node(NewNode { name: "a".into(), action: Some(Action::Import), output: Some("x".into()), ..Default::default() });
        let b = g.create_node(NewNode { name: "b".into(), action: Some(Action::Import), output: Some("x".into()), ..Default::default() });
        let shared = uuid::Uuid::new_v4();
        g.node_mut(a).unwrap().global_urn = Some(shared);
        g.node_mut(b).unwrap().global_urn = Some(shared);
        g.node_mut(g.root).unwrap().children.push(a);
        g.node_mut(g.root).unwrap().children.push(b);
        g.node_mut(a).unwrap().parent = Some(g.root);
        g.node_mut(b).unwrap().parent = Some(g.root);

        let scheduler = Scheduler::new(SchedulerConfig::fixed(2, 2), CancellationToken::new(None));
        let cpu = runner(&[]);
        let io = runner(&[]);
        scheduler.run(&mut g, io, cpu, |_| {}).unwrap();

        assert_eq!(g.node(a).unwrap().status, NodeStatus::Processed);
        assert_eq!(g.node(b).unwrap().status, NodeStatus::Processed);
    }

    #[test]
    fn already_cancelled_token_stops_before_submitting_anything() {
        let mut g = Graph::new();
        let a = g.create_node(NewNode { name: "a".into(), action: Some(Action::Import), output: Some("x".into()), ..Default::default() });
        g.node_mut(g.root).unwrap().children.push(a);
        g.node_mut(a).unwrap().parent = Some(g.root);

        let token = CancellationToken::new(None);
        token.request_cancel();
        let scheduler = Scheduler::new(SchedulerConfig::fixed(1, 1), token);
        let cpu = runner(&[]);
        let io = runner(&[]);
        let err = scheduler.run(&mut g, io, cpu, |_| {}).unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
        assert_eq!(g.node(a).unwrap().status, NodeStatus::Unprocessed);
    }
}
