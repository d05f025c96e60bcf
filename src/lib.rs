//! Crate root: wires the config loader (C2), metadata binder (C3), graph
//! exploder (C4), registry (C5), scheduler (C6), operators (C7), and output
//! registry (C8) into one driver type, [`BuildEngine`], grounded in
//! `original_source/opensite/opensite.py`'s top-level `OpenSite` class —
//! the thing every other module in this crate is a named piece of.

pub mod catalog;
pub mod config;
pub mod constants;
pub mod error;
pub mod explode;
pub mod fs_util;
pub mod graph;
pub mod identifier;
pub mod math;
pub mod node;
pub mod operators;
pub mod scheduler;

#[cfg(feature = "postgis")]
pub mod output_registry;
#[cfg(feature = "postgis")]
pub mod registry;
#[cfg(feature = "postgis")]
pub mod store;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::config::ConfigSource;
use crate::error::{BuildError, BuildResult};
use crate::graph::Graph;
use crate::node::{Action, Node, NodeStatus, Urn};
use crate::scheduler::{CancellationToken, OperatorRunner, Scheduler, SchedulerConfig};

#[cfg(feature = "postgis")]
use crate::output_registry::OutputRegistry;
#[cfg(feature = "postgis")]
use crate::registry::Registry;
#[cfg(feature = "postgis")]
use crate::store::{SpatialStore, StoreConfig};

/// Directory layout under one build's working root (spec §6.4), grounded
/// in `OpenSiteConstants`'s folder constants. Every path here is derived
/// from `root` rather than stored independently, so a build can be moved
/// by moving one directory.
pub struct FilesystemLayout {
    pub root: PathBuf,
}

impl FilesystemLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemLayout { root: root.into() }
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }
    pub fn osm_downloads_dir(&self) -> PathBuf {
        self.downloads_dir().join(constants::OSM_SUBFOLDER)
    }
    pub fn openlibrary_downloads_dir(&self) -> PathBuf {
        self.downloads_dir().join(constants::OPENLIBRARY_SUBFOLDER)
    }
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
    pub fn layers_dir(&self) -> PathBuf {
        self.output_dir().join("layers")
    }
    pub fn output_basemap_dir(&self) -> PathBuf {
        self.output_dir().join("basemap")
    }
    pub fn install_dir(&self) -> PathBuf {
        self.root.join("install")
    }
    pub fn tileserver_staging_dir(&self) -> PathBuf {
        self.root.join("tileserver-staging")
    }
    pub fn tileserver_live_dir(&self) -> PathBuf {
        self.root.join("tileserver-live")
    }
    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }
    pub fn cancel_sentinel(&self) -> PathBuf {
        self.root.join("cancel.requested")
    }
}

/// Fixed, install-time assets the tileserver install operator needs beyond
/// anything a node carries (spec §4.7's `install` action), grounded in
/// `install/tileserver.py::OpenSiteTileserver`'s class-level asset paths.
/// These describe one deployment's static fixtures, not per-dataset data,
/// so they live in configuration rather than on a graph node.
#[derive(Clone)]
pub struct InstallAssets {
    pub basemap_src: PathBuf,
    pub sprites_src: PathBuf,
    pub fonts_github_url: String,
    pub coastline_process: PathBuf,
    pub coastline_config: PathBuf,
    pub omt_process: PathBuf,
    pub omt_config: PathBuf,
    pub bbox: String,
}

/// One build's ambient configuration (spec §5.2): assembled once at
/// startup from CLI flags layered over environment variables by the `cli`
/// crate, then handed to [`BuildEngine::new`] unchanged — there is no
/// global mutable config cell anywhere in this crate.
pub struct RunConfig {
    pub layout: FilesystemLayout,
    pub overwrite: bool,
    pub io_pool_size: Option<usize>,
    pub cpu_pool_size: Option<usize>,
    pub install_assets: Option<InstallAssets>,
    #[cfg(feature = "postgis")]
    pub store: StoreConfig,
    #[cfg(feature = "postgis")]
    pub qgis_python: PathBuf,
    #[cfg(feature = "postgis")]
    pub qgis_build_script: PathBuf,
}

/// One entry of the §6.6 control surface's `logs` field: a node's own log
/// line plus enough identity to place it without re-walking the graph.
#[derive(Serialize)]
pub struct LogLine {
    pub urn: Urn,
    pub node_name: String,
    pub action: String,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// The §6.6 control-surface snapshot: `build.nodes(last_log_index)` in the
/// spec's words. `next_index` is the `last_log_index` a caller should pass
/// on its next poll to only receive log lines appended since this call.
#[derive(Serialize)]
pub struct ProgressSnapshot {
    pub graph: serde_json::Value,
    pub logs: Vec<LogLine>,
    pub next_index: usize,
    pub done: bool,
}

/// Renders a [`ProgressSnapshot`] from the current graph state and a flat
/// log index shared across every node's `log` vec. `last_index` is the
/// index returned by the previous snapshot; `0` on the first call.
fn snapshot(graph: &Graph, last_index: usize) -> ProgressSnapshot {
    let mut all_logs: Vec<LogLine> = graph
        .all_nodes()
        .flat_map(|n| n.log.iter().map(move |entry| LogLine { urn: n.urn, node_name: n.name.clone(), action: entry.action.clone(), time: entry.time }))
        .collect();
    all_logs.sort_by_key(|l| l.time);

    let next_index = all_logs.len();
    let logs = all_logs.into_iter().skip(last_index).collect();
    let done = graph.all_nodes().all(|n| n.status.is_terminal());
    let graph_json = serde_json::to_value(graph.all_nodes().collect::<Vec<_>>()).unwrap_or(serde_json::Value::Null);

    ProgressSnapshot { graph: graph_json, logs, next_index, done }
}

/// Dispatches every scheduler-submitted node to the concrete operator its
/// `action` names (REDESIGN FLAGS §9's ambient `Operator` trait seam,
/// SPEC_FULL.md §4.7.1). One instance backs both the I/O and CPU pools —
/// `Action::is_io_bound` already decides which pool a node lands on, so the
/// dispatch body itself does not need to care which pool called it.
struct EngineRunner {
    layout: Arc<FilesystemLayout>,
    overwrite: bool,
    install_assets: Option<InstallAssets>,
    #[cfg(feature = "download")]
    fetch: operators::download::HttpFetch,
    #[cfg(feature = "postgis")]
    store: Arc<SpatialStore>,
    #[cfg(feature = "postgis")]
    qgis_python: PathBuf,
    #[cfg(feature = "postgis")]
    qgis_build_script: PathBuf,
}

impl EngineRunner {
    fn resolve_many(&self, node: &Node) -> BuildResult<Vec<String>> {
        Ok(node
            .input
            .as_many()
            .ok_or_else(|| BuildError::data(format!("{}: expected multiple inputs", node.name)))?
            .iter()
            .map(|p| self.layout.downloads_dir().join(p).to_string_lossy().into_owned())
            .collect())
    }

    fn run_download(&self, node: &Node) -> BuildResult<bool> {
        #[cfg(feature = "download")]
        {
            let url = node.input.as_single().ok_or_else(|| BuildError::data(format!("{}: download node has no url input", node.name)))?;
            let output = node.output.as_deref().ok_or_else(|| BuildError::data(format!("{}: download node has no output path", node.name)))?;
            let dest = self.layout.downloads_dir().join(output);
            operators::download::run(&self.fetch, url, &dest, self.overwrite)
        }
        #[cfg(not(feature = "download"))]
        {
            let _ = node;
            Err(BuildError::config("download operator requires the 'download' feature"))
        }
    }

    fn run_unzip(&self, node: &Node) -> BuildResult<bool> {
        let input = node.input.as_single().ok_or_else(|| BuildError::data(format!("{}: unzip node has no zip input", node.name)))?;
        let output = node.output.as_deref().ok_or_else(|| BuildError::data(format!("{}: unzip node has no output path", node.name)))?;
        let zip_path = self.layout.downloads_dir().join(input);
        let dest = self.layout.downloads_dir().join(output);

        if node.format.as_ref().map(|f| f.as_str()) == Some("SHP") {
            operators::unzip::run_shapefile(&zip_path, &dest, self.overwrite)
        } else {
            operators::unzip::run(&zip_path, &dest, self.overwrite)
        }
    }

    fn run_concatenate(&self, node: &Node) -> BuildResult<bool> {
        let inputs = self.resolve_many(node)?;
        let output = node.output.as_deref().ok_or_else(|| BuildError::data(format!("{}: concatenate node has no output path", node.name)))?;
        let dest = self.layout.downloads_dir().join(output);
        operators::concatenate::run(&inputs, &dest, self.overwrite)
    }

    fn run_run(&self, node: &Node) -> BuildResult<bool> {
        let input = node.input.as_single().ok_or_else(|| BuildError::data(format!("{}: run node has no input", node.name)))?;
        let output = node.output.as_deref().ok_or_else(|| BuildError::data(format!("{}: run node has no output path", node.name)))?;
        let input_path = self.layout.downloads_dir().join(input);
        let dest = self.layout.downloads_dir().join(output);

        let structure_file = match &node.custom_properties.structure {
            Some(structure) => {
                let path = self.layout.configs_dir().join(format!("{}.structure.json", node.name));
                let body = serde_json::to_vec(structure).map_err(|e| BuildError::data(e.to_string()))?;
                std::fs::write(&path, body).map_err(anyhow::Error::from)?;
                Some(path)
            }
            None => None,
        };
        operators::run::run(node.node_type, &input_path.to_string_lossy(), &dest, structure_file.as_deref(), self.overwrite)
    }

    fn run_install(&self, node: &Node) -> BuildResult<bool> {
        let assets = self
            .install_assets
            .as_ref()
            .ok_or_else(|| BuildError::config("install operator requires RunConfig::install_assets to be set"))?;
        let osm_pbf_name = node
            .custom_properties
            .osm
            .as_deref()
            .ok_or_else(|| BuildError::data(format!("{}: install node has no 'osm' custom property", node.name)))?;
        let osm_pbf = self.layout.osm_downloads_dir().join(osm_pbf_name);
        let basename = node.output.as_deref().unwrap_or(&node.name);

        let paths = operators::install::TileserverPaths {
            basemap_src: assets.basemap_src.clone(),
            basemap_dest: self.layout.tileserver_staging_dir().join("basemap"),
            sprites_src: assets.sprites_src.clone(),
            sprites_dest: self.layout.tileserver_staging_dir().join("sprites"),
            output_basemap_dir: self.layout.output_basemap_dir(),
            tileserver_data_dir: self.layout.tileserver_live_dir().join("data"),
            tileserver_output_dir: self.layout.tileserver_staging_dir(),
            fonts_dir: self.layout.tileserver_staging_dir().join("fonts"),
            fonts_github_url: assets.fonts_github_url.clone(),
            coastline_process: assets.coastline_process.clone(),
            coastline_config: assets.coastline_config.clone(),
            omt_process: assets.omt_process.clone(),
            omt_config: assets.omt_config.clone(),
            bbox: assets.bbox.clone(),
        };
        operators::install::install_tileserver(&paths, &osm_pbf, basename)
    }

    #[cfg(feature = "postgis")]
    fn run_import(&self, node: &Node) -> BuildResult<bool> {
        let registry = Registry::new(&self.store);
        operators::import::import(&self.store, &registry, node, &self.layout.downloads_dir())
    }

    #[cfg(feature = "postgis")]
    fn run_spatial(&self, node: &Node, action: Action) -> BuildResult<bool> {
        let registry = Registry::new(&self.store);
        let ops = operators::spatial::SpatialOps::new(&self.store);
        match action {
            Action::Buffer => ops.buffer(&registry, node),
            Action::Invert => ops.invert(&registry, node),
            Action::Distance => ops.distance(&registry, node),
            Action::Preprocess => ops.preprocess(&registry, node),
            Action::Amalgamate => ops.amalgamate(&registry, node),
            Action::Postprocess => ops.postprocess(&registry, node),
            Action::Clip => ops.clip(&registry, node),
            other => Err(BuildError::config(format!("run_spatial: not a spatial action ({other:?})"))),
        }
    }

    #[cfg(feature = "postgis")]
    fn run_output(&self, node: &Node) -> BuildResult<bool> {
        let registry = OutputRegistry::new(&self.store);
        let paths = operators::output_db::OutputPaths {
            layers_dir: &self.layout.layers_dir(),
            output_dir: &self.layout.output_dir(),
            qgis_python: &self.qgis_python,
            qgis_build_script: &self.qgis_build_script,
        };
        operators::output_db::dispatch(&self.store, &registry, node, &paths, self.overwrite)
    }
}

impl OperatorRunner for EngineRunner {
    fn run(&self, node: &Node, cancel: &CancellationToken) -> BuildResult<bool> {
        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        match node.action {
            None => Ok(true),
            Some(Action::Download) => self.run_download(node),
            Some(Action::Unzip) => self.run_unzip(node),
            Some(Action::Concatenate) => self.run_concatenate(node),
            Some(Action::Run) => self.run_run(node),
            Some(Action::Install) => self.run_install(node),
            #[cfg(feature = "postgis")]
            Some(Action::Import) => self.run_import(node),
            #[cfg(feature = "postgis")]
            Some(action @ (Action::Buffer | Action::Invert | Action::Distance | Action::Preprocess | Action::Amalgamate | Action::Postprocess | Action::Clip)) => {
                self.run_spatial(node, action)
            }
            #[cfg(feature = "postgis")]
            Some(Action::Output) => self.run_output(node),
            #[cfg(not(feature = "postgis"))]
            Some(other) => Err(BuildError::config(format!("{other:?} requires the 'postgis' feature"))),
        }
    }

    fn remote_size(&self, node: &Node) -> Option<u64> {
        #[cfg(feature = "download")]
        {
            if node.action == Some(Action::Download) {
                let url = node.input.as_single()?;
                return self.fetch.remote_size(url).ok().flatten();
            }
        }
        let _ = node;
        None
    }

    fn local_size(&self, node: &Node) -> Option<u64> {
        if node.action == Some(Action::Unzip) {
            let input = node.input.as_single()?;
            let path = self.layout.downloads_dir().join(input);
            return std::fs::metadata(path).ok().map(|m| m.len());
        }
        None
    }

    fn table_size(&self, node: &Node) -> Option<u64> {
        #[cfg(feature = "postgis")]
        {
            let table = node.input.as_single().or_else(|| node.output.as_deref())?;
            return self.store.table_size_bytes(table).ok().flatten();
        }
        #[cfg(not(feature = "postgis"))]
        {
            let _ = node;
            None
        }
    }
}

/// Top-level driver (spec's whole component inventory, C1-C8), grounded in
/// `original_source/opensite/opensite.py`'s `OpenSite.build()`: load every
/// configured dataset document into one graph, explode it into an
/// executable DAG, reconcile the registry against it, then run the
/// scheduler to completion.
pub struct BuildEngine {
    graph: Graph,
    layout: Arc<FilesystemLayout>,
    overwrite: bool,
    io_pool_size: Option<usize>,
    cpu_pool_size: Option<usize>,
    install_assets: Option<InstallAssets>,
    cancel: CancellationToken,
    #[cfg(feature = "postgis")]
    store: Arc<SpatialStore>,
    #[cfg(feature = "postgis")]
    qgis_python: PathBuf,
    #[cfg(feature = "postgis")]
    qgis_build_script: PathBuf,
}

impl BuildEngine {
    #[cfg(feature = "postgis")]
    pub fn new(config: RunConfig) -> BuildResult<Self> {
        let store = SpatialStore::connect(config.store)?;
        for dir in [config.layout.downloads_dir(), config.layout.osm_downloads_dir(), config.layout.openlibrary_downloads_dir(), config.layout.cache_dir(), config.layout.logs_dir(), config.layout.layers_dir(), config.layout.output_dir(), config.layout.install_dir(), config.layout.configs_dir()] {
            std::fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;
        }
        let sentinel = config.layout.cancel_sentinel();
        Ok(BuildEngine {
            graph: Graph::new(),
            layout: Arc::new(config.layout),
            overwrite: config.overwrite,
            io_pool_size: config.io_pool_size,
            cpu_pool_size: config.cpu_pool_size,
            install_assets: config.install_assets,
            cancel: CancellationToken::new(Some(sentinel)),
            store: Arc::new(store),
            qgis_python: config.qgis_python,
            qgis_build_script: config.qgis_build_script,
        })
    }

    #[cfg(not(feature = "postgis"))]
    pub fn new(config: RunConfig) -> BuildResult<Self> {
        for dir in [config.layout.downloads_dir(), config.layout.osm_downloads_dir(), config.layout.openlibrary_downloads_dir(), config.layout.cache_dir(), config.layout.logs_dir(), config.layout.layers_dir(), config.layout.output_dir(), config.layout.install_dir(), config.layout.configs_dir()] {
            std::fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;
        }
        let sentinel = config.layout.cancel_sentinel();
        Ok(BuildEngine {
            graph: Graph::new(),
            layout: Arc::new(config.layout),
            overwrite: config.overwrite,
            io_pool_size: config.io_pool_size,
            cpu_pool_size: config.cpu_pool_size,
            install_assets: config.install_assets,
            cancel: CancellationToken::new(Some(sentinel)),
        })
    }

    /// The token a caller hands to a control-surface `build.stop()` (spec
    /// §6.6) — cloning it out doesn't disturb the engine's own copy.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Loads one dataset document (spec §4.2) into the graph, honoring
    /// duplicate-`code` rejection across every previously loaded document.
    pub fn load_document(&mut self, loader: &mut config::ConfigLoader, source: &ConfigSource) -> BuildResult<Urn> {
        loader.load_into(&mut self.graph, source)
    }

    /// Binds a resource catalog's matching datasets onto placeholder leaves
    /// (spec §4.3), returning how many bindings were made.
    pub fn bind_catalog(&mut self, model: &catalog::CatalogModel, priority_formats: &[String]) -> usize {
        catalog::bind(&mut self.graph, model, priority_formats)
    }

    /// Runs every exploder pass (C4) in fixed order, turning the freshly
    /// loaded configuration tree into an executable DAG.
    pub fn explode(&mut self) -> BuildResult<()> {
        explode::explode(&mut self.graph)
    }

    /// Reconciles the registry against the exploded graph's declared
    /// outputs (spec §5.4), creating the core tables on first run.
    #[cfg(feature = "postgis")]
    pub fn sync_registry(&mut self) -> BuildResult<()> {
        let registry = Registry::new(&self.store);
        registry.init_core_tables()?;
        for branch in self.graph.branches.values() {
            registry.register_branch(&branch.code, &branch.hash, &branch.config)?;
        }
        registry.sync()
    }

    /// Runs the scheduler to completion against the exploded graph,
    /// reporting a [`ProgressSnapshot`] to `on_progress` after every sweep
    /// that submits or completes work (spec §6.6's polling contract, driven
    /// here from a push callback instead).
    pub fn run(&mut self, mut on_progress: impl FnMut(ProgressSnapshot)) -> BuildResult<()> {
        let pool_config = match (self.io_pool_size, self.cpu_pool_size) {
            (Some(io), Some(cpu)) => SchedulerConfig::fixed(io, cpu),
            _ => SchedulerConfig::default(),
        };
        let scheduler = Scheduler::new(pool_config, self.cancel.clone());
        #[cfg(feature = "postgis")]
        let scheduler = {
            let store = self.store.clone();
            scheduler.with_cancel_hook(move || {
                let _ = store.cancel_own_queries();
            })
        };

        let runner: Arc<dyn OperatorRunner> = Arc::new(EngineRunner {
            layout: self.layout.clone(),
            overwrite: self.overwrite,
            install_assets: self.install_assets.clone(),
            #[cfg(feature = "download")]
            fetch: operators::download::HttpFetch::new()?,
            #[cfg(feature = "postgis")]
            store: self.store.clone(),
            #[cfg(feature = "postgis")]
            qgis_python: self.qgis_python.clone(),
            #[cfg(feature = "postgis")]
            qgis_build_script: self.qgis_build_script.clone(),
        });

        let mut last_index = 0usize;
        let graph = &mut self.graph;
        let result = scheduler.run(graph, runner.clone(), runner, |g| {
            let snap = snapshot(g, last_index);
            last_index = snap.next_index;
            on_progress(snap);
        });

        on_progress(snapshot(graph, last_index));
        result
    }

    /// A one-shot snapshot outside of `run`'s progress callback — the
    /// §6.6 control surface's `build.nodes(last_log_index)` called directly.
    pub fn nodes(&self, last_log_index: usize) -> ProgressSnapshot {
        snapshot(&self.graph, last_log_index)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Every node blocking completion: not yet `Processed`/`Failed` and not
    /// currently in flight. Useful for a CLI's final-status report after a
    /// `BuildError::Stall`.
    pub fn unfinished_nodes(&self) -> Vec<&Node> {
        self.graph.all_nodes().filter(|n| n.status != NodeStatus::Processed).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NewNode;
    use crate::node::NodeInput;

    #[test]
    fn filesystem_layout_derives_every_path_from_one_root() {
        let layout = FilesystemLayout::new("/tmp/terraflow-build");
        assert_eq!(layout.osm_downloads_dir(), PathBuf::from("/tmp/terraflow-build/downloads/osm"));
        assert_eq!(layout.layers_dir(), PathBuf::from("/tmp/terraflow-build/output/layers"));
        assert_eq!(layout.cancel_sentinel(), PathBuf::from("/tmp/terraflow-build/cancel.requested"));
    }

    #[test]
    fn snapshot_reports_done_once_every_node_is_terminal() {
        let mut g = Graph::new();
        let urn = g.create_node(NewNode { name: "leaf".into(), action: None, input: NodeInput::None, ..Default::default() });
        g.node_mut(g.root).unwrap().children.push(urn);
        g.node_mut(urn).unwrap().parent = Some(g.root);

        let snap = snapshot(&g, 0);
        assert!(!snap.done);

        g.node_mut(urn).unwrap().status = NodeStatus::Processed;
        g.node_mut(urn).unwrap().add_log("processed");
        let snap = snapshot(&g, 0);
        assert!(snap.done);
        assert_eq!(snap.logs.len(), 1);
        assert_eq!(snap.next_index, 1);

        let snap = snapshot(&g, snap.next_index);
        assert!(snap.logs.is_empty());
    }
}
