//! Thin invocation surface for the `terraflow` build engine (spec §6.6's
//! control surface, `build start`/`build stop`/`build nodes`) — flags
//! parsed once into a `Cli`/`*Args` split, no business logic here, only
//! wiring into `terraflow::{BuildEngine, RunConfig}`.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use terraflow::config::{ConfigLoader, ConfigSource};
use terraflow::{BuildEngine, FilesystemLayout, RunConfig};

#[derive(Parser)]
#[command(name = "terraflow", about = "Geospatial ETL build engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// The C1-C8 pipeline, driven to completion or failure (`build start`).
    Build {
        #[command(subcommand)]
        action: BuildAction,
    },
}

#[derive(Subcommand)]
enum BuildAction {
    Start(StartArgs),
    /// Cooperatively requests a running build under `--root` to stop.
    Stop(RootArgs),
    /// Prints the latest progress snapshot written under `--root`.
    Nodes(NodesArgs),
}

#[derive(Args)]
struct RootArgs {
    /// The build's working directory (spec §6.4's filesystem layout root).
    #[arg(long)]
    root: PathBuf,
}

#[derive(Args)]
struct NodesArgs {
    #[arg(long)]
    root: PathBuf,
    /// Only print log lines at or after this index (the `next_index` a
    /// previous `nodes` call returned).
    #[arg(long, default_value_t = 0)]
    since: usize,
}

#[derive(Args)]
struct StartArgs {
    #[arg(long)]
    root: PathBuf,
    /// One or more YAML dataset documents to load (spec §4.2); repeatable.
    #[arg(long = "config", required = true)]
    configs: Vec<PathBuf>,
    /// Shared defaults layered underneath every document.
    #[arg(long)]
    defaults: Option<PathBuf>,
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    io_pool_size: Option<usize>,
    #[arg(long)]
    cpu_pool_size: Option<usize>,
    #[cfg(feature = "postgis")]
    #[arg(long, default_value = "qgis")]
    qgis_python: PathBuf,
    #[cfg(feature = "postgis")]
    #[arg(long, default_value = "build_qgis_project.py")]
    qgis_build_script: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Build { action } => match action {
            BuildAction::Start(args) => run_start(args),
            BuildAction::Stop(args) => run_stop(args),
            BuildAction::Nodes(args) => run_nodes(args),
        },
    }
}

fn run_start(args: StartArgs) -> anyhow::Result<()> {
    let layout = FilesystemLayout::new(args.root.clone());
    let progress_path = layout.logs_dir().join("progress.json");

    let defaults = match &args.defaults {
        Some(path) => read_yaml(path)?,
        None => serde_json::Value::Null,
    };
    let overrides = serde_json::Value::Null;

    let config = RunConfig {
        layout,
        overwrite: args.overwrite,
        io_pool_size: args.io_pool_size,
        cpu_pool_size: args.cpu_pool_size,
        install_assets: None,
        #[cfg(feature = "postgis")]
        store: terraflow::store::StoreConfig::from_env(),
        #[cfg(feature = "postgis")]
        qgis_python: args.qgis_python,
        #[cfg(feature = "postgis")]
        qgis_build_script: args.qgis_build_script,
    };

    let mut engine = BuildEngine::new(config).context("initializing build engine")?;

    let mut loader = ConfigLoader::new(defaults, overrides);
    for path in &args.configs {
        engine.load_document(&mut loader, &ConfigSource::Local(path.clone())).with_context(|| format!("loading {}", path.display()))?;
    }

    engine.explode().context("exploding graph")?;
    #[cfg(feature = "postgis")]
    engine.sync_registry().context("syncing registry")?;

    std::fs::create_dir_all(progress_path.parent().expect("progress.json always has a parent")).context("creating logs directory")?;

    let mut accumulated_logs = Vec::new();
    let result = engine.run(|snapshot| {
        log::info!("progress: {} log lines, done={}", snapshot.logs.len(), snapshot.done);
        accumulated_logs.extend(snapshot.logs);
        let full = serde_json::json!({
            "graph": &snapshot.graph,
            "logs": &accumulated_logs,
            "next_index": snapshot.next_index,
            "done": snapshot.done,
        });
        if let Ok(body) = serde_json::to_vec_pretty(&full) {
            let _ = std::fs::write(&progress_path, body);
        }
    });

    match result {
        Ok(()) => {
            log::info!("build finished");
            Ok(())
        }
        Err(err) => {
            for node in engine.unfinished_nodes() {
                log::error!("unfinished: {} ({:?})", node.name, node.status);
            }
            Err(anyhow::anyhow!(err))
        }
    }
}

fn run_stop(args: RootArgs) -> anyhow::Result<()> {
    let layout = FilesystemLayout::new(args.root);
    let sentinel = layout.cancel_sentinel();
    std::fs::create_dir_all(sentinel.parent().expect("cancel sentinel always has a parent")).context("creating build root")?;
    std::fs::write(&sentinel, b"stop").with_context(|| format!("writing {}", sentinel.display()))?;
    log::info!("requested stop via {}", sentinel.display());
    Ok(())
}

fn run_nodes(args: NodesArgs) -> anyhow::Result<()> {
    let layout = FilesystemLayout::new(args.root);
    let path = layout.logs_dir().join("progress.json");
    let body = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let mut doc: serde_json::Value = serde_json::from_str(&body).with_context(|| format!("parsing {}", path.display()))?;

    if let Some(logs) = doc.get_mut("logs").and_then(|v| v.as_array_mut()) {
        let kept: Vec<serde_json::Value> = logs.drain(..).skip(args.since).collect();
        *logs = kept;
    }

    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn read_yaml(path: &PathBuf) -> anyhow::Result<serde_json::Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    serde_json::to_value(value).context("converting YAML defaults to JSON")
}
