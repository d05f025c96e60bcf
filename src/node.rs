use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Graph-local node identity. Monotonically assigned at creation, never
/// reused even after `delete_node` tombstones a slot (see `Graph::delete_node`).
pub type Urn = u32;

/// Content identity shared by logically equivalent nodes across branches.
/// Assigned in explode pass 15 (global URN assignment) once two or more
/// nodes resolve to the same `output`.
pub type GlobalUrn = uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Root,
    Branch,
    Source,
    Group,
    Process,
    Download,
    OsmDownloader,
    OsmRunner,
    OsmConcatenator,
    OpenlibraryRunner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Download,
    Unzip,
    Concatenate,
    Run,
    Import,
    Invert,
    Preprocess,
    Buffer,
    Distance,
    Amalgamate,
    Postprocess,
    Clip,
    Output,
}

impl Action {
    /// §4.6: downloads/unzip/concatenate run on the I/O pool; everything
    /// else that carries an action runs on the CPU pool.
    pub fn is_io_bound(self) -> bool {
        matches!(self, Action::Install | Action::Download | Action::Unzip | Action::Concatenate)
    }

    pub fn is_cpu_bound(self) -> bool {
        !self.is_io_bound()
    }

    /// §8.1 "No action without identity": the set of actions that must carry
    /// a non-empty `output` before scheduling begins.
    pub fn is_terminal_producing(self) -> bool {
        !matches!(self, Action::Install)
    }
}

/// A format token. Kept as a thin newtype over `String` rather than a closed
/// enum because the vocabulary spans both external-source tokens (`GPKG`,
/// `WFS`, ...) and output-shape tokens (`gpkg`, `mbtiles`, ...), and new
/// vendor formats show up without a code change to the graph primitives —
/// only to the `Fetch`/`Export` capability that interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Format(pub String);

impl Format {
    pub const GPKG: &'static str = "GPKG";
    pub const GEOJSON: &'static str = "GeoJSON";
    pub const WFS: &'static str = "WFS";
    pub const ARCGIS_REST: &'static str = "ArcGIS GeoServices REST API";
    pub const OSM: &'static str = "OSM";
    pub const OSM_YAML: &'static str = "OSM YAML";
    pub const OPENLIBRARY_YAML: &'static str = "Open Library YAML";
    pub const OPENSITE_YAML: &'static str = "Open Site YAML";

    pub const OUT_GPKG: &'static str = "gpkg";
    pub const OUT_SHP: &'static str = "shp";
    pub const OUT_GEOJSON: &'static str = "geojson";
    pub const OUT_MBTILES: &'static str = "mbtiles";
    pub const OUT_QGIS: &'static str = "qgis";
    pub const OUT_WEB: &'static str = "web";
    pub const OUT_JSON: &'static str = "json";
    pub const TILESERVER: &'static str = "tileserver";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_zip_url(url: &str) -> bool {
        url.trim_end_matches(['/']).to_ascii_lowercase().ends_with(".zip")
    }
}

impl From<&str> for Format {
    fn from(s: &str) -> Self {
        Format(s.to_string())
    }
}

impl From<String> for Format {
    fn from(s: String) -> Self {
        Format(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Unprocessed,
    Processing,
    Processed,
    Failed,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Processed | NodeStatus::Failed)
    }

    /// Progress monotonicity (§8.1): `unprocessed < processing < {processed, failed}`.
    /// Returns `false` for any backward or sideways-into-a-lower-rank move.
    pub fn can_advance_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;
        match (self, next) {
            (Unprocessed, Processing) => true,
            (Unprocessed, Processed) => true, // no-action nodes skip `processing`
            (Processing, Processed) | (Processing, Failed) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

/// One input reference: a single table/URL/path, or an ordered sequence of
/// table identifiers (amalgamation/invert inputs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeInput {
    Single(String),
    Many(Vec<String>),
    None,
}

impl Default for NodeInput {
    fn default() -> Self {
        NodeInput::None
    }
}

impl NodeInput {
    pub fn as_single(&self) -> Option<&str> {
        match self {
            NodeInput::Single(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_many(&self) -> Option<&[String]> {
        match self {
            NodeInput::Many(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, NodeInput::None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub field: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreprocessKind {
    ClosedLinesToPolygons,
}

/// Opaque attribute bag. Holds the loosely-typed fields named in spec §3.1:
/// `branch`, `buffer`, `distance`, `filter`, `preprocess`, `clip`,
/// `snapgrid`, `osm`, `ckan`, `yml`, `hash`, `fallback`, `structure`, plus
/// the document-local uniqueness id (§6.1.1 supplement) and a raw scalar
/// `value` for leaf nodes mirrored from a configuration document (§4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomProperties {
    pub branch: Option<String>,
    pub buffer: Option<String>,
    pub distance: Option<String>,
    pub filter: Option<FilterSpec>,
    pub preprocess: Option<PreprocessKind>,
    pub clip: Option<Vec<String>>,
    pub snapgrid: Option<f64>,
    pub osm: Option<String>,
    pub ckan: Option<String>,
    pub yml: Option<String>,
    pub hash: Option<String>,
    pub fallback: Option<String>,
    pub structure: Option<Value>,
    pub value: Option<Value>,
    pub doc_id: Option<String>,
    /// Catch-all for keys not promoted to a typed field above, so a property
    /// search (`find_nodes_by_props`) can still match arbitrary keys.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CustomProperties {
    pub fn with_branch(branch: impl Into<String>) -> Self {
        CustomProperties { branch: Some(branch.into()), ..Default::default() }
    }

    /// Checks both the `buffer` and `distance` slots are not simultaneously
    /// set. The original source occasionally mixes the two on one node; per
    /// the Open Question in spec §9 we fail loudly rather than pick one.
    pub fn buffer_distance_conflict(&self) -> bool {
        self.buffer.is_some() && self.distance.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub action: String,
    pub time: DateTime<Utc>,
}

/// A single DAG node (spec §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub urn: Urn,
    pub global_urn: Option<GlobalUrn>,
    pub name: String,
    pub title: Option<String>,
    pub node_type: NodeType,
    pub action: Option<Action>,
    pub format: Option<Format>,
    pub input: NodeInput,
    pub output: Option<String>,
    pub style: Option<Value>,
    pub custom_properties: CustomProperties,
    pub status: NodeStatus,
    pub log: Vec<LogEntry>,

    pub parent: Option<Urn>,
    pub children: Vec<Urn>,

    /// Cached remote file size for `download` nodes, populated by the
    /// scheduler's bulk pre-fetch phase (spec §4.6, "Size queries are
    /// issued in parallel, cached on the node"). `None` means "not yet
    /// fetched"; distinct from `Some(0)`/"unknown treated as 0".
    #[serde(skip)]
    pub cached_remote_size: Option<u64>,
    #[serde(skip)]
    pub cached_local_size: Option<u64>,
    #[serde(skip)]
    pub cached_table_size: Option<u64>,
}

impl Node {
    /// Children URNs, in insertion order — this *is* the dependency list
    /// (spec §3.1: "`dependencies` is always `[c.urn for c in children]`").
    pub fn dependencies(&self) -> &[Urn] {
        &self.children
    }

    pub fn add_log(&mut self, action: impl Into<String>) {
        self.log.push(LogEntry { action: action.into(), time: Utc::now() });
    }

    pub fn is_terminal_node(&self) -> bool {
        self.children.is_empty()
    }
}
