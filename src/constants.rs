//! Fixed vocabulary shared across the exploder, scheduler, and operators
//! (spec §6.1/§6.4/§6.5), grounded in the original's `constants.py`.

use crate::node::Format;

pub const DATABASE_GENERAL_PREFIX: &str = "terraflow_";
pub const DATABASE_BASE_PREFIX: &str = "_terraflow_";

pub const OSM_SUBFOLDER: &str = "osm";
pub const OPENLIBRARY_SUBFOLDER: &str = "openlibrary";

/// File extension expected when downloading a given external source format.
pub fn file_extension_for(format: &Format) -> &'static str {
    match format.as_str() {
        Format::GPKG => "gpkg",
        Format::ARCGIS_REST => "geojson",
        Format::GEOJSON => "geojson",
        Format::WFS => "gpkg",
        "KML" => "geojson",
        "SHP" => "shp",
        Format::OSM_YAML => "yml",
        Format::OPENLIBRARY_YAML => "yml",
        Format::OPENSITE_YAML => "yml",
        _ => "dat",
    }
}

/// Download-priority order for the scheduler's ready-batch ordering
/// (spec §4.6 item 2). Index position is the priority weight.
pub fn downloads_priority() -> &'static [&'static str] {
    &[Format::OSM, Format::OPENSITE_YAML, Format::OSM_YAML]
}

pub fn is_osm_related(format: &Format) -> bool {
    matches!(format.as_str(), Format::OSM | Format::OSM_YAML)
}

/// Formats whose §6.1 implication ("`qgis|shp|geojson` imply `gpkg`")
/// `config::expand_implied_formats` expands a branch's `outputformats`
/// with at load time, before C4 pass 12 builds the per-dataset chain.
pub const OUTPUT_FORMATS_IMPLYING_GPKG: &[&str] = &["qgis", "shp", "geojson"];
/// Formats built once per output branch rather than once per dataset
/// (spec §4.4 pass 12's "wrap with global formats"). `json` is not itself
/// a user-facing `outputformats` value — it's emitted alongside whichever
/// of these are requested, since both "require json data file".
pub const GLOBAL_OUTPUT_FORMATS: &[&str] = &["web", "qgis"];

/// Default CRS of all internal spatial-store tables, and the CRS exported
/// data is reprojected into on the way out (spec §5.2).
pub const CRS_DEFAULT: &str = "EPSG:27700";
pub const CRS_OUTPUT: &str = "EPSG:4326";

/// Default source CRS assumed for a GeoJSON import that carries no explicit
/// `crs` member, per GeoJSON's own spec default (RFC 7946 §4).
pub const CRS_GEOJSON: &str = "EPSG:4326";

/// Physical table names backing the Registry (C5), Output Registry (C8),
/// and the spatial store's grid/clipping/boundary fixtures (spec §5),
/// grounded in `original_source/opensite/constants.py`'s
/// `OPENSITE_*` class attributes.
pub const TABLE_BRANCH: &str = "_terraflow_branch";
pub const TABLE_REGISTRY: &str = "_terraflow_registry";
pub const TABLE_OUTPUTS: &str = "_terraflow_outputs";
pub const TABLE_CLIPPING_MASTER: &str = "_terraflow_clippingmaster";
pub const TABLE_GRID_PROCESSING: &str = "_terraflow_gridprocessing";
pub const TABLE_GRID_BUFFERED_EDGES: &str = "_terraflow_gridbufferededges";
pub const TABLE_GRID_OUTPUT: &str = "_terraflow_gridoutput";
pub const TABLE_OSM_BOUNDARIES: &str = "_terraflow_osmboundaries";

/// Grid cell size, in the default CRS's linear unit (metres for EPSG:27700),
/// for the processing grid (`ST_SquareGrid` over the clipping master extent)
/// and the coarser output grid used only to improve mbtiles tiling quality
/// (spec §5.5), grounded in `constants.py`'s `GRID_PROCESSING_SPACING`/
/// `GRID_OUTPUT_SPACING`.
pub const GRID_PROCESSING_SPACING: f64 = 5000.0;
pub const GRID_OUTPUT_SPACING: f64 = 20000.0;

/// Width, in metres, of the buffer drawn around each processing-grid
/// square's boundary to build the buffered-edges grid `postprocess` uses to
/// tell a seam candidate from an island (spec §5.5).
pub const GRID_BUFFERED_EDGE_WIDTH: f64 = 0.01;

/// Tables `Registry::sync` must never drop even though they don't carry the
/// `DATABASE_GENERAL_PREFIX`/`DATABASE_BASE_PREFIX` the rest of the sweep
/// keys off of (spec §5.4's `sync` contract).
pub fn protected_tables() -> &'static [&'static str] {
    &[
        TABLE_REGISTRY,
        TABLE_BRANCH,
        TABLE_OUTPUTS,
        TABLE_CLIPPING_MASTER,
        TABLE_GRID_PROCESSING,
        TABLE_GRID_BUFFERED_EDGES,
        TABLE_GRID_OUTPUT,
        TABLE_OSM_BOUNDARIES,
        "spatial_ref_sys",
        "geography_columns",
        "geometry_columns",
        "raster_columns",
        "raster_overview",
    ]
}
