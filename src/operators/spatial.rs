//! Spatial operators (`Action::{Buffer,Invert,Distance,Preprocess,Amalgamate,
//! Postprocess,Clip}`, spec §4.7) and the grid/clipping fixtures they share,
//! grounded in `processing/spatial.py::OpenSiteSpatial`. Every CREATE TABLE
//! here is a direct translation of that module's `sql.SQL`-built statements;
//! the grid-square loop and per-statement try/except are replaced by one
//! `?`-propagating function body, and `PROCESSINGGRID_SQUARE_IDS`'s module
//! global becomes a `Mutex`-guarded cache on `SpatialOps`.

#![cfg(feature = "postgis")]

use parking_lot::Mutex;

use crate::constants::{
    CRS_DEFAULT, CRS_OUTPUT, GRID_BUFFERED_EDGE_WIDTH, GRID_OUTPUT_SPACING, GRID_PROCESSING_SPACING, TABLE_CLIPPING_MASTER,
    TABLE_GRID_BUFFERED_EDGES, TABLE_GRID_OUTPUT, TABLE_GRID_PROCESSING, TABLE_OSM_BOUNDARIES,
};
use crate::error::BuildResult;
use crate::node::Node;
use crate::operators::{require_many_input, require_output, require_single_input, OperatorResult};
use crate::registry::Registry;
use crate::store::{Ident, SpatialStore};

fn crs_default_number() -> &'static str {
    CRS_DEFAULT.trim_start_matches("EPSG:")
}

fn crs_output_number() -> &'static str {
    CRS_OUTPUT.trim_start_matches("EPSG:")
}

/// Parses a resolved-math string (spec §4.2's `buffer`/`distance` custom
/// properties) as a plain number before it's interpolated into a CREATE
/// TABLE statement — these values can't go through a bind parameter (DDL),
/// so re-rendering a validated `f64` is the safe analogue of `sql.Literal`.
fn numeric_literal(raw: &str, field: &str) -> BuildResult<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| crate::error::BuildError::data(format!("'{field}' value '{raw}' is not numeric")))
}

pub struct SpatialOps<'a> {
    store: &'a SpatialStore,
    processing_grid_square_ids: Mutex<Option<Vec<i32>>>,
}

impl<'a> SpatialOps<'a> {
    pub fn new(store: &'a SpatialStore) -> Self {
        SpatialOps { store, processing_grid_square_ids: Mutex::new(None) }
    }

    /// Imports and unions the clipping master polygon file into
    /// `TABLE_CLIPPING_MASTER`, if not already present.
    pub fn import_clipping_master(&self, clipping_master_file: &str) -> BuildResult<bool> {
        if self.store.table_exists(TABLE_CLIPPING_MASTER)? {
            return Ok(true);
        }

        let temp_table = "tmp_clippingmaster_import";
        self.store.drop_table(temp_table)?;
        self.store.import_spatial_data(clipping_master_file, temp_table, &[])?;

        let clip = Ident(TABLE_CLIPPING_MASTER);
        let clip_idx = Ident(&format!("{TABLE_CLIPPING_MASTER}_idx"));
        let temp = Ident(temp_table);
        self.store.batch_execute(&format!(
            "CREATE TABLE {clip} (geom GEOMETRY(MultiPolygon, {crs}));
             INSERT INTO {clip} SELECT ST_Union(geom) FROM {temp};
             CREATE INDEX {clip_idx} ON {clip} USING GIST (geom);",
            crs = crs_default_number(),
        ))?;
        self.store.drop_table(temp_table)?;
        Ok(true)
    }

    /// Creates `TABLE_GRID_PROCESSING`: square cells over the clipping
    /// master's extent, trimmed to cells that intersect it. Must run before
    /// any grid-square-indexed operator (`preprocess`/`amalgamate`).
    pub fn create_processing_grid(&self, clipping_master_file: &str) -> BuildResult<bool> {
        self.import_clipping_master(clipping_master_file)?;

        if self.store.table_exists(TABLE_GRID_PROCESSING)? {
            self.get_processing_grid_square_ids()?;
            return Ok(true);
        }

        let grid = Ident(TABLE_GRID_PROCESSING);
        let grid_idx = Ident(&format!("{TABLE_GRID_PROCESSING}_idx"));
        let clip = Ident(TABLE_CLIPPING_MASTER);
        self.store.batch_execute(&format!(
            "CREATE TABLE {grid} AS
             SELECT (ST_SquareGrid({spacing}, ST_SetSRID(extent_geom, {crs}))).geom::geometry(Polygon, {crs}) AS geom
             FROM (SELECT ST_Extent(geom)::geometry AS extent_geom FROM {clip}) AS sub;
             ALTER TABLE {grid} ADD COLUMN id INTEGER PRIMARY KEY GENERATED ALWAYS AS IDENTITY;
             DELETE FROM {grid} g WHERE NOT EXISTS (SELECT 1 FROM {clip} c WHERE ST_Intersects(g.geom, c.geom));
             CREATE INDEX {grid_idx} ON {grid} USING GIST (geom);",
            spacing = GRID_PROCESSING_SPACING,
            crs = crs_default_number(),
        ))?;
        self.get_processing_grid_square_ids()?;
        Ok(true)
    }

    /// Creates `TABLE_GRID_BUFFERED_EDGES`: each processing-grid cell's
    /// boundary buffered outward, used by `postprocess` to distinguish a
    /// seam (touches a grid edge) from an island (doesn't).
    pub fn create_processing_grid_buffered_edges(&self, clipping_master_file: &str) -> BuildResult<bool> {
        if !self.store.table_exists(TABLE_GRID_PROCESSING)? {
            self.create_processing_grid(clipping_master_file)?;
        }
        if self.store.table_exists(TABLE_GRID_BUFFERED_EDGES)? {
            return Ok(true);
        }

        let grid = Ident(TABLE_GRID_PROCESSING);
        let edges = Ident(TABLE_GRID_BUFFERED_EDGES);
        let edges_idx = Ident(&format!("{TABLE_GRID_BUFFERED_EDGES}_idx"));
        self.store.batch_execute(&format!(
            "CREATE TABLE {edges} AS SELECT ST_Buffer(ST_Boundary(geom), {width})::geometry(Polygon, {crs}) AS geom FROM {grid};
             CREATE INDEX {edges_idx} ON {edges} USING GIST (geom);",
            width = GRID_BUFFERED_EDGE_WIDTH,
            crs = crs_default_number(),
        ))?;
        Ok(true)
    }

    /// Creates `TABLE_GRID_OUTPUT`: a coarser grid transformed through
    /// EPSG:3857 so `mbtiles` export can gridify large layers before tiling
    /// (spec §5.5; only ever read by the mbtiles exporter).
    pub fn create_output_grid(&self) -> BuildResult<bool> {
        if self.store.table_exists(TABLE_GRID_OUTPUT)? {
            return Ok(true);
        }

        let grid = Ident(TABLE_GRID_OUTPUT);
        let grid_idx = Ident(&format!("{TABLE_GRID_OUTPUT}_idx"));
        let clip = Ident(TABLE_CLIPPING_MASTER);
        self.store.batch_execute(&format!(
            "CREATE TABLE {grid} AS
             SELECT row_number() OVER () AS id, sub.geom
             FROM (
                SELECT ST_Transform((ST_SquareGrid({spacing}, ST_Transform(geom, 3857))).geom, {crs}) AS geom
                FROM {clip}
             ) sub;
             ALTER TABLE {grid} ADD PRIMARY KEY (id);
             DELETE FROM {grid} g WHERE NOT EXISTS (SELECT 1 FROM {clip} c WHERE ST_Intersects(g.geom, c.geom));
             CREATE INDEX {grid_idx} ON {grid} USING GIST (geom);",
            spacing = GRID_OUTPUT_SPACING,
            crs = crs_default_number(),
        ))?;
        Ok(true)
    }

    /// Cached list of processing-grid cell ids, populated on first access.
    pub fn get_processing_grid_square_ids(&self) -> BuildResult<Vec<i32>> {
        let mut cache = self.processing_grid_square_ids.lock();
        if let Some(ids) = cache.as_ref() {
            return Ok(ids.clone());
        }
        if !self.store.table_exists(TABLE_GRID_PROCESSING)? {
            return Err(crate::error::BuildError::data("processing grid does not exist, unable to retrieve grid square ids"));
        }
        let rows = self.store.fetch_all(&format!("SELECT id FROM {}", Ident(TABLE_GRID_PROCESSING)), &[])?;
        let ids: Vec<i32> = rows.iter().map(|r| r.get("id")).collect();
        *cache = Some(ids.clone());
        Ok(ids)
    }

    /// Adds a constant-width buffer around every geometry (spec §4.7's
    /// `buffer` stage, always applied before grid splitting). Hedgerow
    /// polygons are buffered as their boundary line rather than their area,
    /// matching the original's `hedgerows--` name-based special case.
    pub fn buffer(&self, registry: &Registry, node: &Node) -> OperatorResult {
        let output = require_output(node)?;
        if self.store.table_exists(output)? {
            return Ok(true);
        }
        let input = require_single_input(node)?;
        let width = node
            .custom_properties
            .buffer
            .as_deref()
            .ok_or_else(|| crate::error::BuildError::data(format!("{}: missing 'buffer' field", node.name)))?;
        let width = numeric_literal(width, "buffer")?;

        let out = Ident(output);
        let out_idx = Ident(&format!("{output}_idx"));
        let inp = Ident(input);

        let create = if node.name.contains("hedgerows--") {
            format!(
                "CREATE TABLE {out} AS
                 (SELECT ST_Buffer(geom, {width}) geom FROM {inp} WHERE ST_Dimension(geom) = 1)
                 UNION ALL
                 (SELECT ST_Buffer(ST_Boundary(geom), {width}) geom FROM {inp} WHERE ST_Dimension(geom) = 2)"
            )
        } else {
            format!("CREATE TABLE {out} AS SELECT ST_Buffer(geom, {width}) geom FROM {inp}")
        };

        self.store.batch_execute(&create)?;
        self.store.batch_execute(&format!("CREATE INDEX {out_idx} ON {out} USING GIST (geom)"))?;
        self.store.add_table_comment(output, &node.name)?;
        finish(registry, output)
    }

    /// Subtracts the dataset from the clipping master within each
    /// processing-grid square (spec §4.7's `invert`, used for "everything
    /// except X" exclusion datasets).
    pub fn invert(&self, registry: &Registry, node: &Node) -> OperatorResult {
        let output = require_output(node)?;
        if self.store.table_exists(output)? {
            return Ok(true);
        }
        let input = require_single_input(node)?;

        let out = Ident(output);
        let out_idx = Ident(&format!("{output}_idx"));
        let inp = Ident(input);
        let grid = Ident(TABLE_GRID_PROCESSING);
        let clip = Ident(TABLE_CLIPPING_MASTER);

        self.store.batch_execute(&format!(
            "CREATE TABLE {out} AS
             SELECT m.id,
                (ST_Dump(
                    ST_Difference(
                        ST_Intersection(m.geom, clip.geom),
                        COALESCE(sub.geom_to_subtract, ST_GeomFromText('POLYGON EMPTY', {crs}))
                    )
                )).geom AS geom
             FROM {grid} m
             INNER JOIN {clip} clip ON ST_Intersects(m.geom, clip.geom)
             LEFT JOIN LATERAL (
                SELECT ST_Union(i.geom) AS geom_to_subtract FROM {inp} i WHERE ST_Intersects(i.geom, m.geom)
             ) sub ON TRUE;
             CREATE INDEX {out_idx} ON {out} USING GIST (geom);",
            crs = crs_default_number(),
        ))?;
        self.store.add_table_comment(output, &node.name)?;
        finish(registry, output)
    }

    /// Excludes everything within `distance` of the dataset, keeping only
    /// the remainder of the clipping master (spec §4.7's `distance`).
    pub fn distance(&self, registry: &Registry, node: &Node) -> OperatorResult {
        let output = require_output(node)?;
        if self.store.table_exists(output)? {
            return Ok(true);
        }
        let input = require_single_input(node)?;
        let distance = node
            .custom_properties
            .distance
            .as_deref()
            .ok_or_else(|| crate::error::BuildError::data(format!("{}: missing 'distance' field", node.name)))?;
        let distance = numeric_literal(distance, "distance")?;

        let out = Ident(output);
        let out_idx = Ident(&format!("{output}_idx"));
        let inp = Ident(input);
        let clip = Ident(TABLE_CLIPPING_MASTER);

        self.store.batch_execute(&format!(
            "CREATE TABLE {out} AS
             WITH exclusion AS (SELECT ST_Union(ST_Buffer(geom, {distance})) AS geom FROM {inp})
             SELECT ROW_NUMBER() OVER () AS id, sub.geom::geometry(MultiPolygon) AS geom
             FROM (
                SELECT ST_Multi(ST_Difference(cm.geom, ex.geom)) AS geom FROM {clip} cm CROSS JOIN exclusion ex
             ) sub
             WHERE NOT ST_IsEmpty(sub.geom);
             CREATE INDEX {out_idx} ON {out} USING GIST (geom);",
        ))?;
        self.store.add_table_comment(output, &node.name)?;
        finish(registry, output)
    }

    /// Homogenizes a dataset to single polygons and splits it into the
    /// processing grid, one square at a time (spec §4.7's `preprocess`).
    /// `snapgrid`, when set, snaps vertices to that spacing before dumping —
    /// the original's workaround for sources whose geometry is too precise
    /// for `ST_Union` to handle efficiently at grid scale.
    pub fn preprocess(&self, registry: &Registry, node: &Node) -> OperatorResult {
        let output = require_output(node)?;
        if self.store.table_exists(output)? {
            return Ok(true);
        }
        if !self.store.table_exists(TABLE_GRID_PROCESSING)? {
            return Err(crate::error::BuildError::data("processing grid missing, call create_processing_grid first"));
        }
        let input = require_single_input(node)?;
        let gridsquare_ids = self.get_processing_grid_square_ids()?;

        let scratch1 = format!("tmp_1_{output}_{}", node.urn);
        let scratch2 = format!("tmp_2_{output}_{}", node.urn);
        self.store.drop_table(&scratch1)?;
        self.store.drop_table(&scratch2)?;

        let inp = Ident(input);
        let s1 = Ident(&scratch1);
        let crs = crs_default_number();

        let dump_makevalid = match node.custom_properties.snapgrid {
            Some(spacing) => format!(
                "CREATE TABLE {s1} AS
                 SELECT ST_MakeValid(dumped.geom) geom
                 FROM (SELECT (ST_Dump(ST_SnapToGrid(geom, {spacing}))).geom geom FROM {inp}) dumped
                 WHERE ST_geometrytype(dumped.geom) = 'ST_Polygon'"
            ),
            None => format!(
                "CREATE TABLE {s1} AS
                 SELECT ST_MakeValid(dumped.geom) geom
                 FROM (SELECT (ST_Dump(geom)).geom geom FROM {inp}) dumped
                 WHERE ST_geometrytype(dumped.geom) = 'ST_Polygon'"
            ),
        };
        self.store.batch_execute(&dump_makevalid)?;
        self.store.batch_execute(&format!("CREATE INDEX {}_idx ON {s1} USING GIST (geom)", scratch1))?;

        let s2 = Ident(&scratch2);
        self.store.batch_execute(&format!(
            "CREATE TABLE {s2} (gid SERIAL PRIMARY KEY, id INTEGER, geom GEOMETRY(Polygon, {crs}))"
        ))?;

        let grid = Ident(TABLE_GRID_PROCESSING);
        for gridsquare_id in &gridsquare_ids {
            self.store.execute(
                &format!(
                    "INSERT INTO {s2} (id, geom)
                     SELECT grid.id,
                        (ST_Dump(ST_CollectionExtract(ST_Intersection(grid.geom, ST_UnaryUnion(ST_Collect(data.geom))), 3))).geom::geometry(Polygon, {crs})
                     FROM {grid} grid
                     JOIN {s1} data ON ST_Intersects(grid.geom, data.geom)
                     WHERE grid.id = $1
                     GROUP BY grid.id, grid.geom"
                ),
                &[gridsquare_id],
            )?;
        }
        self.store.batch_execute(&format!("CREATE INDEX {}_idx ON {s2} USING GIST (geom)", scratch2))?;

        let out = Ident(output);
        let clip = Ident(TABLE_CLIPPING_MASTER);
        self.store.batch_execute(&format!(
            "CREATE TABLE {out} AS
             SELECT data.id, (ST_Dump(data.geom)).geom::geometry(Polygon, {crs}) AS geom
             FROM {s2} data JOIN {clip} clipper ON ST_Contains(clipper.geom, data.geom)
             UNION ALL
             SELECT data.id, (ST_Dump(ST_CollectionExtract(ST_Intersection(data.geom, clipper.geom), 3))).geom::geometry(Polygon, {crs})
             FROM {s2} data JOIN {clip} clipper ON ST_Intersects(data.geom, clipper.geom) AND NOT ST_Contains(clipper.geom, data.geom);
             CREATE INDEX {output}_idx ON {out} USING GIST (geom);
             CREATE INDEX {output}_id_idx ON {out} (id);"
        ))?;

        self.store.add_table_comment(output, &node.name)?;
        self.store.drop_table(&scratch1)?;
        self.store.drop_table(&scratch2)?;
        finish(registry, output)
    }

    /// Merges (dissolves) one or more input tables into `output`, one
    /// processing-grid square at a time when there's more than one input
    /// (spec §4.7's `amalgamate` — applied even for a single child, so every
    /// branch subcomponent lands in a uniformly-shaped table).
    pub fn amalgamate(&self, registry: &Registry, node: &Node) -> OperatorResult {
        let output = require_output(node)?;
        if self.store.table_exists(output)? {
            return Ok(true);
        }
        if !self.store.table_exists(TABLE_GRID_PROCESSING)? {
            return Err(crate::error::BuildError::data("processing grid missing, call create_processing_grid first"));
        }
        let inputs = require_many_input(node)?;
        let gridsquare_ids = self.get_processing_grid_square_ids()?;
        let scratch1 = format!("tmp_1_{output}_{}", node.urn);
        self.store.drop_table(&scratch1)?;

        let out = Ident(output);
        let crs = crs_default_number();
        self.store.batch_execute(&format!("CREATE UNLOGGED TABLE {out} (id int, geom geometry(Geometry, {crs}))"))?;
        self.store.add_table_comment(output, &node.name)?;

        if inputs.len() == 1 {
            let inp = Ident(&inputs[0]);
            self.store.batch_execute(&format!("INSERT INTO {out} SELECT * FROM {inp}"))?;
        } else {
            let s1 = Ident(&scratch1);
            self.store.batch_execute(&format!("CREATE UNLOGGED TABLE {s1} (id int, geom geometry(Geometry, {crs}))"))?;
            for input in inputs {
                let inp = Ident(input);
                self.store.batch_execute(&format!("INSERT INTO {s1} (id, geom) SELECT id, (ST_Dump(geom)).geom FROM {inp}"))?;
            }
            self.store.batch_execute(&format!("CREATE INDEX ON {s1} USING GIST (geom)"))?;

            let grid = Ident(TABLE_GRID_PROCESSING);
            for gridsquare_id in &gridsquare_ids {
                self.store.execute(
                    &format!(
                        "INSERT INTO {out} (id, geom)
                         SELECT grid.id, (ST_Dump(ST_Union(ST_Intersection(grid.geom, dataset.geom)))).geom FROM {grid} grid
                         INNER JOIN {s1} dataset ON ST_Intersects(grid.geom, dataset.geom)
                         WHERE grid.id = $1 AND ST_GeometryType(dataset.geom) = 'ST_Polygon'
                         GROUP BY grid.id"
                    ),
                    &[gridsquare_id],
                )?;
            }
        }

        self.store.batch_execute(&format!(
            "CREATE INDEX ON {out} USING GIST (geom);
             CREATE INDEX ON {out} (id);
             DELETE FROM {out} WHERE ST_GeometryType(geom) NOT IN ('ST_Polygon');"
        ))?;
        self.store.drop_table(&scratch1)?;
        self.store.add_table_comment(output, &node.name)?;
        registry.register_node(output, &node.name, node.custom_properties.branch.as_deref().unwrap_or(""), node.custom_properties.hash.as_deref().unwrap_or(""))?;
        finish(registry, output)
    }

    /// Joins all processing-grid squares of an amalgamated dataset back
    /// into one table, distinguishing seam geometries (touching a grid
    /// edge, unioned to heal the cut) from islands (kept as-is) via the
    /// buffered-edges grid (spec §4.7's `postprocess`).
    pub fn postprocess(&self, registry: &Registry, node: &Node) -> OperatorResult {
        let output = require_output(node)?;
        if self.store.table_exists(output)? {
            return Ok(true);
        }
        let input = require_single_input(node)?;

        let table_seams = format!("tmp_0_{output}_{}", node.urn);
        let table_islands = format!("tmp_1_{output}_{}", node.urn);
        let table_welded = format!("tmp_2_{output}_{}", node.urn);
        for t in [&table_seams, &table_islands, &table_welded] {
            self.store.drop_table(t)?;
        }
        self.store.drop_table(output)?;

        let inp = Ident(input);
        let edges = Ident(TABLE_GRID_BUFFERED_EDGES);
        let seams = Ident(&table_seams);
        let islands = Ident(&table_islands);
        let welded = Ident(&table_welded);

        self.store.batch_execute(&format!(
            "CREATE TABLE {seams} AS SELECT a.geom AS geom FROM {inp} a WHERE EXISTS (SELECT 1 FROM {edges} b WHERE ST_Intersects(a.geom, b.geom));
             CREATE TABLE {islands} AS SELECT a.geom AS geom FROM {inp} a WHERE NOT EXISTS (SELECT 1 FROM {edges} b WHERE ST_Intersects(a.geom, b.geom));"
        ))?;

        // Conventional weld path; fall back to keeping the gridded seam
        // geometry unmerged if ST_Union chokes on excessive complexity.
        if self.store.batch_execute(&format!("CREATE TABLE {welded} AS SELECT ST_Union(geom) AS geom FROM {seams}")).is_err() {
            self.store.drop_table(&table_welded)?;
            self.store.batch_execute(&format!("CREATE TABLE {welded} AS SELECT geom FROM {seams}"))?;
        }

        let out = Ident(output);
        self.store.batch_execute(&format!(
            "CREATE TABLE {out} AS SELECT geom FROM {welded} UNION ALL SELECT geom FROM {islands};
             CREATE INDEX ON {out} USING GIST (geom);"
        ))?;

        for t in [&table_seams, &table_islands, &table_welded] {
            self.store.drop_table(t)?;
        }
        self.store.add_table_comment(output, &node.name)?;
        registry.register_node(output, &node.name, node.custom_properties.branch.as_deref().unwrap_or(""), node.custom_properties.hash.as_deref().unwrap_or(""))?;
        finish(registry, output)
    }

    /// Clips a dataset to the union of one or more named boundary areas
    /// from `TABLE_OSM_BOUNDARIES` (spec §4.7's `clip` — the final stage of
    /// an output-focused branch, run once per declared clip area set).
    pub fn clip(&self, registry: &Registry, node: &Node) -> OperatorResult {
        let output = require_output(node)?;
        let input = require_single_input(node)?;
        let areas = node
            .custom_properties
            .clip
            .as_ref()
            .ok_or_else(|| crate::error::BuildError::data(format!("{}: missing 'clip' field", node.name)))?;

        if self.store.table_exists(output)? {
            self.store.drop_table(output)?;
        }

        let lowered: Vec<String> = areas.iter().map(|a| a.to_ascii_lowercase()).collect();
        for area in &lowered {
            if self.store.areas_bounds(TABLE_OSM_BOUNDARIES, std::slice::from_ref(area))?.is_none() {
                return Err(crate::error::BuildError::data(format!("clip area '{area}' not found in boundaries database")));
            }
        }

        let cliptemp = format!("tmp_1_{output}_{}", node.urn);
        let out = Ident(output);
        let inp = Ident(input);
        let clip = Ident(TABLE_OSM_BOUNDARIES);
        let temp = Ident(&cliptemp);
        let crs = crs_output_number();

        self.store.execute(
            &format!(
                "CREATE TABLE {temp} AS
                 SELECT (ST_Dump(ST_Union(ST_MakeValid(geom)))).geom::geometry(Polygon, {crs}) AS geom
                 FROM {clip}
                 WHERE LOWER(name) = ANY($1) OR LOWER(council_name) = ANY($1)"
            ),
            &[&lowered],
        )?;
        self.store.batch_execute(&format!("CREATE INDEX {cliptemp}_idx ON {temp} USING GIST (geom)"))?;
        self.store.batch_execute(&format!(
            "CREATE TABLE {out} AS
             SELECT CASE
                WHEN ST_Within(d.geom, c.geom) THEN d.geom
                ELSE ST_Multi(ST_CollectionExtract(ST_Intersection(d.geom, c.geom), 3))
             END::geometry(MultiPolygon, {crs}) AS geom
             FROM {inp} d JOIN {temp} c ON ST_Intersects(d.geom, c.geom)
             WHERE NOT ST_IsEmpty(ST_Intersection(d.geom, c.geom))"
        ))?;
        self.store.drop_table(&cliptemp)?;
        self.store.add_table_comment(output, &node.name)?;
        registry.register_node(output, &node.name, node.custom_properties.branch.as_deref().unwrap_or(""), node.custom_properties.hash.as_deref().unwrap_or(""))?;
        finish(registry, output)
    }
}

/// Shared success gate: only mark a table complete in the registry once its
/// CREATE TABLE statements have actually committed, matching every operator
/// in the original module's "only update registry now" comment.
fn finish(registry: &Registry, output: &str) -> OperatorResult {
    if registry.set_completed(output)? {
        Ok(true)
    } else {
        Err(crate::error::BuildError::data(format!(
            "{output}: operator finished but no registry record was found for it"
        )))
    }
}
