//! The Output Registry (C8, spec §5.3), grounded in
//! `original_source/opensite/postgis/opensite.py`'s `check_export_exists`/
//! `update_export_log`: a lineage log of `input -> output` export pairs used
//! to skip a re-export whose source table hasn't changed, and invalidated
//! (deleted, forcing a re-run) the moment that same path is later reused as
//! an *input* to something else.

#![cfg(feature = "postgis")]

use crate::constants::TABLE_OUTPUTS;
use crate::error::BuildResult;
use crate::store::{Ident, SpatialStore};

pub struct OutputRegistry<'a> {
    store: &'a SpatialStore,
}

impl<'a> OutputRegistry<'a> {
    pub fn new(store: &'a SpatialStore) -> Self {
        OutputRegistry { store }
    }

    /// True if this exact `input -> output` pair was already exported.
    pub fn check_exists(&self, input: &str, output: &str) -> BuildResult<bool> {
        let rows = self.store.fetch_all(
            &format!(
                "SELECT COUNT(*) AS rec_count FROM {table} WHERE input = $1 AND output = $2",
                table = Ident(TABLE_OUTPUTS)
            ),
            &[&input, &output],
        )?;
        Ok(rows.first().map(|r| r.get::<_, i64>("rec_count") != 0).unwrap_or(false))
    }

    /// Records a fresh export, dropping any prior row for this pair *and*
    /// any row where `output` was itself used as an input — that second
    /// clause is what forces downstream re-export once an upstream output
    /// changes (spec §5.3's lineage-invalidation rule).
    pub fn update(&self, input: &str, output: &str) -> BuildResult<()> {
        let table = Ident(TABLE_OUTPUTS);
        self.store.execute(
            &format!("DELETE FROM {table} WHERE (input = $1 AND output = $2) OR input = $2"),
            &[&input, &output],
        )?;
        self.store.execute(
            &format!("INSERT INTO {table} (input, output, exported_at) VALUES ($1, $2, CURRENT_TIMESTAMP)"),
            &[&input, &output],
        )?;
        Ok(())
    }
}
