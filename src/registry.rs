//! The Registry (C5, spec §5.3), grounded in
//! `original_source/opensite/postgis/opensite.py`'s `OpenSitePostGIS`:
//! `init_core_tables`/`register_branch`/`register_node`/`set_table_completed`/
//! `sync_registry`. A thin SQL-table-backed store tracking which physical
//! tables exist, which branch produced them, and whether they finished —
//! the scheduler's idempotence checks go through `SpatialStore::table_exists`
//! directly, but *registration* of a new table always goes through here so
//! `sync` can later tell a tracked table from an abandoned one.

#![cfg(feature = "postgis")]

use serde_json::Value;

use crate::constants::{TABLE_BRANCH, TABLE_OUTPUTS, TABLE_REGISTRY, protected_tables};
use crate::error::BuildResult;
use crate::store::{Ident, SpatialStore};

pub struct Registry<'a> {
    store: &'a SpatialStore,
}

impl<'a> Registry<'a> {
    pub fn new(store: &'a SpatialStore) -> Self {
        Registry { store }
    }

    /// Creates the three fixed-shape tables this module owns, if absent.
    pub fn init_core_tables(&self) -> BuildResult<()> {
        self.store.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {branch} (
                yml_hash TEXT PRIMARY KEY,
                branch_name TEXT NOT NULL,
                config_json JSONB NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE TABLE IF NOT EXISTS {registry} (
                completed BOOLEAN DEFAULT FALSE,
                table_id TEXT PRIMARY KEY,
                human_name TEXT NOT NULL,
                branch_name TEXT NOT NULL,
                yml_hash TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_{registry}_completed ON {registry} (completed);
            CREATE INDEX IF NOT EXISTS idx_{registry}_table_id ON {registry} (table_id);
            CREATE TABLE IF NOT EXISTS {outputs} (
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                exported_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_{outputs}_input ON {outputs} (input);
            CREATE INDEX IF NOT EXISTS idx_{outputs}_output ON {outputs} (output);",
            branch = Ident(TABLE_BRANCH),
            registry = Ident(TABLE_REGISTRY),
            outputs = Ident(TABLE_OUTPUTS),
        ))
    }

    /// Upserts the merged configuration JSON for one branch hash (spec §4.2
    /// step 4's content hash is the key here, not the branch name, so two
    /// branches sharing a hash collapse onto one row).
    pub fn register_branch(&self, branch_name: &str, yml_hash: &str, config: &Value) -> BuildResult<()> {
        self.store.execute(
            &format!(
                "INSERT INTO {table} (yml_hash, branch_name, config_json) VALUES ($1, $2, $3)
                 ON CONFLICT (yml_hash) DO UPDATE SET config_json = EXCLUDED.config_json",
                table = Ident(TABLE_BRANCH)
            ),
            &[&yml_hash, &branch_name, &config],
        )?;
        Ok(())
    }

    /// Upserts a table-id -> human-name/branch mapping. Called once a node's
    /// `output` is known and before its operator runs, so `set_completed`
    /// has a row to flip (spec §8.1 "No action without identity").
    pub fn register_node(&self, table_id: &str, human_name: &str, branch_name: &str, yml_hash: &str) -> BuildResult<()> {
        self.store.execute(
            &format!(
                "INSERT INTO {table} (table_id, human_name, branch_name, yml_hash) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (table_id) DO UPDATE SET human_name = EXCLUDED.human_name, branch_name = EXCLUDED.branch_name",
                table = Ident(TABLE_REGISTRY)
            ),
            &[&table_id, &human_name, &branch_name, &yml_hash],
        )?;
        Ok(())
    }

    /// Marks a table complete. Returns `false` (not an error) if the table
    /// was never registered — the caller treats that as a bug in the
    /// operator that produced it, not a transient failure (mirrors
    /// `set_table_completed`'s `rowcount > 0` contract).
    pub fn set_completed(&self, table_id: &str) -> BuildResult<bool> {
        let rows = self.store.execute(
            &format!(
                "UPDATE {table} SET completed = true, updated_at = CURRENT_TIMESTAMP WHERE table_id = $1",
                table = Ident(TABLE_REGISTRY)
            ),
            &[&table_id],
        )?;
        Ok(rows > 0)
    }

    pub fn exists(&self, table_id: &str) -> BuildResult<bool> {
        let rows = self.store.fetch_all(
            &format!("SELECT 1 FROM {table} WHERE table_id = $1", table = Ident(TABLE_REGISTRY)),
            &[&table_id],
        )?;
        Ok(!rows.is_empty())
    }

    /// Reconciles the registry against physical tables and branch metadata
    /// (spec §5.4): drop incomplete/orphaned registry rows, drop untracked
    /// physical tables, drop branch rows with no surviving registry entry.
    /// Never touches anything in `protected_tables()`.
    pub fn sync(&self) -> BuildResult<()> {
        #[derive(Debug)]
        struct Entry {
            table_id: String,
            completed: bool,
        }

        let entries: Vec<Entry> = self
            .store
            .fetch_all(&format!("SELECT table_id, completed FROM {table}", table = Ident(TABLE_REGISTRY)), &[])?
            .iter()
            .map(|r| Entry { table_id: r.get("table_id"), completed: r.get("completed") })
            .collect();

        let protected = protected_tables();
        let physical: Vec<String> =
            self.store.get_table_names()?.into_iter().filter(|t| !protected.contains(&t.as_str())).collect();

        let mut tracked: std::collections::HashSet<String> = entries.iter().map(|e| e.table_id.clone()).collect();

        for entry in &entries {
            let orphaned = entry.completed && !physical.contains(&entry.table_id);
            if !entry.completed || orphaned {
                self.store.execute(
                    &format!("DELETE FROM {table} WHERE table_id = $1", table = Ident(TABLE_REGISTRY)),
                    &[&entry.table_id],
                )?;
                tracked.remove(&entry.table_id);
            }
        }

        for table_id in &physical {
            if !tracked.contains(table_id) {
                self.store.drop_table(table_id)?;
            }
        }

        self.store.execute(
            &format!(
                "DELETE FROM {branch} b WHERE NOT EXISTS (
                    SELECT 1 FROM {registry} r WHERE r.branch_name = b.branch_name
                )",
                branch = Ident(TABLE_BRANCH),
                registry = Ident(TABLE_REGISTRY),
            ),
            &[],
        )?;

        Ok(())
    }
}
