//! Deterministic identifier construction (spec §3.5).
//!
//! `serde_json` is used without the `preserve_order` feature, so
//! `serde_json::Map` is backed by a `BTreeMap` and always serializes object
//! keys in sorted order — that gives us "sorted json" for free and is why
//! `canonical_json` below is just `to_string`.

use md5::{Digest, Md5};
use serde_json::Value;

pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(value).expect("Value serialization is infallible")
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// `H = md5(lower_trim(node.name))` -> `⟨prefix⟩⟨H⟩`, the table id assigned
/// to a source/import node by the configuration loader.
pub fn source_table_id(prefix: &str, name: &str) -> String {
    let normalized = name.trim().to_ascii_lowercase();
    format!("{prefix}{}", md5_hex(&normalized))
}

/// Amalgamation/inversion table id: `md5(json_sorted(child_outputs))` with a
/// fixed prefix. `child_outputs` must already be sorted by the caller (pass
/// 11 sorts before calling) so that identical merges collapse onto the same
/// identifier regardless of child order on disk.
pub fn amalgamate_table_id(prefix: &str, sorted_child_outputs: &[String]) -> String {
    let json = serde_json::to_string(sorted_child_outputs).expect("Vec<String> is infallible");
    format!("{prefix}{}", md5_hex(&json))
}

/// Content hash of a fully-resolved branch configuration
/// (defaults+overrides+body, key-sorted) — spec §4.2 step 4.
pub fn config_hash(merged: &Value) -> String {
    md5_hex(&canonical_json(merged))
}

pub fn buffer_suffix(parent_output: &str, distance: &str) -> String {
    format!("{parent_output}--buffer-{distance}")
}

pub fn distance_suffix(parent_output: &str, distance: &str) -> String {
    format!("{parent_output}--distance-{distance}")
}

/// `--clip--⟨slug⟩`: areas lowercased, sorted, space-replaced-by-hyphen,
/// joined by `--` (spec §8.4 scenario 4).
pub fn clip_suffix(parent_output: &str, areas: &[String]) -> String {
    let mut slugs: Vec<String> =
        areas.iter().map(|a| a.trim().to_ascii_lowercase().replace(' ', "-")).collect();
    slugs.sort();
    format!("{parent_output}--clip--{}", slugs.join("--"))
}

pub fn postprocess_suffix(parent_output: &str) -> String {
    format!("{parent_output}----postprocess")
}

pub fn preprocess_suffix(parent_output: &str) -> String {
    format!("{parent_output}--preprocess")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_table_id_is_deterministic() {
        let a = source_table_id("demo--", "  Listed Buildings  ");
        let b = source_table_id("demo--", "listed buildings");
        assert_eq!(a, b);
        assert!(a.starts_with("demo--"));
    }

    #[test]
    fn amalgamate_table_id_depends_only_on_sorted_outputs() {
        let outputs = vec!["demo--aaa".to_string(), "demo--bbb".to_string()];
        let id1 = amalgamate_table_id("amalgamate--", &outputs);
        let id2 = amalgamate_table_id("amalgamate--", &outputs);
        assert_eq!(id1, id2);
    }

    #[test]
    fn clip_suffix_sorts_lowercase_areas() {
        let areas = vec!["Surrey".to_string(), "East Sussex".to_string()];
        let suffix = clip_suffix("demo--x", &areas);
        assert_eq!(suffix, "demo--x--clip--east-sussex--surrey");
    }

    #[test]
    fn config_hash_is_order_independent_via_btreemap() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(config_hash(&a), config_hash(&b));
    }
}
