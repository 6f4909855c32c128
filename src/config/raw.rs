//! Raw TOML deserialization types.
//!
//! These structs mirror the TOML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs.

use std::collections::HashMap;

use serde::Deserialize;

use crate::resource::ContextSpec;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw TOML shape: serde target before resolution.
#[derive(Deserialize)]
pub(super) struct RawConfig {
    pub index: RawIndex,
    #[serde(default)]
    pub ontology: RawOntology,
    #[serde(default)]
    pub pipeline: RawPipeline,
    #[serde(default)]
    pub expansion: RawExpansion,
    #[serde(default)]
    pub weights: RawWeights,
    #[serde(default)]
    pub index_policy: RawIndexPolicy,
    #[serde(default)]
    pub tagger: RawTagger,
    #[serde(default)]
    pub store: RawStore,
    #[serde(default)]
    pub resource: HashMap<String, RawResource>,
}

#[derive(Deserialize)]
pub(super) struct RawIndex {
    pub work_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Ontology ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawOntology {
    #[serde(default = "default_false")]
    pub populate: bool,
    #[serde(default = "default_feed_dir")]
    pub feed_dir: String,
    #[serde(default)]
    pub relation_files: Vec<String>,
    #[serde(default = "default_true")]
    pub dedup: bool,
    #[serde(default = "default_retain")]
    pub retain: String,
}

impl Default for RawOntology {
    fn default() -> Self {
        Self {
            populate: false,
            feed_dir: default_feed_dir(),
            relation_files: Vec::new(),
            dedup: true,
            retain: default_retain(),
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawPipeline {
    #[serde(default = "default_true")]
    pub process_resources: bool,
    #[serde(default = "default_reinitialize")]
    pub reinitialize: String,
    #[serde(default = "default_true")]
    pub update_elements: bool,
    #[serde(default = "default_false")]
    pub use_full_dictionary: bool,
    #[serde(default = "default_true")]
    pub annotation: bool,
    #[serde(default = "default_true")]
    pub expansion: bool,
    #[serde(default = "default_true")]
    pub aggregation: bool,
    #[serde(default)]
    pub stop_words: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
}

impl Default for RawPipeline {
    fn default() -> Self {
        Self {
            process_resources: true,
            reinitialize: default_reinitialize(),
            update_elements: true,
            use_full_dictionary: false,
            annotation: true,
            expansion: true,
            aggregation: true,
            stop_words: Vec::new(),
            resources: Vec::new(),
        }
    }
}

// ── Scoring ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawExpansion {
    #[serde(default = "default_true")]
    pub isa: bool,
    #[serde(default = "default_true")]
    pub mapping: bool,
    #[serde(default = "default_false")]
    pub distance: bool,
}

impl Default for RawExpansion {
    fn default() -> Self {
        Self {
            isa: true,
            mapping: true,
            distance: false,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawWeights {
    #[serde(default = "default_primary_weight")]
    pub primary: f64,
    #[serde(default = "default_secondary_weight")]
    pub secondary: f64,
    #[serde(default = "default_isa_factor")]
    pub isa_factor: f64,
    #[serde(default = "default_mapping_weight")]
    pub mapping: f64,
    #[serde(default = "default_reported_weight")]
    pub reported: f64,
}

impl Default for RawWeights {
    fn default() -> Self {
        Self {
            primary: default_primary_weight(),
            secondary: default_secondary_weight(),
            isa_factor: default_isa_factor(),
            mapping: default_mapping_weight(),
            reported: default_reported_weight(),
        }
    }
}

#[derive(Deserialize, Default)]
pub(super) struct RawIndexPolicy {
    #[serde(default)]
    pub min_score: f64,
    #[serde(default)]
    pub top_k_per_element: Option<usize>,
}

// ── Tagger / store ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawTagger {
    #[serde(default = "default_tagger_kind")]
    pub kind: String,
    #[serde(default = "default_min_term_length")]
    pub min_term_length: usize,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RawTagger {
    fn default() -> Self {
        Self {
            kind: default_tagger_kind(),
            min_term_length: default_min_term_length(),
            command: None,
            args: Vec::new(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

#[derive(Deserialize, Default)]
pub(super) struct RawStore {
    #[serde(default)]
    pub retry: RawRetry,
}

#[derive(Deserialize)]
pub(super) struct RawRetry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RawRetry {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

// ── Resources ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawResource {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_implementation")]
    pub implementation: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url_template: String,
    #[serde(default = "default_false")]
    pub large_scale: bool,
    #[serde(default)]
    pub contexts: Vec<ContextSpec>,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

pub(super) fn default_true() -> bool {
    true
}

pub(super) fn default_false() -> bool {
    false
}

pub(super) fn default_log_level() -> String {
    "info".into()
}

pub(super) fn default_feed_dir() -> String {
    "ontologies".into()
}

pub(super) fn default_retain() -> String {
    "latest_loaded".into()
}

pub(super) fn default_reinitialize() -> String {
    "none".into()
}

pub(super) fn default_primary_weight() -> f64 {
    1.0
}

pub(super) fn default_secondary_weight() -> f64 {
    0.8
}

pub(super) fn default_isa_factor() -> f64 {
    0.6
}

pub(super) fn default_mapping_weight() -> f64 {
    0.5
}

pub(super) fn default_reported_weight() -> f64 {
    1.0
}

pub(super) fn default_tagger_kind() -> String {
    "dictionary".into()
}

pub(super) fn default_min_term_length() -> usize {
    3
}

pub(super) fn default_max_attempts() -> u32 {
    5
}

pub(super) fn default_backoff_ms() -> u64 {
    1000
}

pub(super) fn default_implementation() -> String {
    "tab_file".into()
}
