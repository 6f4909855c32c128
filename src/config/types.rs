//! Public configuration types.
//!
//! These are the resolved, ready-to-use structs that the pipeline consumes.
//! Raw TOML deserialization types live in `raw.rs`.

use std::path::PathBuf;

use crate::aggregation::Weights;
use crate::expansion::ExpansionModes;
use crate::indexation::IndexPolicy;
use crate::lifecycle::RetainPolicy;
use crate::resource::ContextSpec;
use crate::store::RetryPolicy;

// ── Ontology ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OntologyConfig {
    /// Ingest every bundle in `feed_dir` before processing resources.
    pub populate: bool,
    /// Directory of `*.json` ontology bundles.
    pub feed_dir: PathBuf,
    /// Closure TSV files bulk-loaded after population.
    pub relation_files: Vec<PathBuf>,
    /// Run the version dedup sweep.
    pub dedup: bool,
    pub retain: RetainPolicy,
}

// ── Pipeline ────────────────────────────────────────────────────────────────

/// What to clear before a resource is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reinitialize {
    #[default]
    None,
    /// Every derived table and the elements.
    All,
    /// Every derived table; elements are kept.
    Annotations,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub process_resources: bool,
    pub reinitialize: Reinitialize,
    pub update_elements: bool,
    pub use_full_dictionary: bool,
    pub annotation: bool,
    pub expansion: bool,
    /// Aggregation, concept frequency and indexation.
    pub aggregation: bool,
    pub stop_words: Vec<String>,
    /// Resource ids to process, in order.
    pub resources: Vec<String>,
}

// ── Tagger ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TaggerConfig {
    Dictionary {
        min_term_length: usize,
    },
    Process {
        command: String,
        args: Vec<String>,
        retry: RetryPolicy,
    },
}

// ── Resources ───────────────────────────────────────────────────────────────

/// One `[resource.<id>]` table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    pub id: String,
    pub name: String,
    /// Registry key of the implementation (e.g. `"tab_file"`).
    pub implementation: String,
    /// Content file, resolved against the work directory.
    pub path: Option<PathBuf>,
    /// Element URL pattern; `{id}` is replaced by the local element id.
    pub url_template: String,
    pub large_scale: bool,
    pub contexts: Vec<ContextSpec>,
}

// ── Top-level ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub work_dir: PathBuf,
    pub log_level: String,
    pub ontology: OntologyConfig,
    pub pipeline: PipelineConfig,
    pub expansion: ExpansionModes,
    pub weights: Weights,
    pub index_policy: IndexPolicy,
    pub tagger: TaggerConfig,
    pub store_retry: RetryPolicy,
    /// Tables for the ids in `pipeline.resources`, same order.
    pub resources: Vec<ResourceConfig>,
}

impl Config {
    pub fn resource(&self, id: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Scratch directory for subprocess tagger files.
    pub fn tagger_dir(&self) -> PathBuf {
        self.work_dir.join("tagger")
    }
}

