//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory
//! (or an explicit path), then applies `RESOURCE_INDEX_WORK_DIR` and
//! `RESOURCE_INDEX_LOG_LEVEL` env overrides.
//!
//! # Module layout
//!
//! - **types**: Public configuration structs consumed by the pipeline
//!   (`Config`, `PipelineConfig`, `ResourceConfig`, …).
//! - **raw**: Raw TOML deserialization types (`RawConfig`, `RawPipeline`, …).
//!   These mirror the file shape and use serde defaults; kept private.
//! - **load**: Loading logic: `merge_toml`, `load_raw_merged`, `load`,
//!   `load_from`, `expand_home`.

mod load;
mod raw;
mod types;

pub use load::{LOG_LEVEL_ENV, WORK_DIR_ENV, expand_home, load, load_from};
pub use types::*;

#[cfg(test)]
impl Config {
    /// Safe `Config` for unit tests: in-process tagger, no resources, no
    /// ontology feed.
    pub fn test_default(work_dir: &std::path::Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            ontology: OntologyConfig {
                populate: false,
                feed_dir: work_dir.join(raw::default_feed_dir()),
                relation_files: Vec::new(),
                dedup: false,
                retain: crate::lifecycle::RetainPolicy::LatestLoaded,
            },
            pipeline: PipelineConfig {
                process_resources: true,
                reinitialize: Reinitialize::None,
                update_elements: true,
                use_full_dictionary: false,
                annotation: true,
                expansion: true,
                aggregation: true,
                stop_words: Vec::new(),
                resources: Vec::new(),
            },
            expansion: crate::expansion::ExpansionModes::default(),
            weights: crate::aggregation::Weights::default(),
            index_policy: crate::indexation::IndexPolicy::default(),
            tagger: TaggerConfig::Dictionary {
                min_term_length: raw::default_min_term_length(),
            },
            store_retry: crate::store::RetryPolicy::none(),
            resources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ContextWeight;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::{NamedTempFile, TempDir};

    const MINIMAL_TOML: &str = r#"
[index]
work_dir = "~/.resource-index"
log_level = "info"
"#;

    fn write_toml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn write_named(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let p = dir.path().join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), None, None).unwrap();
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.ontology.populate);
        assert!(cfg.ontology.feed_dir.ends_with(".resource-index/ontologies"));
        assert_eq!(cfg.weights, crate::aggregation::Weights::default());
        assert_eq!(cfg.expansion, crate::expansion::ExpansionModes::default());
        assert_eq!(cfg.pipeline.reinitialize, Reinitialize::None);
        assert_eq!(cfg.tagger, TaggerConfig::Dictionary { min_term_length: 3 });
        assert!(cfg.resources.is_empty());
    }

    #[test]
    fn tilde_expands_to_home() {
        let home = dirs::home_dir().expect("home dir must exist in test env");
        let expanded = expand_home("~/.resource-index");
        assert!(expanded.starts_with(&home));
        assert!(expanded.ends_with(".resource-index"));
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_home("rel/path"), PathBuf::from("rel/path"));
    }

    #[test]
    fn full_config_resolves_resources() {
        let toml = r#"
[index]
work_dir = "/srv/index"

[ontology]
populate = true
feed_dir = "/data/feed"
relation_files = ["closure/ncbi.tsv"]
retain = "highest_version"

[pipeline]
reinitialize = "annotations"
use_full_dictionary = true
stop_words = ["the", "of"]
resources = ["GEO"]

[expansion]
distance = true

[weights]
primary = 10.0
isa_factor = 0.9

[index_policy]
min_score = 0.5
top_k_per_element = 20

[tagger]
kind = "process"
command = "mgrep"
args = ["--longest"]
max_attempts = 3
backoff_ms = 250

[resource.GEO]
name = "Gene Expression Omnibus"
path = "content/geo.tsv"
url_template = "https://example.org/geo/{id}"
large_scale = true
contexts = [
    { name = "title" },
    { name = "summary", weight = "secondary" },
    { name = "organism", concept_ontologies = ["1132"] },
]
"#;
        let f = write_toml(toml);
        let cfg = load_from(f.path(), None, None).unwrap();

        assert_eq!(cfg.ontology.feed_dir, PathBuf::from("/data/feed"));
        assert_eq!(cfg.ontology.relation_files, vec![PathBuf::from("/srv/index/closure/ncbi.tsv")]);
        assert_eq!(cfg.ontology.retain, crate::lifecycle::RetainPolicy::HighestVersion);
        assert_eq!(cfg.pipeline.reinitialize, Reinitialize::Annotations);
        assert!(cfg.expansion.distance);
        assert_eq!(cfg.weights.primary, 10.0);
        assert_eq!(cfg.weights.secondary, 0.8);
        assert_eq!(cfg.index_policy.top_k_per_element, Some(20));

        match &cfg.tagger {
            TaggerConfig::Process { command, args, retry } => {
                assert_eq!(command, "mgrep");
                assert_eq!(args, &vec!["--longest".to_string()]);
                assert_eq!(retry.max_attempts, 3);
                assert_eq!(retry.backoff, std::time::Duration::from_millis(250));
            }
            other => panic!("unexpected tagger {other:?}"),
        }

        let geo = cfg.resource("GEO").unwrap();
        assert_eq!(geo.implementation, "tab_file");
        assert_eq!(geo.path.as_deref(), Some(std::path::Path::new("/srv/index/content/geo.tsv")));
        assert!(geo.large_scale);
        assert_eq!(geo.contexts.len(), 3);
        assert_eq!(geo.contexts[1].weight, ContextWeight::Secondary);
        assert!(geo.contexts[2].is_concept_field());
    }

    #[test]
    fn listed_resource_without_table_errors() {
        let toml = format!("{MINIMAL_TOML}\n[pipeline]\nresources = [\"PM\"]\n");
        let f = write_toml(&toml);
        let msg = load_from(f.path(), None, None).unwrap_err().to_string();
        assert!(msg.contains("[resource.PM]"), "{msg}");
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for extra in [
            "[weights]\nmapping = -1.0\n",
            "[ontology]\nretain = \"oldest\"\n",
            "[pipeline]\nreinitialize = \"sometimes\"\n",
            "[tagger]\nkind = \"process\"\n",
            "[tagger]\nkind = \"neural\"\n",
        ] {
            let f = write_toml(&format!("{MINIMAL_TOML}\n{extra}"));
            let err = load_from(f.path(), None, None).unwrap_err();
            assert!(matches!(err, crate::error::AppError::Config(_)), "{extra}: {err}");
        }
    }

    #[test]
    fn invalid_log_level_is_a_config_error() {
        let f = write_toml(&MINIMAL_TOML.replace("\"info\"", "\"verbose\""));
        let err = load_from(f.path(), None, None).unwrap_err();
        assert!(matches!(err, crate::error::AppError::Config(ref m) if m.contains("verbose")), "{err}");

        let f = write_toml(MINIMAL_TOML);
        assert!(load_from(f.path(), None, Some("loud")).is_err());
        assert!(load_from(f.path(), None, Some("resource_index=debug,warn")).is_ok());
    }

    #[test]
    fn missing_file_errors() {
        let msg = load_from(std::path::Path::new("/nonexistent/config.toml"), None, None)
            .unwrap_err()
            .to_string();
        assert!(msg.contains("cannot read"));
    }

    #[test]
    fn env_overrides() {
        let f = write_toml(MINIMAL_TOML);
        let cfg = load_from(f.path(), Some("/tmp/ri-override"), Some("debug")).unwrap();
        assert_eq!(cfg.work_dir, PathBuf::from("/tmp/ri-override"));
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.ontology.feed_dir, PathBuf::from("/tmp/ri-override/ontologies"));
    }

    #[test]
    fn overlay_keeps_base_fields() {
        let dir = TempDir::new().unwrap();
        write_named(
            &dir,
            "base.toml",
            "[index]\nwork_dir = \"/srv/base\"\nlog_level = \"info\"\n\n[weights]\nprimary = 2.0\nmapping = 0.3\n",
        );
        let overlay = "[meta]\nbase = \"base.toml\"\n\n[index]\nlog_level = \"debug\"\n\n[weights]\nmapping = 0.7\n";
        let overlay_path = write_named(&dir, "overlay.toml", overlay);
        let cfg = load_from(&overlay_path, None, None).unwrap();
        assert_eq!(cfg.work_dir, PathBuf::from("/srv/base"));
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.weights.primary, 2.0);
        assert_eq!(cfg.weights.mapping, 0.7);
    }

    #[test]
    fn cycle_detection() {
        let dir = TempDir::new().unwrap();
        let self_path = dir.path().join("self.toml");
        let content = format!("[meta]\nbase = \"{}\"\n\n{MINIMAL_TOML}", self_path.display());
        std::fs::write(&self_path, content).unwrap();
        let msg = load_from(&self_path, None, None).unwrap_err().to_string();
        assert!(msg.contains("circular"));
    }

    #[test]
    fn shipped_default_config_parses() {
        let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let cfg = load_from(&path, Some("/tmp/ri"), None).unwrap();
        assert_eq!(cfg.pipeline.resources.len(), cfg.resources.len());
    }
}
