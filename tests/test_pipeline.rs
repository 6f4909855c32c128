//! End-to-end pipeline runs against a temporary work directory.
//!
//! Run with:
//!   cargo test --test test_pipeline

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use resource_index::config::{self, Config};
use resource_index::expansion::{ExpansionModes, SemanticExpansionEngine};
use resource_index::indexation::{IndexEntry, IndexPolicy, IndexationEngine};
use resource_index::ontology::{ConceptRecord, MapRecord, OntologyBundle, OntologyRecord, TermRecord};
use resource_index::pipeline::PipelineOrchestrator;
use resource_index::resource::{ResourceContext, ResourceStore};
use resource_index::store::Store;

// ── helpers ──────────────────────────────────────────────────────────────────

fn concept(id: &str, term: &str, parents: &[&str]) -> ConceptRecord {
    ConceptRecord {
        local_concept_id: id.into(),
        is_toplevel: parents.is_empty(),
        terms: vec![TermRecord { name: term.into(), is_preferred: true }],
        parents: parents.iter().map(|p| p.to_string()).collect(),
    }
}

fn bundle(local: &str, virt: &str, concepts: Vec<ConceptRecord>, mappings: Vec<MapRecord>) -> OntologyBundle {
    OntologyBundle {
        ontology: OntologyRecord {
            local_ontology_id: local.into(),
            virtual_ontology_id: virt.into(),
            name: virt.into(),
            version: "1".into(),
            status: 0,
            format: "obo".into(),
        },
        concepts,
        relations: Vec::new(),
        mappings,
    }
}

fn write_bundle(work: &Path, file: &str, bundle: &OntologyBundle) {
    let feed = work.join("feed");
    fs::create_dir_all(&feed).expect("create feed dir");
    fs::write(feed.join(file), serde_json::to_string(bundle).expect("serialize bundle")).expect("write bundle");
}

/// Feed with OTHER.1 (C "pulmo") and ANAT.1 (A "lung" is-a B "organ",
/// A close_match C).
fn seed_feed(work: &Path) {
    write_bundle(work, "1_other.json", &bundle("OTHER.1", "OTHER", vec![concept("C", "pulmo", &[])], Vec::new()));
    write_bundle(
        work,
        "2_anat.json",
        &bundle(
            "ANAT.1",
            "ANAT",
            vec![concept("B", "organ", &[]), concept("A", "lung", &["B"])],
            vec![MapRecord {
                local_concept_id: "A".into(),
                mapped_local_concept_id: "C".into(),
                mapping_type: "close_match".into(),
            }],
        ),
    );
}

fn write_config(work: &Path, reinitialize: &str, resources: &str) -> Config {
    let toml = format!(
        r#"
[index]
work_dir = '{work}'
log_level = "warn"

[ontology]
populate = true
feed_dir = "feed"

[pipeline]
reinitialize = "{reinitialize}"
resources = {resources}

[store.retry]
max_attempts = 1

[resource.GEO]
path = "geo.tsv"
url_template = "https://example.org/{{id}}"
contexts = [{{ name = "title", weight = "primary" }}]

[resource.BAD]
path = "missing.tsv"
contexts = [{{ name = "title" }}]
"#,
        work = work.display()
    );
    let path = work.join("config.toml");
    fs::write(&path, toml).expect("write config");
    config::load_from(&path, None, None).expect("config should load")
}

fn open(config: &Config) -> Arc<Store> {
    Arc::new(Store::open(&config.work_dir).expect("open store"))
}

fn context(store: &Arc<Store>) -> ResourceContext {
    ResourceStore::new(store.clone())
        .context("GEO")
        .unwrap()
        .expect("GEO registered")
}

fn index(store: &Arc<Store>, element: &str) -> Vec<IndexEntry> {
    IndexationEngine::new(store.clone(), IndexPolicy::default())
        .index_for_element(&context(store), element)
        .unwrap()
}

fn scores(entries: &[IndexEntry]) -> Vec<(String, f64)> {
    entries
        .iter()
        .map(|e| (e.local_concept_id.clone(), (e.final_score * 1000.0).round() / 1000.0))
        .collect()
}

// ── scoring ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn isa_and_mapping_scores_reach_the_index() {
    let tmp = TempDir::new().unwrap();
    seed_feed(tmp.path());
    fs::write(tmp.path().join("geo.tsv"), "# id\ttitle\nE1\tlung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let store = open(&config);

    let report = PipelineOrchestrator::new(config, store.clone()).run().await.unwrap();
    assert_eq!(report.ingested.len(), 2);
    assert!(report.failed_resources.is_empty());
    let geo = &report.resources[0];
    assert_eq!(geo.new_elements, 1);
    assert_eq!(geo.annotation.as_ref().map(|a| a.inserted), Some(1));
    assert_eq!(geo.indexed, 3);
    assert!(geo.dictionary_id.is_some());

    assert_eq!(
        scores(&index(&store, "E1")),
        [("A".to_string(), 1.0), ("B".to_string(), 0.6), ("C".to_string(), 0.5)]
    );
}

#[tokio::test]
async fn rerun_without_changes_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    seed_feed(tmp.path());
    fs::write(tmp.path().join("geo.tsv"), "E1\tlung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let store = open(&config);
    let orchestrator = PipelineOrchestrator::new(config, store.clone());

    orchestrator.run().await.unwrap();
    let before = index(&store, "E1");
    let aggregated = store.count_rows("obr_aggregation", Some("GEO")).unwrap();

    let again = orchestrator.run().await.unwrap();
    assert!(again.ingested.is_empty());
    assert_eq!(again.already_loaded, 2);
    let geo = &again.resources[0];
    assert_eq!(geo.new_elements, 0);
    assert_eq!(geo.annotation.as_ref().map(|a| a.inserted), Some(0));
    assert_eq!(geo.expansion.map(|e| e.isa + e.mapping), Some(0));

    assert_eq!(index(&store, "E1"), before);
    assert_eq!(store.count_rows("obr_aggregation", Some("GEO")).unwrap(), aggregated);
}

#[tokio::test]
async fn new_elements_are_annotated_with_the_full_dictionary() {
    let tmp = TempDir::new().unwrap();
    seed_feed(tmp.path());
    let tsv = tmp.path().join("geo.tsv");
    fs::write(&tsv, "E1\tlung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let store = open(&config);
    let orchestrator = PipelineOrchestrator::new(config, store.clone());
    orchestrator.run().await.unwrap();
    let e1_before = scores(&index(&store, "E1"));

    // No new ontology since the last run, yet E2 must still see every term.
    fs::write(&tsv, "E1\tlung\nE2\tlung organ\n").unwrap();
    let report = orchestrator.run().await.unwrap();
    assert_eq!(report.resources[0].new_elements, 1);

    // B gets its direct hit plus the is-a contribution from A.
    assert_eq!(
        scores(&index(&store, "E2")),
        [("B".to_string(), 1.6), ("A".to_string(), 1.0), ("C".to_string(), 0.5)]
    );
    assert_eq!(scores(&index(&store, "E1")), e1_before);
}

#[tokio::test]
async fn expanded_rows_regenerate_identically() {
    let tmp = TempDir::new().unwrap();
    seed_feed(tmp.path());
    fs::write(tmp.path().join("geo.tsv"), "E1\tlung organ\nE2\tpulmo lung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let weights = config.weights;
    let store = open(&config);
    PipelineOrchestrator::new(config, store.clone()).run().await.unwrap();

    let ctx = context(&store);
    let resources = ResourceStore::new(store.clone());
    let engine = SemanticExpansionEngine::new(store.clone());
    let snapshot = |engine: &SemanticExpansionEngine| {
        resources
            .elements("GEO")
            .unwrap()
            .iter()
            .flat_map(|e| engine.expanded_for(&ctx, e.id).unwrap())
            .collect::<Vec<_>>()
    };
    let before = snapshot(&engine);
    assert!(!before.is_empty());

    store
        .with_conn("clear_expanded", |conn| {
            conn.execute("DELETE FROM obr_expanded_annotation WHERE resource_id = 'GEO'", [])
                .map_err(|e| resource_index::error::AppError::from_sqlite("test: clear", e))
        })
        .unwrap();
    engine.expand(&ctx, ExpansionModes::default(), &weights).unwrap();
    assert_eq!(snapshot(&engine), before);
}

#[tokio::test]
async fn new_annotations_never_lower_existing_scores() {
    let tmp = TempDir::new().unwrap();
    seed_feed(tmp.path());
    fs::write(tmp.path().join("geo.tsv"), "E1\tlung tissue\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let store = open(&config);
    let orchestrator = PipelineOrchestrator::new(config, store.clone());
    orchestrator.run().await.unwrap();
    let before = scores(&index(&store, "E1"));

    // "tissue" arrives later and maps onto B.
    write_bundle(
        tmp.path(),
        "3_extra.json",
        &bundle(
            "EXTRA.1",
            "EXTRA",
            vec![concept("D", "tissue", &[])],
            vec![MapRecord {
                local_concept_id: "D".into(),
                mapped_local_concept_id: "B".into(),
                mapping_type: "close_match".into(),
            }],
        ),
    );
    orchestrator.run().await.unwrap();
    let after = scores(&index(&store, "E1"));

    for (concept, score) in &before {
        let now = after
            .iter()
            .find(|(c, _)| c == concept)
            .map(|(_, s)| *s)
            .unwrap_or_else(|| panic!("{concept} dropped from the index"));
        assert!(now >= *score, "{concept}: {score} -> {now}");
    }
    assert_eq!(
        after,
        [
            ("B".to_string(), 1.1),
            ("A".to_string(), 1.0),
            ("D".to_string(), 1.0),
            ("C".to_string(), 0.5)
        ]
    );
}

#[tokio::test]
async fn mapping_into_a_later_ontology_reaches_the_index() {
    let tmp = TempDir::new().unwrap();
    // ANAT.1 maps A onto C before OTHER.1 is loaded.
    write_bundle(
        tmp.path(),
        "1_anat.json",
        &bundle(
            "ANAT.1",
            "ANAT",
            vec![concept("A", "lung", &[])],
            vec![MapRecord {
                local_concept_id: "A".into(),
                mapped_local_concept_id: "C".into(),
                mapping_type: "close_match".into(),
            }],
        ),
    );
    write_bundle(tmp.path(), "2_other.json", &bundle("OTHER.1", "OTHER", vec![concept("C", "pulmo", &[])], Vec::new()));
    fs::write(tmp.path().join("geo.tsv"), "E1\tlung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let store = open(&config);

    let report = PipelineOrchestrator::new(config, store.clone()).run().await.unwrap();
    assert_eq!(report.ingested[0].pending_maps, 1);
    assert_eq!(report.ingested[1].maps, 1);
    assert_eq!(
        scores(&index(&store, "E1")),
        [("A".to_string(), 1.0), ("C".to_string(), 0.5)]
    );
}

// ── stage control ────────────────────────────────────────────────────────────

#[tokio::test]
async fn reinitialize_all_rebuilds_from_scratch() {
    let tmp = TempDir::new().unwrap();
    seed_feed(tmp.path());
    fs::write(tmp.path().join("geo.tsv"), "E1\tlung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let store = open(&config);
    PipelineOrchestrator::new(config, store.clone()).run().await.unwrap();
    let before = index(&store, "E1");

    let config = write_config(tmp.path(), "all", r#"["GEO"]"#);
    let report = PipelineOrchestrator::new(config, store.clone()).run().await.unwrap();
    let geo = &report.resources[0];
    assert!(geo.cleared > 0);
    assert_eq!(geo.new_elements, 1);
    assert_eq!(geo.annotation.as_ref().map(|a| a.inserted), Some(1));
    assert_eq!(scores(&index(&store, "E1")), scores(&before));
}

#[tokio::test]
async fn failing_resource_does_not_stop_the_others() {
    let tmp = TempDir::new().unwrap();
    seed_feed(tmp.path());
    fs::write(tmp.path().join("geo.tsv"), "E1\tlung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["BAD", "GEO"]"#);
    let store = open(&config);

    let report = PipelineOrchestrator::new(config, store.clone()).run().await.unwrap();
    assert_eq!(report.failed_resources, ["BAD"]);
    assert_eq!(report.resources.len(), 1);
    assert_eq!(report.resources[0].resource_id, "GEO");
    assert_eq!(index(&store, "E1").len(), 3);
}

#[tokio::test]
async fn missing_feed_dir_only_skips_population() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("geo.tsv"), "E1\tlung\n").unwrap();
    let config = write_config(tmp.path(), "none", r#"["GEO"]"#);
    let store = open(&config);

    let report = PipelineOrchestrator::new(config, store.clone()).run().await.unwrap();
    assert!(report.ingested.is_empty());
    assert_eq!(report.resources[0].new_elements, 1);
    assert!(index(&store, "E1").is_empty());
}
