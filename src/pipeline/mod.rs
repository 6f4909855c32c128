//! Pipeline orchestration.
//!
//! One run:
//!
//! ```text
//!   populate ontologies (feed dir) ──► relation files ──► dedup sweep
//!        │
//!        ▼  for each configured resource, sequentially
//!   register ─► reinitialize? ─► update elements? ─► annotate ─► expand
//!        ─► aggregate + concept frequency + index ─► record dictionary id
//! ```
//!
//! Every stage can be switched off in `[pipeline]`, and every stage
//! tolerates a store that already holds its previous output. A failing
//! resource is logged and the run moves on; a store failure aborts the run.

use std::fs;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::aggregation::AggregationEngine;
use crate::annotation::{AnnotationEngine, AnnotationReport};
use crate::config::{Config, Reinitialize, TaggerConfig};
use crate::error::AppError;
use crate::expansion::{ExpansionReport, SemanticExpansionEngine};
use crate::indexation::IndexationEngine;
use crate::lifecycle::{LifecycleReport, OntologyLifecycleManager};
use crate::ontology::{BulkLoadReport, Ingest, IngestReport, OntologyGraphStore};
use crate::resource::{Resource, ResourceRegistry, ResourceStore};
use crate::store::Store;
use crate::tagger::{DictionaryTagger, ProcessTagger, ProcessTaggerConfig, StopList, Tagger};

/// What happened to one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceReport {
    pub resource_id: String,
    /// Rows removed by reinitialization.
    pub cleared: usize,
    pub new_elements: usize,
    pub annotation: Option<AnnotationReport>,
    pub expansion: Option<ExpansionReport>,
    pub aggregated: usize,
    pub frequencies: usize,
    pub indexed: usize,
    pub dictionary_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub ingested: Vec<IngestReport>,
    /// Bundles whose version was already loaded.
    pub already_loaded: usize,
    pub relations: BulkLoadReport,
    pub lifecycle: LifecycleReport,
    pub resources: Vec<ResourceReport>,
    pub failed_resources: Vec<String>,
}

pub struct PipelineOrchestrator {
    config: Config,
    store: Arc<Store>,
    registry: ResourceRegistry,
    tagger: Tagger,
}

impl PipelineOrchestrator {
    pub fn new(config: Config, store: Arc<Store>) -> Self {
        let tagger = build_tagger(&config);
        Self {
            config,
            store,
            registry: ResourceRegistry::with_builtins(),
            tagger,
        }
    }

    /// Replace the resource registry (e.g. to add implementations).
    pub fn with_registry(mut self, registry: ResourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_tagger(mut self, tagger: Tagger) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(&self) -> Result<RunReport, AppError> {
        let mut report = RunReport::default();

        if self.config.ontology.populate {
            let (ingested, already_loaded, lifecycle) = self.populate_ontologies()?;
            report.ingested = ingested;
            report.already_loaded = already_loaded;
            merge_lifecycle(&mut report.lifecycle, lifecycle);
        }

        for path in &self.config.ontology.relation_files {
            let graph = OntologyGraphStore::new(self.store.clone());
            match graph.load_relation_file(path) {
                Ok(r) => {
                    report.relations.inserted += r.inserted;
                    report.relations.existing += r.existing;
                    report.relations.skipped += r.skipped;
                }
                Err(e) if aborts_run(&e) => return Err(e),
                Err(e) => warn!(path = %path.display(), "relation file skipped: {e}"),
            }
        }

        if self.config.ontology.dedup {
            let lifecycle = OntologyLifecycleManager::new(self.store.clone());
            merge_lifecycle(&mut report.lifecycle, lifecycle.sweep(self.config.ontology.retain)?);
        }

        if self.config.pipeline.process_resources {
            for resource_cfg in &self.config.resources {
                let resource = match self.registry.create(resource_cfg) {
                    Ok(r) => r,
                    Err(e) => {
                        error!(resource_id = %resource_cfg.id, "cannot build resource: {e}");
                        report.failed_resources.push(resource_cfg.id.clone());
                        continue;
                    }
                };
                match self.process_resource(resource.as_ref()).await {
                    Ok(r) => report.resources.push(r),
                    Err(e) if aborts_run(&e) => {
                        error!(resource_id = %resource_cfg.id, "store failure, aborting run: {e}");
                        return Err(e);
                    }
                    Err(e) => {
                        error!(resource_id = %resource_cfg.id, "resource failed: {e}");
                        report.failed_resources.push(resource_cfg.id.clone());
                    }
                }
            }
        }

        info!(
            ingested = report.ingested.len(),
            resources = report.resources.len(),
            failed = report.failed_resources.len(),
            "pipeline run finished"
        );
        Ok(report)
    }

    /// Ingest every `*.json` bundle in the feed directory, in file-name
    /// order. Returns the loaded versions, the count of bundles already
    /// present, and what the per-version lifecycle check removed.
    pub fn populate_ontologies(&self) -> Result<(Vec<IngestReport>, usize, LifecycleReport), AppError> {
        let feed_dir = &self.config.ontology.feed_dir;
        let mut files = match fs::read_dir(feed_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(feed_dir = %feed_dir.display(), "ontology feed not readable: {e}");
                return Ok((Vec::new(), 0, LifecycleReport::default()));
            }
        };
        files.sort();

        let graph = OntologyGraphStore::new(self.store.clone());
        let lifecycle = OntologyLifecycleManager::new(self.store.clone());
        let mut ingested = Vec::new();
        let mut already_loaded = 0;
        let mut removed = LifecycleReport::default();

        for path in files {
            match graph.ingest_bundle_file(&path) {
                Ok(Ingest::Loaded(r)) => {
                    if self.config.ontology.dedup {
                        merge_lifecycle(
                            &mut removed,
                            lifecycle.on_new_version(&r.virtual_ontology_id, self.config.ontology.retain)?,
                        );
                    }
                    ingested.push(r);
                }
                Ok(Ingest::NoNewOntology { .. }) => already_loaded += 1,
                Err(e) if aborts_run(&e) => return Err(e),
                Err(e) => warn!(path = %path.display(), "ontology bundle skipped: {e}"),
            }
        }
        info!(loaded = ingested.len(), already_loaded, "ontology population finished");
        Ok((ingested, already_loaded, removed))
    }

    /// Run every enabled stage for one resource.
    pub async fn process_resource(&self, resource: &dyn Resource) -> Result<ResourceReport, AppError> {
        let pipeline = &self.config.pipeline;
        let resources = ResourceStore::new(self.store.clone());
        let mut ctx = resources.register(resource)?;
        let mut report = ResourceReport {
            resource_id: ctx.resource_id.clone(),
            ..ResourceReport::default()
        };
        info!(resource_id = %ctx.resource_id, large_scale = ctx.large_scale, "processing resource");

        if pipeline.reinitialize != Reinitialize::None {
            let keep_elements = pipeline.reinitialize == Reinitialize::Annotations;
            report.cleared = self.store.clear_resource(&ctx.resource_id, keep_elements)?;
            resources.record_dictionary(&ctx.resource_id, None)?;
            ctx.last_dictionary_id = None;
            info!(resource_id = %ctx.resource_id, rows = report.cleared, keep_elements, "resource reinitialized");
        }

        if pipeline.update_elements {
            report.new_elements = resources.update_elements(&ctx, resource)?;
        }

        if pipeline.annotation {
            let engine = AnnotationEngine::new(self.store.clone(), StopList::new(&pipeline.stop_words));
            report.annotation = Some(engine.run(&ctx, &self.tagger, pipeline.use_full_dictionary).await?);
        }

        if pipeline.expansion {
            let engine = SemanticExpansionEngine::new(self.store.clone());
            report.expansion = Some(engine.expand(&ctx, self.config.expansion, &self.config.weights)?);
        }

        if pipeline.aggregation {
            let aggregation = AggregationEngine::new(self.store.clone());
            report.aggregated = aggregation.aggregate(&ctx, &self.config.weights)?;
            report.frequencies = aggregation.calculate_concept_frequency(&ctx)?;
            let indexation = IndexationEngine::new(self.store.clone(), self.config.index_policy);
            report.indexed = indexation.indexation(&ctx)?;
        }

        // Only a run where every element tagged cleanly covers the newest
        // dictionary; otherwise the previous id stays.
        match report.annotation {
            Some(a) if a.failed == 0 => {
                let graph = OntologyGraphStore::new(self.store.clone());
                report.dictionary_id = graph.latest_dictionary_id()?;
                resources.record_dictionary(&ctx.resource_id, report.dictionary_id)?;
            }
            Some(a) => warn!(
                resource_id = %ctx.resource_id,
                failed = a.failed,
                "dictionary not recorded, failed elements are retried next run"
            ),
            None => {}
        }

        info!(
            resource_id = %ctx.resource_id,
            new_elements = report.new_elements,
            aggregated = report.aggregated,
            indexed = report.indexed,
            "resource processed"
        );
        Ok(report)
    }
}

/// Build the tagger described by `[tagger]`.
pub fn build_tagger(config: &Config) -> Tagger {
    match &config.tagger {
        TaggerConfig::Dictionary { min_term_length } => {
            Tagger::Dictionary(DictionaryTagger::new(*min_term_length))
        }
        TaggerConfig::Process { command, args, retry } => Tagger::Process(ProcessTagger::new(ProcessTaggerConfig {
            command: command.clone(),
            args: args.clone(),
            work_dir: config.tagger_dir(),
            retry: *retry,
        })),
    }
}

/// Store-level failures end the whole run.
fn aborts_run(e: &AppError) -> bool {
    matches!(e, AppError::Store(_) | AppError::Transient(_))
}

fn merge_lifecycle(into: &mut LifecycleReport, other: LifecycleReport) {
    into.retained.extend(other.retained);
    into.removed.extend(other.removed);
    into.failed.extend(other.failed);
    into.derived.merge(other.derived);
}
