//! Direct annotations: concepts found in, or reported by, an element.
//!
//! Two sources feed the `obr_direct_annotation` table:
//!
//! ```text
//!   text context ──► Tagger ──► TermHit ──► obr_term ──► matched annotation
//!   concept field ─► split on '>' ──► resolve_terms_to_concepts ──► reported annotation
//! ```
//!
//! Matched annotations keep the weight class of the context they were found
//! in; reported annotations bypass the tagger entirely.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::ontology::{ConceptId, OntologyGraphStore};
use crate::removal::{self, RemovalReport};
use crate::resource::{ContextWeight, ResourceContext, ResourceStore, StoredElement};
use crate::store::Store;
use crate::tagger::{StopList, Tagger, TaggingResults};

/// Weight class carried from an annotation into expansion and aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WeightClass {
    Primary,
    Secondary,
    Reported,
}

impl WeightClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeightClass::Primary => "primary",
            WeightClass::Secondary => "secondary",
            WeightClass::Reported => "reported",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "primary" => Ok(WeightClass::Primary),
            "secondary" => Ok(WeightClass::Secondary),
            "reported" => Ok(WeightClass::Reported),
            other => Err(AppError::Store(format!("unknown weight class '{other}'"))),
        }
    }
}

impl From<ContextWeight> for WeightClass {
    fn from(w: ContextWeight) -> Self {
        match w {
            ContextWeight::Primary => WeightClass::Primary,
            ContextWeight::Secondary => WeightClass::Secondary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DirectAnnotation {
    pub element_id: i64,
    pub concept_id: ConceptId,
    pub context_name: String,
    /// `None` for reported annotations.
    pub term_id: Option<i64>,
    pub weight_class: WeightClass,
    pub dictionary_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationReport {
    pub elements: usize,
    /// Annotations produced, including ones already stored.
    pub annotations: usize,
    pub inserted: usize,
    /// Elements with at least one context that failed tagging. Their other
    /// contexts are stored, but they stay due for the next run.
    pub failed: usize,
    /// Elements already annotated against the newest dictionary.
    pub up_to_date: usize,
}

pub struct AnnotationEngine {
    store: Arc<Store>,
    graph: OntologyGraphStore,
    resources: ResourceStore,
    stop_list: StopList,
}

impl AnnotationEngine {
    pub fn new(store: Arc<Store>, stop_list: StopList) -> Self {
        Self {
            graph: OntologyGraphStore::new(store.clone()),
            resources: ResourceStore::new(store.clone()),
            store,
            stop_list,
        }
    }

    /// Build and store the direct annotations of one element.
    ///
    /// With `use_full_dictionary == false`, hits on terms from dictionaries
    /// at or before `element.annotated_dictionary_id` are dropped. Stored
    /// rows are never duplicated.
    pub fn annotate(
        &self,
        ctx: &ResourceContext,
        element: &StoredElement,
        tagging_results: &TaggingResults,
        use_full_dictionary: bool,
    ) -> Result<BTreeSet<DirectAnnotation>, AppError> {
        let (annotations, _) = self.annotate_counted(ctx, element, tagging_results, use_full_dictionary)?;
        Ok(annotations)
    }

    fn annotate_counted(
        &self,
        ctx: &ResourceContext,
        element: &StoredElement,
        tagging_results: &TaggingResults,
        use_full_dictionary: bool,
    ) -> Result<(BTreeSet<DirectAnnotation>, usize), AppError> {
        let mut out = BTreeSet::new();
        let since = if use_full_dictionary { None } else { element.annotated_dictionary_id };

        for spec in &ctx.structure.contexts {
            if let Some(scope) = spec.concept_scope() {
                let Some(value) = element.element.value(&spec.name) else {
                    continue;
                };
                let codes: BTreeSet<String> = value
                    .split('>')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect();
                for concept_id in self.graph.resolve_terms_to_concepts(&codes, &scope)? {
                    out.insert(DirectAnnotation {
                        element_id: element.id,
                        concept_id,
                        context_name: spec.name.clone(),
                        term_id: None,
                        weight_class: WeightClass::Reported,
                        dictionary_id: None,
                    });
                }
                continue;
            }

            for hit in tagging_results.context(&spec.name) {
                let Some(term) = self.term(hit.term_id)? else {
                    debug!(term_id = hit.term_id, "hit on unknown term ignored");
                    continue;
                };
                if self.stop_list.contains(&term.name) {
                    continue;
                }
                if since.is_some_and(|last| term.dictionary_id <= last) {
                    continue;
                }
                out.insert(DirectAnnotation {
                    element_id: element.id,
                    concept_id: term.concept_id,
                    context_name: spec.name.clone(),
                    term_id: Some(hit.term_id),
                    weight_class: spec.weight.into(),
                    dictionary_id: Some(term.dictionary_id),
                });
            }
        }

        let inserted = self.insert_all(ctx, &out)?;
        Ok((out, inserted))
    }

    /// Tag and annotate every element not yet annotated against the newest
    /// dictionary.
    ///
    /// Each element only sees terms newer than its own annotated dictionary,
    /// so elements never annotated get the full dictionary. An element is
    /// marked annotated only when every context tagged cleanly; a tagging
    /// failure keeps the hits of its other contexts and leaves it due for
    /// the next run. Store failures abort.
    pub async fn run(
        &self,
        ctx: &ResourceContext,
        tagger: &Tagger,
        use_full_dictionary: bool,
    ) -> Result<AnnotationReport, AppError> {
        let latest = self.graph.latest_dictionary_id()?;
        let elements = self.resources.elements(&ctx.resource_id)?;
        let mut report = AnnotationReport::default();
        let due: Vec<&StoredElement> = elements
            .iter()
            .filter(|e| use_full_dictionary || e.annotated_dictionary_id.is_none_or(|d| Some(d) < latest))
            .collect();
        report.up_to_date = elements.len() - due.len();

        let since = if use_full_dictionary {
            None
        } else {
            due.iter().map(|e| e.annotated_dictionary_id).min().flatten()
        };
        let dictionary = self.graph.dictionary(since, &self.stop_list)?;
        info!(
            resource_id = %ctx.resource_id,
            elements = due.len(),
            up_to_date = report.up_to_date,
            terms = dictionary.len(),
            tagger = tagger.name(),
            full = use_full_dictionary,
            "annotation started"
        );

        for element in due {
            report.elements += 1;
            let mut results = TaggingResults::default();
            let mut complete = true;
            for spec in ctx.structure.contexts.iter().filter(|c| !c.is_concept_field()) {
                let Some(text) = element.element.value(&spec.name) else {
                    continue;
                };
                match tagger.tag(text, &dictionary).await {
                    Ok(hits) => results.insert(&spec.name, hits),
                    Err(e) => {
                        warn!(
                            resource_id = %ctx.resource_id,
                            element = %element.element.local_element_id,
                            context = %spec.name,
                            "tagging failed, element kept for the next run: {e}"
                        );
                        complete = false;
                    }
                }
            }
            let (annotations, inserted) =
                self.annotate_counted(ctx, element, &results, use_full_dictionary)?;
            report.annotations += annotations.len();
            report.inserted += inserted;
            if complete {
                self.resources.mark_annotated(element.id, latest)?;
            } else {
                report.failed += 1;
            }
        }

        info!(
            resource_id = %ctx.resource_id,
            elements = report.elements,
            inserted = report.inserted,
            failed = report.failed,
            "annotation finished"
        );
        Ok(report)
    }

    /// Direct annotations of one element, ordered.
    pub fn annotations_for(&self, ctx: &ResourceContext, element_id: i64) -> Result<Vec<DirectAnnotation>, AppError> {
        let rows: Vec<(i64, String, Option<i64>, String, Option<i64>)> =
            self.store.with_conn("annotations_for", |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT concept_id, context_name, term_id, weight_class, dictionary_id
                         FROM obr_direct_annotation
                         WHERE resource_id = ?1 AND element_id = ?2
                         ORDER BY concept_id, context_name",
                    )
                    .map_err(|e| AppError::from_sqlite("annotation: prepare list", e))?;
                let rows = stmt
                    .query_map(params![ctx.resource_id, element_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                    })
                    .map_err(|e| AppError::from_sqlite("annotation: query list", e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| AppError::from_sqlite("annotation: map row", e))
            })?;
        rows.into_iter()
            .map(|(concept_id, context_name, term_id, class, dictionary_id)| {
                Ok(DirectAnnotation {
                    element_id,
                    concept_id,
                    context_name,
                    term_id,
                    weight_class: WeightClass::parse(&class)?,
                    dictionary_id,
                })
            })
            .collect()
    }

    /// Delete direct annotations on concepts of the given ontology versions.
    pub fn remove_annotations(
        &self,
        ctx: &ResourceContext,
        local_ontology_ids: &[String],
    ) -> Result<RemovalReport, AppError> {
        removal::remove_for_versions(
            &self.store,
            ctx,
            "obr_direct_annotation",
            &["concept_id"],
            local_ontology_ids,
        )
    }

    fn term(&self, term_id: i64) -> Result<Option<TermRow>, AppError> {
        self.store.with_conn("annotation_term", |conn| {
            conn.prepare_cached("SELECT name, concept_id, dictionary_id FROM obr_term WHERE id = ?1")
                .and_then(|mut stmt| {
                    stmt.query_row(params![term_id], |row| {
                        Ok(TermRow {
                            name: row.get(0)?,
                            concept_id: row.get(1)?,
                            dictionary_id: row.get(2)?,
                        })
                    })
                    .optional()
                })
                .map_err(|e| AppError::from_sqlite("annotation: lookup term", e))
        })
    }

    fn insert_all(&self, ctx: &ResourceContext, annotations: &BTreeSet<DirectAnnotation>) -> Result<usize, AppError> {
        if annotations.is_empty() {
            return Ok(0);
        }
        self.store.with_conn("insert_annotations", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("annotation: begin insert", e))?;
            let mut inserted = 0;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT OR IGNORE INTO obr_direct_annotation
                         (resource_id, element_id, concept_id, context_name, term_id, weight_class, dictionary_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )
                    .map_err(|e| AppError::from_sqlite("annotation: prepare insert", e))?;
                for a in annotations {
                    inserted += stmt
                        .execute(params![
                            ctx.resource_id,
                            a.element_id,
                            a.concept_id,
                            a.context_name,
                            a.term_id,
                            a.weight_class.as_str(),
                            a.dictionary_id
                        ])
                        .map_err(|e| AppError::from_sqlite("annotation: insert", e))?;
                }
            }
            tx.commit()
                .map_err(|e| AppError::from_sqlite("annotation: commit insert", e))?;
            Ok(inserted)
        })
    }
}

struct TermRow {
    name: String,
    concept_id: ConceptId,
    dictionary_id: i64,
}
