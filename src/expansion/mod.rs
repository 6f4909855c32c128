//! Semantic expansion: derives annotations on related concepts.
//!
//! For each direct annotation on concept *c*:
//!
//! | mode     | emits one row per                 | derived weight                    |
//! |----------|-----------------------------------|-----------------------------------|
//! | is-a     | ancestor of *c* at distance `l`   | `base * isa_factor ^ l`           |
//! | mapping  | concept mapped from *c*           | `base * mapping`                  |
//! | distance | (not implemented, emits nothing)  |                                   |
//!
//! `base` is the weight of the origin annotation's class. Only the strongest
//! row per (element, concept, variant) is stored; equal weights keep the
//! smaller origin concept id, so the table is identical however the direct
//! annotations are ordered.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::params;
use tracing::{info, warn};

use crate::aggregation::Weights;
use crate::annotation::WeightClass;
use crate::error::AppError;
use crate::ontology::{ConceptId, OntologyGraphStore};
use crate::removal::{self, RemovalReport};
use crate::resource::ResourceContext;
use crate::store::Store;

/// Which expansion passes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionModes {
    pub isa: bool,
    pub mapping: bool,
    pub distance: bool,
}

impl Default for ExpansionModes {
    fn default() -> Self {
        Self {
            isa: true,
            mapping: true,
            distance: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Isa,
    Map,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Isa => "isa",
            Variant::Map => "map",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "isa" => Ok(Variant::Isa),
            "map" => Ok(Variant::Map),
            other => Err(AppError::Store(format!("unknown expansion variant '{other}'"))),
        }
    }
}

/// One stored expanded annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedAnnotation {
    pub element_id: i64,
    pub concept_id: ConceptId,
    pub origin_concept_id: ConceptId,
    pub variant: Variant,
    pub level: Option<u32>,
    pub mapping_type: Option<String>,
    pub weight_class: WeightClass,
    pub derived_weight: f64,
}

/// Rows written per pass. A row counts when it was inserted or replaced a
/// weaker one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionReport {
    pub isa: usize,
    pub mapping: usize,
    pub distance: usize,
}

pub struct SemanticExpansionEngine {
    store: Arc<Store>,
    graph: OntologyGraphStore,
}

impl SemanticExpansionEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            graph: OntologyGraphStore::new(store.clone()),
            store,
        }
    }

    /// Run every enabled pass.
    pub fn expand(
        &self,
        ctx: &ResourceContext,
        modes: ExpansionModes,
        weights: &Weights,
    ) -> Result<ExpansionReport, AppError> {
        let mut report = ExpansionReport::default();
        if modes.isa {
            report.isa = self.expand_isa(ctx, weights)?;
        }
        if modes.mapping {
            report.mapping = self.expand_mapping(ctx, weights)?;
        }
        if modes.distance {
            report.distance = self.expand_distance(ctx)?;
        }
        Ok(report)
    }

    pub fn expand_isa(&self, ctx: &ResourceContext, weights: &Weights) -> Result<usize, AppError> {
        let directs = self.direct_origins(ctx)?;
        let mut ancestors: HashMap<ConceptId, Vec<(ConceptId, u32)>> = HashMap::new();
        let mut rows = Vec::new();

        for (element_id, concept_id, class) in directs {
            if !ancestors.contains_key(&concept_id) {
                ancestors.insert(concept_id, self.graph.ancestors_of(concept_id)?);
            }
            for &(ancestor, level) in ancestors.get(&concept_id).into_iter().flatten() {
                rows.push(ExpandedAnnotation {
                    element_id,
                    concept_id: ancestor,
                    origin_concept_id: concept_id,
                    variant: Variant::Isa,
                    level: Some(level),
                    mapping_type: None,
                    weight_class: class,
                    derived_weight: weights.isa_weight(class, level),
                });
            }
        }

        let written = self.upsert_strongest(ctx, &rows)?;
        info!(resource_id = %ctx.resource_id, candidates = rows.len(), written, "is-a expansion finished");
        Ok(written)
    }

    pub fn expand_mapping(&self, ctx: &ResourceContext, weights: &Weights) -> Result<usize, AppError> {
        let directs = self.direct_origins(ctx)?;
        let mut mappings: HashMap<ConceptId, Vec<(ConceptId, String)>> = HashMap::new();
        let mut rows = Vec::new();

        for (element_id, concept_id, class) in directs {
            if !mappings.contains_key(&concept_id) {
                mappings.insert(concept_id, self.graph.mappings_of(concept_id)?);
            }
            for (mapped, mapping_type) in mappings.get(&concept_id).into_iter().flatten() {
                if *mapped == concept_id {
                    continue;
                }
                rows.push(ExpandedAnnotation {
                    element_id,
                    concept_id: *mapped,
                    origin_concept_id: concept_id,
                    variant: Variant::Map,
                    level: None,
                    mapping_type: Some(mapping_type.clone()),
                    weight_class: class,
                    derived_weight: weights.mapping_weight(class),
                });
            }
        }

        let written = self.upsert_strongest(ctx, &rows)?;
        info!(resource_id = %ctx.resource_id, candidates = rows.len(), written, "mapping expansion finished");
        Ok(written)
    }

    /// Semantic-distance expansion is declared but not implemented; it
    /// produces no rows.
    pub fn expand_distance(&self, ctx: &ResourceContext) -> Result<usize, AppError> {
        warn!(resource_id = %ctx.resource_id, "distance expansion is not implemented, no rows produced");
        Ok(0)
    }

    /// Expanded rows of one element, ordered by concept and variant.
    pub fn expanded_for(&self, ctx: &ResourceContext, element_id: i64) -> Result<Vec<ExpandedAnnotation>, AppError> {
        type Row = (ConceptId, ConceptId, String, Option<u32>, Option<String>, String, f64);
        let rows: Vec<Row> = self.store.with_conn("expanded_for", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT concept_id, origin_concept_id, variant, level, mapping_type, weight_class, derived_weight
                     FROM obr_expanded_annotation
                     WHERE resource_id = ?1 AND element_id = ?2
                     ORDER BY concept_id, variant",
                )
                .map_err(|e| AppError::from_sqlite("expansion: prepare list", e))?;
            let rows = stmt
                .query_map(params![ctx.resource_id, element_id], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                })
                .map_err(|e| AppError::from_sqlite("expansion: query list", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("expansion: map row", e))
        })?;

        rows.into_iter()
            .map(|(concept_id, origin, variant, level, mapping_type, class, weight)| {
                Ok(ExpandedAnnotation {
                    element_id,
                    concept_id,
                    origin_concept_id: origin,
                    variant: Variant::parse(&variant)?,
                    level,
                    mapping_type,
                    weight_class: WeightClass::parse(&class)?,
                    derived_weight: weight,
                })
            })
            .collect()
    }

    /// Delete expanded rows whose concept or origin concept belongs to one
    /// of the given versions.
    pub fn remove_expanded_annotations(
        &self,
        ctx: &ResourceContext,
        local_ontology_ids: &[String],
    ) -> Result<RemovalReport, AppError> {
        removal::remove_for_versions(
            &self.store,
            ctx,
            "obr_expanded_annotation",
            &["concept_id", "origin_concept_id"],
            local_ontology_ids,
        )
    }

    /// `(element_id, concept_id, weight_class)` of every direct annotation.
    fn direct_origins(&self, ctx: &ResourceContext) -> Result<Vec<(i64, ConceptId, WeightClass)>, AppError> {
        let rows: Vec<(i64, ConceptId, String)> = self.store.with_conn("direct_origins", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT element_id, concept_id, weight_class FROM obr_direct_annotation
                     WHERE resource_id = ?1 ORDER BY element_id, concept_id, context_name",
                )
                .map_err(|e| AppError::from_sqlite("expansion: prepare directs", e))?;
            let rows = stmt
                .query_map(params![ctx.resource_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(|e| AppError::from_sqlite("expansion: query directs", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("expansion: map direct row", e))
        })?;
        rows.into_iter()
            .map(|(element_id, concept_id, class)| Ok((element_id, concept_id, WeightClass::parse(&class)?)))
            .collect()
    }

    fn upsert_strongest(&self, ctx: &ResourceContext, rows: &[ExpandedAnnotation]) -> Result<usize, AppError> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.store.with_conn("upsert_expanded", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("expansion: begin upsert", e))?;
            let mut written = 0;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO obr_expanded_annotation
                         (resource_id, element_id, concept_id, origin_concept_id, variant,
                          level, mapping_type, weight_class, derived_weight)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                         ON CONFLICT(element_id, concept_id, variant) DO UPDATE SET
                            origin_concept_id = excluded.origin_concept_id,
                            level = excluded.level,
                            mapping_type = excluded.mapping_type,
                            weight_class = excluded.weight_class,
                            derived_weight = excluded.derived_weight
                         WHERE excluded.derived_weight > obr_expanded_annotation.derived_weight
                            OR (excluded.derived_weight = obr_expanded_annotation.derived_weight
                                AND excluded.origin_concept_id < obr_expanded_annotation.origin_concept_id)",
                    )
                    .map_err(|e| AppError::from_sqlite("expansion: prepare upsert", e))?;
                for r in rows {
                    written += stmt
                        .execute(params![
                            ctx.resource_id,
                            r.element_id,
                            r.concept_id,
                            r.origin_concept_id,
                            r.variant.as_str(),
                            r.level,
                            r.mapping_type,
                            r.weight_class.as_str(),
                            r.derived_weight
                        ])
                        .map_err(|e| AppError::from_sqlite("expansion: upsert", e))?;
                }
            }
            tx.commit()
                .map_err(|e| AppError::from_sqlite("expansion: commit upsert", e))?;
            Ok(written)
        })
    }
}
