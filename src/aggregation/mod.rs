//! Weighted score fusion.
//!
//! `score(element, concept)` is the sum of one contribution per distinct
//! annotation instance touching the pair:
//!
//! ```text
//!   direct            weight(class)
//!   is-a, level l     weight(class) * isa_factor ^ l
//!   mapping           weight(class) * mapping
//! ```
//!
//! Contributions are recomputed from the stored class/level/variant with the
//! weights handed to [`AggregationEngine::aggregate`], never read back from
//! a previous run.

use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::params;
use tracing::info;

use crate::annotation::WeightClass;
use crate::error::AppError;
use crate::expansion::Variant;
use crate::ontology::ConceptId;
use crate::removal::{self, RemovalReport};
use crate::resource::ResourceContext;
use crate::store::Store;

/// The five independent scoring knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub primary: f64,
    pub secondary: f64,
    pub isa_factor: f64,
    pub mapping: f64,
    pub reported: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            primary: 1.0,
            secondary: 0.8,
            isa_factor: 0.6,
            mapping: 0.5,
            reported: 1.0,
        }
    }
}

impl Weights {
    /// Every weight must be finite and non-negative; that is what keeps
    /// scores monotone when annotations are added.
    pub fn validate(&self) -> Result<(), AppError> {
        let named = [
            ("primary", self.primary),
            ("secondary", self.secondary),
            ("isa_factor", self.isa_factor),
            ("mapping", self.mapping),
            ("reported", self.reported),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(AppError::Config(format!(
                    "weights.{name} must be a non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn base(&self, class: WeightClass) -> f64 {
        match class {
            WeightClass::Primary => self.primary,
            WeightClass::Secondary => self.secondary,
            WeightClass::Reported => self.reported,
        }
    }

    pub fn isa_weight(&self, class: WeightClass, level: u32) -> f64 {
        self.base(class) * self.isa_factor.powi(level as i32)
    }

    pub fn mapping_weight(&self, class: WeightClass) -> f64 {
        self.base(class) * self.mapping
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedEntry {
    pub element_id: i64,
    pub concept_id: ConceptId,
    pub score: f64,
}

pub struct AggregationEngine {
    store: Arc<Store>,
}

impl AggregationEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Recompute every aggregated score of the resource. Returns the number
    /// of (element, concept) rows written.
    pub fn aggregate(&self, ctx: &ResourceContext, weights: &Weights) -> Result<usize, AppError> {
        weights.validate()?;
        let written = self.store.with_conn("aggregate", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("aggregation: begin", e))?;
            let mut scores: BTreeMap<(i64, ConceptId), f64> = BTreeMap::new();

            {
                let mut stmt = tx
                    .prepare(
                        "SELECT element_id, concept_id, weight_class FROM obr_direct_annotation
                         WHERE resource_id = ?1",
                    )
                    .map_err(|e| AppError::from_sqlite("aggregation: prepare directs", e))?;
                let rows = stmt
                    .query_map(params![ctx.resource_id], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, ConceptId>(1)?, row.get::<_, String>(2)?))
                    })
                    .map_err(|e| AppError::from_sqlite("aggregation: query directs", e))?;
                for row in rows {
                    let (element_id, concept_id, class) =
                        row.map_err(|e| AppError::from_sqlite("aggregation: map direct row", e))?;
                    let class = WeightClass::parse(&class)?;
                    *scores.entry((element_id, concept_id)).or_default() += weights.base(class);
                }
            }

            {
                let mut stmt = tx
                    .prepare(
                        "SELECT element_id, concept_id, variant, level, weight_class
                         FROM obr_expanded_annotation WHERE resource_id = ?1",
                    )
                    .map_err(|e| AppError::from_sqlite("aggregation: prepare expanded", e))?;
                let rows = stmt
                    .query_map(params![ctx.resource_id], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, ConceptId>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<u32>>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    })
                    .map_err(|e| AppError::from_sqlite("aggregation: query expanded", e))?;
                for row in rows {
                    let (element_id, concept_id, variant, level, class) =
                        row.map_err(|e| AppError::from_sqlite("aggregation: map expanded row", e))?;
                    let class = WeightClass::parse(&class)?;
                    let contribution = match Variant::parse(&variant)? {
                        Variant::Isa => weights.isa_weight(class, level.unwrap_or(1)),
                        Variant::Map => weights.mapping_weight(class),
                    };
                    *scores.entry((element_id, concept_id)).or_default() += contribution;
                }
            }

            tx.execute("DELETE FROM obr_aggregation WHERE resource_id = ?1", params![ctx.resource_id])
                .map_err(|e| AppError::from_sqlite("aggregation: clear", e))?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO obr_aggregation (resource_id, element_id, concept_id, score)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(|e| AppError::from_sqlite("aggregation: prepare insert", e))?;
                for ((element_id, concept_id), score) in &scores {
                    stmt.execute(params![ctx.resource_id, element_id, concept_id, score])
                        .map_err(|e| AppError::from_sqlite("aggregation: insert", e))?;
                }
            }
            tx.commit()
                .map_err(|e| AppError::from_sqlite("aggregation: commit", e))?;
            Ok(scores.len())
        })?;

        info!(resource_id = %ctx.resource_id, rows = written, "aggregation finished");
        Ok(written)
    }

    /// Recompute the per-concept count of elements with a nonzero score.
    pub fn calculate_concept_frequency(&self, ctx: &ResourceContext) -> Result<usize, AppError> {
        let written = self.store.with_conn("concept_frequency", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("frequency: begin", e))?;
            tx.execute(
                "DELETE FROM obr_concept_frequency WHERE resource_id = ?1",
                params![ctx.resource_id],
            )
            .map_err(|e| AppError::from_sqlite("frequency: clear", e))?;
            let n = tx
                .execute(
                    "INSERT INTO obr_concept_frequency (resource_id, concept_id, count)
                     SELECT resource_id, concept_id, COUNT(DISTINCT element_id)
                     FROM obr_aggregation
                     WHERE resource_id = ?1 AND score > 0
                     GROUP BY resource_id, concept_id",
                    params![ctx.resource_id],
                )
                .map_err(|e| AppError::from_sqlite("frequency: insert", e))?;
            tx.commit()
                .map_err(|e| AppError::from_sqlite("frequency: commit", e))?;
            Ok(n)
        })?;
        info!(resource_id = %ctx.resource_id, concepts = written, "concept frequency calculated");
        Ok(written)
    }

    /// Aggregated rows of one element, strongest first.
    pub fn scores_for(&self, ctx: &ResourceContext, element_id: i64) -> Result<Vec<AggregatedEntry>, AppError> {
        self.store.with_conn("scores_for", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT concept_id, score FROM obr_aggregation
                     WHERE resource_id = ?1 AND element_id = ?2
                     ORDER BY score DESC, concept_id",
                )
                .map_err(|e| AppError::from_sqlite("aggregation: prepare scores", e))?;
            let rows = stmt
                .query_map(params![ctx.resource_id, element_id], |row| {
                    Ok(AggregatedEntry {
                        element_id,
                        concept_id: row.get(0)?,
                        score: row.get(1)?,
                    })
                })
                .map_err(|e| AppError::from_sqlite("aggregation: query scores", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("aggregation: map score row", e))
        })
    }

    pub fn concept_frequency(&self, ctx: &ResourceContext, concept_id: ConceptId) -> Result<i64, AppError> {
        self.store.with_conn("concept_frequency_lookup", |conn| {
            conn.query_row(
                "SELECT COALESCE(SUM(count), 0) FROM obr_concept_frequency
                 WHERE resource_id = ?1 AND concept_id = ?2",
                params![ctx.resource_id, concept_id],
                |row| row.get(0),
            )
            .map_err(|e| AppError::from_sqlite("frequency: lookup", e))
        })
    }

    pub fn remove_aggregation(
        &self,
        ctx: &ResourceContext,
        local_ontology_ids: &[String],
    ) -> Result<RemovalReport, AppError> {
        removal::remove_for_versions(&self.store, ctx, "obr_aggregation", &["concept_id"], local_ontology_ids)
    }

    pub fn remove_concept_frequency(
        &self,
        ctx: &ResourceContext,
        local_ontology_ids: &[String],
    ) -> Result<RemovalReport, AppError> {
        removal::remove_for_versions(
            &self.store,
            ctx,
            "obr_concept_frequency",
            &["concept_id"],
            local_ontology_ids,
        )
    }
}
