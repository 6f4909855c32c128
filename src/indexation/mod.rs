//! Index publication.
//!
//! The index is a filtered copy of `obr_aggregation` for one resource and
//! carries no state of its own: [`IndexationEngine::indexation`] always
//! rebuilds it from the aggregated scores.

use std::sync::Arc;

use rusqlite::params;
use tracing::info;

use crate::error::AppError;
use crate::ontology::ConceptId;
use crate::removal::{self, RemovalReport};
use crate::resource::ResourceContext;
use crate::store::Store;

/// Which aggregated rows are published.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexPolicy {
    /// Rows scoring below this are dropped. Zero scores are never indexed.
    pub min_score: f64,
    /// Keep at most this many concepts per element, highest score first.
    pub top_k_per_element: Option<usize>,
}

impl Default for IndexPolicy {
    fn default() -> Self {
        Self {
            min_score: 0.0,
            top_k_per_element: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub concept_id: ConceptId,
    pub local_concept_id: String,
    pub final_score: f64,
}

pub struct IndexationEngine {
    store: Arc<Store>,
    policy: IndexPolicy,
}

impl IndexationEngine {
    pub fn new(store: Arc<Store>, policy: IndexPolicy) -> Self {
        Self { store, policy }
    }

    /// Replace the resource's index with the aggregated rows passing the
    /// policy. Returns the number of rows published.
    pub fn indexation(&self, ctx: &ResourceContext) -> Result<usize, AppError> {
        let policy = self.policy;
        let written = self.store.with_conn("indexation", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("indexation: begin", e))?;
            tx.execute("DELETE FROM obr_index WHERE resource_id = ?1", params![ctx.resource_id])
                .map_err(|e| AppError::from_sqlite("indexation: clear", e))?;

            let rows: Vec<(i64, ConceptId, f64)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT element_id, concept_id, score FROM obr_aggregation
                         WHERE resource_id = ?1 AND score > 0 AND score >= ?2
                         ORDER BY element_id, score DESC, concept_id",
                    )
                    .map_err(|e| AppError::from_sqlite("indexation: prepare select", e))?;
                let rows = stmt
                    .query_map(params![ctx.resource_id, policy.min_score], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .map_err(|e| AppError::from_sqlite("indexation: query aggregation", e))?;
                rows.collect::<Result<Vec<_>, _>>()
                    .map_err(|e| AppError::from_sqlite("indexation: map aggregation row", e))?
            };

            let mut written = 0;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO obr_index (resource_id, element_id, concept_id, final_score)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .map_err(|e| AppError::from_sqlite("indexation: prepare insert", e))?;
                let mut current: Option<i64> = None;
                let mut kept = 0usize;
                for (element_id, concept_id, score) in rows {
                    if current != Some(element_id) {
                        current = Some(element_id);
                        kept = 0;
                    }
                    if policy.top_k_per_element.is_some_and(|k| kept >= k) {
                        continue;
                    }
                    stmt.execute(params![ctx.resource_id, element_id, concept_id, score])
                        .map_err(|e| AppError::from_sqlite("indexation: insert", e))?;
                    kept += 1;
                    written += 1;
                }
            }
            tx.commit()
                .map_err(|e| AppError::from_sqlite("indexation: commit", e))?;
            Ok(written)
        })?;

        info!(resource_id = %ctx.resource_id, rows = written, "index published");
        Ok(written)
    }

    /// Index entries of one element, strongest first. Unknown elements
    /// yield an empty list.
    pub fn index_for_element(&self, ctx: &ResourceContext, local_element_id: &str) -> Result<Vec<IndexEntry>, AppError> {
        self.store.with_conn("index_for_element", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT i.concept_id, c.local_concept_id, i.final_score
                     FROM obr_index i
                     JOIN obr_element e ON e.id = i.element_id
                     JOIN obr_concept c ON c.id = i.concept_id
                     WHERE i.resource_id = ?1 AND e.local_element_id = ?2
                     ORDER BY i.final_score DESC, c.local_concept_id",
                )
                .map_err(|e| AppError::from_sqlite("indexation: prepare lookup", e))?;
            let rows = stmt
                .query_map(params![ctx.resource_id, local_element_id], |row| {
                    Ok(IndexEntry {
                        concept_id: row.get(0)?,
                        local_concept_id: row.get(1)?,
                        final_score: row.get(2)?,
                    })
                })
                .map_err(|e| AppError::from_sqlite("indexation: query lookup", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("indexation: map lookup row", e))
        })
    }

    pub fn remove_index(&self, ctx: &ResourceContext, local_ontology_ids: &[String]) -> Result<RemovalReport, AppError> {
        removal::remove_for_versions(&self.store, ctx, "obr_index", &["concept_id"], local_ontology_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ontology::{ConceptRecord, OntologyBundle, OntologyGraphStore, OntologyRecord};
    use crate::resource::{ContextSpec, ContextWeight, Element, Resource, ResourceStore, Structure};
    use tempfile::TempDir;

    struct Inline(Structure, Vec<Element>);

    impl Resource for Inline {
        fn id(&self) -> &str {
            "RES"
        }
        fn name(&self) -> &str {
            "inline"
        }
        fn structure(&self) -> &Structure {
            &self.0
        }
        fn fetch_elements(&self) -> Result<Vec<Element>, AppError> {
            Ok(self.1.clone())
        }
        fn element_url(&self, local_element_id: &str) -> String {
            local_element_id.to_string()
        }
    }

    /// E1: X1 0.9, X2 0.3, X3 0.0; E2: X2 1.0
    fn fixture() -> (TempDir, Arc<Store>, ResourceContext) {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(tmp.path()).unwrap());
        let graph = OntologyGraphStore::new(store.clone());
        graph
            .ingest_bundle(&OntologyBundle {
                ontology: OntologyRecord {
                    local_ontology_id: "X.1".into(),
                    virtual_ontology_id: "X".into(),
                    name: "X".into(),
                    version: "1".into(),
                    status: 0,
                    format: String::new(),
                },
                concepts: ["X1", "X2", "X3"]
                    .iter()
                    .map(|id| ConceptRecord {
                        local_concept_id: (*id).into(),
                        is_toplevel: true,
                        terms: Vec::new(),
                        parents: Vec::new(),
                    })
                    .collect(),
                relations: Vec::new(),
                mappings: Vec::new(),
            })
            .unwrap();

        let resource = Inline(
            Structure::new(vec![ContextSpec::text("title", ContextWeight::Primary)]),
            vec![Element::new("E1", [("title", "a")]), Element::new("E2", [("title", "b")])],
        );
        let resources = ResourceStore::new(store.clone());
        let ctx = resources.register(&resource).unwrap();
        resources.update_elements(&ctx, &resource).unwrap();

        let e1 = resources.element("RES", "E1").unwrap().unwrap().id;
        let e2 = resources.element("RES", "E2").unwrap().unwrap().id;
        let c = |local: &str| graph.concept_id(local).unwrap().unwrap();
        let rows = [(e1, c("X1"), 0.9), (e1, c("X2"), 0.3), (e1, c("X3"), 0.0), (e2, c("X2"), 1.0)];
        store
            .with_conn("seed_aggregation", |conn| {
                for (element_id, concept_id, score) in rows {
                    conn.execute(
                        "INSERT INTO obr_aggregation (resource_id, element_id, concept_id, score)
                         VALUES ('RES', ?1, ?2, ?3)",
                        params![element_id, concept_id, score],
                    )
                    .map_err(|e| AppError::from_sqlite("seed", e))?;
                }
                Ok(())
            })
            .unwrap();
        (tmp, store, ctx)
    }

    fn locals(entries: &[IndexEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.local_concept_id.as_str()).collect()
    }

    #[test]
    fn zero_scores_are_never_published() {
        let (_tmp, store, ctx) = fixture();
        let engine = IndexationEngine::new(store, IndexPolicy::default());
        assert_eq!(engine.indexation(&ctx).unwrap(), 3);
        assert_eq!(locals(&engine.index_for_element(&ctx, "E1").unwrap()), ["X1", "X2"]);
        // republishing replaces rather than duplicates
        assert_eq!(engine.indexation(&ctx).unwrap(), 3);
    }

    #[test]
    fn min_score_filters_weak_rows() {
        let (_tmp, store, ctx) = fixture();
        let policy = IndexPolicy { min_score: 0.5, top_k_per_element: None };
        let engine = IndexationEngine::new(store, policy);
        assert_eq!(engine.indexation(&ctx).unwrap(), 2);
        assert_eq!(locals(&engine.index_for_element(&ctx, "E1").unwrap()), ["X1"]);
        assert_eq!(locals(&engine.index_for_element(&ctx, "E2").unwrap()), ["X2"]);
    }

    #[test]
    fn top_k_keeps_strongest_per_element() {
        let (_tmp, store, ctx) = fixture();
        let policy = IndexPolicy { min_score: 0.0, top_k_per_element: Some(1) };
        let engine = IndexationEngine::new(store, policy);
        assert_eq!(engine.indexation(&ctx).unwrap(), 2);
        let e1 = engine.index_for_element(&ctx, "E1").unwrap();
        assert_eq!(locals(&e1), ["X1"]);
        assert!((e1[0].final_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn unknown_element_has_empty_index() {
        let (_tmp, store, ctx) = fixture();
        let engine = IndexationEngine::new(store, IndexPolicy::default());
        engine.indexation(&ctx).unwrap();
        assert!(engine.index_for_element(&ctx, "missing").unwrap().is_empty());
    }
}
