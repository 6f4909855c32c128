//! `ontology`: the concept graph store.
//!
//! Holds ontology versions, their concepts and terms, the precomputed is-a
//! closure (`obr_relation`) and cross-ontology mappings (`obr_map`), and
//! answers the three queries the pipeline needs:
//!
//! - [`OntologyGraphStore::resolve_terms_to_concepts`]: names/codes → concepts
//! - [`OntologyGraphStore::ancestors_of`]: one indexed read of the closure
//! - [`OntologyGraphStore::mappings_of`]: mapped concepts with mapping type
//!
//! Every insert is idempotent: re-inserting an existing key is a silent
//! no-op reported as `Ok(false)`.
//!
//! Concepts belong to exactly one ontology version. Two versions of an
//! ontology may reuse a local concept id; each gets its own concept row, and
//! a lookup by local id alone returns the most recently loaded one.
//!
//! ## Ingestion
//! Ontology versions arrive as [`OntologyBundle`] values (one JSON file per
//! version in the feed directory). Each ingested bundle gets a fresh
//! dictionary id so later annotation runs can restrict matching to the
//! terms added since their previous run.

pub mod closure;

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::store::{Store, now_iso8601, placeholders};
use crate::tagger::{Dictionary, DictionaryEntry, StopList};

/// Internal row id of a concept.
pub type ConceptId = i64;

// ── Row types ─────────────────────────────────────────────────────────────────

/// One loaded version of an ontology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ontology {
    pub id: i64,
    /// Identifies this specific version; unique.
    pub local_ontology_id: String,
    /// Stable identity shared by all versions of the same ontology.
    pub virtual_ontology_id: String,
    pub name: String,
    pub version: String,
    pub status: i64,
    pub format: String,
    pub dictionary_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concept {
    pub id: ConceptId,
    pub local_concept_id: String,
    pub ontology_id: i64,
    pub is_toplevel: bool,
}

/// Which ontology versions a term lookup may resolve into.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OntologyScope {
    #[default]
    All,
    /// The latest loaded version of each virtual ontology.
    Virtual(Vec<String>),
    /// Exactly these local versions.
    Local(Vec<String>),
}

// ── Bundle (upstream feed) ────────────────────────────────────────────────────

/// One ontology version as delivered by the upstream feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyBundle {
    pub ontology: OntologyRecord,
    #[serde(default)]
    pub concepts: Vec<ConceptRecord>,
    /// Precomputed closure rows. When empty, the closure is derived from
    /// each concept's `parents`.
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
    #[serde(default)]
    pub mappings: Vec<MapRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OntologyRecord {
    pub local_ontology_id: String,
    pub virtual_ontology_id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptRecord {
    pub local_concept_id: String,
    #[serde(default)]
    pub is_toplevel: bool,
    #[serde(default)]
    pub terms: Vec<TermRecord>,
    /// Direct is-a parents (local concept ids).
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermRecord {
    pub name: String,
    #[serde(default)]
    pub is_preferred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationRecord {
    pub local_concept_id: String,
    pub parent_local_concept_id: String,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRecord {
    pub local_concept_id: String,
    pub mapped_local_concept_id: String,
    pub mapping_type: String,
}

/// Outcome of [`OntologyGraphStore::ingest_bundle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    Loaded(IngestReport),
    /// The version is already present; the ingestion cycle has nothing to do.
    NoNewOntology { local_ontology_id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub local_ontology_id: String,
    pub virtual_ontology_id: String,
    pub dictionary_id: i64,
    pub concepts: usize,
    pub terms: usize,
    pub relations: usize,
    /// `obr_map` rows added, including earlier declared mappings this
    /// version completed.
    pub maps: usize,
    /// Declared mappings of this version whose target is not loaded yet.
    pub pending_maps: usize,
    /// Relation/map rows whose source concept is unknown.
    pub skipped: usize,
}

/// Counters for a bulk file load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkLoadReport {
    pub inserted: usize,
    /// Well-formed rows whose key already existed.
    pub existing: usize,
    /// Malformed or unresolvable rows.
    pub skipped: usize,
}

// ── OntologyGraphStore ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OntologyGraphStore {
    store: Arc<Store>,
}

impl OntologyGraphStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    // ── Dictionaries ──────────────────────────────────────────────────────

    /// Create (or fetch) the dictionary named `name` and return its id.
    pub fn create_dictionary(&self, name: &str) -> Result<i64, AppError> {
        self.store.with_conn("create_dictionary", |conn| dictionary_id_tx(conn, name))
    }

    /// Highest dictionary id, or `None` before the first ingestion.
    pub fn latest_dictionary_id(&self) -> Result<Option<i64>, AppError> {
        self.store.with_conn("latest_dictionary_id", |conn| {
            conn.query_row("SELECT MAX(id) FROM obr_dictionary", [], |row| row.get(0))
                .map_err(|e| AppError::from_sqlite("ontology: latest dictionary", e))
        })
    }

    /// Build the term dictionary handed to the tagger.
    ///
    /// `since = Some(d)` keeps only terms loaded under a dictionary id greater
    /// than `d`. Terms on the stop-list are dropped.
    pub fn dictionary(&self, since: Option<i64>, stop_list: &StopList) -> Result<Dictionary, AppError> {
        let entries = self.store.with_conn("dictionary", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, name, concept_id FROM obr_term
                     WHERE dictionary_id > ?1 ORDER BY id",
                )
                .map_err(|e| AppError::from_sqlite("ontology: prepare dictionary", e))?;
            let rows = stmt
                .query_map(params![since.unwrap_or(i64::MIN)], |row| {
                    Ok(DictionaryEntry {
                        term_id: row.get(0)?,
                        name: row.get(1)?,
                        concept_id: row.get(2)?,
                    })
                })
                .map_err(|e| AppError::from_sqlite("ontology: query dictionary", e))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| AppError::from_sqlite("ontology: map dictionary row", e))?);
            }
            Ok(out)
        })?;

        let before = entries.len();
        let entries: Vec<DictionaryEntry> = entries
            .into_iter()
            .filter(|e| !stop_list.contains(&e.name))
            .collect();
        debug!(
            terms = entries.len(),
            stopped = before - entries.len(),
            ?since,
            "dictionary built"
        );
        Ok(Dictionary::new(entries))
    }

    // ── Ontologies ────────────────────────────────────────────────────────

    pub fn insert_ontology(&self, record: &OntologyRecord, dictionary_id: Option<i64>) -> Result<bool, AppError> {
        self.store
            .with_conn("insert_ontology", |conn| insert_ontology_tx(conn, record, dictionary_id))
    }

    pub fn ontology(&self, local_ontology_id: &str) -> Result<Option<Ontology>, AppError> {
        self.store.with_conn("ontology", |conn| {
            conn.query_row(
                &format!("{ONTOLOGY_SELECT} WHERE local_ontology_id = ?1"),
                params![local_ontology_id],
                map_ontology,
            )
            .optional()
            .map_err(|e| AppError::from_sqlite("ontology: get ontology", e))
        })
    }

    /// All loaded ontology versions, in load order.
    pub fn ontologies(&self) -> Result<Vec<Ontology>, AppError> {
        self.store.with_conn("ontologies", |conn| {
            let mut stmt = conn
                .prepare(&format!("{ONTOLOGY_SELECT} ORDER BY id"))
                .map_err(|e| AppError::from_sqlite("ontology: prepare ontologies", e))?;
            let rows = stmt
                .query_map([], map_ontology)
                .map_err(|e| AppError::from_sqlite("ontology: query ontologies", e))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| AppError::from_sqlite("ontology: map ontology row", e))?);
            }
            Ok(out)
        })
    }

    /// Delete one local version; concepts, terms, relations, maps and every
    /// derived annotation row cascade with it. Declared mappings that pointed
    /// into it are re-resolved against the versions still loaded. Returns
    /// `false` if absent.
    pub fn delete_ontology(&self, local_ontology_id: &str) -> Result<bool, AppError> {
        self.store.with_conn("delete_ontology", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("ontology: begin delete", e))?;
            tx.execute(
                "DELETE FROM obr_concept WHERE ontology_id IN
                 (SELECT id FROM obr_ontology WHERE local_ontology_id = ?1)",
                params![local_ontology_id],
            )
            .map_err(|e| AppError::from_sqlite("ontology: delete concepts", e))?;
            let n = tx
                .execute(
                    "DELETE FROM obr_ontology WHERE local_ontology_id = ?1",
                    params![local_ontology_id],
                )
                .map_err(|e| AppError::from_sqlite("ontology: delete ontology", e))?;
            if n > 0 {
                resolve_declared_maps(&tx)?;
            }
            tx.commit()
                .map_err(|e| AppError::from_sqlite("ontology: commit delete", e))?;
            Ok(n > 0)
        })
    }

    // ── Concepts, terms, relations, maps ──────────────────────────────────

    /// Insert a concept into the ontology version `local_ontology_id`.
    pub fn insert_concept(
        &self,
        local_ontology_id: &str,
        local_concept_id: &str,
        is_toplevel: bool,
    ) -> Result<bool, AppError> {
        self.store.with_conn("insert_concept", |conn| {
            let ontology_id = ontology_row_id(conn, local_ontology_id)?.ok_or_else(|| {
                AppError::Store(format!("ontology: unknown ontology '{local_ontology_id}'"))
            })?;
            insert_concept_tx(conn, ontology_id, local_concept_id, is_toplevel)
        })
    }

    /// Concept carrying `local_concept_id` in the most recently loaded version.
    pub fn concept_id(&self, local_concept_id: &str) -> Result<Option<ConceptId>, AppError> {
        self.store
            .with_conn("concept_id", |conn| concept_row_id(conn, local_concept_id))
    }

    pub fn concept(&self, id: ConceptId) -> Result<Option<Concept>, AppError> {
        self.store.with_conn("concept", |conn| {
            conn.query_row(
                "SELECT id, local_concept_id, ontology_id, is_toplevel FROM obr_concept WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Concept {
                        id: row.get(0)?,
                        local_concept_id: row.get(1)?,
                        ontology_id: row.get(2)?,
                        is_toplevel: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| AppError::from_sqlite("ontology: get concept", e))
        })
    }

    pub fn insert_term(
        &self,
        concept_id: ConceptId,
        name: &str,
        is_preferred: bool,
        dictionary_id: i64,
    ) -> Result<bool, AppError> {
        self.store.with_conn("insert_term", |conn| {
            insert_term_tx(conn, concept_id, name, is_preferred, dictionary_id)
        })
    }

    pub fn insert_relation(&self, concept_id: ConceptId, parent_id: ConceptId, level: u32) -> Result<bool, AppError> {
        self.store
            .with_conn("insert_relation", |conn| insert_relation_tx(conn, concept_id, parent_id, level))
    }

    pub fn insert_map(&self, concept_id: ConceptId, mapped_id: ConceptId, mapping_type: &str) -> Result<bool, AppError> {
        self.store
            .with_conn("insert_map", |conn| insert_map_tx(conn, concept_id, mapped_id, mapping_type))
    }

    /// Local concept ids of the given versions' concepts.
    pub fn concept_ids_for_ontologies(&self, local_ontology_ids: &[String]) -> Result<Vec<ConceptId>, AppError> {
        if local_ontology_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store.with_conn("concept_ids_for_ontologies", |conn| {
            let sql = format!(
                "SELECT c.id FROM obr_concept c JOIN obr_ontology o ON o.id = c.ontology_id
                 WHERE o.local_ontology_id IN ({}) ORDER BY c.id",
                placeholders(1, local_ontology_ids.len())
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| AppError::from_sqlite("ontology: prepare concept ids", e))?;
            let rows = stmt
                .query_map(params_from_iter(local_ontology_ids.iter()), |row| row.get(0))
                .map_err(|e| AppError::from_sqlite("ontology: query concept ids", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("ontology: map concept id", e))
        })
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// Resolve term names (or local concept ids) to concepts within `scope`.
    ///
    /// Matching is case-insensitive. An ontology id in `scope` that is not
    /// loaded is logged and contributes nothing; if no id in the scope
    /// resolves, the result is empty.
    pub fn resolve_terms_to_concepts(
        &self,
        terms: &BTreeSet<String>,
        scope: &OntologyScope,
    ) -> Result<BTreeSet<ConceptId>, AppError> {
        if terms.is_empty() {
            return Ok(BTreeSet::new());
        }
        self.store.with_conn("resolve_terms_to_concepts", |conn| {
            let ontology_ids = match scope {
                OntologyScope::All => None,
                OntologyScope::Virtual(ids) => {
                    let mut out = Vec::new();
                    for vid in ids {
                        let latest: Option<i64> = conn
                            .query_row(
                                "SELECT MAX(id) FROM obr_ontology WHERE virtual_ontology_id = ?1",
                                params![vid],
                                |row| row.get(0),
                            )
                            .map_err(|e| AppError::from_sqlite("ontology: latest version", e))?;
                        match latest {
                            Some(id) => out.push(id),
                            None => warn!(virtual_ontology_id = %vid, "term resolution: unknown virtual ontology"),
                        }
                    }
                    Some(out)
                }
                OntologyScope::Local(ids) => {
                    let mut out = Vec::new();
                    for lid in ids {
                        match ontology_row_id(conn, lid)? {
                            Some(id) => out.push(id),
                            None => warn!(local_ontology_id = %lid, "term resolution: unknown local ontology"),
                        }
                    }
                    Some(out)
                }
            };

            let filter = match &ontology_ids {
                None => String::new(),
                Some(ids) if ids.is_empty() => return Ok(BTreeSet::new()),
                Some(ids) => format!(
                    " AND c.ontology_id IN ({})",
                    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
                ),
            };
            let sql = format!(
                "SELECT t.concept_id FROM obr_term t JOIN obr_concept c ON c.id = t.concept_id
                 WHERE lower(t.name) = lower(?1){filter}
                 UNION
                 SELECT c.id FROM obr_concept c WHERE lower(c.local_concept_id) = lower(?1){filter}"
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| AppError::from_sqlite("ontology: prepare resolve", e))?;

            let mut out = BTreeSet::new();
            for term in terms {
                let rows = stmt
                    .query_map(params![term.trim()], |row| row.get::<_, ConceptId>(0))
                    .map_err(|e| AppError::from_sqlite("ontology: query resolve", e))?;
                for row in rows {
                    out.insert(row.map_err(|e| AppError::from_sqlite("ontology: map resolve row", e))?);
                }
            }
            Ok(out)
        })
    }

    /// Every ancestor of `concept_id` with its is-a distance, nearest first.
    /// Reads the closure table; never traverses the graph.
    pub fn ancestors_of(&self, concept_id: ConceptId) -> Result<Vec<(ConceptId, u32)>, AppError> {
        self.store.with_conn("ancestors_of", |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT parent_concept_id, level FROM obr_relation
                     WHERE concept_id = ?1 ORDER BY level, parent_concept_id",
                )
                .map_err(|e| AppError::from_sqlite("ontology: prepare ancestors", e))?;
            let rows = stmt
                .query_map(params![concept_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| AppError::from_sqlite("ontology: query ancestors", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("ontology: map ancestor row", e))
        })
    }

    pub fn mappings_of(&self, concept_id: ConceptId) -> Result<Vec<(ConceptId, String)>, AppError> {
        self.store.with_conn("mappings_of", |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT mapped_concept_id, mapping_type FROM obr_map
                     WHERE concept_id = ?1 ORDER BY mapped_concept_id",
                )
                .map_err(|e| AppError::from_sqlite("ontology: prepare mappings", e))?;
            let rows = stmt
                .query_map(params![concept_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| AppError::from_sqlite("ontology: query mappings", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("ontology: map mapping row", e))
        })
    }

    // ── Bulk loading ──────────────────────────────────────────────────────

    /// Load closure rows from a tab-separated file.
    ///
    /// The first line is a header. Each following line is
    /// `local_concept_id<TAB>parent_local_concept_id<TAB>level`. Lines with the
    /// wrong column count, a non-positive level, or an unknown concept are
    /// skipped and counted; they never abort the load.
    pub fn load_relation_file(&self, path: &Path) -> Result<BulkLoadReport, AppError> {
        let file = File::open(path)
            .map_err(|e| AppError::Input(format!("{}: cannot open: {e}", path.display())))?;
        let mut lines = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line
                .map_err(|e| AppError::Input(format!("{}: read line {}: {e}", path.display(), n + 1)))?;
            if n > 0 && !line.trim().is_empty() {
                lines.push((n + 1, line));
            }
        }

        let report = self.store.with_conn("load_relation_file", |conn| {
            let mut report = BulkLoadReport::default();
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("ontology: begin relation load", e))?;
            let mut ids: HashMap<String, Option<ConceptId>> = HashMap::new();
            for (line_no, line) in &lines {
                let cols: Vec<&str> = line.split('\t').map(str::trim).collect();
                let parsed = match cols.as_slice() {
                    [child, parent, level] => level
                        .parse::<u32>()
                        .ok()
                        .filter(|l| *l >= 1)
                        .map(|l| (*child, *parent, l)),
                    _ => None,
                };
                let Some((child, parent, level)) = parsed else {
                    debug!(line = line_no, "relation file: malformed row skipped");
                    report.skipped += 1;
                    continue;
                };

                let child_id = cached_concept_id(&tx, &mut ids, None, child)?;
                let parent_id = cached_concept_id(&tx, &mut ids, None, parent)?;
                let (Some(c), Some(p)) = (child_id, parent_id) else {
                    debug!(line = line_no, child, parent, "relation file: unknown concept, row skipped");
                    report.skipped += 1;
                    continue;
                };
                if insert_relation_tx(&tx, c, p, level)? {
                    report.inserted += 1;
                } else {
                    report.existing += 1;
                }
            }
            tx.commit()
                .map_err(|e| AppError::from_sqlite("ontology: commit relation load", e))?;
            Ok(report)
        })?;

        info!(
            path = %path.display(),
            inserted = report.inserted,
            existing = report.existing,
            skipped = report.skipped,
            "relation file loaded"
        );
        Ok(report)
    }

    /// Read a bundle JSON file and ingest it.
    pub fn ingest_bundle_file(&self, path: &Path) -> Result<Ingest, AppError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| AppError::Input(format!("{}: cannot read: {e}", path.display())))?;
        let bundle: OntologyBundle = serde_json::from_str(&raw)
            .map_err(|e| AppError::Input(format!("{}: invalid ontology bundle: {e}", path.display())))?;
        self.ingest_bundle(&bundle)
    }

    /// Load one ontology version in a single transaction.
    ///
    /// Returns [`Ingest::NoNewOntology`] when the local version is already
    /// loaded. Local ids resolve inside this version first. Relation rows
    /// naming an unknown concept are skipped. Mappings are kept as declared
    /// and resolved now and on every later load or delete, so a target
    /// ontology may arrive after the one mapping into it.
    pub fn ingest_bundle(&self, bundle: &OntologyBundle) -> Result<Ingest, AppError> {
        let record = &bundle.ontology;
        if self.ontology(&record.local_ontology_id)?.is_some() {
            debug!(local_ontology_id = %record.local_ontology_id, "ontology already loaded");
            return Ok(Ingest::NoNewOntology {
                local_ontology_id: record.local_ontology_id.clone(),
            });
        }

        let closure_rows: Vec<(String, String, u32)> = if bundle.relations.is_empty() {
            let edges: Vec<(String, String)> = bundle
                .concepts
                .iter()
                .flat_map(|c| {
                    c.parents
                        .iter()
                        .map(move |p| (c.local_concept_id.clone(), p.clone()))
                })
                .collect();
            closure::transitive_closure(&edges)
        } else {
            bundle
                .relations
                .iter()
                .filter(|r| r.level >= 1)
                .map(|r| (r.local_concept_id.clone(), r.parent_local_concept_id.clone(), r.level))
                .collect()
        };

        let report = self.store.with_conn("ingest_bundle", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("ontology: begin ingest", e))?;
            let dictionary_id = dictionary_id_tx(
                &tx,
                &format!("{}@{}", record.local_ontology_id, now_iso8601()),
            )?;
            insert_ontology_tx(&tx, record, Some(dictionary_id))?;
            let ontology_id = ontology_row_id(&tx, &record.local_ontology_id)?.ok_or_else(|| {
                AppError::Store(format!("ontology: '{}' vanished during ingest", record.local_ontology_id))
            })?;

            let mut report = IngestReport {
                local_ontology_id: record.local_ontology_id.clone(),
                virtual_ontology_id: record.virtual_ontology_id.clone(),
                dictionary_id,
                ..IngestReport::default()
            };
            let mut ids: HashMap<String, Option<ConceptId>> = HashMap::new();

            for concept in &bundle.concepts {
                if insert_concept_tx(&tx, ontology_id, &concept.local_concept_id, concept.is_toplevel)? {
                    report.concepts += 1;
                }
                let Some(cid) = cached_concept_id(&tx, &mut ids, Some(ontology_id), &concept.local_concept_id)? else {
                    continue;
                };
                for term in &concept.terms {
                    if insert_term_tx(&tx, cid, &term.name, term.is_preferred, dictionary_id)? {
                        report.terms += 1;
                    }
                }
            }

            for (child, parent, level) in &closure_rows {
                match (
                    cached_concept_id(&tx, &mut ids, Some(ontology_id), child)?,
                    cached_concept_id(&tx, &mut ids, Some(ontology_id), parent)?,
                ) {
                    (Some(c), Some(p)) => {
                        if insert_relation_tx(&tx, c, p, *level)? {
                            report.relations += 1;
                        }
                    }
                    _ => report.skipped += 1,
                }
            }

            for map in &bundle.mappings {
                if concept_row_id_in(&tx, ontology_id, &map.local_concept_id)?.is_none() {
                    report.skipped += 1;
                    continue;
                }
                declare_map_tx(&tx, ontology_id, map)?;
            }
            report.maps = resolve_declared_maps(&tx)?;
            report.pending_maps = tx
                .query_row(
                    "SELECT COUNT(*) FROM obr_map_declared d WHERE d.ontology_id = ?1
                     AND NOT EXISTS (SELECT 1 FROM obr_concept t
                                     WHERE t.local_concept_id = d.mapped_local_concept_id)",
                    params![ontology_id],
                    |row| row.get::<_, i64>(0),
                )
                .map_err(|e| AppError::from_sqlite("ontology: count pending maps", e))? as usize;

            tx.commit()
                .map_err(|e| AppError::from_sqlite("ontology: commit ingest", e))?;
            Ok(report)
        })?;

        info!(
            local_ontology_id = %report.local_ontology_id,
            virtual_ontology_id = %report.virtual_ontology_id,
            dictionary_id = report.dictionary_id,
            concepts = report.concepts,
            terms = report.terms,
            relations = report.relations,
            maps = report.maps,
            pending_maps = report.pending_maps,
            skipped = report.skipped,
            "ontology ingested"
        );
        Ok(Ingest::Loaded(report))
    }
}

// ── Row helpers (usable inside a transaction) ─────────────────────────────────

const ONTOLOGY_SELECT: &str = "SELECT id, local_ontology_id, virtual_ontology_id, name, version, \
     status, format, dictionary_id FROM obr_ontology";

fn map_ontology(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ontology> {
    Ok(Ontology {
        id: row.get(0)?,
        local_ontology_id: row.get(1)?,
        virtual_ontology_id: row.get(2)?,
        name: row.get(3)?,
        version: row.get(4)?,
        status: row.get(5)?,
        format: row.get(6)?,
        dictionary_id: row.get(7)?,
    })
}

fn dictionary_id_tx(conn: &Connection, name: &str) -> Result<i64, AppError> {
    conn.execute(
        "INSERT OR IGNORE INTO obr_dictionary (name, created_at) VALUES (?1, ?2)",
        params![name, now_iso8601()],
    )
    .map_err(|e| AppError::from_sqlite("ontology: insert dictionary", e))?;
    conn.query_row(
        "SELECT id FROM obr_dictionary WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
    .map_err(|e| AppError::from_sqlite("ontology: read dictionary id", e))
}

fn ontology_row_id(conn: &Connection, local_ontology_id: &str) -> Result<Option<i64>, AppError> {
    conn.query_row(
        "SELECT id FROM obr_ontology WHERE local_ontology_id = ?1",
        params![local_ontology_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| AppError::from_sqlite("ontology: lookup ontology id", e))
}

/// Newest concept carrying `local_concept_id`, across all loaded versions.
fn concept_row_id(conn: &Connection, local_concept_id: &str) -> Result<Option<ConceptId>, AppError> {
    conn.prepare_cached(
        "SELECT id FROM obr_concept WHERE local_concept_id = ?1 ORDER BY ontology_id DESC, id DESC LIMIT 1",
    )
    .and_then(|mut stmt| stmt.query_row(params![local_concept_id], |row| row.get(0)).optional())
    .map_err(|e| AppError::from_sqlite("ontology: lookup concept id", e))
}

fn concept_row_id_in(conn: &Connection, ontology_id: i64, local_concept_id: &str) -> Result<Option<ConceptId>, AppError> {
    conn.prepare_cached("SELECT id FROM obr_concept WHERE ontology_id = ?1 AND local_concept_id = ?2")
        .and_then(|mut stmt| {
            stmt.query_row(params![ontology_id, local_concept_id], |row| row.get(0))
                .optional()
        })
        .map_err(|e| AppError::from_sqlite("ontology: lookup concept id in version", e))
}

/// Cached lookup. With `within`, the given version wins over any other.
fn cached_concept_id(
    conn: &Connection,
    cache: &mut HashMap<String, Option<ConceptId>>,
    within: Option<i64>,
    local_concept_id: &str,
) -> Result<Option<ConceptId>, AppError> {
    if let Some(id) = cache.get(local_concept_id) {
        return Ok(*id);
    }
    let scoped = match within {
        Some(ontology_id) => concept_row_id_in(conn, ontology_id, local_concept_id)?,
        None => None,
    };
    let id = match scoped {
        Some(id) => Some(id),
        None => concept_row_id(conn, local_concept_id)?,
    };
    cache.insert(local_concept_id.to_string(), id);
    Ok(id)
}

fn insert_ontology_tx(conn: &Connection, r: &OntologyRecord, dictionary_id: Option<i64>) -> Result<bool, AppError> {
    conn.execute(
        "INSERT OR IGNORE INTO obr_ontology
         (local_ontology_id, virtual_ontology_id, name, version, status, format, dictionary_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            r.local_ontology_id,
            r.virtual_ontology_id,
            r.name,
            r.version,
            r.status,
            r.format,
            dictionary_id
        ],
    )
    .map(|n| n == 1)
    .map_err(|e| AppError::from_sqlite("ontology: insert ontology", e))
}

fn insert_concept_tx(
    conn: &Connection,
    ontology_id: i64,
    local_concept_id: &str,
    is_toplevel: bool,
) -> Result<bool, AppError> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO obr_concept (local_concept_id, ontology_id, is_toplevel)
         VALUES (?1, ?2, ?3)",
    )
    .and_then(|mut stmt| stmt.execute(params![local_concept_id, ontology_id, is_toplevel]))
    .map(|n| n == 1)
    .map_err(|e| AppError::from_sqlite("ontology: insert concept", e))
}

fn insert_term_tx(
    conn: &Connection,
    concept_id: ConceptId,
    name: &str,
    is_preferred: bool,
    dictionary_id: i64,
) -> Result<bool, AppError> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO obr_term (name, concept_id, is_preferred, dictionary_id)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .and_then(|mut stmt| stmt.execute(params![name, concept_id, is_preferred, dictionary_id]))
    .map(|n| n == 1)
    .map_err(|e| AppError::from_sqlite("ontology: insert term", e))
}

fn insert_relation_tx(conn: &Connection, concept_id: ConceptId, parent_id: ConceptId, level: u32) -> Result<bool, AppError> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO obr_relation (concept_id, parent_concept_id, level)
         VALUES (?1, ?2, ?3)",
    )
    .and_then(|mut stmt| stmt.execute(params![concept_id, parent_id, level]))
    .map(|n| n == 1)
    .map_err(|e| AppError::from_sqlite("ontology: insert relation", e))
}

fn declare_map_tx(conn: &Connection, ontology_id: i64, map: &MapRecord) -> Result<bool, AppError> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO obr_map_declared
         (ontology_id, local_concept_id, mapped_local_concept_id, mapping_type)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .and_then(|mut stmt| {
        stmt.execute(params![
            ontology_id,
            map.local_concept_id,
            map.mapped_local_concept_id,
            map.mapping_type
        ])
    })
    .map(|n| n == 1)
    .map_err(|e| AppError::from_sqlite("ontology: declare map", e))
}

/// Materialize every declared mapping whose target is loaded.
///
/// The source is the declaring version's concept. The target is the
/// declaring version's own concept when it has one, else the newest loaded
/// concept with that local id. Returns the number of `obr_map` rows added.
fn resolve_declared_maps(conn: &Connection) -> Result<usize, AppError> {
    conn.execute(
        "INSERT OR IGNORE INTO obr_map (concept_id, mapped_concept_id, mapping_type)
         SELECT src.id, tgt.id, d.mapping_type
         FROM obr_map_declared d
         JOIN obr_concept src
           ON src.ontology_id = d.ontology_id AND src.local_concept_id = d.local_concept_id
         JOIN obr_concept tgt ON tgt.id = (
             SELECT t.id FROM obr_concept t
             WHERE t.local_concept_id = d.mapped_local_concept_id
             ORDER BY t.ontology_id = d.ontology_id DESC, t.ontology_id DESC, t.id DESC
             LIMIT 1)",
        [],
    )
    .map_err(|e| AppError::from_sqlite("ontology: resolve declared maps", e))
}

fn insert_map_tx(conn: &Connection, concept_id: ConceptId, mapped_id: ConceptId, mapping_type: &str) -> Result<bool, AppError> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO obr_map (concept_id, mapped_concept_id, mapping_type)
         VALUES (?1, ?2, ?3)",
    )
    .and_then(|mut stmt| stmt.execute(params![concept_id, mapped_id, mapping_type]))
    .map(|n| n == 1)
    .map_err(|e| AppError::from_sqlite("ontology: insert map", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_graph() -> (TempDir, OntologyGraphStore) {
        let tmp = TempDir::new().expect("tempdir");
        let store = Arc::new(Store::open(tmp.path()).expect("open store"));
        (tmp, OntologyGraphStore::new(store))
    }

    fn record(local: &str, virt: &str, version: &str) -> OntologyRecord {
        OntologyRecord {
            local_ontology_id: local.into(),
            virtual_ontology_id: virt.into(),
            name: format!("Ontology {virt}"),
            version: version.into(),
            status: 28,
            format: "OBO".into(),
        }
    }

    fn concept(id: &str, terms: &[&str], parents: &[&str]) -> ConceptRecord {
        ConceptRecord {
            local_concept_id: id.into(),
            is_toplevel: parents.is_empty(),
            terms: terms
                .iter()
                .enumerate()
                .map(|(i, t)| TermRecord { name: (*t).into(), is_preferred: i == 0 })
                .collect(),
            parents: parents.iter().map(|p| (*p).into()).collect(),
        }
    }

    fn chain_bundle() -> OntologyBundle {
        OntologyBundle {
            ontology: record("40000", "1000", "1.0"),
            concepts: vec![
                concept("1000/D", &["bronchiole"], &["1000/C"]),
                concept("1000/C", &["bronchus"], &["1000/B"]),
                concept("1000/B", &["lung", "pulmo"], &["1000/A"]),
                concept("1000/A", &["organ"], &[]),
            ],
            relations: vec![],
            mappings: vec![],
        }
    }

    #[test]
    fn closure_of_chain_has_one_row_per_level() {
        let (_tmp, graph) = make_graph();
        graph.ingest_bundle(&chain_bundle()).unwrap();
        let d = graph.concept_id("1000/D").unwrap().unwrap();
        let ancestors = graph.ancestors_of(d).unwrap();
        let levels: Vec<u32> = ancestors.iter().map(|(_, l)| *l).collect();
        assert_eq!(levels, vec![1, 2, 3]);
        let distinct: BTreeSet<_> = ancestors.iter().map(|(a, _)| *a).collect();
        assert_eq!(distinct.len(), 3);

        let a = graph.concept_id("1000/A").unwrap().unwrap();
        assert!(graph.ancestors_of(a).unwrap().is_empty());
    }

    #[test]
    fn second_ingest_is_no_new_ontology() {
        let (_tmp, graph) = make_graph();
        assert!(matches!(graph.ingest_bundle(&chain_bundle()).unwrap(), Ingest::Loaded(_)));
        let again = graph.ingest_bundle(&chain_bundle()).unwrap();
        assert_eq!(
            again,
            Ingest::NoNewOntology { local_ontology_id: "40000".into() }
        );
        assert_eq!(graph.ontologies().unwrap().len(), 1);
    }

    #[test]
    fn inserts_are_idempotent() {
        let (_tmp, graph) = make_graph();
        let dict = graph.create_dictionary("manual").unwrap();
        assert!(graph.insert_ontology(&record("1", "v1", "1"), Some(dict)).unwrap());
        assert!(!graph.insert_ontology(&record("1", "v1", "1"), Some(dict)).unwrap());

        assert!(graph.insert_concept("1", "v1/A", true).unwrap());
        assert!(!graph.insert_concept("1", "v1/A", true).unwrap());
        assert!(graph.insert_concept("1", "v1/B", false).unwrap());
        let a = graph.concept_id("v1/A").unwrap().unwrap();
        let b = graph.concept_id("v1/B").unwrap().unwrap();

        assert!(graph.insert_term(a, "alpha", true, dict).unwrap());
        assert!(!graph.insert_term(a, "alpha", true, dict).unwrap());
        assert!(graph.insert_relation(b, a, 1).unwrap());
        assert!(!graph.insert_relation(b, a, 1).unwrap());
        assert!(graph.insert_map(a, b, "close_match").unwrap());
        assert!(!graph.insert_map(a, b, "close_match").unwrap());

        assert_eq!(graph.create_dictionary("manual").unwrap(), dict);
        assert_eq!(graph.ancestors_of(b).unwrap(), vec![(a, 1)]);
        assert_eq!(graph.mappings_of(a).unwrap(), vec![(b, "close_match".to_string())]);
    }

    #[test]
    fn resolve_is_case_insensitive_and_scoped() {
        let (_tmp, graph) = make_graph();
        graph.ingest_bundle(&chain_bundle()).unwrap();
        let b = graph.concept_id("1000/B").unwrap().unwrap();

        let terms = BTreeSet::from(["LUNG".to_string(), "unknown".to_string()]);
        let all = graph.resolve_terms_to_concepts(&terms, &OntologyScope::All).unwrap();
        assert_eq!(all, BTreeSet::from([b]));

        let scoped = graph
            .resolve_terms_to_concepts(&terms, &OntologyScope::Virtual(vec!["1000".into()]))
            .unwrap();
        assert_eq!(scoped, BTreeSet::from([b]));

        // local concept ids resolve as well
        let by_code = graph
            .resolve_terms_to_concepts(&BTreeSet::from(["1000/b".to_string()]), &OntologyScope::All)
            .unwrap();
        assert_eq!(by_code, BTreeSet::from([b]));
    }

    #[test]
    fn unknown_scope_yields_empty_not_error() {
        let (_tmp, graph) = make_graph();
        graph.ingest_bundle(&chain_bundle()).unwrap();
        let terms = BTreeSet::from(["lung".to_string()]);
        let out = graph
            .resolve_terms_to_concepts(&terms, &OntologyScope::Local(vec!["99999".into()]))
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn relation_file_skips_malformed_rows() {
        let (tmp, graph) = make_graph();
        let dict = graph.create_dictionary("d").unwrap();
        graph.insert_ontology(&record("7", "v7", "1"), Some(dict)).unwrap();
        for c in ["X", "Y", "Z"] {
            graph.insert_concept("7", c, false).unwrap();
        }

        let path = tmp.path().join("relations.tsv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "concept\tparent\tlevel").unwrap();
        writeln!(f, "X\tY\t1").unwrap();
        writeln!(f, "X\tZ\t2").unwrap();
        writeln!(f, "Y\tZ\t1").unwrap();
        writeln!(f, "X\tY\t1").unwrap(); // duplicate
        writeln!(f, "X\tY").unwrap(); // wrong column count
        writeln!(f, "X\tZ\tabc").unwrap(); // bad level
        writeln!(f, "X\tZ\t0").unwrap(); // level must be >= 1
        writeln!(f, "X\tNOPE\t1").unwrap(); // unknown concept
        drop(f);

        let report = graph.load_relation_file(&path).unwrap();
        assert_eq!(report, BulkLoadReport { inserted: 3, existing: 1, skipped: 4 });
        let x = graph.concept_id("X").unwrap().unwrap();
        assert_eq!(graph.ancestors_of(x).unwrap().len(), 2);
    }

    #[test]
    fn dictionary_delta_and_stop_list() {
        let (_tmp, graph) = make_graph();
        let first = match graph.ingest_bundle(&chain_bundle()).unwrap() {
            Ingest::Loaded(r) => r.dictionary_id,
            other => panic!("unexpected {other:?}"),
        };
        let mut second = chain_bundle();
        second.ontology = record("40001", "2000", "1.0");
        second.concepts = vec![concept("2000/X", &["alveolus", "the"], &[])];
        graph.ingest_bundle(&second).unwrap();

        let stop = StopList::new(["the"]);
        let full = graph.dictionary(None, &stop).unwrap();
        assert_eq!(full.len(), 6);
        let delta = graph.dictionary(Some(first), &stop).unwrap();
        let names: Vec<_> = delta.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alveolus"]);
    }

    #[test]
    fn mapping_waits_for_its_target_ontology() {
        let (_tmp, graph) = make_graph();
        let mut bundle = chain_bundle();
        bundle.mappings = vec![
            MapRecord {
                local_concept_id: "1000/B".into(),
                mapped_local_concept_id: "1000/A".into(),
                mapping_type: "close_match".into(),
            },
            MapRecord {
                local_concept_id: "1000/B".into(),
                mapped_local_concept_id: "elsewhere/Q".into(),
                mapping_type: "exact_match".into(),
            },
            MapRecord {
                local_concept_id: "1000/NOPE".into(),
                mapped_local_concept_id: "1000/A".into(),
                mapping_type: "close_match".into(),
            },
        ];
        let Ingest::Loaded(report) = graph.ingest_bundle(&bundle).unwrap() else {
            panic!("expected load");
        };
        assert_eq!((report.maps, report.pending_maps, report.skipped), (1, 1, 1));

        let elsewhere = OntologyBundle {
            ontology: record("50000", "elsewhere", "1"),
            concepts: vec![concept("elsewhere/Q", &["pulmonary organ"], &[])],
            relations: vec![],
            mappings: vec![],
        };
        let Ingest::Loaded(report) = graph.ingest_bundle(&elsewhere).unwrap() else {
            panic!("expected load");
        };
        assert_eq!(report.maps, 1);

        let b = graph.concept_id("1000/B").unwrap().unwrap();
        let q = graph.concept_id("elsewhere/Q").unwrap().unwrap();
        assert_eq!(graph.mappings_of(b).unwrap().len(), 2);
        assert!(graph.mappings_of(b).unwrap().contains(&(q, "exact_match".to_string())));
    }

    #[test]
    fn versions_reusing_concept_ids_keep_separate_rows() {
        let (_tmp, graph) = make_graph();
        graph.ingest_bundle(&chain_bundle()).unwrap();
        let old_b = graph.concept_id("1000/B").unwrap().unwrap();

        let mut next = chain_bundle();
        next.ontology = record("40001", "1000", "2.0");
        next.concepts.push(concept("1000/E", &["alveolus"], &["1000/D"]));
        let Ingest::Loaded(report) = graph.ingest_bundle(&next).unwrap() else {
            panic!("expected load");
        };
        assert_eq!((report.concepts, report.terms, report.relations), (5, 6, 10));

        let new_b = graph.concept_id("1000/B").unwrap().unwrap();
        assert_ne!(new_b, old_b);
        assert_eq!(graph.concept(new_b).unwrap().unwrap().local_concept_id, "1000/B");
        // The new version's closure never points into the old one.
        let new_ontology = graph.ontology("40001").unwrap().unwrap().id;
        for (ancestor, _) in graph.ancestors_of(new_b).unwrap() {
            assert_eq!(graph.concept(ancestor).unwrap().unwrap().ontology_id, new_ontology);
        }

        assert!(graph.delete_ontology("40000").unwrap());
        assert!(graph.concept(old_b).unwrap().is_none());
        assert_eq!(graph.concept_id("1000/B").unwrap(), Some(new_b));
        let lung = graph
            .resolve_terms_to_concepts(&BTreeSet::from(["lung".to_string()]), &OntologyScope::All)
            .unwrap();
        assert_eq!(lung, BTreeSet::from([new_b]));
        assert_eq!(graph.ancestors_of(new_b).unwrap().len(), 1);
    }

    #[test]
    fn mapping_follows_target_across_upgrade() {
        let (_tmp, graph) = make_graph();
        let target = |local: &str, version: &str| OntologyBundle {
            ontology: record(local, "2000", version),
            concepts: vec![concept("2000/P", &["pulmo"], &[])],
            relations: vec![],
            mappings: vec![],
        };
        graph.ingest_bundle(&target("60000", "1")).unwrap();
        let mut source = chain_bundle();
        source.mappings = vec![MapRecord {
            local_concept_id: "1000/B".into(),
            mapped_local_concept_id: "2000/P".into(),
            mapping_type: "close_match".into(),
        }];
        graph.ingest_bundle(&source).unwrap();
        graph.ingest_bundle(&target("60001", "2")).unwrap();
        assert!(graph.delete_ontology("60000").unwrap());

        let b = graph.concept_id("1000/B").unwrap().unwrap();
        let p = graph.concept_id("2000/P").unwrap().unwrap();
        assert_eq!(graph.mappings_of(b).unwrap(), vec![(p, "close_match".to_string())]);
    }

    #[test]
    fn delete_ontology_cascades_graph_rows() {
        let (_tmp, graph) = make_graph();
        graph.ingest_bundle(&chain_bundle()).unwrap();
        assert!(graph.delete_ontology("40000").unwrap());
        assert!(!graph.delete_ontology("40000").unwrap());
        assert!(graph.concept_id("1000/A").unwrap().is_none());
        let store = &graph.store;
        for table in ["obr_concept", "obr_term", "obr_relation", "obr_map", "obr_map_declared"] {
            assert_eq!(store.count_rows(table, None).unwrap(), 0, "{table} not empty");
        }
    }
}
