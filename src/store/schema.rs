//! Relational schema for the ontology graph and the per-resource pipeline
//! tables.
//!
//! Ontology-side tables (`obr_ontology`, `obr_concept`, `obr_term`,
//! `obr_relation`, `obr_map`, `obr_map_declared`, `obr_dictionary`) are
//! shared by every resource. Concepts are keyed per ontology version, so two
//! versions may carry the same local concept id without sharing rows.
//! Pipeline tables carry a `resource_id` column; every derived row references
//! `obr_concept` with `ON DELETE CASCADE` so retiring an ontology version can
//! never leave dangling annotations.

use rusqlite::Connection;

use crate::error::AppError;

/// SQLite database file name inside the work directory.
pub(crate) const DB_FILENAME: &str = "resource_index.db";

/// Schema version stored in `PRAGMA user_version`.
pub(crate) const SCHEMA_VERSION: i64 = 2;

/// Every per-resource table, in child-to-parent delete order.
pub(crate) const DERIVED_TABLES: [&str; 5] = [
    "obr_index",
    "obr_concept_frequency",
    "obr_aggregation",
    "obr_expanded_annotation",
    "obr_direct_annotation",
];

/// Execute the schema DDL. Idempotent: every statement is `IF NOT EXISTS`.
pub(crate) fn init_schema(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS obr_dictionary (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS obr_ontology (
            id INTEGER PRIMARY KEY,
            local_ontology_id TEXT NOT NULL UNIQUE,
            virtual_ontology_id TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            status INTEGER NOT NULL DEFAULT 0,
            format TEXT NOT NULL DEFAULT '',
            dictionary_id INTEGER REFERENCES obr_dictionary(id)
        );
        CREATE INDEX IF NOT EXISTS idx_ontology_virtual
            ON obr_ontology(virtual_ontology_id);

        CREATE TABLE IF NOT EXISTS obr_concept (
            id INTEGER PRIMARY KEY,
            local_concept_id TEXT NOT NULL,
            ontology_id INTEGER NOT NULL REFERENCES obr_ontology(id) ON DELETE CASCADE,
            is_toplevel INTEGER NOT NULL DEFAULT 0,
            UNIQUE(ontology_id, local_concept_id)
        );
        CREATE INDEX IF NOT EXISTS idx_concept_local ON obr_concept(local_concept_id);

        CREATE TABLE IF NOT EXISTS obr_term (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            is_preferred INTEGER NOT NULL DEFAULT 0,
            dictionary_id INTEGER NOT NULL,
            UNIQUE(name, concept_id)
        );
        CREATE INDEX IF NOT EXISTS idx_term_lower_name ON obr_term(lower(name));
        CREATE INDEX IF NOT EXISTS idx_term_dictionary ON obr_term(dictionary_id);

        CREATE TABLE IF NOT EXISTS obr_relation (
            id INTEGER PRIMARY KEY,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            parent_concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            level INTEGER NOT NULL CHECK (level >= 1),
            UNIQUE(concept_id, parent_concept_id)
        );
        CREATE INDEX IF NOT EXISTS idx_relation_parent ON obr_relation(parent_concept_id);

        CREATE TABLE IF NOT EXISTS obr_map (
            id INTEGER PRIMARY KEY,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            mapped_concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            mapping_type TEXT NOT NULL,
            UNIQUE(concept_id, mapped_concept_id)
        );

        -- Mappings as declared by a bundle, by local id. Re-resolved into
        -- obr_map whenever the set of loaded concepts changes.
        CREATE TABLE IF NOT EXISTS obr_map_declared (
            ontology_id INTEGER NOT NULL REFERENCES obr_ontology(id) ON DELETE CASCADE,
            local_concept_id TEXT NOT NULL,
            mapped_local_concept_id TEXT NOT NULL,
            mapping_type TEXT NOT NULL,
            UNIQUE(ontology_id, local_concept_id, mapped_local_concept_id)
        );

        CREATE TABLE IF NOT EXISTS obr_resource (
            resource_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            structure TEXT NOT NULL,
            main_context TEXT NOT NULL,
            url TEXT NOT NULL DEFAULT '',
            large_scale INTEGER NOT NULL DEFAULT 0,
            last_dictionary_id INTEGER,
            last_run TEXT
        );

        CREATE TABLE IF NOT EXISTS obr_element (
            id INTEGER PRIMARY KEY,
            resource_id TEXT NOT NULL REFERENCES obr_resource(resource_id) ON DELETE CASCADE,
            local_element_id TEXT NOT NULL,
            contexts TEXT NOT NULL,
            annotated_dictionary_id INTEGER,
            UNIQUE(resource_id, local_element_id)
        );

        CREATE TABLE IF NOT EXISTS obr_direct_annotation (
            id INTEGER PRIMARY KEY,
            resource_id TEXT NOT NULL,
            element_id INTEGER NOT NULL REFERENCES obr_element(id) ON DELETE CASCADE,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            context_name TEXT NOT NULL,
            term_id INTEGER REFERENCES obr_term(id) ON DELETE SET NULL,
            weight_class TEXT NOT NULL,
            dictionary_id INTEGER,
            UNIQUE(element_id, concept_id, context_name)
        );
        CREATE INDEX IF NOT EXISTS idx_direct_resource
            ON obr_direct_annotation(resource_id, concept_id);

        CREATE TABLE IF NOT EXISTS obr_expanded_annotation (
            id INTEGER PRIMARY KEY,
            resource_id TEXT NOT NULL,
            element_id INTEGER NOT NULL REFERENCES obr_element(id) ON DELETE CASCADE,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            origin_concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            variant TEXT NOT NULL,
            level INTEGER,
            mapping_type TEXT,
            weight_class TEXT NOT NULL,
            derived_weight REAL NOT NULL,
            UNIQUE(element_id, concept_id, variant)
        );
        CREATE INDEX IF NOT EXISTS idx_expanded_resource
            ON obr_expanded_annotation(resource_id, concept_id);

        CREATE TABLE IF NOT EXISTS obr_aggregation (
            resource_id TEXT NOT NULL,
            element_id INTEGER NOT NULL REFERENCES obr_element(id) ON DELETE CASCADE,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            score REAL NOT NULL,
            PRIMARY KEY (element_id, concept_id)
        );
        CREATE INDEX IF NOT EXISTS idx_aggregation_resource
            ON obr_aggregation(resource_id, concept_id);

        CREATE TABLE IF NOT EXISTS obr_index (
            resource_id TEXT NOT NULL,
            element_id INTEGER NOT NULL REFERENCES obr_element(id) ON DELETE CASCADE,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            final_score REAL NOT NULL,
            PRIMARY KEY (element_id, concept_id)
        );
        CREATE INDEX IF NOT EXISTS idx_index_resource ON obr_index(resource_id, concept_id);

        CREATE TABLE IF NOT EXISTS obr_concept_frequency (
            resource_id TEXT NOT NULL REFERENCES obr_resource(resource_id) ON DELETE CASCADE,
            concept_id INTEGER NOT NULL REFERENCES obr_concept(id) ON DELETE CASCADE,
            count INTEGER NOT NULL,
            PRIMARY KEY (resource_id, concept_id)
        );

        PRAGMA user_version = 2;
        ",
    )
    .map_err(|e| AppError::from_sqlite("store: initialize schema", e))
}
