//! Size-tiered removal of derived rows for retired ontology versions.
//!
//! Ordinary resources remove rows for every retired version with one batched
//! `DELETE … IN (…)`. Large-scale resources issue one `DELETE` per version
//! so no single statement holds the write lock for the whole batch.

use rusqlite::params_from_iter;
use tracing::{debug, info};

use crate::error::AppError;
use crate::resource::ResourceContext;
use crate::store::{Store, placeholders};

/// What a removal call executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// `DELETE` statements issued.
    pub statements: usize,
    pub rows: usize,
}

impl RemovalReport {
    pub fn merge(&mut self, other: RemovalReport) {
        self.statements += other.statements;
        self.rows += other.rows;
    }
}

/// Delete the rows of `table` for `ctx`'s resource where any of
/// `concept_columns` names a concept of one of `local_ontology_ids`.
///
/// `table` and `concept_columns` come from the fixed schema, never from
/// input.
pub(crate) fn remove_for_versions(
    store: &Store,
    ctx: &ResourceContext,
    table: &str,
    concept_columns: &[&str],
    local_ontology_ids: &[String],
) -> Result<RemovalReport, AppError> {
    if local_ontology_ids.is_empty() {
        return Ok(RemovalReport::default());
    }

    let batches: Vec<&[String]> = if ctx.large_scale {
        local_ontology_ids.chunks(1).collect()
    } else {
        vec![local_ontology_ids]
    };

    let mut report = RemovalReport::default();
    for batch in batches {
        let concepts = format!(
            "SELECT c.id FROM obr_concept c JOIN obr_ontology o ON o.id = c.ontology_id
             WHERE o.local_ontology_id IN ({})",
            placeholders(2, batch.len())
        );
        let predicate = concept_columns
            .iter()
            .map(|col| format!("{col} IN ({concepts})"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!("DELETE FROM {table} WHERE resource_id = ?1 AND ({predicate})");

        let bind: Vec<&str> = std::iter::once(ctx.resource_id.as_str())
            .chain(batch.iter().map(String::as_str))
            .collect();
        let rows = store.with_conn("remove_for_versions", |conn| {
            conn.execute(&sql, params_from_iter(bind.iter()))
                .map_err(|e| AppError::from_sqlite(&format!("removal: delete from {table}"), e))
        })?;
        debug!(resource_id = %ctx.resource_id, table, versions = ?batch, rows, "derived rows removed");
        report.statements += 1;
        report.rows += rows;
    }

    info!(
        resource_id = %ctx.resource_id,
        table,
        statements = report.statements,
        rows = report.rows,
        large_scale = ctx.large_scale,
        "removal finished"
    );
    Ok(report)
}
