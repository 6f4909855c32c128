//! Resource registration row and the element table.

use std::sync::Arc;

use rusqlite::{OptionalExtension, params};
use tracing::{debug, info};

use super::{Element, Resource, ResourceContext, Structure};
use crate::error::AppError;
use crate::store::{Store, now_iso8601};

/// An element as persisted, with its row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredElement {
    pub id: i64,
    pub element: Element,
    /// Newest dictionary this element was fully annotated against; `None`
    /// until its first clean annotation.
    pub annotated_dictionary_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ResourceStore {
    store: Arc<Store>,
}

impl ResourceStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Ensure the registration row exists and reflects the resource's
    /// current structure, then return the run context.
    pub fn register(&self, resource: &dyn Resource) -> Result<ResourceContext, AppError> {
        let structure_json = serde_json::to_string(resource.structure())
            .map_err(|e| AppError::Resource(format!("serialize structure of {}: {e}", resource.id())))?;
        let url = resource.element_url("{id}");

        let inserted = self.store.with_conn("register_resource", |conn| {
            let existed: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM obr_resource WHERE resource_id = ?1",
                    params![resource.id()],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n > 0)
                .map_err(|e| AppError::from_sqlite("resource: lookup registration", e))?;
            conn.execute(
                "INSERT INTO obr_resource (resource_id, name, structure, main_context, url, large_scale)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(resource_id) DO UPDATE SET
                    name = excluded.name,
                    structure = excluded.structure,
                    main_context = excluded.main_context,
                    url = excluded.url,
                    large_scale = excluded.large_scale",
                params![
                    resource.id(),
                    resource.name(),
                    structure_json,
                    resource.main_context(),
                    url,
                    resource.is_large_scale()
                ],
            )
            .map_err(|e| AppError::from_sqlite("resource: upsert registration", e))?;
            Ok(!existed)
        })?;
        if inserted {
            info!(resource_id = %resource.id(), "resource registered");
        }

        self.context(resource.id())?.ok_or_else(|| {
            AppError::Store(format!("resource: registration of {} not readable", resource.id()))
        })
    }

    pub fn context(&self, resource_id: &str) -> Result<Option<ResourceContext>, AppError> {
        let row = self.store.with_conn("resource_context", |conn| {
            conn.query_row(
                "SELECT structure, large_scale, last_dictionary_id FROM obr_resource WHERE resource_id = ?1",
                params![resource_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| AppError::from_sqlite("resource: read registration", e))
        })?;

        row.map(|(structure_json, large_scale, last_dictionary_id)| {
            let structure: Structure = serde_json::from_str(&structure_json).map_err(|e| {
                AppError::Resource(format!("corrupt structure for {resource_id}: {e}"))
            })?;
            Ok(ResourceContext {
                resource_id: resource_id.to_string(),
                structure,
                large_scale,
                last_dictionary_id,
            })
        })
        .transpose()
    }

    /// Contexts of every registered resource, ordered by id.
    pub fn registered(&self) -> Result<Vec<ResourceContext>, AppError> {
        let ids: Vec<String> = self.store.with_conn("registered_resources", |conn| {
            let mut stmt = conn
                .prepare("SELECT resource_id FROM obr_resource ORDER BY resource_id")
                .map_err(|e| AppError::from_sqlite("resource: prepare list", e))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| AppError::from_sqlite("resource: query list", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("resource: map list row", e))
        })?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(ctx) = self.context(&id)? {
                out.push(ctx);
            }
        }
        Ok(out)
    }

    /// Remember the dictionary a completed run used.
    pub fn record_dictionary(&self, resource_id: &str, dictionary_id: Option<i64>) -> Result<(), AppError> {
        self.store.with_conn("record_dictionary", |conn| {
            conn.execute(
                "UPDATE obr_resource SET last_dictionary_id = ?2, last_run = ?3 WHERE resource_id = ?1",
                params![resource_id, dictionary_id, now_iso8601()],
            )
            .map_err(|e| AppError::from_sqlite("resource: record dictionary", e))?;
            Ok(())
        })
    }

    /// Record that every context of `element_id` was tagged against the
    /// dictionaries up to `dictionary_id`.
    pub fn mark_annotated(&self, element_id: i64, dictionary_id: Option<i64>) -> Result<(), AppError> {
        self.store.with_conn("mark_annotated", |conn| {
            conn.prepare_cached("UPDATE obr_element SET annotated_dictionary_id = ?2 WHERE id = ?1")
                .and_then(|mut stmt| stmt.execute(params![element_id, dictionary_id]))
                .map_err(|e| AppError::from_sqlite("resource: mark annotated", e))?;
            Ok(())
        })
    }

    /// Insert an element; `Ok(false)` if its local id already exists.
    pub fn add_element(&self, resource_id: &str, element: &Element) -> Result<bool, AppError> {
        let contexts = serde_json::to_string(&element.contexts)
            .map_err(|e| AppError::Resource(format!("serialize element {}: {e}", element.local_element_id)))?;
        self.store.with_conn("add_element", |conn| {
            conn.prepare_cached(
                "INSERT OR IGNORE INTO obr_element (resource_id, local_element_id, contexts)
                 VALUES (?1, ?2, ?3)",
            )
            .and_then(|mut stmt| stmt.execute(params![resource_id, element.local_element_id, contexts]))
            .map(|n| n == 1)
            .map_err(|e| AppError::from_sqlite("resource: insert element", e))
        })
    }

    /// Fetch the resource's elements and insert the ones not yet stored.
    /// Returns the number of new elements.
    pub fn update_elements(&self, ctx: &ResourceContext, resource: &dyn Resource) -> Result<usize, AppError> {
        let names = ctx.structure.context_names();
        let mut added = 0;
        for element in resource.fetch_elements()? {
            let unknown: Vec<&String> = element
                .contexts
                .keys()
                .filter(|k| !names.contains(&k.as_str()))
                .collect();
            if !unknown.is_empty() {
                debug!(
                    resource_id = %ctx.resource_id,
                    element = %element.local_element_id,
                    ?unknown,
                    "element carries undeclared contexts"
                );
            }
            if self.add_element(&ctx.resource_id, &element)? {
                added += 1;
            }
        }
        info!(resource_id = %ctx.resource_id, added, "elements updated");
        Ok(added)
    }

    pub fn elements(&self, resource_id: &str) -> Result<Vec<StoredElement>, AppError> {
        let rows: Vec<ElementRow> = self.store.with_conn("elements", |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, local_element_id, contexts, annotated_dictionary_id FROM obr_element
                     WHERE resource_id = ?1 ORDER BY id",
                )
                .map_err(|e| AppError::from_sqlite("resource: prepare elements", e))?;
            let rows = stmt
                .query_map(params![resource_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(|e| AppError::from_sqlite("resource: query elements", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::from_sqlite("resource: map element row", e))
        })?;
        rows.into_iter().map(decode_element).collect()
    }

    pub fn element(&self, resource_id: &str, local_element_id: &str) -> Result<Option<StoredElement>, AppError> {
        let row = self.store.with_conn("element", |conn| {
            conn.query_row(
                "SELECT id, local_element_id, contexts, annotated_dictionary_id FROM obr_element
                 WHERE resource_id = ?1 AND local_element_id = ?2",
                params![resource_id, local_element_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(|e| AppError::from_sqlite("resource: get element", e))
        })?;
        row.map(decode_element).transpose()
    }
}

type ElementRow = (i64, String, String, Option<i64>);

fn decode_element((id, local_element_id, contexts, annotated_dictionary_id): ElementRow) -> Result<StoredElement, AppError> {
    let contexts = serde_json::from_str(&contexts)
        .map_err(|e| AppError::Resource(format!("corrupt contexts for element {local_element_id}: {e}")))?;
    Ok(StoredElement {
        id,
        element: Element {
            local_element_id,
            contexts,
        },
        annotated_dictionary_id,
    })
}
