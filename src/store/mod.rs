//! `store`: the single relational store shared by every pipeline stage.
//!
//! ## Storage layout
//! ```text
//! {work_dir}/
//! └── resource_index.db   # SQLite, WAL mode, foreign keys enforced
//! ```
//!
//! One [`Store`] owns one connection. Engines receive an `Arc<Store>` at
//! construction; there is no global registry of table objects. Every
//! database access goes through [`Store::with_conn`], which re-opens the
//! connection and retries the same logical operation when the failure is
//! transient (see [`AppError::is_transient`]).

pub mod retry;
pub(crate) mod schema;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, warn};

use crate::error::AppError;
pub use retry::RetryPolicy;
use schema::{DB_FILENAME, DERIVED_TABLES, SCHEMA_VERSION, init_schema};

/// Handle on the SQLite database.
#[derive(Debug)]
pub struct Store {
    db_path: PathBuf,
    conn: Mutex<Connection>,
    retry: RetryPolicy,
}

impl Store {
    /// Open (creating if needed) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self, AppError> {
        Self::open_with(dir, RetryPolicy::default())
    }

    pub fn open_with(dir: &Path, retry: RetryPolicy) -> Result<Self, AppError> {
        fs::create_dir_all(dir).map_err(|e| {
            AppError::Store(format!("store: cannot create {}: {e}", dir.display()))
        })?;
        let db_path = dir.join(DB_FILENAME);
        let conn = open_conn(&db_path)?;

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| AppError::from_sqlite("store: read user_version", e))?;
        if version > 0 && version < SCHEMA_VERSION {
            return Err(AppError::Store(format!(
                "store: {} has schema version {version}, expected {SCHEMA_VERSION}; rebuild the work directory",
                db_path.display()
            )));
        }
        if version < SCHEMA_VERSION {
            init_schema(&conn)?;
            debug!(path = %db_path.display(), "schema initialized");
        }

        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
            retry,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run `f` against the connection.
    ///
    /// Transient failures re-establish the connection and re-run `f` from
    /// the start, up to the retry policy's attempt ceiling. `f` must
    /// therefore be safe to repeat; inserts in this crate are
    /// `INSERT OR IGNORE` so a repeated write is a no-op.
    pub fn with_conn<T, F>(&self, op: &str, mut f: F) -> Result<T, AppError>
    where
        F: FnMut(&mut Connection) -> Result<T, AppError>,
    {
        let attempts = self.retry.attempts();
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| AppError::Store(format!("store: {op}: connection mutex poisoned")))?;

        let mut attempt = 1;
        loop {
            match f(&mut *guard) {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(op, attempt, ?delay, "transient store failure, reconnecting: {e}");
                    backoff(delay);
                    match open_conn(&self.db_path) {
                        Ok(fresh) => *guard = fresh,
                        Err(re) => warn!(op, attempt, "reconnect failed: {re}"),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete the derived rows of one resource.
    ///
    /// With `keep_elements` the element table is preserved, minus each
    /// element's annotated dictionary, so the next run re-annotates existing
    /// content against the full dictionary without re-fetching it.
    pub fn clear_resource(&self, resource_id: &str, keep_elements: bool) -> Result<usize, AppError> {
        self.with_conn("clear_resource", |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| AppError::from_sqlite("store: begin clear_resource", e))?;
            let mut removed = 0;
            for table in DERIVED_TABLES {
                removed += tx
                    .execute(
                        &format!("DELETE FROM {table} WHERE resource_id = ?1"),
                        params![resource_id],
                    )
                    .map_err(|e| AppError::from_sqlite(&format!("store: clear {table}"), e))?;
            }
            if keep_elements {
                tx.execute(
                    "UPDATE obr_element SET annotated_dictionary_id = NULL WHERE resource_id = ?1",
                    params![resource_id],
                )
                .map_err(|e| AppError::from_sqlite("store: reset annotated dictionaries", e))?;
            } else {
                removed += tx
                    .execute(
                        "DELETE FROM obr_element WHERE resource_id = ?1",
                        params![resource_id],
                    )
                    .map_err(|e| AppError::from_sqlite("store: clear obr_element", e))?;
            }
            tx.commit()
                .map_err(|e| AppError::from_sqlite("store: commit clear_resource", e))?;
            Ok(removed)
        })
    }

    /// Row count of `table`, optionally restricted to one resource.
    /// Only table names from the fixed schema are accepted.
    pub fn count_rows(&self, table: &str, resource_id: Option<&str>) -> Result<i64, AppError> {
        const KNOWN: [&str; 14] = [
            "obr_dictionary",
            "obr_ontology",
            "obr_concept",
            "obr_term",
            "obr_relation",
            "obr_map",
            "obr_map_declared",
            "obr_resource",
            "obr_element",
            "obr_direct_annotation",
            "obr_expanded_annotation",
            "obr_aggregation",
            "obr_index",
            "obr_concept_frequency",
        ];
        if !KNOWN.contains(&table) {
            return Err(AppError::Store(format!("store: unknown table '{table}'")));
        }
        self.with_conn("count_rows", |conn| {
            let n = match resource_id {
                Some(rid) => conn.query_row(
                    &format!("SELECT COUNT(*) FROM {table} WHERE resource_id = ?1"),
                    params![rid],
                    |row| row.get(0),
                ),
                None => conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                }),
            };
            n.map_err(|e| AppError::from_sqlite(&format!("store: count {table}"), e))
        })
    }
}

/// Wait out a retry delay. On a multi-thread runtime the worker's other
/// tasks are handed to another thread first.
fn backoff(delay: Duration) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(delay))
        }
        _ => std::thread::sleep(delay),
    }
}

/// Open a SQLite connection to `db_path` and apply pragmas.
///
/// - `journal_mode = WAL`: readers do not block the single writer.
/// - `foreign_keys = ON`: required for the cascade deletes.
/// - `busy_timeout = 5000`: wait up to 5 s before returning `SQLITE_BUSY`.
pub(crate) fn open_conn(db_path: &Path) -> Result<Connection, AppError> {
    let conn = Connection::open(db_path)
        .map_err(|e| AppError::from_sqlite(&format!("store: open {}", db_path.display()), e))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| AppError::from_sqlite("store: set journal_mode WAL", e))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| AppError::from_sqlite("store: set foreign_keys ON", e))?;
    conn.pragma_update(None, "busy_timeout", 5000)
        .map_err(|e| AppError::from_sqlite("store: set busy_timeout", e))?;

    Ok(conn)
}

/// `?{start}, ?{start+1}, …`: `n` numbered placeholders for an `IN (…)` list.
pub(crate) fn placeholders(start: usize, n: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Current UTC time as an RFC 3339 string with second precision.
pub(crate) fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}
