//! SQLite-backed [`Storage`].

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Row, params, params_from_iter, types::Value as SqlValue};

use crate::{
    async_utils::spawn_blocking_propagating_panics,
    error::IndexError,
    model::{BoundingBox, Document, PageText},
    prelude::*,
};

use super::{Storage, TextPredicate};

/// Schema migrations, applied in order. Each records its own version.
const MIGRATIONS: &[(i64, &str)] = &[(1, include_str!("../../migrations/001_initial.sql"))];

const SELECT_PAGE_TEXT: &str = "SELECT id, document_id, page_number, text, \
     bbox_left, bbox_top, bbox_right, bbox_bottom FROM page_text";

/// A [`Storage`] backed by a single SQLite connection.
///
/// All database work runs on Tokio's blocking pool.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (creating if needed) a database. `target` is a file path, or
    /// `:memory:` for a private in-memory database.
    #[instrument(level = "debug", skip_all, fields(db = %target))]
    pub fn open(target: &str) -> Result<Self, IndexError> {
        let conn = Connection::open(target)?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against our connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T, IndexError>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        spawn_blocking_propagating_panics(move || {
            let mut conn = conn.lock().expect("lock poisoned");
            f(&mut conn)
        })
        .await
        .map_err(IndexError::from)
    }

    /// Run raw SQL. Lets tests install triggers that simulate failures.
    #[cfg(test)]
    pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<(), IndexError> {
        self.with_connection(move |conn| conn.execute_batch(sql)).await
    }
}

/// Apply any migrations newer than the database's current version.
fn run_migrations(conn: &Connection) -> Result<(), IndexError> {
    let current_version = current_schema_version(conn);
    for &(version, sql) in MIGRATIONS {
        if version > current_version {
            info!("Running migration v{version}");
            conn.execute_batch(sql).map_err(|e| {
                IndexError::Storage(format!("migration v{version} failed: {e}"))
            })?;
        }
    }
    Ok(())
}

/// The newest applied migration, or 0 for a fresh database.
fn current_schema_version(conn: &Connection) -> i64 {
    conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i64>>(0)
    })
    .ok()
    .flatten()
    .unwrap_or(0)
}

fn page_text_from_row(row: &Row<'_>) -> rusqlite::Result<PageText> {
    Ok(PageText {
        id: Some(row.get(0)?),
        document_id: row.get(1)?,
        page_number: row.get::<_, i64>(2)? as usize,
        text: row.get(3)?,
        bbox: BoundingBox {
            left: row.get(4)?,
            top: row.get(5)?,
            right: row.get(6)?,
            bottom: row.get(7)?,
        },
    })
}

/// Build `?, ?, ?` for `n` parameters.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Run a page text query with optional document and token filters.
fn query_page_text(
    conn: &Connection,
    keys: Option<&[String]>,
    predicate: &TextPredicate,
) -> rusqlite::Result<Vec<PageText>> {
    let mut clauses = vec![];
    let mut values: Vec<SqlValue> = vec![];
    if let Some(keys) = keys {
        clauses.push(format!("document_id IN ({})", placeholders(keys.len())));
        values.extend(keys.iter().cloned().map(SqlValue::Text));
    }
    if let TextPredicate::TokenIn(tokens) = predicate {
        clauses.push(format!("upper(text) IN ({})", placeholders(tokens.len())));
        values.extend(tokens.iter().cloned().map(SqlValue::Text));
    }
    let mut sql = SELECT_PAGE_TEXT.to_owned();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY document_id, page_number, id");
    trace!(%sql, "Querying page text");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values), page_text_from_row)?;
    rows.collect()
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn exists(&self, key: &str) -> Result<bool, IndexError> {
        let key = key.to_owned();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM documents WHERE file_name = ?1)",
                [&key],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn document(&self, key: &str) -> Result<Option<Document>, IndexError> {
        let key = key.to_owned();
        self.with_connection(move |conn| {
            let mut stmt =
                conn.prepare("SELECT file_name, page_count FROM documents WHERE file_name = ?1")?;
            let mut rows = stmt.query_map([&key], |row| {
                Ok(Document {
                    file_name: row.get(0)?,
                    page_count: row.get::<_, i64>(1)? as usize,
                })
            })?;
            rows.next().transpose()
        })
        .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, key: &str) -> Result<bool, IndexError> {
        let key = key.to_owned();
        self.with_connection(move |conn| {
            let deleted = conn.execute("DELETE FROM documents WHERE file_name = ?1", [&key])?;
            Ok(deleted > 0)
        })
        .await
    }

    #[instrument(level = "debug", skip_all, fields(key = %document.file_name, records = records.len()))]
    async fn insert_atomic(
        &self,
        document: &Document,
        records: &[PageText],
    ) -> Result<(), IndexError> {
        let document = document.clone();
        let records = records.to_vec();
        self.with_connection(move |conn| {
            // Dropping `tx` without committing rolls everything back.
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO documents (file_name, page_count) VALUES (?1, ?2)",
                params![document.file_name, document.page_count as i64],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO page_text (document_id, page_number, text, \
                     bbox_left, bbox_top, bbox_right, bbox_bottom) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                )?;
                for record in &records {
                    stmt.execute(params![
                        document.file_name,
                        record.page_number as i64,
                        record.text,
                        record.bbox.left,
                        record.bbox.top,
                        record.bbox.right,
                        record.bbox.bottom,
                    ])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn query_by_keys(
        &self,
        keys: &[String],
        predicate: &TextPredicate,
    ) -> Result<Vec<PageText>, IndexError> {
        if keys.is_empty() || predicate.is_empty() {
            return Ok(vec![]);
        }
        let keys = keys.to_vec();
        let predicate = predicate.clone();
        self.with_connection(move |conn| query_page_text(conn, Some(&keys), &predicate))
            .await
    }

    async fn query_all(
        &self,
        predicate: &TextPredicate,
    ) -> Result<Vec<PageText>, IndexError> {
        if predicate.is_empty() {
            return Ok(vec![]);
        }
        let predicate = predicate.clone();
        self.with_connection(move |conn| query_page_text(conn, None, &predicate))
            .await
    }

    async fn query_by_key_ordered(&self, key: &str) -> Result<Vec<PageText>, IndexError> {
        let keys = vec![key.to_owned()];
        self.with_connection(move |conn| query_page_text(conn, Some(&keys), &TextPredicate::Any))
            .await
    }
}
