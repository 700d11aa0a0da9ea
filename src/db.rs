//! SQLite storage collaborator.
//!
//! Two r2d2 pools share one database file: a single-connection writer pool,
//! which serializes every write batch, and a reader pool sized from the
//! configuration. Connections run in WAL mode so readers never block the
//! writer. All blocking work happens on `spawn_blocking`.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::{
    error::StorageError,
    schema,
    sql::{Statement, Value},
};

/// One result row, columns in projection order.
pub type Row = Vec<Value>;

/// Write statements applied atomically.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    guard: Option<Statement>,
    writes: Vec<Statement>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abandon the batch when `guard` yields any row.
    pub fn guarded(guard: Statement) -> Self {
        Self {
            guard: Some(guard),
            writes: vec![],
        }
    }

    /// Append a write, returning its index in [`BatchOutcome::Applied`].
    pub fn push(&mut self, stmt: Statement) -> usize {
        self.writes.push(stmt);
        self.writes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Result of [`Storage::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every write ran; rows affected per statement.
    Applied(Vec<usize>),
    /// The guard matched; carries the first guard row.
    Skipped(Row),
}

/// Executes statements built by the [`crate::sql`] layer.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn query(&self, stmt: Statement) -> Result<Vec<Row>, StorageError>;

    async fn apply(&self, batch: Batch) -> Result<BatchOutcome, StorageError>;
}

/// Pooled SQLite database.
#[derive(Clone)]
pub struct Sqlite {
    writer: Pool<SqliteConnectionManager>,
    reader: Pool<SqliteConnectionManager>,
}

impl Sqlite {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    pub fn open(path: &Path, readers: u32) -> Result<Self, StorageError> {
        let writer = Pool::builder().max_size(1).build(manager(path))?;
        let conn = writer.get()?;
        Self::init_schema(&conn)?;
        drop(conn);
        let reader = Pool::builder()
            .max_size(readers.max(1))
            .build(manager(path))?;
        info!(path = %path.display(), readers, "database ready");
        Ok(Self { writer, reader })
    }

    fn init_schema(conn: &Connection) -> Result<(), StorageError> {
        conn.execute_batch(schema::DDL)?;
        Ok(())
    }
}

fn manager(path: &Path) -> SqliteConnectionManager {
    SqliteConnectionManager::file(path).with_init(|conn| {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", true)
    })
}

#[async_trait]
impl Storage for Sqlite {
    async fn query(&self, stmt: Statement) -> Result<Vec<Row>, StorageError> {
        let pool = self.reader.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            run_query(&conn, &stmt)
        })
        .await?
    }

    async fn apply(&self, batch: Batch) -> Result<BatchOutcome, StorageError> {
        if batch.is_empty() && batch.guard.is_none() {
            return Ok(BatchOutcome::Applied(vec![]));
        }
        let pool = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            run_batch(&mut conn, &batch)
        })
        .await?
    }
}

fn run_query(conn: &Connection, stmt: &Statement) -> Result<Vec<Row>, StorageError> {
    debug!(sql = stmt.sql(), params = stmt.params().len(), "query");
    let mut prepared = conn.prepare_cached(stmt.sql())?;
    let width = prepared.column_count();
    let rows = prepared.query_map(params_from_iter(stmt.params()), |row| {
        (0..width)
            .map(|i| row.get_ref(i).map(Value::from_ref))
            .collect::<rusqlite::Result<Row>>()
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn run_batch(conn: &mut Connection, batch: &Batch) -> Result<BatchOutcome, StorageError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if let Some(guard) = &batch.guard {
        let hit = run_query(&tx, guard)?.into_iter().next();
        if let Some(row) = hit {
            // dropping the transaction rolls it back
            return Ok(BatchOutcome::Skipped(row));
        }
    }
    let mut affected = Vec::with_capacity(batch.writes.len());
    for stmt in &batch.writes {
        debug!(sql = stmt.sql(), params = stmt.params().len(), "write");
        let n = tx
            .execute(stmt.sql(), params_from_iter(stmt.params()))
            .map_err(classify)?;
        affected.push(n);
    }
    tx.commit()?;
    Ok(BatchOutcome::Applied(affected))
}

fn classify(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StorageError::Conflict
        }
        _ => StorageError::Sqlite(err),
    }
}
