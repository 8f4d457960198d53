use std::path::Path;
use std::sync::Arc;

use arrow_schema::{Schema, SchemaRef};
use duckdb::DuckdbConnectionManager;
use r2d2::{Pool, PooledConnection};
use tracing::warn;

use crate::error::{Result, ServerError};

pub type EngineConnection = PooledConnection<DuckdbConnectionManager>;

/// Shared pool of connections to the embedded engine. Every connection sees
/// the same database; table functions resolve filesystem paths relative to
/// the server process working directory.
#[derive(Clone)]
pub struct EnginePool {
    pool: Pool<DuckdbConnectionManager>,
}

impl EnginePool {
    pub fn open_in_memory(max_size: u32) -> Result<Self> {
        let manager = DuckdbConnectionManager::memory()?;
        Ok(Self {
            pool: Pool::builder().max_size(max_size).build(manager)?,
        })
    }

    pub fn open_file(path: &Path, max_size: u32) -> Result<Self> {
        let manager = DuckdbConnectionManager::file(path)?;
        Ok(Self {
            pool: Pool::builder().max_size(max_size).build(manager)?,
        })
    }

    /// Blocking checkout. Callers on the async runtime must wrap engine work
    /// in `spawn_blocking`.
    pub fn get(&self) -> Result<EngineConnection> {
        Ok(self.pool.get()?)
    }

    /// The result schema of `sql` without materializing any rows, by running
    /// the statement wrapped in LIMIT 0.
    pub fn probe_schema(&self, sql: &str) -> Result<SchemaRef> {
        let conn = self.get()?;
        probe_schema_on(&conn, sql)
    }

    /// Like [EnginePool::probe_schema] but degrades to an empty schema when
    /// the engine rejects the statement: binding is deferred to fetch time,
    /// where the engine error surfaces on the stream instead.
    pub fn probe_schema_or_empty(&self, sql: &str) -> SchemaRef {
        match self.probe_schema(sql) {
            Ok(schema) => schema,
            Err(e) => {
                warn!("deferring binding failure to fetch time: {e}");
                Arc::new(Schema::empty())
            }
        }
    }
}

/// Schema probe against a specific connection. Prepared statement handles
/// use this to describe their statement on their own pinned connection.
pub fn probe_schema_on(conn: &duckdb::Connection, sql: &str) -> Result<SchemaRef> {
    let probe = format!("SELECT * FROM ({}) LIMIT 0", sql.trim_end_matches(';'));
    let mut stmt = conn.prepare(&probe)?;
    let rows = stmt.query_arrow([])?;
    Ok(rows.get_schema())
}

/// Splits an engine error back into the cancellation signal it originated
/// from, when the caller interrupted the connection.
pub fn cancellation_aware(e: duckdb::Error, cancelled: bool) -> ServerError {
    if cancelled {
        ServerError::Cancelled
    } else {
        e.into()
    }
}
