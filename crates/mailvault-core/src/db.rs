use std::{path::Path, sync::Arc, time::Duration};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

/// How long a connection waits on a locked index before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let inner = Builder::new_local(database_path)
            .build()
            .await
            .map_err(DbError::Build)?;

        let db = Self {
            inner: Arc::new(inner),
        };

        // journal_mode is persistent, so setting it once per open is enough.
        let conn = db.connection().await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        Ok(db)
    }

    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT.as_millis()),
        )
        .await?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

// These pragmas report their new value as a row, so they go through query
// rather than execute.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DbError> {
    let mut rows = conn.query(sql, ()).await.map_err(DbError::Statement)?;
    while rows.next().await.map_err(DbError::Statement)?.is_some() {}
    Ok(())
}
