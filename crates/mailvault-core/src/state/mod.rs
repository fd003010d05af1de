//! Durable local state for a single mailbox backup.
//!
//! A state directory holds three things:
//!
//! * `index.sqlite3`: transferred and restored records plus in-flight claims,
//!   shared by every worker of a run.
//! * `state.json`: the small sync document (cursor, scan completeness, last
//!   run time), rewritten atomically on every update.
//! * `.lock`: the advisory run lock, see [`RunLock`].

mod document;
mod index;
mod lock;

use std::{
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::db::{Database, DbError};
use crate::migrations::{MigrationError, run_migrations};

pub use document::{STATE_FILE, StatePatch, SyncStateDocument};
pub use index::{ClaimKind, RestoreRecord};
pub use lock::{LOCK_FILE, RunLock};

pub const INDEX_FILE: &str = "index.sqlite3";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state i/o on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("index database error: {0}")]
    Database(#[from] DbError),
    #[error("index migration failed: {0}")]
    Migration(#[from] MigrationError),
    #[error("index query failed: {0}")]
    Sql(#[from] libsql::Error),
    #[error("state document {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("another run holds the lock at {0}")]
    LockHeld(PathBuf),
}

pub struct StateStore {
    root: PathBuf,
    db: Database,
    document_path: PathBuf,
    // Serializes read-modify-write cycles on state.json within this process.
    document_gate: Mutex<()>,
}

impl StateStore {
    /// Opens (creating if needed) the state directory at `root` and brings the
    /// index schema up to date. Callers should hold a [`RunLock`] on `root`
    /// before opening.
    pub async fn open(root: &Path) -> Result<Self, StateError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| StateError::Io {
                path: root.to_path_buf(),
                source,
            })?;

        let db = Database::new(&root.join(INDEX_FILE)).await?;
        run_migrations(&db).await?;

        Ok(Self {
            root: root.to_path_buf(),
            db,
            document_path: root.join(STATE_FILE),
            document_gate: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
