use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use libsql::{Connection, params};
use tracing::debug;

use super::{RunLock, StateError, StateStore};

/// Which side of the sync an in-flight claim belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Upload,
    Restore,
}

impl ClaimKind {
    fn claim_table(self) -> &'static str {
        match self {
            ClaimKind::Upload => "inflight_uploads",
            ClaimKind::Restore => "inflight_restores",
        }
    }

    fn done_condition(self) -> &'static str {
        match self {
            ClaimKind::Upload => "SELECT 1 FROM messages WHERE id = ?1",
            ClaimKind::Restore => "SELECT 1 FROM restored WHERE source_id = ?1",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRecord {
    pub source_id: String,
    /// `None` when the message was already present at the destination.
    pub restored_id: Option<String>,
    pub restored_at: i64,
    pub message_id_header: Option<String>,
    pub raw_sha256: Option<String>,
}

impl StateStore {
    /// Claims `id` for the current worker. Returns `false` when the item is
    /// already recorded as done or another live claim holds it.
    pub async fn claim(
        &self,
        kind: ClaimKind,
        id: &str,
        stale_after: Duration,
    ) -> Result<bool, StateError> {
        self.claim_at(kind, id, stale_after, Utc::now()).await
    }

    /// Same as [`claim`](Self::claim) with an explicit clock. A claim older than
    /// `stale_after` is taken over.
    pub async fn claim_at(
        &self,
        kind: ClaimKind,
        id: &str,
        stale_after: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StateError> {
        let now_secs = now.timestamp();
        let stale_secs = i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX);
        let stale_before = now_secs.saturating_sub(stale_secs);
        let table = kind.claim_table();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO {table} (id, claimed_at)
                     SELECT ?1, ?2 WHERE NOT EXISTS ({done})
                     ON CONFLICT(id) DO UPDATE SET claimed_at = excluded.claimed_at
                     WHERE {table}.claimed_at < ?3
                     RETURNING id",
                    done = kind.done_condition(),
                ),
                params![id, now_secs, stale_before],
            )
            .await?;

        Ok(rows.next().await?.is_some())
    }

    pub async fn release(&self, kind: ClaimKind, id: &str) -> Result<(), StateError> {
        let conn = self.db.connection().await?;
        conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", kind.claim_table()),
            params![id],
        )
        .await?;
        Ok(())
    }

    /// Runs `work` for a claimed item, then releases the claim whether `work`
    /// returned or panicked. A panic is resumed once the claim is gone.
    pub async fn release_after<T, E, Fut>(
        &self,
        kind: ClaimKind,
        id: &str,
        work: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: From<StateError>,
    {
        let outcome = AssertUnwindSafe(work).catch_unwind().await;
        self.release(kind, id).await?;
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Drops every claim of `kind`. Only the lock holder may do this, since
    /// any claim left behind at that point belongs to a dead run.
    pub async fn clear_in_flight_claims(
        &self,
        _lock: &RunLock,
        kind: ClaimKind,
    ) -> Result<u64, StateError> {
        let conn = self.db.connection().await?;
        let cleared = conn
            .execute(&format!("DELETE FROM {}", kind.claim_table()), ())
            .await?;
        if cleared > 0 {
            debug!(?kind, cleared, "cleared leftover in-flight claims");
        }
        Ok(cleared)
    }

    pub async fn in_flight_count(&self, kind: ClaimKind) -> Result<u64, StateError> {
        let conn = self.db.connection().await?;
        count(&conn, &format!("SELECT COUNT(*) FROM {}", kind.claim_table())).await
    }

    /// Records a transfer once. Marking an id again keeps the first timestamp.
    pub async fn mark_transferred(&self, id: &str) -> Result<(), StateError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO messages (id, uploaded_at) VALUES (?1, ?2)
             ON CONFLICT(id) DO NOTHING",
            params![id, Utc::now().timestamp()],
        )
        .await?;
        Ok(())
    }

    pub async fn was_transferred(&self, id: &str) -> Result<bool, StateError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("SELECT 1 FROM messages WHERE id = ?1", params![id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn transferred_at(&self, id: &str) -> Result<Option<i64>, StateError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("SELECT uploaded_at FROM messages WHERE id = ?1", params![id])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub async fn transferred_count(&self) -> Result<u64, StateError> {
        let conn = self.db.connection().await?;
        count(&conn, "SELECT COUNT(*) FROM messages").await
    }

    /// Inserts `(id, transferred_at)` pairs that are not yet recorded and
    /// returns how many were new. Existing records keep their timestamp.
    pub async fn bulk_mark_transferred(
        &self,
        entries: &[(String, i64)],
    ) -> Result<u64, StateError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        let mut inserted = 0;
        for (id, uploaded_at) in entries {
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO messages (id, uploaded_at) VALUES (?1, ?2)",
                    params![id.as_str(), *uploaded_at],
                )
                .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn mark_restored(&self, record: &RestoreRecord) -> Result<(), StateError> {
        let conn = self.db.connection().await?;
        conn.execute(
            "INSERT INTO restored (source_id, restored_id, restored_at, message_id_header, raw_sha256)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_id) DO UPDATE SET
                restored_id = excluded.restored_id,
                restored_at = excluded.restored_at,
                message_id_header = excluded.message_id_header,
                raw_sha256 = excluded.raw_sha256",
            params![
                record.source_id.as_str(),
                record.restored_id.clone(),
                record.restored_at,
                record.message_id_header.clone(),
                record.raw_sha256.clone()
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn was_restored(&self, source_id: &str) -> Result<bool, StateError> {
        Ok(self.restore_record(source_id).await?.is_some())
    }

    pub async fn restore_record(
        &self,
        source_id: &str,
    ) -> Result<Option<RestoreRecord>, StateError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT source_id, restored_id, restored_at, message_id_header, raw_sha256
                 FROM restored WHERE source_id = ?1",
                params![source_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(RestoreRecord {
            source_id: row.get(0)?,
            restored_id: row.get(1)?,
            restored_at: row.get(2)?,
            message_id_header: row.get(3)?,
            raw_sha256: row.get(4)?,
        }))
    }

    pub async fn restored_count(&self) -> Result<u64, StateError> {
        let conn = self.db.connection().await?;
        count(&conn, "SELECT COUNT(*) FROM restored").await
    }

    /// Insert-if-absent counterpart of [`mark_restored`](Self::mark_restored),
    /// used when rebuilding the index from remote markers.
    pub async fn bulk_mark_restored(&self, records: &[RestoreRecord]) -> Result<u64, StateError> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;
        let mut inserted = 0;
        for record in records {
            inserted += tx
                .execute(
                    "INSERT OR IGNORE INTO restored (source_id, restored_id, restored_at, message_id_header, raw_sha256)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        record.source_id.as_str(),
                        record.restored_id.clone(),
                        record.restored_at,
                        record.message_id_header.clone(),
                        record.raw_sha256.clone()
                    ],
                )
                .await?;
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

async fn count(conn: &Connection, sql: &str) -> Result<u64, StateError> {
    let mut rows = conn.query(sql, ()).await?;
    let value: i64 = match rows.next().await? {
        Some(row) => row.get(0)?,
        None => 0,
    };
    Ok(value.max(0) as u64)
}
