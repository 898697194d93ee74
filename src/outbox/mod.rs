//! The outbox: two append-mostly tables (`waits`, `retries`) that durably
//! schedule future broker publications within the same transaction as the
//! state change that triggered them.
//!
//! `FOR UPDATE SKIP LOCKED` is the concurrency primitive: multiple
//! processors scan the same table without ever claiming the same row, and a
//! claim holds its row locks until the processor's transaction commits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use snafu::prelude::*;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Transaction;
use uuid::Uuid;

pub mod processor;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Database error: {message}"))]
    Database { message: String },

    #[snafu(display("outbox row {id} is not part of this claim"))]
    NotClaimed { id: Uuid },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxTable {
    Waits,
    Retries,
}

impl OutboxTable {
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            OutboxTable::Waits => "waits",
            OutboxTable::Retries => "retries",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "PENDING" => Some(OutboxStatus::Pending),
            "SENT" => Some(OutboxStatus::Sent),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One outbox row. Ids are UUIDv7 so primary-key order roughly follows
/// creation time, which keeps the `(status, delayed_until)` scan local.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub message: String,
    pub status: OutboxStatus,
    pub delayed_until: DateTime<Utc>,
    pub attempt_count: i32,
    pub last_error: Option<String>,
}

/// A message awaiting insertion, used for the consumer's atomic batch.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub table: OutboxTable,
    pub message: String,
    pub delayed_until: DateTime<Utc>,
}

#[async_trait]
pub trait OutboxStore: Send + Sync + std::fmt::Debug {
    /// Insert one PENDING row.
    async fn enqueue(
        &self,
        table: OutboxTable,
        message: &str,
        delayed_until: DateTime<Utc>,
    ) -> Result<Uuid>;

    /// Insert a batch of PENDING rows atomically.
    async fn enqueue_batch(&self, batch: &[PendingMessage]) -> Result<Vec<Uuid>>;

    /// Claim due PENDING rows. The returned batch holds the claim (row locks
    /// in PostgreSQL) until [`ClaimedBatch::commit`]; dropping it releases
    /// the claim without applying any marks.
    async fn claim_due(
        &self,
        table: OutboxTable,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Box<dyn ClaimedBatch>>;

    /// Delete SENT rows scheduled before `cutoff`, at most `limit` at a time.
    async fn reap_sent(
        &self,
        table: OutboxTable,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64>;

    /// Insert a row directly in FAILED state, recording a terminal error
    /// (uncaught workflow failure after retry exhaustion).
    async fn record_failed(
        &self,
        table: OutboxTable,
        message: &str,
        error: &str,
    ) -> Result<Uuid>;

    async fn count(&self, table: OutboxTable, status: OutboxStatus) -> Result<i64>;

    async fn fetch_all(&self, table: OutboxTable) -> Result<Vec<OutboxRecord>>;
}

/// The rows claimed by one processor pass, with their pending state marks.
#[async_trait]
pub trait ClaimedBatch: Send {
    fn rows(&self) -> &[OutboxRecord];

    /// PENDING → SENT; bumps `attempt_count`.
    async fn mark_sent(&mut self, id: Uuid) -> Result<()>;

    /// Keep PENDING, push `delayed_until` forward, optionally rewrite the
    /// message (join merges), record the error; bumps `attempt_count`.
    async fn reschedule(
        &mut self,
        id: Uuid,
        message: &str,
        delayed_until: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<()>;

    /// PENDING → FAILED on exhausted attempts; bumps `attempt_count`.
    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory provider
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    rows: HashMap<OutboxTable, Vec<OutboxRecord>>,
    locked: HashMap<OutboxTable, Vec<Uuid>>,
}

/// In-memory outbox for tests and single-process runs. Mirrors the SKIP
/// LOCKED semantics: rows locked by an uncommitted claim are skipped by
/// concurrent claims, and marks only apply at commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutboxStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryOutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test support: shift every pending row's `delayed_until` into the past
    /// by `by`, standing in for an advancing clock.
    pub fn backdate(&self, table: OutboxTable, by: std::time::Duration) {
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        let shift = ChronoDuration::from_std(by).unwrap_or(ChronoDuration::zero());
        if let Some(rows) = inner.rows.get_mut(&table) {
            for row in rows {
                row.delayed_until -= shift;
            }
        }
    }
}

enum Mark {
    Sent,
    Reschedule {
        message: String,
        delayed_until: DateTime<Utc>,
        last_error: Option<String>,
    },
    Failed {
        error: String,
    },
}

struct MemoryClaim {
    inner: Arc<Mutex<MemoryInner>>,
    table: OutboxTable,
    rows: Vec<OutboxRecord>,
    marks: Vec<(Uuid, Mark)>,
    committed: bool,
}

impl MemoryClaim {
    fn release(&self) {
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        let ids: Vec<Uuid> = self.rows.iter().map(|r| r.id).collect();
        if let Some(locked) = inner.locked.get_mut(&self.table) {
            locked.retain(|id| !ids.contains(id));
        }
    }
}

impl Drop for MemoryClaim {
    fn drop(&mut self) {
        if !self.committed {
            self.release();
        }
    }
}

#[async_trait]
impl ClaimedBatch for MemoryClaim {
    fn rows(&self) -> &[OutboxRecord] {
        &self.rows
    }

    async fn mark_sent(&mut self, id: Uuid) -> Result<()> {
        ensure!(self.rows.iter().any(|r| r.id == id), NotClaimedSnafu { id });
        self.marks.push((id, Mark::Sent));
        Ok(())
    }

    async fn reschedule(
        &mut self,
        id: Uuid,
        message: &str,
        delayed_until: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<()> {
        ensure!(self.rows.iter().any(|r| r.id == id), NotClaimedSnafu { id });
        self.marks.push((
            id,
            Mark::Reschedule {
                message: message.to_string(),
                delayed_until,
                last_error: last_error.map(str::to_string),
            },
        ));
        Ok(())
    }

    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<()> {
        ensure!(self.rows.iter().any(|r| r.id == id), NotClaimedSnafu { id });
        self.marks.push((
            id,
            Mark::Failed {
                error: error.to_string(),
            },
        ));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        {
            let mut inner = self.inner.lock().expect("outbox mutex poisoned");
            let rows = inner.rows.entry(self.table).or_default();
            for (id, mark) in &self.marks {
                if let Some(row) = rows.iter_mut().find(|r| r.id == *id) {
                    row.attempt_count += 1;
                    match mark {
                        Mark::Sent => row.status = OutboxStatus::Sent,
                        Mark::Reschedule {
                            message,
                            delayed_until,
                            last_error,
                        } => {
                            row.message = message.clone();
                            row.delayed_until = *delayed_until;
                            row.last_error = last_error.clone();
                        }
                        Mark::Failed { error } => {
                            row.status = OutboxStatus::Failed;
                            row.last_error = Some(error.clone());
                        }
                    }
                }
            }
        }
        self.committed = true;
        self.release();
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(
        &self,
        table: OutboxTable,
        message: &str,
        delayed_until: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        inner.rows.entry(table).or_default().push(OutboxRecord {
            id,
            message: message.to_string(),
            status: OutboxStatus::Pending,
            delayed_until,
            attempt_count: 0,
            last_error: None,
        });
        Ok(id)
    }

    async fn enqueue_batch(&self, batch: &[PendingMessage]) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        let mut ids = Vec::with_capacity(batch.len());
        for pending in batch {
            let id = Uuid::now_v7();
            inner
                .rows
                .entry(pending.table)
                .or_default()
                .push(OutboxRecord {
                    id,
                    message: pending.message.clone(),
                    status: OutboxStatus::Pending,
                    delayed_until: pending.delayed_until,
                    attempt_count: 0,
                    last_error: None,
                });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn claim_due(
        &self,
        table: OutboxTable,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Box<dyn ClaimedBatch>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        let locked = inner.locked.entry(table).or_default().clone();

        let mut due: Vec<OutboxRecord> = inner
            .rows
            .entry(table)
            .or_default()
            .iter()
            .filter(|row| {
                row.status == OutboxStatus::Pending
                    && row.delayed_until <= now
                    && row.attempt_count < max_attempts
                    && !locked.contains(&row.id)
            })
            .cloned()
            .collect();
        due.sort_by_key(|row| row.delayed_until);
        due.truncate(limit as usize);

        inner
            .locked
            .entry(table)
            .or_default()
            .extend(due.iter().map(|row| row.id));

        Ok(Box::new(MemoryClaim {
            inner: self.inner.clone(),
            table,
            rows: due,
            marks: Vec::new(),
            committed: false,
        }))
    }

    async fn reap_sent(
        &self,
        table: OutboxTable,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        let rows = inner.rows.entry(table).or_default();
        let mut removed = 0u64;
        rows.retain(|row| {
            if removed < limit as u64
                && row.status == OutboxStatus::Sent
                && row.delayed_until < cutoff
            {
                removed += 1;
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn record_failed(
        &self,
        table: OutboxTable,
        message: &str,
        error: &str,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        inner.rows.entry(table).or_default().push(OutboxRecord {
            id,
            message: message.to_string(),
            status: OutboxStatus::Failed,
            delayed_until: Utc::now(),
            attempt_count: 0,
            last_error: Some(error.to_string()),
        });
        Ok(id)
    }

    async fn count(&self, table: OutboxTable, status: OutboxStatus) -> Result<i64> {
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        Ok(inner
            .rows
            .entry(table)
            .or_default()
            .iter()
            .filter(|row| row.status == status)
            .count() as i64)
    }

    async fn fetch_all(&self, table: OutboxTable) -> Result<Vec<OutboxRecord>> {
        let mut inner = self.inner.lock().expect("outbox mutex poisoned");
        Ok(inner.rows.entry(table).or_default().clone())
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL provider
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to connect to PostgreSQL: {e}"),
            })?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: PgPool) -> Result<Self> {
        let schema_sql = include_str!("./sql/outbox_postgres.sql");
        for statement in schema_sql.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| Error::Database {
                    message: format!("Failed to execute schema statement: {e}"),
                })?;
        }
        Ok(Self { pool })
    }
}

type OutboxRow = (String, String, String, DateTime<Utc>, i32, Option<String>);

fn record_from_row(row: OutboxRow) -> Result<OutboxRecord> {
    let (id, message, status, delayed_until, attempt_count, last_error) = row;
    Ok(OutboxRecord {
        id: id.parse().map_err(|e| Error::Database {
            message: format!("Malformed outbox id: {e}"),
        })?,
        message,
        status: OutboxStatus::parse(&status).ok_or_else(|| Error::Database {
            message: format!("Unknown outbox status: {status}"),
        })?,
        delayed_until,
        attempt_count,
        last_error,
    })
}

struct PostgresClaim {
    tx: Transaction<'static, Postgres>,
    table: OutboxTable,
    rows: Vec<OutboxRecord>,
}

#[async_trait]
impl ClaimedBatch for PostgresClaim {
    fn rows(&self) -> &[OutboxRecord] {
        &self.rows
    }

    async fn mark_sent(&mut self, id: Uuid) -> Result<()> {
        ensure!(self.rows.iter().any(|r| r.id == id), NotClaimedSnafu { id });
        let sql = format!(
            "UPDATE {} SET status = 'SENT', attempt_count = attempt_count + 1 WHERE id = $1",
            self.table.table_name()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to mark row sent: {e}"),
            })?;
        Ok(())
    }

    async fn reschedule(
        &mut self,
        id: Uuid,
        message: &str,
        delayed_until: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<()> {
        ensure!(self.rows.iter().any(|r| r.id == id), NotClaimedSnafu { id });
        let sql = format!(
            "UPDATE {} SET message = $2, delayed_until = $3, last_error = $4, \
             attempt_count = attempt_count + 1 WHERE id = $1",
            self.table.table_name()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(message)
            .bind(delayed_until)
            .bind(last_error)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to reschedule row: {e}"),
            })?;
        Ok(())
    }

    async fn mark_failed(&mut self, id: Uuid, error: &str) -> Result<()> {
        ensure!(self.rows.iter().any(|r| r.id == id), NotClaimedSnafu { id });
        let sql = format!(
            "UPDATE {} SET status = 'FAILED', last_error = $2, \
             attempt_count = attempt_count + 1 WHERE id = $1",
            self.table.table_name()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(error)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to mark row failed: {e}"),
            })?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| Error::Database {
            message: format!("Failed to commit claim: {e}"),
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(
        &self,
        table: OutboxTable,
        message: &str,
        delayed_until: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let sql = format!(
            "INSERT INTO {} (id, message, status, delayed_until) VALUES ($1, $2, 'PENDING', $3)",
            table.table_name()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(message)
            .bind(delayed_until)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to enqueue message: {e}"),
            })?;
        Ok(id)
    }

    async fn enqueue_batch(&self, batch: &[PendingMessage]) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(|e| Error::Database {
            message: format!("Failed to begin transaction: {e}"),
        })?;
        let mut ids = Vec::with_capacity(batch.len());
        for pending in batch {
            let id = Uuid::now_v7();
            let sql = format!(
                "INSERT INTO {} (id, message, status, delayed_until) VALUES ($1, $2, 'PENDING', $3)",
                pending.table.table_name()
            );
            sqlx::query(&sql)
                .bind(id.to_string())
                .bind(&pending.message)
                .bind(pending.delayed_until)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database {
                    message: format!("Failed to enqueue message: {e}"),
                })?;
            ids.push(id);
        }
        tx.commit().await.map_err(|e| Error::Database {
            message: format!("Failed to commit batch: {e}"),
        })?;
        Ok(ids)
    }

    async fn claim_due(
        &self,
        table: OutboxTable,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Box<dyn ClaimedBatch>> {
        let mut tx = self.pool.begin().await.map_err(|e| Error::Database {
            message: format!("Failed to begin transaction: {e}"),
        })?;

        let sql = format!(
            "SELECT id, message, status, delayed_until, attempt_count, last_error \
             FROM {} \
             WHERE status = 'PENDING' AND delayed_until <= now() AND attempt_count < $1 \
             ORDER BY delayed_until ASC \
             FOR UPDATE SKIP LOCKED \
             LIMIT $2",
            table.table_name()
        );
        let raw_rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to claim due rows: {e}"),
            })?;

        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            rows.push(record_from_row(raw)?);
        }

        Ok(Box::new(PostgresClaim { tx, table, rows }))
    }

    async fn reap_sent(
        &self,
        table: OutboxTable,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE id IN ( \
             SELECT id FROM {table} WHERE status = 'SENT' AND delayed_until < $1 \
             ORDER BY delayed_until ASC LIMIT $2)",
            table = table.table_name()
        );
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .bind(limit)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to reap sent rows: {e}"),
            })?;
        Ok(result.rows_affected())
    }

    async fn record_failed(
        &self,
        table: OutboxTable,
        message: &str,
        error: &str,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let sql = format!(
            "INSERT INTO {} (id, message, status, delayed_until, last_error) \
             VALUES ($1, $2, 'FAILED', $3, $4)",
            table.table_name()
        );
        sqlx::query(&sql)
            .bind(id.to_string())
            .bind(message)
            .bind(Utc::now())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to record terminal failure: {e}"),
            })?;
        Ok(id)
    }

    async fn count(&self, table: OutboxTable, status: OutboxStatus) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE status = $1",
            table.table_name()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to count rows: {e}"),
            })?;
        Ok(count)
    }

    async fn fetch_all(&self, table: OutboxTable) -> Result<Vec<OutboxRecord>> {
        let sql = format!(
            "SELECT id, message, status, delayed_until, attempt_count, last_error FROM {} ORDER BY id",
            table.table_name()
        );
        let raw_rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to fetch rows: {e}"),
            })?;
        let mut rows = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            rows.push(record_from_row(raw)?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_claim_due() {
        let store = MemoryOutboxStore::new();
        store
            .enqueue(OutboxTable::Waits, "m1", Utc::now())
            .await
            .unwrap();
        store
            .enqueue(
                OutboxTable::Waits,
                "m2",
                Utc::now() + ChronoDuration::hours(1),
            )
            .await
            .unwrap();

        let claim = store.claim_due(OutboxTable::Waits, 10, 5).await.unwrap();
        assert_eq!(claim.rows().len(), 1);
        assert_eq!(claim.rows()[0].message, "m1");
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint() {
        let store = MemoryOutboxStore::new();
        for i in 0..100 {
            store
                .enqueue(OutboxTable::Retries, &format!("m{i}"), Utc::now())
                .await
                .unwrap();
        }

        let first = store.claim_due(OutboxTable::Retries, 50, 5).await.unwrap();
        let second = store.claim_due(OutboxTable::Retries, 50, 5).await.unwrap();

        let mut ids: Vec<Uuid> = first
            .rows()
            .iter()
            .chain(second.rows().iter())
            .map(|r| r.id)
            .collect();
        assert_eq!(ids.len(), 100);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 100, "no row may be claimed twice");
    }

    #[tokio::test]
    async fn dropping_a_claim_releases_the_rows() {
        let store = MemoryOutboxStore::new();
        store
            .enqueue(OutboxTable::Waits, "m", Utc::now())
            .await
            .unwrap();

        {
            let claim = store.claim_due(OutboxTable::Waits, 10, 5).await.unwrap();
            assert_eq!(claim.rows().len(), 1);
            let blocked = store.claim_due(OutboxTable::Waits, 10, 5).await.unwrap();
            assert!(blocked.rows().is_empty());
        }

        let retry = store.claim_due(OutboxTable::Waits, 10, 5).await.unwrap();
        assert_eq!(retry.rows().len(), 1);
    }

    #[tokio::test]
    async fn marks_apply_at_commit_and_bump_attempts() {
        let store = MemoryOutboxStore::new();
        let id = store
            .enqueue(OutboxTable::Retries, "m", Utc::now())
            .await
            .unwrap();

        let mut claim = store.claim_due(OutboxTable::Retries, 10, 5).await.unwrap();
        claim
            .reschedule(id, "m", Utc::now() + ChronoDuration::seconds(2), Some("boom"))
            .await
            .unwrap();
        claim.commit().await.unwrap();

        let rows = store.fetch_all(OutboxTable::Retries).await.unwrap();
        assert_eq!(rows[0].attempt_count, 1);
        assert_eq!(rows[0].status, OutboxStatus::Pending);
        assert_eq!(rows[0].last_error.as_deref(), Some("boom"));

        let claim = store.claim_due(OutboxTable::Retries, 10, 5).await.unwrap();
        assert!(claim.rows().is_empty(), "rescheduled row is not yet due");
        store.backdate(OutboxTable::Retries, std::time::Duration::from_secs(5));
        drop(claim);

        let mut claim = store.claim_due(OutboxTable::Retries, 10, 5).await.unwrap();
        assert_eq!(claim.rows().len(), 1);
        claim.mark_failed(id, "gave up").await.unwrap();
        claim.commit().await.unwrap();

        let rows = store.fetch_all(OutboxTable::Retries).await.unwrap();
        assert_eq!(rows[0].status, OutboxStatus::Failed);
        assert_eq!(rows[0].attempt_count, 2, "attempt count only grows");
    }

    #[tokio::test]
    async fn exhausted_rows_are_not_claimed() {
        let store = MemoryOutboxStore::new();
        let id = store
            .enqueue(OutboxTable::Retries, "m", Utc::now())
            .await
            .unwrap();
        for _ in 0..3 {
            let mut claim = store.claim_due(OutboxTable::Retries, 10, 3).await.unwrap();
            if claim.rows().is_empty() {
                break;
            }
            claim
                .reschedule(id, "m", Utc::now(), Some("err"))
                .await
                .unwrap();
            claim.commit().await.unwrap();
        }
        let claim = store.claim_due(OutboxTable::Retries, 10, 3).await.unwrap();
        assert!(claim.rows().is_empty());
    }

    #[tokio::test]
    async fn reap_sent_deletes_old_rows_only() {
        let store = MemoryOutboxStore::new();
        let sent = store
            .enqueue(OutboxTable::Waits, "old", Utc::now() - ChronoDuration::hours(2))
            .await
            .unwrap();
        store
            .enqueue(OutboxTable::Waits, "pending", Utc::now() - ChronoDuration::hours(2))
            .await
            .unwrap();

        let mut claim = store.claim_due(OutboxTable::Waits, 1, 5).await.unwrap();
        claim.mark_sent(sent).await.unwrap();
        claim.commit().await.unwrap();

        let reaped = store
            .reap_sent(OutboxTable::Waits, Utc::now() - ChronoDuration::hours(1), 10)
            .await
            .unwrap();
        assert_eq!(reaped, 1);
        let rows = store.fetch_all(OutboxTable::Waits).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, OutboxStatus::Pending);
    }
}
