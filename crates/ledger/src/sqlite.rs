//! SQLite-backed ledger.
//!
//! ## Schema
//!
//! - `ledger_events`: one row per retained event, keyed by
//!   `(device_id, tenant_id, position)`; `id` is globally unique.
//! - `ledger_heads`: one row per chain holding the tail hash/position, the
//!   verification anchor and the sync frontier. It is updated in the same
//!   transaction as every append, so the tail survives restarts and pruning.
//!
//! The database runs in WAL mode with `synchronous=FULL`: a committed append is
//! on disk before `append` returns, and readers see the last committed snapshot
//! while a write is in flight.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::instrument;

use tally_core::{Clock, EventId, EventType, SystemClock};
use tally_events::{ChainHash, ChainScope, ChainScoped, Event, EventFields, SyncState, verify_chain};

use crate::config::LedgerConfig;
use crate::error::{HaltLatch, LedgerError};
use crate::r#trait::{ChainTail, LedgerExport, LedgerStats, LocalLedger, SyncFrontier};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ledger_events (
        device_id      TEXT    NOT NULL,
        tenant_id      TEXT    NOT NULL,
        position       INTEGER NOT NULL,
        id             TEXT    NOT NULL UNIQUE,
        event_type     TEXT    NOT NULL,
        actor_id       TEXT    NOT NULL,
        payload        TEXT    NOT NULL,
        timestamp_ms   INTEGER NOT NULL,
        previous_hash  TEXT    NOT NULL,
        hash           TEXT    NOT NULL,
        sync_state     TEXT    NOT NULL,
        synced_at_ms   INTEGER NULL,
        PRIMARY KEY (device_id, tenant_id, position)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_events_by_state
        ON ledger_events (device_id, tenant_id, sync_state, position)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ledger_events_by_type
        ON ledger_events (device_id, tenant_id, event_type, position)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_heads (
        device_id          TEXT    NOT NULL,
        tenant_id          TEXT    NOT NULL,
        head_hash          TEXT    NOT NULL,
        head_position      INTEGER NOT NULL,
        head_timestamp_ms  INTEGER NOT NULL,
        anchor_hash        TEXT    NOT NULL,
        frontier_position  INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (device_id, tenant_id)
    )
    "#,
];

macro_rules! select_events {
    ($rest:literal) => {
        concat!(
            "SELECT id, event_type, actor_id, payload, device_id, tenant_id, timestamp_ms, \
             previous_hash, hash, sync_state, synced_at_ms \
             FROM ledger_events WHERE device_id = ?1 AND tenant_id = ?2 ",
            $rest
        )
    };
}

const UNSYNCED: &str = "UNSYNCED";
const SYNCED: &str = "SYNCED";

#[derive(Debug)]
struct HeadRow {
    hash: ChainHash,
    position: u64,
    timestamp: DateTime<Utc>,
    anchor: ChainHash,
    frontier_position: u64,
}

/// Durable ledger for one chain inside a (possibly shared) SQLite file.
pub struct SqliteLedger {
    pool: SqlitePool,
    scope: ChainScope,
    write_lock: Mutex<()>,
    halt: HaltLatch,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("scope", &self.scope)
            .field("halt", &self.halt)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open the database at `config.path`, creating it when
    /// `config.create_if_missing` allows.
    #[instrument(skip(config, scope), fields(path = %config.path.display(), chain = %scope), err)]
    pub async fn open(config: &LedgerConfig, scope: ChainScope) -> Result<Self, LedgerError> {
        if config.create_if_missing {
            if let Some(parent) = config.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::WriteError(format!(
                        "failed to create ledger directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(config.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| write_error("connect", e))?;

        Self::from_pool(pool, scope).await
    }

    /// Use an existing pool, creating the schema if needed.
    ///
    /// The stored chain is verified before the ledger is handed out. A broken
    /// chain still opens, but halted: reads work and mutations are refused.
    pub async fn from_pool(pool: SqlitePool, scope: ChainScope) -> Result<Self, LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| write_error("migrate", e))?;
        }

        let ledger = Self {
            pool,
            scope,
            write_lock: Mutex::new(()),
            halt: HaltLatch::default(),
            clock: Arc::new(SystemClock),
        };

        match ledger.check_integrity().await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                ledger.halt.observe(&ledger.scope, err);
            }
            Err(err) => return Err(err),
        }

        Ok(ledger)
    }

    /// Clock used to stamp `synced_at`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn load_head<'e, E>(&self, executor: E) -> Result<Option<HeadRow>, LedgerError>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let row = sqlx::query(
            r#"
            SELECT head_hash, head_position, head_timestamp_ms, anchor_hash, frontier_position
            FROM ledger_heads
            WHERE device_id = ?1 AND tenant_id = ?2
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .fetch_optional(executor)
        .await
        .map_err(|e| read_error("load_head", e))?;

        row.map(|row| -> Result<HeadRow, LedgerError> {
            let hash: String = row.try_get("head_hash").map_err(corrupt)?;
            let position: i64 = row.try_get("head_position").map_err(corrupt)?;
            let timestamp_ms: i64 = row.try_get("head_timestamp_ms").map_err(corrupt)?;
            let anchor: String = row.try_get("anchor_hash").map_err(corrupt)?;
            let frontier_position: i64 = row.try_get("frontier_position").map_err(corrupt)?;

            Ok(HeadRow {
                hash: hash.parse().map_err(corrupt)?,
                position: position as u64,
                timestamp: millis_to_datetime(timestamp_ms)?,
                anchor: anchor.parse().map_err(corrupt)?,
                frontier_position: frontier_position as u64,
            })
        })
        .transpose()
    }

    /// Everything `verify` checks, without halting.
    async fn check_integrity(&self) -> Result<(), LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| read_error("verify", e))?;

        let head = self.load_head(&mut *tx).await?;

        let rows = sqlx::query(select_events!("ORDER BY position ASC"))
            .bind(self.scope.device_id.as_str())
            .bind(self.scope.tenant_id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| read_error("verify", e))?;
        let events = rows_to_events(&rows)?;

        let Some(head) = head else {
            return match events.len() {
                0 => Ok(()),
                n => Err(LedgerError::Corrupted(format!(
                    "{n} events stored without a chain head"
                ))),
            };
        };

        verify_chain(&head.anchor, &events).map_err(|e| LedgerError::Corrupted(e.to_string()))?;

        match events.last() {
            Some(last) if last.hash() == &head.hash => {}
            _ => {
                return Err(LedgerError::Corrupted(
                    "tail record does not match last event".into(),
                ));
            }
        }

        let first_position = (head.position + 1)
            .checked_sub(events.len() as u64)
            .filter(|p| *p >= 1)
            .ok_or_else(|| {
                LedgerError::Corrupted(format!(
                    "{} retained events exceed head position {}",
                    events.len(),
                    head.position
                ))
            })?;
        for (offset, event) in events.iter().enumerate() {
            let position = first_position + offset as u64;
            if event.is_synced() != (position <= head.frontier_position) {
                return Err(LedgerError::Corrupted(format!(
                    "sync state of event {} at position {position} contradicts frontier {}",
                    event.id(),
                    head.frontier_position
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl LocalLedger for SqliteLedger {
    fn scope(&self) -> &ChainScope {
        &self.scope
    }

    fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    #[instrument(
        skip(self, event),
        fields(
            device_id = %self.scope.device_id,
            tenant_id = %self.scope.tenant_id,
            event_id = %event.id()
        ),
        err
    )]
    async fn append(&self, event: Event) -> Result<(), LedgerError> {
        self.halt.check()?;

        if !event.belongs_to(&self.scope) {
            return Err(LedgerError::ScopeMismatch {
                expected: self.scope.clone(),
                found: event.chain_scope(),
            });
        }

        let payload = serde_json::to_string(event.payload())
            .map_err(|e| LedgerError::WriteError(format!("failed to encode payload: {e}")))?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| write_error("begin_transaction", e))?;

        let head = self.load_head(&mut *tx).await?;
        let expected = head
            .as_ref()
            .map(|h| h.hash.clone())
            .unwrap_or_else(ChainHash::genesis);
        if event.previous_hash() != &expected {
            return Err(self.halt.observe(
                &self.scope,
                LedgerError::ChainViolation {
                    expected,
                    found: event.previous_hash().clone(),
                },
            ));
        }

        let position = head.as_ref().map(|h| h.position + 1).unwrap_or(1) as i64;
        let timestamp_ms = event.timestamp().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO ledger_events (
                device_id, tenant_id, position, id, event_type, actor_id, payload,
                timestamp_ms, previous_hash, hash, sync_state, synced_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL)
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(position)
        .bind(event.id().to_string())
        .bind(event.event_type().as_str())
        .bind(event.actor_id().as_str())
        .bind(&payload)
        .bind(timestamp_ms)
        .bind(event.previous_hash().as_str())
        .bind(event.hash().as_str())
        .bind(UNSYNCED)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error("insert_event", e))?;

        sqlx::query(
            r#"
            INSERT INTO ledger_heads (
                device_id, tenant_id, head_hash, head_position, head_timestamp_ms,
                anchor_hash, frontier_position
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)
            ON CONFLICT (device_id, tenant_id) DO UPDATE SET
                head_hash = excluded.head_hash,
                head_position = excluded.head_position,
                head_timestamp_ms = excluded.head_timestamp_ms
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(event.hash().as_str())
        .bind(position)
        .bind(timestamp_ms)
        .bind(ChainHash::genesis().as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error("update_head", e))?;

        tx.commit()
            .await
            .map_err(|e| write_error("commit_transaction", e))?;

        tracing::debug!(position, "event appended");
        Ok(())
    }

    async fn tail(&self) -> Result<Option<ChainTail>, LedgerError> {
        Ok(self.load_head(&self.pool).await?.map(|h| ChainTail {
            hash: h.hash,
            position: h.position,
            timestamp: h.timestamp,
        }))
    }

    async fn unsynced_events(&self, limit: Option<usize>) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(select_events!(
            "AND sync_state = 'UNSYNCED' ORDER BY position ASC LIMIT ?3"
        ))
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_error("unsynced_events", e))?;

        rows_to_events(&rows)
    }

    #[instrument(
        skip(self),
        fields(device_id = %self.scope.device_id, tenant_id = %self.scope.tenant_id),
        err
    )]
    async fn mark_synced(&self, upto: EventId) -> Result<SyncFrontier, LedgerError> {
        self.halt.check()?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| write_error("begin_transaction", e))?;

        let row = sqlx::query(
            r#"
            SELECT position, sync_state
            FROM ledger_events
            WHERE device_id = ?1 AND tenant_id = ?2 AND id = ?3
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(upto.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| read_error("find_event", e))?
        .ok_or(LedgerError::NotFound(upto))?;

        let position: i64 = row.try_get("position").map_err(corrupt)?;
        let state: String = row.try_get("sync_state").map_err(corrupt)?;
        let frontier = self
            .load_head(&mut *tx)
            .await?
            .map(|h| h.frontier_position)
            .unwrap_or(0);

        let position = position as u64;
        if state == SYNCED || position <= frontier {
            return Err(self.halt.observe(
                &self.scope,
                LedgerError::OrderViolation(format!(
                    "event {upto} at position {position} is already synced (frontier {frontier})"
                )),
            ));
        }

        let updated = sqlx::query(
            r#"
            UPDATE ledger_events
            SET sync_state = ?3, synced_at_ms = ?4
            WHERE device_id = ?1 AND tenant_id = ?2
              AND position > ?5 AND position <= ?6
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(SYNCED)
        .bind(self.clock.now().timestamp_millis())
        .bind(frontier as i64)
        .bind(position as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error("mark_synced", e))?;

        sqlx::query(
            r#"
            UPDATE ledger_heads
            SET frontier_position = ?3
            WHERE device_id = ?1 AND tenant_id = ?2
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(position as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error("advance_frontier", e))?;

        tx.commit()
            .await
            .map_err(|e| write_error("commit_transaction", e))?;

        let newly_synced = updated.rows_affected();
        tracing::debug!(position, newly_synced, "sync frontier advanced");

        Ok(SyncFrontier {
            upto,
            position,
            newly_synced,
        })
    }

    async fn events(
        &self,
        from_position: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(select_events!(
            "AND position >= ?3 ORDER BY position ASC LIMIT ?4"
        ))
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(from_position as i64)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_error("events", e))?;

        rows_to_events(&rows)
    }

    async fn events_by_type(&self, event_type: &EventType) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(select_events!("AND event_type = ?3 ORDER BY position ASC"))
            .bind(self.scope.device_id.as_str())
            .bind(self.scope.tenant_id.as_str())
            .bind(event_type.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| read_error("events_by_type", e))?;

        rows_to_events(&rows)
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, LedgerError> {
        let rows = sqlx::query(select_events!(
            "AND timestamp_ms >= ?3 AND timestamp_ms < ?4 ORDER BY position ASC"
        ))
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(from.timestamp_millis())
        .bind(to.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| read_error("events_between", e))?;

        rows_to_events(&rows)
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| read_error("stats", e))?;

        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN sync_state = 'UNSYNCED' THEN 1 ELSE 0 END), 0) AS unsynced,
                MIN(timestamp_ms) AS oldest_ms,
                MAX(timestamp_ms) AS newest_ms,
                MIN(CASE WHEN sync_state = 'UNSYNCED' THEN timestamp_ms END) AS oldest_unsynced_ms
            FROM ledger_events
            WHERE device_id = ?1 AND tenant_id = ?2
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| read_error("stats", e))?;

        let head = self.load_head(&mut *tx).await?;

        let total: i64 = row.try_get("total").map_err(corrupt)?;
        let unsynced: i64 = row.try_get("unsynced").map_err(corrupt)?;
        let oldest_ms: Option<i64> = row.try_get("oldest_ms").map_err(corrupt)?;
        let newest_ms: Option<i64> = row.try_get("newest_ms").map_err(corrupt)?;
        let oldest_unsynced_ms: Option<i64> = row.try_get("oldest_unsynced_ms").map_err(corrupt)?;

        Ok(LedgerStats {
            total: total as u64,
            synced: (total - unsynced) as u64,
            unsynced: unsynced as u64,
            oldest_timestamp: oldest_ms.map(millis_to_datetime).transpose()?,
            newest_timestamp: newest_ms.map(millis_to_datetime).transpose()?,
            oldest_unsynced_timestamp: oldest_unsynced_ms.map(millis_to_datetime).transpose()?,
            frontier_position: head.as_ref().map(|h| h.frontier_position).unwrap_or(0),
            head_position: head.as_ref().map(|h| h.position).unwrap_or(0),
        })
    }

    #[instrument(
        skip(self),
        fields(device_id = %self.scope.device_id, tenant_id = %self.scope.tenant_id),
        err
    )]
    async fn verify(&self) -> Result<(), LedgerError> {
        self.check_integrity()
            .await
            .map_err(|e| self.halt.observe(&self.scope, e))
    }

    #[instrument(
        skip(self),
        fields(device_id = %self.scope.device_id, tenant_id = %self.scope.tenant_id),
        err
    )]
    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        self.halt.check()?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| write_error("begin_transaction", e))?;

        let Some(head) = self.load_head(&mut *tx).await? else {
            return Ok(0);
        };

        // Synced events form a prefix. The first of them acknowledged at or
        // after `older_than` bounds what may go; the tail always stays.
        let bounds = sqlx::query(
            r#"
            SELECT
                MIN(position) AS first,
                MIN(CASE WHEN synced_at_ms >= ?3 THEN position END) AS blocker
            FROM ledger_events
            WHERE device_id = ?1 AND tenant_id = ?2 AND sync_state = 'SYNCED'
            "#,
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(older_than.timestamp_millis())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| read_error("prune_synced", e))?;

        let first: Option<i64> = bounds.try_get("first").map_err(corrupt)?;
        let blocker: Option<i64> = bounds.try_get("blocker").map_err(corrupt)?;

        let Some(first) = first else {
            return Ok(0);
        };
        let upto = blocker
            .map(|b| b - 1)
            .unwrap_or(head.frontier_position as i64)
            .min(head.position as i64 - 1);
        if upto < first {
            return Ok(0);
        }

        let anchor: String = sqlx::query(
            "SELECT hash FROM ledger_events WHERE device_id = ?1 AND tenant_id = ?2 AND position = ?3",
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(upto)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| read_error("prune_synced", e))?
        .try_get("hash")
        .map_err(corrupt)?;

        let deleted = sqlx::query(
            "DELETE FROM ledger_events WHERE device_id = ?1 AND tenant_id = ?2 AND position <= ?3",
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(upto)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error("prune_synced", e))?
        .rows_affected();

        sqlx::query(
            "UPDATE ledger_heads SET anchor_hash = ?3 WHERE device_id = ?1 AND tenant_id = ?2",
        )
        .bind(self.scope.device_id.as_str())
        .bind(self.scope.tenant_id.as_str())
        .bind(&anchor)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error("prune_synced", e))?;

        tx.commit()
            .await
            .map_err(|e| write_error("commit_transaction", e))?;

        tracing::info!(pruned = deleted, upto, "pruned synced events");
        Ok(deleted)
    }

    async fn export(&self) -> Result<LedgerExport, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| read_error("export", e))?;

        let anchor = self
            .load_head(&mut *tx)
            .await?
            .map(|h| h.anchor)
            .unwrap_or_else(ChainHash::genesis);

        let rows = sqlx::query(select_events!("ORDER BY position ASC"))
            .bind(self.scope.device_id.as_str())
            .bind(self.scope.tenant_id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| read_error("export", e))?;

        Ok(LedgerExport {
            scope: self.scope.clone(),
            anchor,
            events: rows_to_events(&rows)?,
        })
    }
}

fn write_error(operation: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::WriteError(format!("{operation}: {err}"))
}

fn read_error(operation: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::ReadError(format!("{operation}: {err}"))
}

fn corrupt(err: impl core::fmt::Display) -> LedgerError {
    LedgerError::Corrupted(format!("undecodable ledger row: {err}"))
}

/// SQLite treats a negative LIMIT as unbounded.
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.map(|l| l.min(i64::MAX as usize) as i64).unwrap_or(-1)
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LedgerError::Corrupted(format!("timestamp {ms} out of range")))
}

fn rows_to_events(rows: &[SqliteRow]) -> Result<Vec<Event>, LedgerError> {
    rows.iter().map(row_to_event).collect()
}

fn row_to_event(row: &SqliteRow) -> Result<Event, LedgerError> {
    let id: String = row.try_get("id").map_err(corrupt)?;
    let event_type: String = row.try_get("event_type").map_err(corrupt)?;
    let actor_id: String = row.try_get("actor_id").map_err(corrupt)?;
    let payload: String = row.try_get("payload").map_err(corrupt)?;
    let device_id: String = row.try_get("device_id").map_err(corrupt)?;
    let tenant_id: String = row.try_get("tenant_id").map_err(corrupt)?;
    let timestamp_ms: i64 = row.try_get("timestamp_ms").map_err(corrupt)?;
    let previous_hash: String = row.try_get("previous_hash").map_err(corrupt)?;
    let hash: String = row.try_get("hash").map_err(corrupt)?;
    let sync_state: String = row.try_get("sync_state").map_err(corrupt)?;
    let synced_at_ms: Option<i64> = row.try_get("synced_at_ms").map_err(corrupt)?;

    let fields = EventFields {
        id: id.parse().map_err(corrupt)?,
        event_type: event_type.parse().map_err(corrupt)?,
        actor_id: actor_id.parse().map_err(corrupt)?,
        payload: serde_json::from_str(&payload).map_err(corrupt)?,
        device_id: device_id.parse().map_err(corrupt)?,
        tenant_id: tenant_id.parse().map_err(corrupt)?,
        timestamp: millis_to_datetime(timestamp_ms)?,
    };

    let sync_state = match sync_state.as_str() {
        SYNCED => SyncState::Synced,
        UNSYNCED => SyncState::Unsynced,
        other => return Err(corrupt(format!("unknown sync_state {other:?}"))),
    };

    Ok(Event::restore(
        fields,
        previous_hash.parse().map_err(corrupt)?,
        hash.parse().map_err(corrupt)?,
        sync_state,
        synced_at_ms.map(millis_to_datetime).transpose()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::{ActorId, DeviceId, TenantId};

    fn scope(device: &str) -> ChainScope {
        ChainScope::new(DeviceId::new(device).unwrap(), TenantId::new("brunch-co").unwrap())
    }

    fn event_after(scope: &ChainScope, previous: ChainHash, n: i64) -> Event {
        EventFields {
            id: EventId::new(),
            event_type: EventType::from_static("ORDER_CREATED"),
            actor_id: ActorId::new("user-1").unwrap(),
            payload: json!({"orderId": format!("A{n}"), "amount": 42.5, "lines": [1, 2]}),
            device_id: scope.device_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000 + n).unwrap(),
        }
        .seal(previous)
        .unwrap()
    }

    async fn open(dir: &tempfile::TempDir, scope: ChainScope) -> SqliteLedger {
        let config = LedgerConfig::default().with_path(dir.path().join("ledger.db"));
        SqliteLedger::open(&config, scope).await.unwrap()
    }

    #[tokio::test]
    async fn tail_and_sync_state_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope("pos-7");

        let ledger = open(&dir, scope.clone()).await;
        let first = event_after(&scope, ChainHash::genesis(), 1);
        let second = event_after(&scope, first.hash().clone(), 2);
        ledger.append(first.clone()).await.unwrap();
        ledger.append(second.clone()).await.unwrap();
        ledger.mark_synced(first.id()).await.unwrap();
        ledger.close().await;

        let reopened = open(&dir, scope.clone()).await;
        assert_eq!(reopened.last_hash().await.unwrap(), *second.hash());
        reopened.verify().await.unwrap();

        let unsynced = reopened.unsynced_events(None).await.unwrap();
        assert_eq!(unsynced, vec![second]);

        let all = reopened.events(1, None).await.unwrap();
        assert!(all[0].is_synced());
        assert_eq!(all[0].payload(), first.payload());
    }

    #[tokio::test]
    async fn chains_in_one_file_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(&dir, scope("pos-7")).await;
        let b = SqliteLedger::from_pool(a.pool().clone(), scope("pos-8"))
            .await
            .unwrap();

        a.append(event_after(a.scope(), ChainHash::genesis(), 1))
            .await
            .unwrap();
        b.append(event_after(b.scope(), ChainHash::genesis(), 1))
            .await
            .unwrap();

        assert_eq!(a.stats().await.unwrap().total, 1);
        assert_eq!(b.stats().await.unwrap().total, 1);
        assert_ne!(a.last_hash().await.unwrap(), b.last_hash().await.unwrap());

        let foreign = event_after(b.scope(), b.last_hash().await.unwrap(), 2);
        assert!(matches!(
            a.append(foreign).await,
            Err(LedgerError::ScopeMismatch { .. })
        ));
        assert!(!a.is_halted());
    }

    #[tokio::test]
    async fn tampered_row_is_detected_and_halts() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope("pos-7");
        let ledger = open(&dir, scope.clone()).await;

        let first = event_after(&scope, ChainHash::genesis(), 1);
        ledger.append(first.clone()).await.unwrap();
        ledger
            .append(event_after(&scope, first.hash().clone(), 2))
            .await
            .unwrap();

        sqlx::query("UPDATE ledger_events SET payload = ?1 WHERE position = 1")
            .bind(r#"{"orderId":"A1","amount":4200}"#)
            .execute(ledger.pool())
            .await
            .unwrap();

        assert!(matches!(ledger.verify().await, Err(LedgerError::Corrupted(_))));
        assert!(ledger.is_halted());
    }

    #[tokio::test]
    async fn prune_moves_the_anchor_and_keeps_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope("pos-7");
        let ledger = open(&dir, scope.clone()).await;

        let mut prev = ChainHash::genesis();
        let mut events = Vec::new();
        for n in 0..5 {
            let e = event_after(&scope, prev, n);
            prev = e.hash().clone();
            ledger.append(e.clone()).await.unwrap();
            events.push(e);
        }
        ledger.mark_synced(events[4].id()).await.unwrap();

        let pruned = ledger
            .prune_synced(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 4);

        ledger.verify().await.unwrap();
        let export = ledger.export().await.unwrap();
        assert_eq!(&export.anchor, events[4].previous_hash());
        assert_eq!(export.events.len(), 1);
        assert_eq!(ledger.stats().await.unwrap().head_position, 5);

        let next = event_after(&scope, ledger.last_hash().await.unwrap(), 6);
        ledger.append(next).await.unwrap();
        assert_eq!(ledger.tail().await.unwrap().unwrap().position, 6);
    }

    #[tokio::test]
    async fn missing_file_is_an_error_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("typo").join("ledger.db");
        let config = LedgerConfig::default()
            .with_path(&path)
            .with_create_if_missing(false);

        let err = SqliteLedger::open(&config, scope("pos-7")).await.unwrap_err();
        assert!(matches!(err, LedgerError::WriteError(_)));
        assert!(!path.exists());
        assert!(!dir.path().join("typo").exists());
    }

    #[tokio::test]
    async fn rows_past_the_head_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let scope = scope("pos-7");
        let ledger = open(&dir, scope.clone()).await;

        let first = event_after(&scope, ChainHash::genesis(), 1);
        ledger.append(first.clone()).await.unwrap();
        ledger
            .append(event_after(&scope, first.hash().clone(), 2))
            .await
            .unwrap();

        sqlx::query("DELETE FROM ledger_events WHERE position = 2")
            .execute(ledger.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE ledger_heads SET head_position = 0, head_hash = ?1")
            .bind(first.hash().as_str())
            .execute(ledger.pool())
            .await
            .unwrap();

        assert!(matches!(ledger.verify().await, Err(LedgerError::Corrupted(r)) if r.contains("exceed head position")));
        assert!(ledger.is_halted());
    }
}
