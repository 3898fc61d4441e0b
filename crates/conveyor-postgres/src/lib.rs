//! PostgreSQL implementation of the conveyor event store.
//!
//! # Features
//!
//! - Atomic claims with `FOR UPDATE SKIP LOCKED`
//! - Exponential backoff retry scheduling on failure
//! - Dead-letter disposition past an attempts threshold
//! - Bulk release back to `pending` without an attempts penalty
//! - Stale-claim reclaim for events orphaned in `processing`
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TYPE event_status AS ENUM
//!     ('pending', 'processing', 'processed', 'failed', 'dead_lettered');
//!
//! CREATE TABLE events (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     event_type TEXT NOT NULL,
//!     entity_type TEXT NOT NULL,
//!     entity_id UUID NOT NULL,
//!     payload JSONB NOT NULL DEFAULT '{}',
//!
//!     -- Lifecycle
//!     status event_status NOT NULL DEFAULT 'pending',
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!
//!     -- Scheduling
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     -- Claim tracking
//!     claimed_by TEXT,
//!     claimed_at TIMESTAMPTZ,
//!
//!     -- Provenance
//!     tenant_id UUID,
//!     idempotency_key TEXT UNIQUE,
//!     emitted_by TEXT,
//!
//!     -- Error tracking
//!     last_error TEXT,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_events_claimable ON events (event_type, created_at)
//!     WHERE status = 'pending';
//! CREATE INDEX idx_events_stale ON events (claimed_at)
//!     WHERE status = 'processing';
//! CREATE INDEX idx_events_retry ON events (run_at)
//!     WHERE status = 'failed';
//!
//! CREATE TABLE tenant_settings (
//!     tenant_id UUID PRIMARY KEY,
//!     autopilot_mode TEXT NOT NULL DEFAULT 'manual'
//! );
//! ```
//!
//! # Retry model
//!
//! `mark_failed` below the threshold leaves the row in `failed` with a
//! `run_at` backoff of `2^attempts` seconds (capped at one hour);
//! [`PgEventStore::retry_due`] sweeps due rows back to `pending` where the
//! next claim picks them up. At or past the threshold the row goes to
//! `dead_lettered` and stays there for manual intervention.

mod crm;

pub use crm::PgCrmStore;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use conveyor_core::{
    AutopilotMode, EmitOutcome, Event, EventStatus, EventStore, FailureDisposition, NewEvent,
};

/// PostgreSQL event store.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    max_attempts: i32,
}

impl PgEventStore {
    /// Dead-letter threshold default: the fifth failed attempt is terminal.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            max_attempts: 5,
        }
    }

    pub fn with_max_attempts(pool: PgPool, max_attempts: i32) -> Self {
        Self { pool, max_attempts }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn event_from_row(row: &PgRow) -> Result<Event> {
    let status_raw: String = row.try_get("status")?;
    let status = EventStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown event status {status_raw:?}"))?;

    Ok(Event {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        payload: row.try_get("payload")?,
        status,
        attempts: row.try_get("attempts")?,
        tenant_id: row.try_get("tenant_id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl EventStore for PgEventStore {
    /// Claim pending events for processing.
    ///
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent claimers from ever
    /// returning the same row. Claim order is creation order.
    async fn claim_events(
        &self,
        consumer: &str,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM events
                WHERE status = 'pending'
                  AND event_type = $1
                  AND run_at <= NOW()
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE events
            SET status = 'processing',
                attempts = attempts + 1,
                claimed_by = $3,
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, event_type, entity_type, entity_id, payload,
                      status::TEXT AS status, attempts, tenant_id,
                      idempotency_key, created_at
            "#,
        )
        .bind(event_type)
        .bind(limit as i64)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await?;

        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING order is unspecified; restore claim order.
        events.sort_by_key(|e| e.created_at);
        Ok(events)
    }

    /// Mark an event as successfully processed. Idempotent.
    async fn mark_processed(&self, event_id: Uuid, _consumer: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE events
            SET status = 'processed',
                updated_at = NOW()
            WHERE id = $1
              AND status IN ('processing', 'processed')
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark an event as failed and decide its disposition.
    ///
    /// Below the threshold the row stays `failed` with a backoff `run_at`;
    /// `retry_due` later returns it to `pending`. At or past the threshold
    /// it dead-letters.
    ///
    /// Only a `processing` row can fail. A released or re-claimed event
    /// belongs to another run by now, so a late call from a stale claimer
    /// is a no-op rather than a transition.
    async fn mark_failed(
        &self,
        event_id: Uuid,
        _consumer: &str,
        error: &str,
    ) -> Result<FailureDisposition> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT attempts, status::TEXT AS status FROM events WHERE id = $1 FOR UPDATE",
        )
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(FailureDisposition {
                dead_lettered: false,
            });
        };
        let status: String = row.try_get("status")?;
        if status != "processing" {
            return Ok(FailureDisposition {
                dead_lettered: false,
            });
        }
        let attempts: i32 = row.try_get("attempts")?;

        let dead_lettered = attempts >= self.max_attempts;
        if dead_lettered {
            sqlx::query(
                r#"
                UPDATE events
                SET status = 'dead_lettered',
                    last_error = $1,
                    updated_at = NOW()
                WHERE id = $2
                  AND status = 'processing'
                "#,
            )
            .bind(error)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        } else {
            let delay_secs = 2i64.pow(attempts.clamp(0, 12) as u32).min(3600);
            let retry_at = Utc::now() + Duration::seconds(delay_secs);

            sqlx::query(
                r#"
                UPDATE events
                SET status = 'failed',
                    run_at = $1,
                    last_error = $2,
                    claimed_by = NULL,
                    claimed_at = NULL,
                    updated_at = NOW()
                WHERE id = $3
                  AND status = 'processing'
                "#,
            )
            .bind(retry_at)
            .bind(error)
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(FailureDisposition { dead_lettered })
    }

    /// Insert a new pending event. An idempotency-key collision coalesces
    /// with the existing row and is reported as success.
    async fn emit_event(&self, event: NewEvent) -> Result<EmitOutcome> {
        let row = sqlx::query(
            r#"
            INSERT INTO events
                (event_type, entity_type, entity_id, payload,
                 tenant_id, idempotency_key, emitted_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.event_type)
        .bind(&event.entity_type)
        .bind(event.entity_id)
        .bind(&event.payload)
        .bind(event.tenant_id)
        .bind(&event.idempotency_key)
        .bind(&event.emitted_by)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => EmitOutcome::Inserted(row.try_get("id")?),
            None => EmitOutcome::Deduplicated,
        })
    }

    /// Reset claimed-but-unhandled events back to `pending`.
    ///
    /// Attempts are deliberately untouched: a release is not a failed
    /// attempt. Only rows still in `processing` move.
    async fn release_events(&self, event_ids: &[Uuid]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = ANY($1)
              AND status = 'processing'
            "#,
        )
        .bind(event_ids)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Fail-safe read of the tenant's autopilot mode.
    ///
    /// No tenant, no row, a read error, or an unknown value all resolve to
    /// `Manual`. Never guess toward automatic action.
    async fn autopilot_mode(&self, tenant_id: Option<Uuid>) -> AutopilotMode {
        let Some(tenant_id) = tenant_id else {
            return AutopilotMode::Manual;
        };

        let row = sqlx::query("SELECT autopilot_mode FROM tenant_settings WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(row) => {
                let raw = row.and_then(|r| r.try_get::<String, _>("autopilot_mode").ok());
                AutopilotMode::parse_or_manual(raw.as_deref())
            }
            Err(e) => {
                warn!(error = %e, %tenant_id, "autopilot mode read failed, defaulting to manual");
                AutopilotMode::Manual
            }
        }
    }
}

/// Maintenance operations, run periodically by a scheduler.
impl PgEventStore {
    /// Return events stuck in `processing` past the staleness window to
    /// `pending`. This is the recovery path for a crashed run or a failed
    /// release; like a release, it does not touch `attempts`.
    pub async fn reclaim_stale(&self, stale_after: Duration) -> Result<u64> {
        let cutoff = Utc::now() - stale_after;

        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE status = 'processing'
              AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Move `failed` events whose backoff has elapsed back to `pending`.
    pub async fn retry_due(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE status = 'failed'
              AND run_at <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete processed events older than the cutoff.
    pub async fn cleanup_processed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM events
            WHERE status = 'processed'
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Queue health counters, one per status.
    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'processed') as processed,
                COUNT(*) FILTER (WHERE status = 'failed') as failed,
                COUNT(*) FILTER (WHERE status = 'dead_lettered') as dead_lettered
            FROM events
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            processed: row.try_get("processed")?,
            failed: row.try_get("failed")?,
            dead_lettered: row.try_get("dead_lettered")?,
        })
    }
}

/// Event queue statistics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub processed: i64,
    pub failed: i64,
    pub dead_lettered: i64,
}
