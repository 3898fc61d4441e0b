//! CRM-side repositories used by the cold agent enroller.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE sequences (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     tenant_id UUID,
//!     name TEXT NOT NULL,
//!     trigger_type TEXT NOT NULL,
//!     active BOOLEAN NOT NULL DEFAULT TRUE,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE TABLE sequence_enrollments (
//!     lead_id UUID NOT NULL,
//!     sequence_id UUID NOT NULL,
//!     tenant_id UUID,
//!     enrolled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (lead_id, sequence_id)
//! );
//!
//! CREATE TABLE approval_queue (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     action_type TEXT NOT NULL,
//!     target_id UUID NOT NULL,
//!     tenant_id UUID,
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     snapshot JSONB NOT NULL DEFAULT '{}',
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     UNIQUE (action_type, target_id)
//! );
//!
//! CREATE TABLE audit_trail (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     action TEXT NOT NULL,
//!     lead_id UUID NOT NULL,
//!     sequence_id UUID,
//!     tenant_id UUID,
//!     detail JSONB NOT NULL DEFAULT '{}',
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! Inserts that can race with a concurrent run use `ON CONFLICT DO
//! NOTHING`: the other run already wrote the same row, which is success.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use conveyor_core::consumers::{AuditEntry, CrmStore, NewApproval, SequenceRef};

/// PostgreSQL CRM repositories.
#[derive(Clone)]
pub struct PgCrmStore {
    pool: PgPool,
}

impl PgCrmStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CrmStore for PgCrmStore {
    async fn approval_exists(&self, action_type: &str, target_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM approval_queue
                WHERE action_type = $1
                  AND target_id = $2
                  AND status IN ('pending', 'approved')
            ) AS present
            "#,
        )
        .bind(action_type)
        .bind(target_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("present")?)
    }

    async fn queue_approval(&self, entry: NewApproval) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO approval_queue (action_type, target_id, tenant_id, snapshot)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (action_type, target_id) DO NOTHING
            "#,
        )
        .bind(&entry.action_type)
        .bind(entry.target_id)
        .bind(entry.tenant_id)
        .bind(&entry.snapshot)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Oldest active sequence wins — the deterministic tie-break.
    async fn first_active_sequence(
        &self,
        tenant_id: Option<Uuid>,
        trigger: &str,
    ) -> Result<Option<SequenceRef>> {
        let row = sqlx::query(
            r#"
            SELECT id, name
            FROM sequences
            WHERE trigger_type = $1
              AND active
              AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(trigger)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(SequenceRef {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
            }),
            None => None,
        })
    }

    async fn enrollment_exists(&self, lead_id: Uuid, sequence_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM sequence_enrollments
                WHERE lead_id = $1 AND sequence_id = $2
            ) AS present
            "#,
        )
        .bind(lead_id)
        .bind(sequence_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("present")?)
    }

    async fn insert_enrollment(
        &self,
        lead_id: Uuid,
        sequence_id: Uuid,
        tenant_id: Option<Uuid>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sequence_enrollments (lead_id, sequence_id, tenant_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (lead_id, sequence_id) DO NOTHING
            "#,
        )
        .bind(lead_id)
        .bind(sequence_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_trail (action, lead_id, sequence_id, tenant_id, detail)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.action)
        .bind(entry.lead_id)
        .bind(entry.sequence_id)
        .bind(entry.tenant_id)
        .bind(&entry.detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
