//! Built-in consumers and the CRM repository seam they write through.

mod enroller;

pub use enroller::{enrollment_idempotency_key, ColdAgentEnroller};

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Consumer/event-type names used by the built-in consumers.
pub const COLD_AGENT_ENROLLER: &str = "cold_agent_enroller";
pub const LEAD_CREATED: &str = "lead_created";
pub const COLD_SEQUENCE_ENROLLED: &str = "cold_sequence_enrolled";
pub const COLD_OUTREACH_TRIGGER: &str = "cold_outreach";
pub const ENROLL_ACTION: &str = "cold_sequence_enroll";

/// A sequence a lead can be enrolled into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRef {
    pub id: Uuid,
    pub name: String,
}

/// A human-approval queue entry. Unique on `(action_type, target_id)`;
/// the store treats a uniqueness collision as success, since another run
/// already queued the same action.
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub action_type: String,
    pub target_id: Uuid,
    pub tenant_id: Option<Uuid>,
    /// Denormalized lead snapshot shown to the approver.
    pub snapshot: serde_json::Value,
}

/// An audit-trail entry written by consumers.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub action: String,
    pub lead_id: Uuid,
    pub sequence_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub detail: serde_json::Value,
}

/// CRM-side repositories the enroller writes through. Implementations back
/// this with the external CRM schema; tests use the in-memory store.
#[async_trait]
pub trait CrmStore: Send + Sync {
    /// Is there already a pending/approved queue entry for this action?
    async fn approval_exists(&self, action_type: &str, target_id: Uuid) -> Result<bool>;

    /// Insert an approval queue entry. A uniqueness collision is success.
    async fn queue_approval(&self, entry: NewApproval) -> Result<()>;

    /// The oldest active sequence configured for `trigger`, tenant-scoped.
    /// `None` is a valid business state, not an error.
    async fn first_active_sequence(
        &self,
        tenant_id: Option<Uuid>,
        trigger: &str,
    ) -> Result<Option<SequenceRef>>;

    async fn enrollment_exists(&self, lead_id: Uuid, sequence_id: Uuid) -> Result<bool>;

    /// Insert an enrollment. A uniqueness collision is success.
    async fn insert_enrollment(
        &self,
        lead_id: Uuid,
        sequence_id: Uuid,
        tenant_id: Option<Uuid>,
    ) -> Result<()>;

    async fn record_audit(&self, entry: AuditEntry) -> Result<()>;
}
