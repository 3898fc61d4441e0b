//! The cold agent enroller — the template every consumer follows.
//!
//! Reads the tenant's autopilot mode defensively (fail-safe `Manual`),
//! checks idempotency before every mutating write, and emits its follow-up
//! event with a deterministic idempotency key so a release-and-reclaim
//! never double-books a lead.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::consumer::{Consumer, ConsumerError};
use crate::consumers::{
    AuditEntry, CrmStore, NewApproval, COLD_AGENT_ENROLLER, COLD_OUTREACH_TRIGGER,
    COLD_SEQUENCE_ENROLLED, ENROLL_ACTION, LEAD_CREATED,
};
use crate::event::{Event, NewEvent};
use crate::store::EventStore;

/// Typed view of a `lead_created` payload. The lead itself is the event's
/// entity; the payload carries the attribution snapshot.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct LeadCreated {
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    #[serde(default)]
    pub consent: bool,
    #[serde(default)]
    pub score: i32,
}

/// Idempotency key for the follow-up enrollment event. Deterministic in
/// `(lead, sequence)` so re-processing coalesces at the store.
pub fn enrollment_idempotency_key(lead_id: Uuid, sequence_id: Uuid) -> String {
    format!("{COLD_SEQUENCE_ENROLLED}:{lead_id}:{sequence_id}")
}

/// Enrolls new leads into the first active cold-outreach sequence, or
/// queues the enrollment for human approval when the tenant is on manual.
pub struct ColdAgentEnroller {
    bus: Arc<dyn EventStore>,
    crm: Arc<dyn CrmStore>,
}

impl ColdAgentEnroller {
    pub fn new(bus: Arc<dyn EventStore>, crm: Arc<dyn CrmStore>) -> Self {
        Self { bus, crm }
    }

    async fn queue_for_approval(
        &self,
        event: &Event,
        lead: &LeadCreated,
    ) -> Result<(), ConsumerError> {
        if self.crm.approval_exists(ENROLL_ACTION, event.entity_id).await? {
            return Ok(());
        }

        self.crm
            .queue_approval(NewApproval {
                action_type: ENROLL_ACTION.to_string(),
                target_id: event.entity_id,
                tenant_id: event.tenant_id,
                snapshot: json!({
                    "utm_source": lead.utm_source,
                    "utm_medium": lead.utm_medium,
                    "utm_campaign": lead.utm_campaign,
                    "consent": lead.consent,
                    "score": lead.score,
                }),
            })
            .await?;

        Ok(())
    }

    async fn enroll(&self, event: &Event) -> Result<(), ConsumerError> {
        let lead_id = event.entity_id;

        let Some(sequence) = self
            .crm
            .first_active_sequence(event.tenant_id, COLD_OUTREACH_TRIGGER)
            .await?
        else {
            // No sequence configured is a valid business state. Leave an
            // audit trail and succeed.
            self.crm
                .record_audit(AuditEntry {
                    action: "enrollment_skipped".to_string(),
                    lead_id,
                    sequence_id: None,
                    tenant_id: event.tenant_id,
                    detail: json!({"reason": "no_active_sequence"}),
                })
                .await?;
            return Ok(());
        };

        if self.crm.enrollment_exists(lead_id, sequence.id).await? {
            return Ok(());
        }

        self.crm
            .insert_enrollment(lead_id, sequence.id, event.tenant_id)
            .await?;

        self.crm
            .record_audit(AuditEntry {
                action: COLD_SEQUENCE_ENROLLED.to_string(),
                lead_id,
                sequence_id: Some(sequence.id),
                tenant_id: event.tenant_id,
                detail: json!({"sequence_name": sequence.name}),
            })
            .await?;

        self.bus
            .emit_event(
                NewEvent::new(COLD_SEQUENCE_ENROLLED, "lead", lead_id)
                    .with_payload(json!({
                        "lead_id": lead_id,
                        "sequence_id": sequence.id,
                    }))
                    .with_tenant(event.tenant_id)
                    .with_emitted_by(COLD_AGENT_ENROLLER)
                    .with_idempotency_key(enrollment_idempotency_key(lead_id, sequence.id)),
            )
            .await
            .map_err(ConsumerError::Store)?;

        Ok(())
    }
}

#[async_trait]
impl Consumer for ColdAgentEnroller {
    fn name(&self) -> &'static str {
        COLD_AGENT_ENROLLER
    }

    fn event_type(&self) -> &'static str {
        LEAD_CREATED
    }

    async fn process(&self, event: &Event) -> Result<(), ConsumerError> {
        let lead: LeadCreated = event
            .payload_as()
            .map_err(|e| ConsumerError::Payload(e.to_string()))?;

        let mode = self.bus.autopilot_mode(event.tenant_id).await;

        if mode.is_automatic() {
            self.enroll(event).await
        } else {
            self.queue_for_approval(event, &lead).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let lead = Uuid::new_v4();
        let seq = Uuid::new_v4();

        let key = enrollment_idempotency_key(lead, seq);
        assert_eq!(key, format!("cold_sequence_enrolled:{lead}:{seq}"));
        assert_eq!(key, enrollment_idempotency_key(lead, seq));
    }

    #[test]
    fn lead_payload_tolerates_missing_fields() {
        let lead: LeadCreated = serde_json::from_value(json!({})).unwrap();
        assert!(lead.utm_source.is_none());
        assert!(!lead.consent);
        assert_eq!(lead.score, 0);
    }
}
