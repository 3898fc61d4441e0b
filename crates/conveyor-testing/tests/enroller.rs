//! Cold agent enroller behavior: fail-safe modes, idempotent writes, and
//! the end-to-end enrollment scenario.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use conveyor_core::consumers::{
    ColdAgentEnroller, enrollment_idempotency_key, COLD_AGENT_ENROLLER, COLD_OUTREACH_TRIGGER,
    COLD_SEQUENCE_ENROLLED, ENROLL_ACTION, LEAD_CREATED,
};
use conveyor_core::{
    AutopilotMode, ConsumerRegistry, EventStore, NewEvent, Processor, RunConfig, StoppedReason,
};
use conveyor_testing::{MemoryCrmStore, MemoryEventStore, RecordingLogger};

struct Fixture {
    store: Arc<MemoryEventStore>,
    crm: Arc<MemoryCrmStore>,
    processor: Processor,
}

fn fixture() -> Fixture {
    let store = Arc::new(MemoryEventStore::new());
    let crm = Arc::new(MemoryCrmStore::new());

    let mut registry = ConsumerRegistry::new();
    registry.register(Arc::new(ColdAgentEnroller::new(store.clone(), crm.clone())));

    let processor = Processor::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(RecordingLogger::new()),
    );

    Fixture {
        store,
        crm,
        processor,
    }
}

async fn seed_lead_created(store: &MemoryEventStore, tenant: Uuid) -> Uuid {
    let lead_id = Uuid::new_v4();
    store
        .emit_event(
            NewEvent::new(LEAD_CREATED, "lead", lead_id)
                .with_tenant(Some(tenant))
                .with_payload(json!({
                    "utm_source": "newsletter",
                    "consent": true,
                    "score": 72,
                })),
        )
        .await
        .unwrap();
    lead_id
}

fn run_config() -> RunConfig {
    RunConfig::new(
        Uuid::new_v4(),
        COLD_AGENT_ENROLLER,
        LEAD_CREATED,
        10,
        10_000,
    )
}

#[tokio::test]
async fn manual_mode_queues_for_approval() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    f.store.set_mode(tenant, AutopilotMode::Manual);
    f.crm
        .add_sequence(Some(tenant), "Cold intro", COLD_OUTREACH_TRIGGER, true);
    let lead_id = seed_lead_created(&f.store, tenant).await;

    let summary = f.processor.run(run_config()).await;

    assert_eq!(summary.processed, 1);
    assert!(f.crm.enrollments().is_empty());

    let approvals = f.crm.approvals();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].action_type, ENROLL_ACTION);
    assert_eq!(approvals[0].target_id, lead_id);
    assert_eq!(approvals[0].snapshot["utm_source"], "newsletter");
    assert_eq!(approvals[0].snapshot["score"], 72);
}

#[tokio::test]
async fn unconfigured_tenant_defaults_to_manual() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    // No mode configured at all.
    f.crm
        .add_sequence(Some(tenant), "Cold intro", COLD_OUTREACH_TRIGGER, true);
    seed_lead_created(&f.store, tenant).await;

    f.processor.run(run_config()).await;

    assert!(f.crm.enrollments().is_empty());
    assert_eq!(f.crm.approvals().len(), 1);
}

#[tokio::test]
async fn broken_mode_read_defaults_to_manual() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    f.store.set_mode(tenant, AutopilotMode::Full);
    f.store.fail_mode_reads(true);
    f.crm
        .add_sequence(Some(tenant), "Cold intro", COLD_OUTREACH_TRIGGER, true);
    seed_lead_created(&f.store, tenant).await;

    let summary = f.processor.run(run_config()).await;

    // FULL is configured, but the read failed: the conservative path wins.
    assert_eq!(summary.processed, 1);
    assert!(f.crm.enrollments().is_empty());
    assert_eq!(f.crm.approvals().len(), 1);
}

#[tokio::test]
async fn manual_mode_approval_is_idempotent() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    seed_lead_created(&f.store, tenant).await;

    f.processor.run(run_config()).await;
    let first = f.store.events()[0].id;
    f.store.reset_to_pending(first);
    f.processor.run(run_config()).await;

    assert_eq!(f.crm.approvals().len(), 1);
}

#[tokio::test]
async fn missing_sequence_is_audited_not_failed() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    f.store.set_mode(tenant, AutopilotMode::Full);
    seed_lead_created(&f.store, tenant).await;

    let summary = f.processor.run(run_config()).await;

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert!(f.crm.enrollments().is_empty());

    let audits = f.crm.audits();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].action, "enrollment_skipped");
}

#[tokio::test]
async fn full_mode_enrolls_and_emits_follow_up() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    f.store.set_mode(tenant, AutopilotMode::Full);
    let sequence_id = f
        .crm
        .add_sequence(Some(tenant), "Cold intro", COLD_OUTREACH_TRIGGER, true);
    let lead_id = seed_lead_created(&f.store, tenant).await;

    let summary = f.processor.run(run_config()).await;

    assert!(summary.success);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.released, 0);
    assert_eq!(summary.stopped_reason, StoppedReason::Completed);

    let enrollments = f.crm.enrollments();
    assert_eq!(enrollments.len(), 1);
    assert_eq!(enrollments[0].lead_id, lead_id);
    assert_eq!(enrollments[0].sequence_id, sequence_id);

    let follow_ups: Vec<_> = f
        .store
        .events()
        .into_iter()
        .filter(|e| e.event_type == COLD_SEQUENCE_ENROLLED)
        .collect();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(
        follow_ups[0].idempotency_key.as_deref(),
        Some(enrollment_idempotency_key(lead_id, sequence_id).as_str())
    );
    assert_eq!(follow_ups[0].payload["sequence_id"], json!(sequence_id));
}

#[tokio::test]
async fn reprocessing_never_double_books() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    f.store.set_mode(tenant, AutopilotMode::Full);
    f.crm
        .add_sequence(Some(tenant), "Cold intro", COLD_OUTREACH_TRIGGER, true);
    seed_lead_created(&f.store, tenant).await;

    f.processor.run(run_config()).await;

    // Operator resets the event, as after a release-and-reclaim.
    let lead_event = f.store.events()[0].id;
    f.store.reset_to_pending(lead_event);
    let summary = f.processor.run(run_config()).await;

    assert_eq!(summary.processed, 1);
    assert_eq!(f.crm.enrollments().len(), 1);
    let follow_ups = f
        .store
        .events()
        .into_iter()
        .filter(|e| e.event_type == COLD_SEQUENCE_ENROLLED)
        .count();
    assert_eq!(follow_ups, 1);
}

#[tokio::test]
async fn oldest_active_sequence_wins() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    f.store.set_mode(tenant, AutopilotMode::Assisted);
    f.crm
        .add_sequence(Some(tenant), "Dormant", COLD_OUTREACH_TRIGGER, false);
    let oldest_active = f
        .crm
        .add_sequence(Some(tenant), "First", COLD_OUTREACH_TRIGGER, true);
    f.crm
        .add_sequence(Some(tenant), "Second", COLD_OUTREACH_TRIGGER, true);
    seed_lead_created(&f.store, tenant).await;

    f.processor.run(run_config()).await;

    let enrollments = f.crm.enrollments();
    assert_eq!(enrollments.len(), 1);
    assert_eq!(enrollments[0].sequence_id, oldest_active);
}

#[tokio::test]
async fn malformed_payload_fails_the_event_only() {
    let f = fixture();
    let tenant = Uuid::new_v4();
    f.store
        .emit_event(
            NewEvent::new(LEAD_CREATED, "lead", Uuid::new_v4())
                .with_tenant(Some(tenant))
                .with_payload(json!("not an object")),
        )
        .await
        .unwrap();
    seed_lead_created(&f.store, tenant).await;

    let summary = f.processor.run(run_config()).await;

    assert!(summary.success);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.processed, 1);
    assert!(summary.errors[0].message.contains("payload rejected"));
}
