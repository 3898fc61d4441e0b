//! Store-contract properties every `EventStore` implementation must hold.
//! Exercised against the in-memory store.

use serde_json::json;
use uuid::Uuid;

use conveyor_core::{AutopilotMode, EmitOutcome, EventStatus, EventStore, NewEvent};
use conveyor_testing::MemoryEventStore;

#[tokio::test]
async fn duplicate_idempotency_key_coalesces() {
    let store = MemoryEventStore::new();
    let entity = Uuid::new_v4();

    let first = store
        .emit_event(
            NewEvent::new("cold_sequence_enrolled", "lead", entity)
                .with_idempotency_key("cold_sequence_enrolled:a:b"),
        )
        .await
        .unwrap();
    let second = store
        .emit_event(
            NewEvent::new("cold_sequence_enrolled", "lead", entity)
                .with_payload(json!({"different": true}))
                .with_idempotency_key("cold_sequence_enrolled:a:b"),
        )
        .await
        .unwrap();

    assert!(matches!(first, EmitOutcome::Inserted(_)));
    assert_eq!(second, EmitOutcome::Deduplicated);
    assert_eq!(store.events().len(), 1);
}

#[tokio::test]
async fn events_without_keys_never_coalesce() {
    let store = MemoryEventStore::new();
    let entity = Uuid::new_v4();

    store
        .emit_event(NewEvent::new("lead_created", "lead", entity))
        .await
        .unwrap();
    store
        .emit_event(NewEvent::new("lead_created", "lead", entity))
        .await
        .unwrap();

    assert_eq!(store.events().len(), 2);
}

#[tokio::test]
async fn claim_increments_attempts_release_does_not() {
    let store = MemoryEventStore::new();
    let ids = store.seed_pending("lead_created", None, 1);

    let claimed = store.claim_events("worker", "lead_created", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].attempts, 1);
    assert_eq!(claimed[0].status, EventStatus::Processing);

    let released = store.release_events(&ids).await.unwrap();
    assert_eq!(released, 1);

    let event = store.event(ids[0]).unwrap();
    assert_eq!(event.status, EventStatus::Pending);
    assert_eq!(event.attempts, 1);

    // A later claim picks it up again and counts a second attempt.
    let reclaimed = store.claim_events("worker", "lead_created", 10).await.unwrap();
    assert_eq!(reclaimed[0].attempts, 2);
}

#[tokio::test]
async fn release_only_touches_processing_rows() {
    let store = MemoryEventStore::new();
    let ids = store.seed_pending("lead_created", None, 2);

    store.claim_events("worker", "lead_created", 10).await.unwrap();
    store.mark_processed(ids[0], "worker").await.unwrap();

    let released = store.release_events(&ids).await.unwrap();
    assert_eq!(released, 1);
    assert_eq!(store.event(ids[0]).unwrap().status, EventStatus::Processed);
    assert_eq!(store.event(ids[1]).unwrap().status, EventStatus::Pending);
}

#[tokio::test]
async fn mark_processed_is_idempotent() {
    let store = MemoryEventStore::new();
    let ids = store.seed_pending("lead_created", None, 1);
    store.claim_events("worker", "lead_created", 10).await.unwrap();

    store.mark_processed(ids[0], "worker").await.unwrap();
    store.mark_processed(ids[0], "worker").await.unwrap();

    assert_eq!(store.event(ids[0]).unwrap().status, EventStatus::Processed);
}

#[tokio::test]
async fn failures_dead_letter_past_the_threshold() {
    let store = MemoryEventStore::with_max_attempts(2);
    let ids = store.seed_pending("lead_created", None, 1);

    store.claim_events("worker", "lead_created", 10).await.unwrap();
    let first = store.mark_failed(ids[0], "worker", "boom").await.unwrap();
    assert!(!first.dead_lettered);
    assert_eq!(store.event(ids[0]).unwrap().status, EventStatus::Failed);

    store.reset_to_pending(ids[0]);
    store.claim_events("worker", "lead_created", 10).await.unwrap();
    let second = store.mark_failed(ids[0], "worker", "boom").await.unwrap();
    assert!(second.dead_lettered);
    assert_eq!(
        store.event(ids[0]).unwrap().status,
        EventStatus::DeadLettered
    );
}

#[tokio::test]
async fn late_failure_cannot_clobber_a_released_event() {
    let store = MemoryEventStore::new();
    let ids = store.seed_pending("lead_created", None, 1);

    store.claim_events("worker", "lead_created", 10).await.unwrap();
    store.release_events(&ids).await.unwrap();
    assert_eq!(store.event(ids[0]).unwrap().status, EventStatus::Pending);

    // A stale run reports its failure after the release. The event is no
    // longer processing, so nothing moves.
    let disposition = store.mark_failed(ids[0], "worker", "late").await.unwrap();
    assert!(!disposition.dead_lettered);
    assert_eq!(store.event(ids[0]).unwrap().status, EventStatus::Pending);
}

#[tokio::test]
async fn late_failure_cannot_clobber_a_processed_event() {
    let store = MemoryEventStore::with_max_attempts(1);
    let ids = store.seed_pending("lead_created", None, 1);

    store.claim_events("worker", "lead_created", 10).await.unwrap();
    store.mark_processed(ids[0], "worker").await.unwrap();

    // Even at the dead-letter threshold, a late failure cannot strand a
    // row another run already processed.
    let disposition = store.mark_failed(ids[0], "worker", "late").await.unwrap();
    assert!(!disposition.dead_lettered);
    assert_eq!(store.event(ids[0]).unwrap().status, EventStatus::Processed);
}

#[tokio::test]
async fn claims_filter_by_event_type() {
    let store = MemoryEventStore::new();
    store.seed_pending("lead_created", None, 2);
    store.seed_pending("invoice_paid", None, 3);

    let claimed = store.claim_events("worker", "invoice_paid", 10).await.unwrap();
    assert_eq!(claimed.len(), 3);
    assert!(claimed.iter().all(|e| e.event_type == "invoice_paid"));
}

#[tokio::test]
async fn autopilot_mode_is_fail_safe() {
    let store = MemoryEventStore::new();
    let tenant = Uuid::new_v4();

    // No tenant, unknown tenant, configured tenant, broken read.
    assert_eq!(store.autopilot_mode(None).await, AutopilotMode::Manual);
    assert_eq!(
        store.autopilot_mode(Some(tenant)).await,
        AutopilotMode::Manual
    );

    store.set_mode(tenant, AutopilotMode::Full);
    assert_eq!(store.autopilot_mode(Some(tenant)).await, AutopilotMode::Full);

    store.fail_mode_reads(true);
    assert_eq!(
        store.autopilot_mode(Some(tenant)).await,
        AutopilotMode::Manual
    );
}
