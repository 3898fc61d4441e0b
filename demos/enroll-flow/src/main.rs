//! # Enroll Flow Demo
//!
//! Runs the whole pipeline in memory: emit a `lead_created` event, process
//! it under a budgeted run, and watch the enroller either auto-enroll the
//! lead (autopilot `full`) or queue it for human approval (`manual`).

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use uuid::Uuid;

use conveyor_core::consumers::{ColdAgentEnroller, COLD_AGENT_ENROLLER, LEAD_CREATED};
use conveyor_core::{
    AutopilotMode, ConsumerRegistry, EventStore, NewEvent, Processor, RunConfig, TracingRunLogger,
};
use conveyor_testing::{MemoryCrmStore, MemoryEventStore};

#[tokio::main]
async fn main() -> Result<()> {
    let store = Arc::new(MemoryEventStore::new());
    let crm = Arc::new(MemoryCrmStore::new());

    let tenant = Uuid::new_v4();
    store.set_mode(tenant, AutopilotMode::Full);
    crm.add_sequence(Some(tenant), "Cold intro drip", "cold_outreach", true);

    let mut registry = ConsumerRegistry::new();
    registry.register(Arc::new(ColdAgentEnroller::new(store.clone(), crm.clone())));

    let processor = Processor::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(TracingRunLogger),
    );

    // A new lead arrives.
    let lead_id = Uuid::new_v4();
    store
        .emit_event(
            NewEvent::new(LEAD_CREATED, "lead", lead_id)
                .with_tenant(Some(tenant))
                .with_payload(json!({
                    "utm_source": "webinar",
                    "consent": true,
                    "score": 64,
                })),
        )
        .await?;

    let summary = processor
        .run(RunConfig::new(
            Uuid::new_v4(),
            COLD_AGENT_ENROLLER,
            LEAD_CREATED,
            10,
            10_000,
        ))
        .await;

    println!(
        "run {}: processed={} failed={} released={} ({})",
        summary.run_id,
        summary.processed,
        summary.failed,
        summary.released,
        summary.stopped_reason.as_str()
    );

    for enrollment in crm.enrollments() {
        println!(
            "lead {} enrolled in sequence {}",
            enrollment.lead_id, enrollment.sequence_id
        );
    }
    for event in store.events() {
        println!(
            "event {} [{}] status={}",
            event.id,
            event.event_type,
            event.status.as_str()
        );
    }

    Ok(())
}
