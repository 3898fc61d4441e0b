//! In-memory collaborators for testing the conveyor core without a live
//! database: an event store, a CRM store, a recording logger, and a
//! scriptable consumer.
//!
//! The stores keep the same semantics as the PostgreSQL implementations
//! (exclusive claims, attempts on claim, release without an attempts
//! penalty, idempotency-key dedupe, fail-safe autopilot reads) behind a
//! single mutex, so property tests can drive them concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use conveyor_core::consumers::{AuditEntry, CrmStore, NewApproval, SequenceRef};
use conveyor_core::{
    AutopilotMode, Consumer, ConsumerError, EmitOutcome, Event, EventRecord, EventStatus,
    EventStore, FailureDisposition, NewEvent, RunLogger, RunSummary,
};

// ---------------------------------------------------------------------------
// MemoryEventStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct EventStoreInner {
    events: Vec<Event>,
    modes: HashMap<Uuid, AutopilotMode>,
}

/// In-memory event store with the production claim/release semantics.
pub struct MemoryEventStore {
    inner: Mutex<EventStoreInner>,
    max_attempts: i32,
    fail_claims: AtomicBool,
    fail_releases: AtomicBool,
    fail_mode_reads: AtomicBool,
    claim_batch_override: AtomicUsize,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(EventStoreInner::default()),
            max_attempts: 5,
            fail_claims: AtomicBool::new(false),
            fail_releases: AtomicBool::new(false),
            fail_mode_reads: AtomicBool::new(false),
            claim_batch_override: AtomicUsize::new(0),
        }
    }

    pub fn with_max_attempts(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            ..Self::new()
        }
    }

    /// Make the next claims return an infrastructure error.
    pub fn fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }

    /// Make releases fail, to exercise the best-effort release path.
    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    /// Simulate a broken tenant-settings read. Mode lookups must then
    /// resolve to `Manual` regardless of configuration.
    pub fn fail_mode_reads(&self, fail: bool) {
        self.fail_mode_reads.store(fail, Ordering::SeqCst);
    }

    /// Make claims ignore the requested limit and return up to `batch`
    /// events instead. Exercises the run loop against a store that
    /// over-delivers; 0 restores normal behavior.
    pub fn force_claim_batch(&self, batch: usize) {
        self.claim_batch_override.store(batch, Ordering::SeqCst);
    }

    pub fn set_mode(&self, tenant_id: Uuid, mode: AutopilotMode) {
        self.inner
            .lock()
            .expect("store lock")
            .modes
            .insert(tenant_id, mode);
    }

    /// Seed `count` pending events of `event_type`, returning their ids in
    /// claim order.
    pub fn seed_pending(&self, event_type: &str, tenant_id: Option<Uuid>, count: usize) -> Vec<Uuid> {
        let mut inner = self.inner.lock().expect("store lock");
        (0..count)
            .map(|_| {
                let id = Uuid::new_v4();
                inner.events.push(Event {
                    id,
                    event_type: event_type.to_string(),
                    entity_type: "lead".to_string(),
                    entity_id: Uuid::new_v4(),
                    payload: serde_json::json!({}),
                    status: EventStatus::Pending,
                    attempts: 0,
                    tenant_id,
                    idempotency_key: None,
                    created_at: Utc::now(),
                });
                id
            })
            .collect()
    }

    /// Snapshot of one event.
    pub fn event(&self, id: Uuid) -> Option<Event> {
        self.inner
            .lock()
            .expect("store lock")
            .events
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Snapshot of all events, in insertion order.
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().expect("store lock").events.clone()
    }

    /// Force an event back to `pending` (manual reset, as an operator
    /// would do when replaying).
    pub fn reset_to_pending(&self, id: Uuid) {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(event) = inner.events.iter_mut().find(|e| e.id == id) {
            event.status = EventStatus::Pending;
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn claim_events(
        &self,
        _consumer: &str,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<Event>> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(anyhow!("event store unreachable"));
        }

        let limit = match self.claim_batch_override.load(Ordering::SeqCst) {
            0 => limit,
            batch => batch,
        };

        let mut inner = self.inner.lock().expect("store lock");
        let mut claimed = Vec::new();
        for event in inner.events.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if event.status == EventStatus::Pending && event.event_type == event_type {
                event.status = EventStatus::Processing;
                event.attempts += 1;
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, event_id: Uuid, _consumer: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(event) = inner.events.iter_mut().find(|e| e.id == event_id) {
            if matches!(
                event.status,
                EventStatus::Processing | EventStatus::Processed
            ) {
                event.status = EventStatus::Processed;
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        _consumer: &str,
        _error: &str,
    ) -> Result<FailureDisposition> {
        let mut inner = self.inner.lock().expect("store lock");
        // Only a processing row can fail; a late call after a release or
        // re-claim is a no-op.
        let Some(event) = inner
            .events
            .iter_mut()
            .find(|e| e.id == event_id && e.status == EventStatus::Processing)
        else {
            return Ok(FailureDisposition {
                dead_lettered: false,
            });
        };

        let dead_lettered = event.attempts >= self.max_attempts;
        event.status = if dead_lettered {
            EventStatus::DeadLettered
        } else {
            EventStatus::Failed
        };
        Ok(FailureDisposition { dead_lettered })
    }

    async fn emit_event(&self, event: NewEvent) -> Result<EmitOutcome> {
        let mut inner = self.inner.lock().expect("store lock");

        if let Some(key) = &event.idempotency_key {
            let duplicate = inner
                .events
                .iter()
                .any(|e| e.idempotency_key.as_deref() == Some(key));
            if duplicate {
                return Ok(EmitOutcome::Deduplicated);
            }
        }

        let id = Uuid::new_v4();
        inner.events.push(Event {
            id,
            event_type: event.event_type,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            payload: event.payload,
            status: EventStatus::Pending,
            attempts: 0,
            tenant_id: event.tenant_id,
            idempotency_key: event.idempotency_key,
            created_at: Utc::now(),
        });
        Ok(EmitOutcome::Inserted(id))
    }

    async fn release_events(&self, event_ids: &[Uuid]) -> Result<u64> {
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(anyhow!("release update failed"));
        }

        let mut inner = self.inner.lock().expect("store lock");
        let mut released = 0u64;
        for event in inner.events.iter_mut() {
            if event_ids.contains(&event.id) && event.status == EventStatus::Processing {
                event.status = EventStatus::Pending;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn autopilot_mode(&self, tenant_id: Option<Uuid>) -> AutopilotMode {
        if self.fail_mode_reads.load(Ordering::SeqCst) {
            return AutopilotMode::Manual;
        }
        let Some(tenant_id) = tenant_id else {
            return AutopilotMode::Manual;
        };
        self.inner
            .lock()
            .expect("store lock")
            .modes
            .get(&tenant_id)
            .copied()
            .unwrap_or(AutopilotMode::Manual)
    }
}

// ---------------------------------------------------------------------------
// MemoryCrmStore
// ---------------------------------------------------------------------------

/// A sequence row for seeding tests.
#[derive(Debug, Clone)]
pub struct MemorySequence {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub name: String,
    pub trigger: String,
    pub active: bool,
}

/// An enrollment row, as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub lead_id: Uuid,
    pub sequence_id: Uuid,
    pub tenant_id: Option<Uuid>,
}

#[derive(Default)]
struct CrmInner {
    sequences: Vec<MemorySequence>,
    enrollments: Vec<Enrollment>,
    approvals: Vec<NewApproval>,
    audits: Vec<AuditEntry>,
}

/// In-memory CRM repositories.
#[derive(Default)]
pub struct MemoryCrmStore {
    inner: Mutex<CrmInner>,
}

impl MemoryCrmStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sequence; insertion order doubles as creation order, so the
    /// first active match wins lookups.
    pub fn add_sequence(
        &self,
        tenant_id: Option<Uuid>,
        name: &str,
        trigger: &str,
        active: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.inner
            .lock()
            .expect("crm lock")
            .sequences
            .push(MemorySequence {
                id,
                tenant_id,
                name: name.to_string(),
                trigger: trigger.to_string(),
                active,
            });
        id
    }

    pub fn enrollments(&self) -> Vec<Enrollment> {
        self.inner.lock().expect("crm lock").enrollments.clone()
    }

    pub fn approvals(&self) -> Vec<NewApproval> {
        self.inner.lock().expect("crm lock").approvals.clone()
    }

    pub fn audits(&self) -> Vec<AuditEntry> {
        self.inner.lock().expect("crm lock").audits.clone()
    }
}

#[async_trait]
impl CrmStore for MemoryCrmStore {
    async fn approval_exists(&self, action_type: &str, target_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .expect("crm lock")
            .approvals
            .iter()
            .any(|a| a.action_type == action_type && a.target_id == target_id))
    }

    async fn queue_approval(&self, entry: NewApproval) -> Result<()> {
        let mut inner = self.inner.lock().expect("crm lock");
        // Uniqueness on (action_type, target_id): a collision is success.
        let collision = inner
            .approvals
            .iter()
            .any(|a| a.action_type == entry.action_type && a.target_id == entry.target_id);
        if !collision {
            inner.approvals.push(entry);
        }
        Ok(())
    }

    async fn first_active_sequence(
        &self,
        tenant_id: Option<Uuid>,
        trigger: &str,
    ) -> Result<Option<SequenceRef>> {
        Ok(self
            .inner
            .lock()
            .expect("crm lock")
            .sequences
            .iter()
            .find(|s| {
                s.active
                    && s.trigger == trigger
                    && (tenant_id.is_none() || s.tenant_id == tenant_id)
            })
            .map(|s| SequenceRef {
                id: s.id,
                name: s.name.clone(),
            }))
    }

    async fn enrollment_exists(&self, lead_id: Uuid, sequence_id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .expect("crm lock")
            .enrollments
            .iter()
            .any(|e| e.lead_id == lead_id && e.sequence_id == sequence_id))
    }

    async fn insert_enrollment(
        &self,
        lead_id: Uuid,
        sequence_id: Uuid,
        tenant_id: Option<Uuid>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("crm lock");
        let collision = inner
            .enrollments
            .iter()
            .any(|e| e.lead_id == lead_id && e.sequence_id == sequence_id);
        if !collision {
            inner.enrollments.push(Enrollment {
                lead_id,
                sequence_id,
                tenant_id,
            });
        }
        Ok(())
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<()> {
        self.inner.lock().expect("crm lock").audits.push(entry);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingLogger
// ---------------------------------------------------------------------------

/// Captures every record the run loop emits, for assertions.
#[derive(Default)]
pub struct RecordingLogger {
    events: Mutex<Vec<EventRecord>>,
    runs: Mutex<Vec<RunSummary>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_records(&self) -> Vec<EventRecord> {
        self.events.lock().expect("logger lock").clone()
    }

    pub fn run_records(&self) -> Vec<RunSummary> {
        self.runs.lock().expect("logger lock").clone()
    }
}

impl RunLogger for RecordingLogger {
    fn event(&self, record: &EventRecord) {
        self.events.lock().expect("logger lock").push(record.clone());
    }

    fn run(&self, summary: &RunSummary) {
        self.runs.lock().expect("logger lock").push(summary.clone());
    }
}

// ---------------------------------------------------------------------------
// ScriptedConsumer
// ---------------------------------------------------------------------------

/// A consumer that succeeds or fails on demand and remembers what it saw.
pub struct ScriptedConsumer {
    name: &'static str,
    event_type: &'static str,
    fail_with: Option<String>,
    seen: Mutex<Vec<Uuid>>,
}

impl ScriptedConsumer {
    pub fn succeeding(name: &'static str, event_type: &'static str) -> Self {
        Self {
            name,
            event_type,
            fail_with: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &'static str, event_type: &'static str, message: &str) -> Self {
        Self {
            name,
            event_type,
            fail_with: Some(message.to_string()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Event ids processed so far, in order.
    pub fn seen(&self) -> Vec<Uuid> {
        self.seen.lock().expect("consumer lock").clone()
    }
}

#[async_trait]
impl Consumer for ScriptedConsumer {
    fn name(&self) -> &'static str {
        self.name
    }

    fn event_type(&self) -> &'static str {
        self.event_type
    }

    async fn process(&self, event: &Event) -> Result<(), ConsumerError> {
        self.seen.lock().expect("consumer lock").push(event.id);
        match &self.fail_with {
            Some(message) => Err(ConsumerError::Store(anyhow!("{message}"))),
            None => Ok(()),
        }
    }
}
