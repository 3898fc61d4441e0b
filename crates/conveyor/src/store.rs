//! The `EventStore` trait — the single shared mutable resource.
//!
//! All mutual exclusion between concurrent runs lives behind this seam.
//! Implementations must make `claim_events` atomic against concurrent
//! callers; the run loop holds no locks of its own.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::event::{AutopilotMode, Event, NewEvent};

/// Result of emitting an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    /// A new pending event row was created.
    Inserted(Uuid),
    /// The idempotency key matched an existing event; no row was created.
    /// This is success, not an error.
    Deduplicated,
}

/// What the store decided about a failed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDisposition {
    /// The failure crossed the store's attempts threshold and the event is
    /// now terminal. Callers log this distinctly for alerting.
    pub dead_lettered: bool,
}

/// Durable event queue operations.
///
/// Claim is the only exclusive transition; mark operations are idempotent
/// so a retried call after a partial failure is harmless.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically transition up to `limit` pending events of `event_type`
    /// to `processing` and return them, in store order. Two concurrent
    /// claims never return the same event.
    ///
    /// An infrastructure error here is terminal for the run: nothing was
    /// claimed, there is nothing to release, do not retry internally.
    async fn claim_events(
        &self,
        consumer: &str,
        event_type: &str,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// `processing` → `processed`. Idempotent.
    async fn mark_processed(&self, event_id: Uuid, consumer: &str) -> Result<()>;

    /// `processing` → `failed` or `dead_lettered`, per the store's attempts
    /// threshold. The store owns the backoff/dead-letter policy; the caller
    /// only learns the disposition. An event no longer in `processing`
    /// (released, re-claimed, or already terminal) is left untouched and
    /// reported as not dead-lettered.
    async fn mark_failed(
        &self,
        event_id: Uuid,
        consumer: &str,
        error: &str,
    ) -> Result<FailureDisposition>;

    /// Insert a new `pending` event (attempts = 0). An idempotency-key
    /// collision coalesces with the existing event and reports
    /// [`EmitOutcome::Deduplicated`].
    async fn emit_event(&self, event: NewEvent) -> Result<EmitOutcome>;

    /// Reset the given `processing` events back to `pending` without
    /// touching `attempts` — a release is not a failed attempt. Returns how
    /// many rows actually moved.
    async fn release_events(&self, event_ids: &[Uuid]) -> Result<u64>;

    /// Per-tenant autopilot mode. Infallible by design: any read error or
    /// missing configuration resolves to [`AutopilotMode::Manual`].
    async fn autopilot_mode(&self, tenant_id: Option<Uuid>) -> AutopilotMode;
}
