//! # Conveyor
//!
//! A claim-based, at-least-once event processing core with budgeted runs,
//! idempotent consumers, dead-lettering, and safe release-back-to-pending
//! on early termination.
//!
//! ## Architecture
//!
//! ```text
//! HTTP entry point
//!     │  consumer / event_type / limit / max_ms / run_id
//!     ▼
//! Processor.run()
//!     │
//!     ├─► EventStore.claim_events()      pending ─► processing (atomic)
//!     │
//!     ├─► per event, under budgets:
//!     │       ConsumerRegistry ─► Consumer.process()
//!     │           ├─ Ok   ─► mark_processed()
//!     │           ├─ Err  ─► mark_failed()  ─► failed | dead_lettered
//!     │           └─ unknown name ─► skipped
//!     │
//!     ├─► on timeout / limit: release_events(claimed − handled)
//!     │                       processing ─► pending, attempts untouched
//!     ▼
//! RunSummary (+ one structured log record per transition)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Claims are exclusive** - two concurrent runs never hold the same event
//! 2. **No abandonment** - every claimed event is handled or explicitly released
//! 3. **Release is free** - a release never increments `attempts`
//! 4. **Emission is idempotent** - same idempotency key, one event row
//! 5. **Fail-safe autopilot** - ambiguous tenant config resolves to `Manual`
//!
//! Budgets are advisory: the wall-clock check runs at the top of each
//! iteration only, so a slow consumer can overrun `max_ms`. Keep `max_ms`
//! below the host's hard execution ceiling; the release step is what turns
//! a host kill from silent starvation into bounded-time recovery.
//!
//! Consumers must be individually idempotent. Runs give them no ordering
//! guarantee beyond claim order within one batch, and no cross-event
//! transaction.

mod consumer;
mod event;
mod logger;
mod run;
mod store;

// Built-in consumers and the CRM seam they use
pub mod consumers;

pub use consumer::{Consumer, ConsumerError, ConsumerRegistry};
pub use event::{AutopilotMode, Event, EventStatus, NewEvent};
pub use logger::{EventOutcome, EventRecord, RunLogger, TracingRunLogger};
pub use run::{
    EventError, Processor, RunConfig, RunSummary, StoppedReason, MAX_LIMIT, MAX_MS,
};
pub use store::{EmitOutcome, EventStore, FailureDisposition};

// Re-export commonly used external types
pub use async_trait::async_trait;
