//! Structured run/event logging as an injected capability.
//!
//! The run loop reports through [`RunLogger`] rather than writing to a
//! global sink, so tests can assert on the records a run emitted. The
//! default implementation forwards everything to `tracing`.

use serde::Serialize;
use uuid::Uuid;

use crate::event::EventStatus;
use crate::run::RunSummary;

/// Terminal outcome of one claimed event within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Processed,
    Failed,
    /// No consumer registered under the requested name. Not a failure.
    Skipped,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Processed => "processed",
            EventOutcome::Failed => "failed",
            EventOutcome::Skipped => "skipped",
        }
    }
}

/// One structured record per event-level transition.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub run_id: Uuid,
    pub consumer: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub outcome: EventOutcome,
    /// Status the event held when claimed.
    pub prior_status: EventStatus,
    pub attempts: i32,
    /// Set when a failure crossed the store's dead-letter threshold.
    pub dead_lettered: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Stable snake_case error category, for log filtering and alerting.
    pub error_label: Option<&'static str>,
}

/// Run-level and event-level log sink.
pub trait RunLogger: Send + Sync {
    fn event(&self, record: &EventRecord);
    fn run(&self, summary: &RunSummary);
}

/// Default logger: one `tracing` line per record.
///
/// Failures and dead-letters log at WARN, everything else at INFO.
/// Release failures are logged by the run loop directly since they carry
/// no per-event record.
pub struct TracingRunLogger;

impl RunLogger for TracingRunLogger {
    fn event(&self, record: &EventRecord) {
        if record.dead_lettered {
            tracing::warn!(
                run_id = %record.run_id,
                consumer = %record.consumer,
                event_id = %record.event_id,
                event_type = %record.event_type,
                outcome = record.outcome.as_str(),
                attempts = record.attempts,
                duration_ms = record.duration_ms,
                error = record.error.as_deref().unwrap_or(""),
                error_label = record.error_label.unwrap_or(""),
                "event dead-lettered"
            );
        } else if record.outcome == EventOutcome::Failed {
            tracing::warn!(
                run_id = %record.run_id,
                consumer = %record.consumer,
                event_id = %record.event_id,
                event_type = %record.event_type,
                outcome = record.outcome.as_str(),
                attempts = record.attempts,
                duration_ms = record.duration_ms,
                error = record.error.as_deref().unwrap_or(""),
                error_label = record.error_label.unwrap_or(""),
                "event failed"
            );
        } else {
            tracing::info!(
                run_id = %record.run_id,
                consumer = %record.consumer,
                event_id = %record.event_id,
                event_type = %record.event_type,
                outcome = record.outcome.as_str(),
                attempts = record.attempts,
                duration_ms = record.duration_ms,
                "event handled"
            );
        }
    }

    fn run(&self, summary: &RunSummary) {
        tracing::info!(
            run_id = %summary.run_id,
            consumer = %summary.consumer,
            event_type = %summary.event_type,
            processed = summary.processed,
            failed = summary.failed,
            released = summary.released,
            stopped_reason = summary.stopped_reason.as_str(),
            elapsed_ms = summary.elapsed_ms,
            "run finished"
        );
    }
}
