//! The budgeted run loop.
//!
//! One run claims a batch, walks it under wall-clock and count budgets,
//! and — the load-bearing part — releases anything it claimed but never
//! reached back to `pending`. A host can kill the process at any moment
//! past its own ceiling, so `max_ms` stays below that ceiling and every
//! early stop accounts for the full claimed set. The invariant:
//!
//! > every claimed event ends up handled (processed / failed / skipped)
//! > or explicitly released; none is abandoned in `processing`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::consumer::ConsumerRegistry;
use crate::logger::{EventOutcome, EventRecord, RunLogger};
use crate::store::EventStore;

/// Hard cap on events handled per run.
pub const MAX_LIMIT: usize = 100;
/// Hard cap on the wall-clock budget, below typical FaaS execution ceilings.
pub const MAX_MS: u64 = 55_000;

/// Configuration for one run. Built from HTTP parameters or directly in
/// tests; `new` applies the caps.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: Uuid,
    pub consumer: String,
    pub event_type: String,
    pub limit: usize,
    pub max_ms: u64,
}

impl RunConfig {
    pub fn new(
        run_id: Uuid,
        consumer: impl Into<String>,
        event_type: impl Into<String>,
        limit: usize,
        max_ms: u64,
    ) -> Self {
        Self {
            run_id,
            consumer: consumer.into(),
            event_type: event_type.into(),
            limit: limit.min(MAX_LIMIT),
            max_ms: max_ms.min(MAX_MS),
        }
    }
}

/// Why the run stopped.
///
/// `Timeout` and `LimitReached` are expected early stops, not errors; they
/// are what triggers the release path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppedReason {
    Completed,
    NoEvents,
    Timeout,
    LimitReached,
    ClaimError,
    Error,
}

impl StoppedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoppedReason::Completed => "completed",
            StoppedReason::NoEvents => "no_events",
            StoppedReason::Timeout => "timeout",
            StoppedReason::LimitReached => "limit_reached",
            StoppedReason::ClaimError => "claim_error",
            StoppedReason::Error => "error",
        }
    }
}

/// One event that failed during the run.
#[derive(Debug, Clone, Serialize)]
pub struct EventError {
    pub event_id: Uuid,
    pub message: String,
}

/// Result of one run. Serialized as-is by the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub success: bool,
    pub run_id: Uuid,
    pub consumer: String,
    pub event_type: String,
    pub processed: usize,
    pub failed: usize,
    pub released: usize,
    pub stopped_reason: StoppedReason,
    pub elapsed_ms: u64,
    pub errors: Vec<EventError>,
}

/// The processor entry point. Holds its collaborators by injection; there
/// is no global store handle anywhere in the core.
pub struct Processor {
    store: Arc<dyn EventStore>,
    registry: Arc<ConsumerRegistry>,
    logger: Arc<dyn RunLogger>,
}

impl Processor {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<ConsumerRegistry>,
        logger: Arc<dyn RunLogger>,
    ) -> Self {
        Self {
            store,
            registry,
            logger,
        }
    }

    /// Execute one budgeted run. Never returns an error: every outcome,
    /// including a failed claim, is a well-formed summary.
    pub async fn run(&self, config: RunConfig) -> RunSummary {
        let started = Instant::now();

        let events = match self
            .store
            .claim_events(&config.consumer, &config.event_type, config.limit)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(
                    run_id = %config.run_id,
                    consumer = %config.consumer,
                    event_type = %config.event_type,
                    error = %e,
                    "claim failed, run aborted"
                );
                let summary = self.summary(
                    &config,
                    false,
                    0,
                    0,
                    0,
                    StoppedReason::ClaimError,
                    started,
                    vec![],
                );
                self.logger.run(&summary);
                return summary;
            }
        };

        if events.is_empty() {
            let summary = self.summary(
                &config,
                true,
                0,
                0,
                0,
                StoppedReason::NoEvents,
                started,
                vec![],
            );
            self.logger.run(&summary);
            return summary;
        }

        let claimed: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let mut handled: HashSet<Uuid> = HashSet::with_capacity(claimed.len());
        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut errors: Vec<EventError> = Vec::new();
        let mut stopped_reason = StoppedReason::Completed;

        for event in &events {
            // Budget checks happen only here, at the top of each iteration.
            // A slow consumer call can overrun max_ms; the budget is
            // advisory, not preemptive.
            let elapsed = started.elapsed().as_millis() as u64;
            if elapsed >= config.max_ms {
                stopped_reason = StoppedReason::Timeout;
                break;
            }
            if processed + failed >= config.limit {
                stopped_reason = StoppedReason::LimitReached;
                break;
            }

            let Some(consumer) = self.registry.get(&config.consumer) else {
                // Unknown consumer: a skip is a terminal outcome, not a
                // failure. The event stays where the store put it until
                // the staleness reclaim sweeps it.
                self.logger.event(&EventRecord {
                    run_id: config.run_id,
                    consumer: config.consumer.clone(),
                    event_id: event.id,
                    event_type: event.event_type.clone(),
                    outcome: EventOutcome::Skipped,
                    prior_status: event.status,
                    attempts: event.attempts,
                    dead_lettered: false,
                    duration_ms: 0,
                    error: None,
                    error_label: None,
                });
                handled.insert(event.id);
                continue;
            };

            let event_started = Instant::now();
            match consumer.process(event).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_processed(event.id, &config.consumer).await {
                        // The handler's effects are durable and idempotent;
                        // the stuck status row is recovered by the
                        // staleness reclaim.
                        tracing::error!(
                            run_id = %config.run_id,
                            event_id = %event.id,
                            error = %e,
                            "mark_processed failed"
                        );
                    }
                    processed += 1;
                    handled.insert(event.id);
                    self.logger.event(&EventRecord {
                        run_id: config.run_id,
                        consumer: config.consumer.clone(),
                        event_id: event.id,
                        event_type: event.event_type.clone(),
                        outcome: EventOutcome::Processed,
                        prior_status: event.status,
                        attempts: event.attempts,
                        dead_lettered: false,
                        duration_ms: event_started.elapsed().as_millis() as u64,
                        error: None,
                        error_label: None,
                    });
                }
                Err(consumer_err) => {
                    let error_label = consumer_err.as_label();
                    let message = consumer_err.to_string();
                    let dead_lettered = match self
                        .store
                        .mark_failed(event.id, &config.consumer, &message)
                        .await
                    {
                        Ok(disposition) => disposition.dead_lettered,
                        Err(e) => {
                            tracing::error!(
                                run_id = %config.run_id,
                                event_id = %event.id,
                                error = %e,
                                "mark_failed failed"
                            );
                            false
                        }
                    };
                    failed += 1;
                    handled.insert(event.id);
                    errors.push(EventError {
                        event_id: event.id,
                        message: message.clone(),
                    });
                    self.logger.event(&EventRecord {
                        run_id: config.run_id,
                        consumer: config.consumer.clone(),
                        event_id: event.id,
                        event_type: event.event_type.clone(),
                        outcome: EventOutcome::Failed,
                        prior_status: event.status,
                        attempts: event.attempts,
                        dead_lettered,
                        duration_ms: event_started.elapsed().as_millis() as u64,
                        error: Some(message),
                        error_label: Some(error_label),
                    });
                }
            }
        }

        // Early stop: everything claimed but not handled goes back to
        // pending in one bulk update, attempts untouched.
        let mut released = 0usize;
        if matches!(
            stopped_reason,
            StoppedReason::Timeout | StoppedReason::LimitReached
        ) {
            let unhandled: Vec<Uuid> = claimed
                .iter()
                .copied()
                .filter(|id| !handled.contains(id))
                .collect();
            if !unhandled.is_empty() {
                match self.store.release_events(&unhandled).await {
                    Ok(n) => released = n as usize,
                    Err(e) => {
                        // Best effort: the run still succeeds. The events
                        // stay in `processing` until the staleness reclaim
                        // returns them to `pending`.
                        tracing::error!(
                            run_id = %config.run_id,
                            unhandled = unhandled.len(),
                            error = %e,
                            "release failed, events await staleness reclaim"
                        );
                    }
                }
            }
        }

        let summary = self.summary(
            &config,
            true,
            processed,
            failed,
            released,
            stopped_reason,
            started,
            errors,
        );
        self.logger.run(&summary);
        summary
    }

    #[allow(clippy::too_many_arguments)]
    fn summary(
        &self,
        config: &RunConfig,
        success: bool,
        processed: usize,
        failed: usize,
        released: usize,
        stopped_reason: StoppedReason,
        started: Instant,
        errors: Vec<EventError>,
    ) -> RunSummary {
        RunSummary {
            success,
            run_id: config.run_id,
            consumer: config.consumer.clone(),
            event_type: config.event_type.clone(),
            processed,
            failed,
            released,
            stopped_reason,
            elapsed_ms: started.elapsed().as_millis() as u64,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_caps_limit_and_budget() {
        let config = RunConfig::new(Uuid::new_v4(), "c", "t", 5_000, 600_000);
        assert_eq!(config.limit, MAX_LIMIT);
        assert_eq!(config.max_ms, MAX_MS);

        let config = RunConfig::new(Uuid::new_v4(), "c", "t", 10, 8_000);
        assert_eq!(config.limit, 10);
        assert_eq!(config.max_ms, 8_000);
    }

    #[test]
    fn stopped_reason_serializes_snake_case() {
        let json = serde_json::to_string(&StoppedReason::LimitReached).unwrap();
        assert_eq!(json, "\"limit_reached\"");
        assert_eq!(StoppedReason::ClaimError.as_str(), "claim_error");
    }
}
