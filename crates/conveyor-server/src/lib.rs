//! HTTP surface for the event processor.
//!
//! One invocation = one budgeted run. Handled outcomes (including claim
//! errors and empty queues) return 200 with a JSON run summary; only a
//! malformed request or an escape from the outermost layer returns 500,
//! and even that is a well-formed JSON body with a fresh `run_id`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use conveyor_core::consumers::{COLD_AGENT_ENROLLER, LEAD_CREATED};
use conveyor_core::{Processor, RunConfig};
use conveyor_postgres::PgEventStore;

/// Request defaults, applied before the caps in [`RunConfig::new`].
pub const DEFAULT_LIMIT: usize = 10;
pub const DEFAULT_MAX_MS: u64 = 8_000;

pub struct AppState {
    pub processor: Processor,
    pub store: PgEventStore,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/process", get(process).post(process))
        .route("/stats", get(stats))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Parse query parameters into a run configuration.
///
/// Absent parameters take their defaults; present ones must parse, and a
/// value that does not is a malformed request.
pub fn parse_run_config(params: &HashMap<String, String>) -> Result<RunConfig, String> {
    let consumer = params
        .get("consumer")
        .map(String::as_str)
        .unwrap_or(COLD_AGENT_ENROLLER);
    let event_type = params
        .get("event_type")
        .map(String::as_str)
        .unwrap_or(LEAD_CREATED);

    let limit = match params.get("limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| format!("invalid limit {raw:?}"))?,
        None => DEFAULT_LIMIT,
    };
    let max_ms = match params.get("max_ms") {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|_| format!("invalid max_ms {raw:?}"))?,
        None => DEFAULT_MAX_MS,
    };
    let run_id = match params.get("run_id") {
        Some(raw) => raw
            .parse::<Uuid>()
            .map_err(|_| format!("invalid run_id {raw:?}"))?,
        None => Uuid::new_v4(),
    };

    Ok(RunConfig::new(run_id, consumer, event_type, limit, max_ms))
}

fn error_response(error: String, started: Instant) -> Response {
    let run_id = Uuid::new_v4();
    tracing::error!(%run_id, %error, "request rejected");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "run_id": run_id,
            "error": error,
            "stopped_reason": "error",
            "elapsed_ms": started.elapsed().as_millis() as u64,
        })),
    )
        .into_response()
}

async fn process(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let started = Instant::now();

    let config = match parse_run_config(&params) {
        Ok(config) => config,
        Err(error) => return error_response(error, started),
    };

    let summary = state.processor.run(config).await;
    Json(summary).into_response()
}

async fn stats(State(state): State<Arc<AppState>>) -> Response {
    let started = Instant::now();
    match state.store.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e.to_string(), started),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_apply_when_params_absent() {
        let config = parse_run_config(&HashMap::new()).unwrap();
        assert_eq!(config.consumer, COLD_AGENT_ENROLLER);
        assert_eq!(config.event_type, LEAD_CREATED);
        assert_eq!(config.limit, DEFAULT_LIMIT);
        assert_eq!(config.max_ms, DEFAULT_MAX_MS);
    }

    #[test]
    fn explicit_params_override_defaults() {
        let run_id = Uuid::new_v4();
        let config = parse_run_config(&params(&[
            ("consumer", "invoice_reconciler"),
            ("event_type", "invoice_paid"),
            ("limit", "25"),
            ("max_ms", "30000"),
            ("run_id", &run_id.to_string()),
        ]))
        .unwrap();

        assert_eq!(config.consumer, "invoice_reconciler");
        assert_eq!(config.event_type, "invoice_paid");
        assert_eq!(config.limit, 25);
        assert_eq!(config.max_ms, 30_000);
        assert_eq!(config.run_id, run_id);
    }

    #[test]
    fn limits_are_capped() {
        let config =
            parse_run_config(&params(&[("limit", "100000"), ("max_ms", "600000")])).unwrap();
        assert_eq!(config.limit, conveyor_core::MAX_LIMIT);
        assert_eq!(config.max_ms, conveyor_core::MAX_MS);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(parse_run_config(&params(&[("limit", "ten")])).is_err());
        assert!(parse_run_config(&params(&[("max_ms", "-1")])).is_err());
        assert!(parse_run_config(&params(&[("run_id", "not-a-uuid")])).is_err());
    }
}
