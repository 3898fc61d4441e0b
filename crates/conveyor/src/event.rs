//! The event row model and per-tenant autopilot modes.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an event.
///
/// Only the store performs transitions. The claim transition
/// (`pending` → `processing`) is exclusive: at most one run ever holds an
/// event in `processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    DeadLettered,
}

impl EventStatus {
    /// Stable snake_case label, matches the database enum.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
            EventStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "processed" => Some(EventStatus::Processed),
            "failed" => Some(EventStatus::Failed),
            "dead_lettered" => Some(EventStatus::DeadLettered),
            _ => None,
        }
    }
}

/// An event as stored. Returned by claims; the store assigns `id`,
/// `status`, `attempts` and `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    /// Claim attempts so far. Incremented on claim, never on release.
    pub attempts: i32,
    pub tenant_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Decode the payload into a typed view. Consumers call this at their
    /// boundary instead of poking at free-form JSON.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// An event to be emitted. The caller builds this; the store assigns the rest.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub emitted_by: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
}

impl NewEvent {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Uuid,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id,
            payload: serde_json::Value::Object(Default::default()),
            emitted_by: None,
            tenant_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_emitted_by(mut self, emitted_by: impl Into<String>) -> Self {
        self.emitted_by = Some(emitted_by.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Duplicate emissions with the same key are coalesced by the store.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// Per-tenant automation level.
///
/// `Manual` queues actions for human approval; `Assisted` and `Full` act
/// automatically. Anything ambiguous (read error, missing row, unknown
/// value) resolves to `Manual` — the store must never guess toward
/// automatic action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotMode {
    #[default]
    Manual,
    Assisted,
    Full,
}

impl AutopilotMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutopilotMode::Manual => "manual",
            AutopilotMode::Assisted => "assisted",
            AutopilotMode::Full => "full",
        }
    }

    /// Fail-safe parse: anything unrecognized is `Manual`.
    pub fn parse_or_manual(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("assisted") => AutopilotMode::Assisted,
            Some("full") => AutopilotMode::Full,
            _ => AutopilotMode::Manual,
        }
    }

    /// Whether this mode permits acting without human approval.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, AutopilotMode::Manual)
    }
}
