//! Consumers and the name-keyed registry that dispatches to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::Event;

/// Errors raised by a consumer while processing one event.
///
/// These are local to the event: the run loop converts them to a
/// `mark_failed` call and moves on. They never abort the batch.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The payload did not decode into the shape this consumer expects.
    #[error("payload rejected: {0}")]
    Payload(String),

    /// A store or repository call failed mid-processing.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ConsumerError {
    /// Short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            ConsumerError::Payload(_) => "payload_rejected",
            ConsumerError::Store(_) => "store_failed",
        }
    }
}

/// A named handler bound to one event type.
///
/// Consumers must be idempotent: a released-and-reclaimed event will be
/// handed to the same consumer again, and two runs may interleave
/// arbitrarily across a batch. Check before every mutating write, and give
/// follow-up emissions deterministic idempotency keys.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Registry key. Stable; appears in logs and run summaries.
    fn name(&self) -> &'static str;

    /// The event type this consumer handles.
    fn event_type(&self) -> &'static str;

    /// Process one claimed event. Errors are recorded against the event and
    /// do not stop the run.
    async fn process(&self, event: &Event) -> Result<(), ConsumerError>;
}

/// Explicit name → handler mapping.
///
/// An unknown name is not an error at dispatch time — the run loop records
/// a `skipped` outcome for the event and keeps going.
#[derive(Default)]
pub struct ConsumerRegistry {
    handlers: HashMap<&'static str, Arc<dyn Consumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer under its own name. Re-registering a name
    /// replaces the previous handler.
    pub fn register(&mut self, consumer: Arc<dyn Consumer>) -> &mut Self {
        self.handlers.insert(consumer.name(), consumer);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Consumer>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Consumer for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn event_type(&self) -> &'static str {
            "anything"
        }

        async fn process(&self, _event: &Event) -> Result<(), ConsumerError> {
            Ok(())
        }
    }

    #[test]
    fn registry_lookup_by_name() {
        let mut registry = ConsumerRegistry::new();
        registry.register(Arc::new(Noop));

        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["noop"]);
    }

    #[test]
    fn error_labels_are_stable() {
        assert_eq!(
            ConsumerError::Payload("bad".into()).as_label(),
            "payload_rejected"
        );
        assert_eq!(
            ConsumerError::Store(anyhow::anyhow!("down")).as_label(),
            "store_failed"
        );
    }
}
