//! Handler registry: which integration event handlers run for which event
//! type.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{Envelope, EventType, HandlerError};

/// A downstream consumer of one event type.
///
/// Handlers must be idempotent with respect to `Envelope::dedup_key`: a retry
/// re-invokes every handler of the type, including ones that already
/// succeeded on an earlier attempt.
#[async_trait]
pub trait IntegrationEventHandler: Send + Sync {
    /// The single event type this handler consumes.
    fn event_type(&self) -> EventType;

    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Handlers grouped by event type.
///
/// Design:
/// - Built once at startup (mutable).
/// - Shared immutably by the dispatcher afterwards, so no locks.
/// - A type may have zero, one, or many handlers; order of registration is
///   the order of invocation.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<EventType, Vec<Arc<dyn IntegrationEventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn from_handlers(
        handlers: impl IntoIterator<Item = Arc<dyn IntegrationEventHandler>>,
    ) -> Self {
        let mut registry = Self::new();
        for handler in handlers {
            registry.register(handler);
        }
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn IntegrationEventHandler>) {
        self.handlers
            .entry(handler.event_type())
            .or_default()
            .push(handler);
    }

    /// Handlers for `event_type`; empty when nobody listens.
    pub fn handlers_for(&self, event_type: EventType) -> &[Arc<dyn IntegrationEventHandler>] {
        self.handlers
            .get(&event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn registered_types(&self) -> Vec<EventType> {
        self.handlers.keys().copied().collect()
    }

    /// Total number of handlers across all types.
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (event_type, handlers) in &self.handlers {
            let names: Vec<&str> = handlers.iter().map(|h| h.name()).collect();
            map.entry(event_type, &names);
        }
        map.finish()
    }
}
