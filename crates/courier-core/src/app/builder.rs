//! DispatcherBuilder: explicit wiring of store, handlers, clock and config.
//!
//! `build()` fails fast:
//! - every type passed to `expect_types()` must have at least one handler
//! - the config must validate
//! - the config's backoff series must be the one the store applies

use std::sync::Arc;

use crate::app::config::DispatcherConfig;
use crate::app::dispatcher::Dispatcher;
use crate::domain::{BuildError, ConfigError, EventType};
use crate::ports::{Clock, OutboxStore, SystemClock};
use crate::registry::{HandlerRegistry, IntegrationEventHandler};

/// Builds a [`Dispatcher`].
///
/// ```ignore
/// let dispatcher = DispatcherBuilder::new(store)
///     .handler(WelcomeMailer::new(mailer))
///     .config(config)
///     .expect_types(&[EventType::EnrollmentCreated])
///     .build()?;
/// ```
pub struct DispatcherBuilder {
    store: Arc<dyn OutboxStore>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    expected_types: Option<Vec<EventType>>,
}

impl DispatcherBuilder {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
            config: DispatcherConfig::default(),
            expected_types: None,
        }
    }

    pub fn handler(mut self, handler: impl IntegrationEventHandler + 'static) -> Self {
        self.registry.register(Arc::new(handler));
        self
    }

    pub fn handlers(
        mut self,
        handlers: impl IntoIterator<Item = Arc<dyn IntegrationEventHandler>>,
    ) -> Self {
        for handler in handlers {
            self.registry.register(handler);
        }
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Event types that must have a handler for `build()` to succeed.
    pub fn expect_types(mut self, event_types: &[EventType]) -> Self {
        self.expected_types = Some(event_types.to_vec());
        self
    }

    pub fn build(self) -> Result<Dispatcher, BuildError> {
        if let Some(expected) = &self.expected_types {
            let registered = self.registry.registered_types();
            let missing: Vec<EventType> = expected
                .iter()
                .filter(|t| !registered.contains(t))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        self.config.validate()?;

        let store_series: Vec<u64> = self
            .store
            .backoff()
            .series()
            .iter()
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .collect();
        if store_series != self.config.backoff_series_ms {
            return Err(ConfigError::BackoffMismatch {
                config: self.config.backoff_series_ms.clone(),
                store: store_series,
            }
            .into());
        }

        Ok(Dispatcher::new(
            self.store,
            self.registry,
            self.clock,
            self.config,
        ))
    }
}
