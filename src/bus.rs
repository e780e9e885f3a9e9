//! EventBus facade tying the registry and the active driver together.

use crate::config::{BusConfig, DriverConfig};
use crate::drivers::{DistributedDriver, Driver, MemoryDriver};
use crate::error::{BusError, Result};
use crate::log::CompactionStats;
use crate::registry::SubscriptionRegistry;
use crate::topics::Pattern;
use crate::types::{Event, EventName, Handler, RegistrationId, Timestamp};
use std::sync::Arc;
use std::time::Duration;

/// The single entry point for producers and subscribers.
///
/// The delivery driver is selected once at construction from configuration
/// and never changes at runtime; the API surface is uniform across backends.
pub struct EventBus {
    registry: Arc<SubscriptionRegistry>,
    driver: Box<dyn Driver>,
}

impl EventBus {
    /// Construct a bus with the configured driver.
    pub fn new(config: BusConfig) -> Result<Self> {
        let registry = Arc::new(SubscriptionRegistry::new());

        let driver: Box<dyn Driver> = match config.driver {
            DriverConfig::Memory { durable_as_regular } => Box::new(MemoryDriver::new(
                Arc::clone(&registry),
                durable_as_regular,
            )),
            DriverConfig::Distributed(distributed) => Box::new(DistributedDriver::open(
                distributed,
                Arc::clone(&registry),
            )?),
        };

        Ok(Self { registry, driver })
    }

    /// Emit an event that never expires.
    ///
    /// Returns once the regular fan-out has run; durable fan-out is
    /// asynchronous and not awaited here.
    pub fn emit(&self, name: &str, data: Option<serde_json::Value>) -> Result<()> {
        self.emit_event(name, data, None)
    }

    /// Emit an event that expires `ttl_minutes` from now. Expired events are
    /// never delivered to durable subscribers catching up late.
    pub fn emit_with_ttl(
        &self,
        name: &str,
        data: Option<serde_json::Value>,
        ttl_minutes: u64,
    ) -> Result<()> {
        self.emit_event(
            name,
            data,
            Some(Duration::from_secs(ttl_minutes.saturating_mul(60))),
        )
    }

    fn emit_event(
        &self,
        name: &str,
        data: Option<serde_json::Value>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let name = EventName::parse(name)?;
        let event = Event::new(name, data, ttl);
        tracing::trace!(event = %event.name, "emit");
        self.driver.emit(&event)
    }

    /// Register a non-durable handler. Lives until removed or the bus drops.
    pub fn on(&self, pattern: &str, handler: Handler) -> Result<RegistrationId> {
        let pattern = Pattern::parse(pattern)?;
        Ok(self.registry.add(pattern, handler, false))
    }

    /// Register a durable handler backed by a persisted cursor.
    ///
    /// Fails with `UnsupportedOperation` when the active driver has no
    /// durability support, unless the driver was configured to degrade
    /// durable registrations to regular semantics.
    pub fn on_durable(&self, pattern: &str, handler: Handler) -> Result<RegistrationId> {
        let pattern = Pattern::parse(pattern)?;

        if !self.driver.supports_durable() {
            if self.driver.durable_as_regular() {
                tracing::warn!(
                    pattern = %pattern,
                    "driver lacks durability; durable registration degraded to regular"
                );
                return Ok(self.registry.add(pattern, handler, true));
            }
            return Err(BusError::UnsupportedOperation(
                "durable subscriptions require the distributed driver".into(),
            ));
        }

        let id = self
            .registry
            .add(pattern.clone(), Arc::clone(&handler), true);
        if let Err(e) = self.driver.start_durable_loop(id, pattern, handler) {
            // Roll back so a failed loop start leaves no dangling entry.
            self.registry.remove_id(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Remove the first registration matching both pattern and handler
    /// identity. No-op if absent.
    pub fn off(&self, pattern: &str, handler: &Handler) -> Result<()> {
        Pattern::parse(pattern)?;
        if let Some(removed) = self.registry.remove(pattern, handler) {
            if removed.durable {
                self.driver.stop_durable_loop(removed.id);
            }
        }
        Ok(())
    }

    /// Clear one pattern's registrations, or every registration.
    pub fn remove_all_listeners(&self, pattern: Option<&str>) -> Result<()> {
        if let Some(pattern) = pattern {
            Pattern::parse(pattern)?;
        }
        for removed in self.registry.remove_all(pattern) {
            if removed.durable {
                self.driver.stop_durable_loop(removed.id);
            }
        }
        Ok(())
    }

    /// Registered pattern strings, each once, in first-registration order.
    pub fn event_names(&self) -> Vec<String> {
        self.registry.patterns()
    }

    /// Number of registrations whose pattern string equals `pattern` exactly.
    pub fn listener_count(&self, pattern: &str) -> usize {
        self.registry.count(pattern)
    }

    /// Reclaim expired events from the backing store (distributed driver
    /// only). A maintenance operation; run while the namespace's consumers
    /// are quiescent.
    pub fn compact(&self) -> Result<CompactionStats> {
        self.driver.compact(Timestamp::now())
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.driver.stop_all_durable_loops();
    }
}
