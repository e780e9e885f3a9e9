//! In-process memory driver.
//!
//! Delivers events synchronously to registry handlers within the producing
//! process. No persistence and no cross-process fan-out: events emitted while
//! a subscriber is offline are lost, and durable registrations (when the
//! degradation opt-in is set) behave identically to regular ones. This is a
//! documented limitation of the backend, not a defect.

use super::Driver;
use crate::error::Result;
use crate::registry::SubscriptionRegistry;
use crate::types::Event;
use std::sync::Arc;

/// Synchronous in-process delivery.
pub struct MemoryDriver {
    registry: Arc<SubscriptionRegistry>,
    durable_as_regular: bool,
}

impl MemoryDriver {
    pub fn new(registry: Arc<SubscriptionRegistry>, durable_as_regular: bool) -> Self {
        Self {
            registry,
            durable_as_regular,
        }
    }
}

impl Driver for MemoryDriver {
    fn emit(&self, event: &Event) -> Result<()> {
        // Degraded durable registrations are dispatched like regular ones.
        self.registry.dispatch(event, true);
        Ok(())
    }

    fn supports_durable(&self) -> bool {
        false
    }

    fn durable_as_regular(&self) -> bool {
        self.durable_as_regular
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::Pattern;
    use crate::types::{EventName, Handler};
    use parking_lot::Mutex;

    #[test]
    fn test_emit_dispatches_to_registry() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let driver = MemoryDriver::new(Arc::clone(&registry), false);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |delivery| {
            seen_clone.lock().push(delivery.event.name.to_string());
            Ok(())
        });
        registry.add(Pattern::parse("user.*").unwrap(), handler, false);

        let event = Event::new(EventName::parse("user.created").unwrap(), None, None);
        driver.emit(&event).unwrap();
        let event = Event::new(EventName::parse("order.created").unwrap(), None, None);
        driver.emit(&event).unwrap();

        assert_eq!(*seen.lock(), vec!["user.created"]);
    }

    #[test]
    fn test_no_durable_support() {
        let registry = Arc::new(SubscriptionRegistry::new());
        assert!(!MemoryDriver::new(Arc::clone(&registry), false).supports_durable());
        assert!(MemoryDriver::new(registry, true).durable_as_regular());
    }
}
