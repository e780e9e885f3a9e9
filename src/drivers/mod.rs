//! Delivery drivers.
//!
//! A driver decides what happens to an emitted event beyond the in-process
//! registry: nothing (memory) or persistence plus decoupled durable delivery
//! (distributed). The facade selects one at construction time.

pub mod distributed;
pub mod memory;

use crate::error::{BusError, Result};
use crate::log::CompactionStats;
use crate::topics::Pattern;
use crate::types::{Event, Handler, RegistrationId, Timestamp};

pub use distributed::DistributedDriver;
pub use memory::MemoryDriver;

/// Capability interface implemented by both delivery backends.
pub trait Driver: Send + Sync {
    /// Deliver one event. Returns once the regular fan-out has run; durable
    /// fan-out (if any) is decoupled and not awaited here.
    fn emit(&self, event: &Event) -> Result<()>;

    /// Whether durable registrations get real at-least-once delivery.
    fn supports_durable(&self) -> bool;

    /// Whether `on_durable` should degrade to regular semantics instead of
    /// failing when durability is unsupported.
    fn durable_as_regular(&self) -> bool {
        false
    }

    /// Start the background delivery loop for one durable registration.
    fn start_durable_loop(
        &self,
        id: RegistrationId,
        pattern: Pattern,
        handler: Handler,
    ) -> Result<()> {
        let _ = (id, pattern, handler);
        Err(BusError::UnsupportedOperation(
            "this driver does not support durable subscriptions".into(),
        ))
    }

    /// Stop one durable loop promptly; never advances its cursor past the
    /// last successfully handled event.
    fn stop_durable_loop(&self, id: RegistrationId) {
        let _ = id;
    }

    /// Stop every durable loop. Called on teardown.
    fn stop_all_durable_loops(&self) {}

    /// Reclaim expired events from the backing store.
    fn compact(&self, now: Timestamp) -> Result<CompactionStats> {
        let _ = now;
        Err(BusError::UnsupportedOperation(
            "this driver has no persistent log to compact".into(),
        ))
    }
}
