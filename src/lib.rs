//! # Herald
//!
//! A publish/subscribe event bus with hierarchical wildcard topic matching,
//! pluggable delivery drivers, per-event TTL, and durable (at-least-once,
//! resumable) subscriptions for consumers that may be offline when an event
//! is produced.
//!
//! ## Core Concepts
//!
//! - **Patterns**: dot-segmented subscriptions where `*` matches one segment
//!   and a trailing `**` matches a whole subtree
//! - **Drivers**: in-process memory delivery, or a shared persistent log
//!   with cross-process durable fan-out
//! - **Cursors**: per-service positions into the shared log, persisted so a
//!   durable subscriber resumes exactly where it left off
//! - **TTL**: expired events are skipped for consumers catching up late
//!
//! ## Example
//!
//! ```ignore
//! use herald::{BusConfig, EventBus};
//! use std::sync::Arc;
//!
//! let bus = EventBus::new(BusConfig::memory())?;
//!
//! bus.on("order.*", Arc::new(|delivery| {
//!     println!("got {}", delivery.event.name);
//!     Ok(())
//! }))?;
//!
//! bus.emit("order.created", Some(serde_json::json!({ "id": 42 })))?;
//! ```

pub mod bus;
pub mod config;
pub mod cursors;
pub mod drivers;
pub mod error;
pub mod log;
pub mod registry;
pub mod topics;
pub mod types;

// Re-exports
pub use bus::EventBus;
pub use config::{BusConfig, DistributedConfig, DriverConfig};
pub use cursors::CursorStore;
pub use drivers::{DistributedDriver, Driver, MemoryDriver};
pub use error::{BusError, Result};
pub use log::{CompactionStats, EventLog};
pub use registry::{RemovedRegistration, SubscriptionRegistry};
pub use topics::Pattern;
pub use types::{
    Delivery, Event, EventMeta, EventName, Handler, HandlerResult, RegistrationId, Timestamp,
};
