//! Bus configuration.
//!
//! Configuration is loaded once at startup and fixed for the process
//! lifetime; the selected driver never changes at runtime.

use crate::error::{BusError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level bus configuration.
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub driver: DriverConfig,
}

impl BusConfig {
    /// In-process delivery only, durable subscriptions rejected.
    pub fn memory() -> Self {
        Self {
            driver: DriverConfig::Memory {
                durable_as_regular: false,
            },
        }
    }

    /// Shared persistent log with durable subscriptions.
    pub fn distributed(config: DistributedConfig) -> Self {
        Self {
            driver: DriverConfig::Distributed(config),
        }
    }
}

/// Which delivery backend to construct.
#[derive(Clone, Debug)]
pub enum DriverConfig {
    /// Synchronous in-process fan-out; nothing persisted.
    Memory {
        /// Opt-in: let `on_durable` silently degrade to regular semantics
        /// instead of failing with `UnsupportedOperation`.
        durable_as_regular: bool,
    },

    /// Shared append-only log with per-service cursors.
    Distributed(DistributedConfig),
}

/// Configuration for the distributed driver.
///
/// The backing store is addressed by filesystem location plus a logical
/// namespace index; `service_name` identifies this consumer group and
/// namespaces its cursors.
#[derive(Clone, Debug)]
pub struct DistributedConfig {
    /// Root of the shared store.
    pub path: PathBuf,

    /// Logical namespace index within the store.
    pub namespace: u32,

    /// Consumer-group identity for cursor namespacing. Required.
    pub service_name: String,

    /// How often durable loops poll the log for new events.
    pub poll_interval: Duration,

    /// Initial backoff after a handler failure or unavailable backend.
    pub retry_backoff_min: Duration,

    /// Backoff ceiling.
    pub retry_backoff_max: Duration,

    /// Cap on delivery attempts per event for durable handlers. Once
    /// exhausted the event is skipped and the cursor advances, so one
    /// poison event cannot stall a subscription forever. `None` retries
    /// indefinitely.
    pub handler_retry_max: Option<u32>,

    /// Sync the shared log every N appends. 1 syncs every append; larger
    /// values trade crash durability of recent appends for throughput.
    pub sync_interval: u64,
}

impl DistributedConfig {
    pub fn new(path: impl Into<PathBuf>, service_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            namespace: 0,
            service_name: service_name.into(),
            poll_interval: Duration::from_millis(25),
            retry_backoff_min: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(5),
            handler_retry_max: None,
            sync_interval: 1,
        }
    }

    pub fn with_namespace(mut self, namespace: u32) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry_backoff_min = min;
        self.retry_backoff_max = max;
        self
    }

    pub fn with_handler_retry_max(mut self, max: u32) -> Self {
        self.handler_retry_max = Some(max);
        self
    }

    pub fn with_sync_interval(mut self, interval: u64) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Directory holding this namespace's log and cursors.
    pub fn namespace_dir(&self) -> PathBuf {
        self.path.join(format!("ns-{}", self.namespace))
    }

    /// Reject configurations that cannot name cursor files safely.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(BusError::InvalidConfig(
                "distributed driver requires a non-empty service_name".into(),
            ));
        }
        let ok = self
            .service_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !ok {
            return Err(BusError::InvalidConfig(format!(
                "service_name {:?} may only contain alphanumerics, '-', '_' and '.'",
                self.service_name
            )));
        }
        Ok(())
    }
}
