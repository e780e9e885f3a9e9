//! Distributed driver: shared persistent log plus durable delivery loops.
//!
//! On emit the driver appends the event to the shared log and runs the same
//! regular fan-out as the memory driver. Durable consumers are decoupled from
//! the producer: each durable registration owns a background thread that
//! reads the log from its persisted cursor, filters by pattern match and
//! non-expiry, invokes the handler, and advances the cursor only after the
//! handler completes. A crash between handler completion and cursor
//! persistence redelivers the event on restart (at-least-once).

use super::Driver;
use crate::config::DistributedConfig;
use crate::cursors::CursorStore;
use crate::error::{BusError, Result};
use crate::log::{CompactionStats, EventLog};
use crate::registry::SubscriptionRegistry;
use crate::topics::Pattern;
use crate::types::{Event, Handler, RegistrationId, Timestamp};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Events read per log poll.
const BATCH_SIZE: usize = 64;

/// Shared-log delivery backend.
pub struct DistributedDriver {
    registry: Arc<SubscriptionRegistry>,
    log: Arc<EventLog>,
    cursors: Arc<CursorStore>,
    config: DistributedConfig,
    loops: Mutex<HashMap<RegistrationId, LoopHandle>>,
}

/// A running durable delivery loop.
struct LoopHandle {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

impl LoopHandle {
    fn stop(self) {
        let _ = self.shutdown.try_send(());
        // A handler may remove its own registration from inside the loop
        // thread; joining would deadlock on ourselves. The signalled loop
        // exits on its own once the handler returns.
        if thread::current().id() == self.thread.thread().id() {
            return;
        }
        let _ = self.thread.join();
    }
}

impl DistributedDriver {
    /// Open the shared store for one namespace and wire up the registry.
    pub fn open(config: DistributedConfig, registry: Arc<SubscriptionRegistry>) -> Result<Self> {
        config.validate()?;

        let dir = config.namespace_dir();
        let log = Arc::new(
            EventLog::open_with_sync_interval(&dir, config.sync_interval)
                .map_err(backend_unavailable)?,
        );
        let cursors = Arc::new(CursorStore::open(&dir).map_err(backend_unavailable)?);

        Ok(Self {
            registry,
            log,
            cursors,
            config,
            loops: Mutex::new(HashMap::new()),
        })
    }
}

impl Driver for DistributedDriver {
    fn emit(&self, event: &Event) -> Result<()> {
        // Persist before the local fan-out so a producer-side handler
        // failure can never lose the event for durable consumers.
        self.log.append(event).map_err(backend_unavailable)?;

        // Durable registrations are excluded here; their loops deliver.
        self.registry.dispatch(event, false);
        Ok(())
    }

    fn supports_durable(&self) -> bool {
        true
    }

    fn start_durable_loop(
        &self,
        id: RegistrationId,
        pattern: Pattern,
        handler: Handler,
    ) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = bounded(1);

        let worker = DurableLoop {
            log: Arc::clone(&self.log),
            cursors: Arc::clone(&self.cursors),
            service: self.config.service_name.clone(),
            pattern,
            handler,
            shutdown: shutdown_rx,
            poll_interval: self.config.poll_interval,
            backoff_min: self.config.retry_backoff_min,
            backoff_max: self.config.retry_backoff_max,
            handler_retry_max: self.config.handler_retry_max,
        };

        let thread = thread::Builder::new()
            .name(format!("herald-durable-{id}"))
            .spawn(move || worker.run())?;

        self.loops.lock().insert(
            id,
            LoopHandle {
                shutdown: shutdown_tx,
                thread,
            },
        );
        Ok(())
    }

    fn stop_durable_loop(&self, id: RegistrationId) {
        let handle = self.loops.lock().remove(&id);
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    fn stop_all_durable_loops(&self) {
        let handles: Vec<LoopHandle> = {
            let mut loops = self.loops.lock();
            loops.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop();
        }
    }

    fn compact(&self, now: Timestamp) -> Result<CompactionStats> {
        let (stats, remap) = self.log.compact(now).map_err(backend_unavailable)?;
        self.cursors
            .remap(|old| remap.map(old))
            .map_err(backend_unavailable)?;
        Ok(stats)
    }
}

impl Drop for DistributedDriver {
    fn drop(&mut self) {
        self.stop_all_durable_loops();
        if let Err(e) = self.log.sync() {
            tracing::warn!(error = %e, "final log sync failed");
        }
    }
}

fn backend_unavailable(e: BusError) -> BusError {
    match e {
        BusError::Io(io) => BusError::BackendUnavailable(io.to_string()),
        other => other,
    }
}

/// State of one durable registration's background loop.
struct DurableLoop {
    log: Arc<EventLog>,
    cursors: Arc<CursorStore>,
    service: String,
    pattern: Pattern,
    handler: Handler,
    shutdown: Receiver<()>,
    poll_interval: Duration,
    backoff_min: Duration,
    backoff_max: Duration,
    handler_retry_max: Option<u32>,
}

/// How one delivery attempt sequence ended.
enum DeliverOutcome {
    /// The handler completed; the cursor may advance.
    Delivered,
    /// The attempt cap was exhausted; the event is skipped and the cursor
    /// advances past it.
    GaveUp,
    /// Shutdown was requested mid-retry.
    Shutdown,
}

impl DurableLoop {
    fn run(self) {
        tracing::debug!(
            service = %self.service,
            pattern = %self.pattern,
            "durable loop started"
        );

        // A never-before-seen (service, pattern) pair starts at the oldest
        // retained event. That is what distinguishes durable from regular.
        let mut position = match self.initial_position() {
            Some(position) => position,
            None => return,
        };

        let mut skipped_since_persist = false;
        let mut read_backoff = self.backoff_min;

        'outer: loop {
            if self.shutdown_requested() {
                break;
            }

            let batch = match self.log.read_from(position, BATCH_SIZE) {
                Ok(batch) => {
                    read_backoff = self.backoff_min;
                    batch
                }
                Err(e) => {
                    tracing::warn!(
                        service = %self.service,
                        pattern = %self.pattern,
                        error = %e,
                        "event log unavailable, backing off"
                    );
                    if self.wait(read_backoff) {
                        break;
                    }
                    read_backoff = (read_backoff * 2).min(self.backoff_max);
                    continue;
                }
            };

            if batch.is_empty() {
                if skipped_since_persist && self.persist(position) {
                    skipped_since_persist = false;
                }
                if self.wait(self.poll_interval) {
                    break;
                }
                continue;
            }

            for (_offset, event, next) in batch {
                if self.shutdown_requested() {
                    break 'outer;
                }

                // Expired events are skipped, never delivered to a consumer
                // catching up; the cursor still advances past them.
                if event.is_expired(Timestamp::now()) {
                    tracing::trace!(
                        service = %self.service,
                        event = %event.name,
                        "skipping expired event"
                    );
                    position = next;
                    skipped_since_persist = true;
                    continue;
                }

                if !self.pattern.matches(&event.name) {
                    position = next;
                    skipped_since_persist = true;
                    continue;
                }

                match self.deliver(&event) {
                    DeliverOutcome::Delivered | DeliverOutcome::GaveUp => {}
                    DeliverOutcome::Shutdown => break 'outer,
                }
                // The cursor becomes authoritative only once persisted; a
                // crash before this point redelivers the event.
                if !self.persist(next) {
                    break 'outer;
                }
                position = next;
                skipped_since_persist = false;
            }
        }

        // Skip-only advancement is safe to flush on the way out: it never
        // moves the cursor past an unhandled matching event.
        if skipped_since_persist {
            let _ = self
                .cursors
                .advance(&self.service, self.pattern.as_str(), position);
        }

        tracing::debug!(
            service = %self.service,
            pattern = %self.pattern,
            "durable loop stopped"
        );
    }

    /// Load the persisted cursor, retrying while the backend is unavailable.
    /// `None` means shutdown was requested before it could be loaded.
    fn initial_position(&self) -> Option<u64> {
        let mut backoff = self.backoff_min;
        loop {
            match self.cursors.get(&self.service, self.pattern.as_str()) {
                Ok(Some(position)) => return Some(position),
                Ok(None) => return Some(0),
                Err(e) => {
                    tracing::warn!(
                        service = %self.service,
                        pattern = %self.pattern,
                        error = %e,
                        "cursor store unavailable, backing off"
                    );
                    if self.wait(backoff) {
                        return None;
                    }
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
    }

    /// Invoke the handler, retrying failures with backoff so the cursor is
    /// never advanced past an unhandled event. With a configured attempt
    /// cap, a persistently failing event is given up on after the cap so it
    /// cannot stall the subscription; the first attempt always happens.
    fn deliver(&self, event: &Event) -> DeliverOutcome {
        let mut backoff = self.backoff_min;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match (self.handler)(event.to_delivery()) {
                Ok(()) => return DeliverOutcome::Delivered,
                Err(e) => {
                    let err = BusError::HandlerExecution(e.to_string());
                    if let Some(max) = self.handler_retry_max {
                        if attempts >= max.max(1) {
                            tracing::error!(
                                service = %self.service,
                                pattern = %self.pattern,
                                event = %event.name,
                                attempts,
                                error = %err,
                                "durable handler exhausted its attempts, skipping event"
                            );
                            return DeliverOutcome::GaveUp;
                        }
                    }
                    tracing::error!(
                        service = %self.service,
                        pattern = %self.pattern,
                        event = %event.name,
                        error = %err,
                        "durable handler failed, event will be redelivered"
                    );
                    if self.wait(backoff) {
                        return DeliverOutcome::Shutdown;
                    }
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
    }

    /// Persist an advanced cursor, retrying while the backend is
    /// unavailable. Returns false on shutdown.
    fn persist(&self, position: u64) -> bool {
        let mut backoff = self.backoff_min;
        loop {
            match self
                .cursors
                .advance(&self.service, self.pattern.as_str(), position)
            {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(
                        service = %self.service,
                        pattern = %self.pattern,
                        error = %e,
                        "cursor persistence failed, backing off"
                    );
                    if self.wait(backoff) {
                        return false;
                    }
                    backoff = (backoff * 2).min(self.backoff_max);
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        matches!(
            self.shutdown.try_recv(),
            Ok(()) | Err(TryRecvError::Disconnected)
        )
    }

    /// Sleep for `duration`, waking early on shutdown. True means shutdown.
    fn wait(&self, duration: Duration) -> bool {
        match self.shutdown.recv_timeout(duration) {
            Ok(()) => true,
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}
