//! In-process subscription registry.
//!
//! Owns the process-wide table of pattern registrations. Initialized empty,
//! torn down on drop or `remove_all`. Registration order within a pattern
//! defines handler invocation order; patterns are dispatched in the order
//! they were first registered.

use crate::topics::Pattern;
use crate::types::{Event, Handler, RegistrationId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One handler bound to one pattern.
struct Registration {
    id: RegistrationId,
    handler: Handler,
    durable: bool,
}

/// All registrations sharing one pattern string.
struct PatternEntry {
    pattern: Pattern,
    registrations: Vec<Registration>,
}

/// Identity of a registration removed from the registry.
///
/// Returned so the active driver can tear down any durable delivery loop
/// associated with the registration.
#[derive(Clone, Copy, Debug)]
pub struct RemovedRegistration {
    pub id: RegistrationId,
    pub durable: bool,
}

/// Maps patterns to ordered handler registrations.
pub struct SubscriptionRegistry {
    /// Pattern entries in first-registration order.
    entries: RwLock<Vec<PatternEntry>>,
    /// Counter for generating registration IDs.
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a registration for `pattern`.
    pub fn add(&self, pattern: Pattern, handler: Handler, durable: bool) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let registration = Registration {
            id,
            handler,
            durable,
        };

        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.pattern == pattern) {
            Some(entry) => entry.registrations.push(registration),
            None => entries.push(PatternEntry {
                pattern,
                registrations: vec![registration],
            }),
        }
        id
    }

    /// Remove the first registration matching both pattern string and
    /// handler identity. No-op if absent.
    pub fn remove(&self, pattern: &str, handler: &Handler) -> Option<RemovedRegistration> {
        let mut entries = self.entries.write();
        let entry_idx = entries.iter().position(|e| e.pattern.as_str() == pattern)?;
        let entry = &mut entries[entry_idx];

        let reg_idx = entry
            .registrations
            .iter()
            .position(|r| Arc::ptr_eq(&r.handler, handler))?;
        let removed = entry.registrations.remove(reg_idx);

        if entry.registrations.is_empty() {
            entries.remove(entry_idx);
        }

        Some(RemovedRegistration {
            id: removed.id,
            durable: removed.durable,
        })
    }

    /// Remove a registration by ID, wherever it lives.
    pub fn remove_id(&self, id: RegistrationId) -> Option<RemovedRegistration> {
        let mut entries = self.entries.write();
        for entry_idx in 0..entries.len() {
            if let Some(reg_idx) = entries[entry_idx]
                .registrations
                .iter()
                .position(|r| r.id == id)
            {
                let removed = entries[entry_idx].registrations.remove(reg_idx);
                if entries[entry_idx].registrations.is_empty() {
                    entries.remove(entry_idx);
                }
                return Some(RemovedRegistration {
                    id: removed.id,
                    durable: removed.durable,
                });
            }
        }
        None
    }

    /// Clear one pattern's registrations, or the entire registry.
    pub fn remove_all(&self, pattern: Option<&str>) -> Vec<RemovedRegistration> {
        let mut entries = self.entries.write();
        let mut removed = Vec::new();

        match pattern {
            Some(pattern) => {
                if let Some(idx) = entries.iter().position(|e| e.pattern.as_str() == pattern) {
                    let entry = entries.remove(idx);
                    removed.extend(entry.registrations.iter().map(|r| RemovedRegistration {
                        id: r.id,
                        durable: r.durable,
                    }));
                }
            }
            None => {
                for entry in entries.drain(..) {
                    removed.extend(entry.registrations.iter().map(|r| RemovedRegistration {
                        id: r.id,
                        durable: r.durable,
                    }));
                }
            }
        }

        removed
    }

    /// Registered pattern strings in first-registration order, each once.
    pub fn patterns(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|e| e.pattern.as_str().to_string())
            .collect()
    }

    /// Number of registrations whose pattern string equals `pattern` exactly.
    /// This is exact string comparison, not wildcard evaluation.
    pub fn count(&self, pattern: &str) -> usize {
        self.entries
            .read()
            .iter()
            .find(|e| e.pattern.as_str() == pattern)
            .map(|e| e.registrations.len())
            .unwrap_or(0)
    }

    /// Total registrations across all patterns.
    pub fn total(&self) -> usize {
        self.entries
            .read()
            .iter()
            .map(|e| e.registrations.len())
            .sum()
    }

    /// Invoke every matching handler for `event`, in registration order,
    /// once per matching pattern.
    ///
    /// Handler failures are isolated: a failing handler never prevents the
    /// remaining handlers from running. Failures are reported through the
    /// `tracing` side channel.
    ///
    /// When `include_durable` is false, durable registrations are skipped;
    /// the distributed driver delivers to those through their own loops.
    pub fn dispatch(&self, event: &Event, include_durable: bool) {
        // Snapshot matching handlers so dispatch never holds the lock while
        // user code runs (a handler may re-enter the registry).
        let matched: Vec<(String, Vec<Handler>)> = {
            let entries = self.entries.read();
            entries
                .iter()
                .filter(|e| e.pattern.matches(&event.name))
                .map(|e| {
                    let handlers = e
                        .registrations
                        .iter()
                        .filter(|r| include_durable || !r.durable)
                        .map(|r| Arc::clone(&r.handler))
                        .collect();
                    (e.pattern.as_str().to_string(), handlers)
                })
                .collect()
        };

        for (pattern, handlers) in matched {
            for handler in handlers {
                let delivery = event.to_delivery();
                if let Err(e) = handler(delivery) {
                    let err = crate::error::BusError::HandlerExecution(e.to_string());
                    tracing::error!(
                        event = %event.name,
                        pattern = %pattern,
                        error = %err,
                        "handler failed during dispatch"
                    );
                }
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
