//! Core types for the event bus.

use crate::error::{BusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// This timestamp shifted forward by a duration, saturating at the
    /// representable maximum.
    pub fn plus(self, d: Duration) -> Self {
        let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }

    /// Whether this instant lies strictly before `other`.
    pub fn is_before(self, other: Timestamp) -> bool {
        self.0 < other.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A validated, dot-delimited hierarchical event name (e.g. `order.created`).
///
/// Names never contain wildcard characters; only patterns may.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    /// Longest permitted name in bytes. Persisted log records frame the
    /// name with a 16-bit length, so longer names cannot be stored.
    pub const MAX_LEN: usize = u16::MAX as usize;

    /// Parse and validate an event name.
    ///
    /// Rejects empty names, names over [`MAX_LEN`](Self::MAX_LEN) bytes,
    /// empty segments (leading/trailing/consecutive dots) and any segment
    /// containing a `*`.
    pub fn parse(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(BusError::invalid_name(name, "empty name"));
        }
        if name.len() > Self::MAX_LEN {
            return Err(BusError::invalid_name(
                name,
                format!("name is {} bytes, limit is {}", name.len(), Self::MAX_LEN),
            ));
        }
        for segment in name.split('.') {
            if segment.is_empty() {
                return Err(BusError::invalid_name(name, "empty segment"));
            }
            if segment.contains('*') {
                return Err(BusError::invalid_name(
                    name,
                    "wildcards are not allowed in event names",
                ));
            }
        }
        Ok(EventName(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate the dot-delimited segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl fmt::Debug for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventName({})", self.0)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable event as produced by `emit`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Hierarchical event name.
    pub name: EventName,

    /// Producer-assigned creation instant.
    pub timestamp: Timestamp,

    /// Expiry instant; `None` means the event never expires.
    pub expires_at: Option<Timestamp>,

    /// Opaque application payload. The bus never inspects its contents.
    pub data: Option<serde_json::Value>,
}

impl Event {
    /// Build a new event stamped with the current time.
    pub fn new(name: EventName, data: Option<serde_json::Value>, ttl: Option<Duration>) -> Self {
        let timestamp = Timestamp::now();
        Event {
            name,
            timestamp,
            expires_at: ttl.map(|d| timestamp.plus(d)),
            data,
        }
    }

    /// Whether the event has expired as of `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        match self.expires_at {
            Some(at) => at.is_before(now) || at == now,
            None => false,
        }
    }

    /// The envelope + payload shape handed to handlers.
    pub fn to_delivery(&self) -> Delivery {
        Delivery {
            event: EventMeta {
                name: self.name.clone(),
                timestamp: self.timestamp,
                expires_at: self.expires_at,
            },
            data: self.data.clone(),
        }
    }
}

/// Envelope metadata delivered to handlers (payload excluded).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub name: EventName,
    pub timestamp: Timestamp,
    pub expires_at: Option<Timestamp>,
}

/// What a handler receives on each invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delivery {
    pub event: EventMeta,
    pub data: Option<serde_json::Value>,
}

/// Completion signal returned by handlers.
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A subscriber callback. Identity (for `off`) is `Arc` pointer identity.
pub type Handler = Arc<dyn Fn(Delivery) -> HandlerResult + Send + Sync>;

/// Unique identifier for a registration within one registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

impl fmt::Debug for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RegistrationId({})", self.0)
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
