//! Durable subscription tests against the distributed driver.
//!
//! These exercise the shared-log backend end to end: offline catch-up,
//! resume-from-cursor across restarts, per-service cursor independence,
//! read-time TTL enforcement, redelivery on handler failure, and log
//! compaction.

use herald::{
    BusConfig, DistributedConfig, Event, EventBus, EventLog, EventName, Handler, Timestamp,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(dir: &TempDir, service: &str) -> DistributedConfig {
    DistributedConfig::new(dir.path(), service)
        .with_poll_interval(Duration::from_millis(5))
        .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(50))
}

fn bus(dir: &TempDir, service: &str) -> EventBus {
    EventBus::new(BusConfig::distributed(config(dir, service))).unwrap()
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}

fn recording_handler(seen: &Arc<Mutex<Vec<String>>>) -> Handler {
    let seen = Arc::clone(seen);
    Arc::new(move |delivery| {
        seen.lock().push(delivery.event.name.to_string());
        Ok(())
    })
}

#[test]
fn test_durable_subscriber_catches_up_on_offline_events() {
    let dir = TempDir::new().unwrap();

    // Producer emits while no consumer is running.
    {
        let producer = bus(&dir, "producer");
        producer.emit("order.created", Some(json!({"id": 1}))).unwrap();
        producer.emit("order.paid", Some(json!({"id": 1}))).unwrap();
        producer.emit("user.created", None).unwrap();
    }

    // A first-time durable subscriber starts from the oldest retained
    // event, not from "now".
    let consumer = bus(&dir, "billing");
    let seen = Arc::new(Mutex::new(Vec::new()));
    consumer
        .on_durable("order.**", recording_handler(&seen))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 2));
    assert_eq!(*seen.lock(), vec!["order.created", "order.paid"]);
}

#[test]
fn test_durable_subscriber_resumes_from_cursor_after_restart() {
    let dir = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    // First run: consume one event, then shut down.
    {
        let consumer = bus(&dir, "billing");
        consumer
            .on_durable("order.**", recording_handler(&seen))
            .unwrap();
        consumer.emit("order.one", None).unwrap();
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
    }

    // Emitted while the consumer is down.
    {
        let producer = bus(&dir, "producer");
        producer.emit("order.two", None).unwrap();
    }

    // Second run resumes exactly where it left off: no reprocessing of
    // order.one, no skipping of order.two.
    {
        let consumer = bus(&dir, "billing");
        consumer
            .on_durable("order.**", recording_handler(&seen))
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 2));
    }

    assert_eq!(*seen.lock(), vec!["order.one", "order.two"]);
}

#[test]
fn test_services_maintain_independent_cursors() {
    let dir = TempDir::new().unwrap();

    let bus_a = bus(&dir, "serviceA");
    let bus_b = bus(&dir, "serviceB");

    // serviceA's handler crashes twice before succeeding, forcing
    // redelivery of the same event to it.
    let a_attempts = Arc::new(Mutex::new(0usize));
    let a_attempts_clone = Arc::clone(&a_attempts);
    bus_a
        .on_durable(
            "order.created",
            Arc::new(move |_| {
                let mut attempts = a_attempts_clone.lock();
                *attempts += 1;
                if *attempts < 3 {
                    Err("transient crash".into())
                } else {
                    Ok(())
                }
            }),
        )
        .unwrap();

    let b_seen = Arc::new(Mutex::new(Vec::new()));
    bus_b
        .on_durable("order.created", recording_handler(&b_seen))
        .unwrap();

    bus_a.emit("order.created", None).unwrap();

    // serviceB advances independently and is unaffected by serviceA's
    // redeliveries; it sees the event exactly once.
    assert!(wait_until(Duration::from_secs(5), || b_seen.lock().len() == 1));
    assert!(wait_until(Duration::from_secs(5), || *a_attempts.lock() == 3));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(b_seen.lock().len(), 1);
    assert_eq!(*a_attempts.lock(), 3);
}

#[test]
fn test_expired_events_skipped_but_cursor_advances() {
    let dir = TempDir::new().unwrap();

    // Seed the namespace log directly with one already-expired event
    // followed by a live one.
    {
        let log = EventLog::open(dir.path().join("ns-0")).unwrap();
        log.append(&Event {
            name: EventName::parse("order.stale").unwrap(),
            timestamp: Timestamp(0),
            expires_at: Some(Timestamp(1)),
            data: None,
        })
        .unwrap();
        log.append(&Event::new(
            EventName::parse("order.fresh").unwrap(),
            None,
            None,
        ))
        .unwrap();
    }

    let consumer = bus(&dir, "billing");
    let seen = Arc::new(Mutex::new(Vec::new()));
    consumer
        .on_durable("order.**", recording_handler(&seen))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
    assert_eq!(*seen.lock(), vec!["order.fresh"]);

    // The cursor advanced past the expired event: a re-subscription after
    // restart delivers nothing new.
    drop(consumer);
    let consumer = bus(&dir, "billing");
    consumer
        .on_durable("order.**", recording_handler(&seen))
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock(), vec!["order.fresh"]);
}

#[test]
fn test_unexpired_ttl_event_is_delivered() {
    let dir = TempDir::new().unwrap();

    {
        let producer = bus(&dir, "producer");
        producer
            .emit_with_ttl("order.created", Some(json!({"id": 7})), 1)
            .unwrap();
    }

    // Catching up well within the TTL window.
    let consumer = bus(&dir, "billing");
    let seen = Arc::new(Mutex::new(Vec::new()));
    consumer
        .on_durable("order.created", recording_handler(&seen))
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
}

#[test]
fn test_regular_and_durable_paths_both_deliver_once() {
    let dir = TempDir::new().unwrap();
    let consumer = bus(&dir, "billing");

    let regular = Arc::new(Mutex::new(0usize));
    let regular_clone = Arc::clone(&regular);
    consumer
        .on(
            "order.*",
            Arc::new(move |_| {
                *regular_clone.lock() += 1;
                Ok(())
            }),
        )
        .unwrap();

    let durable = Arc::new(Mutex::new(0usize));
    let durable_clone = Arc::clone(&durable);
    consumer
        .on_durable(
            "order.*",
            Arc::new(move |_| {
                *durable_clone.lock() += 1;
                Ok(())
            }),
        )
        .unwrap();

    consumer.emit("order.created", None).unwrap();

    // Regular fan-out completes within emit; durable arrives via its loop.
    assert_eq!(*regular.lock(), 1);
    assert!(wait_until(Duration::from_secs(5), || *durable.lock() == 1));

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(*regular.lock(), 1);
    assert_eq!(*durable.lock(), 1);
}

#[test]
fn test_poison_event_skipped_after_attempt_cap() {
    let dir = TempDir::new().unwrap();
    let consumer = EventBus::new(BusConfig::distributed(
        config(&dir, "billing").with_handler_retry_max(2),
    ))
    .unwrap();

    let attempts = Arc::new(Mutex::new(0usize));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let attempts_clone = Arc::clone(&attempts);
    let seen_clone = Arc::clone(&seen);
    consumer
        .on_durable(
            "order.**",
            Arc::new(move |delivery| {
                if delivery.event.name.as_str() == "order.poison" {
                    *attempts_clone.lock() += 1;
                    return Err("cannot process".into());
                }
                seen_clone.lock().push(delivery.event.name.to_string());
                Ok(())
            }),
        )
        .unwrap();

    consumer.emit("order.poison", None).unwrap();
    consumer.emit("order.good", None).unwrap();

    // The poison event is attempted up to the cap, then skipped so the
    // subscription keeps flowing.
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
    assert_eq!(*seen.lock(), vec!["order.good"]);
    assert_eq!(*attempts.lock(), 2);
    drop(consumer);

    // The cursor advanced past the skipped event: a restart never sees it.
    let consumer = bus(&dir, "billing");
    let attempts_clone = Arc::clone(&attempts);
    consumer
        .on_durable(
            "order.**",
            Arc::new(move |delivery| {
                if delivery.event.name.as_str() == "order.poison" {
                    *attempts_clone.lock() += 1;
                }
                Ok(())
            }),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*attempts.lock(), 2);
}

#[test]
fn test_handler_can_remove_its_own_registration() {
    let dir = TempDir::new().unwrap();
    let consumer = Arc::new(bus(&dir, "billing"));

    // The handler needs the bus to unsubscribe itself; filled in after
    // registration.
    let bus_slot: Arc<Mutex<Option<Arc<EventBus>>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(0usize));

    let bus_slot_clone = Arc::clone(&bus_slot);
    let seen_clone = Arc::clone(&seen);
    consumer
        .on_durable(
            "order.once",
            Arc::new(move |_| {
                *seen_clone.lock() += 1;
                if let Some(bus) = bus_slot_clone.lock().take() {
                    bus.remove_all_listeners(Some("order.once"))?;
                }
                Ok(())
            }),
        )
        .unwrap();
    *bus_slot.lock() = Some(Arc::clone(&consumer));

    // Unsubscribing from inside the handler must not deadlock the loop
    // thread on itself.
    consumer.emit("order.once", None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        consumer.listener_count("order.once") == 0
    }));

    // The loop wound down; later events are not delivered.
    consumer.emit("order.once", None).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock(), 1);
}

#[test]
fn test_off_stops_durable_loop_promptly() {
    let dir = TempDir::new().unwrap();
    let consumer = bus(&dir, "billing");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = recording_handler(&seen);
    consumer.on_durable("order.**", Arc::clone(&handler)).unwrap();

    consumer.emit("order.one", None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));

    consumer.off("order.**", &handler).unwrap();
    assert_eq!(consumer.listener_count("order.**"), 0);

    consumer.emit("order.two", None).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock(), vec!["order.one"]);
}

#[test]
fn test_compaction_reclaims_expired_and_preserves_positions() {
    let dir = TempDir::new().unwrap();

    // One expired record sandwiched between live ones.
    {
        let log = EventLog::open(dir.path().join("ns-0")).unwrap();
        log.append(&Event::new(EventName::parse("order.a").unwrap(), None, None))
            .unwrap();
        log.append(&Event {
            name: EventName::parse("order.stale").unwrap(),
            timestamp: Timestamp(0),
            expires_at: Some(Timestamp(1)),
            data: None,
        })
        .unwrap();
        log.append(&Event::new(EventName::parse("order.b").unwrap(), None, None))
            .unwrap();
    }

    let consumer = bus(&dir, "billing");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler = recording_handler(&seen);
    consumer.on_durable("order.**", Arc::clone(&handler)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 2));

    // Quiesce the consumer before maintenance.
    consumer.off("order.**", &handler).unwrap();

    let stats = consumer.compact().unwrap();
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.retained, 2);

    // The remapped cursor still marks everything as consumed.
    consumer
        .on_durable("order.**", recording_handler(&seen))
        .unwrap();
    consumer.emit("order.c", None).unwrap();
    assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 3));
    assert_eq!(*seen.lock(), vec!["order.a", "order.b", "order.c"]);
}

#[test]
fn test_dropping_bus_stops_loops() {
    let dir = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    {
        let consumer = bus(&dir, "billing");
        consumer
            .on_durable("order.**", recording_handler(&seen))
            .unwrap();
        consumer.emit("order.one", None).unwrap();
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 1));
        // Drop joins the loops.
    }

    {
        let producer = bus(&dir, "producer");
        producer.emit("order.two", None).unwrap();
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(*seen.lock(), vec!["order.one"]);
}
