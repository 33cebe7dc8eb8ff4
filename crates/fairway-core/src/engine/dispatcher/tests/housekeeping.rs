use super::*;

#[test]
fn depth_cap_bounds_buffer_without_losing_order() {
    let mut config = test_config(1);
    config.max_queue_depth = Some(2);
    let source_config = MemorySourceConfig {
        visibility_timeout_ms: 40,
        ..Default::default()
    };
    let mut h = Harness::with_source(config, source_config);
    h.publish("A", 5);
    h.pump();
    assert_eq!(h.stats().queued_messages, 2);

    for _ in 0..500 {
        assert!(h.stats().queued_messages <= 2);
        if h.handled.len() == 5 {
            break;
        }
        if h.complete_next().is_none() {
            std::thread::sleep(Duration::from_millis(20));
            h.pump();
            h.fire_timers();
        }
    }
    assert_eq!(h.handled_for("A"), vec![1, 2, 3, 4, 5]);
}

#[test]
fn idle_empty_sessions_are_evicted_after_retention() {
    let mut config = test_config(2);
    config.session_retention_ms = Some(0);
    let mut h = Harness::new(config);
    h.publish("A", 1);
    h.publish("B", 3);
    h.pump();
    h.complete_next();
    assert_eq!(h.stats().sessions, 2);

    h.dispatcher.housekeeping();
    // B still has work, A is gone along with its lock
    assert_eq!(h.stats().sessions, 1);
    assert!(h.dispatcher.registry.get("A").is_none());
    assert_eq!(h.source.lock_epoch("A"), None);
    assert!(h.source.lock_epoch("B").is_some());
}

#[test]
fn retention_counts_from_going_idle_not_from_admission() {
    let mut config = test_config(1);
    config.session_retention_ms = Some(100);
    let mut h = Harness::new(config);
    h.publish("A", 1);
    h.pump();

    // Busy for longer than the retention window
    std::thread::sleep(Duration::from_millis(150));
    h.complete_next();
    assert_eq!(h.stats().idle_sessions, 1);

    h.dispatcher.housekeeping();
    assert!(h.dispatcher.registry.get("A").is_some(), "evicted right after going idle");

    std::thread::sleep(Duration::from_millis(150));
    h.dispatcher.housekeeping();
    assert!(h.dispatcher.registry.get("A").is_none());
}

#[test]
fn retention_disabled_keeps_sessions() {
    let mut config = test_config(2);
    config.session_retention_ms = None;
    let mut h = Harness::new(config);
    h.publish("A", 1);
    h.pump();
    h.run_to_idle(2);

    h.dispatcher.housekeeping();
    assert_eq!(h.stats().sessions, 1);
    assert_eq!(h.stats().idle_sessions, 1);
}

#[test]
fn drained_session_returns_its_lock() {
    let mut h = Harness::new(test_config(1));
    h.publish("A", 2);
    h.pump();
    assert!(h.source.lock_epoch("A").is_some());

    h.run_to_idle(1);
    assert_eq!(h.source.lock_epoch("A"), None);

    // New work takes a fresh lock
    h.publish("A", 1);
    h.pump();
    assert_eq!(h.running.len(), 1);
    assert!(h.source.lock_epoch("A").is_some());
}
