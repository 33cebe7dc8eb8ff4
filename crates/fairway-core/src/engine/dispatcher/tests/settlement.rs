use super::*;

#[test]
fn dead_lettered_message_is_dequeued_and_session_moves_on() {
    let mut h = Harness::new(test_config(1));
    h.publish("A", 2);
    h.pump();

    let poison = h.running.pop_front().unwrap();
    h.source
        .dead_letter(&poison.lock.token(), &poison.lease, "poison")
        .unwrap();
    h.report(
        &poison,
        SlotOutcome::DeadLettered {
            reason: "poison".to_string(),
        },
    );

    assert_eq!(h.running.front().unwrap().message.sequence_id, 2);
    h.run_to_idle(1);
    assert_eq!(h.handled_for("A"), vec![2]);

    let totals = h.stats().totals;
    assert_eq!(totals.dead_lettered, 1);
    assert_eq!(totals.completed, 1);
    assert_eq!(h.source.dead_letters().len(), 1);
}

#[test]
fn duplicate_report_is_ignored() {
    let mut h = Harness::new(test_config(2));
    h.publish("A", 2);
    h.pump();

    let first = h.running.pop_front().unwrap();
    h.source
        .complete(&first.lock.token(), &first.lease)
        .unwrap();
    h.report(&first, SlotOutcome::Completed);
    let after_first = h.stats();

    h.report(&first, SlotOutcome::Completed);
    let after_second = h.stats();

    assert_eq!(after_second.totals.completed, 1);
    assert_eq!(after_second.totals.duplicates, 1);
    assert_eq!(after_second.queued_messages, after_first.queued_messages);
    assert_eq!(after_second.slots_in_use, 1);
}

#[test]
fn failed_session_waits_while_others_proceed() {
    let mut h = Harness::new(test_config(1));
    h.publish("A", 2);
    h.publish("B", 1);
    h.pump();

    // A fails; until the source redelivers, B gets the slot
    h.fail_next();
    assert_eq!(h.running.front().unwrap().message.session_key, "B");
    h.run_to_idle(1);

    assert_eq!(h.handled_for("A"), vec![1, 2]);
    assert_eq!(h.stats().totals.abandoned, 1);
}

#[test]
fn lost_lease_keeps_message_for_redelivery() {
    let mut h = Harness::new(test_config(1));
    h.publish("A", 2);
    h.pump();

    let head = h.running.pop_front().unwrap();
    h.report(&head, SlotOutcome::LeaseLost);
    // Head lease is gone, so nothing is dispatched until the source re-offers it
    assert!(h.running.is_empty());
    assert_eq!(h.stats().queued_messages, 2);

    h.source.abandon(&head.lease).unwrap();
    h.run_to_idle(1);
    assert_eq!(h.handled_for("A"), vec![1, 2]);
}

#[test]
fn stats_reply_over_control_channel() {
    let mut h = Harness::new(test_config(4));
    h.publish("A", 3);
    h.publish("B", 1);
    h.pump();

    let (tx, rx) = tokio::sync::oneshot::channel();
    h.dispatcher
        .handle_command(ControlCommand::GetStats { reply: tx });
    let stats = rx.blocking_recv().unwrap();
    assert_eq!(stats.sessions, 2);
    assert_eq!(stats.active_sessions, 2);
    assert_eq!(stats.queued_messages, 4);
    assert_eq!(stats.slot_capacity, 4);
}
