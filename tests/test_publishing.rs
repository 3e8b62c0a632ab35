//! Publishing behaviour against the in-memory broker
//!
//! Covers ordering, exactly-once delivery, publish failures, nacks, returned
//! messages and the fallback exchange.


use pid_connector::connector::ConnectionState;
use pid_connector::message::{EMERGENCY_ROUTING_KEY, ORIGINAL_ROUTING_KEY_FIELD};
use pid_connector::testing::MockBroker;
use serde_json::json;
use std::collections::HashSet;
use test_helpers::{
    available_connector, fast_settings, message, routing_keys, started_connector, EXCHANGE, WAIT,
};

#[test]
fn test_messages_are_published_once_in_fifo_order() {
    let broker = MockBroker::new();
    let connector = available_connector(&broker);

    for n in 0..50 {
        connector.enqueue_message(message(n)).unwrap();
    }
    connector.finish_gracefully().unwrap();

    let expected: Vec<String> = (0..50).map(|n| format!("key.{n}")).collect();
    assert_eq!(broker.published_routing_keys(), expected);
    assert!(broker.published().iter().all(|p| p.exchange == EXCHANGE));

    let snapshot = connector.state();
    assert_eq!(snapshot.state, ConnectionState::PermanentlyUnavailable);
    assert!(snapshot.closed_by_publisher);
    assert!(!connector.any_leftovers());
    assert_eq!(broker.connections_closed_by_publisher(), 1);
}

#[test]
fn test_concurrent_producers_keep_their_own_order() {
    let broker = MockBroker::new();
    let connector = available_connector(&broker);

    std::thread::scope(|scope| {
        for producer in 0..4 {
            let connector = &connector;
            scope.spawn(move || {
                for n in 0..25 {
                    connector
                        .enqueue(&format!("producer.{producer}"), &json!({ "n": n }))
                        .unwrap();
                }
            });
        }
    });
    connector.finish_gracefully().unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 100);
    for producer in 0..4 {
        let key = format!("producer.{producer}");
        let sequence: Vec<i64> = published
            .iter()
            .filter(|p| p.routing_key == key)
            .filter_map(|p| p.json()["n"].as_i64())
            .collect();
        assert_eq!(sequence, (0..25).collect::<Vec<_>>(), "order broken for {key}");
    }
    assert!(!connector.any_leftovers());
}

#[test]
fn test_failed_publishes_are_retried_without_loss_or_duplicates() {
    let broker = MockBroker::new();
    let connector = available_connector(&broker);
    broker.fail_next_publishes(2);

    connector.enqueue_many((1..=5).map(message)).unwrap();
    assert!(broker.wait_for_publishes(5, WAIT));
    connector.finish_gracefully().unwrap();

    assert_eq!(
        broker.published_routing_keys(),
        vec!["key.1", "key.2", "key.3", "key.4", "key.5"]
    );
    assert!(!connector.any_leftovers());
}

#[test]
fn test_nacked_message_is_published_again() {
    let broker = MockBroker::new();
    broker.set_auto_ack(false);
    let connector = available_connector(&broker);

    connector.enqueue_many((1..=3).map(message)).unwrap();
    assert!(broker.wait_for_publishes(3, WAIT));

    broker.nack_latest(2);
    assert!(broker.wait_for_publishes(4, WAIT));

    let republished = &broker.published()[3];
    assert_eq!(republished.routing_key, "key.2");
    assert_eq!(republished.delivery_tag, 4);

    assert!(broker.ack_outstanding());
    connector.finish_gracefully().unwrap();

    assert_eq!(connector.state().state, ConnectionState::PermanentlyUnavailable);
    assert!(!connector.any_leftovers());
}

#[test]
fn test_unroutable_message_is_rerouted_once() {
    let broker = MockBroker::new();
    broker.make_unroutable("handle.unknown");
    let connector = available_connector(&broker);

    connector
        .enqueue("handle.unknown", &json!({ "handle": "21.T11148/x" }))
        .unwrap();
    assert!(broker.wait_for_publishes(2, WAIT));
    connector.finish_gracefully().unwrap();

    let published = broker.published();
    assert_eq!(published.len(), 2);
    assert_eq!(published[1].routing_key, EMERGENCY_ROUTING_KEY);
    let body = published[1].json();
    assert_eq!(body[ORIGINAL_ROUTING_KEY_FIELD], "handle.unknown");
    assert_eq!(body["handle"], "21.T11148/x");

    let summary = connector.summary().unwrap();
    assert_eq!(summary.rerouted, 1);
    assert_eq!(summary.dropped, 0);
    assert!(!connector.any_leftovers());
}

#[test]
fn test_message_returned_from_emergency_route_is_dropped() {
    let broker = MockBroker::new();
    broker.make_unroutable("handle.unknown");
    broker.make_unroutable(EMERGENCY_ROUTING_KEY);
    let connector = available_connector(&broker);

    connector
        .enqueue("handle.unknown", &json!({ "handle": "21.T11148/y" }))
        .unwrap();
    assert!(broker.wait_for_publishes(2, WAIT));
    connector.finish_gracefully().unwrap();

    // Never a third attempt
    assert_eq!(broker.published().len(), 2);
    let summary = connector.summary().unwrap();
    assert_eq!(summary.rerouted, 1);
    assert_eq!(summary.dropped, 1);
    assert!(!connector.any_leftovers());
}

#[test]
fn test_missing_exchange_switches_to_fallback() {
    let broker = MockBroker::new();
    broker.remove_exchange(EXCHANGE);
    let connector = available_connector(&broker);

    connector.enqueue_many((1..=3).map(message)).unwrap();
    assert!(broker.wait_until(WAIT, |b| {
        b.published().iter().filter(|p| p.exchange == "FALLBACK").count() >= 3
    }));
    connector.finish_gracefully().unwrap();

    let published = broker.published();
    assert_eq!(published[0].exchange, EXCHANGE);

    let fallback: Vec<_> = published.iter().filter(|p| p.exchange == "FALLBACK").collect();
    let keys: Vec<&str> = fallback.iter().map(|p| p.routing_key.as_str()).collect();
    assert_eq!(keys, vec!["key.1", "key.2", "key.3"]);
    let tags: Vec<u64> = fallback.iter().map(|p| p.delivery_tag).collect();
    assert_eq!(tags, vec![1, 2, 3]);

    let unique: HashSet<_> = fallback.iter().map(|p| p.routing_key.clone()).collect();
    assert_eq!(unique.len(), 3);
    assert!(!connector.any_leftovers());
    assert_eq!(broker.channel_count(), 2);
}

#[test]
fn test_missing_fallback_exchange_gives_up_after_max_sweeps() {
    let broker = MockBroker::new();
    broker.remove_exchange(EXCHANGE);
    broker.remove_exchange("FALLBACK");
    let settings = fast_settings();
    let max_sweeps = settings.max_sweeps as usize;
    let connector = started_connector(&broker, settings);

    connector.enqueue_message(message(1)).unwrap();
    assert!(broker.wait_until(WAIT, |_| connector.is_finished()));

    let snapshot = connector.state();
    assert_eq!(snapshot.state, ConnectionState::PermanentlyUnavailable);
    assert!(snapshot.could_not_connect);
    assert!(!snapshot.closed_by_publisher);

    // Bounded by the sweep limit instead of reconnecting in a tight loop
    let opened = broker.opened_connections().len();
    assert!(opened >= 1 && opened <= max_sweeps + 1, "opened {opened} connections");
    assert!(broker.published().len() <= 2 * (max_sweeps + 1));

    assert_eq!(routing_keys(&connector.get_leftovers().unwrap()), vec!["key.1"]);
}

#[test]
fn test_channel_that_keeps_refusing_publishes_is_not_retried_forever() {
    let broker = MockBroker::new();
    broker.fail_next_publishes(u32::MAX);
    let settings = fast_settings();
    let max_sweeps = settings.max_sweeps as usize;
    let connector = started_connector(&broker, settings);

    connector.enqueue_message(message(1)).unwrap();
    assert!(broker.wait_until(WAIT, |_| connector.is_finished()));

    let snapshot = connector.state();
    assert_eq!(snapshot.state, ConnectionState::PermanentlyUnavailable);
    assert!(snapshot.could_not_connect);
    assert!(broker.opened_connections().len() <= max_sweeps + 1);
    assert!(broker.published().is_empty());
    assert_eq!(routing_keys(&connector.get_leftovers().unwrap()), vec!["key.1"]);
}

#[test]
fn test_confirms_for_unknown_tags_are_ignored() {
    let broker = MockBroker::new();
    broker.set_auto_ack(false);
    let connector = available_connector(&broker);

    connector.enqueue_message(message(1)).unwrap();
    assert!(broker.wait_for_publishes(1, WAIT));

    assert!(broker.ack_on_channel(0, 99, false));
    assert!(broker.nack_on_channel(0, 42, false));
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(broker.published().len(), 1);

    assert!(broker.ack_outstanding());
    connector.finish_gracefully().unwrap();
    assert_eq!(connector.state().state, ConnectionState::PermanentlyUnavailable);
    assert!(!connector.any_leftovers());
}
