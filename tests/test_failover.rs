//! Node failover, reconnection and exhaustion
//!
//! Tests focus on the order nodes are tried in, what happens when all of them
//! fail, and how a dropped connection is recovered without losing messages.


use pid_connector::connector::{AsynchronousConnector, ConnectionState};
use pid_connector::error::ConnectorError;
use pid_connector::testing::{ConnectOutcome, MockBroker};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{fast_settings, message, node, routing_keys, WAIT};

fn connector_for(broker: &MockBroker) -> AsynchronousConnector {
    AsynchronousConnector::new(fast_settings(), Arc::new(broker.clone()))
}

#[test]
fn test_nodes_are_tried_by_priority_then_given_up() {
    let broker = MockBroker::new();
    broker.set_default_outcome(ConnectOutcome::Refuse);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-3").priority("3")).unwrap();
    connector.add_trusted_node(node("rabbit-1").priority("1")).unwrap();
    connector.add_trusted_node(node("rabbit-2").priority("2")).unwrap();
    connector.start().unwrap();

    assert!(broker.wait_until(WAIT, |_| connector.is_finished()));

    assert_eq!(
        broker.connect_attempts(),
        vec!["rabbit-1", "rabbit-2", "rabbit-3", "rabbit-1", "rabbit-2", "rabbit-3"]
    );
    let snapshot = connector.state();
    assert_eq!(snapshot.state, ConnectionState::PermanentlyUnavailable);
    assert!(snapshot.could_not_connect);
    assert!(!snapshot.authentication_failed);
    assert!(!snapshot.closed_by_publisher);
}

#[test]
fn test_trusted_nodes_come_before_open_nodes() {
    let broker = MockBroker::new();
    broker.set_default_outcome(ConnectOutcome::Refuse);

    let mut connector = connector_for(&broker);
    connector.add_open_node(node("open-1").priority("1")).unwrap();
    connector.add_trusted_node(node("trusted-9").priority("9")).unwrap();
    connector.add_trusted_node(node("trusted-10").priority("10")).unwrap();
    connector.start().unwrap();

    assert!(broker.wait_until(WAIT, |_| connector.is_finished()));
    let attempts = broker.connect_attempts();
    assert_eq!(&attempts[..3], &["trusted-9", "trusted-10", "open-1"]);
}

#[test]
fn test_enqueue_after_exhaustion_reports_could_not_connect() {
    let broker = MockBroker::new();
    broker.set_default_outcome(ConnectOutcome::Refuse);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1")).unwrap();
    connector.start().unwrap();
    assert!(broker.wait_until(WAIT, |_| connector.is_finished()));

    let error = connector.enqueue_message(message(1)).unwrap_err();
    assert!(matches!(
        error,
        ConnectorError::CouldNotConnect {
            authentication_failed: false
        }
    ));
    assert!(connector.get_leftovers().unwrap().is_empty());
}

#[test]
fn test_rejected_credentials_are_reported() {
    let broker = MockBroker::new();
    broker.set_default_outcome(ConnectOutcome::RejectCredentials);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1")).unwrap();
    connector.add_open_node(node("rabbit-2")).unwrap();
    connector.start().unwrap();
    assert!(broker.wait_until(WAIT, |_| connector.is_finished()));

    let snapshot = connector.state();
    assert!(snapshot.could_not_connect);
    assert!(snapshot.authentication_failed);

    let error = connector.enqueue_message(message(1)).unwrap_err();
    assert!(error.to_string().contains("authentication failed"));
}

#[test]
fn test_messages_queued_while_connecting_survive_exhaustion() {
    let broker = MockBroker::new();
    broker.set_default_outcome(ConnectOutcome::Refuse);
    broker.script_host("rabbit-1", [ConnectOutcome::Hang]);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1")).unwrap();
    connector.start().unwrap();
    connector.enqueue_many((1..=3).map(message)).unwrap();

    assert!(broker.wait_until(WAIT, |_| connector.is_finished()));
    let leftovers = connector.get_leftovers().unwrap();
    assert_eq!(routing_keys(&leftovers), vec!["key.1", "key.2", "key.3"]);
    assert!(broker.published().is_empty());
}

#[test]
fn test_failover_to_second_node() {
    let broker = MockBroker::new();
    broker.set_host_outcome("rabbit-1", ConnectOutcome::Refuse);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1").priority("1")).unwrap();
    connector.add_trusted_node(node("rabbit-2").priority("2")).unwrap();
    connector.start().unwrap();
    assert!(connector.wait_until_available(WAIT));

    connector.enqueue_message(message(1)).unwrap();
    connector.finish_gracefully().unwrap();

    assert_eq!(broker.opened_connections(), vec!["rabbit-2"]);
    assert_eq!(broker.published_routing_keys(), vec!["key.1"]);
    assert!(!connector.any_leftovers());
}

#[test]
fn test_hanging_node_times_out() {
    let broker = MockBroker::new();
    broker.set_host_outcome("rabbit-1", ConnectOutcome::Hang);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1").priority("1")).unwrap();
    connector.add_trusted_node(node("rabbit-2").priority("2")).unwrap();
    connector.start().unwrap();

    assert!(connector.wait_until_available(WAIT));
    assert_eq!(broker.connect_attempts(), vec!["rabbit-1", "rabbit-2"]);
    connector.force_finish().unwrap();
}

#[test]
fn test_lost_connection_republishes_unconfirmed_with_fresh_tags() {
    let broker = MockBroker::new();
    broker.set_auto_ack(false);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1")).unwrap();
    connector.start().unwrap();
    assert!(connector.wait_until_available(WAIT));

    connector.enqueue_many((1..=2).map(message)).unwrap();
    assert!(broker.wait_for_publishes(2, WAIT));

    assert!(broker.drop_connection());
    assert!(broker.wait_for_publishes(4, WAIT));

    let published = broker.published();
    let replay: Vec<_> = published[2..]
        .iter()
        .map(|p| (p.channel, p.delivery_tag, p.routing_key.as_str()))
        .collect();
    assert_eq!(replay, vec![(1, 1, "key.1"), (1, 2, "key.2")]);

    assert!(broker.ack_outstanding());
    connector.finish_gracefully().unwrap();
    assert_eq!(connector.state().state, ConnectionState::PermanentlyUnavailable);
    assert!(!connector.any_leftovers());
    assert_eq!(broker.opened_connections().len(), 2);
}

#[test]
fn test_acks_from_abandoned_channel_are_ignored() {
    let broker = MockBroker::new();
    broker.set_auto_ack(false);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1")).unwrap();
    connector.start().unwrap();
    assert!(connector.wait_until_available(WAIT));

    connector.enqueue_many((1..=2).map(message)).unwrap();
    assert!(broker.wait_for_publishes(2, WAIT));
    assert!(broker.drop_connection());
    assert!(broker.wait_for_publishes(4, WAIT));

    // Tags 1 and 2 exist on the new channel too, but this ack is for the old one
    broker.ack_on_channel(0, 2, true);
    std::thread::sleep(Duration::from_millis(50));
    connector.force_finish().unwrap();

    let leftovers = connector.get_leftovers().unwrap();
    assert_eq!(routing_keys(&leftovers), vec!["key.1", "key.2"]);
}

#[test]
fn test_force_finish_during_retry_loop_stops_retries() {
    let broker = MockBroker::new();
    broker.set_default_outcome(ConnectOutcome::Refuse);
    let mut settings = fast_settings();
    settings.max_sweeps = 1000;

    let mut connector = AsynchronousConnector::new(settings, Arc::new(broker.clone()));
    connector.add_trusted_node(node("rabbit-1")).unwrap();
    connector.start().unwrap();
    connector.enqueue_message(message(1)).unwrap();
    assert!(broker.wait_until(WAIT, |b| b.connect_attempts().len() >= 3));

    connector.force_finish().unwrap();
    let attempts = broker.connect_attempts().len();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(broker.connect_attempts().len(), attempts);

    let snapshot = connector.state();
    assert_eq!(snapshot.state, ConnectionState::ForceFinished);
    assert!(!snapshot.could_not_connect);
    assert_eq!(routing_keys(&connector.get_leftovers().unwrap()), vec!["key.1"]);
}

#[test]
fn test_failed_channel_open_is_retried_on_a_new_connection() {
    let broker = MockBroker::new();
    broker.fail_next_channel_opens(1);

    let mut connector = connector_for(&broker);
    connector.add_trusted_node(node("rabbit-1")).unwrap();
    connector.start().unwrap();
    assert!(connector.wait_until_available(WAIT));

    connector.enqueue_message(message(1)).unwrap();
    connector.finish_gracefully().unwrap();

    assert_eq!(broker.opened_connections().len(), 2);
    assert_eq!(broker.published_routing_keys(), vec!["key.1"]);
    assert!(!connector.state().could_not_connect);
}
