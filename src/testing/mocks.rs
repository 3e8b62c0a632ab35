//! In-memory broker for exercising the connector without RabbitMQ
//!
//! [`MockBroker`] records every connection attempt and publish, and can be
//! scripted per host to refuse connections, reject credentials or hang. It
//! confirms publishes itself unless auto-acking is turned off, in which case
//! tests drive acks and nacks by hand.

use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerEvents, ChannelCloseReason,
    CloseReason, DeliveryTag, ReturnedMessage,
};
use crate::connector::nodes::BrokerNode;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Reply code the broker uses for unroutable mandatory messages
pub const NO_ROUTE: u16 = 312;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// How the mock answers a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accept,
    Refuse,
    RejectCredentials,
    /// Never answer; the caller's timeout decides
    Hang,
}

/// One message as the mock broker received it
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    pub connection: usize,
    pub channel: usize,
    pub delivery_tag: DeliveryTag,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

impl PublishRecord {
    pub fn json(&self) -> serde_json::Value {
        crate::message::decode_body(&self.body)
    }
}

#[derive(Debug)]
struct ConnectionRecord {
    host: String,
    events: BrokerEvents,
    open: bool,
    closed_by_publisher: bool,
}

#[derive(Debug)]
struct ChannelRecord {
    connection: usize,
    events: BrokerEvents,
    open: bool,
    confirms: bool,
    unconfirmed: Vec<DeliveryTag>,
}

#[derive(Debug)]
struct BrokerState {
    default_outcome: ConnectOutcome,
    host_outcomes: HashMap<String, ConnectOutcome>,
    scripted: HashMap<String, VecDeque<ConnectOutcome>>,
    connect_attempts: Vec<String>,
    connections: Vec<ConnectionRecord>,
    channels: Vec<ChannelRecord>,
    published: Vec<PublishRecord>,
    auto_ack: bool,
    missing_exchanges: HashSet<String>,
    unroutable_keys: HashSet<String>,
    failing_publishes: u32,
    failing_channel_opens: u32,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            default_outcome: ConnectOutcome::Accept,
            host_outcomes: HashMap::new(),
            scripted: HashMap::new(),
            connect_attempts: Vec::new(),
            connections: Vec::new(),
            channels: Vec::new(),
            published: Vec::new(),
            auto_ack: true,
            missing_exchanges: HashSet::new(),
            unroutable_keys: HashSet::new(),
            failing_publishes: 0,
            failing_channel_opens: 0,
        }
    }
}

impl BrokerState {
    fn outcome_for(&mut self, host: &str) -> ConnectOutcome {
        if let Some(outcome) = self.scripted.get_mut(host).and_then(VecDeque::pop_front) {
            return outcome;
        }
        self.host_outcomes
            .get(host)
            .copied()
            .unwrap_or(self.default_outcome)
    }

    fn latest_open_channel(&self) -> Option<usize> {
        self.channels.iter().rposition(|c| c.open)
    }
}

type SharedState = Arc<Mutex<BrokerState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scriptable in-memory broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: SharedState,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every attempt to `host` with `outcome`
    pub fn set_host_outcome(&self, host: &str, outcome: ConnectOutcome) {
        lock(&self.state)
            .host_outcomes
            .insert(host.to_string(), outcome);
    }

    /// Answer the next attempts to `host` in order, then fall back to its usual outcome
    pub fn script_host<I>(&self, host: &str, outcomes: I)
    where
        I: IntoIterator<Item = ConnectOutcome>,
    {
        lock(&self.state)
            .scripted
            .entry(host.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn set_default_outcome(&self, outcome: ConnectOutcome) {
        lock(&self.state).default_outcome = outcome;
    }

    pub fn set_auto_ack(&self, auto_ack: bool) {
        lock(&self.state).auto_ack = auto_ack;
    }

    /// Publishes to `exchange` close the channel as if the exchange did not exist
    pub fn remove_exchange(&self, exchange: &str) {
        lock(&self.state)
            .missing_exchanges
            .insert(exchange.to_string());
    }

    /// Publishes with `routing_key` come back as unroutable
    pub fn make_unroutable(&self, routing_key: &str) {
        lock(&self.state)
            .unroutable_keys
            .insert(routing_key.to_string());
    }

    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.state).failing_publishes = count;
    }

    pub fn fail_next_channel_opens(&self, count: u32) {
        lock(&self.state).failing_channel_opens = count;
    }

    /// Hosts in the order connections were attempted
    pub fn connect_attempts(&self) -> Vec<String> {
        lock(&self.state).connect_attempts.clone()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        lock(&self.state).published.clone()
    }

    pub fn published_routing_keys(&self) -> Vec<String> {
        lock(&self.state)
            .published
            .iter()
            .map(|p| p.routing_key.clone())
            .collect()
    }

    /// Host of every connection that was opened, in order
    pub fn opened_connections(&self) -> Vec<String> {
        lock(&self.state)
            .connections
            .iter()
            .map(|c| c.host.clone())
            .collect()
    }

    pub fn open_connection_count(&self) -> usize {
        lock(&self.state).connections.iter().filter(|c| c.open).count()
    }

    pub fn connections_closed_by_publisher(&self) -> usize {
        lock(&self.state)
            .connections
            .iter()
            .filter(|c| c.closed_by_publisher)
            .count()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.state).channels.len()
    }

    /// Delivery tags published on the newest open channel and not yet confirmed
    pub fn unconfirmed_tags(&self) -> Vec<DeliveryTag> {
        let state = lock(&self.state);
        state
            .latest_open_channel()
            .map(|index| state.channels[index].unconfirmed.clone())
            .unwrap_or_default()
    }

    pub fn ack_on_channel(&self, channel: usize, tag: DeliveryTag, multiple: bool) -> bool {
        let mut state = lock(&self.state);
        let Some(record) = state.channels.get_mut(channel) else {
            return false;
        };
        record
            .unconfirmed
            .retain(|t| if multiple { *t > tag } else { *t != tag });
        record.events.ack(tag, multiple)
    }

    pub fn nack_on_channel(&self, channel: usize, tag: DeliveryTag, multiple: bool) -> bool {
        let mut state = lock(&self.state);
        let Some(record) = state.channels.get_mut(channel) else {
            return false;
        };
        record
            .unconfirmed
            .retain(|t| if multiple { *t > tag } else { *t != tag });
        record.events.nack(tag, multiple)
    }

    /// Confirm everything outstanding on the newest open channel with one multiple ack
    pub fn ack_outstanding(&self) -> bool {
        let channel = lock(&self.state).latest_open_channel();
        let Some(channel) = channel else {
            return false;
        };
        let Some(highest) = self.unconfirmed_tags().into_iter().max() else {
            return false;
        };
        self.ack_on_channel(channel, highest, true)
    }

    pub fn nack_latest(&self, tag: DeliveryTag) -> bool {
        let channel = lock(&self.state).latest_open_channel();
        channel.is_some_and(|channel| self.nack_on_channel(channel, tag, false))
    }

    /// Kill the newest open connection as a network failure would
    pub fn drop_connection(&self) -> bool {
        let mut state = lock(&self.state);
        let Some(index) = state.connections.iter().rposition(|c| c.open) else {
            return false;
        };
        state.connections[index].open = false;
        for channel in state.channels.iter_mut().filter(|c| c.connection == index) {
            channel.open = false;
        }
        state.connections[index]
            .events
            .connection_closed(CloseReason::Unexpected("connection reset by peer".to_string()))
    }

    /// Poll until `condition` holds or `timeout` passes
    pub fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&MockBroker) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn wait_for_publishes(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |broker| broker.published().len() >= count)
    }

    pub fn wait_for_open_connection(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |broker| broker.open_connection_count() > 0)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn connect(
        &self,
        node: &BrokerNode,
        events: BrokerEvents,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let outcome = {
            let mut state = lock(&self.state);
            state.connect_attempts.push(node.host.clone());
            state.outcome_for(&node.host)
        };

        match outcome {
            ConnectOutcome::Accept => {
                let mut state = lock(&self.state);
                state.connections.push(ConnectionRecord {
                    host: node.host.clone(),
                    events,
                    open: true,
                    closed_by_publisher: false,
                });
                Ok(Arc::new(MockConnection {
                    state: Arc::clone(&self.state),
                    index: state.connections.len() - 1,
                }))
            }
            ConnectOutcome::Refuse => Err(BrokerError::ConnectionFailed {
                node: node.display_name(),
                reason: "connection refused".to_string(),
            }),
            ConnectOutcome::RejectCredentials => Err(BrokerError::AuthenticationFailed {
                node: node.display_name(),
                reason: "ACCESS_REFUSED - Login was refused".to_string(),
            }),
            ConnectOutcome::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug)]
pub struct MockConnection {
    state: SharedState,
    index: usize,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(
        &self,
        events: BrokerEvents,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut state = lock(&self.state);
        if !state.connections[self.index].open {
            return Err(BrokerError::ChannelFailed("connection is closed".to_string()));
        }
        if state.failing_channel_opens > 0 {
            state.failing_channel_opens -= 1;
            return Err(BrokerError::ChannelFailed("channel open refused".to_string()));
        }

        state.channels.push(ChannelRecord {
            connection: self.index,
            events,
            open: true,
            confirms: false,
            unconfirmed: Vec::new(),
        });
        Ok(Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            index: state.channels.len() - 1,
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let record = &mut state.connections[self.index];
        if record.open {
            record.open = false;
            record.closed_by_publisher = true;
        }
        let index = self.index;
        for channel in state.channels.iter_mut().filter(|c| c.connection == index) {
            channel.open = false;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MockChannel {
    state: SharedState,
    index: usize,
}

impl MockChannel {
    /// A standalone confirm channel whose events go nowhere
    pub fn detached() -> Self {
        let state = BrokerState {
            channels: vec![ChannelRecord {
                connection: 0,
                events: BrokerEvents::detached(),
                open: true,
                confirms: true,
                unconfirmed: Vec::new(),
            }],
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            index: 0,
        }
    }

    /// Messages published on this channel
    pub fn published(&self) -> Vec<PublishRecord> {
        lock(&self.state)
            .published
            .iter()
            .filter(|p| p.channel == self.index)
            .cloned()
            .collect()
    }

    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.state).failing_publishes = count;
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        let record = &mut state.channels[self.index];
        if !record.open {
            return Err(BrokerError::ChannelFailed("channel is closed".to_string()));
        }
        record.confirms = true;
        Ok(())
    }

    async fn publish(
        &self,
        delivery_tag: DeliveryTag,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if !state.channels[self.index].open {
            return Err(BrokerError::PublishFailed("channel is closed".to_string()));
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::PublishFailed("simulated publish failure".to_string()));
        }

        let connection = state.channels[self.index].connection;
        state.published.push(PublishRecord {
            connection,
            channel: self.index,
            delivery_tag,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
        });

        let missing_exchange = state.missing_exchanges.contains(exchange);
        let unroutable = state.unroutable_keys.contains(routing_key);
        let auto_ack = state.auto_ack;
        let record = &mut state.channels[self.index];

        if missing_exchange {
            record.open = false;
            record
                .events
                .channel_closed(ChannelCloseReason::NoSuchExchange(exchange.to_string()));
        } else if unroutable {
            record.events.returned(ReturnedMessage {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
            });
            record.events.ack(delivery_tag, false);
        } else if auto_ack && record.confirms {
            record.events.ack(delivery_tag, false);
        } else {
            record.unconfirmed.push(delivery_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.state).channels[self.index].open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::nodes::{Credentials, TrustLevel};

    fn node(host: &str) -> BrokerNode {
        BrokerNode::new(
            Credentials::new("guest", "guest"),
            host,
            "pid.events",
            TrustLevel::Trusted,
        )
    }

    #[tokio::test]
    async fn test_scripted_outcomes_come_first() {
        let broker = MockBroker::new();
        broker.set_host_outcome("rabbit-1", ConnectOutcome::Refuse);
        broker.script_host("rabbit-1", [ConnectOutcome::RejectCredentials]);

        let first = broker.connect(&node("rabbit-1"), BrokerEvents::detached()).await;
        let second = broker.connect(&node("rabbit-1"), BrokerEvents::detached()).await;

        assert!(matches!(first, Err(ref e) if e.is_authentication()));
        assert!(matches!(second, Err(BrokerError::ConnectionFailed { .. })));
        assert_eq!(broker.connect_attempts(), vec!["rabbit-1", "rabbit-1"]);
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_publishes() {
        let broker = MockBroker::new();
        let events = BrokerEvents::detached();
        let connection = broker.connect(&node("rabbit-1"), events.clone()).await.unwrap();
        let channel = connection.open_channel(events.for_channel(1)).await.unwrap();
        channel.enable_confirms().await.unwrap();

        channel.publish(1, "pid.events", "a", b"{}").await.unwrap();
        connection.close().await.unwrap();

        assert!(channel.publish(2, "pid.events", "a", b"{}").await.is_err());
        assert_eq!(broker.published().len(), 1);
        assert_eq!(broker.connections_closed_by_publisher(), 1);
    }

    #[tokio::test]
    async fn test_manual_acks_track_outstanding_tags() {
        let broker = MockBroker::new();
        broker.set_auto_ack(false);
        let events = BrokerEvents::detached();
        let connection = broker.connect(&node("rabbit-1"), events.clone()).await.unwrap();
        let channel = connection.open_channel(events.for_channel(1)).await.unwrap();
        channel.enable_confirms().await.unwrap();

        for tag in 1..=3 {
            channel.publish(tag, "pid.events", "a", b"{}").await.unwrap();
        }
        assert_eq!(broker.unconfirmed_tags(), vec![1, 2, 3]);

        broker.ack_on_channel(0, 2, true);
        assert_eq!(broker.unconfirmed_tags(), vec![3]);
    }
}
