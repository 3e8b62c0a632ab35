//! Broker transport abstraction
//!
//! The connector never talks to `lapin` directly. It drives these object-safe
//! traits, which lets the event loop run against the real AMQP implementation
//! in [`amqp`] or against the in-memory broker in [`crate::testing`].
//!
//! Transports report everything that happens after a call returns (acks,
//! nacks, returned messages, closures) through a [`BrokerEvents`] sink. Each
//! sink is stamped with the connection and channel epoch it was handed out
//! for, so the event loop can discard events from connections it has already
//! abandoned.

use crate::connector::event_loop::LoopEvent;
use crate::connector::nodes::BrokerNode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod amqp;

pub use amqp::AmqpBroker;

/// Per-channel publish sequence number, starting at [`FIRST_DELIVERY_TAG`]
pub type DeliveryTag = u64;

/// Tag assigned to the first publish on a fresh channel
pub const FIRST_DELIVERY_TAG: DeliveryTag = 1;

/// Transport-level failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Connection to {node} failed: {reason}")]
    ConnectionFailed { node: String, reason: String },
    #[error("Authentication failed for {node}: {reason}")]
    AuthenticationFailed { node: String, reason: String },
    #[error("Channel error: {0}")]
    ChannelFailed(String),
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Timed out after {timeout:?} while {operation}")]
    Timeout { operation: String, timeout: Duration },
    #[error("Invalid broker node: {0}")]
    InvalidNode(String),
    #[error("Close failed: {0}")]
    CloseFailed(String),
}

impl BrokerError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, BrokerError::AuthenticationFailed { .. })
    }
}

/// Why a channel went away
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCloseReason {
    /// We closed it ourselves
    ByPublisher,
    /// Broker closed it because the target exchange does not exist
    NoSuchExchange(String),
    Other(String),
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    ByPublisher,
    Unexpected(String),
}

/// A message the broker accepted but could not route to any queue
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnedMessage {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Asynchronous notifications from a connection or channel
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Ack { tag: DeliveryTag, multiple: bool },
    Nack { tag: DeliveryTag, multiple: bool },
    Returned(ReturnedMessage),
    ChannelClosed(ChannelCloseReason),
    ConnectionClosed(CloseReason),
    /// Error callback for a connection that may or may not have opened
    ConnectionError(BrokerError),
}

impl BrokerEvent {
    /// Events that only make sense for the channel that produced them
    pub fn is_channel_scoped(&self) -> bool {
        matches!(
            self,
            BrokerEvent::Ack { .. }
                | BrokerEvent::Nack { .. }
                | BrokerEvent::Returned(_)
                | BrokerEvent::ChannelClosed(_)
        )
    }
}

/// Event sink handed to transports, stamped with the epoch it belongs to
#[derive(Debug, Clone)]
pub struct BrokerEvents {
    sender: mpsc::UnboundedSender<LoopEvent>,
    connection: u64,
    channel: Option<u64>,
}

impl BrokerEvents {
    pub(crate) fn for_connection(sender: mpsc::UnboundedSender<LoopEvent>, connection: u64) -> Self {
        Self {
            sender,
            connection,
            channel: None,
        }
    }

    pub(crate) fn for_channel(&self, channel: u64) -> Self {
        Self {
            sender: self.sender.clone(),
            connection: self.connection,
            channel: Some(channel),
        }
    }

    /// A sink whose events go nowhere, for one-shot checks
    pub fn detached() -> Self {
        let (sender, _) = mpsc::unbounded_channel();
        Self::for_connection(sender, 0)
    }

    pub fn connection_epoch(&self) -> u64 {
        self.connection
    }

    pub fn channel_epoch(&self) -> Option<u64> {
        self.channel
    }

    /// Deliver an event; returns false once the event loop is gone
    pub fn emit(&self, event: BrokerEvent) -> bool {
        self.sender
            .send(LoopEvent::Broker {
                connection: self.connection,
                channel: self.channel,
                event,
            })
            .is_ok()
    }

    pub fn ack(&self, tag: DeliveryTag, multiple: bool) -> bool {
        self.emit(BrokerEvent::Ack { tag, multiple })
    }

    pub fn nack(&self, tag: DeliveryTag, multiple: bool) -> bool {
        self.emit(BrokerEvent::Nack { tag, multiple })
    }

    pub fn returned(&self, message: ReturnedMessage) -> bool {
        self.emit(BrokerEvent::Returned(message))
    }

    pub fn channel_closed(&self, reason: ChannelCloseReason) -> bool {
        self.emit(BrokerEvent::ChannelClosed(reason))
    }

    pub fn connection_closed(&self, reason: CloseReason) -> bool {
        self.emit(BrokerEvent::ConnectionClosed(reason))
    }

    pub fn connection_error(&self, error: BrokerError) -> bool {
        self.emit(BrokerEvent::ConnectionError(error))
    }
}

/// Entry point of a transport: opens connections to broker nodes
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    async fn connect(
        &self,
        node: &BrokerNode,
        events: BrokerEvents,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

/// An open connection to one broker node
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel whose events are reported through `events`
    async fn open_channel(&self, events: BrokerEvents)
        -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// A channel on an open connection
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Switch the channel to publisher-confirm mode
    async fn enable_confirms(&self) -> Result<(), BrokerError>;

    /// Publish one message; the outcome arrives later as an ack, nack or return
    /// for `delivery_tag`
    async fn publish(
        &self,
        delivery_tag: DeliveryTag,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// One-shot connectivity check: connect, open a confirm channel, close again
pub async fn check_connectivity(
    broker: &dyn Broker,
    node: &BrokerNode,
    timeout: Duration,
) -> Result<(), BrokerError> {
    let attempt = async {
        let events = BrokerEvents::detached();
        let connection = broker.connect(node, events.clone()).await?;
        let channel = connection.open_channel(events.for_channel(0)).await?;
        let confirmed = channel.enable_confirms().await;
        let _ = channel.close().await;
        connection.close().await?;
        confirmed
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| BrokerError::Timeout {
            operation: format!("checking {}", node.display_name()),
            timeout,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_stamped_with_epochs() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = BrokerEvents::for_connection(tx, 7).for_channel(3);

        assert!(events.ack(1, false));

        match rx.try_recv() {
            Ok(LoopEvent::Broker {
                connection,
                channel,
                event,
            }) => {
                assert_eq!(connection, 7);
                assert_eq!(channel, Some(3));
                assert_eq!(
                    event,
                    BrokerEvent::Ack {
                        tag: 1,
                        multiple: false
                    }
                );
            }
            _ => panic!("expected a broker event"),
        }
    }

    #[test]
    fn test_detached_sink_reports_closed_loop() {
        let events = BrokerEvents::detached();
        assert!(!events.ack(1, false));
    }

    #[test]
    fn test_authentication_error_detection() {
        let auth = BrokerError::AuthenticationFailed {
            node: "rabbit:5672".to_string(),
            reason: "ACCESS_REFUSED".to_string(),
        };
        let refused = BrokerError::ConnectionFailed {
            node: "rabbit:5672".to_string(),
            reason: "connection refused".to_string(),
        };

        assert!(auth.is_authentication());
        assert!(!refused.is_authentication());
    }
}
