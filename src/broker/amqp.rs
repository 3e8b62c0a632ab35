//! AMQP 0-9-1 transport on top of `lapin`

use super::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerEvents, ChannelCloseReason,
    CloseReason, DeliveryTag, ReturnedMessage,
};
use crate::connector::nodes::BrokerNode;
use crate::error::sanitize_error_message;
use lapin::message::BasicReturnMessage;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::ShortString;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, warn};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const JSON_CONTENT_TYPE: &str = "application/json";

/// Broker that opens real AMQP connections
#[derive(Debug, Default, Clone)]
pub struct AmqpBroker {
    properties_name: Option<String>,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name announced to the broker as the connection name
    pub fn with_connection_name<S: Into<String>>(mut self, name: S) -> Self {
        self.properties_name = Some(name.into());
        self
    }

    fn connection_properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.properties_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        node: &BrokerNode,
        events: BrokerEvents,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let uri = node.amqp_uri()?;
        debug!(node = %node.display_name(), "Opening AMQP connection");

        let connection = Connection::connect(uri.as_str(), self.connection_properties())
            .await
            .map_err(|e| classify_connect_failure(&node.display_name(), &e.to_string()))?;

        let error_events = events.clone();
        connection.on_error(move |e| {
            let reason = sanitize_error_message(&e.to_string());
            warn!("AMQP connection error: {}", reason);
            error_events.connection_closed(CloseReason::Unexpected(reason));
        });

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait::async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(
        &self,
        events: BrokerEvents,
    ) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelFailed(sanitize_error_message(&e.to_string())))?;
        Ok(Arc::new(AmqpChannel { channel, events }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "closed by publisher")
            .await
            .map_err(|e| BrokerError::CloseFailed(sanitize_error_message(&e.to_string())))
    }
}

struct AmqpChannel {
    channel: Channel,
    events: BrokerEvents,
}

fn message_properties() -> BasicProperties {
    let timestamp = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default();
    BasicProperties::default()
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_content_type(JSON_CONTENT_TYPE.into())
        .with_message_id(ShortString::from(uuid::Uuid::new_v4().to_string()))
        .with_timestamp(timestamp)
}

fn returned_message(message: &BasicReturnMessage) -> ReturnedMessage {
    ReturnedMessage {
        reply_code: message.reply_code,
        reply_text: message.reply_text.to_string(),
        exchange: message.delivery.exchange.to_string(),
        routing_key: message.delivery.routing_key.to_string(),
        body: message.delivery.data.clone(),
    }
}

#[async_trait::async_trait]
impl BrokerChannel for AmqpChannel {
    async fn enable_confirms(&self) -> Result<(), BrokerError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ChannelFailed(sanitize_error_message(&e.to_string())))
    }

    async fn publish(
        &self,
        delivery_tag: DeliveryTag,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let options = BasicPublishOptions {
            mandatory: true,
            ..BasicPublishOptions::default()
        };
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, body, message_properties())
            .await
            .map_err(|e| BrokerError::PublishFailed(sanitize_error_message(&e.to_string())))?;

        let events = self.events.clone();
        let exchange = exchange.to_string();
        tokio::spawn(async move {
            match confirm.await {
                // A returned message is followed by an ack; it is handled as a return only
                Ok(Confirmation::Ack(Some(message))) | Ok(Confirmation::Nack(Some(message))) => {
                    events.returned(returned_message(&message));
                    events.ack(delivery_tag, false);
                }
                Ok(Confirmation::Ack(None)) | Ok(Confirmation::NotRequested) => {
                    events.ack(delivery_tag, false);
                }
                Ok(Confirmation::Nack(None)) => {
                    events.nack(delivery_tag, false);
                }
                Err(e) => {
                    let reason = classify_channel_failure(&exchange, &e.to_string());
                    debug!(delivery_tag, ?reason, "Publisher confirm failed");
                    events.channel_closed(reason);
                }
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "closed by publisher")
            .await
            .map_err(|e| BrokerError::CloseFailed(sanitize_error_message(&e.to_string())))
    }
}

/// True when a broker error text reports refused credentials
pub fn is_access_refused(message: &str) -> bool {
    let upper = message.to_ascii_uppercase();
    upper.contains("ACCESS_REFUSED")
        || upper.contains("ACCESSREFUSED")
        || upper.contains("ACCESS-REFUSED")
        || upper.contains("AUTHENTICATION")
}

/// Map a failed connection attempt to an authentication or connection error
pub fn classify_connect_failure(node: &str, message: &str) -> BrokerError {
    let reason = sanitize_error_message(message);
    if is_access_refused(message) {
        BrokerError::AuthenticationFailed {
            node: node.to_string(),
            reason,
        }
    } else {
        BrokerError::ConnectionFailed {
            node: node.to_string(),
            reason,
        }
    }
}

/// Work out why a channel died from the error it reported
pub fn classify_channel_failure(exchange: &str, message: &str) -> ChannelCloseReason {
    let upper = message.to_ascii_uppercase();
    let missing_exchange = (upper.contains("NOT_FOUND") || upper.contains("NOTFOUND"))
        && upper.contains("EXCHANGE");
    if missing_exchange {
        ChannelCloseReason::NoSuchExchange(exchange.to_string())
    } else {
        ChannelCloseReason::Other(sanitize_error_message(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_refused_detection() {
        assert!(is_access_refused(
            "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN"
        ));
        assert!(is_access_refused("protocol error: AMQPError { kind: Soft(ACCESSREFUSED) }"));
        assert!(!is_access_refused("Connection refused (os error 111)"));
    }

    #[test]
    fn test_connect_failure_classification() {
        let auth = classify_connect_failure("rabbit:5672", "ACCESS_REFUSED - Login was refused");
        assert!(auth.is_authentication());

        let refused = classify_connect_failure("rabbit:5672", "Connection refused (os error 111)");
        assert!(matches!(refused, BrokerError::ConnectionFailed { ref node, .. } if node == "rabbit:5672"));
    }

    #[test]
    fn test_missing_exchange_is_detected() {
        let reason = classify_channel_failure(
            "pid.events",
            "NOT_FOUND - no exchange 'pid.events' in vhost '/'",
        );
        assert_eq!(
            reason,
            ChannelCloseReason::NoSuchExchange("pid.events".to_string())
        );
    }

    #[test]
    fn test_other_channel_failures() {
        let reason = classify_channel_failure("pid.events", "PRECONDITION_FAILED - unknown delivery tag 7");
        assert!(matches!(reason, ChannelCloseReason::Other(text) if text.contains("PRECONDITION_FAILED")));

        let reason = classify_channel_failure("pid.events", "NOT_FOUND - no queue 'handles'");
        assert!(matches!(reason, ChannelCloseReason::Other(_)));
    }

    #[test]
    fn test_message_properties_are_persistent_json() {
        let properties = message_properties();
        assert_eq!(*properties.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            properties.content_type().as_ref().map(|t| t.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert!(properties.message_id().is_some());
    }
}
