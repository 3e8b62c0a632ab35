//! PID Connector
//!
//! A resilient AMQP publisher for persistent-identifier registration events.
//!
//! # Overview
//!
//! Callers enqueue JSON messages from any thread. A dedicated event-loop thread
//! publishes them in order to the first reachable broker node, tracks publisher
//! confirms, reroutes unroutable messages once to an emergency routing key and
//! fails over between nodes when connections drop. Anything that could not be
//! confirmed is handed back as leftovers when the connector finishes.
//!
//! - Multi-node failover with trusted and open nodes, ordered by priority
//! - Publisher confirms with republishing of nacked and unconfirmed messages
//! - Graceful finish with stagnation detection, or an immediate forced finish
//! - Pluggable transport: `lapin` for real brokers, an in-memory mock for tests
//!
//! # Quick Start
//!
//! ```rust
//! use pid_connector::connector::{AsynchronousConnector, ConnectorSettings, NodeSpec};
//! use pid_connector::connector::nodes::Credentials;
//! use pid_connector::testing::MockBroker;
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let broker = MockBroker::new();
//! let mut connector = AsynchronousConnector::new(ConnectorSettings::default(), Arc::new(broker.clone()));
//! connector
//!     .add_trusted_node(NodeSpec::new(Credentials::new("guest", "guest"), "rabbit-1", "pid.events"))
//!     .unwrap();
//! connector.start().unwrap();
//!
//! connector
//!     .enqueue("21.T11148.handle.create", &json!({"handle": "21.T11148/abc"}))
//!     .unwrap();
//! assert!(connector.wait_until_available(Duration::from_secs(5)));
//! connector.finish_gracefully().unwrap();
//!
//! assert!(connector.is_finished());
//! assert!(!connector.any_leftovers());
//! assert_eq!(broker.published().len(), 1);
//! ```

pub mod broker;
pub mod config;
pub mod connector;
pub mod error;
pub mod message;
pub mod observability;
pub mod testing;

pub use broker::{Broker, BrokerError};
pub use config::PublisherConfig;
pub use connector::{
    AsynchronousConnector, ConnectionState, ConnectorSettings, NodeSpec, StateSnapshot,
};
pub use error::{ConnectorError, ConnectorResult};
pub use message::PendingMessage;
