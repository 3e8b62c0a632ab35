//! Resilient publisher connector
//!
//! All broker interaction happens on one event-loop thread. Callers talk to it
//! through [`AsynchronousConnector`], which appends to a shared queue and sends
//! commands; everything else (connection failover, confirm tracking, returned
//! messages, shutdown) is driven by events processed one at a time in
//! [`event_loop::PublisherLoop`].

pub mod builder;
pub mod confirms;
pub mod event_loop;
pub mod facade;
pub mod feeder;
pub mod nodes;
pub mod returns;
pub mod shutdown;
pub mod state;

pub use builder::{ConnectionBuilder, RetryDecision};
pub use confirms::{ConfirmError, ConfirmTracker};
pub use event_loop::{LoopEvent, LoopSummary, PublisherLoop};
pub use facade::{AsynchronousConnector, NodeSpec};
pub use feeder::{Feeder, OutboundQueue};
pub use nodes::{BrokerNode, Credentials, NodeManager, TrustLevel};
pub use returns::{ReturnHandler, ReturnOutcome};
pub use shutdown::{DrainDecision, DrainPolicy, ShutdownCoordinator};
pub use state::{ConnectionState, ConnectionStateMachine, StateSnapshot};

use crate::message::{DEFAULT_FALLBACK_EXCHANGE, EMERGENCY_ROUTING_KEY};
use std::time::Duration;

/// Publish attempts that may fail in a row before the channel is treated as broken
pub const MAX_CONSECUTIVE_PUBLISH_FAILURES: u32 = 3;

/// Runtime knobs of the connector
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorSettings {
    /// Pause between two full sweeps over all nodes
    pub reconnect_delay: Duration,
    /// Full sweeps allowed to fail before giving up
    pub max_sweeps: u32,
    /// Bound on a single connection attempt
    pub connection_timeout: Duration,
    /// Messages published per wake-up before yielding to other events
    pub publish_batch_size: usize,
    pub fallback_exchange: String,
    pub emergency_routing_key: String,
    pub drain: DrainPolicy,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(500),
            max_sweeps: 5,
            connection_timeout: Duration::from_secs(10),
            publish_batch_size: 100,
            fallback_exchange: DEFAULT_FALLBACK_EXCHANGE.to_string(),
            emergency_routing_key: EMERGENCY_ROUTING_KEY.to_string(),
            drain: DrainPolicy::default(),
        }
    }
}
