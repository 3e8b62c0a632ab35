//! Connection lifecycle: failover across nodes, channel setup, reconnection
//!
//! [`ConnectionBuilder`] holds the connection bookkeeping and makes the pure
//! retry decisions. The handlers that act on those decisions are methods of
//! [`PublisherLoop`], since they also touch the state machine, the feeder and
//! the confirm tracker.
//!
//! Every connection attempt and every channel request gets a fresh epoch.
//! Outcomes and broker callbacks carry the epoch they were issued for, and
//! anything that does not match the current epoch is stale and ignored. That
//! is what makes repeated error callbacks for one attempt harmless.
//!
//! A fresh channel is on probation until the broker confirms a publish on it
//! or it survives one check interval without a failure. Losing a channel on
//! probation counts as a failed attempt, so `reconnect_delay` and
//! `max_sweeps` bound a broker that accepts connections but cannot keep a
//! channel alive.

use super::event_loop::{LoopEvent, PublisherLoop};
use super::nodes::{BrokerNode, NodeManager};
use super::ConnectorSettings;
use crate::broker::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerEvents, ChannelCloseReason, CloseReason,
};
use crate::error::sanitize_error_message;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// What to do after a failed connection attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try the next node of the current sweep right away
    TryNode(BrokerNode),
    /// Sweep exhausted; start a new one after the delay
    RetryAfter(Duration),
    /// All sweeps failed
    GiveUp { authentication_failed: bool },
}

/// Connection and channel handles plus failover bookkeeping
pub struct ConnectionBuilder {
    nodes: NodeManager,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    connection_epoch: u64,
    channel_epoch: u64,
    attempt_settled: bool,
    node_key: String,
    node_exchange: String,
    fallback_exchange: String,
    using_fallback: bool,
    /// Nodes whose own exchange turned out to be missing
    fallback_nodes: HashSet<String>,
    channel_proven: bool,
    reconnect_delay: Duration,
    max_sweeps: u32,
    attempts_in_sweep: u32,
    auth_failures_in_sweep: u32,
    failed_sweeps: u32,
    ever_established: bool,
}

impl ConnectionBuilder {
    pub fn new(nodes: NodeManager, settings: &ConnectorSettings) -> Self {
        Self {
            nodes,
            connection: None,
            channel: None,
            connection_epoch: 0,
            channel_epoch: 0,
            attempt_settled: true,
            node_key: String::new(),
            node_exchange: String::new(),
            fallback_exchange: settings.fallback_exchange.clone(),
            using_fallback: false,
            fallback_nodes: HashSet::new(),
            channel_proven: false,
            reconnect_delay: settings.reconnect_delay,
            max_sweeps: settings.max_sweeps.max(1),
            attempts_in_sweep: 0,
            auth_failures_in_sweep: 0,
            failed_sweeps: 0,
            ever_established: false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.node_count()
    }

    pub fn next_node(&mut self) -> Option<BrokerNode> {
        self.nodes.next_node()
    }

    pub fn current_node(&self) -> Option<&BrokerNode> {
        self.nodes.current_node()
    }

    fn current_node_name(&self) -> String {
        self.current_node()
            .map(BrokerNode::display_name)
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Forget the old handles and open a new attempt epoch for `node`
    pub fn begin_attempt(&mut self, node: &BrokerNode) -> u64 {
        self.connection_epoch += 1;
        self.channel_epoch += 1;
        self.connection = None;
        self.channel = None;
        self.attempt_settled = false;
        self.channel_proven = false;
        self.node_key = node.display_name();
        self.node_exchange = node.exchange.clone();
        self.using_fallback = self.fallback_nodes.contains(&self.node_key);
        self.connection_epoch
    }

    pub fn connection_epoch(&self) -> u64 {
        self.connection_epoch
    }

    pub fn channel_epoch(&self) -> u64 {
        self.channel_epoch
    }

    /// Attempt `epoch` is still waiting for its outcome
    pub fn is_pending_attempt(&self, epoch: u64) -> bool {
        epoch == self.connection_epoch && self.connection.is_none() && !self.attempt_settled
    }

    /// Attempt `epoch` produced the connection we currently hold
    pub fn is_current_open_connection(&self, epoch: u64) -> bool {
        epoch == self.connection_epoch && self.connection.is_some()
    }

    pub fn is_current_channel(&self, connection: u64, channel: u64) -> bool {
        connection == self.connection_epoch && channel == self.channel_epoch && self.channel.is_some()
    }

    pub fn is_pending_channel(&self, epoch: u64) -> bool {
        epoch == self.channel_epoch && self.channel.is_none() && self.connection.is_some()
    }

    /// Mark the current attempt as handled; later errors for it are duplicates
    pub fn settle_attempt(&mut self) {
        self.attempt_settled = true;
    }

    pub fn set_connection(&mut self, connection: Arc<dyn BrokerConnection>) {
        self.attempt_settled = true;
        self.connection = Some(connection);
    }

    pub fn connection(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.connection.clone()
    }

    /// New channel epoch for a channel request on the current connection
    pub fn begin_channel(&mut self) -> u64 {
        self.channel_epoch += 1;
        self.channel = None;
        self.channel_proven = false;
        self.channel_epoch
    }

    pub fn set_channel(&mut self, channel: Arc<dyn BrokerChannel>) {
        self.channel = Some(channel);
    }

    pub fn channel(&self) -> Option<&dyn BrokerChannel> {
        self.channel.as_deref()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Give up the channel; its remaining events become stale
    pub fn take_channel(&mut self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel_epoch += 1;
        self.channel.take()
    }

    /// Give up channel and connection; all their remaining events become stale
    pub fn take_handles(
        &mut self,
    ) -> (
        Option<Arc<dyn BrokerChannel>>,
        Option<Arc<dyn BrokerConnection>>,
    ) {
        let channel = self.take_channel();
        self.connection_epoch += 1;
        self.attempt_settled = true;
        (channel, self.connection.take())
    }

    /// Exchange messages are currently published to
    pub fn exchange(&self) -> &str {
        if self.using_fallback {
            &self.fallback_exchange
        } else {
            &self.node_exchange
        }
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    /// Switch to the fallback exchange for the current node; false if already switched
    pub fn use_fallback_exchange(&mut self) -> bool {
        if self.using_fallback {
            return false;
        }
        self.using_fallback = true;
        self.fallback_nodes.insert(self.node_key.clone());
        true
    }

    /// Account for a failed attempt and decide how to continue (pure bookkeeping)
    pub fn record_failure(&mut self, error: &BrokerError) -> RetryDecision {
        self.attempts_in_sweep += 1;
        if error.is_authentication() {
            self.auth_failures_in_sweep += 1;
        }

        if let Some(node) = self.nodes.next_node() {
            return RetryDecision::TryNode(node);
        }

        self.failed_sweeps += 1;
        if self.failed_sweeps >= self.max_sweeps {
            return RetryDecision::GiveUp {
                authentication_failed: self.auth_failures_in_sweep > 0,
            };
        }

        self.start_new_sweep();
        RetryDecision::RetryAfter(self.reconnect_delay)
    }

    /// A channel is open and on probation
    pub fn channel_opened(&mut self) {
        self.ever_established = true;
        self.channel_proven = false;
    }

    /// The current channel works; failover counters start from scratch.
    /// Returns false if it had already been proven.
    pub fn prove_channel(&mut self) -> bool {
        if self.channel_proven || self.channel.is_none() {
            return false;
        }
        self.channel_proven = true;
        self.failed_sweeps = 0;
        self.start_new_sweep();
        true
    }

    pub fn is_channel_proven(&self) -> bool {
        self.channel_proven
    }

    /// Whether any channel has been ready for publishing so far
    pub fn ever_established(&self) -> bool {
        self.ever_established
    }

    pub fn start_new_sweep(&mut self) {
        self.nodes.reset_tried();
        self.attempts_in_sweep = 0;
        self.auth_failures_in_sweep = 0;
    }

    pub fn attempts_in_sweep(&self) -> u32 {
        self.attempts_in_sweep
    }

    pub fn failed_sweeps(&self) -> u32 {
        self.failed_sweeps
    }
}

impl PublisherLoop {
    pub(super) fn first_connection(&mut self) {
        self.state.set_waiting_to_be_available();
        self.builder.start_new_sweep();
        self.connect_next_node();
    }

    fn connect_next_node(&mut self) {
        match self.builder.next_node() {
            Some(node) => self.start_connection_attempt(node),
            None => {
                error!("No broker node to connect to");
                self.give_up(false);
            }
        }
    }

    fn start_connection_attempt(&mut self, node: BrokerNode) {
        let epoch = self.builder.begin_attempt(&node);
        info!(
            node = %node.display_name(),
            trust = %node.trust,
            exchange = %node.exchange,
            epoch,
            "Connecting to broker node"
        );

        let broker = Arc::clone(&self.broker);
        let events = self.events.clone();
        let sink = BrokerEvents::for_connection(self.events.clone(), epoch);
        let timeout = self.settings.connection_timeout;
        let span = crate::connection_span!(node = %node.display_name(), epoch);

        tokio::spawn(
            async move {
                let event = match tokio::time::timeout(timeout, broker.connect(&node, sink)).await {
                    Ok(Ok(connection)) => LoopEvent::ConnectionOpened { epoch, connection },
                    Ok(Err(error)) => LoopEvent::ConnectionFailed { epoch, error },
                    Err(_) => LoopEvent::ConnectionFailed {
                        epoch,
                        error: BrokerError::Timeout {
                            operation: format!("connecting to {}", node.display_name()),
                            timeout,
                        },
                    },
                };
                let _ = events.send(event);
            }
            .instrument(span),
        );
    }

    pub(super) fn on_connection_open(&mut self, epoch: u64, connection: Arc<dyn BrokerConnection>) {
        if !self.builder.is_pending_attempt(epoch) {
            debug!(epoch, "Closing connection from an abandoned attempt");
            tokio::spawn(async move {
                let _ = connection.close().await;
            });
            return;
        }

        debug!(node = %self.builder.current_node_name(), epoch, "Connection open, requesting channel");
        self.builder.set_connection(connection);
        self.open_channel();
    }

    /// Request a confirm-mode channel on the current connection
    pub(super) fn open_channel(&mut self) {
        let Some(connection) = self.builder.connection() else {
            warn!("Channel requested without an open connection");
            return;
        };

        let epoch = self.builder.begin_channel();
        let sink = BrokerEvents::for_connection(self.events.clone(), self.builder.connection_epoch())
            .for_channel(epoch);
        let events = self.events.clone();

        tokio::spawn(async move {
            let event = match connection.open_channel(sink).await {
                Ok(channel) => match channel.enable_confirms().await {
                    Ok(()) => LoopEvent::ChannelOpened { epoch, channel },
                    Err(error) => {
                        let _ = channel.close().await;
                        LoopEvent::ChannelFailed { epoch, error }
                    }
                },
                Err(error) => LoopEvent::ChannelFailed { epoch, error },
            };
            let _ = events.send(event);
        });
    }

    pub(super) async fn on_channel_open(&mut self, epoch: u64, channel: Arc<dyn BrokerChannel>) {
        if !self.builder.is_pending_channel(epoch) {
            debug!(epoch, "Closing channel from an abandoned request");
            tokio::spawn(async move {
                let _ = channel.close().await;
            });
            return;
        }

        self.builder.set_channel(channel);

        let finish_before_first_channel =
            self.shutdown.stop_requested() && !self.builder.ever_established();
        if finish_before_first_channel || self.shutdown.force_requested() {
            info!("Finish was requested while connecting, closing without publishing");
            self.close_connection_gracefully().await;
            return;
        }

        self.builder.channel_opened();
        self.feeder.reset_delivery_tags();
        self.state.set_available();
        if self.shutdown.stop_requested() {
            // Channel replaced during a graceful finish: keep draining
            self.state.set_wanting_to_stop();
        }
        info!(
            node = %self.builder.current_node_name(),
            exchange = %self.builder.exchange(),
            queued = self.feeder.queue().len(),
            "Channel open with publisher confirms"
        );
        self.schedule(
            self.settings.drain.check_interval,
            LoopEvent::ChannelProbation {
                connection: self.builder.connection_epoch(),
                channel: self.builder.channel_epoch(),
            },
        );
        self.wake();
    }

    /// Probation ended: a channel that has not failed so far is proven
    pub(super) fn on_channel_probation(&mut self, connection: u64, channel: u64) {
        if !self.builder.is_current_channel(connection, channel) {
            return;
        }
        if self.feeder.consecutive_failures() > 0 {
            debug!(
                failures = self.feeder.consecutive_failures(),
                "Channel still failing publishes, waiting for a confirm"
            );
            return;
        }
        self.mark_channel_healthy();
    }

    pub(super) fn mark_channel_healthy(&mut self) {
        if self.builder.prove_channel() {
            debug!(node = %self.builder.current_node_name(), "Channel proven healthy");
        }
    }

    pub(super) async fn on_channel_open_failed(&mut self, epoch: u64, error: BrokerError) {
        if !self.builder.is_pending_channel(epoch) {
            debug!(epoch, "Ignoring failure of an abandoned channel request");
            return;
        }

        warn!(
            node = %self.builder.current_node_name(),
            error = %sanitize_error_message(&error.to_string()),
            "Could not open a confirm channel"
        );
        self.close_connection_for_reconnect(error.to_string()).await;
    }

    /// Failed attempt, or error callback on the current connection
    pub(super) async fn on_connection_error(&mut self, epoch: u64, error: BrokerError) {
        if self.state.is_force_finished() || self.shutdown.force_requested() {
            warn!("Force-finish requested, not retrying the connection");
            self.stop();
            return;
        }

        if self.builder.is_current_open_connection(epoch) {
            // Error callback on an established connection: it is gone
            self.on_connection_closed(CloseReason::Unexpected(error.to_string()))
                .await;
            return;
        }

        if !self.builder.is_pending_attempt(epoch) {
            debug!(epoch, "Ignoring repeated error for a settled connection attempt");
            return;
        }
        self.builder.settle_attempt();

        warn!(
            node = %self.builder.current_node_name(),
            epoch,
            error = %sanitize_error_message(&error.to_string()),
            authentication = error.is_authentication(),
            "Connection attempt failed"
        );

        let decision = self.builder.record_failure(&error);
        self.follow_retry_decision(decision);
    }

    fn follow_retry_decision(&mut self, decision: RetryDecision) {
        match decision {
            RetryDecision::TryNode(node) => self.start_connection_attempt(node),
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    failed_sweeps = self.builder.failed_sweeps(),
                    delay_ms = delay.as_millis() as u64,
                    "All broker nodes failed, retrying after delay"
                );
                let epoch = self.builder.connection_epoch();
                self.schedule(delay, LoopEvent::RetryConnection { epoch });
            }
            RetryDecision::GiveUp {
                authentication_failed,
            } => self.give_up(authentication_failed),
        }
    }

    pub(super) fn retry_connection(&mut self, epoch: u64) {
        if epoch != self.builder.connection_epoch() || self.state.is_terminal() {
            debug!(epoch, "Ignoring outdated connection retry");
            return;
        }
        self.connect_next_node();
    }

    fn give_up(&mut self, authentication_failed: bool) {
        error!(
            failed_sweeps = self.builder.failed_sweeps(),
            authentication_failed,
            "Could not connect to any broker node, giving up"
        );
        self.state.set_detail_could_not_connect();
        if authentication_failed {
            self.state.set_detail_authentication_failed();
        }
        self.state.set_permanently_unavailable();
        self.stop();
    }

    pub(super) async fn on_channel_closed(&mut self, reason: ChannelCloseReason) {
        match reason {
            ChannelCloseReason::ByPublisher => {
                debug!("Channel closed by publisher");
            }
            ChannelCloseReason::NoSuchExchange(text) if !self.builder.is_using_fallback() => {
                self.builder.use_fallback_exchange();
                warn!(
                    reason = %text,
                    fallback_exchange = %self.builder.exchange(),
                    "Exchange does not exist, switching to fallback exchange"
                );
                self.builder.take_channel();
                self.rescue_unconfirmed();
                self.feeder.reset_delivery_tags();
                self.state.set_waiting_to_be_available();
                self.open_channel();
            }
            ChannelCloseReason::NoSuchExchange(text) | ChannelCloseReason::Other(text) => {
                warn!(
                    reason = %sanitize_error_message(&text),
                    "Channel closed unexpectedly"
                );
                self.close_connection_for_reconnect(text).await;
            }
        }
    }

    pub(super) async fn on_connection_closed(&mut self, reason: CloseReason) {
        match reason {
            CloseReason::ByPublisher => {
                self.state.set_detail_closed_by_publisher();
                if !self.state.is_force_finished() {
                    self.state.set_permanently_unavailable();
                }
                info!(state = %self.state.state(), "Connection closed by publisher");
                self.stop();
            }
            CloseReason::Unexpected(text) => {
                if self.state.is_terminal() {
                    return;
                }
                let proven = self.builder.is_channel_proven();
                warn!(
                    reason = %sanitize_error_message(&text),
                    unconfirmed = self.confirms.count_unconfirmed(),
                    proven,
                    "Connection lost, reconnecting"
                );
                self.builder.take_handles();
                self.state.set_waiting_to_be_available();
                if proven {
                    let epoch = self.builder.connection_epoch();
                    self.schedule(Duration::ZERO, LoopEvent::Reconnect { epoch });
                } else {
                    self.on_unproven_connection_lost(text);
                }
            }
        }
    }

    /// Close whatever is open and continue on the reconnection path
    async fn close_connection_for_reconnect(&mut self, reason: String) {
        let (channel, connection) = self.builder.take_handles();
        let timeout = self.settings.drain.force_close_timeout;
        if let Some(channel) = channel {
            let _ = tokio::time::timeout(timeout, channel.close()).await;
        }
        if let Some(connection) = connection {
            let _ = tokio::time::timeout(timeout, connection.close()).await;
        }
        self.on_connection_closed(CloseReason::Unexpected(reason)).await;
    }

    /// The node never kept a working channel: count it as a failed attempt
    fn on_unproven_connection_lost(&mut self, reason: String) {
        self.feeder.reset_delivery_tags();
        self.rescue_unconfirmed();
        let error = BrokerError::ChannelFailed(format!(
            "{} lost its channel before it was proven: {}",
            self.builder.current_node_name(),
            sanitize_error_message(&reason)
        ));
        let decision = self.builder.record_failure(&error);
        self.follow_retry_decision(decision);
    }

    pub(super) fn reconnect(&mut self, epoch: u64) {
        if epoch != self.builder.connection_epoch() || self.state.is_terminal() {
            debug!(epoch, "Ignoring outdated reconnect request");
            return;
        }

        self.builder.take_handles();
        self.feeder.reset_delivery_tags();
        self.rescue_unconfirmed();
        self.builder.start_new_sweep();
        self.state.set_waiting_to_be_available();
        info!(queued = self.feeder.queue().len(), "Reconnecting to broker");
        self.connect_next_node();
    }

    /// Move unconfirmed messages back to the head of the queue, in send order
    pub(super) fn rescue_unconfirmed(&mut self) {
        let rescued = self.confirms.take_all();
        if rescued.is_empty() {
            return;
        }
        info!(
            count = rescued.len(),
            "Unconfirmed messages returned to the head of the queue"
        );
        self.feeder.queue().requeue_front(rescued);
    }
}
