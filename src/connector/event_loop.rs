//! Single-threaded event loop driving the connector
//!
//! Every mutation of connector state happens inside [`PublisherLoop::run`],
//! one event at a time. Caller commands, broker callbacks, finished
//! connection attempts and timers all arrive as [`LoopEvent`]s on one
//! unbounded channel, so no component needs its own locking.
//!
//! Connection lifecycle handlers live in [`super::builder`]; shutdown
//! handlers live in [`super::shutdown`].

use super::builder::ConnectionBuilder;
use super::confirms::ConfirmTracker;
use super::feeder::{Feeder, OutboundQueue};
use super::nodes::NodeManager;
use super::returns::{ReturnHandler, ReturnOutcome};
use super::shutdown::ShutdownCoordinator;
use super::state::{ConnectionStateMachine, StateSnapshot};
use super::{ConnectorSettings, MAX_CONSECUTIVE_PUBLISH_FAILURES};
use crate::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerError, BrokerEvent, ChannelCloseReason,
    ReturnedMessage,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything the event loop reacts to
pub enum LoopEvent {
    /// Messages were enqueued
    Wakeup,
    FinishGently,
    ForceFinish,
    ConnectionOpened {
        epoch: u64,
        connection: Arc<dyn BrokerConnection>,
    },
    ConnectionFailed {
        epoch: u64,
        error: BrokerError,
    },
    ChannelOpened {
        epoch: u64,
        channel: Arc<dyn BrokerChannel>,
    },
    ChannelFailed {
        epoch: u64,
        error: BrokerError,
    },
    /// Callback from a connection or channel, stamped with its epochs
    Broker {
        connection: u64,
        channel: Option<u64>,
        event: BrokerEvent,
    },
    /// Start the next sweep after the reconnect delay
    RetryConnection { epoch: u64 },
    /// Reconnect after losing a connection that was open at `epoch`
    Reconnect { epoch: u64 },
    /// End of the probation period of a fresh channel
    ChannelProbation { connection: u64, channel: u64 },
    DrainCheck,
}

impl fmt::Debug for LoopEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopEvent::Wakeup => f.write_str("Wakeup"),
            LoopEvent::FinishGently => f.write_str("FinishGently"),
            LoopEvent::ForceFinish => f.write_str("ForceFinish"),
            LoopEvent::ConnectionOpened { epoch, .. } => {
                f.debug_struct("ConnectionOpened").field("epoch", epoch).finish()
            }
            LoopEvent::ConnectionFailed { epoch, error } => f
                .debug_struct("ConnectionFailed")
                .field("epoch", epoch)
                .field("error", error)
                .finish(),
            LoopEvent::ChannelOpened { epoch, .. } => {
                f.debug_struct("ChannelOpened").field("epoch", epoch).finish()
            }
            LoopEvent::ChannelFailed { epoch, error } => f
                .debug_struct("ChannelFailed")
                .field("epoch", epoch)
                .field("error", error)
                .finish(),
            LoopEvent::Broker {
                connection,
                channel,
                event,
            } => f
                .debug_struct("Broker")
                .field("connection", connection)
                .field("channel", channel)
                .field("event", event)
                .finish(),
            LoopEvent::RetryConnection { epoch } => {
                f.debug_struct("RetryConnection").field("epoch", epoch).finish()
            }
            LoopEvent::Reconnect { epoch } => {
                f.debug_struct("Reconnect").field("epoch", epoch).finish()
            }
            LoopEvent::ChannelProbation {
                connection,
                channel,
            } => f
                .debug_struct("ChannelProbation")
                .field("connection", connection)
                .field("channel", channel)
                .finish(),
            LoopEvent::DrainCheck => f.write_str("DrainCheck"),
        }
    }
}

/// Final report of a finished event loop
#[derive(Debug, Clone, PartialEq)]
pub struct LoopSummary {
    pub state: StateSnapshot,
    /// Messages left in the queue (unconfirmed ones first)
    pub leftovers: usize,
    pub rerouted: u64,
    pub dropped: u64,
}

/// Owner of all connector state while the connector runs
pub struct PublisherLoop {
    pub(super) broker: Arc<dyn Broker>,
    pub(super) settings: ConnectorSettings,
    pub(super) state: ConnectionStateMachine,
    pub(super) builder: ConnectionBuilder,
    pub(super) feeder: Feeder,
    pub(super) confirms: ConfirmTracker,
    pub(super) returns: ReturnHandler,
    pub(super) shutdown: ShutdownCoordinator,
    pub(super) events: mpsc::UnboundedSender<LoopEvent>,
    receiver: mpsc::UnboundedReceiver<LoopEvent>,
    pub(super) running: bool,
}

impl PublisherLoop {
    pub fn new(
        broker: Arc<dyn Broker>,
        settings: ConnectorSettings,
        state: ConnectionStateMachine,
        nodes: NodeManager,
        queue: OutboundQueue,
        events: mpsc::UnboundedSender<LoopEvent>,
        receiver: mpsc::UnboundedReceiver<LoopEvent>,
    ) -> Self {
        Self {
            builder: ConnectionBuilder::new(nodes, &settings),
            feeder: Feeder::new(queue, settings.publish_batch_size),
            confirms: ConfirmTracker::new(),
            returns: ReturnHandler::new(settings.emergency_routing_key.clone()),
            shutdown: ShutdownCoordinator::new(settings.drain.clone()),
            broker,
            settings,
            state,
            events,
            receiver,
            running: true,
        }
    }

    /// Connect and process events until the connector reaches a terminal state
    pub async fn run(mut self) -> LoopSummary {
        info!(nodes = self.builder.node_count(), "Publisher event loop started");
        self.first_connection();

        while self.running {
            let Some(event) = self.receiver.recv().await else {
                break;
            };
            self.dispatch(event).await;
        }

        self.finish_loop()
    }

    async fn dispatch(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Wakeup => self.publish_pending().await,
            LoopEvent::FinishGently => self.finish_gently().await,
            LoopEvent::ForceFinish => self.force_finish().await,
            LoopEvent::ConnectionOpened { epoch, connection } => {
                self.on_connection_open(epoch, connection)
            }
            LoopEvent::ConnectionFailed { epoch, error } => {
                self.on_connection_error(epoch, error).await
            }
            LoopEvent::ChannelOpened { epoch, channel } => self.on_channel_open(epoch, channel).await,
            LoopEvent::ChannelFailed { epoch, error } => {
                self.on_channel_open_failed(epoch, error).await
            }
            LoopEvent::Broker {
                connection,
                channel,
                event,
            } => self.on_broker_event(connection, channel, event).await,
            LoopEvent::RetryConnection { epoch } => self.retry_connection(epoch),
            LoopEvent::Reconnect { epoch } => self.reconnect(epoch),
            LoopEvent::ChannelProbation {
                connection,
                channel,
            } => self.on_channel_probation(connection, channel),
            LoopEvent::DrainCheck => self.on_drain_check().await,
        }
    }

    async fn on_broker_event(&mut self, connection: u64, channel: Option<u64>, event: BrokerEvent) {
        match channel {
            Some(channel) if !self.builder.is_current_channel(connection, channel) => {
                debug!(connection, channel, ?event, "Ignoring event from an abandoned channel");
                return;
            }
            None if event.is_channel_scoped() => {
                debug!(connection, ?event, "Ignoring channel event without a channel epoch");
                return;
            }
            _ => {}
        }

        match event {
            BrokerEvent::Ack { tag, multiple } => match self.confirms.on_ack(tag, multiple) {
                Ok(_) => self.mark_channel_healthy(),
                Err(e) => warn!(error = %e, "Protocol anomaly in publisher confirm"),
            },
            BrokerEvent::Nack { tag, multiple } => match self.confirms.on_nack(tag, multiple) {
                Ok(refused) => {
                    self.feeder.queue().requeue_front(refused);
                    self.wake();
                }
                Err(e) => warn!(error = %e, "Protocol anomaly in publisher confirm"),
            },
            BrokerEvent::Returned(returned) => self.on_returned(returned),
            BrokerEvent::ChannelClosed(reason) => self.on_channel_closed(reason).await,
            BrokerEvent::ConnectionClosed(reason) => {
                if !self.builder.is_current_open_connection(connection) {
                    debug!(connection, ?reason, "Ignoring closure of an abandoned connection");
                    return;
                }
                self.on_connection_closed(reason).await
            }
            BrokerEvent::ConnectionError(error) => self.on_connection_error(connection, error).await,
        }
    }

    fn on_returned(&mut self, returned: ReturnedMessage) {
        let outcome = self.returns.on_message_returned(
            returned.reply_code,
            &returned.reply_text,
            &returned.routing_key,
            &returned.body,
        );
        if let ReturnOutcome::Rerouted(message) = outcome {
            self.feeder.queue().push_back(message);
            self.wake();
        }
    }

    /// Publish a batch of queued messages if a channel is available
    pub(super) async fn publish_pending(&mut self) {
        if !self.running || !self.state.is_available_for_publish() {
            return;
        }

        let report = self
            .feeder
            .publish_batch(
                &self.state,
                self.builder.channel(),
                self.builder.exchange(),
                &mut self.confirms,
            )
            .await;

        if let Some(error) = report.failure {
            if self.feeder.consecutive_failures() >= MAX_CONSECUTIVE_PUBLISH_FAILURES {
                warn!(
                    failures = self.feeder.consecutive_failures(),
                    "Channel keeps refusing publishes, reopening"
                );
                self.on_channel_closed(ChannelCloseReason::Other(error.to_string()))
                    .await;
            } else {
                self.schedule(self.settings.reconnect_delay, LoopEvent::Wakeup);
            }
        } else if report.hit_limit() {
            self.wake();
        }
    }

    pub(super) fn wake(&self) {
        let _ = self.events.send(LoopEvent::Wakeup);
    }

    /// Deliver `event` to this loop after `delay`
    pub(super) fn schedule(&self, delay: Duration, event: LoopEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    /// Stop processing events after the current one
    pub(super) fn stop(&mut self) {
        self.running = false;
    }

    pub(super) fn outstanding(&self) -> (usize, usize) {
        (self.feeder.queue().len(), self.confirms.count_unconfirmed())
    }

    fn finish_loop(mut self) -> LoopSummary {
        let rescued = self.confirms.take_all();
        if !rescued.is_empty() {
            warn!(
                count = rescued.len(),
                "Unconfirmed messages moved back to the queue as leftovers"
            );
        }
        self.feeder.queue().requeue_front(rescued);

        let summary = LoopSummary {
            state: self.state.snapshot(),
            leftovers: self.feeder.queue().len(),
            rerouted: self.returns.rerouted_count(),
            dropped: self.returns.dropped_count(),
        };

        if summary.leftovers > 0 {
            warn!(
                state = %summary.state.state,
                leftovers = summary.leftovers,
                "Publisher event loop stopped with messages left over"
            );
        } else {
            info!(
                state = %summary.state.state,
                rerouted = summary.rerouted,
                dropped = summary.dropped,
                "Publisher event loop stopped"
            );
        }
        summary
    }
}
