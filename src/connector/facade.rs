//! Caller-facing connector API
//!
//! Callers stay synchronous: they register nodes, start the connector, enqueue
//! messages from any thread and finally finish it. All broker work happens on
//! a dedicated thread running a current-thread tokio runtime.

use super::event_loop::{LoopEvent, LoopSummary, PublisherLoop};
use super::feeder::OutboundQueue;
use super::nodes::{BrokerNode, Credentials, NodeManager, TrustLevel};
use super::state::{ConnectionStateMachine, StateSnapshot};
use super::ConnectorSettings;
use crate::broker::{AmqpBroker, Broker};
use crate::config::PublisherConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::message::PendingMessage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Instrument};

const LOOP_THREAD_NAME: &str = "pid-connector-loop";
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Node registration with optional connection details
#[derive(Debug, Clone)]
pub struct NodeSpec {
    credentials: Credentials,
    host: String,
    exchange: String,
    port: Option<u16>,
    vhost: Option<String>,
    priority: Option<String>,
    tls: bool,
}

impl NodeSpec {
    pub fn new<H: Into<String>, E: Into<String>>(credentials: Credentials, host: H, exchange: E) -> Self {
        Self {
            credentials,
            host: host.into(),
            exchange: exchange.into(),
            port: None,
            vhost: None,
            priority: None,
            tls: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn vhost<S: Into<String>>(mut self, vhost: S) -> Self {
        self.vhost = Some(vhost.into());
        self
    }

    pub fn priority<S: Into<String>>(mut self, priority: S) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn into_node(self, trust: TrustLevel) -> BrokerNode {
        let mut node =
            BrokerNode::new(self.credentials, self.host, self.exchange, trust).with_tls(self.tls);
        if let Some(port) = self.port {
            node = node.with_port(port);
        }
        if let Some(vhost) = self.vhost {
            node = node.with_vhost(vhost);
        }
        if let Some(priority) = self.priority {
            node = node.with_priority(priority);
        }
        node
    }
}

/// Thread-safe handle to a publisher connector
pub struct AsynchronousConnector {
    settings: ConnectorSettings,
    broker: Arc<dyn Broker>,
    nodes: NodeManager,
    queue: OutboundQueue,
    state: watch::Receiver<StateSnapshot>,
    unstarted_state: Option<ConnectionStateMachine>,
    commands: Option<mpsc::UnboundedSender<LoopEvent>>,
    finish_requested: AtomicBool,
    worker: Mutex<Option<JoinHandle<LoopSummary>>>,
    summary: Mutex<Option<LoopSummary>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AsynchronousConnector {
    pub fn new(settings: ConnectorSettings, broker: Arc<dyn Broker>) -> Self {
        let state_machine = ConnectionStateMachine::new();
        Self {
            settings,
            broker,
            nodes: NodeManager::new(),
            queue: OutboundQueue::new(),
            state: state_machine.subscribe(),
            unstarted_state: Some(state_machine),
            commands: None,
            finish_requested: AtomicBool::new(false),
            worker: Mutex::new(None),
            summary: Mutex::new(None),
        }
    }

    /// Connector talking AMQP to the nodes listed in `config`
    pub fn from_config(config: &PublisherConfig) -> ConnectorResult<Self> {
        let mut connector = Self::new(config.connector_settings(), Arc::new(AmqpBroker::new()));
        for node in config.resolve_nodes()? {
            connector.add_node(node)?;
        }
        Ok(connector)
    }

    pub fn add_trusted_node(&mut self, spec: NodeSpec) -> ConnectorResult<()> {
        self.add_node(spec.into_node(TrustLevel::Trusted))
    }

    pub fn add_open_node(&mut self, spec: NodeSpec) -> ConnectorResult<()> {
        self.add_node(spec.into_node(TrustLevel::Open))
    }

    /// Register a node; only possible before [`AsynchronousConnector::start`]
    pub fn add_node(&mut self, node: BrokerNode) -> ConnectorResult<()> {
        if self.is_started() {
            return Err(ConnectorError::operation_not_allowed(
                "broker nodes must be added before the connector is started",
            ));
        }
        node.amqp_uri()?;
        self.nodes.add_node(node);
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.node_count()
    }

    fn is_started(&self) -> bool {
        self.commands.is_some()
    }

    /// Spawn the event-loop thread and begin connecting
    pub fn start(&mut self) -> ConnectorResult<()> {
        if self.is_started() {
            return Err(ConnectorError::AlreadyStarted);
        }
        if self.nodes.is_empty() {
            return Err(ConnectorError::NoNodes);
        }
        let state_machine = self
            .unstarted_state
            .take()
            .ok_or(ConnectorError::AlreadyStarted)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let node_count = self.nodes.node_count();
        let publisher_loop = PublisherLoop::new(
            Arc::clone(&self.broker),
            self.settings.clone(),
            state_machine,
            std::mem::take(&mut self.nodes),
            self.queue.clone(),
            sender.clone(),
            receiver,
        );

        let handle = thread::Builder::new()
            .name(LOOP_THREAD_NAME.to_string())
            .spawn(move || {
                let span = crate::connector_span!(nodes = node_count);
                runtime.block_on(publisher_loop.run().instrument(span))
            })?;

        info!(nodes = node_count, "Connector started");
        self.commands = Some(sender);
        *lock(&self.worker) = Some(handle);
        Ok(())
    }

    fn accepting_sender(&self) -> ConnectorResult<&mpsc::UnboundedSender<LoopEvent>> {
        let Some(commands) = self.commands.as_ref() else {
            return Err(ConnectorError::operation_not_allowed(
                "connector has not been started",
            ));
        };

        let snapshot = self.state();
        if snapshot.is_terminal() {
            return Err(ConnectorError::for_terminal_state(&snapshot));
        }
        if self.finish_requested.load(Ordering::SeqCst) {
            return Err(ConnectorError::operation_not_allowed(
                "connector is finishing, no new messages accepted",
            ));
        }
        Ok(commands)
    }

    /// Serialize `body` as JSON and queue it for publishing
    pub fn enqueue<T: Serialize + ?Sized>(&self, routing_key: &str, body: &T) -> ConnectorResult<()> {
        let message = PendingMessage::from_serializable(routing_key, body)?;
        self.enqueue_message(message)
    }

    pub fn enqueue_message(&self, message: PendingMessage) -> ConnectorResult<()> {
        let commands = self.accepting_sender()?;
        self.queue.push_back(message);
        let _ = commands.send(LoopEvent::Wakeup);
        Ok(())
    }

    /// Queue several messages at once, keeping their order; returns how many were queued
    pub fn enqueue_many<I>(&self, messages: I) -> ConnectorResult<usize>
    where
        I: IntoIterator<Item = PendingMessage>,
    {
        let commands = self.accepting_sender()?;
        let messages: Vec<_> = messages.into_iter().collect();
        let count = messages.len();
        self.queue.extend_back(messages);
        let _ = commands.send(LoopEvent::Wakeup);
        Ok(count)
    }

    /// Publish everything still queued, wait for confirms, then close; blocks until done
    pub fn finish_gracefully(&self) -> ConnectorResult<()> {
        self.request_finish(LoopEvent::FinishGently)?;
        self.join_worker()
    }

    /// Close immediately, keeping unsent and unconfirmed messages as leftovers; blocks until done
    pub fn force_finish(&self) -> ConnectorResult<()> {
        self.request_finish(LoopEvent::ForceFinish)?;
        self.join_worker()
    }

    fn request_finish(&self, command: LoopEvent) -> ConnectorResult<()> {
        let Some(commands) = self.commands.as_ref() else {
            return Err(ConnectorError::operation_not_allowed(
                "connector has not been started",
            ));
        };
        self.finish_requested.store(true, Ordering::SeqCst);
        // The loop may already have stopped on its own
        let _ = commands.send(command);
        Ok(())
    }

    /// Wait for the event-loop thread; concurrent callers wait for the same exit
    fn join_worker(&self) -> ConnectorResult<()> {
        let mut worker = lock(&self.worker);
        let Some(handle) = worker.take() else {
            return Ok(());
        };

        match handle.join() {
            Ok(summary) => {
                info!(
                    state = %summary.state.state,
                    leftovers = summary.leftovers,
                    "Connector finished"
                );
                *lock(&self.summary) = Some(summary);
                Ok(())
            }
            Err(_) => {
                error!("Connector event loop thread panicked");
                Err(ConnectorError::LoopPanicked)
            }
        }
    }

    /// Latest state as seen by the event loop
    pub fn state(&self) -> StateSnapshot {
        *self.state.borrow()
    }

    /// Block until a channel is open for publishing; false on timeout or terminal state
    ///
    /// A graceful finish requested before the first channel opens closes
    /// without publishing, so callers that enqueue and finish right away
    /// should wait here first.
    pub fn wait_until_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let snapshot = self.state();
            if snapshot.state.can_publish() {
                return true;
            }
            if snapshot.is_terminal() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(STATE_POLL_INTERVAL);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn any_leftovers(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Remove and return everything that was not confirmed by the broker
    pub fn get_leftovers(&self) -> ConnectorResult<Vec<PendingMessage>> {
        if !self.is_finished() {
            return Err(ConnectorError::operation_not_allowed(
                "leftovers are only available after the connector finished",
            ));
        }
        // A terminal loop exits right away; wait so its rescued messages are included
        self.join_worker()?;
        Ok(self.queue.drain())
    }

    /// Report of the finished event loop, once it has been joined
    pub fn summary(&self) -> Option<LoopSummary> {
        lock(&self.summary).clone()
    }
}

impl Drop for AsynchronousConnector {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(handle) = worker else {
            return;
        };

        if let Some(commands) = &self.commands {
            warn!("Connector dropped while running, force-finishing");
            let _ = commands.send(LoopEvent::ForceFinish);
        }
        if handle.join().is_err() {
            error!("Connector event loop thread panicked");
        }
    }
}
