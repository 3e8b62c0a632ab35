//! Graceful and forced shutdown
//!
//! A graceful finish keeps publishing and waits for confirms, checking
//! progress at a fixed interval. If the number of outstanding messages stops
//! shrinking for too long, the finish escalates to a forced one. A forced
//! finish closes immediately and leaves everything unsent as leftovers.

use super::event_loop::{LoopEvent, PublisherLoop};
use crate::broker::CloseReason;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tuning of the graceful drain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainPolicy {
    pub check_interval: Duration,
    /// Checks in a row without progress before escalating
    pub max_stagnant_checks: u32,
    /// Absolute cap on checks, regardless of progress
    pub max_checks: Option<u32>,
    /// Bound on closing the connection during a forced finish
    pub force_close_timeout: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(500),
            max_stagnant_checks: 10,
            max_checks: None,
            force_close_timeout: Duration::from_secs(2),
        }
    }
}

/// Why a graceful finish gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    Stagnated { checks: u32 },
    CheckLimit { checks: u32 },
}

/// Outcome of one drain check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainDecision {
    /// Nothing left to publish or confirm
    Finished,
    KeepWaiting,
    Escalate(EscalationReason),
}

#[derive(Debug)]
pub struct ShutdownCoordinator {
    policy: DrainPolicy,
    stop_requested: bool,
    force_requested: bool,
    checks: u32,
    stagnant_checks: u32,
    last_outstanding: Option<usize>,
}

impl ShutdownCoordinator {
    pub fn new(policy: DrainPolicy) -> Self {
        Self {
            policy,
            stop_requested: false,
            force_requested: false,
            checks: 0,
            stagnant_checks: 0,
            last_outstanding: None,
        }
    }

    pub fn policy(&self) -> &DrainPolicy {
        &self.policy
    }

    /// Record a graceful finish request; false if one was already recorded
    pub fn request_stop(&mut self) -> bool {
        !std::mem::replace(&mut self.stop_requested, true)
    }

    /// Record a forced finish request; false if one was already recorded
    pub fn request_force(&mut self) -> bool {
        !std::mem::replace(&mut self.force_requested, true)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn force_requested(&self) -> bool {
        self.force_requested
    }

    /// Judge drain progress from the current outstanding counts
    pub fn evaluate(&mut self, unpublished: usize, unconfirmed: usize) -> DrainDecision {
        self.checks += 1;
        let outstanding = unpublished + unconfirmed;

        if outstanding == 0 {
            return DrainDecision::Finished;
        }

        match self.last_outstanding {
            Some(previous) if outstanding < previous => self.stagnant_checks = 0,
            Some(_) => self.stagnant_checks += 1,
            None => {}
        }
        self.last_outstanding = Some(outstanding);

        if self.stagnant_checks >= self.policy.max_stagnant_checks {
            return DrainDecision::Escalate(EscalationReason::Stagnated {
                checks: self.stagnant_checks,
            });
        }
        if let Some(max_checks) = self.policy.max_checks {
            if self.checks >= max_checks {
                return DrainDecision::Escalate(EscalationReason::CheckLimit {
                    checks: self.checks,
                });
            }
        }

        DrainDecision::KeepWaiting
    }

    pub fn checks(&self) -> u32 {
        self.checks
    }
}

impl PublisherLoop {
    pub(super) async fn finish_gently(&mut self) {
        if self.state.is_terminal() {
            debug!("Finish requested on a connector that already finished");
            return;
        }
        if !self.shutdown.request_stop() {
            debug!("Graceful finish already in progress");
            return;
        }

        let (unpublished, unconfirmed) = self.outstanding();
        info!(unpublished, unconfirmed, "Graceful finish requested");
        if self.state.is_available() {
            self.state.set_wanting_to_stop();
        }
        self.on_drain_check().await;
    }

    pub(super) async fn on_drain_check(&mut self) {
        if !self.running || self.state.is_terminal() {
            return;
        }

        let (unpublished, unconfirmed) = self.outstanding();
        match self.shutdown.evaluate(unpublished, unconfirmed) {
            DrainDecision::Finished => {
                info!("All messages published and confirmed, closing connection");
                self.close_connection_gracefully().await;
            }
            DrainDecision::KeepWaiting => {
                debug!(
                    unpublished,
                    unconfirmed,
                    check = self.shutdown.checks(),
                    "Waiting for outstanding messages"
                );
                if unpublished > 0 {
                    self.wake();
                }
                let interval = self.shutdown.policy().check_interval;
                self.schedule(interval, LoopEvent::DrainCheck);
            }
            DrainDecision::Escalate(reason) => {
                warn!(
                    ?reason,
                    unpublished, unconfirmed, "Graceful finish made no progress, forcing"
                );
                self.force_finish().await;
            }
        }
    }

    pub(super) async fn force_finish(&mut self) {
        if self.state.is_force_finished() {
            debug!("Connector already force-finished");
            return;
        }
        self.shutdown.request_force();

        let (unpublished, unconfirmed) = self.outstanding();
        warn!(unpublished, unconfirmed, "Force-finishing connector");
        self.state.set_force_finished();
        self.state.set_detail_closed_by_publisher();

        let timeout = self.shutdown.policy().force_close_timeout;
        let (channel, connection) = self.builder.take_handles();
        if let Some(channel) = channel {
            if tokio::time::timeout(timeout, channel.close()).await.is_err() {
                warn!("Channel did not close in time");
            }
        }
        if let Some(connection) = connection {
            if tokio::time::timeout(timeout, connection.close()).await.is_err() {
                warn!("Connection did not close in time");
            }
        }

        self.on_connection_closed(CloseReason::ByPublisher).await;
    }

    /// Close channel and connection on purpose and finish as permanently unavailable
    pub(super) async fn close_connection_gracefully(&mut self) {
        let timeout = self.shutdown.policy().force_close_timeout;
        let (channel, connection) = self.builder.take_handles();

        if let Some(channel) = channel {
            match tokio::time::timeout(timeout, channel.close()).await {
                Ok(Err(e)) => warn!("Channel close failed: {}", e),
                Err(_) => warn!("Channel did not close in time"),
                Ok(Ok(())) => {}
            }
        }
        if let Some(connection) = connection {
            match tokio::time::timeout(timeout, connection.close()).await {
                Ok(Err(e)) => warn!("Connection close failed: {}", e),
                Err(_) => warn!("Connection did not close in time"),
                Ok(Ok(())) => {}
            }
        }

        self.on_connection_closed(CloseReason::ByPublisher).await;
    }
}
