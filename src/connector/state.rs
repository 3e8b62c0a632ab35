//! Connection state machine
//!
//! The state is owned and mutated only by the event loop. Every change is
//! mirrored into a `watch` channel so caller threads can read a consistent
//! [`StateSnapshot`] without locking the loop.

use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle state of the connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, event loop not yet running
    NotStarted,
    /// Connecting, reconnecting or switching channels
    WaitingToBeAvailable,
    /// Channel open with confirms enabled, publishing
    Available,
    /// Draining after a graceful finish request
    AvailableButWantsToStop,
    /// Closed for good, either on purpose or after exhausting all nodes
    PermanentlyUnavailable,
    /// Closed by force; terminal
    ForceFinished,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::NotStarted => "NOT_STARTED",
            ConnectionState::WaitingToBeAvailable => "WAITING_TO_BE_AVAILABLE",
            ConnectionState::Available => "AVAILABLE",
            ConnectionState::AvailableButWantsToStop => "AVAILABLE_BUT_WANTS_TO_STOP",
            ConnectionState::PermanentlyUnavailable => "PERMANENTLY_UNAVAILABLE",
            ConnectionState::ForceFinished => "FORCE_FINISHED",
        }
    }

    /// Whether the event loop is done with this connector
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::PermanentlyUnavailable | ConnectionState::ForceFinished
        )
    }

    /// Whether messages may be handed to the channel in this state
    pub fn can_publish(&self) -> bool {
        matches!(
            self,
            ConnectionState::Available | ConnectionState::AvailableButWantsToStop
        )
    }

    /// Transition table (pure function)
    pub fn can_transition_to(&self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        match (*self, to) {
            (from, to) if from == to => true,
            (ForceFinished, _) => false,
            (_, ForceFinished) => true,
            (NotStarted, WaitingToBeAvailable) => true,
            (WaitingToBeAvailable, Available) => true,
            (Available, AvailableButWantsToStop) => true,
            (Available | AvailableButWantsToStop, WaitingToBeAvailable) => true,
            (WaitingToBeAvailable | Available | AvailableButWantsToStop, PermanentlyUnavailable) => {
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State plus the detail flags callers use to explain a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    pub closed_by_publisher: bool,
    pub could_not_connect: bool,
    pub authentication_failed: bool,
}

impl StateSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_force_finished(&self) -> bool {
        self.state == ConnectionState::ForceFinished
    }

    pub fn is_permanently_unavailable(&self) -> bool {
        self.state == ConnectionState::PermanentlyUnavailable
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::NotStarted,
            closed_by_publisher: false,
            could_not_connect: false,
            authentication_failed: false,
        }
    }
}

/// Event-loop side of the state, publishing every change to watchers
pub struct ConnectionStateMachine {
    current: StateSnapshot,
    watchers: watch::Sender<StateSnapshot>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let current = StateSnapshot::default();
        let (watchers, _) = watch::channel(current);
        Self { current, watchers }
    }

    /// Receiver that always holds the latest snapshot
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.watchers.subscribe()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.current
    }

    pub fn state(&self) -> ConnectionState {
        self.current.state
    }

    pub fn is_not_started(&self) -> bool {
        self.current.state == ConnectionState::NotStarted
    }

    pub fn is_waiting_to_be_available(&self) -> bool {
        self.current.state == ConnectionState::WaitingToBeAvailable
    }

    pub fn is_available(&self) -> bool {
        self.current.state == ConnectionState::Available
    }

    pub fn is_wanting_to_stop(&self) -> bool {
        self.current.state == ConnectionState::AvailableButWantsToStop
    }

    /// Available, or draining after a finish request
    pub fn is_available_for_publish(&self) -> bool {
        self.current.state.can_publish()
    }

    pub fn is_permanently_unavailable(&self) -> bool {
        self.current.is_permanently_unavailable()
    }

    pub fn is_terminal(&self) -> bool {
        self.current.state.is_terminal()
    }

    pub fn is_force_finished(&self) -> bool {
        self.current.is_force_finished()
    }

    /// Move to `to`; returns false (and leaves the state alone) for a forbidden transition
    pub fn transition(&mut self, to: ConnectionState) -> bool {
        let from = self.current.state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Refusing invalid connector state transition");
            return false;
        }

        log_state_transition(from, to);
        self.current.state = to;
        self.publish();
        true
    }

    pub fn set_waiting_to_be_available(&mut self) -> bool {
        self.transition(ConnectionState::WaitingToBeAvailable)
    }

    pub fn set_available(&mut self) -> bool {
        self.transition(ConnectionState::Available)
    }

    pub fn set_wanting_to_stop(&mut self) -> bool {
        self.transition(ConnectionState::AvailableButWantsToStop)
    }

    pub fn set_permanently_unavailable(&mut self) -> bool {
        self.transition(ConnectionState::PermanentlyUnavailable)
    }

    pub fn set_force_finished(&mut self) -> bool {
        self.transition(ConnectionState::ForceFinished)
    }

    pub fn set_detail_closed_by_publisher(&mut self) {
        self.current.closed_by_publisher = true;
        self.publish();
    }

    pub fn set_detail_could_not_connect(&mut self) {
        self.current.could_not_connect = true;
        self.publish();
    }

    pub fn set_detail_authentication_failed(&mut self) {
        self.current.authentication_failed = true;
        self.publish();
    }

    fn publish(&self) {
        self.watchers.send_replace(self.current);
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn log_state_transition(from: ConnectionState, to: ConnectionState) {
    use ConnectionState::*;

    match (from, to) {
        (WaitingToBeAvailable, Available) => info!("Connector is available for publishing"),
        (Available | AvailableButWantsToStop, WaitingToBeAvailable) => {
            warn!(from = %from, "Connector lost its channel, waiting to become available again")
        }
        (_, ForceFinished) => warn!(from = %from, "Connector force-finished"),
        (_, PermanentlyUnavailable) => info!(from = %from, "Connector is permanently unavailable"),
        _ => debug!(from = %from, to = %to, "Connector state changed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 6] = [
        NotStarted,
        WaitingToBeAvailable,
        Available,
        AvailableButWantsToStop,
        PermanentlyUnavailable,
        ForceFinished,
    ];

    #[test]
    fn test_initial_snapshot() {
        let machine = ConnectionStateMachine::new();
        let snapshot = machine.snapshot();

        assert_eq!(snapshot.state, NotStarted);
        assert!(!snapshot.closed_by_publisher);
        assert!(!snapshot.could_not_connect);
        assert!(!snapshot.authentication_failed);
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut machine = ConnectionStateMachine::new();

        assert!(machine.is_not_started());
        assert!(machine.set_waiting_to_be_available());
        assert!(machine.is_waiting_to_be_available());
        assert!(machine.set_available());
        assert!(machine.is_available());
        assert!(machine.is_available_for_publish());
        assert!(machine.set_wanting_to_stop());
        assert!(machine.is_wanting_to_stop());
        assert!(machine.is_available_for_publish());
        assert!(machine.set_permanently_unavailable());
        assert!(machine.is_permanently_unavailable());
        assert!(machine.is_terminal());
        assert!(!machine.is_available_for_publish());
    }

    #[test]
    fn test_same_state_is_idempotent() {
        let mut machine = ConnectionStateMachine::new();
        machine.set_waiting_to_be_available();

        assert!(machine.set_waiting_to_be_available());
        assert_eq!(machine.state(), WaitingToBeAvailable);
    }

    #[test]
    fn test_invalid_transition_is_refused() {
        let mut machine = ConnectionStateMachine::new();

        assert!(!machine.set_available());
        assert_eq!(machine.state(), NotStarted);

        machine.set_waiting_to_be_available();
        assert!(!machine.set_wanting_to_stop());
        assert_eq!(machine.state(), WaitingToBeAvailable);
    }

    #[test]
    fn test_force_finished_is_terminal() {
        for from in ALL {
            let allowed: Vec<_> = ALL
                .iter()
                .filter(|to| **to != ForceFinished && ForceFinished.can_transition_to(**to))
                .collect();
            assert!(allowed.is_empty());
            assert!(from.can_transition_to(ForceFinished));
        }
    }

    #[test]
    fn test_permanently_unavailable_only_leads_to_force_finished() {
        for to in ALL {
            let expected = matches!(to, PermanentlyUnavailable | ForceFinished);
            assert_eq!(PermanentlyUnavailable.can_transition_to(to), expected, "{to}");
        }
    }

    #[test]
    fn test_not_started_cannot_skip_waiting() {
        assert!(!NotStarted.can_transition_to(Available));
        assert!(!NotStarted.can_transition_to(PermanentlyUnavailable));
        assert!(NotStarted.can_transition_to(WaitingToBeAvailable));
    }

    #[test]
    fn test_watchers_see_transitions_and_details() {
        let mut machine = ConnectionStateMachine::new();
        let receiver = machine.subscribe();

        machine.set_waiting_to_be_available();
        machine.set_detail_could_not_connect();
        machine.set_detail_authentication_failed();
        machine.set_permanently_unavailable();

        let seen = *receiver.borrow();
        assert_eq!(seen.state, PermanentlyUnavailable);
        assert!(seen.could_not_connect);
        assert!(seen.authentication_failed);
    }

    #[test]
    fn test_display_uses_wire_names() {
        assert_eq!(AvailableButWantsToStop.to_string(), "AVAILABLE_BUT_WANTS_TO_STOP");
        assert_eq!(ForceFinished.to_string(), "FORCE_FINISHED");
    }
}
