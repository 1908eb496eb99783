//! Broker connection state machine
//!
//! Transitions are a pure function of `(state, consecutive failures, event)`; the
//! worker only executes the returned [`WorkerAction`] and feeds the outcome back as
//! the next [`WorkerEvent`].

use embassy_time::Duration;
use log::{info, warn};

/// Connection states of the telemetry worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Initial state, also entered to back off before a fresh resolve
    Disconnected,
    ResolveBroker,
    ConnectBroker,
    Subscribe,
    Connected,
}

/// Outcomes reported by the worker after running an action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// Worker started or the disconnected backoff elapsed
    Started,
    BrokerResolved,
    ResolveFailed,
    BrokerConnected,
    ConnectFailed,
    Subscribed,
    SubscribeFailed,
    /// A poll round finished with the session intact
    PollIdle,
    /// Transport error, closed socket or external disconnect notification
    LinkLost,
}

/// What the worker does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    Resolve,
    Connect,
    Subscribe,
    Poll,
    /// Sleep, then run the entry action of the current state
    Retry(Duration),
    /// Close the socket, then run the entry action of the current state
    Teardown,
    /// Idle in `Disconnected`, then report [`WorkerEvent::Started`]
    Backoff(Duration),
}

/// Retry delays and escalation limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures in `ConnectBroker` or `Subscribe` before falling back to a resolve
    pub max_failures: u8,
    pub resolve_retry: Duration,
    pub connect_retry: Duration,
    pub disconnected_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: 4,
            resolve_retry: Duration::from_secs(2),
            connect_retry: Duration::from_secs(2),
            disconnected_backoff: Duration::from_secs(4),
        }
    }
}

/// Result of one transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: ConnectionState,
    pub failures: u8,
    pub action: WorkerAction,
}

impl ConnectionState {
    /// Action run on entering (or re-entering) this state
    pub fn entry_action(self, policy: &RetryPolicy) -> WorkerAction {
        match self {
            ConnectionState::Disconnected => WorkerAction::Backoff(policy.disconnected_backoff),
            ConnectionState::ResolveBroker => WorkerAction::Resolve,
            ConnectionState::ConnectBroker => WorkerAction::Connect,
            ConnectionState::Subscribe => WorkerAction::Subscribe,
            ConnectionState::Connected => WorkerAction::Poll,
        }
    }
}

/// Pure transition function of the worker
pub fn transition(
    state: ConnectionState,
    failures: u8,
    event: WorkerEvent,
    policy: &RetryPolicy,
) -> Transition {
    use ConnectionState as S;
    use WorkerEvent as E;

    let go = |state: ConnectionState, failures: u8, action: WorkerAction| Transition {
        state,
        failures,
        action,
    };

    match (state, event) {
        (S::Disconnected, E::Started) => go(S::ResolveBroker, 0, WorkerAction::Resolve),
        (S::Disconnected, _) => go(S::Disconnected, 0, WorkerAction::Backoff(policy.disconnected_backoff)),

        (S::ResolveBroker, E::BrokerResolved) => go(S::ConnectBroker, 0, WorkerAction::Connect),
        (S::ResolveBroker, E::ResolveFailed | E::LinkLost) => {
            go(S::ResolveBroker, 0, WorkerAction::Retry(policy.resolve_retry))
        }

        (S::ConnectBroker, E::BrokerConnected) => go(S::Subscribe, 0, WorkerAction::Subscribe),
        (S::ConnectBroker, E::ConnectFailed) => {
            let failures = failures.saturating_add(1);
            if failures >= policy.max_failures {
                go(S::ResolveBroker, 0, WorkerAction::Retry(policy.connect_retry))
            } else {
                go(S::ConnectBroker, failures, WorkerAction::Retry(policy.connect_retry))
            }
        }
        (S::ConnectBroker, E::LinkLost) => go(S::ResolveBroker, 0, WorkerAction::Teardown),

        (S::Subscribe, E::Subscribed) => go(S::Connected, 0, WorkerAction::Poll),
        (S::Subscribe, E::SubscribeFailed) => {
            let failures = failures.saturating_add(1);
            if failures >= policy.max_failures {
                go(S::ResolveBroker, 0, WorkerAction::Teardown)
            } else {
                go(S::Subscribe, failures, WorkerAction::Subscribe)
            }
        }
        (S::Subscribe, E::LinkLost) => go(S::ResolveBroker, 0, WorkerAction::Teardown),

        (S::Connected, E::PollIdle) => go(S::Connected, 0, WorkerAction::Poll),
        (S::Connected, E::LinkLost) => go(S::ResolveBroker, 0, WorkerAction::Teardown),

        // Anything else re-runs the state's own action
        (state, _) => go(state, failures, state.entry_action(policy)),
    }
}

/// Connection state machine driven by the telemetry worker
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    current_state: ConnectionState,
    previous_state: Option<ConnectionState>,
    failures: u8,
    policy: RetryPolicy,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current_state: ConnectionState::Disconnected,
            previous_state: None,
            failures: 0,
            policy,
        }
    }

    pub fn get_current_state(&self) -> ConnectionState {
        self.current_state
    }

    pub fn get_previous_state(&self) -> Option<ConnectionState> {
        self.previous_state
    }

    /// Consecutive failures in the current state
    pub fn get_retry_count(&self) -> u8 {
        self.failures
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_connected(&self) -> bool {
        self.current_state == ConnectionState::Connected
    }

    /// Apply an event and return the next action
    pub fn handle_event(&mut self, event: WorkerEvent) -> WorkerAction {
        let next = transition(self.current_state, self.failures, event, &self.policy);

        if next.state != self.current_state {
            match next.state {
                ConnectionState::Connected => info!("[MQTT] Session established"),
                ConnectionState::ResolveBroker if self.current_state != ConnectionState::Disconnected => {
                    warn!("[MQTT] {:?} -> ResolveBroker after {:?}", self.current_state, event);
                }
                _ => {}
            }
            self.previous_state = Some(self.current_state);
            self.current_state = next.state;
        }

        self.failures = next.failures;
        next.action
    }

    /// Action of the current state, used after a retry delay or teardown
    pub fn entry_action(&self) -> WorkerAction {
        self.current_state.entry_action(&self.policy)
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
