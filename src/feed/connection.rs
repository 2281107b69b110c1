use crate::feed::types::{ConnectionState, ConnectionStatus, FeedConfig};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    HandshakeSucceeded,
    HandshakeFailed(String),
    SocketError(String),
    SocketClosed,
    ReconnectDue,
    Retry,
    Destroy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    OpenSocket,
    ScheduleReconnect(Duration),
    StartHeartbeat,
    StopHeartbeat,
    ReplaySubscriptions,
    CloseSocket,
    ReportError(String),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &FeedConfig) -> Self {
        Self {
            initial_delay: config.reconnect_initial_delay,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// `min(initial * 2^attempts, max)`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(31);
        self.initial_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }
}

/// Connection lifecycle as a pure transition function. The machine never
/// touches a socket; callers execute the returned actions.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
    policy: ReconnectPolicy,
    reconnect_pending: bool,
    gave_up: bool,
    destroyed: bool,
    close_reported: bool,
    last_reason: Option<String>,
}

impl ConnectionMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            policy,
            reconnect_pending: false,
            gave_up: false,
            destroyed: false,
            close_reported: false,
            last_reason: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt: self.attempts,
            reason: self.last_reason.clone(),
        }
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        if self.destroyed {
            debug!(?event, "ignoring connection event after destroy");
            return Vec::new();
        }

        let previous = self.state;
        let actions = match (self.state, event) {
            (_, ConnectionEvent::Destroy) => self.destroy(),
            (ConnectionState::Disconnected, ConnectionEvent::Connect)
                if !self.reconnect_pending =>
            {
                self.open("connecting")
            }
            (ConnectionState::Connecting, ConnectionEvent::HandshakeSucceeded) => {
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                self.gave_up = false;
                self.close_reported = false;
                self.last_reason = Some("connected".to_string());
                vec![
                    ConnectionAction::StartHeartbeat,
                    ConnectionAction::ReplaySubscriptions,
                ]
            }
            (ConnectionState::Connecting, ConnectionEvent::HandshakeFailed(reason))
            | (ConnectionState::Connecting, ConnectionEvent::SocketError(reason)) => {
                self.state = ConnectionState::Errored;
                let mut actions = vec![ConnectionAction::ReportError(reason.clone())];
                actions.extend(self.fail(reason));
                actions
            }
            (ConnectionState::Connecting, ConnectionEvent::SocketClosed) => {
                self.state = ConnectionState::Errored;
                let reason = "socket closed during handshake".to_string();
                let mut actions = vec![ConnectionAction::ReportError(reason.clone())];
                actions.extend(self.fail(reason));
                actions
            }
            (ConnectionState::Connected, ConnectionEvent::SocketError(reason)) => {
                self.last_reason = Some(reason.clone());
                self.close_reported = true;
                vec![ConnectionAction::ReportError(reason)]
            }
            (ConnectionState::Connected, ConnectionEvent::SocketClosed) => {
                self.state = ConnectionState::Disconnected;
                let mut actions = vec![ConnectionAction::StopHeartbeat];
                // A close right after a reported socket error is the same failure.
                if !std::mem::take(&mut self.close_reported) {
                    actions.push(ConnectionAction::ReportError("socket closed".to_string()));
                }
                actions.extend(self.fail("socket closed".to_string()));
                actions
            }
            (
                ConnectionState::Disconnected | ConnectionState::Errored,
                ConnectionEvent::ReconnectDue,
            ) if self.reconnect_pending => {
                self.reconnect_pending = false;
                self.open("reconnecting")
            }
            (
                ConnectionState::Disconnected | ConnectionState::Errored,
                ConnectionEvent::Retry,
            ) => {
                info!(attempts = self.attempts, "manual connection retry");
                self.attempts = 0;
                self.gave_up = false;
                self.reconnect_pending = false;
                self.open("manual retry")
            }
            (state, event) => {
                debug!(?state, ?event, "connection event has no transition");
                Vec::new()
            }
        };

        if previous != self.state {
            info!(from = ?previous, to = ?self.state, attempts = self.attempts, "connection state changed");
        }
        actions
    }

    fn open(&mut self, reason: &str) -> Vec<ConnectionAction> {
        self.state = ConnectionState::Connecting;
        self.last_reason = Some(reason.to_string());
        vec![ConnectionAction::OpenSocket]
    }

    fn fail(&mut self, reason: String) -> Vec<ConnectionAction> {
        let delay = self.policy.delay_for(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        self.last_reason = Some(reason);

        if self.attempts > self.policy.max_attempts {
            self.state = ConnectionState::Errored;
            self.gave_up = true;
            self.reconnect_pending = false;
            warn!(
                attempts = self.attempts,
                max_attempts = self.policy.max_attempts,
                "reconnect attempts exhausted, waiting for manual retry"
            );
            return vec![ConnectionAction::GiveUp];
        }

        self.reconnect_pending = true;
        vec![ConnectionAction::ScheduleReconnect(delay)]
    }

    fn destroy(&mut self) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Connected => {
                actions.push(ConnectionAction::StopHeartbeat);
                actions.push(ConnectionAction::CloseSocket);
            }
            ConnectionState::Connecting => actions.push(ConnectionAction::CloseSocket),
            ConnectionState::Disconnected | ConnectionState::Errored => {}
        }
        self.destroyed = true;
        self.reconnect_pending = false;
        self.state = ConnectionState::Disconnected;
        self.last_reason = Some("destroyed".to_string());
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(max_attempts: u32) -> ConnectionMachine {
        ConnectionMachine::new(ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            max_attempts,
        })
    }

    fn scheduled_delay(actions: &[ConnectionAction]) -> Option<Duration> {
        actions.iter().find_map(|action| match action {
            ConnectionAction::ScheduleReconnect(delay) => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn handshake_starts_heartbeat_and_replays() {
        let mut machine = machine(5);
        assert_eq!(
            machine.handle(ConnectionEvent::Connect),
            vec![ConnectionAction::OpenSocket]
        );
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let actions = machine.handle(ConnectionEvent::HandshakeSucceeded);
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(actions.contains(&ConnectionAction::StartHeartbeat));
        assert!(actions.contains(&ConnectionAction::ReplaySubscriptions));
    }

    #[test]
    fn consecutive_failures_back_off_monotonically_up_to_the_cap() {
        let mut machine = machine(50);
        machine.handle(ConnectionEvent::Connect);

        let mut delays = Vec::new();
        for _ in 0..8 {
            let actions = machine.handle(ConnectionEvent::HandshakeFailed("refused".to_string()));
            assert_eq!(machine.state(), ConnectionState::Errored);
            delays.push(scheduled_delay(&actions).expect("reconnect should be scheduled"));
            assert_eq!(
                machine.handle(ConnectionEvent::ReconnectDue),
                vec![ConnectionAction::OpenSocket]
            );
        }

        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[3], Duration::from_millis(800));
        assert_eq!(delays[7], Duration::from_millis(1_000));
    }

    #[test]
    fn successful_handshake_resets_attempts() {
        let mut machine = machine(50);
        machine.handle(ConnectionEvent::Connect);
        machine.handle(ConnectionEvent::HandshakeFailed("refused".to_string()));
        machine.handle(ConnectionEvent::ReconnectDue);
        machine.handle(ConnectionEvent::HandshakeFailed("refused".to_string()));
        assert_eq!(machine.attempts(), 2);

        machine.handle(ConnectionEvent::ReconnectDue);
        machine.handle(ConnectionEvent::HandshakeSucceeded);
        assert_eq!(machine.attempts(), 0);

        let actions = machine.handle(ConnectionEvent::SocketClosed);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(actions.contains(&ConnectionAction::StopHeartbeat));
        assert_eq!(scheduled_delay(&actions), Some(Duration::from_millis(100)));
    }

    #[test]
    fn socket_close_is_reported_once() {
        let mut machine = machine(50);
        machine.handle(ConnectionEvent::Connect);
        machine.handle(ConnectionEvent::HandshakeSucceeded);

        let closed = machine.handle(ConnectionEvent::SocketClosed);
        assert!(closed.contains(&ConnectionAction::ReportError("socket closed".to_string())));

        machine.handle(ConnectionEvent::ReconnectDue);
        machine.handle(ConnectionEvent::HandshakeSucceeded);
        let errored = machine.handle(ConnectionEvent::SocketError("reset by peer".to_string()));
        assert_eq!(
            errored,
            vec![ConnectionAction::ReportError("reset by peer".to_string())]
        );
        let closed = machine.handle(ConnectionEvent::SocketClosed);
        assert!(!closed
            .iter()
            .any(|action| matches!(action, ConnectionAction::ReportError(_))));
    }

    #[test]
    fn gives_up_after_max_attempts_until_manual_retry() {
        let mut machine = machine(2);
        machine.handle(ConnectionEvent::Connect);

        machine.handle(ConnectionEvent::HandshakeFailed("refused".to_string()));
        machine.handle(ConnectionEvent::ReconnectDue);
        machine.handle(ConnectionEvent::HandshakeFailed("refused".to_string()));
        machine.handle(ConnectionEvent::ReconnectDue);
        let actions = machine.handle(ConnectionEvent::HandshakeFailed("refused".to_string()));

        assert!(actions.contains(&ConnectionAction::GiveUp));
        assert_eq!(machine.state(), ConnectionState::Errored);
        assert!(machine.has_given_up());
        assert!(machine.handle(ConnectionEvent::ReconnectDue).is_empty());

        assert_eq!(
            machine.handle(ConnectionEvent::Retry),
            vec![ConnectionAction::OpenSocket]
        );
        assert_eq!(machine.attempts(), 0);
    }

    #[test]
    fn socket_error_while_connected_is_reported_but_not_a_transition() {
        let mut machine = machine(5);
        machine.handle(ConnectionEvent::Connect);
        machine.handle(ConnectionEvent::HandshakeSucceeded);

        let actions = machine.handle(ConnectionEvent::SocketError("reset".to_string()));
        assert_eq!(actions, vec![ConnectionAction::ReportError("reset".to_string())]);
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn destroy_is_terminal() {
        let mut machine = machine(5);
        machine.handle(ConnectionEvent::Connect);
        machine.handle(ConnectionEvent::HandshakeSucceeded);

        let actions = machine.handle(ConnectionEvent::Destroy);
        assert_eq!(
            actions,
            vec![ConnectionAction::StopHeartbeat, ConnectionAction::CloseSocket]
        );
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(machine.handle(ConnectionEvent::Connect).is_empty());
        assert!(machine.handle(ConnectionEvent::Retry).is_empty());
        assert!(machine.handle(ConnectionEvent::Destroy).is_empty());
    }
}
