//! Client session state machine
//!
//! Three independent state variables, each taking one of the four
//! [`ConnectionState`] values:
//!
//! ```text
//! Connection:   signaling connection + capability negotiation
//! Publication:  send transport + producer
//! Subscription: receive transport + consumer
//!
//! Disconnected --> Connecting: connect()/publish()/subscribe()
//! Connecting --> Connected: sequence completed
//! Connecting --> Failed: any step failed
//! Connected --> Failed: connectivity lost
//! Connected --> Disconnected: disconnect()/unpublish()/unsubscribe() confirmed
//! Failed --> Connecting: retry
//! ```

use std::fmt;

use crate::network::SignalingError;

/// State of the connection, publication or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether a new attempt may start from this state
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One state transition, as delivered to the observer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Connection(ConnectionState),
    Publication(ConnectionState),
    Subscription(ConnectionState),
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(s) => write!(f, "connection: {}", s),
            Self::Publication(s) => write!(f, "publication: {}", s),
            Self::Subscription(s) => write!(f, "subscription: {}", s),
        }
    }
}

/// Callback for state transitions
pub type StateCallback = Box<dyn Fn(StateChange) + Send + Sync + 'static>;

/// Snapshot of all three state variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub publication: ConnectionState,
    pub subscription: ConnectionState,
}

impl SessionState {
    /// Apply a transition; false if the variable already had that value
    pub fn apply(&mut self, change: StateChange) -> bool {
        let (slot, new) = match change {
            StateChange::Connection(s) => (&mut self.connection, s),
            StateChange::Publication(s) => (&mut self.publication, s),
            StateChange::Subscription(s) => (&mut self.subscription, s),
        };
        if *slot == new {
            return false;
        }
        *slot = new;
        true
    }

    pub fn can_connect(&self) -> bool {
        self.connection.is_idle()
    }

    pub fn can_publish(&self) -> bool {
        self.connection.is_connected() && self.publication.is_idle()
    }

    pub fn can_subscribe(&self) -> bool {
        self.connection.is_connected()
            && self.publication.is_connected()
            && self.subscription.is_idle()
    }

    pub fn can_unpublish(&self) -> bool {
        self.publication.is_connected()
    }

    pub fn can_unsubscribe(&self) -> bool {
        self.subscription.is_connected()
    }

    pub fn can_disconnect(&self) -> bool {
        !matches!(self.connection, ConnectionState::Disconnected)
    }

    /// Guard for an operation, as an `InvalidState` error
    pub fn check(&self, allowed: bool, operation: &str) -> Result<(), SignalingError> {
        if allowed {
            Ok(())
        } else {
            Err(SignalingError::InvalidState(format!(
                "cannot {} while {}",
                operation, self
            )))
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection {}, publication {}, subscription {}",
            self.connection, self.publication, self.subscription
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_follow_state() {
        let mut state = SessionState::default();
        assert!(state.can_connect());
        assert!(!state.can_publish());
        assert!(!state.can_disconnect());

        state.apply(StateChange::Connection(ConnectionState::Connected));
        assert!(state.can_publish());
        assert!(!state.can_subscribe());

        state.apply(StateChange::Publication(ConnectionState::Connected));
        assert!(!state.can_publish());
        assert!(state.can_subscribe());
        assert!(state.can_unpublish());
        assert!(!state.can_unsubscribe());

        state.apply(StateChange::Subscription(ConnectionState::Failed));
        assert!(state.can_subscribe());
    }

    #[test]
    fn test_apply_reports_only_real_transitions() {
        let mut state = SessionState::default();
        assert!(!state.apply(StateChange::Publication(ConnectionState::Disconnected)));
        assert!(state.apply(StateChange::Publication(ConnectionState::Connecting)));
        assert!(!state.apply(StateChange::Publication(ConnectionState::Connecting)));
    }

    #[test]
    fn test_guard_violation_is_invalid_state() {
        let state = SessionState::default();
        tokio_test::assert_ok!(state.check(state.can_connect(), "connect"));
        let err = tokio_test::assert_err!(state.check(state.can_publish(), "publish"));
        assert!(matches!(err, SignalingError::InvalidState(_)));
        assert!(err.to_string().contains("connection disconnected"));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(
            StateChange::Subscription(ConnectionState::Failed).to_string(),
            "subscription: failed"
        );
    }
}
