//! Connection State Machine
//!
//! Defines the valid lifecycle transitions for one transport's connection.
//! The machine is pure: it owns nothing but the current state, and the async
//! driver in the root crate is the only writer.

use crate::{ConnectionState, Endpoint, FailureReason};

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Discovery began listening for this transport
    DiscoveryStarted,
    /// A connection attempt to the endpoint was accepted
    ConnectRequested(Endpoint),
    /// The transport handshake completed
    HandshakeSucceeded,
    /// The transport handshake failed
    HandshakeFailed(FailureReason),
    /// The post-failure backoff elapsed; discovery re-arms
    RetryElapsed,
    /// Explicit disconnect, cancelled attempt, or lost connection
    Disconnected,
}

/// Result of a state transition attempt
#[derive(Debug, Clone)]
pub enum TransitionResult {
    /// Transition was valid and the machine moved to this state
    Success(ConnectionState),
    /// Transition was invalid from the current state; state is unchanged
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

/// The connection state machine for one transport
#[derive(Debug)]
pub struct LinkStateMachine {
    current_state: ConnectionState,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self {
            current_state: ConnectionState::Idle,
        }
    }

    /// Get current state
    pub fn state(&self) -> &ConnectionState {
        &self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        // Disconnect is always safe: whatever was in flight resolves to Idle.
        if event == LinkEvent::Disconnected {
            self.current_state = ConnectionState::Idle;
            return TransitionResult::Success(ConnectionState::Idle);
        }

        let new_state = self.get_next_state(&event);

        match new_state {
            Some(state) => {
                self.current_state = state.clone();
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state.clone(),
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: &LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (&self.current_state, event) {
            // From Idle
            (Idle, DiscoveryStarted) => Some(Discovering),
            (Idle, ConnectRequested(e)) => Some(Connecting(e.clone())),

            // From Discovering
            (Discovering, ConnectRequested(e)) => Some(Connecting(e.clone())),

            // From Connecting
            (Connecting(e), HandshakeSucceeded) => Some(Connected(e.clone())),
            (Connecting(_), HandshakeFailed(reason)) => Some(Failed(reason.clone())),
            // A superseding request cancels the in-flight attempt
            (Connecting(_), ConnectRequested(e)) => Some(Connecting(e.clone())),

            // From Failed
            (Failed(_), RetryElapsed) => Some(Discovering),
            (Failed(_), ConnectRequested(e)) => Some(Connecting(e.clone())),

            // Invalid transition
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(addr: &str) -> Endpoint {
        Endpoint::network(addr)
    }

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(*fsm.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_normal_connection_flow() {
        let mut fsm = LinkStateMachine::new();
        let e = endpoint("192.168.1.10:8080");

        let result = fsm.process_event(LinkEvent::DiscoveryStarted);
        assert!(matches!(
            result,
            TransitionResult::Success(ConnectionState::Discovering)
        ));

        let result = fsm.process_event(LinkEvent::ConnectRequested(e.clone()));
        assert!(matches!(
            result,
            TransitionResult::Success(ConnectionState::Connecting(_))
        ));

        let result = fsm.process_event(LinkEvent::HandshakeSucceeded);
        match result {
            TransitionResult::Success(ConnectionState::Connected(got)) => {
                assert_eq!(got, e);
            }
            other => panic!("unexpected transition: {:?}", other),
        }

        let result = fsm.process_event(LinkEvent::Disconnected);
        assert!(matches!(
            result,
            TransitionResult::Success(ConnectionState::Idle)
        ));
    }

    #[test]
    fn test_direct_connect_from_idle() {
        // The remembered-endpoint fast path dials before discovery reports
        let mut fsm = LinkStateMachine::new();
        let result = fsm.process_event(LinkEvent::ConnectRequested(endpoint("10.0.0.2:8080")));
        assert!(matches!(
            result,
            TransitionResult::Success(ConnectionState::Connecting(_))
        ));
    }

    #[test]
    fn test_failed_attempt_rearms_discovery() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::DiscoveryStarted);
        fsm.process_event(LinkEvent::ConnectRequested(endpoint("10.0.0.2:8080")));

        let result = fsm.process_event(LinkEvent::HandshakeFailed(FailureReason::Timeout));
        assert!(matches!(
            result,
            TransitionResult::Success(ConnectionState::Failed(FailureReason::Timeout))
        ));

        let result = fsm.process_event(LinkEvent::RetryElapsed);
        assert!(matches!(
            result,
            TransitionResult::Success(ConnectionState::Discovering)
        ));

        // A later discovery match can still connect
        let result = fsm.process_event(LinkEvent::ConnectRequested(endpoint("10.0.0.3:8080")));
        assert!(matches!(
            result,
            TransitionResult::Success(ConnectionState::Connecting(_))
        ));
    }

    #[test]
    fn test_superseding_connect_replaces_target() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested(endpoint("10.0.0.2:8080")));

        let replacement = endpoint("10.0.0.9:8080");
        let result = fsm.process_event(LinkEvent::ConnectRequested(replacement.clone()));
        match result {
            TransitionResult::Success(ConnectionState::Connecting(got)) => {
                assert_eq!(got, replacement);
            }
            other => panic!("unexpected transition: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_always_lands_in_idle() {
        let e = endpoint("10.0.0.2:8080");
        let histories: Vec<Vec<LinkEvent>> = vec![
            vec![],
            vec![LinkEvent::DiscoveryStarted],
            vec![LinkEvent::ConnectRequested(e.clone())],
            vec![
                LinkEvent::ConnectRequested(e.clone()),
                LinkEvent::HandshakeSucceeded,
            ],
            vec![
                LinkEvent::ConnectRequested(e.clone()),
                LinkEvent::HandshakeFailed(FailureReason::Refused),
            ],
        ];

        for history in histories {
            let mut fsm = LinkStateMachine::new();
            for event in history {
                fsm.process_event(event);
            }
            let result = fsm.process_event(LinkEvent::Disconnected);
            assert!(matches!(
                result,
                TransitionResult::Success(ConnectionState::Idle)
            ));
            assert_eq!(*fsm.state(), ConnectionState::Idle);
        }
    }

    #[test]
    fn test_invalid_transitions_leave_state_untouched() {
        let mut fsm = LinkStateMachine::new();

        // Handshake results make no sense outside Connecting
        let result = fsm.process_event(LinkEvent::HandshakeSucceeded);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(*fsm.state(), ConnectionState::Idle);

        fsm.process_event(LinkEvent::DiscoveryStarted);
        let result = fsm.process_event(LinkEvent::RetryElapsed);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(*fsm.state(), ConnectionState::Discovering);

        // Connected rejects a second connect without an explicit disconnect
        fsm.process_event(LinkEvent::ConnectRequested(endpoint("10.0.0.2:8080")));
        fsm.process_event(LinkEvent::HandshakeSucceeded);
        let result = fsm.process_event(LinkEvent::ConnectRequested(endpoint("10.0.0.3:8080")));
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert!(fsm.state().is_connected());
    }

    #[test]
    fn test_unavailable_failure_is_preserved() {
        let mut fsm = LinkStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested(endpoint("10.0.0.2:8080")));
        fsm.process_event(LinkEvent::HandshakeFailed(FailureReason::TransportUnavailable(
            "bluetooth adapter missing".into(),
        )));

        match fsm.state() {
            ConnectionState::Failed(reason) => assert!(reason.is_transport_unavailable()),
            other => panic!("unexpected state: {:?}", other),
        }
    }
}
