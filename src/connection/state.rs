//! Connection lifecycle state machine
//!
//! All `ConnectionState` changes go through [`reduce`], which returns the next
//! state and the effects the manager must run. The reducer never performs I/O.
//!
//! ```text
//! DISCONNECTED ─connect─▶ CONNECTING ─first pong─▶ CONNECTED
//!                              │                      │
//!                          link failure          link failure
//!                              ▼                      ▼
//!                        RECONNECTING ◀───────────────┘
//!                         │       │
//!                  first pong   attempts exhausted
//!                         ▼       ▼
//!                   CONNECTED    ERROR ─connect─▶ CONNECTING
//! ```
//!
//! A transport that opens is not yet CONNECTED: the manager sends a ping at
//! once and only the matching pong completes the connection.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        }
    }

    /// States in which outbound messages are held in the queue
    pub fn queues_outbound(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Reconnecting
        )
    }

    fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the reducer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    /// The transport handed back an open link
    TransportOpened,
    /// First pong on a fresh link
    ReadyAcknowledged,
    /// Open failed, link closed, or heartbeat went unanswered.
    /// `exhausted` is set once the reconnect budget is used up.
    LinkFailed { exhausted: bool },
    /// A failure reconnecting cannot fix, such as rejected credentials or a
    /// malformed URL
    LinkRejected,
    /// Backoff delay elapsed
    RetryDue,
    DisconnectRequested,
}

/// Work for the manager after a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEffect {
    OpenTransport,
    CloseTransport,
    /// Ping the fresh link and arm the readiness deadline
    AwaitReady,
    ScheduleReconnect,
    CancelReconnect,
    StartHeartbeat,
    StopHeartbeat,
    ResetAttempts,
    FlushQueue,
    ResolveConnectWaiters,
    RejectConnectWaiters,
    /// Reject correlated requests already written to the lost link
    FailInFlight,
    /// Reject every pending request and drop the queue
    FailAll,
    /// Reconnect budget exhausted; report upward
    ReportFatal,
    EmitStatus,
}

/// Reducer: (state, event) -> (next_state, effects)
///
/// Events that make no sense in the current state leave it unchanged and
/// produce no effects.
pub fn reduce(state: ConnectionState, event: LinkEvent) -> (ConnectionState, Vec<LinkEffect>) {
    use ConnectionState::*;
    use LinkEffect::*;
    use LinkEvent::*;

    match (state, event) {
        // -----------------
        // Starting
        // -----------------
        (Disconnected | Error, ConnectRequested) => {
            (Connecting, vec![ResetAttempts, OpenTransport, EmitStatus])
        }
        (Connecting | Reconnecting, TransportOpened) => (state, vec![AwaitReady]),
        (Connecting | Reconnecting, ReadyAcknowledged) => (
            Connected,
            vec![
                ResetAttempts,
                StartHeartbeat,
                FlushQueue,
                ResolveConnectWaiters,
                EmitStatus,
            ],
        ),
        (Reconnecting, RetryDue) => (Reconnecting, vec![OpenTransport]),

        // -----------------
        // Failures
        // -----------------
        (Connecting | Connected | Reconnecting, LinkFailed { exhausted: true }) => (
            Error,
            vec![
                CloseTransport,
                StopHeartbeat,
                CancelReconnect,
                ReportFatal,
                FailAll,
                RejectConnectWaiters,
                EmitStatus,
            ],
        ),
        (Connecting | Connected | Reconnecting, LinkRejected) => (
            Error,
            vec![
                CloseTransport,
                StopHeartbeat,
                CancelReconnect,
                FailAll,
                RejectConnectWaiters,
                EmitStatus,
            ],
        ),
        (Connected, LinkFailed { exhausted: false }) => (
            Reconnecting,
            vec![
                CloseTransport,
                StopHeartbeat,
                FailInFlight,
                ScheduleReconnect,
                EmitStatus,
            ],
        ),
        (Connecting, LinkFailed { exhausted: false }) => (
            Reconnecting,
            vec![CloseTransport, ScheduleReconnect, EmitStatus],
        ),
        (Reconnecting, LinkFailed { exhausted: false }) => {
            (Reconnecting, vec![CloseTransport, ScheduleReconnect])
        }

        // -----------------
        // Teardown
        // -----------------
        (s, DisconnectRequested) if s.is_active() || s == Error => (
            Disconnected,
            vec![
                CloseTransport,
                StopHeartbeat,
                CancelReconnect,
                FailAll,
                RejectConnectWaiters,
                EmitStatus,
            ],
        ),
        // Drops anything queued before the first connect
        (Disconnected, DisconnectRequested) => (Disconnected, vec![FailAll]),

        (s, _) => (s, vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_connect_opens_transport() {
        let (next, effects) = reduce(Disconnected, LinkEvent::ConnectRequested);
        assert_eq!(next, Connecting);
        assert!(effects.contains(&LinkEffect::OpenTransport));
        assert!(effects.contains(&LinkEffect::EmitStatus));
    }

    #[test]
    fn test_transport_open_is_not_connected() {
        let (next, effects) = reduce(Connecting, LinkEvent::TransportOpened);
        assert_eq!(next, Connecting);
        assert_eq!(effects, vec![LinkEffect::AwaitReady]);
        assert!(!effects.contains(&LinkEffect::ResetAttempts));
    }

    #[test]
    fn test_first_pong_connects_and_resets_attempts() {
        for from in [Connecting, Reconnecting] {
            let (next, effects) = reduce(from, LinkEvent::ReadyAcknowledged);
            assert_eq!(next, Connected);
            assert!(effects.contains(&LinkEffect::ResetAttempts));
            assert!(effects.contains(&LinkEffect::FlushQueue));
            assert!(effects.contains(&LinkEffect::ResolveConnectWaiters));
            assert!(effects.contains(&LinkEffect::StartHeartbeat));
        }
    }

    #[test]
    fn test_link_loss_while_connected_reconnects() {
        let (next, effects) = reduce(Connected, LinkEvent::LinkFailed { exhausted: false });
        assert_eq!(next, Reconnecting);
        assert!(effects.contains(&LinkEffect::FailInFlight));
        assert!(effects.contains(&LinkEffect::ScheduleReconnect));
        assert!(!effects.contains(&LinkEffect::FailAll));
    }

    #[test]
    fn test_failed_retry_stays_reconnecting_silently() {
        let (next, effects) = reduce(Reconnecting, LinkEvent::LinkFailed { exhausted: false });
        assert_eq!(next, Reconnecting);
        assert!(!effects.contains(&LinkEffect::EmitStatus));
        assert!(effects.contains(&LinkEffect::ScheduleReconnect));
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        for from in [Connecting, Connected, Reconnecting] {
            let (next, effects) = reduce(from, LinkEvent::LinkFailed { exhausted: true });
            assert_eq!(next, Error);
            assert!(effects.contains(&LinkEffect::ReportFatal));
            assert!(effects.contains(&LinkEffect::RejectConnectWaiters));
            assert!(effects.contains(&LinkEffect::FailAll));
        }
    }

    #[test]
    fn test_rejected_link_fails_without_retry() {
        for from in [Connecting, Connected, Reconnecting] {
            let (next, effects) = reduce(from, LinkEvent::LinkRejected);
            assert_eq!(next, Error);
            assert!(!effects.contains(&LinkEffect::ScheduleReconnect));
            assert!(!effects.contains(&LinkEffect::ReportFatal));
            assert!(effects.contains(&LinkEffect::RejectConnectWaiters));
            assert!(effects.contains(&LinkEffect::FailAll));
        }
    }

    #[test]
    fn test_connect_from_error_starts_over() {
        let (next, effects) = reduce(Error, LinkEvent::ConnectRequested);
        assert_eq!(next, Connecting);
        assert_eq!(effects[0], LinkEffect::ResetAttempts);
    }

    #[test]
    fn test_disconnect_from_any_state() {
        for from in [Connecting, Connected, Reconnecting, Error] {
            let (next, effects) = reduce(from, LinkEvent::DisconnectRequested);
            assert_eq!(next, Disconnected);
            assert!(effects.contains(&LinkEffect::CloseTransport));
            assert!(effects.contains(&LinkEffect::FailAll));
        }
        let (next, effects) = reduce(Disconnected, LinkEvent::DisconnectRequested);
        assert_eq!(next, Disconnected);
        assert_eq!(effects, vec![LinkEffect::FailAll]);
    }

    #[test]
    fn test_illegal_events_ignored() {
        let cases = [
            (Disconnected, LinkEvent::TransportOpened),
            (Disconnected, LinkEvent::ReadyAcknowledged),
            (Disconnected, LinkEvent::LinkFailed { exhausted: false }),
            (Connected, LinkEvent::ConnectRequested),
            (Connected, LinkEvent::RetryDue),
            (Connecting, LinkEvent::RetryDue),
            (Error, LinkEvent::LinkFailed { exhausted: true }),
            (Error, LinkEvent::ReadyAcknowledged),
            (Error, LinkEvent::LinkRejected),
            (Disconnected, LinkEvent::LinkRejected),
        ];
        for (state, event) in cases {
            let (next, effects) = reduce(state, event.clone());
            assert_eq!(next, state, "{:?} / {:?}", state, event);
            assert!(effects.is_empty(), "{:?} / {:?}", state, event);
        }
    }

    #[test]
    fn test_state_serializes_screaming_case() {
        assert_eq!(serde_json::to_string(&Reconnecting).unwrap(), "\"RECONNECTING\"");
        assert_eq!(Connected.to_string(), "CONNECTED");
    }
}
