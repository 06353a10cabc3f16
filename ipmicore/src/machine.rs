//! Per-connection session state machine driving the RMCP+ handshake and the
//! session lifecycle. Transitions are deterministic: every (state, event)
//! pair has exactly one successor, and unexpected pairs land in `Failed`.

use ipmiproto::logging::{self, Logger};
use ipmiproto::shared::{IpmiError, IpmiResult, Violation};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    /// Transport up, no contact with the managed system yet.
    Uninitialized,
    /// Cipher suites discovered.
    CiphersRetrieved,
    /// Authentication capabilities known.
    AuthCapabilitiesReceived,
    /// Open Session request dispatched, awaiting the response.
    OpenSessionSent,
    /// Managed system accepted; its session ID is known.
    OpenSessionComplete,
    /// RAKP1 dispatched, awaiting RAKP2.
    Rakp1Sent,
    /// RAKP2 validated; ready to send RAKP3.
    Rakp3Waiting,
    /// RAKP3 dispatched, awaiting RAKP4.
    Rakp3Sent,
    /// RAKP4 validated; session keys installed.
    SessionValid,
    /// Local close initiated.
    SessionClosing,
    /// Terminal error.
    Failed,
    /// Terminal.
    Closed,
}

impl SessionState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        self == SessionState::Failed || self == SessionState::Closed
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionEvent {
    /// Cipher-agnostic acknowledgement advancing past a successful response.
    Default,
    AuthenticationCapabilitiesReceived,
    OpenSessionAck,
    Rakp2Ack,
    Rakp4Ack,
    Timeout,
    SessionCloseRequested,
    ProtocolError(Violation),
}

pub struct SessionMachine {
    state: SessionState,
    log: Logger,
}

impl SessionMachine {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> SessionMachine {
        SessionMachine {
            state: SessionState::Uninitialized,
            log: logging::child_or_discard(log.into()),
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Guards a caller-sequenced operation: fails with `IllegalState` when
    /// the machine is not in the expected state, without touching it.
    #[inline]
    pub fn ensure(&self, expected: SessionState) -> IpmiResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(IpmiError::IllegalState)
        }
    }

    /// Open Session request handed to the wire.
    pub fn open_session_dispatched(&mut self) -> IpmiResult<()> {
        self.ensure(SessionState::AuthCapabilitiesReceived)?;
        self.transition(SessionState::OpenSessionSent, "open session dispatched");
        Ok(())
    }

    /// RAKP1 handed to the wire.
    pub fn rakp1_dispatched(&mut self) -> IpmiResult<()> {
        self.ensure(SessionState::OpenSessionComplete)?;
        self.transition(SessionState::Rakp1Sent, "rakp1 dispatched");
        Ok(())
    }

    /// RAKP3 handed to the wire.
    pub fn rakp3_dispatched(&mut self) -> IpmiResult<()> {
        self.ensure(SessionState::Rakp3Waiting)?;
        self.transition(SessionState::Rakp3Sent, "rakp3 dispatched");
        Ok(())
    }

    /// Applies an event, returning the successor state. Unexpected pairs
    /// transition to `Failed` and fail with a protocol violation.
    pub fn apply(&mut self, event: SessionEvent) -> IpmiResult<SessionState> {
        use self::SessionEvent::*;
        use self::SessionState::*;

        let next = match (self.state, event) {
            (Uninitialized, Default) => CiphersRetrieved,
            (CiphersRetrieved, AuthenticationCapabilitiesReceived) => AuthCapabilitiesReceived,
            (OpenSessionSent, OpenSessionAck) => OpenSessionComplete,
            (Rakp1Sent, Rakp2Ack) => Rakp3Waiting,
            (Rakp3Sent, Rakp4Ack) => SessionValid,

            // A post-retry timeout is terminal in every awaiting state, and
            // in SessionValid once the keep-alive budget is spent.
            (OpenSessionSent, Timeout)
            | (Rakp1Sent, Timeout)
            | (Rakp3Sent, Timeout)
            | (SessionValid, Timeout) => Failed,

            // A lost Close Session response still closes the local side.
            (SessionClosing, Default) | (SessionClosing, Timeout) => Closed,

            (state, SessionCloseRequested) if !state.is_terminal() => SessionClosing,

            (_, ProtocolError(_)) => Failed,

            (state, event) => {
                logging::warn!(self.log, "unexpected event";
                               "context" => "apply",
                               "state" => ?state,
                               "event" => ?event);

                self.state = Failed;
                return Err(IpmiError::ProtocolViolation(Violation::UnexpectedEvent));
            }
        };

        logging::debug!(self.log, "state transition";
                        "context" => "apply",
                        "from" => ?self.state,
                        "event" => ?event,
                        "to" => ?next);

        self.state = next;
        Ok(next)
    }

    #[inline]
    fn transition(&mut self, next: SessionState, context: &'static str) {
        logging::debug!(self.log, "state transition";
                        "context" => context,
                        "from" => ?self.state,
                        "to" => ?next);
        self.state = next;
    }

    #[cfg(test)]
    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::SessionEvent::*;
    use super::SessionState::*;
    use super::*;

    const ALL_STATES: [SessionState; 12] = [
        Uninitialized,
        CiphersRetrieved,
        AuthCapabilitiesReceived,
        OpenSessionSent,
        OpenSessionComplete,
        Rakp1Sent,
        Rakp3Waiting,
        Rakp3Sent,
        SessionValid,
        SessionClosing,
        Failed,
        Closed,
    ];

    const ALL_EVENTS: [SessionEvent; 8] = [
        Default,
        AuthenticationCapabilitiesReceived,
        OpenSessionAck,
        Rakp2Ack,
        Rakp4Ack,
        Timeout,
        SessionCloseRequested,
        ProtocolError(Violation::Replayed),
    ];

    fn expected(state: SessionState, event: SessionEvent) -> Option<SessionState> {
        match (state, event) {
            (Uninitialized, Default) => Some(CiphersRetrieved),
            (CiphersRetrieved, AuthenticationCapabilitiesReceived) => {
                Some(AuthCapabilitiesReceived)
            }
            (OpenSessionSent, OpenSessionAck) => Some(OpenSessionComplete),
            (Rakp1Sent, Rakp2Ack) => Some(Rakp3Waiting),
            (Rakp3Sent, Rakp4Ack) => Some(SessionValid),
            (OpenSessionSent, Timeout)
            | (Rakp1Sent, Timeout)
            | (Rakp3Sent, Timeout)
            | (SessionValid, Timeout) => Some(Failed),
            (SessionClosing, Default) | (SessionClosing, Timeout) => Some(Closed),
            (Failed, SessionCloseRequested) | (Closed, SessionCloseRequested) => None,
            (_, SessionCloseRequested) => Some(SessionClosing),
            (_, ProtocolError(_)) => Some(Failed),
            _ => None,
        }
    }

    #[test]
    fn test_happy_path() {
        let mut machine = SessionMachine::new(None);

        machine.apply(Default).unwrap();
        machine.apply(AuthenticationCapabilitiesReceived).unwrap();
        machine.open_session_dispatched().unwrap();
        machine.apply(OpenSessionAck).unwrap();
        machine.rakp1_dispatched().unwrap();
        machine.apply(Rakp2Ack).unwrap();
        machine.rakp3_dispatched().unwrap();
        assert_eq!(machine.apply(Rakp4Ack).unwrap(), SessionValid);

        machine.apply(SessionCloseRequested).unwrap();
        assert_eq!(machine.apply(Default).unwrap(), Closed);
    }

    #[test]
    fn test_every_pair_is_deterministic() {
        for &state in &ALL_STATES {
            for &event in &ALL_EVENTS {
                let mut machine = SessionMachine::new(None);
                machine.set_state(state);

                match machine.apply(event) {
                    Ok(next) => {
                        assert_eq!(
                            Some(next),
                            expected(state, event),
                            "({:?}, {:?})",
                            state,
                            event
                        );
                    }
                    Err(error) => {
                        assert_eq!(expected(state, event), None, "({:?}, {:?})", state, event);
                        assert_eq!(
                            error,
                            IpmiError::ProtocolViolation(Violation::UnexpectedEvent)
                        );
                        assert_eq!(machine.state(), Failed);
                    }
                }
            }
        }
    }

    #[test]
    fn test_dispatch_guards() {
        let mut machine = SessionMachine::new(None);

        assert_eq!(
            machine.open_session_dispatched().unwrap_err(),
            IpmiError::IllegalState
        );
        assert_eq!(machine.rakp1_dispatched().unwrap_err(), IpmiError::IllegalState);
        assert_eq!(machine.rakp3_dispatched().unwrap_err(), IpmiError::IllegalState);

        // A failed guard must not move the machine.
        assert_eq!(machine.state(), Uninitialized);
    }

    #[test]
    fn test_timeout_mid_handshake_fails() {
        let mut machine = SessionMachine::new(None);
        machine.set_state(Rakp1Sent);

        assert_eq!(machine.apply(Timeout).unwrap(), Failed);
    }

    #[test]
    fn test_protocol_error_always_fails() {
        for &state in &ALL_STATES {
            let mut machine = SessionMachine::new(None);
            machine.set_state(state);

            assert_eq!(
                machine.apply(ProtocolError(Violation::Replayed)).unwrap(),
                Failed
            );
        }
    }
}
