//! Connection facade: binds one state machine and one message handler to a
//! remote managed system and a set of credentials, and drives the RMCP+
//! handshake from the caller's thread. Out-of-order calls fail with
//! `IllegalState` before anything touches the wire.

use crate::config::ClientConfig;
use crate::handler::{MessageHandler, Response, SessionRecord};
use crate::machine::{SessionEvent, SessionState};
use crate::messenger::{Messenger, Subscriber};
use crate::tags::SessionIdAllocator;
use crate::timer::TimerService;
use ipmiproto::cipher::CipherSuite;
use ipmiproto::command::{CommandRequest, CommandResponse};
use ipmiproto::crypto;
use ipmiproto::handshake::{
    status, CipherSuitesRequest, HandshakePayload, OpenSessionRequest, PrivilegeLevel, Rakp1,
    Rakp2, Rakp3, Rakp4, CHANNEL_CURRENT, RAKP_NONCE_SIZE,
};
use ipmiproto::logging::{self, Logger};
use ipmiproto::shared::{encode_to_vec, IpmiError, IpmiResult, Violation};
use ipmiproto::wire::PayloadType;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Asynchronous notifications delivered per connection. Implementations
/// must not block; callbacks run on receive and timer threads.
pub trait ConnectionListener: Send + Sync {
    fn session_established(&self, _handle: usize) {}
    fn session_closed(&self, _handle: usize) {}
    fn session_failed(&self, _handle: usize, _error: &IpmiError) {}
    fn unsolicited_response(&self, _handle: usize, _response: &CommandResponse) {}
}

pub struct Connection {
    handle: usize,
    remote: SocketAddr,
    handler: Arc<MessageHandler>,
    ids: Arc<SessionIdAllocator>,
    config: ClientConfig,
    ping_period: Duration,
    console_session_id: Mutex<Option<u32>>,
    log: Logger,
}

impl Connection {
    pub(crate) fn connect(
        handle: usize,
        remote: SocketAddr,
        ping_period: Duration,
        config: ClientConfig,
        messenger: &Arc<Messenger>,
        timers: &Arc<TimerService>,
        ids: &Arc<SessionIdAllocator>,
        log: Option<&Logger>,
    ) -> Arc<Connection> {
        let log = match log {
            Some(log) => log.new(logging::o!("connection" => handle as u64)),
            None => logging::child_or_discard(None),
        };

        let handler = MessageHandler::new(
            handle,
            remote,
            messenger.clone(),
            timers.clone(),
            config.pipeline_limit,
            &log,
        );

        let subscriber: Arc<dyn Subscriber> = handler.clone();
        messenger.subscribe(Arc::downgrade(&subscriber));

        logging::debug!(log, "connection created";
                        "context" => "connect",
                        "remote" => %remote);

        Arc::new(Connection {
            handle,
            remote,
            handler,
            ids: ids.clone(),
            config,
            ping_period,
            console_session_id: Mutex::new(None),
            log,
        })
    }

    #[inline]
    pub fn handle(&self) -> usize {
        self.handle
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.handler.state()
    }

    /// Console and managed session IDs of the active session, if any.
    pub fn session_ids(&self) -> Option<(u32, u32)> {
        self.handler.session_ids()
    }

    #[allow(dead_code)]
    pub(crate) fn session_key_material(&self) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        self.handler.session_key_material()
    }

    pub fn register_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.handler.register_listener(listener);
    }

    /// ASF presence ping, the IPMI v1.5 era liveness probe. Valid before
    /// any managed system contact.
    pub fn ping(&self, tag: u8) -> IpmiResult<()> {
        self.handler
            .with_machine(|machine| machine.ensure(SessionState::Uninitialized))?;

        let response =
            self.handler
                .send_ping(tag, self.config.request_timeout(), self.config.retries)?;

        match response {
            Response::Pong { .. } => Ok(()),
            _ => Err(self.violation(Violation::UnexpectedEvent)),
        }
    }

    /// First handshake stage: discovers the cipher suites the channel
    /// supports. Unknown suite IDs reported by the managed system are
    /// skipped.
    pub fn get_available_cipher_suites(&self, tag: u8) -> IpmiResult<Vec<&'static CipherSuite>> {
        self.handler
            .with_machine(|machine| machine.ensure(SessionState::Uninitialized))?;

        let request = CipherSuitesRequest {
            tag,
            channel: CHANNEL_CURRENT,
        };

        let response = self.handler.send_sessionless(
            PayloadType::CipherSuites,
            &encode_to_vec(&request)?,
            tag,
            false,
            self.config.request_timeout(),
            self.config.retries,
        )?;

        let payload = match response {
            Response::Handshake(HandshakePayload::CipherSuites(payload)) => payload,
            _ => return Err(self.violation(Violation::UnexpectedEvent)),
        };

        self.handler
            .with_machine(|machine| machine.apply(SessionEvent::Default))?;

        Ok(payload
            .suites
            .iter()
            .filter_map(|id| CipherSuite::from_id(*id).ok())
            .collect())
    }

    /// Second handshake stage: sessionless Get Channel Authentication
    /// Capabilities for the chosen suite and privilege.
    pub fn get_channel_authentication_capabilities(
        &self,
        tag: u8,
        suite: &CipherSuite,
        privilege: PrivilegeLevel,
    ) -> IpmiResult<CommandResponse> {
        self.handler
            .with_machine(|machine| machine.ensure(SessionState::CiphersRetrieved))?;

        let request = CommandRequest::auth_capabilities(tag as u32, suite.id, privilege.wire_id());

        let response = self.handler.send_sessionless(
            PayloadType::Ipmi,
            &encode_to_vec(&request)?,
            tag,
            false,
            self.config.request_timeout(),
            self.config.retries,
        )?;

        let response = match response {
            Response::Command(response) => response,
            _ => return Err(self.violation(Violation::UnexpectedEvent)),
        };

        if !response.is_ok() {
            return Err(IpmiError::AuthenticationFailed(response.completion));
        }

        self.handler
            .with_machine(|machine| machine.apply(SessionEvent::AuthenticationCapabilitiesReceived))?;

        Ok(response)
    }

    /// Runs Open Session and RAKP 1 through 4, installs the derived session
    /// keys and starts the keep-alive schedule.
    pub fn start_session(
        &self,
        tag: u8,
        suite: &'static CipherSuite,
        privilege: PrivilegeLevel,
        username: &str,
        password: &[u8],
        bmc_key: Option<&[u8]>,
    ) -> IpmiResult<()> {
        self.handler
            .with_machine(|machine| machine.ensure(SessionState::AuthCapabilitiesReceived))?;

        let console_session_id = self.ids.allocate();

        match self.run_handshake(tag, suite, privilege, username, password, bmc_key, console_session_id) {
            Ok(()) => {
                *self
                    .console_session_id
                    .lock()
                    .expect("Session id slot poisoned") = Some(console_session_id);

                self.handler.start_keepalive(
                    self.ping_period,
                    suite.id,
                    privilege.wire_id(),
                    self.config.request_timeout(),
                    self.config.retries,
                );

                logging::info!(self.log, "session established";
                               "context" => "start_session",
                               "console_session_id" => console_session_id,
                               "suite" => suite.id);

                self.handler.notify_session_established();
                Ok(())
            }
            Err(error) => {
                self.ids.release(console_session_id);

                logging::warn!(self.log, "handshake failed";
                               "context" => "start_session",
                               "error" => ?error);

                self.handler.notify_session_failed(&error);
                Err(error)
            }
        }
    }

    fn run_handshake(
        &self,
        tag: u8,
        suite: &'static CipherSuite,
        privilege: PrivilegeLevel,
        username: &str,
        password: &[u8],
        bmc_key: Option<&[u8]>,
        console_session_id: u32,
    ) -> IpmiResult<()> {
        let timeout = self.config.request_timeout();
        let retries = self.config.retries;
        let privilege_byte = privilege.wire_id();

        // Open Session.
        let request = OpenSessionRequest {
            tag,
            privilege: privilege_byte,
            console_session_id,
            authentication: suite.authentication.wire_id(),
            integrity: suite.integrity.wire_id(),
            confidentiality: suite.confidentiality.wire_id(),
        };
        let payload = encode_to_vec(&request)?;

        self.handler
            .with_machine(|machine| machine.open_session_dispatched())?;

        let open = match self
            .handler
            .send_sessionless(PayloadType::OpenSession, &payload, tag, true, timeout, retries)?
        {
            Response::Handshake(HandshakePayload::OpenSession(response)) => response,
            _ => return Err(self.violation(Violation::UnexpectedEvent)),
        };

        if open.tag != tag {
            return Err(self.violation(Violation::TagMismatch));
        }
        if open.status != status::NO_ERROR {
            drop(self.handler.with_machine(|machine| {
                machine.apply(SessionEvent::ProtocolError(Violation::ErrorStatus))
            }));
            return Err(IpmiError::AuthenticationFailed(open.status));
        }
        if open.console_session_id != console_session_id {
            return Err(self.violation(Violation::SessionMismatch));
        }

        self.handler
            .with_machine(|machine| machine.apply(SessionEvent::OpenSessionAck))?;

        let managed_session_id = open.managed_session_id;

        // RAKP1 / RAKP2.
        let mut console_nonce = [0u8; RAKP_NONCE_SIZE];
        crypto::random_bytes(&mut console_nonce);

        let rakp1 = Rakp1 {
            tag,
            managed_session_id,
            console_nonce,
            privilege: privilege_byte,
            username: username.to_string(),
        };

        self.handler
            .with_machine(|machine| machine.rakp1_dispatched())?;

        let rakp2: Rakp2 = match self.handler.send_sessionless(
            PayloadType::Rakp1,
            &encode_to_vec(&rakp1)?,
            tag,
            true,
            timeout,
            retries,
        )? {
            Response::Handshake(HandshakePayload::Rakp2(response)) => response,
            _ => return Err(self.violation(Violation::UnexpectedEvent)),
        };

        if rakp2.tag != tag {
            return Err(self.violation(Violation::TagMismatch));
        }
        if rakp2.status != status::NO_ERROR {
            drop(self.handler.with_machine(|machine| {
                machine.apply(SessionEvent::ProtocolError(Violation::ErrorStatus))
            }));
            return Err(IpmiError::AuthenticationFailed(rakp2.status));
        }
        if rakp2.console_session_id != console_session_id {
            return Err(self.violation(Violation::SessionMismatch));
        }

        let expected = suite.rakp2_auth_code(
            password,
            console_session_id,
            managed_session_id,
            &console_nonce,
            &rakp2.managed_nonce,
            &rakp2.managed_guid,
            privilege_byte,
            username,
        );
        if expected != rakp2.auth_code {
            drop(self.handler.with_machine(|machine| {
                machine.apply(SessionEvent::ProtocolError(Violation::AuthCodeMismatch))
            }));
            return Err(IpmiError::AuthenticationFailed(
                status::INVALID_INTEGRITY_CHECK_VALUE,
            ));
        }

        self.handler
            .with_machine(|machine| machine.apply(SessionEvent::Rakp2Ack))?;

        // Session key derivation.
        let sik = suite.derive_sik(
            password,
            bmc_key,
            &rakp2.managed_nonce,
            &console_nonce,
            privilege_byte,
            username,
        );
        let k1 = suite.derive_k1(&sik);
        let k2 = suite.derive_k2(&sik);

        // RAKP3 / RAKP4.
        let rakp3 = Rakp3 {
            tag,
            status: status::NO_ERROR,
            managed_session_id,
            auth_code: suite.rakp3_auth_code(
                password,
                &rakp2.managed_nonce,
                console_session_id,
                privilege_byte,
                username,
            ),
        };

        self.handler
            .with_machine(|machine| machine.rakp3_dispatched())?;

        let rakp4: Rakp4 = match self.handler.send_sessionless(
            PayloadType::Rakp3,
            &encode_to_vec(&rakp3)?,
            tag,
            true,
            timeout,
            retries,
        )? {
            Response::Handshake(HandshakePayload::Rakp4(response)) => response,
            _ => return Err(self.violation(Violation::UnexpectedEvent)),
        };

        if rakp4.tag != tag {
            return Err(self.violation(Violation::TagMismatch));
        }
        if rakp4.status != status::NO_ERROR {
            drop(self.handler.with_machine(|machine| {
                machine.apply(SessionEvent::ProtocolError(Violation::ErrorStatus))
            }));
            return Err(IpmiError::AuthenticationFailed(rakp4.status));
        }
        if rakp4.console_session_id != console_session_id {
            return Err(self.violation(Violation::SessionMismatch));
        }

        let expected =
            suite.rakp4_integrity_check(&sik, &console_nonce, managed_session_id, &rakp2.managed_guid);
        if expected != rakp4.integrity_check {
            drop(self.handler.with_machine(|machine| {
                machine.apply(SessionEvent::ProtocolError(Violation::AuthCodeMismatch))
            }));
            return Err(IpmiError::AuthenticationFailed(
                status::INVALID_INTEGRITY_CHECK_VALUE,
            ));
        }

        self.handler
            .with_machine(|machine| machine.apply(SessionEvent::Rakp4Ack))?;

        self.handler.install_session(SessionRecord::new(
            console_session_id,
            managed_session_id,
            suite,
            sik,
            k1,
            k2,
        ));

        Ok(())
    }

    /// Submits an in-session command with the configured timeout and retry
    /// budget.
    pub fn send_command(
        &self,
        netfn: u8,
        command: u8,
        data: Vec<u8>,
    ) -> IpmiResult<CommandResponse> {
        self.send_command_with(
            netfn,
            command,
            data,
            self.config.request_timeout(),
            self.config.retries,
        )
    }

    /// Submits an in-session command with an explicit timeout and retry
    /// budget.
    pub fn send_command_with(
        &self,
        netfn: u8,
        command: u8,
        data: Vec<u8>,
        timeout: Duration,
        retries: u32,
    ) -> IpmiResult<CommandResponse> {
        self.handler
            .with_machine(|machine| machine.ensure(SessionState::SessionValid))?;

        self.handler.send_command(netfn, command, data, timeout, retries)
    }

    /// Closes the connection. A valid session gets a best-effort Close
    /// Session on the wire; every pending future completes with
    /// `ConnectionClosed`. Idempotent.
    pub fn disconnect(&self) {
        let state = self.handler.state();

        if state.is_terminal() {
            self.handler.close();
            self.release_session_id();
            return;
        }

        drop(
            self.handler
                .with_machine(|machine| machine.apply(SessionEvent::SessionCloseRequested)),
        );

        if state == SessionState::SessionValid {
            self.handler.fire_close_session();
        }

        drop(
            self.handler
                .with_machine(|machine| machine.apply(SessionEvent::Default)),
        );

        self.handler.close();
        self.release_session_id();

        logging::debug!(self.log, "connection closed"; "context" => "disconnect");

        if state == SessionState::SessionValid {
            self.handler.notify_session_closed();
        }
    }

    fn release_session_id(&self) {
        if let Some(id) = self
            .console_session_id
            .lock()
            .expect("Session id slot poisoned")
            .take()
        {
            self.ids.release(id);
        }
    }

    /// Registers a protocol violation: fails the state machine and returns
    /// the matching error.
    fn violation(&self, kind: Violation) -> IpmiError {
        drop(
            self.handler
                .with_machine(|machine| machine.apply(SessionEvent::ProtocolError(kind))),
        );
        IpmiError::ProtocolViolation(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn test_connection() -> (Arc<Connection>, Arc<Messenger>, Arc<TimerService>) {
        let messenger = Arc::new(Messenger::new(None).unwrap());
        let timers = Arc::new(TimerService::new(2));
        let ids = Arc::new(SessionIdAllocator::new());

        let connection = Connection::connect(
            0,
            "127.0.0.1:9623".parse().unwrap(),
            Duration::from_millis(20_000),
            ClientConfig::default(),
            &messenger,
            &timers,
            &ids,
            None,
        );

        (connection, messenger, timers)
    }

    #[test]
    fn test_out_of_order_calls_fail_without_wire_traffic() {
        let (connection, _messenger, _timers) = test_connection();
        let suite = CipherSuite::from_id(3).unwrap();

        // Auth capabilities before cipher suite discovery.
        assert_eq!(
            connection
                .get_channel_authentication_capabilities(0, suite, PrivilegeLevel::Administrator)
                .unwrap_err(),
            IpmiError::IllegalState
        );

        // Session start before auth capabilities.
        assert_eq!(
            connection
                .start_session(0, suite, PrivilegeLevel::Administrator, "admin", b"secret", None)
                .unwrap_err(),
            IpmiError::IllegalState
        );

        // Command before session.
        assert_eq!(
            connection.send_command(0x06, 0x01, Vec::new()).unwrap_err(),
            IpmiError::IllegalState
        );

        // The machine must not have moved.
        assert_eq!(connection.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_disconnect_is_idempotent_and_closes() {
        let (connection, _messenger, _timers) = test_connection();

        connection.disconnect();
        assert_eq!(connection.state(), SessionState::Closed);

        connection.disconnect();
        assert_eq!(connection.state(), SessionState::Closed);
    }
}
