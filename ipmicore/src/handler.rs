//! Per-connection message handler: correlates outgoing requests with
//! incoming responses, drives retries and timeouts, applies the session
//! envelope, enforces replay protection and the pipelining limit, and runs
//! the keep-alive schedule.
//!
//! Lock order within a connection is machine, session, pending, pipeline;
//! no lock is ever held across a scheduling call.

use crate::connection::ConnectionListener;
use crate::machine::{SessionEvent, SessionMachine, SessionState};
use crate::messenger::{Messenger, Subscriber};
use crate::timer::{TimerHandle, TimerService};
use indexmap::IndexMap;
use ipmiproto::cipher::{CipherSuite, IntegrityAlgorithm, SessionKey};
use ipmiproto::command::{CommandRequest, CommandResponse, COMPLETION_INVALID_SESSION};
use ipmiproto::handshake::HandshakePayload;
use ipmiproto::logging::{self, Logger};
use ipmiproto::shared::{encode_to_vec, IpmiError, IpmiResult, Violation};
use ipmiproto::wire::{self, Inbound, PayloadType, SealedPacket, SessionProtection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

/// Width of the inbound sliding acceptance window.
pub const REPLAY_WINDOW_SIZE: u32 = 16;

/// Sliding acceptance window over the managed system's outbound sequence.
/// Sequences at or below the low-water mark, and sequences already recorded
/// in the bitmap, are rejected as replayed.
#[derive(Debug, Clone, Copy)]
pub struct ReplayWindow {
    top: u32,
    bitmap: u16,
}

impl ReplayWindow {
    /// Sequence zero is pre-consumed; the managed system counts from one.
    pub fn new() -> ReplayWindow {
        ReplayWindow { top: 0, bitmap: 1 }
    }

    /// Records the sequence and reports whether it is acceptable.
    pub fn accept(&mut self, sequence: u32) -> bool {
        if sequence > self.top {
            let shift = sequence - self.top;

            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.bitmap |= 1;
            self.top = sequence;

            return true;
        }

        let offset = self.top - sequence;
        if offset >= REPLAY_WINDOW_SIZE {
            return false;
        }

        let bit = 1u16 << offset;
        if self.bitmap & bit != 0 {
            return false;
        }

        self.bitmap |= bit;
        true
    }

    #[inline]
    pub fn low_water(&self) -> u32 {
        self.top.saturating_sub(REPLAY_WINDOW_SIZE - 1)
    }
}

/// State of one established session. Created on a validated RAKP4, mutated
/// only by the handler, destroyed on close, fatal error or expiry.
pub struct SessionRecord {
    pub console_session_id: u32,
    pub managed_session_id: u32,
    pub suite: &'static CipherSuite,
    sik: SessionKey,
    k1: SessionKey,
    k2: SessionKey,
    outbound_seq: u32,
    outbound_unauth_seq: u32,
    inbound: ReplayWindow,
    inbound_unauth: ReplayWindow,
    last_activity: Instant,
}

impl SessionRecord {
    pub fn new(
        console_session_id: u32,
        managed_session_id: u32,
        suite: &'static CipherSuite,
        sik: SessionKey,
        k1: SessionKey,
        k2: SessionKey,
    ) -> SessionRecord {
        SessionRecord {
            console_session_id,
            managed_session_id,
            suite,
            sik,
            k1,
            k2,
            outbound_seq: 0,
            outbound_unauth_seq: 0,
            inbound: ReplayWindow::new(),
            inbound_unauth: ReplayWindow::new(),
            last_activity: Instant::now(),
        }
    }

    /// Issues the next outbound sequence. Strictly increasing; callers hold
    /// the session lock, which also serialises the egress order.
    fn next_sequence(&mut self) -> u32 {
        let counter = if self.suite.integrity == IntegrityAlgorithm::None {
            &mut self.outbound_unauth_seq
        } else {
            &mut self.outbound_seq
        };

        *counter += 1;
        *counter
    }

    /// Instant of the last accepted inbound packet.
    #[inline]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[inline]
    fn protection(&self) -> SessionProtection {
        SessionProtection {
            suite: self.suite,
            k1: &self.k1,
            k2: &self.k2,
        }
    }
}

/// A response delivered to a waiting caller.
#[derive(Debug, Clone)]
pub enum Response {
    Handshake(HandshakePayload),
    Command(CommandResponse),
    Pong { tag: u8 },
}

/// Completion slot a caller blocks on. Exactly one of response, timeout or
/// close completes it; later completions are ignored.
pub struct ResponseSlot {
    state: Mutex<Option<IpmiResult<Response>>>,
    done: Condvar,
}

impl ResponseSlot {
    fn new() -> ResponseSlot {
        ResponseSlot {
            state: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub fn complete(&self, result: IpmiResult<Response>) -> bool {
        let mut state = self.state.lock().expect("Response slot poisoned");

        if state.is_some() {
            return false;
        }

        *state = Some(result);
        self.done.notify_all();
        true
    }

    pub fn wait(&self) -> IpmiResult<Response> {
        let mut state = self.state.lock().expect("Response slot poisoned");

        while state.is_none() {
            state = self.done.wait(state).expect("Response slot poisoned");
        }

        state.clone().expect("Completed slot lost its value")
    }
}

struct PendingRequest {
    key: u32,
    datagram: Vec<u8>,
    /// Counts against the pipelining limit.
    in_session: bool,
    /// A post-retry timeout must drive the state machine.
    handshake: bool,
    keepalive: bool,
    retries_left: AtomicU32,
    timeout: Duration,
    timer: Mutex<Option<TimerHandle>>,
    slot: ResponseSlot,
}

impl PendingRequest {
    fn new(
        key: u32,
        datagram: Vec<u8>,
        in_session: bool,
        handshake: bool,
        keepalive: bool,
        timeout: Duration,
        retries: u32,
    ) -> Arc<PendingRequest> {
        Arc::new(PendingRequest {
            key,
            datagram,
            in_session,
            handshake,
            keepalive,
            retries_left: AtomicU32::new(retries),
            timeout,
            timer: Mutex::new(None),
            slot: ResponseSlot::new(),
        })
    }
}

enum Opened {
    Payload(Vec<u8>),
    IntegrityFailure,
    Discard,
}

pub struct MessageHandler {
    handle: usize,
    remote: SocketAddr,
    messenger: Arc<Messenger>,
    timers: Arc<TimerService>,
    machine: Mutex<SessionMachine>,
    session: Mutex<Option<SessionRecord>>,
    pending: Mutex<IndexMap<u32, Arc<PendingRequest>>>,
    in_flight: Mutex<usize>,
    pipeline_free: Condvar,
    pipeline_limit: usize,
    listeners: Mutex<Vec<Arc<dyn ConnectionListener>>>,
    keepalive: Mutex<Option<TimerHandle>>,
    dead: AtomicBool,
    /// Non-owning back-reference handed to timer tasks; invalidated when
    /// the connection drops.
    self_ref: Mutex<Weak<MessageHandler>>,
    log: Logger,
}

impl MessageHandler {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        handle: usize,
        remote: SocketAddr,
        messenger: Arc<Messenger>,
        timers: Arc<TimerService>,
        pipeline_limit: usize,
        log: L,
    ) -> Arc<MessageHandler> {
        let log = logging::child_or_discard(log.into());
        let machine = SessionMachine::new(&log);

        let handler = Arc::new(MessageHandler {
            handle,
            remote,
            messenger,
            timers,
            machine: Mutex::new(machine),
            session: Mutex::new(None),
            pending: Mutex::new(IndexMap::new()),
            in_flight: Mutex::new(0),
            pipeline_free: Condvar::new(),
            pipeline_limit,
            listeners: Mutex::new(Vec::new()),
            keepalive: Mutex::new(None),
            dead: AtomicBool::new(false),
            self_ref: Mutex::new(Weak::new()),
            log,
        });

        *handler.self_ref.lock().expect("Self reference poisoned") = Arc::downgrade(&handler);

        handler
    }

    fn weak_self(&self) -> Weak<MessageHandler> {
        self.self_ref
            .lock()
            .expect("Self reference poisoned")
            .clone()
    }

    #[inline]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.machine.lock().expect("Machine poisoned").state()
    }

    pub(crate) fn with_machine<R, F: FnOnce(&mut SessionMachine) -> R>(&self, action: F) -> R {
        action(&mut self.machine.lock().expect("Machine poisoned"))
    }

    pub fn register_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners
            .lock()
            .expect("Listener list poisoned")
            .push(listener);
    }

    fn listener_snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .lock()
            .expect("Listener list poisoned")
            .clone()
    }

    pub(crate) fn notify_session_established(&self) {
        for listener in self.listener_snapshot() {
            listener.session_established(self.handle);
        }
    }

    pub(crate) fn notify_session_closed(&self) {
        for listener in self.listener_snapshot() {
            listener.session_closed(self.handle);
        }
    }

    pub(crate) fn notify_session_failed(&self, error: &IpmiError) {
        for listener in self.listener_snapshot() {
            listener.session_failed(self.handle, error);
        }
    }

    /// Installs the session record produced by a validated RAKP4.
    pub fn install_session(&self, record: SessionRecord) {
        *self.session.lock().expect("Session poisoned") = Some(record);
    }

    /// Console and managed session IDs of the active session.
    pub fn session_ids(&self) -> Option<(u32, u32)> {
        self.session
            .lock()
            .expect("Session poisoned")
            .as_ref()
            .map(|record| (record.console_session_id, record.managed_session_id))
    }

    #[allow(dead_code)]
    pub(crate) fn session_key_material(&self) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        self.session
            .lock()
            .expect("Session poisoned")
            .as_ref()
            .map(|record| (record.sik.to_vec(), record.k1.to_vec(), record.k2.to_vec()))
    }

    /// Sends a sessionless payload and blocks for the correlated response.
    /// The message tag doubles as the correlation key; `handshake` marks
    /// stages whose post-retry timeout must fail the state machine.
    pub fn send_sessionless(
        &self,
        payload_type: PayloadType,
        payload: &[u8],
        tag: u8,
        handshake: bool,
        timeout: Duration,
        retries: u32,
    ) -> IpmiResult<Response> {
        let datagram = wire::build_sessionless(payload_type, payload)?;
        let entry = PendingRequest::new(tag as u32, datagram, false, handshake, false, timeout, retries);

        self.pending
            .lock()
            .expect("Pending table poisoned")
            .insert(entry.key, entry.clone());

        self.dispatch(&entry)?;
        entry.slot.wait()
    }

    /// Sends an ASF presence ping and blocks for the pong.
    pub fn send_ping(
        &self,
        tag: u8,
        timeout: Duration,
        retries: u32,
    ) -> IpmiResult<Response> {
        let entry = PendingRequest::new(tag as u32, wire::build_ping(tag), false, false, false, timeout, retries);

        self.pending
            .lock()
            .expect("Pending table poisoned")
            .insert(entry.key, entry.clone());

        self.dispatch(&entry)?;
        entry.slot.wait()
    }

    /// Sends an in-session command and blocks for the correlated response.
    /// Blocks first while the pipeline is at its limit.
    pub fn send_command(
        &self,
        netfn: u8,
        command: u8,
        data: Vec<u8>,
        timeout: Duration,
        retries: u32,
    ) -> IpmiResult<CommandResponse> {
        self.acquire_pipeline_slot()?;

        let entry = match self.enroll_command(netfn, command, data, timeout, retries, false) {
            Ok(entry) => entry,
            Err(error) => {
                self.release_pipeline_slot();
                return Err(error);
            }
        };

        self.schedule_timeout(&entry);

        match entry.slot.wait()? {
            Response::Command(response) => Ok(response),
            other => {
                logging::warn!(self.log, "mismatched response kind";
                               "context" => "send_command",
                               "response" => ?other);
                Err(IpmiError::ProtocolViolation(Violation::UnexpectedEvent))
            }
        }
    }

    /// Fires a Close Session for the active session without waiting for the
    /// response. Best-effort; the local side closes regardless.
    pub fn fire_close_session(&self) {
        let mut guard = self.session.lock().expect("Session poisoned");

        let record = match guard.as_mut() {
            Some(record) => record,
            None => return,
        };

        let sequence = record.next_sequence();
        let request = CommandRequest::close_session(sequence, record.managed_session_id);

        let datagram = encode_to_vec(&request)
            .and_then(|payload| {
                wire::build_in_session(
                    &record.protection(),
                    record.managed_session_id,
                    sequence,
                    &payload,
                )
            });

        if let Ok(datagram) = datagram {
            drop(self.messenger.send(self.remote, &datagram));
        }
    }

    /// Starts the periodic keep-alive. Each tick submits a Get Channel
    /// Authentication Capabilities no-op through the normal retry fabric;
    /// the session fails only when that command's own budget is spent.
    pub fn start_keepalive(
        &self,
        period: Duration,
        suite: u8,
        privilege: u8,
        timeout: Duration,
        retries: u32,
    ) {
        let weak = self.weak_self();

        let handle = self.timers.schedule_at_fixed_rate(period, move || {
            if let Some(handler) = weak.upgrade() {
                handler.keepalive_tick(suite, privilege, timeout, retries);
            }
        });

        *self.keepalive.lock().expect("Keepalive handle poisoned") = Some(handle);
    }

    fn keepalive_tick(&self, suite: u8, privilege: u8, timeout: Duration, retries: u32) {
        if self.state() != SessionState::SessionValid {
            return;
        }

        // Never queue a keep-alive behind a saturated pipeline.
        {
            let mut in_flight = self.in_flight.lock().expect("Pipeline counter poisoned");
            if *in_flight >= self.pipeline_limit {
                return;
            }
            *in_flight += 1;
        }

        let request = CommandRequest::auth_capabilities(0, suite, privilege);

        match self.enroll_command(request.netfn, request.command, request.data, timeout, retries, true)
        {
            Ok(entry) => {
                logging::trace!(self.log, "keepalive submitted";
                                "context" => "keepalive",
                                "sequence" => entry.key);
                self.schedule_timeout(&entry);
            }
            Err(error) => {
                logging::debug!(self.log, "keepalive submission failed";
                                "context" => "keepalive",
                                "error" => ?error);
                self.release_pipeline_slot();
            }
        }
    }

    fn acquire_pipeline_slot(&self) -> IpmiResult<()> {
        let mut in_flight = self.in_flight.lock().expect("Pipeline counter poisoned");

        while *in_flight >= self.pipeline_limit {
            if self.dead.load(Ordering::SeqCst) {
                return Err(IpmiError::ConnectionClosed);
            }

            in_flight = self
                .pipeline_free
                .wait(in_flight)
                .expect("Pipeline counter poisoned");
        }

        if self.dead.load(Ordering::SeqCst) {
            return Err(IpmiError::ConnectionClosed);
        }

        *in_flight += 1;
        Ok(())
    }

    fn release_pipeline_slot(&self) {
        let mut in_flight = self.in_flight.lock().expect("Pipeline counter poisoned");
        *in_flight = in_flight.saturating_sub(1);
        self.pipeline_free.notify_one();
    }

    /// Allocates the next session sequence, seals the command in the
    /// session envelope, enrolls the pending entry and hands the datagram
    /// to the messenger. Sending under the session lock keeps the wire
    /// order aligned with the sequence order.
    fn enroll_command(
        &self,
        netfn: u8,
        command: u8,
        data: Vec<u8>,
        timeout: Duration,
        retries: u32,
        keepalive: bool,
    ) -> IpmiResult<Arc<PendingRequest>> {
        let mut guard = self.session.lock().expect("Session poisoned");

        let record = guard.as_mut().ok_or(IpmiError::IllegalState)?;
        let sequence = record.next_sequence();

        let request = CommandRequest {
            sequence,
            netfn,
            command,
            data,
        };
        let payload = encode_to_vec(&request)?;
        let datagram = wire::build_in_session(
            &record.protection(),
            record.managed_session_id,
            sequence,
            &payload,
        )?;

        let entry = PendingRequest::new(sequence, datagram, true, false, keepalive, timeout, retries);

        self.pending
            .lock()
            .expect("Pending table poisoned")
            .insert(sequence, entry.clone());

        if let Err(error) = self.messenger.send(self.remote, &entry.datagram) {
            self.pending
                .lock()
                .expect("Pending table poisoned")
                .shift_remove(&sequence);
            return Err(error);
        }

        logging::trace!(self.log, "command enrolled";
                        "context" => "enroll",
                        "sequence" => sequence,
                        "netfn" => netfn,
                        "command" => command);

        Ok(entry)
    }

    /// First send plus timeout scheduling for sessionless entries.
    fn dispatch(&self, entry: &Arc<PendingRequest>) -> IpmiResult<()> {
        if let Err(error) = self.messenger.send(self.remote, &entry.datagram) {
            self.pending
                .lock()
                .expect("Pending table poisoned")
                .shift_remove(&entry.key);
            return Err(error);
        }

        self.schedule_timeout(entry);
        Ok(())
    }

    fn schedule_timeout(&self, entry: &Arc<PendingRequest>) {
        let weak = self.weak_self();
        let key = entry.key;

        let handle = self.timers.schedule_after(entry.timeout, move || {
            if let Some(handler) = weak.upgrade() {
                handler.on_timeout(key);
            }
        });

        *entry.timer.lock().expect("Timer slot poisoned") = Some(handle);
    }

    /// Timeout path: re-send while retries remain, otherwise fail the
    /// future and release the correlation key. A response that has already
    /// claimed the entry wins the tie-break.
    fn on_timeout(&self, key: u32) {
        let entry = {
            let pending = self.pending.lock().expect("Pending table poisoned");
            match pending.get(&key) {
                Some(entry) => entry.clone(),
                None => return,
            }
        };

        let remaining = entry.retries_left.load(Ordering::SeqCst);
        if remaining > 0 {
            entry.retries_left.store(remaining - 1, Ordering::SeqCst);

            logging::debug!(self.log, "re-sending request";
                            "context" => "timeout",
                            "key" => key,
                            "retries_left" => remaining - 1);

            if self.messenger.send(self.remote, &entry.datagram).is_ok() {
                self.schedule_timeout(&entry);
                return;
            }
        }

        if self
            .pending
            .lock()
            .expect("Pending table poisoned")
            .shift_remove(&key)
            .is_none()
        {
            // The response arrived between the lookup and now.
            return;
        }

        logging::debug!(self.log, "request timed out";
                        "context" => "timeout",
                        "key" => key);

        self.finish_entry(&entry, Err(IpmiError::ResponseTimeout));

        if entry.handshake {
            drop(self.with_machine(|machine| machine.apply(SessionEvent::Timeout)));
        }

        if entry.keepalive {
            self.fail_session(SessionEvent::Timeout, IpmiError::ResponseTimeout);
        }
    }

    /// Cancels the entry's timer, completes its future and frees its
    /// pipeline slot. The entry must already be out of the pending table.
    fn finish_entry(&self, entry: &Arc<PendingRequest>, result: IpmiResult<Response>) {
        if let Some(timer) = entry.timer.lock().expect("Timer slot poisoned").take() {
            timer.cancel();
        }

        entry.slot.complete(result);

        if entry.in_session {
            self.release_pipeline_slot();
        }
    }

    /// Removes and completes the entry under the correlation key. Returns
    /// false for strays.
    fn complete(&self, key: u32, result: IpmiResult<Response>) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("Pending table poisoned")
            .shift_remove(&key);

        match entry {
            Some(entry) => {
                self.finish_entry(&entry, result);
                true
            }
            None => false,
        }
    }

    fn cancel_keepalive(&self) {
        if let Some(handle) = self
            .keepalive
            .lock()
            .expect("Keepalive handle poisoned")
            .take()
        {
            handle.cancel();
        }
    }

    fn drain_pending(&self, error: IpmiError) {
        let drained: Vec<Arc<PendingRequest>> = self
            .pending
            .lock()
            .expect("Pending table poisoned")
            .drain(..)
            .map(|(_, entry)| entry)
            .collect();

        for entry in drained {
            self.finish_entry(&entry, Err(error.clone()));
        }

        self.pipeline_free.notify_all();
    }

    /// Session-fatal failure: drives the state machine, destroys the
    /// session record, fails every pending future and notifies listeners.
    fn fail_session(&self, event: SessionEvent, error: IpmiError) {
        self.dead.store(true, Ordering::SeqCst);

        drop(self.with_machine(|machine| machine.apply(event)));
        self.cancel_keepalive();

        *self.session.lock().expect("Session poisoned") = None;
        self.drain_pending(error.clone());

        for listener in self.listener_snapshot() {
            listener.session_failed(self.handle, &error);
        }
    }

    /// Local teardown on disconnect: completes every pending future with
    /// `ConnectionClosed` and drops the session record. State machine
    /// transitions are the connection's business.
    pub fn close(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.cancel_keepalive();

        *self.session.lock().expect("Session poisoned") = None;
        self.drain_pending(IpmiError::ConnectionClosed);
    }

    fn deliver_in_session(&self, sealed: SealedPacket) {
        let opened = {
            let mut guard = self.session.lock().expect("Session poisoned");

            let record = match guard.as_mut() {
                Some(record) => record,
                None => {
                    logging::trace!(self.log, "in-session packet without session";
                                    "context" => "deliver");
                    return;
                }
            };

            if sealed.header.session_id != record.console_session_id {
                logging::trace!(self.log, "session id mismatch";
                                "context" => "deliver",
                                "session_id" => sealed.header.session_id);
                return;
            }

            match sealed.open(&record.protection()) {
                Ok(payload) => {
                    let window = if sealed.header.authenticated {
                        &mut record.inbound
                    } else {
                        &mut record.inbound_unauth
                    };

                    if !window.accept(sealed.header.session_seq) {
                        logging::debug!(self.log, "replayed packet discarded";
                                        "context" => "deliver",
                                        "sequence" => sealed.header.session_seq,
                                        "low_water" => window.low_water());
                        Opened::Discard
                    } else {
                        record.last_activity = Instant::now();
                        Opened::Payload(payload)
                    }
                }
                Err(IpmiError::IntegrityCheckFailed) => Opened::IntegrityFailure,
                Err(error) => {
                    logging::debug!(self.log, "undecodable in-session packet";
                                    "context" => "deliver",
                                    "error" => ?error);
                    Opened::Discard
                }
            }
        };

        match opened {
            Opened::Discard => {}
            Opened::IntegrityFailure => {
                logging::warn!(self.log, "integrity check failed";
                               "context" => "deliver");
                self.fail_session(
                    SessionEvent::ProtocolError(Violation::AuthCodeMismatch),
                    IpmiError::IntegrityCheckFailed,
                );
            }
            Opened::Payload(payload) => {
                let response: CommandResponse =
                    match ipmiproto::shared::decode_from_slice(&payload) {
                        Ok(response) => response,
                        Err(error) => {
                            logging::debug!(self.log, "undecodable command response";
                                            "context" => "deliver",
                                            "error" => ?error);
                            return;
                        }
                    };

                if response.completion == COMPLETION_INVALID_SESSION {
                    self.complete(response.sequence, Err(IpmiError::SessionExpired));
                    self.fail_session(
                        SessionEvent::ProtocolError(Violation::SessionExpired),
                        IpmiError::SessionExpired,
                    );
                    return;
                }

                let sequence = response.sequence;
                if !self.complete(sequence, Ok(Response::Command(response.clone()))) {
                    logging::debug!(self.log, "unsolicited response";
                                    "context" => "deliver",
                                    "sequence" => sequence);
                    for listener in self.listener_snapshot() {
                        listener.unsolicited_response(self.handle, &response);
                    }
                }
            }
        }
    }
}

impl Subscriber for MessageHandler {
    /// Receive-order delivery from the messenger. Everything not from this
    /// connection's remote, and every undecodable datagram, is discarded.
    fn deliver(&self, source: SocketAddr, datagram: &[u8]) {
        if source != self.remote {
            return;
        }

        match wire::classify(datagram) {
            Ok(Inbound::Pong { tag }) => {
                self.complete(tag as u32, Ok(Response::Pong { tag }));
            }
            Ok(Inbound::Sessionless {
                payload_type: PayloadType::Ipmi,
                payload,
            }) => match ipmiproto::shared::decode_from_slice::<CommandResponse>(payload) {
                Ok(response) => {
                    let key = response.sequence;
                    self.complete(key, Ok(Response::Command(response)));
                }
                Err(error) => {
                    logging::debug!(self.log, "undecodable sessionless command";
                                    "context" => "deliver",
                                    "error" => ?error);
                }
            },
            Ok(Inbound::Sessionless {
                payload_type,
                payload,
            }) => match HandshakePayload::read(payload_type, payload) {
                Ok(response) => {
                    let key = response.tag() as u32;
                    self.complete(key, Ok(Response::Handshake(response)));
                }
                Err(error) => {
                    logging::debug!(self.log, "undecodable handshake payload";
                                    "context" => "deliver",
                                    "error" => ?error);
                }
            },
            Ok(Inbound::Sealed(sealed)) => self.deliver_in_session(sealed),
            Err(error) => {
                logging::trace!(self.log, "discarding datagram";
                                "context" => "deliver",
                                "error" => ?error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_window_accepts_increasing() {
        let mut window = ReplayWindow::new();

        for sequence in 1..100 {
            assert!(window.accept(sequence), "sequence {}", sequence);
        }
    }

    #[test]
    fn test_replay_window_rejects_duplicates() {
        let mut window = ReplayWindow::new();

        assert!(window.accept(5));
        assert!(!window.accept(5));
    }

    #[test]
    fn test_replay_window_accepts_in_window_gaps() {
        let mut window = ReplayWindow::new();

        assert!(window.accept(10));
        assert!(window.accept(7));
        assert!(window.accept(9));
        assert!(!window.accept(7));
    }

    #[test]
    fn test_replay_window_rejects_below_low_water() {
        let mut window = ReplayWindow::new();

        assert!(window.accept(100));
        assert_eq!(window.low_water(), 85);
        assert!(!window.accept(84));
        assert!(window.accept(85));
    }

    #[test]
    fn test_replay_window_large_jump_clears_bitmap() {
        let mut window = ReplayWindow::new();

        assert!(window.accept(3));
        assert!(window.accept(1000));
        assert!(!window.accept(3));
        assert!(window.accept(999));
    }

    #[test]
    fn test_response_slot_first_completion_wins() {
        let slot = ResponseSlot::new();

        assert!(slot.complete(Ok(Response::Pong { tag: 1 })));
        assert!(!slot.complete(Err(IpmiError::ResponseTimeout)));

        match slot.wait().unwrap() {
            Response::Pong { tag } => assert_eq!(tag, 1),
            other => panic!("Unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_response_slot_wakes_waiter() {
        let slot = Arc::new(ResponseSlot::new());

        let waiter_slot = slot.clone();
        let waiter = std::thread::spawn(move || waiter_slot.wait());

        std::thread::sleep(Duration::from_millis(20));
        slot.complete(Ok(Response::Pong { tag: 9 }));

        match waiter.join().unwrap().unwrap() {
            Response::Pong { tag } => assert_eq!(tag, 9),
            other => panic!("Unexpected response {:?}", other),
        }
    }
}
