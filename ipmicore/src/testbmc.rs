//! Scripted managed system speaking real UDP, used by the scenario tests.
//! Implements the server side of the handshake with the same codec and
//! derivation primitives, so a successful handshake proves both directions
//! agree bit for bit.

use ipmiproto::cipher::{CipherSuite, SessionKey};
use ipmiproto::command::{
    CommandRequest, CommandResponse, CMD_CLOSE_SESSION, CMD_GET_CHANNEL_AUTH_CAPABILITIES,
    COMPLETION_OK,
};
use ipmiproto::handshake::{
    status, CipherSuitesRequest, CipherSuitesResponse, OpenSessionRequest, OpenSessionResponse,
    Rakp1, Rakp2, Rakp3, Rakp4,
};
use ipmiproto::shared::{decode_from_slice, encode_to_vec};
use ipmiproto::wire::{self, Inbound, PayloadType, SealedPacket, SessionProtection};
use ipmiproto::CLASS_ASF;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const MANAGED_SESSION_ID: u32 = 0xAABB_CCDD;
pub const MANAGED_NONCE: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    0x0F,
];
pub const MANAGED_GUID: [u8; 16] = [0xC0; 16];

struct BmcSession {
    suite: &'static CipherSuite,
    console_session_id: u32,
    sik: SessionKey,
    k1: SessionKey,
    k2: SessionKey,
    outbound_seq: u32,
}

#[derive(Default)]
struct HandshakeScratch {
    console_session_id: u32,
    suite_id: u8,
    privilege: u8,
    username: String,
    console_nonce: [u8; 16],
}

struct BmcState {
    password: Vec<u8>,
    bmc_key: Option<Vec<u8>>,
    suites: Vec<u8>,
    shutdown: AtomicBool,
    drop_in_session: AtomicBool,
    in_session_received: AtomicUsize,
    auth_caps_received: AtomicUsize,
    received_sequences: Mutex<Vec<u32>>,
    scratch: Mutex<HandshakeScratch>,
    session: Mutex<Option<BmcSession>>,
    peer: Mutex<Option<SocketAddr>>,
}

pub struct MockBmc {
    socket: UdpSocket,
    address: SocketAddr,
    state: Arc<BmcState>,
    worker: Option<thread::JoinHandle<()>>,
}

impl MockBmc {
    pub fn start(password: &[u8], suites: Vec<u8>) -> MockBmc {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("Mock bind failed");
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("Mock timeout failed");
        let address = socket.local_addr().expect("Mock address failed");

        let state = Arc::new(BmcState {
            password: password.to_vec(),
            bmc_key: None,
            suites,
            shutdown: AtomicBool::new(false),
            drop_in_session: AtomicBool::new(false),
            in_session_received: AtomicUsize::new(0),
            auth_caps_received: AtomicUsize::new(0),
            received_sequences: Mutex::new(Vec::new()),
            scratch: Mutex::new(HandshakeScratch::default()),
            session: Mutex::new(None),
            peer: Mutex::new(None),
        });

        let worker_socket = socket.try_clone().expect("Mock socket clone failed");
        let worker_state = state.clone();
        let worker = thread::spawn(move || Self::run(worker_socket, worker_state));

        MockBmc {
            socket,
            address,
            state,
            worker: Some(worker),
        }
    }

    pub fn address_string(&self) -> String {
        self.address.to_string()
    }

    /// Drop every in-session datagram (still counted) from now on.
    pub fn set_drop_in_session(&self, enabled: bool) {
        self.state.drop_in_session.store(enabled, Ordering::SeqCst);
    }

    /// Number of in-session datagrams observed on the wire.
    pub fn in_session_received(&self) -> usize {
        self.state.in_session_received.load(Ordering::SeqCst)
    }

    /// Number of in-session Get Channel Authentication Capabilities no-ops.
    pub fn auth_caps_received(&self) -> usize {
        self.state.auth_caps_received.load(Ordering::SeqCst)
    }

    /// Wrapper sequence numbers observed on in-session requests.
    pub fn received_sequences(&self) -> Vec<u32> {
        self.state.received_sequences.lock().unwrap().clone()
    }

    /// K1/K2 derived on the managed system side.
    pub fn session_key_material(&self) -> Option<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        self.state
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|session| (session.sik.to_vec(), session.k1.to_vec(), session.k2.to_vec()))
    }

    /// Re-sends a validly sealed response with a wrapper sequence five
    /// behind the current one. The console must discard it as replayed.
    pub fn inject_stale_response(&self) {
        let guard = self.state.session.lock().unwrap();
        let session = guard.as_ref().expect("No session to replay against");
        assert!(session.outbound_seq > 5, "Not enough traffic to replay");

        let stale = CommandResponse {
            sequence: 1,
            netfn: 0x07,
            command: 0x01,
            completion: COMPLETION_OK,
            data: Vec::new(),
        };

        let protection = SessionProtection {
            suite: session.suite,
            k1: &session.k1,
            k2: &session.k2,
        };

        let datagram = wire::build_in_session(
            &protection,
            session.console_session_id,
            session.outbound_seq - 5,
            &encode_to_vec(&stale).unwrap(),
        )
        .unwrap();

        let peer = (*self.state.peer.lock().unwrap()).expect("No peer recorded");
        self.socket.send_to(&datagram, peer).unwrap();
    }

    pub fn stop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            drop(worker.join());
        }
    }

    fn run(socket: UdpSocket, state: Arc<BmcState>) {
        let mut buffer = [0u8; 1024];

        while !state.shutdown.load(Ordering::SeqCst) {
            let (size, source) = match socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(error)
                    if error.kind() == io::ErrorKind::WouldBlock
                        || error.kind() == io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => continue,
            };

            *state.peer.lock().unwrap() = Some(source);
            let datagram = &buffer[..size];

            // ASF presence ping.
            if size >= 10 && datagram[3] == CLASS_ASF && datagram[8] == 0x80 {
                drop(socket.send_to(&wire::build_pong(datagram[9]), source));
                continue;
            }

            match wire::classify(datagram) {
                Ok(Inbound::Sessionless {
                    payload_type,
                    payload,
                }) => Self::handle_sessionless(&socket, &state, source, payload_type, payload),
                Ok(Inbound::Sealed(sealed)) => {
                    Self::handle_in_session(&socket, &state, source, sealed)
                }
                _ => {}
            }
        }
    }

    fn respond_sessionless(
        socket: &UdpSocket,
        source: SocketAddr,
        payload_type: PayloadType,
        payload: Vec<u8>,
    ) {
        let datagram = wire::build_sessionless(payload_type, &payload).unwrap();
        drop(socket.send_to(&datagram, source));
    }

    fn handle_sessionless(
        socket: &UdpSocket,
        state: &Arc<BmcState>,
        source: SocketAddr,
        payload_type: PayloadType,
        payload: &[u8],
    ) {
        match payload_type {
            PayloadType::CipherSuites => {
                let request: CipherSuitesRequest = match decode_from_slice(payload) {
                    Ok(request) => request,
                    Err(_) => return,
                };

                let response = CipherSuitesResponse {
                    tag: request.tag,
                    suites: state.suites.clone(),
                };
                Self::respond_sessionless(
                    socket,
                    source,
                    PayloadType::CipherSuites,
                    encode_to_vec(&response).unwrap(),
                );
            }
            PayloadType::Ipmi => {
                let request: CommandRequest = match decode_from_slice(payload) {
                    Ok(request) => request,
                    Err(_) => return,
                };

                let response = CommandResponse::for_request(&request, COMPLETION_OK, vec![0x01]);
                Self::respond_sessionless(
                    socket,
                    source,
                    PayloadType::Ipmi,
                    encode_to_vec(&response).unwrap(),
                );
            }
            PayloadType::OpenSession => {
                let request: OpenSessionRequest = match decode_from_slice(payload) {
                    Ok(request) => request,
                    Err(_) => return,
                };

                let suite = CipherSuite::all()
                    .iter()
                    .find(|suite| {
                        suite.authentication.wire_id() == request.authentication
                            && suite.integrity.wire_id() == request.integrity
                            && suite.confidentiality.wire_id() == request.confidentiality
                    })
                    .expect("No suite for proposed algorithms");

                {
                    let mut scratch = state.scratch.lock().unwrap();
                    scratch.console_session_id = request.console_session_id;
                    scratch.suite_id = suite.id;
                }

                let response = OpenSessionResponse {
                    tag: request.tag,
                    status: status::NO_ERROR,
                    privilege: request.privilege,
                    console_session_id: request.console_session_id,
                    managed_session_id: MANAGED_SESSION_ID,
                    authentication: request.authentication,
                    integrity: request.integrity,
                    confidentiality: request.confidentiality,
                };
                Self::respond_sessionless(
                    socket,
                    source,
                    PayloadType::OpenSession,
                    encode_to_vec(&response).unwrap(),
                );
            }
            PayloadType::Rakp1 => {
                let request: Rakp1 = match decode_from_slice(payload) {
                    Ok(request) => request,
                    Err(_) => return,
                };

                let (console_session_id, suite) = {
                    let mut scratch = state.scratch.lock().unwrap();
                    scratch.privilege = request.privilege;
                    scratch.username = request.username.clone();
                    scratch.console_nonce = request.console_nonce;
                    (
                        scratch.console_session_id,
                        CipherSuite::from_id(scratch.suite_id).unwrap(),
                    )
                };

                let auth_code = suite.rakp2_auth_code(
                    &state.password,
                    console_session_id,
                    MANAGED_SESSION_ID,
                    &request.console_nonce,
                    &MANAGED_NONCE,
                    &MANAGED_GUID,
                    request.privilege,
                    &request.username,
                );

                let response = Rakp2 {
                    tag: request.tag,
                    status: status::NO_ERROR,
                    console_session_id,
                    managed_nonce: MANAGED_NONCE,
                    managed_guid: MANAGED_GUID,
                    auth_code,
                };
                Self::respond_sessionless(
                    socket,
                    source,
                    PayloadType::Rakp2,
                    encode_to_vec(&response).unwrap(),
                );
            }
            PayloadType::Rakp3 => {
                let request: Rakp3 = match decode_from_slice(payload) {
                    Ok(request) => request,
                    Err(_) => return,
                };

                let scratch = state.scratch.lock().unwrap();
                let suite = CipherSuite::from_id(scratch.suite_id).unwrap();

                let expected = suite.rakp3_auth_code(
                    &state.password,
                    &MANAGED_NONCE,
                    scratch.console_session_id,
                    scratch.privilege,
                    &scratch.username,
                );

                if expected != request.auth_code {
                    let response = Rakp4 {
                        tag: request.tag,
                        status: status::INVALID_INTEGRITY_CHECK_VALUE,
                        console_session_id: scratch.console_session_id,
                        integrity_check: Vec::new(),
                    };
                    Self::respond_sessionless(
                        socket,
                        source,
                        PayloadType::Rakp4,
                        encode_to_vec(&response).unwrap(),
                    );
                    return;
                }

                let sik = suite.derive_sik(
                    &state.password,
                    state.bmc_key.as_deref(),
                    &MANAGED_NONCE,
                    &scratch.console_nonce,
                    scratch.privilege,
                    &scratch.username,
                );
                let k1 = suite.derive_k1(&sik);
                let k2 = suite.derive_k2(&sik);

                let integrity_check = suite.rakp4_integrity_check(
                    &sik,
                    &scratch.console_nonce,
                    MANAGED_SESSION_ID,
                    &MANAGED_GUID,
                );

                let response = Rakp4 {
                    tag: request.tag,
                    status: status::NO_ERROR,
                    console_session_id: scratch.console_session_id,
                    integrity_check,
                };

                *state.session.lock().unwrap() = Some(BmcSession {
                    suite,
                    console_session_id: scratch.console_session_id,
                    sik,
                    k1,
                    k2,
                    outbound_seq: 0,
                });

                Self::respond_sessionless(
                    socket,
                    source,
                    PayloadType::Rakp4,
                    encode_to_vec(&response).unwrap(),
                );
            }
            _ => {}
        }
    }

    fn handle_in_session(
        socket: &UdpSocket,
        state: &Arc<BmcState>,
        source: SocketAddr,
        sealed: SealedPacket,
    ) {
        state.in_session_received.fetch_add(1, Ordering::SeqCst);
        state
            .received_sequences
            .lock()
            .unwrap()
            .push(sealed.header.session_seq);

        if state.drop_in_session.load(Ordering::SeqCst) {
            return;
        }

        let mut guard = state.session.lock().unwrap();
        let session = match guard.as_mut() {
            Some(session) => session,
            None => return,
        };

        let payload = {
            let protection = SessionProtection {
                suite: session.suite,
                k1: &session.k1,
                k2: &session.k2,
            };
            match sealed.open(&protection) {
                Ok(payload) => payload,
                Err(_) => return,
            }
        };

        let request: CommandRequest = match decode_from_slice(&payload) {
            Ok(request) => request,
            Err(_) => return,
        };

        if request.command == CMD_GET_CHANNEL_AUTH_CAPABILITIES {
            state.auth_caps_received.fetch_add(1, Ordering::SeqCst);
        }

        let closing = request.command == CMD_CLOSE_SESSION;

        // Responses echo the request data.
        let response = CommandResponse::for_request(&request, COMPLETION_OK, request.data.clone());

        session.outbound_seq += 1;
        let sequence = session.outbound_seq;

        let datagram = {
            let protection = SessionProtection {
                suite: session.suite,
                k1: &session.k1,
                k2: &session.k2,
            };
            wire::build_in_session(
                &protection,
                session.console_session_id,
                sequence,
                &encode_to_vec(&response).unwrap(),
            )
            .unwrap()
        };

        drop(socket.send_to(&datagram, source));

        if closing {
            *guard = None;
        }
    }
}

impl Drop for MockBmc {
    fn drop(&mut self) {
        self.stop();
    }
}
