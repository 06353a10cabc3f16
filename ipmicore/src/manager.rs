//! Connection manager: owns the messenger, the timer service and the
//! correlation pools shared by every connection, plus the append-only
//! connection handle table.

use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionListener};
use crate::machine::SessionState;
use crate::messenger::Messenger;
use crate::tags::{SessionIdAllocator, TagPool};
use crate::timer::TimerService;
use ipmiproto::cipher::CipherSuite;
use ipmiproto::command::CommandResponse;
use ipmiproto::handshake::PrivilegeLevel;
use ipmiproto::logging::{self, Logger};
use ipmiproto::shared::{IpmiError, IpmiResult};
use ipmiproto::IPMI_PORT;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Parses `ip:port` or a bare IP, which gets the well known IPMI port.
fn parse_address(address: &str) -> IpmiResult<SocketAddr> {
    if let Ok(parsed) = address.parse::<SocketAddr>() {
        return Ok(parsed);
    }

    address
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, IPMI_PORT))
        .map_err(Into::into)
}

pub struct ConnectionManager {
    config: ClientConfig,
    messenger: Arc<Messenger>,
    timers: Arc<TimerService>,
    tags: Arc<TagPool>,
    ids: Arc<SessionIdAllocator>,
    connections: Mutex<Vec<Arc<Connection>>>,
    closed: AtomicBool,
    log: Logger,
}

impl ConnectionManager {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: ClientConfig,
        log: L,
    ) -> IpmiResult<ConnectionManager> {
        let log = logging::child_or_discard(log.into());

        let messenger = Arc::new(Messenger::new(&log)?);
        let timers = Arc::new(TimerService::new(config.timer_pool_size));

        logging::debug!(log, "manager created";
                        "context" => "new",
                        "local_addr" => ?messenger.local_addr());

        Ok(ConnectionManager {
            config,
            messenger,
            timers,
            tags: Arc::new(TagPool::new()),
            ids: Arc::new(SessionIdAllocator::new()),
            connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            log,
        })
    }

    /// Creates a connection to the managed system at `address` and returns
    /// its handle. Handles are dense and never reused within a manager's
    /// lifetime.
    pub fn create_connection(&self, address: &str) -> IpmiResult<usize> {
        self.create_connection_with_ping_period(address, self.config.ping_period())
    }

    /// Creates a connection with an explicit keep-alive period.
    pub fn create_connection_with_ping_period(
        &self,
        address: &str,
        ping_period: Duration,
    ) -> IpmiResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IpmiError::ConnectionClosed);
        }

        let remote = parse_address(address)?;

        let mut table = self.connections.lock().expect("Connection table poisoned");
        let handle = table.len();

        let connection = Connection::connect(
            handle,
            remote,
            ping_period,
            self.config.clone(),
            &self.messenger,
            &self.timers,
            &self.ids,
            Some(&self.log),
        );

        table.push(connection);

        logging::info!(self.log, "connection created";
                       "context" => "create_connection",
                       "handle" => handle as u64,
                       "remote" => %remote);

        Ok(handle)
    }

    /// The connection behind a handle.
    pub fn connection(&self, handle: usize) -> IpmiResult<Arc<Connection>> {
        self.connections
            .lock()
            .expect("Connection table poisoned")
            .get(handle)
            .cloned()
            .ok_or(IpmiError::IllegalState)
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("Connection table poisoned")
            .len()
    }

    pub fn state(&self, handle: usize) -> IpmiResult<SessionState> {
        Ok(self.connection(handle)?.state())
    }

    pub fn register_listener(
        &self,
        handle: usize,
        listener: Arc<dyn ConnectionListener>,
    ) -> IpmiResult<()> {
        self.connection(handle)?.register_listener(listener);
        Ok(())
    }

    /// ASF presence ping against the remote.
    pub fn ping(&self, handle: usize) -> IpmiResult<()> {
        let connection = self.connection(handle)?;

        let tag = self.tags.acquire()?;
        let result = connection.ping(tag);
        self.tags.release(tag);

        result
    }

    /// First handshake stage, keyed by handle. The sessionless tag is
    /// acquired around the call and released regardless of outcome.
    pub fn get_channel_cipher_suites(
        &self,
        handle: usize,
    ) -> IpmiResult<Vec<&'static CipherSuite>> {
        let connection = self.connection(handle)?;

        let tag = self.tags.acquire()?;
        let result = connection.get_available_cipher_suites(tag);
        self.tags.release(tag);

        result
    }

    /// Second handshake stage.
    pub fn get_channel_authentication_capabilities(
        &self,
        handle: usize,
        suite: &CipherSuite,
        privilege: PrivilegeLevel,
    ) -> IpmiResult<CommandResponse> {
        let connection = self.connection(handle)?;

        let tag = self.tags.acquire()?;
        let result = connection.get_channel_authentication_capabilities(tag, suite, privilege);
        self.tags.release(tag);

        result
    }

    /// Third handshake stage: Open Session plus RAKP 1 through 4.
    pub fn start_session(
        &self,
        handle: usize,
        suite: &'static CipherSuite,
        privilege: PrivilegeLevel,
        username: &str,
        password: &[u8],
        bmc_key: Option<&[u8]>,
    ) -> IpmiResult<()> {
        let connection = self.connection(handle)?;

        let tag = self.tags.acquire()?;
        let result = connection.start_session(tag, suite, privilege, username, password, bmc_key);
        self.tags.release(tag);

        result
    }

    /// Submits an in-session command.
    pub fn send_command(
        &self,
        handle: usize,
        netfn: u8,
        command: u8,
        data: Vec<u8>,
    ) -> IpmiResult<CommandResponse> {
        self.connection(handle)?.send_command(netfn, command, data)
    }

    /// Closes one connection; its handle stays occupied.
    pub fn disconnect(&self, handle: usize) -> IpmiResult<()> {
        self.connection(handle)?.disconnect();
        Ok(())
    }

    /// Disconnects every active connection, then shuts down the pools, the
    /// timers and the messenger. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        logging::info!(self.log, "closing manager"; "context" => "close");

        let connections: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .expect("Connection table poisoned")
            .clone();

        for connection in connections {
            connection.disconnect();
        }

        self.tags.shutdown();
        self.timers.shutdown();
        self.messenger.close();
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
