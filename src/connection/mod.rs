//! A single TCP endpoint, optionally wrapped in TLS.
//!
//! [`Connection`] covers both sides: clients are created from a
//! [`ClientConfig`] and connect (with retries) on demand; the server creates
//! connections for accepted sockets and runs the server handshake on them.
//!
//! All blocking calls wait with `poll(2)` on the connection's descriptor and
//! give up after the configured timeout. Closing the connection from another
//! thread wakes any waiter, which then fails with [`Error::Closed`].

mod tls;

pub(crate) use tls::TlsSession;

use crate::config::{ClientConfig, KeepaliveConfig};
use crate::credentials::{CredentialSnapshot, CredentialStore, Mode};
use crate::error::{Error, ErrorKind, TimeoutPhase};
use crate::handle::{lock, Handle, HandleRegistry, INVALID_FD};
use tls::{complete_handshake, map_io, map_tls};

use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, trace, warn};
use x509_parser::parse_x509_certificate;

/// Hard ceiling for a single [`Connection::write`].
pub const MAX_WRITE_SIZE: usize = 100 * 1024 * 1024;

// Upper bound for one poll(2) call, so a close from another thread is
// noticed even on sockets that never become ready.
const POLL_SLICE: Duration = Duration::from_millis(100);

// ============================================================================
// State
// ============================================================================

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Handshaking,
    Secured,
    Failed,
    HandshakeFailed,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Idle,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Handshaking,
            4 => ConnectionState::Secured,
            5 => ConnectionState::Failed,
            6 => ConnectionState::HandshakeFailed,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Handshaking => 3,
            ConnectionState::Secured => 4,
            ConnectionState::Failed => 5,
            ConnectionState::HandshakeFailed => 6,
            ConnectionState::Closed => 7,
        }
    }
}

/// Identity taken from the peer's leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Subject distinguished name, e.g. `CN=client, O=Example`.
    pub dn: String,
    /// Serial number as colon-separated hex.
    pub serial: String,
    /// `notAfter` as seconds since the Unix epoch.
    pub expiration: i64,
}

impl PeerCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let (_, cert) = parse_x509_certificate(der)
            .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
        Ok(Self {
            dn: cert.subject().to_string(),
            serial: cert.raw_serial_as_string(),
            expiration: cert.validity().not_after.timestamp(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Readiness {
    Readable,
    Writable,
}

enum Role {
    Client {
        config: Box<ClientConfig>,
        credentials: Option<Arc<CredentialStore>>,
    },
    Server,
}

enum ReadStep {
    Data(usize, bool),
    Again,
    Blocked,
}

enum WriteStep {
    Wrote(usize),
    Done,
    Blocked,
}

// ============================================================================
// Connection
// ============================================================================

/// One TCP (optionally TLS) endpoint.
///
/// All methods take `&self`; a connection can be read on one thread, written
/// on another and closed on a third.
pub struct Connection {
    role: Role,
    read_timeout: Duration,
    write_timeout: Duration,
    handle: Mutex<Option<Arc<Handle>>>,
    // Socket of a connect attempt that has not finished yet.
    pending: Mutex<Option<Arc<Handle>>>,
    // Bumped by every close; a connect started before it gives up.
    closes: AtomicU64,
    state: AtomicU8,
    connect_lock: Mutex<()>,
    endpoints: Mutex<Option<(SocketAddr, SocketAddr)>>,
    peer_cert: Mutex<Option<PeerCertificate>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("handle", &*lock(&self.handle))
            .field("endpoints", &*lock(&self.endpoints))
            .finish()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Connection {
    /// Creates an idle client connection. Nothing is sent until
    /// [`Connection::connect`].
    ///
    /// With TLS enabled the credentials are loaded and validated here.
    pub fn client(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let credentials = if config.tls {
            let mode = Mode::Client {
                verify_certificate: config.verify_certificate,
                verify_hostname: config.verify_hostname,
            };
            let sets = config.credentials.iter().take(1).cloned().collect();
            Some(Arc::new(CredentialStore::configure(sets, mode, None)?))
        } else {
            None
        };
        Ok(Self {
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            role: Role::Client {
                config: Box::new(config),
                credentials,
            },
            handle: Mutex::new(None),
            pending: Mutex::new(None),
            closes: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Idle.as_u8()),
            connect_lock: Mutex::new(()),
            endpoints: Mutex::new(None),
            peer_cert: Mutex::new(None),
        })
    }

    /// Creates a client connection and connects it.
    pub fn open(config: ClientConfig) -> Result<Self, Error> {
        let conn = Self::client(config)?;
        conn.connect()?;
        Ok(conn)
    }

    /// Wraps an accepted socket.
    pub(crate) fn accepted(
        handle: Arc<Handle>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        let endpoints = handle.socket().ok().and_then(socket_endpoints);
        Self {
            role: Role::Server,
            read_timeout,
            write_timeout,
            handle: Mutex::new(Some(handle)),
            pending: Mutex::new(None),
            closes: AtomicU64::new(0),
            state: AtomicU8::new(ConnectionState::Connected.as_u8()),
            connect_lock: Mutex::new(()),
            endpoints: Mutex::new(endpoints),
            peer_cert: Mutex::new(None),
        }
    }
}

// ============================================================================
// Connection Establishment
// ============================================================================

impl Connection {
    /// Connects a client connection, replacing any previous socket.
    ///
    /// Makes up to `connect_retries` attempts (at least one), sleeping
    /// `connect_retry_delay` between them. One attempt tries the resolved
    /// addresses in order and handshakes on the first that accepts; the
    /// whole attempt is bounded by `connect_timeout`, which also covers the
    /// TLS handshake. Handshake and verification failures are returned as-is
    /// and not retried; anything else ends in [`Error::Timeout`] once the
    /// attempts are used up.
    ///
    /// A [`Connection::close`] from another thread cancels the attempt in
    /// progress and makes this return [`Error::Closed`].
    #[instrument(skip(self))]
    pub fn connect(&self) -> Result<(), Error> {
        let _guard = lock(&self.connect_lock);
        self.connect_locked()
    }

    fn connect_locked(&self) -> Result<(), Error> {
        let Role::Client {
            config,
            credentials,
        } = &self.role
        else {
            return Err(Error::InvalidState("accepted connections cannot reconnect"));
        };
        let epoch = self.closes.load(Ordering::Acquire);
        self.release(false);

        let addrs = resolve(&config.host, config.port)?;
        let attempts = config.connect_retries.max(1);
        for attempt in 1..=attempts {
            if attempt > 1 {
                std::thread::sleep(config.connect_retry_delay);
            }
            if self.closed_since(epoch) {
                return Err(self.cancelled());
            }
            self.set_state(ConnectionState::Connecting);
            match self.attempt(config, credentials.as_deref(), &addrs, epoch) {
                Ok(()) => return Ok(()),
                Err(_) if self.closed_since(epoch) => return Err(self.cancelled()),
                Err(err) if err.kind() == ErrorKind::Security => {
                    warn!(host = %config.host, port = config.port, %err, "TLS handshake failed");
                    self.set_state(ConnectionState::HandshakeFailed);
                    return Err(err);
                }
                Err(err) => {
                    debug!(attempt, attempts, host = %config.host, port = config.port, %err, "Connect attempt failed");
                }
            }
        }

        warn!(host = %config.host, port = config.port, attempts, "Giving up connecting");
        self.set_state(ConnectionState::Failed);
        Err(Error::Timeout {
            phase: TimeoutPhase::Connect,
        })
    }

    fn attempt(
        &self,
        config: &ClientConfig,
        credentials: Option<&CredentialStore>,
        addrs: &[SocketAddr],
        epoch: u64,
    ) -> Result<(), Error> {
        let started = Instant::now();
        let mut last_err = Error::Timeout {
            phase: TimeoutPhase::Connect,
        };
        let mut socket = None;
        for addr in addrs {
            match connect_socket(addr, config) {
                Ok(connected) => {
                    socket = Some(connected);
                    break;
                }
                Err(err) => last_err = err,
            }
        }
        let socket = socket.ok_or(last_err)?;

        let handle = HandleRegistry::global().add(socket);
        *lock(&self.pending) = Some(handle.clone());
        let result = if self.closed_since(epoch) {
            Err(Error::Closed)
        } else {
            self.establish(config, credentials, &handle, started, epoch)
        };
        lock(&self.pending).take();
        if result.is_err() {
            HandleRegistry::global().close(&handle);
        }
        result
    }

    fn establish(
        &self,
        config: &ClientConfig,
        credentials: Option<&CredentialStore>,
        handle: &Arc<Handle>,
        started: Instant,
        epoch: u64,
    ) -> Result<(), Error> {
        let endpoints = handle.socket().ok().and_then(socket_endpoints);
        if let Some((local_addr, peer_addr)) = endpoints {
            info!(id = handle.id(), %local_addr, %peer_addr, "TCP connection established");
        }

        let mut peer = None;
        if let Some(credentials) = credentials {
            self.set_state(ConnectionState::Handshaking);
            let name = config
                .server_name
                .clone()
                .unwrap_or_else(|| config.host.clone());
            start_client_session(handle, credentials.snapshot(), name)?;
            complete_handshake(handle, started + config.connect_timeout)?;
            peer = peer_certificate_of(handle);
        }

        *lock(&self.endpoints) = endpoints;
        *lock(&self.peer_cert) = peer;
        // A close either sees the new handle or is seen here.
        let mut current = lock(&self.handle);
        if self.closed_since(epoch) {
            return Err(Error::Closed);
        }
        *current = Some(handle.clone());
        self.set_state(if credentials.is_some() {
            ConnectionState::Secured
        } else {
            ConnectionState::Connected
        });
        Ok(())
    }

    /// Runs the server side of the TLS handshake on an accepted socket.
    ///
    /// `snapshot` is captured by the caller when the handshake starts, so a
    /// concurrent credential reload does not affect it.
    #[instrument(skip(self, snapshot))]
    pub(crate) fn server_handshake(
        &self,
        snapshot: &CredentialSnapshot,
        timeout: Duration,
    ) -> Result<(), Error> {
        let handle = self.current_handle().ok_or(Error::Closed)?;
        let session = rustls::ServerConnection::new(snapshot.server_config()?)
            .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
        handle.attach_tls(TlsSession::Server(session));
        self.set_state(ConnectionState::Handshaking);

        if let Err(err) = complete_handshake(&handle, Instant::now() + timeout) {
            self.set_state(ConnectionState::HandshakeFailed);
            return Err(err);
        }

        let sni = handle
            .with_tls(|session, _| session.requested_server_name())
            .flatten();
        let peer = peer_certificate_of(&handle);
        debug!(
            id = handle.id(),
            sni = sni.as_deref().unwrap_or(""),
            client_dn = peer.as_ref().map_or("", |p| p.dn.as_str()),
            "Server handshake completed"
        );
        *lock(&self.peer_cert) = peer;
        self.set_state(ConnectionState::Secured);
        Ok(())
    }
}

fn start_client_session(
    handle: &Handle,
    snapshot: Arc<CredentialSnapshot>,
    name: String,
) -> Result<(), Error> {
    let server_name =
        ServerName::try_from(name.clone()).map_err(|_| Error::TlsInvalidServerName(name))?;
    let session = rustls::ClientConnection::new(snapshot.client_config()?, server_name)
        .map_err(map_tls)?;
    handle.attach_tls(TlsSession::Client(session));
    Ok(())
}

fn peer_certificate_of(handle: &Handle) -> Option<PeerCertificate> {
    let der = handle.with_tls(|session, _| session.peer_leaf()).flatten()?;
    match PeerCertificate::from_der(&der) {
        Ok(peer) => Some(peer),
        Err(err) => {
            warn!(id = handle.id(), %err, "Could not parse peer certificate");
            None
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress(format!("{host}:{port}")))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::InvalidAddress(format!("{host}:{port}")));
    }
    Ok(addrs)
}

fn connect_socket(addr: &SocketAddr, config: &ClientConfig) -> Result<Socket, Error> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nodelay(true)?;
    apply_keepalive(&socket, &config.keepalive)?;
    match socket.connect_timeout(&SockAddr::from(*addr), config.connect_timeout) {
        Ok(()) => {}
        Err(err)
            if err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::WouldBlock =>
        {
            return Err(Error::Timeout {
                phase: TimeoutPhase::Connect,
            })
        }
        Err(err) => return Err(err.into()),
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Applies TCP keepalive parameters to `socket`.
pub(crate) fn apply_keepalive(socket: &Socket, keepalive: &KeepaliveConfig) -> Result<(), Error> {
    let params = TcpKeepalive::new().with_time(keepalive.idle);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "macos"
    ))]
    let params = params
        .with_interval(keepalive.interval)
        .with_retries(keepalive.probes);
    socket.set_tcp_keepalive(&params)?;
    Ok(())
}

fn socket_endpoints(socket: &Socket) -> Option<(SocketAddr, SocketAddr)> {
    let local = socket.local_addr().ok()?.as_socket()?;
    let peer = socket.peer_addr().ok()?.as_socket()?;
    Some((local, peer))
}

// ============================================================================
// Data Operations
// ============================================================================

impl Connection {
    /// Reads at least one byte, waiting up to the read timeout.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.read_with_more_flag(buf).map(|(n, _)| n)
    }

    /// Like [`Connection::read`], and also reports whether decrypted bytes are
    /// still buffered. When the flag is set, the next read returns without
    /// waiting on the socket. Always `false` for plain TCP.
    pub fn read_with_more_flag(&self, buf: &mut [u8]) -> Result<(usize, bool), Error> {
        if buf.is_empty() {
            return Err(Error::InvalidParameter("read buffer is empty".into()));
        }
        let handle = self.active_handle()?;
        let deadline = Instant::now() + self.read_timeout;
        loop {
            match self.read_step(&handle, buf) {
                Ok(ReadStep::Data(n, more)) => return Ok((n, more)),
                Ok(ReadStep::Again) => {}
                Ok(ReadStep::Blocked) => {
                    if let Err(err) =
                        wait_ready(&handle, Readiness::Readable, deadline, TimeoutPhase::Read)
                    {
                        return Err(self.fail(&handle, err));
                    }
                }
                Err(err) => return Err(self.fail(&handle, err)),
            }
        }
    }

    /// Reads without waiting. `Ok(None)` means nothing is available yet.
    pub(crate) fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let handle = self.current_handle().ok_or(Error::Closed)?;
        loop {
            match self.read_step(&handle, buf) {
                Ok(ReadStep::Data(n, _)) => return Ok(Some(n)),
                Ok(ReadStep::Again) => {}
                Ok(ReadStep::Blocked) => return Ok(None),
                Err(err) => return Err(self.fail(&handle, err)),
            }
        }
    }

    fn read_step(&self, handle: &Handle, buf: &mut [u8]) -> Result<ReadStep, Error> {
        let tls = handle.with_tls(|session, mut socket| -> Result<ReadStep, Error> {
            // Buffered plaintext first.
            match session.reader().read(buf) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => {
                    let more = session.has_buffered_plaintext();
                    trace!(len = n, more, "Read plaintext from TLS");
                    return Ok(ReadStep::Data(n, more));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(map_io(err)),
            }
            match session.read_tls(&mut socket) {
                Ok(0) => Err(Error::Closed),
                Ok(sz) => {
                    trace!(len = sz, "Read encrypted data from socket");
                    session.process_new_packets().map_err(map_tls)?;
                    // Key updates and alerts may need an answer.
                    session.flush(socket)?;
                    Ok(ReadStep::Again)
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadStep::Blocked),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(ReadStep::Again),
                Err(err) => Err(map_io(err)),
            }
        });
        if let Some(step) = tls {
            return step;
        }

        let mut socket = handle.socket()?;
        match socket.read(buf) {
            Ok(0) => Err(Error::Closed),
            Ok(n) => {
                trace!(len = n, "Read data from socket");
                Ok(ReadStep::Data(n, false))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadStep::Blocked),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(ReadStep::Again),
            Err(err) => Err(map_io(err)),
        }
    }

    /// Writes all of `data`.
    ///
    /// Payloads over [`MAX_WRITE_SIZE`] are rejected before anything is sent.
    /// Every wait for writability is bounded by the write timeout.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        if data.len() > MAX_WRITE_SIZE {
            return Err(Error::PayloadTooLarge {
                len: data.len(),
                max: MAX_WRITE_SIZE,
            });
        }
        let handle = self.active_handle()?;
        let mut offset = 0;
        let mut deadline = Instant::now() + self.write_timeout;
        loop {
            match self.write_step(&handle, &data[offset..]) {
                Ok(WriteStep::Wrote(n)) => {
                    offset += n;
                    deadline = Instant::now() + self.write_timeout;
                }
                Ok(WriteStep::Done) => {
                    trace!(len = data.len(), "Wrote data");
                    return Ok(data.len());
                }
                Ok(WriteStep::Blocked) => {
                    if let Err(err) =
                        wait_ready(&handle, Readiness::Writable, deadline, TimeoutPhase::Write)
                    {
                        return Err(self.fail(&handle, err));
                    }
                }
                Err(err) => return Err(self.fail(&handle, err)),
            }
        }
    }

    fn write_step(&self, handle: &Handle, rest: &[u8]) -> Result<WriteStep, Error> {
        let tls = handle.with_tls(|session, socket| -> Result<WriteStep, Error> {
            if !session.flush(socket)? {
                return Ok(WriteStep::Blocked);
            }
            if rest.is_empty() {
                return Ok(WriteStep::Done);
            }
            let n = session.writer().write(rest).map_err(map_io)?;
            Ok(WriteStep::Wrote(n))
        });
        if let Some(step) = tls {
            return step;
        }

        if rest.is_empty() {
            return Ok(WriteStep::Done);
        }
        let mut socket = handle.socket()?;
        match socket.write(rest) {
            Ok(0) => Err(Error::Closed),
            Ok(n) => Ok(WriteStep::Wrote(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(WriteStep::Blocked),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(WriteStep::Wrote(0)),
            Err(err) => Err(map_io(err)),
        }
    }
}

// ============================================================================
// Lifecycle and Queries
// ============================================================================

impl Connection {
    /// Non-blocking liveness check: peeks at the socket without consuming.
    pub fn is_connected(&self) -> bool {
        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Secured
        ) {
            return false;
        }
        let Some(handle) = self.current_handle() else {
            return false;
        };
        let Ok(socket) = handle.socket() else {
            return false;
        };
        let mut probe = [MaybeUninit::<u8>::uninit(); 1];
        match socket.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
        }
    }

    /// Sends a TLS close-notify if applicable and releases the socket.
    /// Idempotent.
    pub fn close(&self) {
        self.closes.fetch_add(1, Ordering::AcqRel);
        let pending = lock(&self.pending).clone();
        if let Some(handle) = pending {
            HandleRegistry::global().close(&handle);
        }
        self.release(true);
        self.set_state(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// The handle currently backing this connection.
    pub fn handle(&self) -> Option<Arc<Handle>> {
        self.current_handle()
    }

    pub fn is_tls(&self) -> bool {
        self.current_handle().is_some_and(|h| h.has_tls())
    }

    /// Peer certificate identity, if the peer presented a certificate.
    pub fn peer_certificate(&self) -> Option<PeerCertificate> {
        lock(&self.peer_cert).clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.endpoints).map(|(local, _)| local)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.endpoints).map(|(_, peer)| peer)
    }

    fn closed_since(&self, epoch: u64) -> bool {
        self.closes.load(Ordering::Acquire) != epoch
    }

    fn cancelled(&self) -> Error {
        debug!("Connect cancelled by close");
        self.set_state(ConnectionState::Closed);
        Error::Closed
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn current_handle(&self) -> Option<Arc<Handle>> {
        lock(&self.handle).clone()
    }

    // The open handle, reconnecting first if the client is configured to.
    fn active_handle(&self) -> Result<Arc<Handle>, Error> {
        if let Some(handle) = self.current_handle().filter(|h| h.is_valid()) {
            return Ok(handle);
        }
        match &self.role {
            Role::Client { config, .. } if config.auto_connect => {
                let _guard = lock(&self.connect_lock);
                // Another thread may have reconnected while we waited.
                if let Some(handle) = self.current_handle().filter(|h| h.is_valid()) {
                    return Ok(handle);
                }
                info!(host = %config.host, port = config.port, "Reconnecting");
                self.connect_locked()?;
                self.current_handle().ok_or(Error::Closed)
            }
            _ => Err(Error::Closed),
        }
    }

    // Closes the socket after errors that leave it unusable.
    fn fail(&self, handle: &Handle, err: Error) -> Error {
        if matches!(err.kind(), ErrorKind::Closed | ErrorKind::Operation | ErrorKind::Security) {
            debug!(id = handle.id(), %err, "Closing connection after error");
            HandleRegistry::global().close(handle);
            self.set_state(ConnectionState::Closed);
        }
        err
    }

    fn release(&self, graceful: bool) {
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if graceful {
                HandleRegistry::global().shutdown(&handle);
            } else {
                HandleRegistry::global().close(&handle);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release(true);
    }
}

// ============================================================================
// Readiness
// ============================================================================

/// Waits until `handle` is readable or writable, or `deadline` passes.
///
/// Error and hang-up conditions count as ready; the following I/O call
/// reports them.
pub(crate) fn wait_ready(
    handle: &Handle,
    readiness: Readiness,
    deadline: Instant,
    phase: TimeoutPhase,
) -> Result<(), Error> {
    let events = match readiness {
        Readiness::Readable => libc::POLLIN,
        Readiness::Writable => libc::POLLOUT,
    };
    loop {
        let fd = handle.raw_fd();
        if fd == INVALID_FD {
            return Err(Error::Closed);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout { phase });
        }
        let slice = (deadline - now).min(POLL_SLICE);
        let millis = slice.as_millis().max(1) as libc::c_int;
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: one valid pollfd; the descriptor stays open while `handle`
        // is alive.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc > 0 {
            if pfd.revents & libc::POLLNVAL != 0 {
                return Err(Error::Closed);
            }
            return Ok(());
        }
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::PollError(err.to_string()));
            }
        }
    }
}
