//! Multi-threaded TCP/TLS server.
//!
//! Each acceptor thread owns a readiness poll holding the shared listening
//! socket and its own shard of clients. Received data is queued per client
//! and handed to [`ServerHandler::on_packet_received`] on the worker queue,
//! with at most one drain task per client in flight, so packets of one
//! client arrive in order and never concurrently.
//!
//! # Example
//!
//! ```no_run
//! use sockengine::{Server, ServerConfig, ServerHandler};
//! use std::net::IpAddr;
//! use std::sync::Arc;
//!
//! struct Echo(std::sync::OnceLock<Arc<Server>>);
//!
//! impl ServerHandler for Echo {
//!     fn on_packet_received(&self, client_id: i32, packet: &[u8]) {
//!         if let Some(server) = self.0.get() {
//!             let _ = server.send_to_client(client_id, packet, false);
//!         }
//!     }
//! }
//!
//! let handler = Arc::new(Echo(Default::default()));
//! let server = Arc::new(Server::new(ServerConfig::default(), handler.clone())?);
//! let _ = handler.0.set(server.clone());
//! server.start()?;
//! # Ok::<(), sockengine::Error>(())
//! ```

mod acceptor;
mod client;
mod throughput;

pub use throughput::Throughput;

use crate::config::ServerConfig;
use crate::connection::PeerCertificate;
use crate::credentials::{CredentialSet, CredentialStore, Mode};
use crate::error::{Error, ErrorKind};
use crate::handle::{get_max_open, lock, Handle, HandleRegistry};
use crate::worker::{ThreadPool, WorkerQueue};
use acceptor::Acceptor;
use client::{ClientRecord, CloseReason};

use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn};

const CLIENT_ID_RANGE_START: i32 = 1000;

/// Callbacks invoked by the server.
///
/// `on_packet_received` runs on the worker queue; the other two run on
/// whichever thread detected the event. For one client, callbacks never
/// overlap and `on_connection_closed` is the last one, invoked exactly once.
pub trait ServerHandler: Send + Sync + 'static {
    /// A client was accepted (and, with TLS, completed the handshake).
    fn on_new_connection(&self, client_id: i32, peer_address: IpAddr, peer_port: u16) {
        let _ = (client_id, peer_address, peer_port);
    }

    /// A client went away. `error_code` carries the OS error or one of the
    /// `CODE_*` constants; both are `None` for an orderly close.
    fn on_connection_closed(
        &self,
        client_id: i32,
        error_code: Option<i32>,
        error_message: Option<&str>,
    ) {
        let _ = (client_id, error_code, error_message);
    }

    /// One read's worth of bytes from a client.
    fn on_packet_received(&self, client_id: i32, packet: &[u8]);
}

// ============================================================================
// Shared State
// ============================================================================

pub(crate) struct Shared {
    pub(crate) config: ServerConfig,
    pub(crate) handler: Arc<dyn ServerHandler>,
    pub(crate) workers: Arc<dyn WorkerQueue>,
    pub(crate) credentials: Option<CredentialStore>,
    pub(crate) max_open: usize,
    pub(crate) received: Throughput,
    pub(crate) sent: Throughput,
    clients: Mutex<HashMap<i32, Arc<ClientRecord>>>,
    next_id: Mutex<i32>,
    listener: Mutex<Option<Arc<Handle>>>,
    bound: Mutex<Option<SocketAddr>>,
    stopping: AtomicBool,
}

impl Shared {
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn current_listener(&self) -> Option<Arc<Handle>> {
        lock(&self.listener).clone()
    }

    pub(crate) fn client(&self, id: i32) -> Option<Arc<ClientRecord>> {
        lock(&self.clients).get(&id).cloned()
    }

    pub(crate) fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    pub(crate) fn insert(&self, record: Arc<ClientRecord>) {
        lock(&self.clients).insert(record.id, record);
    }

    // Next id not used by an open client.
    pub(crate) fn allocate_id(&self) -> i32 {
        let mut next_id = lock(&self.next_id);
        loop {
            let id = *next_id;
            *next_id = next_id.checked_add(1).unwrap_or(CLIENT_ID_RANGE_START);
            if !lock(&self.clients).contains_key(&id) {
                return id;
            }
        }
    }

    /// Closes the client, removes it and fires the closed callback (now or
    /// after its in-flight drain task). Safe to call more than once.
    pub(crate) fn teardown(&self, record: &Arc<ClientRecord>, reason: CloseReason, discard: bool) {
        let fire = record.mark_closed(reason, discard);
        record.conn.close();
        {
            let mut clients = lock(&self.clients);
            if clients
                .get(&record.id)
                .is_some_and(|current| Arc::ptr_eq(current, record))
            {
                clients.remove(&record.id);
            }
        }
        if let Some(reason) = fire {
            self.notify_closed(record.id, reason);
        }
    }

    pub(crate) fn notify_closed(&self, id: i32, reason: CloseReason) {
        info!(id, code = ?reason.code, message = ?reason.message, "Client disconnected");
        self.handler
            .on_connection_closed(id, reason.code, reason.message.as_deref());
    }

    /// Tears down every client whose handle is no longer valid.
    pub(crate) fn collect_garbage(&self) -> usize {
        let stale: Vec<_> = lock(&self.clients)
            .values()
            .filter(|record| !record.is_valid())
            .cloned()
            .collect();
        for record in &stale {
            self.teardown(record, CloseReason::default(), false);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "Collected stale clients");
        }
        stale.len()
    }

    fn open_listener(&self, addr: SocketAddr) -> Result<(Arc<Handle>, SocketAddr), Error> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            if let Err(err) = socket.set_only_v6(false) {
                debug!(?err, "Could not enable dual-stack listening");
            }
        }
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog_size)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or(Error::InvalidState("listener has no IP address"))?;
        Ok((HandleRegistry::global().add(socket), local_addr))
    }

    /// Replaces an invalid listener, binding to the previously bound address.
    pub(crate) fn rebind(&self) -> Result<(), Error> {
        let addr = lock(&self.bound).ok_or(Error::InvalidState("server was never bound"))?;
        // The old socket must be gone before its port can be bound again.
        let stale = lock(&self.listener).take();
        drop(stale);
        let (handle, local_addr) = self.open_listener(addr)?;
        info!(%local_addr, "Listener rebound");
        *lock(&self.listener) = Some(handle);
        Ok(())
    }
}

// ============================================================================
// Server
// ============================================================================

/// TCP/TLS server.
pub struct Server {
    shared: Arc<Shared>,
    pool: Option<Arc<ThreadPool>>,
    acceptors: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bound", &self.bound_address())
            .field("clients", &self.client_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Server {
    /// Creates a server with its own pool of `processing_threads` workers.
    pub fn new(config: ServerConfig, handler: Arc<dyn ServerHandler>) -> Result<Self, Error> {
        let pool = Arc::new(ThreadPool::new(
            config.processing_threads,
            "sockengine-worker",
        )?);
        let mut server = Self::with_worker_queue(config, handler, pool.clone())?;
        server.pool = Some(pool);
        Ok(server)
    }

    /// Creates a server that drains client backlogs on `workers`.
    pub fn with_worker_queue(
        config: ServerConfig,
        handler: Arc<dyn ServerHandler>,
        workers: Arc<dyn WorkerQueue>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let credentials = if config.tls {
            Some(CredentialStore::configure(
                config.credentials.clone(),
                Mode::Server {
                    require_client_cert: config.require_client_cert,
                },
                config.dh_params.clone(),
            )?)
        } else {
            None
        };

        let max_open = get_max_open();
        debug!(max_open, "Descriptor limit");

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                handler,
                workers,
                credentials,
                max_open,
                received: Throughput::new(),
                sent: Throughput::new(),
                clients: Mutex::new(HashMap::new()),
                next_id: Mutex::new(CLIENT_ID_RANGE_START),
                listener: Mutex::new(None),
                bound: Mutex::new(None),
                stopping: AtomicBool::new(false),
            }),
            pool: None,
            acceptors: Mutex::new(Vec::new()),
        })
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

impl Server {
    /// Binds the listening socket. Calling it again while bound returns the
    /// existing address.
    #[instrument(skip(self))]
    pub fn bind(&self) -> Result<SocketAddr, Error> {
        if let Some(addr) = self.bound_address() {
            return Ok(addr);
        }
        let config = &self.shared.config;
        let requested = (config.listen_address.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|_| {
                Error::InvalidAddress(format!("{}:{}", config.listen_address, config.port))
            })?
            .next()
            .ok_or_else(|| {
                Error::InvalidAddress(format!("{}:{}", config.listen_address, config.port))
            })?;

        let (handle, local_addr) = self.shared.open_listener(requested)?;
        info!(%local_addr, tls = config.tls, "Listening for connections");
        *lock(&self.shared.listener) = Some(handle);
        *lock(&self.shared.bound) = Some(local_addr);
        Ok(local_addr)
    }

    /// Binds (if needed) and starts the acceptor threads.
    pub fn start(&self) -> Result<(), Error> {
        self.bind()?;
        self.start_on_bound_socket()
    }

    /// Starts the acceptor threads on the socket bound by [`Server::bind`].
    ///
    /// Splitting bind and start lets a process bind a privileged port and
    /// drop privileges before serving.
    #[instrument(skip(self))]
    pub fn start_on_bound_socket(&self) -> Result<(), Error> {
        let mut acceptors = lock(&self.acceptors);
        if !acceptors.is_empty() {
            return Err(Error::InvalidState("server is already running"));
        }
        if self.shared.current_listener().is_none() {
            return Err(Error::InvalidState("server is not bound"));
        }
        self.shared.stopping.store(false, Ordering::Release);

        for index in 0..self.shared.config.acceptor_threads {
            let spawned = Acceptor::new(index, self.shared.clone()).and_then(|acceptor| {
                thread::Builder::new()
                    .name(format!("sockengine-acceptor-{index}"))
                    .spawn(move || acceptor.run())
                    .map_err(Error::from)
            });
            match spawned {
                Ok(thread) => acceptors.push(thread),
                Err(err) => {
                    error!(index, %err, "Failed to start acceptor");
                    self.shared.stopping.store(true, Ordering::Release);
                    for thread in acceptors.drain(..) {
                        let _ = thread.join();
                    }
                    return Err(err);
                }
            }
        }
        info!(
            acceptors = acceptors.len(),
            max_connections = self.shared.config.max_connections,
            "Server started"
        );
        Ok(())
    }

    /// Signals the acceptor threads to stop and returns immediately.
    pub fn stop(&self) {
        if !self.shared.stopping.swap(true, Ordering::AcqRel) {
            info!("Server stopping");
        }
    }

    /// Blocks until every acceptor thread has exited, then closes the
    /// listening socket. Clients are closed by their acceptor on the way out.
    pub fn wait_until_stopped(&self) {
        let threads: Vec<_> = lock(&self.acceptors).drain(..).collect();
        for thread in threads {
            if thread.join().is_err() {
                error!("Acceptor thread panicked");
            }
        }
        if !self.shared.is_stopping() {
            return;
        }
        if let Some(listener) = lock(&self.shared.listener).take() {
            HandleRegistry::global().close(&listener);
        }
        lock(&self.shared.bound).take();
        self.shared.collect_garbage();
        info!("Server stopped");
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.acceptors).is_empty() && !self.shared.is_stopping()
    }

    /// Re-reads all credential sources. Handshakes already in progress keep
    /// the credentials they started with.
    pub fn reload_certificates(&self) -> Result<(), Error> {
        self.credentials()
            .ok_or(Error::InvalidState("TLS is not enabled"))?
            .reload()
    }

    /// Replaces the credential sets, as [`Server::reload_certificates`] does
    /// for the existing ones.
    pub fn replace_certificates(&self, sets: Vec<(String, CredentialSet)>) -> Result<(), Error> {
        self.credentials()
            .ok_or(Error::InvalidState("TLS is not enabled"))?
            .replace(sets)
    }

    pub fn credentials(&self) -> Option<&CredentialStore> {
        self.shared.credentials.as_ref()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
        self.wait_until_stopped();
        if let Some(pool) = &self.pool {
            pool.shutdown();
        }
    }
}

// ============================================================================
// Data Operations
// ============================================================================

impl Server {
    /// Writes `data` to a client, then optionally closes it.
    ///
    /// An unknown `id` is not an error: the client may have gone away just
    /// before the call. I/O failures close the client and are returned.
    pub fn send_to_client(&self, id: i32, data: &[u8], close_after: bool) -> Result<(), Error> {
        let Some(record) = self.shared.client(id) else {
            trace!(id, "Ignoring send to unknown client");
            return Ok(());
        };
        if let Err(err) = record.conn.write(data) {
            if !matches!(err.kind(), ErrorKind::Configuration | ErrorKind::Timeout) {
                self.shared
                    .teardown(&record, CloseReason::from_error(&err), false);
            }
            return Err(err);
        }
        self.shared.sent.record(1);
        trace!(id, len = data.len(), "Sent data");
        if close_after {
            self.shared.teardown(&record, CloseReason::default(), false);
        }
        Ok(())
    }

    /// Sends `data` to every client. Returns how many sends succeeded.
    pub fn broadcast(&self, data: &[u8]) -> usize {
        let ids = self.client_ids();
        debug!(count = ids.len(), len = data.len(), "Broadcasting data");
        ids.into_iter()
            .filter(|&id| match self.send_to_client(id, data, false) {
                Ok(()) => true,
                Err(err) => {
                    warn!(id, %err, "Broadcast to client failed");
                    false
                }
            })
            .count()
    }

    /// Closes one client. Returns `false` if it was not connected.
    pub fn close_client(&self, id: i32) -> bool {
        match self.shared.client(id) {
            Some(record) => {
                debug!(id, shard = record.shard, "Closing client on request");
                self.shared.teardown(&record, CloseReason::default(), false);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

impl Server {
    pub fn client_count(&self) -> usize {
        self.shared.client_count()
    }

    pub fn client_ids(&self) -> Vec<i32> {
        let mut ids: Vec<_> = lock(&self.shared.clients).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn client_address(&self, id: i32) -> Option<SocketAddr> {
        self.shared.client(id).and_then(|record| record.peer)
    }

    /// Certificate the client presented during the handshake.
    pub fn client_certificate(&self, id: i32) -> Option<PeerCertificate> {
        self.shared
            .client(id)
            .and_then(|record| record.peer_certificate())
    }

    pub fn client_cert_dn(&self, id: i32) -> Option<String> {
        self.client_certificate(id).map(|cert| cert.dn)
    }

    pub fn client_cert_serial(&self, id: i32) -> Option<String> {
        self.client_certificate(id).map(|cert| cert.serial)
    }

    /// `notAfter` of the client certificate, in seconds since the epoch.
    pub fn client_cert_expiration(&self, id: i32) -> Option<i64> {
        self.client_certificate(id).map(|cert| cert.expiration)
    }

    /// Address the listener is bound to; `None` before [`Server::bind`].
    pub fn bound_address(&self) -> Option<SocketAddr> {
        *lock(&self.shared.bound)
    }

    pub fn received_packets_per_minute(&self) -> f64 {
        self.shared.received.per_minute()
    }

    pub fn sent_packets_per_minute(&self) -> f64 {
        self.shared.sent.per_minute()
    }

    pub fn worker_queue_depth(&self) -> usize {
        self.shared.workers.depth()
    }

    /// Index of the acceptor thread that owns the client.
    pub fn client_shard(&self, id: i32) -> Option<usize> {
        self.shared.client(id).map(|record| record.shard)
    }

    /// Packets queued for a client and not yet delivered.
    pub fn client_backlog_len(&self, id: i32) -> usize {
        self.shared
            .client(id)
            .map_or(0, |record| record.backlog_len())
    }
}
