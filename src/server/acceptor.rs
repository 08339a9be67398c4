use super::client::{schedule_drain, ClientRecord, CloseReason};
use super::Shared;
use crate::connection::{apply_keepalive, Connection};
use crate::error::{Error, CODE_SERVER_STOPPING};
use crate::handle::{lock, Handle, HandleRegistry};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{SockAddr, Socket};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Shutdown};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_CAPACITY: usize = 1024;

/// One acceptor thread: the listening socket plus a shard of clients.
pub(crate) struct Acceptor {
    index: usize,
    shared: Arc<Shared>,
    poll: Poll,
    // Registered listener and the descriptor it was registered under.
    listener: Option<(Arc<Handle>, RawFd)>,
    shard: HashMap<Token, Arc<ClientRecord>>,
    accept_pending: bool,
    last_gc: Instant,
    next_rebind: Instant,
}

impl Acceptor {
    pub(crate) fn new(index: usize, shared: Arc<Shared>) -> Result<Self, Error> {
        let poll = Poll::new().map_err(|e| Error::PollError(e.to_string()))?;
        Ok(Self {
            index,
            shared,
            poll,
            listener: None,
            shard: HashMap::new(),
            accept_pending: false,
            last_gc: Instant::now(),
            next_rebind: Instant::now(),
        })
    }

    pub(crate) fn run(mut self) {
        info!(index = self.index, "Acceptor started");
        let mut events = Events::with_capacity(POLL_CAPACITY);

        while !self.shared.is_stopping() {
            self.refresh_listener();
            self.schedule_pending();

            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(index = self.index, ?err, "Poll failed, acceptor exiting");
                break;
            }

            // mio reports errors alongside readable bits; the read itself
            // surfaces the failure.
            let mut accept = std::mem::take(&mut self.accept_pending);
            let mut ready = Vec::new();
            for event in events.iter() {
                match event.token() {
                    LISTENER => accept = true,
                    token => ready.push(token),
                }
            }

            if accept {
                self.accept_connections();
            }
            for token in ready {
                if let Some(record) = self.shard.get(&token).cloned() {
                    self.read_client(&record);
                }
            }

            self.maybe_collect_garbage();
        }

        self.shutdown();
    }
}

// ============================================================================
// Listener
// ============================================================================

impl Acceptor {
    fn refresh_listener(&mut self) {
        let current = self.shared.current_listener();
        if let (Some((mine, _)), Some(current)) = (&self.listener, &current) {
            if mine.id() == current.id() && mine.is_valid() {
                return;
            }
        }
        self.drop_listener();

        match current.filter(|handle| handle.is_valid()) {
            Some(handle) => {
                let fd = handle.raw_fd();
                match self
                    .poll
                    .registry()
                    .register(&mut SourceFd(&fd), LISTENER, Interest::READABLE)
                {
                    Ok(()) => {
                        trace!(index = self.index, fd, "Listener registered");
                        self.listener = Some((handle, fd));
                        // Connections may have queued while unregistered.
                        self.accept_pending = true;
                    }
                    Err(err) => warn!(index = self.index, ?err, "Failed to register listener"),
                }
            }
            None if self.index == 0 && Instant::now() >= self.next_rebind => {
                self.next_rebind = Instant::now() + self.shared.config.rebind_delay;
                if let Err(err) = self.shared.rebind() {
                    warn!(%err, "Rebinding listener failed");
                }
            }
            None => {}
        }
    }

    fn drop_listener(&mut self) {
        if let Some((handle, fd)) = self.listener.take() {
            // The descriptor is still open: `handle` keeps it alive.
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                trace!(index = self.index, ?err, "Deregistering listener failed");
            }
            drop(handle);
        }
    }

    fn accept_connections(&mut self) {
        let Some((listener, _)) = self.listener.clone() else {
            return;
        };
        loop {
            let Ok(socket) = listener.socket() else {
                return;
            };
            match socket.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => match accept_error(err) {
                        err @ Error::DescriptorsExhausted => {
                            warn!(%err, "Deferring accept");
                            self.accept_pending = true;
                            break;
                        }
                        err => {
                            error!(%err, "Error accepting connection, closing listener");
                            HandleRegistry::global().close(&listener);
                            break;
                        }
                    },
                },
            }
        }
    }

    fn admit(&mut self, socket: Socket, addr: SockAddr) {
        let peer = addr.as_socket();
        let fd = socket.as_raw_fd();
        let shared = self.shared.clone();
        let config = &shared.config;

        if let Err(err) = check_descriptor(fd, shared.max_open) {
            warn!(fd, ?peer, %err, "Rejecting connection");
            reject(socket);
            return;
        }
        if check_capacity(shared.client_count(), config.max_connections).is_err() {
            shared.collect_garbage();
            self.collect_shard();
            if let Err(err) = check_capacity(shared.client_count(), config.max_connections) {
                warn!(?peer, %err, "Rejecting connection");
                reject(socket);
                return;
            }
        }

        if let Err(err) = socket.set_nonblocking(true) {
            warn!(?err, ?peer, "Failed to configure accepted socket");
            reject(socket);
            return;
        }
        if let Err(err) = socket.set_nodelay(true) {
            debug!(?err, "Failed to disable Nagle");
        }
        if let Err(err) = apply_keepalive(&socket, &config.keepalive) {
            debug!(%err, "Failed to set keepalive");
        }

        let id = shared.allocate_id();
        let token = Token(id as usize);
        let handle = match HandleRegistry::global().add_registered(
            socket,
            self.poll.registry(),
            token,
            Interest::READABLE,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(%err, ?peer, "Failed to register accepted socket");
                return;
            }
        };

        let conn = Connection::accepted(handle, config.read_timeout, config.write_timeout);
        if let Some(credentials) = &shared.credentials {
            let snapshot = credentials.snapshot();
            if let Err(err) = conn.server_handshake(&snapshot, config.handshake_timeout) {
                warn!(?peer, %err, "TLS handshake failed");
                conn.close();
                return;
            }
        }

        let record = Arc::new(ClientRecord::new(
            id,
            self.index,
            conn,
            config.read_buffer_size,
        ));
        shared.insert(record.clone());
        self.shard.insert(token, record.clone());

        let (ip, port) = peer.map_or((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), |p| {
            (p.ip(), p.port())
        });
        info!(id, index = self.index, %ip, port, "Client connected");
        shared.handler.on_new_connection(id, ip, port);

        // Data may have arrived together with the handshake.
        self.read_client(&record);
    }
}

fn accept_error(err: std::io::Error) -> Error {
    match err.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) => Error::DescriptorsExhausted,
        _ => Error::Io(err),
    }
}

// Descriptors past the process limit cannot be tracked.
fn check_descriptor(fd: RawFd, max_open: usize) -> Result<(), Error> {
    if fd < 0 || fd as usize >= max_open {
        return Err(Error::DescriptorsExhausted);
    }
    Ok(())
}

fn check_capacity(clients: usize, max: usize) -> Result<(), Error> {
    if clients >= max {
        return Err(Error::ConnectionLimit { max });
    }
    Ok(())
}

fn reject(socket: Socket) {
    if let Err(err) = socket.shutdown(Shutdown::Both) {
        trace!(?err, "Shutdown of rejected socket failed");
    }
}

// ============================================================================
// Clients
// ============================================================================

impl Acceptor {
    // Reads until the socket would block, queueing one packet per read.
    fn read_client(&mut self, record: &Arc<ClientRecord>) {
        if record.is_closed() {
            self.shard.remove(&Token(record.id as usize));
            return;
        }
        let cap = self.shared.config.max_backlog;
        let failure = {
            let mut buf = lock(&record.read_buf);
            loop {
                match record.conn.try_read(&mut buf[..]) {
                    Ok(Some(n)) => {
                        trace!(id = record.id, len = n, "Received data");
                        self.shared.received.record(1);
                        match record.push(buf[..n].to_vec(), cap) {
                            Ok(true) => schedule_drain(&self.shared, record),
                            Ok(false) => {}
                            Err(err) => {
                                warn!(id = record.id, %err, "Backlog overflow, closing client");
                                break Some((err, true));
                            }
                        }
                    }
                    Ok(None) => break None,
                    Err(err) => {
                        if err.is_closed() {
                            debug!(id = record.id, "Client closed the connection");
                        } else {
                            warn!(id = record.id, %err, "Error reading from client");
                        }
                        break Some((err, false));
                    }
                }
            }
        };

        if let Some((err, discard)) = failure {
            self.shard.remove(&Token(record.id as usize));
            self.shared
                .teardown(record, CloseReason::from_error(&err), discard);
        }
    }

    // Queues drain tasks that could not be queued earlier.
    fn schedule_pending(&self) {
        for record in self.shard.values() {
            if record.claim_pending() {
                schedule_drain(&self.shared, record);
            }
        }
    }

    fn maybe_collect_garbage(&mut self) {
        let now = Instant::now();
        let at_capacity = self.shared.client_count() >= self.shared.config.max_connections;
        if at_capacity || now.duration_since(self.last_gc) >= self.shared.config.gc_interval {
            self.shared.collect_garbage();
            self.collect_shard();
            self.last_gc = now;
        }
    }

    fn collect_shard(&mut self) {
        let before = self.shard.len();
        self.shard.retain(|_, record| !record.is_closed());
        let removed = before - self.shard.len();
        if removed > 0 {
            trace!(index = self.index, removed, "Pruned shard");
        }
    }

    fn shutdown(&mut self) {
        let records: Vec<_> = self.shard.drain().map(|(_, record)| record).collect();
        for record in &records {
            self.shared.teardown(
                record,
                CloseReason::with_code(CODE_SERVER_STOPPING, "server stopping"),
                false,
            );
        }
        self.drop_listener();
        info!(index = self.index, closed = records.len(), "Acceptor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind as EngineErrorKind;

    #[test]
    fn admission_errors() {
        assert!(check_descriptor(3, 1024).is_ok());
        assert!(matches!(
            check_descriptor(1024, 1024),
            Err(Error::DescriptorsExhausted)
        ));
        assert!(check_descriptor(-1, 1024).is_err());

        assert!(check_capacity(1, 2).is_ok());
        let err = check_capacity(2, 2).unwrap_err();
        assert!(matches!(err, Error::ConnectionLimit { max: 2 }));
        assert_eq!(err.kind(), EngineErrorKind::ResourceExhausted);
    }

    #[test]
    fn accept_errors_are_classified() {
        let exhausted = accept_error(std::io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(exhausted, Error::DescriptorsExhausted));
        assert!(matches!(
            accept_error(std::io::Error::from_raw_os_error(libc::ENFILE)),
            Error::DescriptorsExhausted
        ));
        let other = accept_error(std::io::Error::from_raw_os_error(libc::EINVAL));
        assert_eq!(other.kind(), EngineErrorKind::Operation);
    }
}
