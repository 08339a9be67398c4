//! Exclusive-ownership wrapper and process-wide table for socket descriptors.
//!
//! A [`Handle`] owns one socket and, optionally, the TLS session running on
//! it. Closing a handle shuts the socket down and then publishes
//! [`INVALID_FD`] as its descriptor; the descriptor itself is only released
//! when the last `Arc<Handle>` is dropped, so a thread still polling a closed
//! handle can never observe the number being reused for another socket.
//!
//! The [`HandleRegistry`] keeps a lookup-only (weak) reference to every open
//! handle, keyed by descriptor, for validity checks and bulk shutdown.

use crate::connection::TlsSession;
use crate::error::Error;

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use socket2::Socket;
use std::collections::HashMap;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tracing::{debug, trace, warn};

/// Descriptor value published by a closed or inert handle.
pub const INVALID_FD: RawFd = -1;

// ============================================================================
// Handle
// ============================================================================

/// One OS socket plus its optional TLS session.
///
/// Only the registry's close/shutdown path writes the descriptor field, and
/// it does so with a single atomic store. Pollers read it with an atomic load
/// and see either the original value or [`INVALID_FD`].
pub struct Handle {
    id: u64,
    fd: AtomicI32,
    closed: AtomicBool,
    socket: Option<Socket>,
    registration: Mutex<Option<Registry>>,
    tls: Mutex<Option<TlsSession>>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("fd", &self.raw_fd())
            .field("tls", &self.has_tls())
            .finish()
    }
}

impl Handle {
    fn new(id: u64, socket: Option<Socket>) -> Self {
        let fd = socket.as_ref().map_or(INVALID_FD, |s| s.as_raw_fd());
        Self {
            id,
            fd: AtomicI32::new(fd),
            closed: AtomicBool::new(socket.is_none()),
            socket,
            registration: Mutex::new(None),
            tls: Mutex::new(None),
        }
    }

    /// Identifier unique for the lifetime of the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current descriptor, or [`INVALID_FD`] once closed.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub fn is_valid(&self) -> bool {
        self.raw_fd() != INVALID_FD
    }

    /// Borrow the socket for I/O. Fails with [`Error::Closed`] once the
    /// handle has been closed.
    pub fn socket(&self) -> Result<&Socket, Error> {
        match &self.socket {
            Some(socket) if self.is_valid() => Ok(socket),
            _ => Err(Error::Closed),
        }
    }

    pub fn has_tls(&self) -> bool {
        lock(&self.tls).is_some()
    }

    pub(crate) fn attach_tls(&self, session: TlsSession) {
        *lock(&self.tls) = Some(session);
    }

    /// Runs `f` with the TLS session locked. Returns `None` for plain TCP.
    ///
    /// The lock must never be held across a blocking wait.
    pub(crate) fn with_tls<R>(&self, f: impl FnOnce(&mut TlsSession, &Socket) -> R) -> Option<R> {
        let socket = self.socket.as_ref()?;
        let mut guard = lock(&self.tls);
        guard.as_mut().map(|session| f(session, socket))
    }

    fn register(&self, registry: &Registry, token: Token, interest: Interest) -> Result<(), Error> {
        let fd = self.raw_fd();
        registry.register(&mut SourceFd(&fd), token, interest)?;
        *lock(&self.registration) = Some(registry.try_clone()?);
        Ok(())
    }

    // Returns false if the handle was already closed.
    fn close_inner(&self, graceful: bool) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let fd = self.raw_fd();

        if let Some(registry) = lock(&self.registration).take() {
            if let Err(err) = registry.deregister(&mut SourceFd(&fd)) {
                trace!(id = self.id, fd, ?err, "Deregister failed");
            }
        }

        if let Some(socket) = &self.socket {
            if graceful {
                if let Some(session) = lock(&self.tls).as_mut() {
                    session.send_close_notify();
                    let mut writer = socket;
                    while session.wants_write() {
                        match session.write_tls(&mut writer) {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    let _ = writer.flush();
                }
            }
            if let Err(err) = socket.shutdown(std::net::Shutdown::Both) {
                trace!(id = self.id, fd, ?err, "Socket shutdown failed");
            }
        }

        // Must be the last effect of a close.
        self.fd.store(INVALID_FD, Ordering::Release);
        true
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd != INVALID_FD {
            self.close_inner(false);
            HandleRegistry::global().forget(fd, self.id);
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Entry {
    id: u64,
    handle: Weak<Handle>,
}

/// Process-wide table of open handles.
///
/// All mutating operations and lookups take the same table-wide lock; the
/// table is not on the I/O hot path.
pub struct HandleRegistry {
    table: Mutex<HashMap<RawFd, Entry>>,
    next_id: AtomicU64,
}

static REGISTRY: OnceLock<HandleRegistry> = OnceLock::new();

impl HandleRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static HandleRegistry {
        REGISTRY.get_or_init(|| HandleRegistry {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Wraps an owned socket into a [`Handle`] and marks it close-on-exec.
    pub fn add(&self, socket: Socket) -> Arc<Handle> {
        if let Err(err) = socket.set_cloexec(true) {
            warn!(?err, "Failed to set close-on-exec");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fd = socket.as_raw_fd();
        let handle = Arc::new(Handle::new(id, Some(socket)));

        let mut table = lock(&self.table);
        if let Some(stale) = table.insert(
            fd,
            Entry {
                id,
                handle: Arc::downgrade(&handle),
            },
        ) {
            debug!(fd, old_id = stale.id, new_id = id, "Descriptor reused");
        }
        trace!(fd, id, "Handle added");
        handle
    }

    /// Takes ownership of a raw descriptor.
    ///
    /// A negative descriptor yields an inert handle whose
    /// [`Handle::is_valid`] is `false`, so callers can check validity
    /// uniformly instead of handling an error.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socket descriptor that nothing else owns.
    pub unsafe fn add_raw(&self, fd: RawFd) -> Arc<Handle> {
        if fd < 0 {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            return Arc::new(Handle::new(id, None));
        }
        self.add(Socket::from_raw_fd(fd))
    }

    /// Like [`Self::add`], and also registers the descriptor with a readiness
    /// group. The registration is removed when the handle is closed.
    pub fn add_registered(
        &self,
        socket: Socket,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> Result<Arc<Handle>, Error> {
        let handle = self.add(socket);
        if let Err(err) = handle.register(registry, token, interest) {
            self.close(&handle);
            return Err(err);
        }
        Ok(handle)
    }

    /// Closes the handle without a TLS close-notify. Idempotent.
    pub fn close(&self, handle: &Handle) {
        let fd = handle.raw_fd();
        if handle.close_inner(false) {
            debug!(fd, id = handle.id, "Handle closed");
        }
        self.forget(fd, handle.id);
    }

    /// Sends a TLS close-notify (if a session is attached), then closes the
    /// handle. Idempotent.
    pub fn shutdown(&self, handle: &Handle) {
        let fd = handle.raw_fd();
        if handle.close_inner(true) {
            debug!(fd, id = handle.id, "Handle shut down");
        }
        self.forget(fd, handle.id);
    }

    /// Whether `handle` is open and still the registered owner of its
    /// descriptor.
    pub fn is_valid(&self, handle: &Handle) -> bool {
        self.is_valid_raw(handle.raw_fd(), handle.id)
    }

    /// Whether descriptor `fd` is open and owned by the handle with `id`.
    pub fn is_valid_raw(&self, fd: RawFd, id: u64) -> bool {
        if fd == INVALID_FD {
            return false;
        }
        let weak = match lock(&self.table).get(&fd) {
            Some(entry) if entry.id == id => entry.handle.clone(),
            _ => return false,
        };
        // Upgrade outside the lock: dropping the last Arc re-enters the table.
        weak.upgrade().is_some_and(|handle| handle.is_valid())
    }

    /// Number of open handles.
    pub fn open_count(&self) -> usize {
        lock(&self.table).len()
    }

    /// Shuts down every open handle. Returns how many were shut down.
    pub fn shutdown_all(&self) -> usize {
        // Upgrade under the lock, shut down outside it: dropping the last
        // Arc re-enters the table.
        let handles: Vec<Arc<Handle>> = lock(&self.table)
            .values()
            .filter_map(|entry| entry.handle.upgrade())
            .collect();
        let count = handles.len();
        for handle in handles {
            self.shutdown(&handle);
        }
        debug!(count, "Shut down all handles");
        count
    }

    // Removes the entry only if it still belongs to handle `id`.
    fn forget(&self, fd: RawFd, id: u64) {
        if fd == INVALID_FD {
            return;
        }
        let mut table = lock(&self.table);
        if table.get(&fd).is_some_and(|entry| entry.id == id) {
            table.remove(&fd);
        }
    }
}

/// Soft limit on open descriptors for this process.
pub fn get_max_open() -> usize {
    let mut rlim = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    // SAFETY: rlim points to writable memory; getrlimit initialises it on
    // success.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlim.as_mut_ptr()) } == 0 {
        // SAFETY: getrlimit returned 0.
        let rlim = unsafe { rlim.assume_init() };
        if rlim.rlim_cur == libc::RLIM_INFINITY {
            return usize::MAX;
        }
        return rlim.rlim_cur as usize;
    }
    1024
}

// Poisoning only happens if a holder panicked; the data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
