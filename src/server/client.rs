use super::Shared;
use crate::connection::{Connection, PeerCertificate};
use crate::error::Error;
use crate::handle::lock;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, trace, warn};

/// Arguments for the closed callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CloseReason {
    pub(crate) code: Option<i32>,
    pub(crate) message: Option<String>,
}

impl CloseReason {
    pub(crate) fn from_error(err: &Error) -> Self {
        if err.is_closed() {
            return Self::default();
        }
        Self {
            code: err.code(),
            message: Some(err.to_string()),
        }
    }

    pub(crate) fn with_code(code: i32, message: &str) -> Self {
        Self {
            code: Some(code),
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Backlog {
    packets: VecDeque<Vec<u8>>,
    // Set while a drain task is queued or running.
    busy: bool,
    // Pending closed callback, fired once the drain task finishes.
    close: Option<CloseReason>,
}

/// One accepted connection.
pub(crate) struct ClientRecord {
    pub(crate) id: i32,
    pub(crate) shard: usize,
    pub(crate) conn: Connection,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) read_buf: Mutex<Vec<u8>>,
    backlog: Mutex<Backlog>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("id", &self.id)
            .field("shard", &self.shard)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientRecord {
    pub(crate) fn new(id: i32, shard: usize, conn: Connection, read_buffer_size: usize) -> Self {
        let peer = conn.peer_addr();
        Self {
            id,
            shard,
            conn,
            peer,
            read_buf: Mutex::new(vec![0; read_buffer_size]),
            backlog: Mutex::new(Backlog::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_valid(&self) -> bool {
        !self.is_closed() && self.conn.handle().is_some_and(|h| h.is_valid())
    }

    pub(crate) fn peer_certificate(&self) -> Option<PeerCertificate> {
        self.conn.peer_certificate()
    }

    pub(crate) fn backlog_len(&self) -> usize {
        lock(&self.backlog).packets.len()
    }

    /// Queues a packet. Returns `true` if the caller must schedule a drain
    /// task, which is the case only when none is in flight.
    pub(crate) fn push(&self, packet: Vec<u8>, cap: usize) -> Result<bool, Error> {
        let mut backlog = lock(&self.backlog);
        if backlog.packets.len() >= cap {
            return Err(Error::BacklogFull { id: self.id, cap });
        }
        backlog.packets.push_back(packet);
        if backlog.busy {
            return Ok(false);
        }
        backlog.busy = true;
        Ok(true)
    }

    /// Claims the drain slot if there is queued work and no drain in flight.
    pub(crate) fn claim_pending(&self) -> bool {
        let mut backlog = lock(&self.backlog);
        if backlog.busy || backlog.packets.is_empty() {
            return false;
        }
        backlog.busy = true;
        true
    }

    fn release_claim(&self) -> Option<CloseReason> {
        let mut backlog = lock(&self.backlog);
        backlog.busy = false;
        backlog.close.take()
    }

    /// Marks the record closed. Returns the closed-callback arguments if the
    /// callback must fire now, or `None` if it already fired or the drain task
    /// will fire it. Only the first call has any effect.
    pub(crate) fn mark_closed(&self, reason: CloseReason, discard: bool) -> Option<CloseReason> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let mut backlog = lock(&self.backlog);
        if discard {
            backlog.packets.clear();
        }
        if backlog.busy {
            backlog.close = Some(reason);
            return None;
        }
        backlog.packets.clear();
        Some(reason)
    }
}

/// Queues a drain task for `record`. The caller must hold the drain slot.
pub(crate) fn schedule_drain(shared: &Arc<Shared>, record: &Arc<ClientRecord>) {
    let task_shared = shared.clone();
    let task_record = record.clone();
    let task = Box::new(move || drain(&task_shared, &task_record));
    if let Err(err) = shared.workers.enqueue(task) {
        warn!(id = record.id, %err, "Failed to queue drain task");
        // Give the slot back; the acceptor retries on its next pass. If the
        // client was closed in the meantime, the callback is ours to fire.
        if let Some(reason) = record.release_claim() {
            shared.notify_closed(record.id, reason);
        }
    }
}

// Delivers up to one batch, then either hands the slot back or requeues.
fn drain(shared: &Arc<Shared>, record: &Arc<ClientRecord>) {
    let batch: Vec<Vec<u8>> = {
        let mut backlog = lock(&record.backlog);
        let n = backlog.packets.len().min(shared.config.drain_batch);
        backlog.packets.drain(..n).collect()
    };
    trace!(id = record.id, count = batch.len(), "Draining backlog");

    for packet in &batch {
        let delivered = catch_unwind(AssertUnwindSafe(|| {
            shared.handler.on_packet_received(record.id, packet)
        }));
        if delivered.is_err() {
            error!(id = record.id, "Packet handler panicked");
        }
    }

    let close = {
        let mut backlog = lock(&record.backlog);
        if !backlog.packets.is_empty() {
            drop(backlog);
            schedule_drain(shared, record);
            return;
        }
        backlog.busy = false;
        backlog.close.take()
    };
    if let Some(reason) = close {
        debug!(id = record.id, "Backlog drained after close");
        shared.notify_closed(record.id, reason);
    }
}
