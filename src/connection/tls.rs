use super::{wait_ready, Readiness};
use crate::error::{Error, TimeoutPhase};
use crate::handle::Handle;

use rustls::pki_types::CertificateDer;
use std::io::{ErrorKind, Read, Write};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// TLS state attached to a [`Handle`].
pub(crate) enum TlsSession {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl TlsSession {
    pub(crate) fn read_tls(&mut self, rd: &mut dyn Read) -> Result<usize, std::io::Error> {
        match self {
            TlsSession::Server(conn) => conn.read_tls(rd),
            TlsSession::Client(conn) => conn.read_tls(rd),
        }
    }

    pub(crate) fn write_tls(&mut self, wr: &mut dyn Write) -> Result<usize, std::io::Error> {
        match self {
            TlsSession::Server(conn) => conn.write_tls(wr),
            TlsSession::Client(conn) => conn.write_tls(wr),
        }
    }

    pub(crate) fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Server(conn) => conn.process_new_packets(),
            TlsSession::Client(conn) => conn.process_new_packets(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.wants_write(),
            TlsSession::Client(conn) => conn.wants_write(),
        }
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(conn) => conn.is_handshaking(),
            TlsSession::Client(conn) => conn.is_handshaking(),
        }
    }

    pub(crate) fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(conn) => conn.writer(),
            TlsSession::Client(conn) => conn.writer(),
        }
    }

    pub(crate) fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(conn) => conn.reader(),
            TlsSession::Client(conn) => conn.reader(),
        }
    }

    pub(crate) fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(conn) => conn.send_close_notify(),
            TlsSession::Client(conn) => conn.send_close_notify(),
        }
    }

    pub(crate) fn peer_leaf(&self) -> Option<CertificateDer<'static>> {
        let chain = match self {
            TlsSession::Server(conn) => conn.peer_certificates(),
            TlsSession::Client(conn) => conn.peer_certificates(),
        };
        chain.and_then(|certs| certs.first()).map(|c| c.clone().into_owned())
    }

    /// SNI name the client asked for (server side only).
    pub(crate) fn requested_server_name(&self) -> Option<String> {
        match self {
            TlsSession::Server(conn) => conn.server_name().map(str::to_string),
            TlsSession::Client(_) => None,
        }
    }

    /// Whether decrypted bytes are waiting to be read.
    pub(crate) fn has_buffered_plaintext(&mut self) -> bool {
        self.process_new_packets()
            .map(|state| state.plaintext_bytes_to_read() > 0)
            .unwrap_or(false)
    }

    // Flushes queued records. `Ok(false)` means the socket would block.
    pub(crate) fn flush(&mut self, mut socket: &socket2::Socket) -> Result<bool, Error> {
        while self.wants_write() {
            match self.write_tls(&mut socket) {
                Ok(0) => return Err(Error::Closed),
                Ok(sz) => trace!(len = sz, "Wrote encrypted data to socket"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io(err)),
            }
        }
        Ok(true)
    }
}

enum Step {
    Done,
    Again,
    Wait(Readiness),
}

/// Drives the attached session until the handshake completes or `deadline`
/// passes. The session lock is released before every wait.
pub(crate) fn complete_handshake(handle: &Handle, deadline: Instant) -> Result<(), Error> {
    loop {
        let step = handle
            .with_tls(|session, mut socket| -> Result<Step, Error> {
                if !session.flush(socket)? {
                    return Ok(Step::Wait(Readiness::Writable));
                }
                if !session.is_handshaking() {
                    return Ok(Step::Done);
                }
                match session.read_tls(&mut socket) {
                    Ok(0) => Err(Error::TlsHandshake(
                        "peer closed the connection during the handshake".into(),
                    )),
                    Ok(sz) => {
                        trace!(len = sz, "Read handshake data from socket");
                        if let Err(err) = session.process_new_packets() {
                            // Best effort: deliver the alert rustls queued.
                            let _ = session.flush(socket);
                            return Err(map_tls(err));
                        }
                        Ok(Step::Again)
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => {
                        Ok(Step::Wait(Readiness::Readable))
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => Ok(Step::Again),
                    Err(err) => Err(map_io(err)),
                }
            })
            .ok_or(Error::InvalidState("no TLS session attached"))??;

        match step {
            Step::Done => {
                debug!(id = handle.id(), "TLS handshake completed");
                return Ok(());
            }
            Step::Again => {}
            Step::Wait(readiness) => {
                wait_ready(handle, readiness, deadline, TimeoutPhase::Handshake)?
            }
        }
    }
}

pub(crate) fn map_tls(err: rustls::Error) -> Error {
    match err {
        rustls::Error::InvalidCertificate(cert_err) => {
            warn!(?cert_err, "Peer certificate rejected");
            Error::TlsVerification(format!("{cert_err:?}"))
        }
        rustls::Error::AlertReceived(alert) => {
            Error::TlsHandshake(format!("peer sent alert {alert:?}"))
        }
        other => Error::TlsHandshake(other.to_string()),
    }
}

pub(crate) fn map_io(err: std::io::Error) -> Error {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => Error::Closed,
        _ => Error::Io(err),
    }
}
