//! sockengine - threaded TCP/TLS socket engine
//!
//! sockengine owns OS sockets and TLS sessions for the protocol layers built
//! on top of it. It provides a blocking [`Connection`] for clients and a
//! multi-threaded [`Server`] that accepts connections, queues received bytes
//! per client, and delivers them in order to a [`ServerHandler`] on a worker
//! pool.
//!
//! Bytes are transported as-is; framing is left to the caller.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod handle;
pub mod server;
pub mod worker;

pub use config::{ClientConfig, CredentialSetConfig, KeepaliveConfig, ServerConfig};
pub use connection::{Connection, ConnectionState, PeerCertificate, MAX_WRITE_SIZE};
pub use credentials::{
    CredentialSet, CredentialSnapshot, CredentialSource, CredentialStore, DhParams, Identity, Mode,
};
pub use error::{Error, ErrorKind, TimeoutPhase, CODE_BACKLOG_FULL, CODE_SERVER_STOPPING};
pub use handle::{get_max_open, Handle, HandleRegistry, INVALID_FD};
pub use server::{Server, ServerHandler, Throughput};
pub use worker::{Task, ThreadPool, WorkerQueue};

/// Convenient re-exports of commonly used types.
pub mod prelude {
    pub use crate::config::{ClientConfig, ServerConfig};
    pub use crate::connection::{Connection, PeerCertificate};
    pub use crate::credentials::{CredentialSet, CredentialSource};
    pub use crate::error::{Error, ErrorKind};
    pub use crate::server::{Server, ServerHandler};
}
