use thiserror::Error;

/// Diagnostic code passed to the closed callback when a client's backlog
/// overflowed.
pub const CODE_BACKLOG_FULL: i32 = -1000;

/// Diagnostic code passed to the closed callback when a client was torn down
/// because the server was stopping.
pub const CODE_SERVER_STOPPING: i32 = -1001;

/// The error type for sockengine operations.
///
/// Every fallible operation of the engine returns this type. Use
/// [`Error::kind()`] to branch on the broad category (timeout, closed,
/// security, ...) instead of matching individual variants.
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    /// Configuration file parsing or key lookup failed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A required parameter was missing or out of range.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The payload passed to a write exceeds the hard size ceiling.
    #[error("Payload of {len} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    /// The host name could not be resolved to any socket address.
    #[error("Could not resolve address {0}")]
    InvalidAddress(String),

    // ============================================================================
    // Resource Exhaustion
    // ============================================================================
    /// The process ran out of file descriptors.
    #[error("No more file descriptors available")]
    DescriptorsExhausted,

    /// A per-client backlog reached its cap.
    #[error("Backlog of client {id} is full ({cap} packets)")]
    BacklogFull { id: i32, cap: usize },

    /// The server already serves the configured maximum number of clients.
    #[error("Connection limit of {max} clients reached")]
    ConnectionLimit { max: usize },

    // ============================================================================
    // Timeouts and Closure
    // ============================================================================
    /// An operation did not complete in time.
    #[error("{phase} timed out")]
    Timeout { phase: TimeoutPhase },

    /// The peer closed the connection or the local side shut it down.
    #[error("Connection closed")]
    Closed,

    // ============================================================================
    // Security Errors
    // ============================================================================
    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// Peer certificate verification failed.
    #[error("Certificate verification failed: {0}")]
    TlsVerification(String),

    /// Failed to load TLS certificate material.
    #[error("Failed to load certificate from {path}: {source}")]
    TlsCertificateLoad {
        path: String,
        source: std::io::Error,
    },

    /// Failed to load TLS private key material.
    #[error("Failed to load private key from {path}: {source}")]
    TlsKeyLoad {
        path: String,
        source: std::io::Error,
    },

    /// Certificate data is invalid or unsupported.
    #[error("Invalid certificate format: {0}")]
    TlsInvalidCertificate(String),

    /// Private key data is invalid or unsupported.
    #[error("Invalid private key format: {0}")]
    TlsInvalidKey(String),

    /// Server name for TLS SNI is invalid.
    #[error("Invalid server name '{0}'")]
    TlsInvalidServerName(String),

    /// No credential set matches and none can serve as a fallback.
    #[error("No TLS credentials configured")]
    TlsCredentialsMissing,

    /// A certificate authority is required by the configured mode but none
    /// was supplied.
    #[error("No CA certificate configured: {0}")]
    TlsCaMissing(&'static str),

    /// Failed to build the TLS configuration from the credential material.
    #[error("Failed to build TLS config: {0}")]
    TlsConfigBuild(String),

    // ============================================================================
    // Operation Errors
    // ============================================================================
    /// Low-level I/O error from the operating system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal polling mechanism encountered an error.
    #[error("Poll error: {0}")]
    PollError(String),

    /// The operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

/// Broad error categories. Every [`Error`] belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad parameters, e.g. an empty host name or an oversized payload.
    Configuration,
    /// No more descriptors, backlog full, or connection limit reached.
    ResourceExhausted,
    /// A connect, handshake, read, or write did not complete in time.
    Timeout,
    /// The peer closed the connection or the local side shut it down.
    Closed,
    /// Handshake failure, certificate verification failure, or bad
    /// credentials.
    Security,
    /// Any other OS-level failure.
    Operation,
}

/// The phase of a connection that timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutPhase {
    Connect,
    Handshake,
    Read,
    Write,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::Connect => f.write_str("Connect"),
            TimeoutPhase::Handshake => f.write_str("Handshake"),
            TimeoutPhase::Read => f.write_str("Read"),
            TimeoutPhase::Write => f.write_str("Write"),
        }
    }
}

impl Error {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::InvalidParameter(_)
            | Error::PayloadTooLarge { .. }
            | Error::InvalidAddress(_)
            | Error::InvalidState(_) => ErrorKind::Configuration,
            Error::DescriptorsExhausted
            | Error::BacklogFull { .. }
            | Error::ConnectionLimit { .. } => ErrorKind::ResourceExhausted,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Closed => ErrorKind::Closed,
            Error::TlsHandshake(_)
            | Error::TlsVerification(_)
            | Error::TlsCertificateLoad { .. }
            | Error::TlsKeyLoad { .. }
            | Error::TlsInvalidCertificate(_)
            | Error::TlsInvalidKey(_)
            | Error::TlsInvalidServerName(_)
            | Error::TlsCredentialsMissing
            | Error::TlsCaMissing(_)
            | Error::TlsConfigBuild(_) => ErrorKind::Security,
            Error::Io(err) if is_descriptor_exhaustion(err) => ErrorKind::ResourceExhausted,
            Error::Io(_) | Error::PollError(_) => ErrorKind::Operation,
        }
    }

    /// Returns a numeric code for the closed callback.
    ///
    /// OS errors carry their errno; engine-detected conditions carry one of
    /// the `CODE_*` constants. Plain closure has no code.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Io(err) => err.raw_os_error(),
            Error::BacklogFull { .. } => Some(CODE_BACKLOG_FULL),
            _ => None,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Timeout`.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Shorthand for `kind() == ErrorKind::Closed`.
    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }
}

fn is_descriptor_exhaustion(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}
