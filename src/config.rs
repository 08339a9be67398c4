//! Engine configuration.
//!
//! [`ServerConfig`] and [`ClientConfig`] can be built programmatically
//! (struct update syntax over `Default`) or read from a [`config::Config`]
//! with namespacing:
//!
//! 1. `{name}.{key}` (e.g., `api_server.port`)
//! 2. `{key}` (e.g., `port`)
//! 3. Hard-coded default
//!
//! # Example
//!
//! ```toml
//! # Global defaults
//! tls = false
//! read_timeout_ms = 15000
//!
//! # Specific to "api_server" instance
//! [api_server]
//! port = 8443
//! tls = true
//!
//! [api_server.certificates."*"]
//! cert_file = "/etc/ssl/server.pem"
//! key_file = "/etc/ssl/server.key"
//! ```

use crate::credentials::{CredentialSet, CredentialSource};
use crate::error::Error;
use ::config::Config;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

pub(crate) const DEFAULT_BACKLOG_SIZE: i32 = 100;
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub(crate) const DEFAULT_PROCESSING_THREADS: usize = 4;
pub(crate) const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
pub(crate) const DEFAULT_MAX_BACKLOG: usize = 10_000;
pub(crate) const DEFAULT_DRAIN_BATCH: usize = 10;

// ============================================================================
// Keepalive
// ============================================================================

/// TCP keepalive parameters applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Number of unanswered probes before the connection is dropped.
    pub probes: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(30),
            interval: Duration::from_secs(10),
            probes: 5,
        }
    }
}

impl KeepaliveConfig {
    fn from_config(config: &Config, name: &str) -> Self {
        let defaults = Self::default();
        Self {
            idle: get_namespaced_u64(config, name, "keepalive_idle_s")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle),
            interval: get_namespaced_u64(config, name, "keepalive_interval_s")
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            probes: get_namespaced_u64(config, name, "keepalive_probes")
                .map(|p| p as u32)
                .unwrap_or(defaults.probes),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `"0.0.0.0"` or `"::"`.
    pub listen_address: String,
    /// Port to bind. `0` picks an ephemeral port.
    pub port: u16,
    /// Wrap every accepted connection in TLS.
    pub tls: bool,
    /// Length of the kernel accept queue.
    pub backlog_size: i32,
    /// Maximum number of concurrently connected clients.
    pub max_connections: usize,
    /// Number of acceptor threads, each owning a shard of the clients.
    pub acceptor_threads: usize,
    /// Number of worker threads draining client backlogs.
    pub processing_threads: usize,
    /// TLS identities keyed by server name; `*` is the default identity.
    pub credentials: Vec<(String, CredentialSet)>,
    /// Optional Diffie-Hellman parameter block.
    pub dh_params: Option<CredentialSource>,
    /// Refuse TLS clients that do not present a certificate.
    pub require_client_cert: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Upper bound for the server-side TLS handshake.
    ///
    /// The handshake runs on the acceptor thread, so a peer that connects
    /// and stays silent holds up accepts and reads of that acceptor's whole
    /// shard for up to this long. Keep it short, or raise
    /// `acceptor_threads` so other shards keep serving.
    pub handshake_timeout: Duration,
    /// Size of the per-client read buffer; one read yields at most one
    /// packet of this size.
    pub read_buffer_size: usize,
    /// Maximum number of queued packets per client.
    pub max_backlog: usize,
    /// Maximum number of packets a single drain task delivers.
    pub drain_batch: usize,
    /// Interval between garbage-collection sweeps.
    pub gc_interval: Duration,
    /// Delay before the acceptor retries binding a failed listener.
    pub rebind_delay: Duration,
    pub keepalive: KeepaliveConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 0,
            tls: false,
            backlog_size: DEFAULT_BACKLOG_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acceptor_threads: 1,
            processing_threads: DEFAULT_PROCESSING_THREADS,
            credentials: Vec::new(),
            dh_params: None,
            require_client_cert: false,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(5),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_backlog: DEFAULT_MAX_BACKLOG,
            drain_batch: DEFAULT_DRAIN_BATCH,
            gc_interval: Duration::from_secs(10),
            rebind_delay: Duration::from_secs(1),
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Reads a server configuration from un-namespaced keys.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::from_config(config, "")
    }

    /// Reads a server configuration, preferring keys namespaced by `name`.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let d = Self::default();
        let server = Self {
            listen_address: get_namespaced_string(config, name, "listen_address")
                .unwrap_or(d.listen_address),
            port: get_namespaced_u64(config, name, "port")
                .map(|p| p as u16)
                .unwrap_or(d.port),
            tls: get_namespaced_bool(config, name, "tls").unwrap_or(d.tls),
            backlog_size: get_namespaced_u64(config, name, "backlog_size")
                .map(|b| b as i32)
                .unwrap_or(d.backlog_size),
            max_connections: get_namespaced_usize(config, name, "max_connections")
                .unwrap_or(d.max_connections),
            acceptor_threads: get_namespaced_usize(config, name, "acceptor_threads")
                .unwrap_or(d.acceptor_threads),
            processing_threads: get_namespaced_usize(config, name, "processing_threads")
                .unwrap_or(d.processing_threads),
            credentials: get_namespaced_credentials(config, name)?,
            dh_params: get_namespaced_string(config, name, "dh_params_file")
                .ok()
                .map(|path| CredentialSource::File(path.into())),
            require_client_cert: get_namespaced_bool(config, name, "require_client_cert")
                .unwrap_or(d.require_client_cert),
            read_timeout: get_namespaced_millis(config, name, "read_timeout_ms")
                .unwrap_or(d.read_timeout),
            write_timeout: get_namespaced_millis(config, name, "write_timeout_ms")
                .unwrap_or(d.write_timeout),
            handshake_timeout: get_namespaced_millis(config, name, "handshake_timeout_ms")
                .unwrap_or(d.handshake_timeout),
            read_buffer_size: get_namespaced_usize(config, name, "read_buffer_size")
                .unwrap_or(d.read_buffer_size),
            max_backlog: get_namespaced_usize(config, name, "max_backlog")
                .unwrap_or(d.max_backlog),
            drain_batch: get_namespaced_usize(config, name, "drain_batch")
                .unwrap_or(d.drain_batch),
            gc_interval: get_namespaced_millis(config, name, "gc_interval_ms")
                .unwrap_or(d.gc_interval),
            rebind_delay: get_namespaced_millis(config, name, "rebind_delay_ms")
                .unwrap_or(d.rebind_delay),
            keepalive: KeepaliveConfig::from_config(config, name),
        };
        server.validate()?;
        Ok(server)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.listen_address.is_empty() {
            return Err(Error::InvalidParameter("listen address is empty".into()));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidParameter("max_connections must be > 0".into()));
        }
        if self.acceptor_threads == 0 || self.processing_threads == 0 {
            return Err(Error::InvalidParameter(
                "acceptor and processing thread counts must be > 0".into(),
            ));
        }
        if self.read_buffer_size == 0 || self.max_backlog == 0 || self.drain_batch == 0 {
            return Err(Error::InvalidParameter(
                "read buffer, backlog cap and drain batch must be > 0".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Local identity and trusted CA material. Only the first entry is used.
    pub credentials: Vec<(String, CredentialSet)>,
    /// Server name sent in the SNI extension. Defaults to `host`.
    pub server_name: Option<String>,
    /// Fail the handshake on any verification error. When `false`, only
    /// revoked, expired and insecure-algorithm failures are fatal.
    pub verify_certificate: bool,
    /// Check the peer certificate against the expected host name.
    pub verify_hostname: bool,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Upper bound for one TCP connect attempt plus the TLS handshake.
    pub connect_timeout: Duration,
    /// Total number of connect attempts.
    pub connect_retries: u32,
    /// Delay between two connect attempts.
    pub connect_retry_delay: Duration,
    /// Reconnect transparently when reading or writing a closed connection.
    pub auto_connect: bool,
    pub keepalive: KeepaliveConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            tls: false,
            credentials: Vec::new(),
            server_name: None,
            verify_certificate: true,
            verify_hostname: true,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(5),
            connect_retries: 1,
            connect_retry_delay: Duration::from_secs(1),
            auto_connect: false,
            keepalive: KeepaliveConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Reads a client configuration from un-namespaced keys.
    pub fn new(config: &Config) -> Result<Self, Error> {
        Self::from_config(config, "")
    }

    /// Reads a client configuration, preferring keys namespaced by `name`.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let d = Self::default();
        let server_name = match get_namespaced_string(config, name, "tls_server_name") {
            Ok(name) => Some(name),
            Err(::config::ConfigError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };
        let client = Self {
            host: get_namespaced_string(config, name, "host").unwrap_or(d.host),
            port: get_namespaced_u64(config, name, "port")
                .map(|p| p as u16)
                .unwrap_or(d.port),
            tls: get_namespaced_bool(config, name, "tls").unwrap_or(d.tls),
            credentials: get_namespaced_credentials(config, name)?,
            server_name,
            verify_certificate: get_namespaced_bool(config, name, "verify_certificate")
                .unwrap_or(d.verify_certificate),
            verify_hostname: get_namespaced_bool(config, name, "verify_hostname")
                .unwrap_or(d.verify_hostname),
            read_timeout: get_namespaced_millis(config, name, "read_timeout_ms")
                .unwrap_or(d.read_timeout),
            write_timeout: get_namespaced_millis(config, name, "write_timeout_ms")
                .unwrap_or(d.write_timeout),
            connect_timeout: get_namespaced_millis(config, name, "connect_timeout_ms")
                .unwrap_or(d.connect_timeout),
            connect_retries: get_namespaced_u64(config, name, "connect_retries")
                .map(|r| r as u32)
                .unwrap_or(d.connect_retries),
            connect_retry_delay: get_namespaced_millis(config, name, "connect_retry_delay_ms")
                .unwrap_or(d.connect_retry_delay),
            auto_connect: get_namespaced_bool(config, name, "auto_connect")
                .unwrap_or(d.auto_connect),
            keepalive: KeepaliveConfig::from_config(config, name),
        };
        client.validate()?;
        Ok(client)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.host.is_empty() {
            return Err(Error::InvalidParameter("host name is empty".into()));
        }
        if self.port == 0 {
            return Err(Error::InvalidParameter("port is empty".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Credential Tables
// ============================================================================

/// On-disk shape of one entry of the `certificates` table.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CredentialSetConfig {
    pub cert_file: Option<String>,
    pub cert_data: Option<String>,
    pub key_file: Option<String>,
    pub key_data: Option<String>,
    pub ca_file: Option<String>,
    pub ca_data: Option<String>,
}

impl CredentialSetConfig {
    fn into_credential_set(self) -> CredentialSet {
        fn source(file: Option<String>, data: Option<String>) -> Option<CredentialSource> {
            match (data, file) {
                (Some(data), _) => Some(CredentialSource::Inline(data.into_bytes())),
                (None, Some(path)) => Some(CredentialSource::File(path.into())),
                (None, None) => None,
            }
        }
        CredentialSet {
            certificate: source(self.cert_file, self.cert_data),
            private_key: source(self.key_file, self.key_data),
            ca: source(self.ca_file, self.ca_data),
        }
    }
}

fn get_namespaced_credentials(
    config: &Config,
    name: &str,
) -> Result<Vec<(String, CredentialSet)>, Error> {
    let table = match get_namespaced_value(config, name, "certificates", |cfg, key| {
        cfg.get::<HashMap<String, CredentialSetConfig>>(key)
    }) {
        Ok(table) => table,
        Err(::config::ConfigError::NotFound(_)) => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    // HashMap order is arbitrary, so sort to make "first entry" stable.
    let mut entries: Vec<_> = table
        .into_iter()
        .map(|(sni, entry)| (sni, entry.into_credential_set()))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

// ============================================================================
// Namespaced Lookup
// ============================================================================

pub(crate) fn get_namespaced_value<T, F>(
    config: &Config,
    name: &str,
    key: &str,
    getter: F,
) -> Result<T, ::config::ConfigError>
where
    F: Fn(&Config, &str) -> Result<T, ::config::ConfigError>,
{
    if name.is_empty() {
        getter(config, key)
    } else {
        getter(config, &format!("{name}.{key}")).or_else(|_| getter(config, key))
    }
}

pub(crate) fn get_namespaced_usize(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<usize, ::config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<usize>(key))
}

pub(crate) fn get_namespaced_u64(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<u64, ::config::ConfigError> {
    get_namespaced_value(config, name, key, |cfg, key| cfg.get::<u64>(key))
}

pub(crate) fn get_namespaced_bool(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<bool, ::config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_bool)
}

pub(crate) fn get_namespaced_string(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<String, ::config::ConfigError> {
    get_namespaced_value(config, name, key, Config::get_string)
}

pub(crate) fn get_namespaced_millis(
    config: &Config,
    name: &str,
    key: &str,
) -> Result<Duration, ::config::ConfigError> {
    get_namespaced_u64(config, name, key).map(Duration::from_millis)
}
