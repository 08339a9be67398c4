#![allow(dead_code)]

use sockengine::prelude::*;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Once, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// ============================================================================
// Tracing Initialization
// ============================================================================

/// Initialize tracing based on TEST_LOG environment variable
///
/// Verbosity levels (like -v, -vv, -vvv):
/// - TEST_LOG=1: Info level
/// - TEST_LOG=2: Debug level
/// - TEST_LOG=3: Trace level
///
/// Example: TEST_LOG=2 cargo test echo -- --nocapture
pub fn init_tracing() {
    INIT.call_once(|| {
        if let Ok(level_str) = std::env::var("TEST_LOG") {
            let verbosity = level_str.parse::<u8>().unwrap_or(0);

            if verbosity > 0 {
                let level = match verbosity {
                    1 => "info",
                    2 => "debug",
                    _ => "trace", // 3 or more
                };

                let filter = format!("sockengine={}", level);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
                    .with_target(true)
                    .with_test_writer()
                    .try_init();
            }
        }
    });
}

// ============================================================================
// Helpers
// ============================================================================

/// Poll `condition` every 10 ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Server configuration on an ephemeral loopback port.
pub fn loopback_config() -> ServerConfig {
    ServerConfig {
        listen_address: "127.0.0.1".to_string(),
        port: 0,
        gc_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

/// Client configuration for `addr`.
pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Read until `len` bytes have arrived.
pub fn read_exact(conn: &Connection, len: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 4096];
    while out.len() < len {
        let n = conn.read(&mut buf)?;
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

// ============================================================================
// Recording Handler
// ============================================================================

/// Records every callback; optionally echoes packets back.
#[derive(Default)]
pub struct Recorder {
    pub server: OnceLock<Weak<Server>>,
    pub echo: bool,
    pub delay: Option<Duration>,
    pub connected: Mutex<Vec<(i32, IpAddr, u16)>>,
    pub closed: Mutex<Vec<(i32, Option<i32>, Option<String>)>>,
    pub received: Mutex<HashMap<i32, Vec<u8>>>,
}

impl Recorder {
    pub fn default_arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn echo() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    /// Start a server that reports to this recorder.
    pub fn start(self: &Arc<Self>, config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        init_tracing();
        let server = Arc::new(Server::new(config, self.clone()).unwrap());
        let _ = self.server.set(Arc::downgrade(&server));
        let addr = server.bind().unwrap();
        server.start_on_bound_socket().unwrap();
        (server, addr)
    }

    pub fn closed_events(&self) -> Vec<(i32, Option<i32>, Option<String>)> {
        self.closed.lock().unwrap().clone()
    }

    pub fn received_from(&self, id: i32) -> Vec<u8> {
        self.received
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ServerHandler for Recorder {
    fn on_new_connection(&self, client_id: i32, peer_address: IpAddr, peer_port: u16) {
        self.connected
            .lock()
            .unwrap()
            .push((client_id, peer_address, peer_port));
    }

    fn on_connection_closed(
        &self,
        client_id: i32,
        error_code: Option<i32>,
        error_message: Option<&str>,
    ) {
        self.closed.lock().unwrap().push((
            client_id,
            error_code,
            error_message.map(str::to_string),
        ));
    }

    fn on_packet_received(&self, client_id: i32, packet: &[u8]) {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        self.received
            .lock()
            .unwrap()
            .entry(client_id)
            .or_default()
            .extend_from_slice(packet);
        if self.echo {
            if let Some(server) = self.server.get().and_then(Weak::upgrade) {
                let _ = server.send_to_client(client_id, packet, false);
            }
        }
    }
}
