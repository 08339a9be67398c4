//! Server Integration Tests
//!
//! # Running with tracing
//!
//! Use TEST_LOG environment variable to control tracing verbosity (like -v, -vv, -vvv):
//!
//! ```bash
//! TEST_LOG=2 cargo test --test server -- --nocapture
//! ```

mod harness;

use harness::*;
use sockengine::prelude::*;
use sockengine::{CODE_BACKLOG_FULL, CODE_SERVER_STOPPING};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Echo and Connection Limit
// ============================================================================

#[test]
fn echo_round_trip() {
    let recorder = Recorder::echo();
    let (server, addr) = recorder.start(loopback_config());

    let client = Connection::open(client_config(addr)).unwrap();
    assert_eq!(client.write(b"hello engine").unwrap(), 12);
    assert_eq!(read_exact(&client, 12).unwrap(), b"hello engine");

    assert!(wait_until(WAIT, || server.client_count() == 1));
    let (id, ip, port) = recorder.connected.lock().unwrap()[0];
    assert!(id >= 1000);
    assert_eq!(ip, client.local_addr().unwrap().ip());
    assert_eq!(port, client.local_addr().unwrap().port());
    assert_eq!(server.client_ids(), vec![id]);
    assert_eq!(server.client_address(id), client.local_addr());
    assert_eq!(server.client_cert_dn(id), None);
}

#[test]
fn third_client_is_refused_at_capacity() {
    let recorder = Recorder::echo();
    let config = ServerConfig {
        max_connections: 2,
        ..loopback_config()
    };
    let (server, addr) = recorder.start(config);

    let first = Connection::open(client_config(addr)).unwrap();
    let second = Connection::open(client_config(addr)).unwrap();
    assert!(wait_until(WAIT, || server.client_count() == 2));

    let third = Connection::open(client_config(addr)).unwrap();
    let mut buf = [0u8; 16];
    let err = third.read(&mut buf).unwrap_err();
    assert!(err.is_closed(), "unexpected error: {err}");

    // The refused client never shows up in the callbacks.
    assert_eq!(recorder.connected.lock().unwrap().len(), 2);

    for (conn, payload) in [(&first, &b"first"[..]), (&second, &b"second"[..])] {
        conn.write(payload).unwrap();
        assert_eq!(read_exact(conn, payload.len()).unwrap(), payload);
    }
}

// ============================================================================
// Delivery Order
// ============================================================================

#[derive(Default)]
struct OrderChecker {
    in_flight: Mutex<HashMap<i32, bool>>,
    overlaps: AtomicUsize,
    received: Mutex<HashMap<i32, Vec<u8>>>,
}

impl ServerHandler for OrderChecker {
    fn on_packet_received(&self, client_id: i32, packet: &[u8]) {
        let was_busy = self
            .in_flight
            .lock()
            .unwrap()
            .insert(client_id, true)
            .unwrap_or(false);
        if was_busy {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_micros(200));
        self.received
            .lock()
            .unwrap()
            .entry(client_id)
            .or_default()
            .extend_from_slice(packet);
        self.in_flight.lock().unwrap().insert(client_id, false);
    }
}

#[test]
fn packets_are_delivered_in_order_one_at_a_time() {
    init_tracing();
    let checker = Arc::new(OrderChecker::default());
    let config = ServerConfig {
        processing_threads: 4,
        read_buffer_size: 64,
        ..loopback_config()
    };
    let server = Server::new(config, checker.clone()).unwrap();
    let addr = server.bind().unwrap();
    server.start_on_bound_socket().unwrap();

    let clients: Vec<_> = (0..3)
        .map(|_| Connection::open(client_config(addr)).unwrap())
        .collect();
    let mut expected = Vec::new();
    for i in 0..300 {
        expected.extend_from_slice(format!("msg-{i};").as_bytes());
    }
    for chunk in expected.chunks(97) {
        for client in &clients {
            client.write(chunk).unwrap();
        }
    }

    assert!(wait_until(Duration::from_secs(10), || {
        let received = checker.received.lock().unwrap();
        received.len() == 3 && received.values().all(|r| r.len() == expected.len())
    }));
    for stream in checker.received.lock().unwrap().values() {
        assert_eq!(stream, &expected);
    }
    assert_eq!(checker.overlaps.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Backlog Cap
// ============================================================================

#[test]
fn backlog_overflow_closes_client_once() {
    let recorder = Recorder::slow(Duration::from_millis(50));
    let config = ServerConfig {
        read_buffer_size: 4,
        max_backlog: 5,
        processing_threads: 1,
        ..loopback_config()
    };
    let (server, addr) = recorder.start(config);

    let client = Connection::open(client_config(addr)).unwrap();
    client.write(&[7u8; 400]).unwrap();

    assert!(wait_until(WAIT, || !recorder.closed_events().is_empty()));
    // Nothing else may follow the first close event.
    thread::sleep(Duration::from_millis(500));
    let closed = recorder.closed_events();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].1, Some(CODE_BACKLOG_FULL));
    assert!(closed[0].2.is_some());
    assert_eq!(server.client_count(), 0);

    let mut buf = [0u8; 8];
    assert!(client.read(&mut buf).unwrap_err().is_closed());
}

// ============================================================================
// Closing Clients
// ============================================================================

#[test]
fn close_client_fires_callback_without_code() {
    let recorder = Recorder::echo();
    let (server, addr) = recorder.start(loopback_config());

    let client = Connection::open(client_config(addr)).unwrap();
    assert!(wait_until(WAIT, || server.client_count() == 1));
    let id = server.client_ids()[0];

    assert!(server.close_client(id));
    assert!(!server.close_client(id));
    assert_eq!(recorder.closed_events(), vec![(id, None, None)]);

    // Sending to a departed client is not an error.
    server.send_to_client(id, b"late", false).unwrap();

    let mut buf = [0u8; 8];
    assert!(client.read(&mut buf).unwrap_err().is_closed());
}

#[test]
fn clients_are_owned_by_an_acceptor_shard() {
    let recorder = Recorder::echo();
    let config = ServerConfig {
        acceptor_threads: 2,
        ..loopback_config()
    };
    let (server, addr) = recorder.start(config);

    let clients: Vec<_> = (0..4)
        .map(|_| Connection::open(client_config(addr)).unwrap())
        .collect();
    assert!(wait_until(WAIT, || server.client_count() == clients.len()));
    for id in server.client_ids() {
        assert!(server.client_shard(id).unwrap() < 2);
    }

    let id = server.client_ids()[0];
    assert!(server.close_client(id));
    assert_eq!(server.client_shard(id), None);
}

#[test]
fn peer_disconnect_is_reported() {
    let recorder = Recorder::echo();
    let (server, addr) = recorder.start(loopback_config());

    let client = Connection::open(client_config(addr)).unwrap();
    client.write(b"bye").unwrap();
    assert_eq!(read_exact(&client, 3).unwrap(), b"bye");
    client.close();

    assert!(wait_until(WAIT, || recorder.closed_events().len() == 1));
    assert_eq!(recorder.closed_events()[0].1, None);
    assert!(wait_until(WAIT, || server.client_count() == 0));
}

#[test]
fn send_with_close_after() {
    let recorder = Recorder::default_arc();
    let (server, addr) = recorder.start(loopback_config());

    let client = Connection::open(client_config(addr)).unwrap();
    assert!(wait_until(WAIT, || server.client_count() == 1));
    let id = server.client_ids()[0];

    server.send_to_client(id, b"goodbye", true).unwrap();
    assert_eq!(read_exact(&client, 7).unwrap(), b"goodbye");
    let mut buf = [0u8; 8];
    assert!(client.read(&mut buf).unwrap_err().is_closed());
    assert_eq!(server.client_count(), 0);
}

#[test]
fn broadcast_reaches_every_client() {
    let recorder = Recorder::echo();
    let (server, addr) = recorder.start(loopback_config());

    let clients: Vec<_> = (0..3)
        .map(|_| Connection::open(client_config(addr)).unwrap())
        .collect();
    assert!(wait_until(WAIT, || server.client_count() == 3));

    assert_eq!(server.broadcast(b"news"), 3);
    for client in &clients {
        assert_eq!(read_exact(client, 4).unwrap(), b"news");
    }
    assert!(server.sent_packets_per_minute() >= 3.0);
}

#[test]
fn stopping_closes_clients_with_stop_code() {
    let recorder = Recorder::echo();
    let (server, addr) = recorder.start(loopback_config());

    let client = Connection::open(client_config(addr)).unwrap();
    assert!(wait_until(WAIT, || server.client_count() == 1));
    assert!(server.is_running());

    server.stop();
    server.wait_until_stopped();
    assert!(!server.is_running());
    assert_eq!(server.bound_address(), None);

    let closed = recorder.closed_events();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].1, Some(CODE_SERVER_STOPPING));

    let mut buf = [0u8; 8];
    assert!(client.read(&mut buf).unwrap_err().is_closed());
}

#[test]
fn start_requires_bind() {
    let server = Server::new(loopback_config(), Recorder::default_arc()).unwrap();
    let err = server.start_on_bound_socket().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let addr = server.bind().unwrap();
    assert_eq!(server.bind().unwrap(), addr);
    server.start_on_bound_socket().unwrap();
    assert!(server.start_on_bound_socket().is_err());
}

#[test]
fn counters_track_received_packets() {
    let recorder = Recorder::echo();
    let (server, addr) = recorder.start(loopback_config());

    let client = Connection::open(client_config(addr)).unwrap();
    client.write(b"ping").unwrap();
    assert_eq!(read_exact(&client, 4).unwrap(), b"ping");

    assert!(server.received_packets_per_minute() >= 1.0);
    assert_eq!(server.worker_queue_depth(), 0);
    let id = server.client_ids()[0];
    assert_eq!(server.client_backlog_len(id), 0);
    assert!(client.is_connected());
}
