//! Worker Queue Tests

mod harness;

use harness::*;
use sockengine::prelude::*;
use sockengine::{Task, ThreadPool, WorkerQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[test]
fn pool_runs_tasks_and_reports_depth() {
    let pool = ThreadPool::new(1, "test-pool").unwrap();
    let (release_tx, release_rx) = channel::<()>();
    let (started_tx, started_rx) = channel::<()>();

    pool.enqueue(Box::new(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    }))
    .unwrap();
    started_rx.recv().unwrap();

    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let done = done.clone();
        pool.enqueue(Box::new(move || {
            done.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }
    assert_eq!(pool.depth(), 3);

    release_tx.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 3));
    assert_eq!(pool.depth(), 0);
}

#[test]
fn pool_survives_panicking_task() {
    let pool = ThreadPool::new(1, "panic-pool").unwrap();
    pool.enqueue(Box::new(|| panic!("task failure"))).unwrap();

    let (tx, rx) = channel();
    pool.enqueue(Box::new(move || tx.send(42).unwrap())).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
}

#[test]
fn shut_down_pool_refuses_tasks() {
    let pool = ThreadPool::new(2, "closed-pool").unwrap();
    pool.shutdown();
    pool.shutdown();
    let err = pool.enqueue(Box::new(|| {})).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(ThreadPool::new(0, "empty").is_err());
}

// Runs every task on its own thread and counts them.
#[derive(Default)]
struct SpawningQueue {
    queued: AtomicUsize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerQueue for SpawningQueue {
    fn enqueue(&self, task: Task) -> Result<(), Error> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.threads.lock().unwrap().push(thread::spawn(task));
        Ok(())
    }

    fn depth(&self) -> usize {
        0
    }
}

#[test]
fn server_uses_injected_worker_queue() {
    init_tracing();
    let recorder = Recorder::echo();
    let queue = Arc::new(SpawningQueue::default());
    let server = Arc::new(
        Server::with_worker_queue(loopback_config(), recorder.clone(), queue.clone()).unwrap(),
    );
    let _ = recorder.server.set(Arc::downgrade(&server));
    let addr = server.bind().unwrap();
    server.start_on_bound_socket().unwrap();

    let client = Connection::open(client_config(addr)).unwrap();
    client.write(b"custom").unwrap();
    assert_eq!(read_exact(&client, 6).unwrap(), b"custom");
    assert!(queue.queued.load(Ordering::SeqCst) >= 1);
}
