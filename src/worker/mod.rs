//! Task queue feeding the packet callbacks.
//!
//! The server only needs [`WorkerQueue::enqueue`]; [`ThreadPool`] is the
//! default implementation, a fixed set of named threads sharing one channel.

use crate::error::Error;
use crate::handle::lock;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// A unit of work run on a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Queue of tasks executed by some number of worker threads.
///
/// Tasks may run in any order and on any thread.
pub trait WorkerQueue: Send + Sync {
    /// Queues `task`. Fails once the queue has been shut down.
    fn enqueue(&self, task: Task) -> Result<(), Error>;

    /// Number of tasks queued but not yet started.
    fn depth(&self) -> usize;
}

/// Fixed-size pool of worker threads.
pub struct ThreadPool {
    sender: Mutex<Option<Sender<Task>>>,
    depth: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("threads", &lock(&self.workers).len())
            .field("depth", &self.depth())
            .finish()
    }
}

impl ThreadPool {
    /// Spawns `threads` workers named `{name}-{index}`.
    pub fn new(threads: usize, name: &str) -> Result<Self, Error> {
        if threads == 0 {
            return Err(Error::InvalidParameter(
                "thread pool needs at least one thread".into(),
            ));
        }
        let (sender, receiver) = channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let depth = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let depth = depth.clone();
            let worker = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || run_worker(&receiver, &depth))?;
            workers.push(worker);
        }
        debug!(threads, name, "Thread pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            depth,
            workers: Mutex::new(workers),
        })
    }

    /// Stops accepting tasks, lets the workers finish what is queued and
    /// joins them. Idempotent.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            // A task may shut down the pool it runs on.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl WorkerQueue for ThreadPool {
    fn enqueue(&self, task: Task) -> Result<(), Error> {
        let guard = lock(&self.sender);
        let sender = guard
            .as_ref()
            .ok_or(Error::InvalidState("thread pool is shut down"))?;
        self.depth.fetch_add(1, Ordering::AcqRel);
        if sender.send(task).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::InvalidState("thread pool is shut down"));
        }
        Ok(())
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: &Mutex<Receiver<Task>>, depth: &AtomicUsize) {
    loop {
        // The guard is a temporary, so the lock is released before the task
        // runs.
        let task = lock(receiver).recv();
        let Ok(task) = task else {
            trace!("Worker exiting");
            return;
        };
        depth.fetch_sub(1, Ordering::AcqRel);
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("Worker task panicked");
        }
    }
}
