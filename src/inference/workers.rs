//! Fixed-size worker pool for CPU bound scoring tasks.
//!
//! Admission is bounded: at most `workers + queue_capacity` jobs may be queued
//! or running at once, and `try_submit` fails fast instead of blocking.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, warn};

/// How long `Drop` waits for busy workers before detaching them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is full ({capacity} jobs in flight)")]
    Full { capacity: usize },
    #[error("worker pool is shut down")]
    Closed,
}

pub struct Pool {
    tx: Option<SyncSender<Job>>,
    handles: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    capacity: usize,
    shutdown_grace: Duration,
}

/// Releases an admission slot when the job finishes, panics included.
struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Pool {
    pub fn new(size: usize, queue_capacity: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let capacity = size.checked_add(queue_capacity).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("pool capacity overflows: {size} workers + {queue_capacity} queued"),
            )
        })?;
        let (tx, rx) = mpsc::sync_channel::<Job>(capacity);
        let shared_rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = Arc::clone(&shared_rx);
            let handle = thread::Builder::new()
                .name(format!("ml-worker-{idx}"))
                .spawn(move || worker_loop(idx, rx))?;
            handles.push(handle);
        }

        debug!(workers = size, capacity, "worker pool started");
        Ok(Self {
            tx: Some(tx),
            handles,
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Queue a job if an admission slot is free.
    pub fn try_submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(PoolError::Closed)?;

        let capacity = self.capacity;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| PoolError::Full { capacity })?;

        let guard = SlotGuard(Arc::clone(&self.in_flight));
        let wrapped: Job = Box::new(move || {
            let _guard = guard;
            job();
        });

        // The channel holds `capacity` jobs, so a reserved slot always fits.
        tx.try_send(wrapped).map_err(|err| match err {
            TrySendError::Full(_) => PoolError::Full { capacity },
            TrySendError::Disconnected(_) => PoolError::Closed,
        })
    }

    /// Jobs currently queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn worker_loop(idx: usize, rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = rx.lock();
            guard.recv()
        };

        match job {
            Ok(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(worker = idx, "job panicked; worker keeps running");
                }
            }
            Err(_) => break,
        }
    }
    debug!(worker = idx, "worker stopped");
}

impl Drop for Pool {
    /// Stop accepting work and join workers as they finish draining the queue.
    ///
    /// Workers still busy when the grace period ends are detached, so a scorer
    /// that never returns cannot block shutdown.
    fn drop(&mut self) {
        self.tx.take();
        let deadline = Instant::now().checked_add(self.shutdown_grace);
        let mut pending: Vec<JoinHandle<()>> = self.handles.drain(..).collect();

        loop {
            let (finished, busy): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|handle| handle.is_finished());
            for handle in finished {
                let _ = handle.join();
            }
            pending = busy;
            if pending.is_empty() || deadline.is_some_and(|at| Instant::now() >= at) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        if !pending.is_empty() {
            warn!(
                detached = pending.len(),
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "workers still busy after shutdown grace; detaching"
            );
        }
    }
}
