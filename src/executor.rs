use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor runs CPU-heavy jobs on a fixed set of worker threads.
///
/// Jobs are queued on a bounded channel; [`Executor::submit`] never blocks and
/// returns [`Error::Busy`] once the queue is full. A submitted job cannot be
/// cancelled: dropping its [`JobHandle`] (or timing out on it) only stops the
/// caller from waiting, the job still occupies a worker until it finishes.
/// Under sustained timeouts this can starve the pool.
///
/// Dropping the executor joins its workers, which waits for running jobs.
/// See [`Executor::shutdown`] for use inside an async runtime.
pub struct Executor {
    queue: Option<SyncSender<Job>>,
    queued: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Executor {
    pub fn start(workers: usize, queue_depth: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (send, recv) = sync_channel::<Job>(queue_depth.max(1));
        let recv = Arc::new(Mutex::new(recv));
        let queued = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut threads = Vec::with_capacity(workers);
        for i in 0..workers {
            let recv2 = recv.clone();
            let queued2 = queued.clone();
            let shutdown2 = shutdown.clone();
            let hnd = thread::Builder::new()
                .name(format!("recog-worker-{}", i))
                .spawn(move || Executor::mainloop(recv2, queued2, shutdown2))?;
            threads.push(hnd);
        }

        Ok(Self {
            queue: Some(send),
            queued,
            shutdown,
            threads,
        })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.threads.len()
    }

    /// Queues `job` and returns a handle to await its result.
    pub fn submit<T, F>(&self, job: F) -> Result<JobHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let queue = match &self.queue {
            Some(q) => q,
            None => return Err(Error::Unavailable("executor is shut down".into())),
        };

        let (tx, rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            // A dropped receiver just means nobody is waiting anymore.
            let _ = tx.send(job());
        });

        self.queued.fetch_add(1, Ordering::SeqCst);
        match queue.try_send(wrapped) {
            Ok(()) => Ok(JobHandle { rx }),
            Err(TrySendError::Full(_)) => {
                let queued = self.queued.fetch_sub(1, Ordering::SeqCst) - 1;
                warn!(queued, "worker queue full, rejecting job");
                Err(Error::Busy { queued })
            }
            Err(TrySendError::Disconnected(_)) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(Error::Unavailable("executor workers are gone".into()))
            }
        }
    }

    /// Stops taking jobs and joins the workers. Jobs still queued are
    /// dropped and their handles report a failure; running jobs finish.
    ///
    /// Blocks until the workers exit. Inside a tokio runtime, call it (or drop
    /// the last handle) from `spawn_blocking`.
    pub fn shutdown(&mut self) {
        if self.queue.is_none() && self.threads.is_empty() {
            return;
        }
        self.shutdown.store(true, Ordering::SeqCst);
        // Closing the queue wakes idle workers.
        self.queue.take();
        for hnd in self.threads.drain(..) {
            hnd.join().ok();
        }
        debug!("executor stopped");
    }

    fn mainloop(jobs: Arc<Mutex<Receiver<Job>>>, queued: Arc<AtomicUsize>, shutdown: Arc<AtomicBool>) {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let job = {
                let recv = match jobs.lock() {
                    Ok(r) => r,
                    Err(_e) => return,
                };
                match recv.recv() {
                    Ok(j) => j,
                    Err(_e) => return,
                }
            };
            queued.fetch_sub(1, Ordering::SeqCst);

            // A panicking job drops its result sender, which the handle
            // reports as a failure. The worker itself keeps going.
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                error!(
                    worker = thread::current().name().unwrap_or("?"),
                    "job panicked"
                );
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Awaitable result of a job submitted to an [`Executor`].
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Waits for the job to finish.
    pub async fn join(self) -> Result<T> {
        self.rx
            .await
            .map_err(|_| Error::Inference("worker job panicked or was dropped".into()))
    }

    /// Waits at most `limit`. On timeout the job keeps running to completion.
    pub async fn join_timeout(self, limit: Duration) -> Result<T> {
        match tokio::time::timeout(limit, self.join()).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    /// Blocking wait, for callers outside an async runtime.
    pub fn wait(self) -> Result<T> {
        self.rx
            .blocking_recv()
            .map_err(|_| Error::Inference("worker job panicked or was dropped".into()))
    }
}
