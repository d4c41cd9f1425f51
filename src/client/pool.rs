//! Bounded worker pool for asynchronous inference calls.
//!
//! A fixed number of OS threads pull jobs from a shared FIFO queue. Each job
//! carries its own state cell, so the caller's [`CallContext`] can observe and
//! cancel it without touching the queue:
//!
//! ```text
//! Queued ──► Running ──► Completed | Failed
//!    │
//!    └──► Cancelled
//! ```
//!
//! The completion callback of every accepted job runs exactly once, on a
//! worker thread, including for cancelled jobs.

use crate::error::{Error, Result};
use crate::response::InferResult;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, warn};

type CallFn = Box<dyn FnOnce() -> Result<InferResult> + Send>;
type Callback = Box<dyn FnOnce(Result<InferResult>) + Send>;

/// Lifecycle state of one asynchronous call.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Queued = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl CallStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallStatus::Queued,
            1 => CallStatus::Running,
            2 => CallStatus::Completed,
            3 => CallStatus::Failed,
            _ => CallStatus::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Cancelled
        )
    }
}

#[derive(Debug)]
struct CallShared {
    id: u64,
    state: AtomicU8,
}

impl CallShared {
    fn transition(&self, from: CallStatus, to: CallStatus) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set(&self, status: CallStatus) {
        self.state.store(status as u8, Ordering::Release);
    }

    fn status(&self) -> CallStatus {
        CallStatus::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// Caller-held handle for one in-flight asynchronous call.
///
/// The handle only observes the call; dropping it neither cancels the call
/// nor keeps the client alive.
#[derive(Debug, Clone)]
pub struct CallContext {
    shared: Arc<CallShared>,
}

impl CallContext {
    /// Call number, unique per client and assigned in submission order.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn status(&self) -> CallStatus {
        self.shared.status()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Best-effort cancellation; never blocks.
    ///
    /// Returns `true` if the call had not started and will complete with
    /// [`Error::Cancelled`]. Once a worker has picked the call up it runs to
    /// completion and this returns `false`.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .shared
            .transition(CallStatus::Queued, CallStatus::Cancelled);
        if cancelled {
            debug!(call_id = self.shared.id, "Cancelled queued call");
        }
        cancelled
    }
}

struct Job {
    call: Arc<CallShared>,
    run: CallFn,
    on_complete: Callback,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    closed: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

/// Fixed-size pool of worker threads.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
    next_id: AtomicU64,
    size: usize,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_job(job: Job) {
    let Job {
        call,
        run,
        on_complete,
    } = job;

    let outcome = if call.transition(CallStatus::Queued, CallStatus::Running) {
        let result = catch_unwind(AssertUnwindSafe(run))
            .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload.as_ref()))));
        call.set(if result.is_ok() {
            CallStatus::Completed
        } else {
            CallStatus::Failed
        });
        result
    } else {
        Err(Error::Cancelled)
    };

    let id = call.id;
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || on_complete(outcome))) {
        warn!(
            call_id = id,
            panic = %panic_message(payload.as_ref()),
            "Completion callback panicked"
        );
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.closed {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        run_job(job);
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }

        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("infer-worker-{}", i))
                .spawn(move || worker_loop(worker_shared));
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    Self::shutdown(&shared, workers);
                    return Err(e.into());
                }
            }
        }

        info!(workers = size, "Started inference worker pool");
        let worker_ids = workers.iter().map(|h| h.thread().id()).collect();
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            worker_ids,
            next_id: AtomicU64::new(0),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Queues a call. Fails with [`Error::Closed`] once the pool is closed, in
    /// which case `on_complete` is dropped without being invoked.
    pub fn submit<F, C>(&self, run: F, on_complete: C) -> Result<CallContext>
    where
        F: FnOnce() -> Result<InferResult> + Send + 'static,
        C: FnOnce(Result<InferResult>) + Send + 'static,
    {
        let call = Arc::new(CallShared {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(CallStatus::Queued as u8),
        });

        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return Err(Error::Closed);
            }
            queue.jobs.push_back(Job {
                call: Arc::clone(&call),
                run: Box::new(run),
                on_complete: Box::new(on_complete),
            });
        }
        self.shared.available.notify_one();

        debug!(call_id = call.id, "Queued asynchronous call");
        Ok(CallContext { shared: call })
    }

    /// Stops accepting work and waits for every queued and running call to
    /// finish. Idempotent; concurrent callers all return after the drain.
    ///
    /// From a completion callback this only stops intake, since a worker
    /// cannot wait for itself. The workers exit once the queue is empty.
    pub fn close(&self) {
        if self.worker_ids.contains(&thread::current().id()) {
            Self::stop_intake(&self.shared);
            return;
        }

        // Joined under the lock so a second closer blocks until the drain ends.
        let mut workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }
        Self::shutdown(&self.shared, std::mem::take(&mut *workers));
        info!(workers = self.size, "Inference worker pool drained");
    }

    fn stop_intake(shared: &PoolShared) {
        shared.queue.lock().closed = true;
        shared.available.notify_all();
    }

    fn shutdown(shared: &PoolShared, workers: Vec<JoinHandle<()>>) {
        Self::stop_intake(shared);
        for handle in workers {
            if handle.join().is_err() {
                warn!("Inference worker exited with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
