//! Bounded worker pools and the executor seam.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::util::panic_message;

/// A unit of work for a pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs jobs on other threads.
pub trait Executor: Send + Sync {
    /// Hand over a job. Blocks while the executor is saturated.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError`] once the executor has been shut down.
    fn execute(&self, job: Job) -> Result<(), PoolError>;

    /// Stop accepting work, finish what was accepted, release the threads.
    fn shutdown(&self);

    fn label(&self) -> &str;
}

/// Creates executors for the scheduler. Supplying one replaces the
/// built-in [`WorkerPool`] for every pool the engine creates.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self, label: &str, size: usize) -> Arc<dyn Executor>;
}

/// The default factory.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerPoolFactory;

impl ExecutorFactory for WorkerPoolFactory {
    fn create(&self, label: &str, size: usize) -> Arc<dyn Executor> {
        Arc::new(WorkerPool::new(label, size))
    }
}

struct State {
    queue: VecDeque<Job>,
    /// Accepted jobs not yet finished, queued or running.
    in_flight: usize,
    workers: Vec<JoinHandle<()>>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled when a job is queued or the pool shuts down.
    work: Condvar,
    /// Signalled when a job finishes.
    capacity: Condvar,
}

/// A fixed-size pool of named threads.
///
/// Workers are started on demand, one per accepted job, until `size` exist;
/// later jobs go to idle workers. `execute` blocks while `size` jobs are in
/// flight, so the pool never holds more than `size` jobs.
pub struct WorkerPool {
    label: String,
    size: usize,
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(label: impl Into<String>, size: usize) -> Self {
        Self {
            label: label.into(),
            size: size.max(1),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    in_flight: 0,
                    workers: Vec::new(),
                    shutdown: false,
                }),
                work: Condvar::new(),
                capacity: Condvar::new(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Threads started so far.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers.len()
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        while state.in_flight >= self.size && !state.shutdown {
            self.shared.capacity.wait(&mut state);
        }
        if state.shutdown {
            return Err(PoolError::ShutDown(self.label.clone()));
        }

        if state.workers.len() < self.size {
            let shared = Arc::clone(&self.shared);
            let name = format!("{}-{}", self.label, state.workers.len() + 1);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&shared, job));
            match spawned {
                Ok(handle) => {
                    debug!(thread = %name, "started worker");
                    state.workers.push(handle);
                }
                Err(e) => {
                    return Err(PoolError::Spawn {
                        pool: self.label.clone(),
                        message: e.to_string(),
                    });
                }
            }
        } else {
            state.queue.push_back(job);
            self.shared.work.notify_one();
        }
        state.in_flight += 1;
        Ok(())
    }

    fn shutdown(&self) {
        let workers = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work.notify_all();
            self.shared.capacity.notify_all();
            std::mem::take(&mut state.workers)
        };
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.label, "worker thread panicked");
            }
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared, first: Job) {
    let mut job = first;
    loop {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            warn!(panic = %panic_message(payload.as_ref()), "job panicked");
        }
        let mut state = shared.state.lock();
        state.in_flight -= 1;
        shared.capacity.notify_all();
        job = loop {
            if let Some(next) = state.queue.pop_front() {
                break next;
            }
            if state.shutdown {
                return;
            }
            shared.work.wait(&mut state);
        };
    }
}
