//! Bounded single-consumer task queue.
//!
//! Every mutating operation of an asynchronous channel runs on the queue's
//! one worker thread, in submission order. That is what gives async writes
//! their ordering guarantee: a flush enqueued after N writes observes all N.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// A unit of work for the queue.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    running: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl QueueShared {
    fn run(&self) {
        loop {
            let task = {
                let mut state = self.state.lock();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break task;
                    }
                    if !state.running {
                        return;
                    }
                    self.available.wait(&mut state);
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                error!("write queue task panicked");
            }
        }
    }
}

/// A FIFO of [`Task`]s drained by one dedicated thread.
///
/// [`WriteQueue::enqueue`] never blocks: a full or stopped queue is reported
/// as back-pressure. [`WriteQueue::quit`] stops intake but lets the worker
/// finish every task already accepted.
pub struct WriteQueue {
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl WriteQueue {
    /// Starts a queue whose worker thread is called `name`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn start(name: &str, capacity: usize) -> CoreResult<Self> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                running: true,
            }),
            available: Condvar::new(),
            capacity,
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_shared.run())?;
        debug!(queue = name, capacity, "write queue started");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
            name: name.to_string(),
        })
    }

    /// Appends a task.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::QueueStopped`] after [`WriteQueue::quit`] and
    /// [`CoreError::QueueFull`] at capacity.
    pub fn enqueue(&self, task: Task) -> CoreResult<()> {
        let mut state = self.shared.state.lock();
        if !state.running {
            return Err(CoreError::QueueStopped);
        }
        if state.tasks.len() >= self.shared.capacity {
            return Err(CoreError::QueueFull {
                capacity: self.shared.capacity,
            });
        }
        state.tasks.push_back(task);
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Number of tasks waiting to run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    /// Returns `true` if no task is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue still accepts tasks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Stops accepting tasks. Already queued tasks still run.
    pub fn quit(&self) {
        self.shared.state.lock().running = false;
        self.shared.available.notify_all();
    }

    /// Quits and waits for the worker to drain the queue and exit.
    ///
    /// Does nothing when called from the worker thread itself.
    pub fn join(&self) {
        self.quit();
        let mut worker = self.worker.lock();
        let on_worker = worker
            .as_ref()
            .is_some_and(|handle| handle.thread().id() == thread::current().id());
        if on_worker {
            return;
        }
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!(queue = %self.name, "write queue worker panicked");
            }
            debug!(queue = %self.name, "write queue stopped");
        }
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.join();
    }
}

impl std::fmt::Debug for WriteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteQueue")
            .field("name", &self.name)
            .field("capacity", &self.shared.capacity)
            .field("pending", &self.len())
            .finish()
    }
}
