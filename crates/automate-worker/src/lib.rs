//! The Automate worker queue
//!
//! Every real status mutation runs here, on one dedicated thread, in the order
//! it was submitted. Callers enqueue without blocking; code that needs
//! read-after-write consistency calls [`WorkerQueue::flush`].
//!
//! A task that returns an error or panics is logged and skipped. The loop
//! keeps going.

mod handle;

pub use handle::TaskHandle;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Errors from the worker queue
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker queue has been stopped")]
    Stopped,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Error a task may return; it is logged by the worker
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Job = Box<dyn FnOnce() -> Result<(), TaskError> + Send + 'static>;

struct Task {
    handle: TaskHandle,
    label: String,
    job: Job,
}

enum Message {
    Run(Task),
    Stop,
}

/// Count of submitted but not yet finished tasks
struct Pending {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Pending {
    fn increment(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .drained
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn get(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Single-threaded ordered executor for status mutations
pub struct WorkerQueue {
    sender: mpsc::UnboundedSender<Message>,
    pending: Arc<Pending>,
    next_task_id: AtomicU64,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerQueue {
    /// Spawn the worker thread
    pub fn start() -> WorkerResult<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            drained: Condvar::new(),
        });

        let loop_pending = pending.clone();
        let join = thread::Builder::new()
            .name("automate-worker".to_string())
            .spawn(move || run_loop(receiver, loop_pending))?;
        let thread_id = join.thread().id();

        debug!("Worker queue started");
        Ok(Self {
            sender,
            pending,
            next_task_id: AtomicU64::new(1),
            thread_id,
            join: Mutex::new(Some(join)),
        })
    }

    /// Enqueue a task, returning a handle that can cancel it before it runs
    pub fn submit<F>(&self, label: impl Into<String>, job: F) -> WorkerResult<TaskHandle>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        let handle = TaskHandle::new(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let task = Task {
            handle: handle.clone(),
            label: label.into(),
            job: Box::new(job),
        };
        trace!(task = handle.id(), label = %task.label, "Enqueueing task");

        self.pending.increment();
        if self.sender.send(Message::Run(task)).is_err() {
            self.pending.decrement();
            return Err(WorkerError::Stopped);
        }
        Ok(handle)
    }

    /// Enqueue an infallible task
    pub fn put<F>(&self, label: impl Into<String>, job: F) -> WorkerResult<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(label, move || {
            job();
            Ok(())
        })
    }

    /// Block until every task submitted so far, and every task those tasks
    /// submit in turn, has finished
    ///
    /// Calling this from the worker thread itself would wait forever, so it
    /// logs a warning and returns immediately instead.
    pub fn flush(&self) {
        if self.is_worker_thread() {
            warn!("flush() called from the worker thread; ignoring");
            return;
        }
        trace!(pending = self.pending.get(), "Flushing worker queue");
        self.pending.wait_drained();
    }

    /// Number of tasks submitted but not yet finished
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    /// True when called from the worker thread
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Drain the queue, then stop and join the worker thread
    ///
    /// Tasks submitted after this returns are rejected with
    /// [`WorkerError::Stopped`]. Calling `stop` twice is harmless.
    pub fn stop(&self) {
        let Some(join) = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        debug!("Stopping worker queue");
        self.flush();
        let _ = self.sender.send(Message::Stop);

        if self.is_worker_thread() {
            // The thread exits on its own once it sees the stop message
            return;
        }
        if join.join().is_err() {
            error!("Worker thread terminated abnormally");
        }
        debug!("Worker queue stopped");
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(mut receiver: mpsc::UnboundedReceiver<Message>, pending: Arc<Pending>) {
    debug!("Worker thread running");
    while let Some(message) = receiver.blocking_recv() {
        match message {
            Message::Run(task) => {
                run_task(task);
                pending.decrement();
            }
            Message::Stop => break,
        }
    }
    receiver.close();

    // Anything still queued is released so flushers cannot hang
    while let Ok(Message::Run(task)) = receiver.try_recv() {
        debug!(task = task.handle.id(), label = %task.label, "Dropping task after stop");
        pending.decrement();
    }
    debug!("Worker thread exiting");
}

fn run_task(task: Task) {
    let Task { handle, label, job } = task;
    if !handle.begin() {
        trace!(task = handle.id(), label = %label, "Task was cancelled before it ran");
        return;
    }

    trace!(task = handle.id(), label = %label, "Running task");
    match catch_unwind(AssertUnwindSafe(job)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(task = handle.id(), label = %label, error = %e, "Task failed"),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(task = handle.id(), label = %label, panic = %message, "Task panicked");
        }
    }
    handle.mark_done();
}
