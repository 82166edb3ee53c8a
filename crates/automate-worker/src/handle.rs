use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const DONE: u8 = 3;

/// Handle to a task submitted to the worker queue
///
/// Cancelling is best effort: a task that already started runs to the end.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    state: Arc<AtomicU8>,
}

impl TaskHandle {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            state: Arc::new(AtomicU8::new(QUEUED)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Prevent the task from running if it has not started yet
    pub fn cancel(&self) {
        let _ = self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// True once the task has run, successfully or not
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::SeqCst) == DONE
    }

    /// Queued and neither cancelled nor finished
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == QUEUED
    }

    /// Claim the task for execution; false if it was cancelled first
    pub(crate) fn begin(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn mark_done(&self) {
        self.state.store(DONE, Ordering::SeqCst);
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskHandle {}
