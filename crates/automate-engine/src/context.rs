//! Shared runtime pieces every object of one system talks to

use automate_core::Sequence;
use automate_event_bus::SharedEventBus;
use automate_worker::WorkerQueue;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::config::SystemSettings;
use crate::error::EngineResult;
use crate::registry::Registry;

/// Worker queue, timer runtime, event bus, registry and id sequence
///
/// Objects keep a `Weak` reference to this, so dropping the owning
/// [`System`](crate::System) tears the whole graph down.
pub(crate) struct Context {
    pub(crate) worker: WorkerQueue,
    pub(crate) bus: SharedEventBus,
    pub(crate) sequence: Sequence,
    pub(crate) registry: Registry,
    pub(crate) settings: SystemSettings,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    /// Bumped whenever an expression tree changes shape
    deps_epoch: AtomicU64,
    stopping: AtomicBool,
}

impl Context {
    pub(crate) fn new(settings: SystemSettings, bus: SharedEventBus) -> EngineResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.timer_threads.max(1))
            .thread_name("automate-timer")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        let worker = WorkerQueue::start()?;

        Ok(Self {
            worker,
            bus,
            sequence: Sequence::new(),
            registry: Registry::new(),
            settings,
            runtime: Mutex::new(Some(runtime)),
            handle,
            deps_epoch: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        })
    }

    /// Run a future on the timer runtime
    pub(crate) fn spawn<F>(&self, future: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_stopping() {
            return None;
        }
        Some(self.handle.spawn(future).abort_handle())
    }

    /// Run blocking work (expression actions) off the timer threads
    pub(crate) fn spawn_blocking<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_stopping() {
            return false;
        }
        drop(self.handle.spawn_blocking(f));
        true
    }

    pub(crate) fn deps_epoch(&self) -> u64 {
        self.deps_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate_deps(&self) {
        self.deps_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Stop accepting timers, drain the worker queue and stop it
    pub(crate) fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.worker.stop();
        let runtime = automate_core::sync::lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            // May run on a runtime thread, where a blocking shutdown would panic
            runtime.shutdown_background();
        }
        debug!("System context stopped");
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop();
    }
}
