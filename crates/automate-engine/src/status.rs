//! Status objects: sensors and actuators
//!
//! A status change goes through two phases. The request phase runs on the
//! caller's thread: it coerces the value, consults the safety and change
//! delays under the object's status lock and either enqueues an apply task or
//! arms a timer that will enqueue one later. The apply phase runs only on the
//! worker queue; it is the single place where the current status is written,
//! history is recorded and listeners are notified.
//!
//! A newer request always supersedes an older one: the pending timer is
//! aborted and the queued apply task is cancelled before the new decision is
//! made.

use automate_core::events::StatusChangedData;
use automate_core::sync::{lock, read, write};
use automate_core::{
    DelayMode, Direction, History, HistoryEntry, ObjectId, ObjectName, ProgramId, Value,
    ValueKind,
};
use automate_worker::TaskHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::actuator::Arbitration;
use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::program::Program;

/// Log a delay-machine decision at `info` for objects with `debug` set,
/// `debug` otherwise
macro_rules! decision {
    ($debug:expr, $($arg:tt)+) => {
        if $debug {
            ::tracing::info!($($arg)+)
        } else {
            ::tracing::debug!($($arg)+)
        }
    };
}
pub(crate) use decision;

/// Whether an object is driven from outside or arbitrated between programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Sensor,
    Actuator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sensor => f.write_str("sensor"),
            Role::Actuator => f.write_str("actuator"),
        }
    }
}

/// Tunable behaviour of a status object
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSettings {
    /// Minimum dwell time between committed changes
    pub safety_delay: Duration,
    pub safety_mode: DelayMode,
    /// How long a new value must persist before it is committed
    pub change_delay: Duration,
    pub change_mode: DelayMode,
    /// Do not log committed changes at `info`
    pub silent: bool,
    /// Log delay decisions at `info`
    pub debug: bool,
    pub description: String,
    pub tags: Vec<String>,
    /// Sensors only: numeric requests are clipped into this range
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
    /// Sensors only: return to the default this long after a non-default set
    pub reset_delay: Duration,
}

/// A committed (or force-refreshed) status, as seen by listeners
#[derive(Clone)]
pub struct StatusChange {
    pub object: Arc<StatusObject>,
    pub old: Value,
    pub new: Value,
    /// False when a forced request re-committed the current value
    pub changed: bool,
}

impl fmt::Debug for StatusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusChange")
            .field("object", &self.object.name())
            .field("old", &self.old)
            .field("new", &self.new)
            .field("changed", &self.changed)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub type Listener = Arc<dyn Fn(&StatusChange) + Send + Sync>;

/// Driver callback run on the worker thread after a change commits
pub trait StatusHook: Send + Sync {
    fn status_changed(&self, object: &StatusObject, old: &Value, new: &Value);
}

impl<F> StatusHook for F
where
    F: Fn(&StatusObject, &Value, &Value) + Send + Sync,
{
    fn status_changed(&self, object: &StatusObject, old: &Value, new: &Value) {
        self(object, old, new)
    }
}

struct PendingTimer {
    abort: Option<AbortHandle>,
    fires_at: DateTime<Utc>,
}

/// Everything guarded by the status lock
struct StatusState {
    current: Value,
    history: History,
    timer: Option<PendingTimer>,
    timer_generation: u64,
    pending_task: Option<TaskHandle>,
    apply_token: u64,
    last_changed: Option<Instant>,
    change_started: Option<Instant>,
    reset_timer: Option<AbortHandle>,
}

/// A sensor or an actuator
pub struct StatusObject {
    id: ObjectId,
    name: ObjectName,
    role: Role,
    kind: ValueKind,
    default: Value,
    slave: bool,
    ctx: Weak<Context>,
    self_ref: Weak<StatusObject>,
    settings: RwLock<ObjectSettings>,
    state: Mutex<StatusState>,
    pub(crate) arbitration: Mutex<Arbitration>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    hook: RwLock<Option<Arc<dyn StatusHook>>>,
}

impl StatusObject {
    pub(crate) fn new(
        ctx: &Arc<Context>,
        name: ObjectName,
        role: Role,
        kind: ValueKind,
        default: Option<Value>,
        slave: bool,
        settings: ObjectSettings,
    ) -> EngineResult<Arc<Self>> {
        let default = match default {
            Some(value) => kind.coerce(value).map_err(|source| EngineError::Validation {
                object: name.to_string(),
                source,
            })?,
            None => kind.initial(),
        };
        let history = History::new(
            ctx.settings.history_capacity,
            ctx.settings.history_min_interval,
        );

        Ok(Arc::new_cyclic(|self_ref| Self {
            id: ctx.sequence.next_object_id(),
            name,
            role,
            kind,
            default: default.clone(),
            slave,
            ctx: Arc::downgrade(ctx),
            self_ref: self_ref.clone(),
            settings: RwLock::new(settings),
            state: Mutex::new(StatusState {
                current: default,
                history,
                timer: None,
                timer_generation: 0,
                pending_task: None,
                apply_token: 0,
                last_changed: None,
                change_started: None,
                reset_timer: None,
            }),
            arbitration: Mutex::new(Arbitration::default()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            hook: RwLock::new(None),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn object_name(&self) -> &ObjectName {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_sensor(&self) -> bool {
        self.role == Role::Sensor
    }

    pub fn is_actuator(&self) -> bool {
        self.role == Role::Actuator
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// Slave actuators accept changes from anyone and skip arbitration
    pub fn is_slave(&self) -> bool {
        self.slave
    }

    pub(crate) fn is_arbitrated(&self) -> bool {
        self.role == Role::Actuator && !self.slave
    }

    /// Latest committed status
    pub fn status(&self) -> Value {
        lock(&self.state).current.clone()
    }

    /// True while a delayed change is armed or an apply is queued
    pub fn changing(&self) -> bool {
        let st = lock(&self.state);
        st.timer.is_some() || st.pending_task.as_ref().is_some_and(TaskHandle::is_pending)
    }

    /// When the armed delayed change will fire
    pub fn next_scheduled_action(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).timer.as_ref().map(|t| t.fires_at)
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        lock(&self.state).history.entries()
    }

    pub fn settings(&self) -> ObjectSettings {
        read(&self.settings).clone()
    }

    /// Adjust timing and logging behaviour at runtime
    pub fn configure(&self, f: impl FnOnce(&mut ObjectSettings)) {
        f(&mut write(&self.settings));
    }

    pub fn description(&self) -> String {
        read(&self.settings).description.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        read(&self.settings).tags.clone()
    }

    pub(crate) fn context(&self) -> EngineResult<Arc<Context>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| EngineError::NotReady(format!("{} has no running system", self.name)))
    }

    fn arc(&self) -> Option<Arc<StatusObject>> {
        self.self_ref.upgrade()
    }

    /// Request a new status from any thread (sensors and slave actuators)
    pub fn set_status(&self, value: impl Into<Value>) -> EngineResult<()> {
        self.request_status(value.into(), None, false)
    }

    /// Like [`set_status`](Self::set_status) but notifies listeners even when
    /// the value is unchanged
    pub fn force_status(&self, value: impl Into<Value>) -> EngineResult<()> {
        self.request_status(value.into(), None, true)
    }

    /// Request a new status on behalf of `origin`
    ///
    /// Values that cannot be coerced to the object's kind are logged and
    /// dropped; they never surface as an error. Non-slave actuators reject
    /// origins that are not in their program stack with
    /// [`EngineError::Unauthorized`].
    pub fn request_status(
        &self,
        value: Value,
        origin: Option<&Program>,
        force: bool,
    ) -> EngineResult<()> {
        let Some(value) = self.prepare(value) else {
            return Ok(());
        };
        match self.role {
            Role::Sensor => {
                self.arm_reset(&value);
                self.request(value, force, None)
            }
            Role::Actuator if self.slave => self.request(value, force, None),
            Role::Actuator => self.arbitrated_set(value, origin, force),
        }
    }

    /// Clip and coerce an incoming value
    fn prepare(&self, value: Value) -> Option<Value> {
        let value = if self.is_sensor() {
            self.clip(value)
        } else {
            value
        };
        match self.kind.coerce(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(object = %self.name, error = %e, "Dropping invalid status");
                None
            }
        }
    }

    fn clip(&self, value: Value) -> Value {
        let (min, max) = {
            let s = read(&self.settings);
            (s.value_min, s.value_max)
        };
        let Some(x) = value.as_f64().filter(|_| !matches!(value, Value::Bool(_))) else {
            return value;
        };
        let clipped = match (min, max) {
            (Some(lo), _) if x < lo => lo,
            (_, Some(hi)) if x > hi => hi,
            _ => return value,
        };
        trace!(object = %self.name, from = x, to = clipped, "Clipping status");
        Value::Float(clipped)
    }

    fn arm_reset(&self, value: &Value) {
        let delay = read(&self.settings).reset_delay;
        if delay.is_zero() || *value == self.default {
            return;
        }
        let Ok(ctx) = self.context() else {
            return;
        };
        let weak = self.self_ref.clone();
        let default = self.default.clone();
        let timer = ctx.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(obj) = weak.upgrade() {
                debug!(object = %obj.name, "Reset delay elapsed");
                if let Err(e) = obj.set_status(default) {
                    warn!(object = %obj.name, error = %e, "Reset to default failed");
                }
            }
        });
        if let Some(previous) = std::mem::replace(&mut lock(&self.state).reset_timer, timer) {
            previous.abort();
        }
    }

    /// The delay state machine
    ///
    /// `origin` is the stack top the request was made for; it is re-checked
    /// when the apply runs.
    pub(crate) fn request(
        &self,
        value: Value,
        force: bool,
        origin: Option<ProgramId>,
    ) -> EngineResult<()> {
        let ctx = self.context()?;
        let settings = self.settings();
        let dbg = settings.debug;
        let mut st = lock(&self.state);
        let now = Instant::now();

        decision!(dbg, object = %self.name, value = %value, force, "Status change requested");

        if let Some(timer) = st.timer.take() {
            decision!(dbg, object = %self.name, "Cancelling pending delayed change");
            if let Some(abort) = timer.abort {
                abort.abort();
            }
        }
        if let Some(task) = st.pending_task.take() {
            task.cancel();
        }

        let started = *st.change_started.get_or_insert(now);
        if value == st.current && !force {
            st.change_started = None;
            decision!(dbg, object = %self.name, value = %value, "Status unchanged");
            return Ok(());
        }

        let direction = Direction::of_change(&st.current, &value);
        let safety = Some(settings.safety_delay)
            .filter(|d| !d.is_zero() && settings.safety_mode.applies_to(direction));
        let change = Some(settings.change_delay)
            .filter(|d| !d.is_zero() && settings.change_mode.applies_to(direction));

        if safety.is_none() && change.is_none() {
            self.enqueue_apply(&ctx, &mut st, value, origin);
            return Ok(());
        }

        let change_remaining = match change {
            Some(delay) => match delay.checked_sub(now.duration_since(started)) {
                Some(remaining) => remaining,
                // A burst older than the delay never committed: start over
                None => {
                    st.change_started = Some(now);
                    delay
                }
            },
            None => Duration::ZERO,
        };
        let since_last = st.last_changed.map(|t| now.duration_since(t));
        let (safety_ok, safety_remaining) = match (safety, since_last) {
            (Some(delay), Some(elapsed)) => {
                (elapsed > delay, delay.saturating_sub(elapsed))
            }
            _ => (true, Duration::ZERO),
        };

        if change_remaining.is_zero() && safety_ok {
            self.enqueue_apply(&ctx, &mut st, value, origin);
        } else {
            let delay = safety_remaining.max(change_remaining);
            decision!(
                dbg,
                object = %self.name,
                value = %value,
                delay_ms = delay.as_millis() as u64,
                "Scheduling delayed status change"
            );
            self.schedule(&ctx, &mut st, delay, value, force, origin);
        }
        Ok(())
    }

    fn schedule(
        &self,
        ctx: &Context,
        st: &mut StatusState,
        delay: Duration,
        value: Value,
        force: bool,
        origin: Option<ProgramId>,
    ) {
        st.timer_generation += 1;
        let generation = st.timer_generation;
        let weak = self.self_ref.clone();
        let fires_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let abort = ctx.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(obj) = weak.upgrade() {
                obj.timer_fired(generation, value, force, origin);
            }
        });
        st.timer = Some(PendingTimer { abort, fires_at });
    }

    fn timer_fired(&self, generation: u64, value: Value, force: bool, origin: Option<ProgramId>) {
        let Ok(ctx) = self.context() else {
            return;
        };
        let mut st = lock(&self.state);
        if st.timer_generation != generation || st.timer.is_none() {
            return;
        }
        st.timer = None;
        if force || value != st.current {
            self.enqueue_apply(&ctx, &mut st, value, origin);
        } else {
            st.change_started = None;
            trace!(object = %self.name, "Delayed change already in effect");
        }
    }

    fn enqueue_apply(
        &self,
        ctx: &Context,
        st: &mut StatusState,
        value: Value,
        origin: Option<ProgramId>,
    ) {
        let Some(obj) = self.arc() else {
            return;
        };
        if ctx.is_stopping() {
            trace!(object = %self.name, value = %value, "System stopping, change dropped");
            return;
        }
        st.apply_token += 1;
        let token = st.apply_token;
        let label = format!("apply {} = {}", self.name, value);
        match ctx.worker.put(label, move || obj.apply_real(value, origin, token)) {
            Ok(handle) => st.pending_task = Some(handle),
            Err(e) => warn!(object = %self.name, error = %e, "Cannot queue status change"),
        }
    }

    /// Commit a status; runs on the worker thread only
    fn apply_real(&self, value: Value, origin: Option<ProgramId>, token: u64) {
        let program = if self.is_arbitrated() {
            let arb = lock(&self.arbitration);
            let top = arb.top();
            if top.map(|e| e.program) != origin {
                debug!(
                    object = %self.name,
                    value = %value,
                    "Controlling program changed, dropping stale change"
                );
                drop(arb);
                self.clear_pending(token);
                return;
            }
            top.map(|e| e.name.clone())
        } else {
            None
        };

        let settings = self.settings();
        let (old, changed) = {
            let mut st = lock(&self.state);
            if st.apply_token == token {
                st.pending_task = None;
            }
            st.change_started = None;
            st.last_changed = Some(Instant::now());
            let old = st.current.clone();
            let changed = old != value;
            if changed {
                st.history.record(Utc::now(), value.clone());
                st.current = value.clone();
            }
            (old, changed)
        };

        if changed {
            if settings.silent {
                debug!(object = %self.name, value = %value, program = ?program, "Status changed");
            } else {
                info!(object = %self.name, value = %value, program = ?program, "Status changed");
            }
            let hook = read(&self.hook).clone();
            if let Some(hook) = hook {
                hook.status_changed(self, &old, &value);
            }
        } else {
            decision!(settings.debug, object = %self.name, value = %value, "Forced refresh");
        }

        if let Some(obj) = self.arc() {
            self.notify(&StatusChange {
                object: obj,
                old: old.clone(),
                new: value.clone(),
                changed,
            });
        }

        if let Ok(ctx) = self.context() {
            ctx.bus.fire_typed(StatusChangedData {
                object: self.name.to_string(),
                old,
                new: value,
                program,
            });
        }
    }

    fn clear_pending(&self, token: u64) {
        let mut st = lock(&self.state);
        if st.apply_token == token {
            st.pending_task = None;
            st.change_started = None;
        }
    }

    fn notify(&self, change: &StatusChange) {
        let listeners: Vec<Listener> = read(&self.listeners)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(change);
        }
    }

    /// Subscribe to committed changes; listeners run on the worker thread
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        write(&self.listeners).push((id, Arc::new(listener)));
        trace!(object = %self.name, listener = id.0, "Listener added");
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = write(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        read(&self.listeners).len()
    }

    /// Install the driver callback for committed changes
    pub fn set_hook(&self, hook: impl StatusHook + 'static) {
        *write(&self.hook) = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self) {
        *write(&self.hook) = None;
    }

    /// Abort timers and queued work; used on teardown
    pub(crate) fn cancel_pending(&self) {
        let mut st = lock(&self.state);
        if let Some(timer) = st.timer.take() {
            if let Some(abort) = timer.abort {
                abort.abort();
            }
        }
        if let Some(reset) = st.reset_timer.take() {
            reset.abort();
        }
        if let Some(task) = st.pending_task.take() {
            task.cancel();
        }
    }
}

impl fmt::Debug for StatusObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusObject")
            .field("name", &self.name.as_str())
            .field("role", &self.role)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for StatusObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_str())
    }
}
