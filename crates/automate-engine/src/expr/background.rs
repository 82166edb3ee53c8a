//! Background work of `delay`, `threaded`, `wait_until` and `while`
//!
//! Work is keyed by the calling program. While a caller has work outstanding
//! on a node, evaluating that node again for the same caller does nothing.
//! [`Expr::cancel`] is the only way to tear work down early; every unit of
//! work checks its cancel flag before each further step.

use automate_core::sync::lock;
use automate_core::{ProgramId, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use super::{EvalContext, Expr, Operand};
use crate::config::parse_duration;
use crate::error::{EvalError, EvalResult};
use crate::program::Program;
use crate::status::{ListenerId, StatusChange, StatusObject};

pub(crate) struct CallerState {
    generation: u64,
    cancelled: Arc<AtomicBool>,
    timer: Option<AbortHandle>,
    listeners: Vec<(Arc<StatusObject>, ListenerId)>,
}

impl CallerState {
    fn teardown(self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(timer) = self.timer {
            timer.abort();
        }
        for (object, id) in self.listeners {
            object.remove_listener(id);
        }
    }
}

/// Turn an evaluated operand into a duration: seconds or `HH:MM:SS`
pub(super) fn duration_of(value: &Value) -> EvalResult<Duration> {
    match value {
        Value::Str(s) => parse_duration(s).map_err(EvalError::Duration),
        other => {
            let secs = other.number()?;
            Duration::try_from_secs_f64(secs).map_err(|e| EvalError::Duration(e.to_string()))
        }
    }
}

impl Expr {
    /// Register work for `caller`; `None` if it already has some
    fn begin(&self, caller: ProgramId) -> Option<(u64, Arc<AtomicBool>)> {
        let mut callers = lock(&self.callers);
        if callers.contains_key(&caller) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        callers.insert(
            caller,
            CallerState {
                generation,
                cancelled: cancelled.clone(),
                timer: None,
                listeners: Vec::new(),
            },
        );
        Some((generation, cancelled))
    }

    /// Drop the work record if it still belongs to `generation`
    ///
    /// Returns whether this call removed it.
    fn finish(&self, caller: ProgramId, generation: u64) -> bool {
        let state = {
            let mut callers = lock(&self.callers);
            match callers.get(&caller) {
                Some(s) if s.generation == generation => callers.remove(&caller),
                _ => None,
            }
        };
        match state {
            Some(state) => {
                for (object, id) in state.listeners {
                    object.remove_listener(id);
                }
                true
            }
            None => false,
        }
    }

    fn store_timer(&self, caller: ProgramId, generation: u64, timer: Option<AbortHandle>) {
        let mut callers = lock(&self.callers);
        match callers.get_mut(&caller) {
            Some(s) if s.generation == generation => s.timer = timer,
            // Already finished or cancelled
            _ => {
                if let Some(timer) = timer {
                    timer.abort();
                }
            }
        }
    }

    fn store_listener(
        &self,
        caller: ProgramId,
        generation: u64,
        object: Arc<StatusObject>,
        id: ListenerId,
    ) {
        let mut callers = lock(&self.callers);
        match callers.get_mut(&caller) {
            Some(s) if s.generation == generation => s.listeners.push((object, id)),
            _ => {
                drop(callers);
                object.remove_listener(id);
            }
        }
    }

    /// True while `caller` has background work on this node
    pub fn has_outstanding(&self, caller: ProgramId) -> bool {
        lock(&self.callers).contains_key(&caller)
    }

    /// Tear down `caller`'s work on this node and on every child node
    pub fn cancel(&self, caller: ProgramId) {
        let state = lock(&self.callers).remove(&caller);
        if let Some(state) = state {
            debug!(expr = %self, program = %caller, "Cancelling background work");
            state.teardown();
        }
        for child in self.child_exprs() {
            child.cancel(caller);
        }
    }

    fn run_actions(&self, actions: &[Operand], cx: &EvalContext, cancelled: &AtomicBool) -> bool {
        for action in actions {
            if cancelled.load(Ordering::Acquire) {
                return false;
            }
            if let Err(e) = self.eval_operand(action, cx) {
                warn!(expr = %self, action = %action, error = %e, "Background action failed");
            }
        }
        true
    }

    pub(super) fn run_delay(
        &self,
        args: &[Operand],
        cx: &EvalContext,
        caller: &Arc<Program>,
    ) -> EvalResult<Value> {
        let ctx = self.context()?;
        let (delay, actions) = if self.kind == super::ExprKind::Threaded {
            (Duration::ZERO, args.to_vec())
        } else {
            let Some((first, rest)) = args.split_first() else {
                return Err(EvalError::Arity {
                    kind: self.kind.name(),
                    expected: "at least 1",
                    got: 0,
                });
            };
            (duration_of(&self.eval_operand(first, cx)?)?, rest.to_vec())
        };

        let Some((generation, cancelled)) = self.begin(caller.id()) else {
            trace!(expr = %self, program = %caller.name(), "Already scheduled");
            return Ok(Value::Bool(true));
        };
        info!(
            expr = %self,
            program = %caller.name(),
            delay_ms = delay.as_millis() as u64,
            "Scheduling delayed actions"
        );

        let weak_ctx = Arc::downgrade(&ctx);
        let weak_self = self.self_ref.clone();
        let weak_caller = Arc::downgrade(caller);
        let trigger = cx.trigger.clone();
        let timer = ctx.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(ctx) = weak_ctx.upgrade() else {
                return;
            };
            ctx.spawn_blocking(move || {
                let (Some(expr), Some(caller)) = (weak_self.upgrade(), weak_caller.upgrade())
                else {
                    return;
                };
                debug!(expr = %expr, program = %caller.name(), "Time is up, running actions");
                let cx = EvalContext::new(Some(caller.clone()), trigger);
                expr.run_actions(&actions, &cx, &cancelled);
                expr.finish(caller.id(), generation);
            });
        });
        if timer.is_none() {
            self.finish(caller.id(), generation);
        }
        self.store_timer(caller.id(), generation, timer);
        Ok(Value::Bool(true))
    }

    pub(super) fn run_wait_until(
        &self,
        args: &[Operand],
        cx: &EvalContext,
        caller: &Arc<Program>,
    ) -> EvalResult<Value> {
        let Some((watched, actions)) = args.split_first() else {
            return Err(EvalError::Arity {
                kind: self.kind.name(),
                expected: "at least 1",
                got: 0,
            });
        };
        if self.eval_operand(watched, cx)?.is_truthy() {
            trace!(expr = %self, "Condition already holds, running directly");
            self.run_actions(actions, cx, &AtomicBool::new(false));
            return Ok(Value::Bool(true));
        }

        let objects = match watched {
            Operand::Expr(e) => e.triggers()?,
            other => self.objects_of(other, cx)?,
        };
        if objects.is_empty() {
            warn!(expr = %self, "Nothing to wait for");
            return Ok(Value::Bool(false));
        }
        let Some((generation, cancelled)) = self.begin(caller.id()) else {
            return Ok(Value::Bool(true));
        };

        let weak_self = self.self_ref.clone();
        let weak_caller = Arc::downgrade(caller);
        let watched = watched.clone();
        let actions = actions.to_vec();
        let trigger = cx.trigger.clone();
        let check: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if cancelled.load(Ordering::Acquire) {
                return;
            }
            let (Some(expr), Some(caller)) = (weak_self.upgrade(), weak_caller.upgrade()) else {
                return;
            };
            let cx = EvalContext::new(Some(caller.clone()), trigger.clone());
            match expr.eval_operand(&watched, &cx) {
                Ok(v) if v.is_truthy() => {}
                Ok(_) => return,
                Err(e) => {
                    warn!(expr = %expr, error = %e, "Cannot evaluate wait condition");
                    return;
                }
            }
            // Several listeners may see the condition turn true; one runs
            if !expr.finish(caller.id(), generation) {
                return;
            }
            let Ok(ctx) = expr.context() else {
                return;
            };
            let actions = actions.clone();
            let spawned = ctx.spawn_blocking(move || {
                debug!(expr = %expr, program = %caller.name(), "Wait is over, running actions");
                expr.run_actions(&actions, &cx, &AtomicBool::new(false));
            });
            if !spawned {
                debug!("System stopping, wait_until actions dropped");
            }
        });

        for object in objects {
            let check = check.clone();
            let id = object.add_listener(move |_: &StatusChange| check());
            self.store_listener(caller.id(), generation, object, id);
        }
        // The condition may have turned true while subscribing
        check();
        Ok(Value::Bool(true))
    }

    pub(super) fn run_while(
        &self,
        args: &[Operand],
        cx: &EvalContext,
        caller: &Arc<Program>,
    ) -> EvalResult<Value> {
        let ctx = self.context()?;
        let Some((condition, actions)) = args.split_first() else {
            return Err(EvalError::Arity {
                kind: self.kind.name(),
                expected: "at least 1",
                got: 0,
            });
        };
        let Some((generation, cancelled)) = self.begin(caller.id()) else {
            return Ok(Value::Bool(true));
        };

        let weak_self: Weak<Expr> = self.self_ref.clone();
        let weak_caller = Arc::downgrade(caller);
        let condition = condition.clone();
        let actions = actions.to_vec();
        let do_after = self.kwarg("do_after");
        let trigger = cx.trigger.clone();
        let spawned = ctx.spawn_blocking(move || {
            let (Some(expr), Some(caller)) = (weak_self.upgrade(), weak_caller.upgrade()) else {
                return;
            };
            let Ok(ctx) = expr.context() else {
                return;
            };
            let cx = EvalContext::new(Some(caller.clone()), trigger);
            ctx.worker.flush();
            loop {
                if cancelled.load(Ordering::Acquire) {
                    debug!(expr = %expr, "Loop cancelled");
                    break;
                }
                match expr.eval_operand(&condition, &cx) {
                    Ok(v) if v.is_truthy() => {}
                    Ok(_) => {
                        if let Some(after) = &do_after {
                            expr.run_actions(std::slice::from_ref(after), &cx, &cancelled);
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(expr = %expr, error = %e, "Loop condition failed");
                        break;
                    }
                }
                if !expr.run_actions(&actions, &cx, &cancelled) {
                    debug!(expr = %expr, "Loop cancelled");
                    break;
                }
                ctx.worker.flush();
            }
            expr.finish(caller.id(), generation);
        });
        if !spawned {
            self.finish(caller.id(), generation);
        }
        Ok(Value::Bool(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_of_numbers_and_strings() {
        assert_eq!(duration_of(&Value::Int(2)).unwrap(), Duration::from_secs(2));
        assert_eq!(
            duration_of(&Value::Float(0.25)).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            duration_of(&Value::Str("01:00:05".into())).unwrap(),
            Duration::from_secs(3605)
        );
        assert!(duration_of(&Value::Int(-1)).is_err());
        assert!(duration_of(&Value::Str("soon".into())).is_err());
    }
}
