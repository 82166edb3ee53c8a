//! Programs: reactive rules
//!
//! A program has an active condition, an update condition and three actions
//! (on activate, on update, on deactivate). Its triggers are the objects its
//! conditions, on_activate and on_update read; its targets are the objects
//! its actions may change. Explicit trigger and target lists are added and
//! excluded triggers removed.
//!
//! Until a program is attached to a system its live conditions are
//! permanently false and its actions empty, so nothing runs while the graph
//! is still being wired. Attaching resolves names, installs the configured
//! expressions and subscribes to the triggers.
//!
//! Activation is level-triggered: after every trigger change and every
//! structural change the active condition is evaluated again.

use automate_core::events::{ProgramActivatedData, ProgramDeactivatedData};
use automate_core::sync::{lock, read, write};
use automate_core::{ObjectId, ObjectName, ProgramId, DEFAULT_PRIORITY};
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, instrument, trace, warn};

use crate::context::Context;
use crate::error::{EngineError, EngineResult};
use crate::expr::build::{empty, value};
use crate::expr::{EvalContext, Expr, ExprKind, Operand};
use crate::status::{ListenerId, StatusChange, StatusObject};

/// The five expressions of a program
#[derive(Clone, Debug)]
pub struct Conditions {
    pub active_condition: Arc<Expr>,
    pub update_condition: Arc<Expr>,
    pub on_activate: Arc<Expr>,
    pub on_update: Arc<Expr>,
    pub on_deactivate: Arc<Expr>,
}

impl Conditions {
    /// Never active, does nothing
    fn inert() -> Self {
        Self {
            active_condition: value(false),
            update_condition: value(false),
            on_activate: empty(),
            on_update: empty(),
            on_deactivate: empty(),
        }
    }

    fn all(&self) -> [&Arc<Expr>; 5] {
        [
            &self.active_condition,
            &self.update_condition,
            &self.on_activate,
            &self.on_update,
            &self.on_deactivate,
        ]
    }
}

impl Default for Conditions {
    fn default() -> Self {
        Self {
            active_condition: value(true),
            update_condition: value(true),
            on_activate: empty(),
            on_update: empty(),
            on_deactivate: empty(),
        }
    }
}

/// Builder for a program
#[derive(Clone)]
pub struct ProgramSpec {
    pub(crate) name: String,
    pub(crate) priority: f64,
    pub(crate) conditions: Conditions,
    pub(crate) triggers: Vec<Operand>,
    pub(crate) exclude_triggers: Vec<Operand>,
    pub(crate) targets: Vec<Operand>,
    pub(crate) description: String,
    pub(crate) tags: Vec<String>,
    pub(crate) silent: bool,
    pub(crate) debug: bool,
}

impl ProgramSpec {
    /// Always active, updates on every trigger, no actions
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            conditions: Conditions::default(),
            triggers: Vec::new(),
            exclude_triggers: Vec::new(),
            targets: Vec::new(),
            description: String::new(),
            tags: Vec::new(),
            silent: false,
            debug: false,
        }
    }

    pub fn priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn active_condition(mut self, condition: impl Into<Operand>) -> Self {
        self.conditions.active_condition = Expr::from_operand(condition);
        self
    }

    pub fn update_condition(mut self, condition: impl Into<Operand>) -> Self {
        self.conditions.update_condition = Expr::from_operand(condition);
        self
    }

    pub fn on_activate(mut self, action: impl Into<Operand>) -> Self {
        self.conditions.on_activate = Expr::from_operand(action);
        self
    }

    pub fn on_update(mut self, action: impl Into<Operand>) -> Self {
        self.conditions.on_update = Expr::from_operand(action);
        self
    }

    pub fn on_deactivate(mut self, action: impl Into<Operand>) -> Self {
        self.conditions.on_deactivate = Expr::from_operand(action);
        self
    }

    pub fn triggers<T: Into<Operand>>(mut self, triggers: Vec<T>) -> Self {
        self.triggers = triggers.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude_triggers<T: Into<Operand>>(mut self, exclude: Vec<T>) -> Self {
        self.exclude_triggers = exclude.into_iter().map(Into::into).collect();
        self
    }

    pub fn targets<T: Into<Operand>>(mut self, targets: Vec<T>) -> Self {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[derive(Debug, Clone, Default)]
struct ProgramMeta {
    description: String,
    tags: Vec<String>,
    silent: bool,
    debug: bool,
}

#[derive(Default)]
struct ExplicitDeps {
    triggers: Vec<Operand>,
    exclude_triggers: Vec<Operand>,
    targets: Vec<Operand>,
}

#[derive(Default)]
struct ProgramState {
    active: bool,
    attached: bool,
    triggers: IndexMap<ObjectId, (Arc<StatusObject>, ListenerId)>,
    targets: IndexMap<ObjectId, Arc<StatusObject>>,
}

type ObjectSet = IndexMap<ObjectId, Arc<StatusObject>>;

/// A reactive rule
pub struct Program {
    id: ProgramId,
    name: ObjectName,
    ctx: Weak<Context>,
    self_ref: Weak<Program>,
    priority: RwLock<f64>,
    meta: RwLock<ProgramMeta>,
    /// Live expressions
    exprs: RwLock<Conditions>,
    /// Configured expressions waiting for attach
    staged: Mutex<Option<Conditions>>,
    explicit: RwLock<ExplicitDeps>,
    state: Mutex<ProgramState>,
    /// Serialises trigger handling and dependency updates
    trigger_lock: Mutex<()>,
}

impl Program {
    pub(crate) fn new(ctx: &Arc<Context>, spec: ProgramSpec) -> EngineResult<Arc<Self>> {
        let name = ObjectName::new(spec.name)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            id: ctx.sequence.next_program_id(),
            name,
            ctx: Arc::downgrade(ctx),
            self_ref: self_ref.clone(),
            priority: RwLock::new(spec.priority),
            meta: RwLock::new(ProgramMeta {
                description: spec.description,
                tags: spec.tags,
                silent: spec.silent,
                debug: spec.debug,
            }),
            exprs: RwLock::new(Conditions::inert()),
            staged: Mutex::new(Some(spec.conditions)),
            explicit: RwLock::new(ExplicitDeps {
                triggers: spec.triggers,
                exclude_triggers: spec.exclude_triggers,
                targets: spec.targets,
            }),
            state: Mutex::new(ProgramState::default()),
            trigger_lock: Mutex::new(()),
        }))
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn object_name(&self) -> &ObjectName {
        &self.name
    }

    pub fn priority(&self) -> f64 {
        *read(&self.priority)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.state).attached
    }

    pub fn description(&self) -> String {
        read(&self.meta).description.clone()
    }

    pub fn tags(&self) -> Vec<String> {
        read(&self.meta).tags.clone()
    }

    pub fn is_silent(&self) -> bool {
        read(&self.meta).silent
    }

    pub fn is_debug(&self) -> bool {
        read(&self.meta).debug
    }

    /// Live expressions
    pub fn conditions(&self) -> Conditions {
        read(&self.exprs).clone()
    }

    /// Objects this program currently listens to
    pub fn actual_triggers(&self) -> Vec<Arc<StatusObject>> {
        lock(&self.state)
            .triggers
            .values()
            .map(|(o, _)| o.clone())
            .collect()
    }

    /// Objects this program may change
    pub fn actual_targets(&self) -> Vec<Arc<StatusObject>> {
        lock(&self.state).targets.values().cloned().collect()
    }

    fn context(&self) -> EngineResult<Arc<Context>> {
        self.ctx
            .upgrade()
            .ok_or_else(|| EngineError::NotReady(format!("{} has no running system", self.name)))
    }

    fn arc(&self) -> Option<Arc<Program>> {
        self.self_ref.upgrade()
    }

    /// Resolve names, install the configured expressions and subscribe
    #[instrument(skip(self), fields(program = %self.name))]
    pub(crate) fn attach(&self) -> EngineResult<()> {
        let ctx = self.context()?;
        {
            let mut explicit = write(&self.explicit);
            let ExplicitDeps {
                triggers,
                exclude_triggers,
                targets,
            } = &mut *explicit;
            for operand in triggers.iter_mut().chain(exclude_triggers).chain(targets) {
                if let Operand::Name(name) = operand {
                    if let Some(object) = ctx.registry.object(name) {
                        *operand = Operand::Object(object);
                    }
                }
            }
        }
        if let Some(staged) = lock(&self.staged).take() {
            for expr in staged.all() {
                expr.resolve(&ctx);
                expr.adopt(&self.self_ref);
            }
            *write(&self.exprs) = staged;
        }
        lock(&self.state).attached = true;
        debug!("Program attached");
        self.update_dependencies()
    }

    /// Withdraw from the system: unsubscribe, cancel background work and
    /// leave every target's program stack
    ///
    /// `on_deactivate` is not run.
    pub(crate) fn detach(&self) {
        let _guard = lock(&self.trigger_lock);
        let (triggers, targets, was_active) = {
            let mut st = lock(&self.state);
            st.attached = false;
            let was_active = std::mem::replace(&mut st.active, false);
            (
                std::mem::take(&mut st.triggers),
                std::mem::take(&mut st.targets),
                was_active,
            )
        };
        for (object, listener) in triggers.into_values() {
            object.remove_listener(listener);
        }
        for expr in read(&self.exprs).all() {
            expr.cancel(self.id);
        }
        if was_active {
            for target in targets.values() {
                target.deactivate_program(self.id);
            }
        }
        debug!(program = %self.name, "Program detached");
    }

    fn compute_dependencies(&self) -> EngineResult<(ObjectSet, ObjectSet)> {
        let ctx = self.context()?;
        let exprs = self.conditions();
        let explicit = read(&self.explicit);

        let mut triggers = ObjectSet::new();
        add_objects(&ctx, &explicit.triggers, &mut triggers);
        for expr in [
            &exprs.update_condition,
            &exprs.active_condition,
            &exprs.on_update,
            &exprs.on_activate,
        ] {
            for object in expr.triggers()? {
                triggers.entry(object.id()).or_insert(object);
            }
        }
        let mut excluded = ObjectSet::new();
        add_objects(&ctx, &explicit.exclude_triggers, &mut excluded);
        triggers.retain(|id, _| !excluded.contains_key(id));

        let mut targets = ObjectSet::new();
        add_objects(&ctx, &explicit.targets, &mut targets);
        for expr in [&exprs.on_update, &exprs.on_activate, &exprs.on_deactivate] {
            for object in expr.targets()? {
                targets.entry(object.id()).or_insert(object);
            }
        }
        Ok((triggers, targets))
    }

    /// Whether any of the program's expressions uses `kind`
    pub(crate) fn uses_kind(&self, kind: ExprKind) -> bool {
        read(&self.exprs).all().iter().any(|e| e.contains_kind(kind))
    }

    /// Recompute triggers and targets, resubscribe and re-evaluate activation
    pub fn update_dependencies(&self) -> EngineResult<()> {
        if !self.is_attached() {
            return Ok(());
        }
        let _guard = lock(&self.trigger_lock);
        let (triggers, targets) = self.compute_dependencies()?;

        let (removed_targets, added_targets) = {
            let mut st = lock(&self.state);

            let stale: Vec<ObjectId> = st
                .triggers
                .keys()
                .filter(|id| !triggers.contains_key(*id))
                .copied()
                .collect();
            for id in stale {
                if let Some((object, listener)) = st.triggers.shift_remove(&id) {
                    trace!(program = %self.name, trigger = %object.name(), "Removing trigger");
                    object.remove_listener(listener);
                }
            }
            for (id, object) in &triggers {
                if st.triggers.contains_key(id) {
                    continue;
                }
                trace!(program = %self.name, trigger = %object.name(), "Adding trigger");
                let weak = self.self_ref.clone();
                let listener = object.add_listener(move |change: &StatusChange| {
                    if let Some(program) = weak.upgrade() {
                        program.on_trigger(change);
                    }
                });
                st.triggers.insert(*id, (object.clone(), listener));
            }

            let removed: Vec<Arc<StatusObject>> = st
                .targets
                .iter()
                .filter(|(id, _)| !targets.contains_key(*id))
                .map(|(_, o)| o.clone())
                .collect();
            let added: Vec<Arc<StatusObject>> = targets
                .iter()
                .filter(|(id, _)| !st.targets.contains_key(*id))
                .map(|(_, o)| o.clone())
                .collect();
            st.targets = targets;
            (removed, added)
        };

        let was_active = self.is_active();
        let now_active = self.evaluate_active(None);
        if now_active != was_active {
            self.update_activation(now_active, None);
        } else if now_active {
            for target in &removed_targets {
                target.deactivate_program(self.id);
            }
            for target in &added_targets {
                target.activate_program(self);
            }
        }
        Ok(())
    }

    /// Handle a committed change of one of the triggers
    pub(crate) fn on_trigger(&self, change: &StatusChange) {
        let _guard = lock(&self.trigger_lock);
        if !self.is_attached() {
            return;
        }
        trace!(
            program = %self.name,
            trigger = %change.object.name(),
            old = %change.old,
            new = %change.new,
            "Trigger status changed"
        );
        let trigger = Some(change.object.clone());
        let was_active = self.is_active();
        let now_active = self.evaluate_active(trigger.clone());
        if now_active != was_active {
            self.update_activation(now_active, trigger);
        } else if now_active {
            self.maybe_update(trigger);
        }
    }

    fn eval_cx(&self, trigger: Option<Arc<StatusObject>>) -> EvalContext {
        EvalContext::new(self.arc(), trigger)
    }

    /// Evaluate the active condition; errors keep the current state
    fn evaluate_active(&self, trigger: Option<Arc<StatusObject>>) -> bool {
        let condition = read(&self.exprs).active_condition.clone();
        match condition.evaluate(&self.eval_cx(trigger)) {
            Ok(v) => v.is_truthy(),
            Err(e) => {
                warn!(program = %self.name, error = %e, "Cannot evaluate active condition");
                self.is_active()
            }
        }
    }

    fn evaluate_update(&self, trigger: Option<Arc<StatusObject>>) -> bool {
        let condition = read(&self.exprs).update_condition.clone();
        match condition.evaluate(&self.eval_cx(trigger)) {
            Ok(v) => v.is_truthy(),
            Err(e) => {
                warn!(program = %self.name, error = %e, "Cannot evaluate update condition");
                false
            }
        }
    }

    fn run_action(&self, action: &Arc<Expr>, what: &str, trigger: Option<Arc<StatusObject>>) {
        if let Err(e) = action.evaluate(&self.eval_cx(trigger)) {
            warn!(program = %self.name, action = what, error = %e, "Action failed");
        }
    }

    /// Restart on_update if the update condition holds
    fn maybe_update(&self, trigger: Option<Arc<StatusObject>>) {
        if self.evaluate_update(trigger.clone()) {
            let on_update = read(&self.exprs).on_update.clone();
            on_update.cancel(self.id);
            self.run_action(&on_update, "on_update", trigger);
        }
    }

    fn update_activation(&self, active: bool, trigger: Option<Arc<StatusObject>>) {
        let targets = {
            let mut st = lock(&self.state);
            st.active = active;
            st.targets.values().cloned().collect::<Vec<_>>()
        };
        let trigger_name = trigger.as_ref().map(|t| t.name().to_string());
        if self.is_silent() {
            debug!(program = %self.name, active, trigger = ?trigger_name, "Program activation changed");
        } else {
            info!(program = %self.name, active, trigger = ?trigger_name, "Program activation changed");
        }

        let exprs = self.conditions();
        if active {
            for target in &targets {
                target.activate_program(self);
            }
            self.run_action(&exprs.on_activate, "on_activate", trigger.clone());
            self.maybe_update(trigger);
        } else {
            self.run_action(&exprs.on_deactivate, "on_deactivate", trigger);
            exprs.on_update.cancel(self.id);
            exprs.on_activate.cancel(self.id);
            for target in &targets {
                target.deactivate_program(self.id);
            }
        }

        if let Ok(ctx) = self.context() {
            let program = self.name.to_string();
            if active {
                ctx.bus.fire_typed(ProgramActivatedData {
                    program,
                    trigger: trigger_name,
                });
            } else {
                ctx.bus.fire_typed(ProgramDeactivatedData {
                    program,
                    trigger: trigger_name,
                });
            }
        }
    }

    /// Swap one expression, resolving it first if already attached
    ///
    /// Returns the replaced expression.
    fn replace_expr(
        &self,
        expr: Arc<Expr>,
        slot: impl FnOnce(&mut Conditions) -> &mut Arc<Expr>,
    ) -> Option<Arc<Expr>> {
        let mut staged = lock(&self.staged);
        if let Some(pending) = staged.as_mut() {
            *slot(pending) = expr;
            return None;
        }
        drop(staged);
        if let Ok(ctx) = self.context() {
            expr.resolve(&ctx);
        }
        let mut exprs = write(&self.exprs);
        let old = std::mem::replace(slot(&mut *exprs), expr);
        old.disown(&self.self_ref);
        // The replaced tree may share nodes with the remaining ones
        for live in exprs.all() {
            live.adopt(&self.self_ref);
        }
        Some(old)
    }

    pub fn set_active_condition(&self, condition: impl Into<Operand>) -> EngineResult<()> {
        let condition = Expr::from_operand(condition);
        self.replace_expr(condition, |c| &mut c.active_condition);
        self.update_dependencies()
    }

    pub fn set_update_condition(&self, condition: impl Into<Operand>) -> EngineResult<()> {
        let condition = Expr::from_operand(condition);
        self.replace_expr(condition, |c| &mut c.update_condition);
        self.update_dependencies()?;
        self.rerun_update();
        Ok(())
    }

    /// Replace on_activate; an active program runs the new action right away
    pub fn set_on_activate(&self, action: impl Into<Operand>) -> EngineResult<()> {
        let action = Expr::from_operand(action);
        if let Some(old) = self.replace_expr(action.clone(), |c| &mut c.on_activate) {
            old.cancel(self.id);
        }
        self.update_dependencies()?;
        if self.is_attached() && self.is_active() {
            let _guard = lock(&self.trigger_lock);
            action.cancel(self.id);
            self.run_action(&action, "on_activate", None);
        }
        Ok(())
    }

    pub fn set_on_update(&self, action: impl Into<Operand>) -> EngineResult<()> {
        let action = Expr::from_operand(action);
        if let Some(old) = self.replace_expr(action, |c| &mut c.on_update) {
            old.cancel(self.id);
        }
        self.update_dependencies()?;
        self.rerun_update();
        Ok(())
    }

    pub fn set_on_deactivate(&self, action: impl Into<Operand>) -> EngineResult<()> {
        let action = Expr::from_operand(action);
        self.replace_expr(action, |c| &mut c.on_deactivate);
        self.update_dependencies()
    }

    fn rerun_update(&self) {
        if self.is_attached() && self.is_active() {
            let _guard = lock(&self.trigger_lock);
            self.maybe_update(None);
        }
    }

    /// Change the priority and re-sort every stack this program is in
    pub fn set_priority(&self, priority: f64) {
        *write(&self.priority) = priority;
        debug!(program = %self.name, priority, "Priority changed");
        for target in self.actual_targets() {
            target.update_program_priority(self.id, priority);
        }
    }

    pub fn set_triggers<T: Into<Operand>>(&self, triggers: Vec<T>) -> EngineResult<()> {
        write(&self.explicit).triggers = self.resolve_operands(triggers);
        self.update_dependencies()
    }

    pub fn set_exclude_triggers<T: Into<Operand>>(&self, exclude: Vec<T>) -> EngineResult<()> {
        write(&self.explicit).exclude_triggers = self.resolve_operands(exclude);
        self.update_dependencies()
    }

    pub fn set_targets<T: Into<Operand>>(&self, targets: Vec<T>) -> EngineResult<()> {
        write(&self.explicit).targets = self.resolve_operands(targets);
        self.update_dependencies()
    }

    fn resolve_operands<T: Into<Operand>>(&self, items: Vec<T>) -> Vec<Operand> {
        let ctx = self.ctx.upgrade();
        items
            .into_iter()
            .map(|item| match (item.into(), &ctx) {
                (Operand::Name(name), Some(ctx)) => match ctx.registry.object(&name) {
                    Some(object) => Operand::Object(object),
                    None => Operand::Name(name),
                },
                (other, _) => other,
            })
            .collect()
    }

    pub fn set_description(&self, description: impl Into<String>) {
        write(&self.meta).description = description.into();
    }

    pub fn set_silent(&self, silent: bool) {
        write(&self.meta).silent = silent;
    }

    pub fn set_debug(&self, debug: bool) {
        write(&self.meta).debug = debug;
    }
}

/// Explicit dependency lists may name objects created after the program
fn add_objects(ctx: &Context, operands: &[Operand], into: &mut ObjectSet) {
    for operand in operands {
        let object = match operand {
            Operand::Object(o) => Some(o.clone()),
            Operand::Name(name) => ctx.registry.object(name),
            _ => None,
        };
        match object {
            Some(o) => {
                into.entry(o.id()).or_insert(o);
            }
            None => warn!(operand = %operand, "Not a status object, ignored"),
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name.as_str())
            .field("priority", &self.priority())
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name.as_str())
    }
}
