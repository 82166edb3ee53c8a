//! Expression nodes
//!
//! Program conditions and actions are trees of [`Expr`] nodes. Each node has
//! a kind, positional operands and named operands. Operands are literals,
//! names, status objects, programs, nested nodes or lists of those.
//!
//! Names are resolved against the registry once, when the owning program is
//! attached. A name that does not resolve stays a plain string. Before that,
//! dependency queries and evaluation fail with a not-ready error so that
//! nothing caches an empty dependency set during startup.
//!
//! Every node reports two dependency sets: its triggers (objects whose
//! changes can alter its result) and its targets (objects it may change).
//! Which operands contribute to which set depends on the kind; see
//! [`ExprKind`].

mod background;
pub mod build;
mod eval;

pub use eval::EvalContext;

use automate_core::sync::{lock, read, write};
use automate_core::{ObjectId, ProgramId, Value};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{EvalError, EvalResult};
use crate::program::Program;
use crate::registry::Entity;
use crate::status::StatusObject;

use background::CallerState;

/// Operator of an expression node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprKind {
    // Values and logic
    Value,
    Literal,
    Anything,
    And,
    Or,
    Not,
    Neg,
    Equal,
    Less,
    More,
    Min,
    Max,
    Sum,
    Product,
    If,
    IfElse,
    Switch,
    TryExcept,
    Changed,
    TriggeredBy,
    ToStr,
    RegexSearch,
    RegexMatch,
    Attrib,
    OfType,
    // Actions
    Empty,
    Run,
    SetStatus,
    Swap,
    SetAttr,
    Log,
    Debug,
    Shell,
    Func,
    // Background actions
    Delay,
    Threaded,
    WaitUntil,
    While,
}

/// Which operands feed a dependency set
#[derive(Debug, Clone, Copy)]
enum Contribution {
    /// Every positional and named operand
    Children,
    Nothing,
    /// One positional operand
    Arg(usize),
    /// Everything after the first positional operand, plus named operands
    Branches,
    /// Named operands only
    Named,
    /// Registry objects matching the node's selectors
    Query,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Which {
    Triggers,
    Targets,
}

impl ExprKind {
    const ALL: [ExprKind; 38] = [
        ExprKind::Value,
        ExprKind::Literal,
        ExprKind::Anything,
        ExprKind::And,
        ExprKind::Or,
        ExprKind::Not,
        ExprKind::Neg,
        ExprKind::Equal,
        ExprKind::Less,
        ExprKind::More,
        ExprKind::Min,
        ExprKind::Max,
        ExprKind::Sum,
        ExprKind::Product,
        ExprKind::If,
        ExprKind::IfElse,
        ExprKind::Switch,
        ExprKind::TryExcept,
        ExprKind::Changed,
        ExprKind::TriggeredBy,
        ExprKind::ToStr,
        ExprKind::RegexSearch,
        ExprKind::RegexMatch,
        ExprKind::Attrib,
        ExprKind::OfType,
        ExprKind::Empty,
        ExprKind::Run,
        ExprKind::SetStatus,
        ExprKind::Swap,
        ExprKind::SetAttr,
        ExprKind::Log,
        ExprKind::Debug,
        ExprKind::Shell,
        ExprKind::Func,
        ExprKind::Delay,
        ExprKind::Threaded,
        ExprKind::WaitUntil,
        ExprKind::While,
    ];

    /// Look up a kind by its configuration name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "add" => Some(ExprKind::Sum),
            "mult" => Some(ExprKind::Product),
            "try" => Some(ExprKind::TryExcept),
            other => Self::ALL.into_iter().find(|k| k.name() == other),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExprKind::Value => "value",
            ExprKind::Literal => "literal",
            ExprKind::Anything => "anything",
            ExprKind::And => "and",
            ExprKind::Or => "or",
            ExprKind::Not => "not",
            ExprKind::Neg => "neg",
            ExprKind::Equal => "equal",
            ExprKind::Less => "less",
            ExprKind::More => "more",
            ExprKind::Min => "min",
            ExprKind::Max => "max",
            ExprKind::Sum => "sum",
            ExprKind::Product => "product",
            ExprKind::If => "if",
            ExprKind::IfElse => "if_else",
            ExprKind::Switch => "switch",
            ExprKind::TryExcept => "try_except",
            ExprKind::Changed => "changed",
            ExprKind::TriggeredBy => "triggered_by",
            ExprKind::ToStr => "to_str",
            ExprKind::RegexSearch => "regex_search",
            ExprKind::RegexMatch => "regex_match",
            ExprKind::Attrib => "attrib",
            ExprKind::OfType => "of_type",
            ExprKind::Empty => "empty",
            ExprKind::Run => "run",
            ExprKind::SetStatus => "set_status",
            ExprKind::Swap => "swap",
            ExprKind::SetAttr => "set_attr",
            ExprKind::Log => "log",
            ExprKind::Debug => "debug",
            ExprKind::Shell => "shell",
            ExprKind::Func => "func",
            ExprKind::Delay => "delay",
            ExprKind::Threaded => "threaded",
            ExprKind::WaitUntil => "wait_until",
            ExprKind::While => "while",
        }
    }

    fn triggers_from(self) -> Contribution {
        match self {
            ExprKind::Literal | ExprKind::Empty => Contribution::Nothing,
            ExprKind::SetStatus => Contribution::Arg(1),
            ExprKind::Swap | ExprKind::WaitUntil | ExprKind::While => Contribution::Nothing,
            ExprKind::If | ExprKind::IfElse | ExprKind::Switch => Contribution::Branches,
            ExprKind::SetAttr => Contribution::Named,
            ExprKind::OfType => Contribution::Query,
            _ => Contribution::Children,
        }
    }

    fn targets_from(self) -> Contribution {
        match self {
            ExprKind::Value
            | ExprKind::Literal
            | ExprKind::Anything
            | ExprKind::And
            | ExprKind::Or
            | ExprKind::Not
            | ExprKind::Neg
            | ExprKind::Equal
            | ExprKind::Less
            | ExprKind::More
            | ExprKind::Min
            | ExprKind::Max
            | ExprKind::Sum
            | ExprKind::Product
            | ExprKind::Changed
            | ExprKind::TriggeredBy
            | ExprKind::ToStr
            | ExprKind::Log
            | ExprKind::Debug
            | ExprKind::Empty => Contribution::Nothing,
            ExprKind::SetStatus | ExprKind::SetAttr => Contribution::Arg(0),
            ExprKind::OfType => Contribution::Query,
            ExprKind::If | ExprKind::IfElse | ExprKind::Switch => Contribution::Branches,
            _ => Contribution::Children,
        }
    }

    fn contribution(self, which: Which) -> Contribution {
        match which {
            Which::Triggers => self.triggers_from(),
            Which::Targets => self.targets_from(),
        }
    }
}

impl fmt::Display for ExprKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Native function for `func` nodes
pub type NativeFn = Arc<dyn Fn(&[Value], &EvalContext) -> EvalResult<Value> + Send + Sync>;

/// An operand of an expression node
#[derive(Clone)]
pub enum Operand {
    Literal(Value),
    /// A name not (yet) bound to an object
    Name(String),
    Object(Arc<StatusObject>),
    Program(Weak<Program>),
    Expr(Arc<Expr>),
    List(Vec<Operand>),
}

impl Operand {
    fn resolve(&mut self, ctx: &Arc<Context>) {
        match self {
            Operand::Name(name) => match ctx.registry.lookup(name) {
                Some(Entity::Object(o)) => *self = Operand::Object(o),
                Some(Entity::Program(p)) => *self = Operand::Program(Arc::downgrade(&p)),
                None => {}
            },
            Operand::Expr(e) => e.resolve(ctx),
            Operand::List(items) => items.iter_mut().for_each(|i| i.resolve(ctx)),
            Operand::Literal(_) | Operand::Object(_) | Operand::Program(_) => {}
        }
    }

    fn gather(
        &self,
        which: Which,
        found: &mut IndexMap<ObjectId, Arc<StatusObject>>,
    ) -> EvalResult<()> {
        match self {
            Operand::Object(o) => {
                found.entry(o.id()).or_insert_with(|| o.clone());
            }
            Operand::Expr(e) => {
                for o in e.dependencies(which)? {
                    found.entry(o.id()).or_insert(o);
                }
            }
            Operand::List(items) => {
                for item in items {
                    item.gather(which, found)?;
                }
            }
            Operand::Literal(_) | Operand::Name(_) | Operand::Program(_) => {}
        }
        Ok(())
    }

    fn collect_exprs(&self, out: &mut Vec<Arc<Expr>>) {
        match self {
            Operand::Expr(e) => out.push(e.clone()),
            Operand::List(items) => items.iter().for_each(|i| i.collect_exprs(out)),
            _ => {}
        }
    }
}

impl fmt::Debug for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(Value::Str(s)) => write!(f, "{:?}", s),
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Name(n) => f.write_str(n),
            Operand::Object(o) => f.write_str(o.name()),
            Operand::Program(p) => match p.upgrade() {
                Some(p) => f.write_str(p.name()),
                None => f.write_str("<dropped program>"),
            },
            Operand::Expr(e) => write!(f, "{}", e),
            Operand::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Literal(v)
    }
}

impl From<bool> for Operand {
    fn from(v: bool) -> Self {
        Operand::Literal(Value::Bool(v))
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Operand::Literal(Value::Int(v))
    }
}

impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Operand::Literal(Value::from(v))
    }
}

impl From<f64> for Operand {
    fn from(v: f64) -> Self {
        Operand::Literal(Value::Float(v))
    }
}

/// Strings are names; they stay plain strings if nothing by that name exists
impl From<&str> for Operand {
    fn from(name: &str) -> Self {
        Operand::Name(name.to_string())
    }
}

impl From<String> for Operand {
    fn from(name: String) -> Self {
        Operand::Name(name)
    }
}

impl From<Arc<StatusObject>> for Operand {
    fn from(o: Arc<StatusObject>) -> Self {
        Operand::Object(o)
    }
}

impl From<&Arc<StatusObject>> for Operand {
    fn from(o: &Arc<StatusObject>) -> Self {
        Operand::Object(o.clone())
    }
}

impl From<&Arc<Program>> for Operand {
    fn from(p: &Arc<Program>) -> Self {
        Operand::Program(Arc::downgrade(p))
    }
}

impl From<Arc<Expr>> for Operand {
    fn from(e: Arc<Expr>) -> Self {
        Operand::Expr(e)
    }
}

impl<T: Into<Operand>> From<Vec<T>> for Operand {
    fn from(items: Vec<T>) -> Self {
        Operand::List(items.into_iter().map(Into::into).collect())
    }
}

struct DepsCache {
    epoch: u64,
    triggers: Vec<Arc<StatusObject>>,
    targets: Vec<Arc<StatusObject>>,
}

/// An expression node
pub struct Expr {
    kind: ExprKind,
    args: RwLock<Vec<Operand>>,
    kwargs: RwLock<IndexMap<String, Operand>>,
    func: Option<NativeFn>,
    ctx: RwLock<Weak<Context>>,
    self_ref: Weak<Expr>,
    deps: Mutex<Option<DepsCache>>,
    /// Per-caller background work
    callers: Mutex<HashMap<ProgramId, CallerState>>,
    next_generation: AtomicU64,
    /// Previous value seen by `changed`
    last_value: Mutex<Option<Value>>,
    /// Programs whose dependency sets include this node
    owners: RwLock<Vec<Weak<Program>>>,
}

impl Expr {
    pub fn new(kind: ExprKind, args: Vec<Operand>) -> Arc<Self> {
        Self::with_kwargs(kind, args, IndexMap::new())
    }

    pub fn with_kwargs(
        kind: ExprKind,
        args: Vec<Operand>,
        kwargs: IndexMap<String, Operand>,
    ) -> Arc<Self> {
        Self::build(kind, args, kwargs, None)
    }

    /// A `func` node calling `f` with its evaluated operands
    pub fn native<F>(f: F, args: Vec<Operand>) -> Arc<Self>
    where
        F: Fn(&[Value], &EvalContext) -> EvalResult<Value> + Send + Sync + 'static,
    {
        Self::build(ExprKind::Func, args, IndexMap::new(), Some(Arc::new(f)))
    }

    fn build(
        kind: ExprKind,
        args: Vec<Operand>,
        kwargs: IndexMap<String, Operand>,
        func: Option<NativeFn>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            kind,
            args: RwLock::new(args),
            kwargs: RwLock::new(kwargs),
            func,
            ctx: RwLock::new(Weak::new()),
            self_ref: self_ref.clone(),
            deps: Mutex::new(None),
            callers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            last_value: Mutex::new(None),
            owners: RwLock::new(Vec::new()),
        })
    }

    /// Use an operand as a node: nodes pass through, anything else is
    /// wrapped in `value`
    pub fn from_operand(operand: impl Into<Operand>) -> Arc<Self> {
        match operand.into() {
            Operand::Expr(e) => e,
            other => Self::new(ExprKind::Value, vec![other]),
        }
    }

    pub fn kind(&self) -> ExprKind {
        self.kind
    }

    pub fn args(&self) -> Vec<Operand> {
        read(&self.args).clone()
    }

    pub fn kwargs(&self) -> IndexMap<String, Operand> {
        read(&self.kwargs).clone()
    }

    pub fn kwarg(&self, key: &str) -> Option<Operand> {
        read(&self.kwargs).get(key).cloned()
    }

    /// Replace a positional operand (appends when `index` is one past the end)
    pub fn set_arg(&self, index: usize, operand: impl Into<Operand>) {
        let operand = self.resolved(operand.into());
        {
            let mut args = write(&self.args);
            if index < args.len() {
                args[index] = operand;
            } else {
                args.push(operand);
            }
        }
        self.children_changed();
    }

    pub fn push_arg(&self, operand: impl Into<Operand>) {
        let operand = self.resolved(operand.into());
        write(&self.args).push(operand);
        self.children_changed();
    }

    pub fn set_kwarg(&self, key: impl Into<String>, operand: impl Into<Operand>) {
        let operand = self.resolved(operand.into());
        write(&self.kwargs).insert(key.into(), operand);
        self.children_changed();
    }

    pub fn remove_kwarg(&self, key: &str) -> Option<Operand> {
        let removed = write(&self.kwargs).shift_remove(key);
        self.children_changed();
        removed
    }

    fn resolved(&self, mut operand: Operand) -> Operand {
        if let Some(ctx) = read(&self.ctx).upgrade() {
            operand.resolve(&ctx);
        }
        let owners = read(&self.owners).clone();
        if !owners.is_empty() {
            let mut children = Vec::new();
            operand.collect_exprs(&mut children);
            for child in children {
                for owner in &owners {
                    child.adopt(owner);
                }
            }
        }
        operand
    }

    /// Drop cached dependencies and have every owning program recompute its
    /// triggers and targets on the worker queue
    fn children_changed(&self) {
        *lock(&self.deps) = None;
        let Some(ctx) = read(&self.ctx).upgrade() else {
            return;
        };
        ctx.invalidate_deps();

        let owners: Vec<Arc<Program>> = {
            let mut owners = write(&self.owners);
            owners.retain(|o| o.strong_count() > 0);
            owners.iter().filter_map(Weak::upgrade).collect()
        };
        for program in owners {
            let label = format!("update dependencies of {}", program.name());
            let queued = ctx.worker.put(label, move || {
                if let Err(e) = program.update_dependencies() {
                    warn!(program = %program.name(), error = %e, "Cannot update dependencies");
                }
            });
            if let Err(e) = queued {
                debug!(error = %e, "Dependency update not queued");
            }
        }
    }

    /// Register `owner` on this node and every node below it
    pub(crate) fn adopt(&self, owner: &Weak<Program>) {
        {
            let mut owners = write(&self.owners);
            if !owners.iter().any(|o| o.ptr_eq(owner)) {
                owners.push(owner.clone());
            }
        }
        for child in self.child_exprs() {
            child.adopt(owner);
        }
    }

    /// Whether this node or any node below it is of `kind`
    pub(crate) fn contains_kind(&self, kind: ExprKind) -> bool {
        self.kind == kind || self.child_exprs().iter().any(|c| c.contains_kind(kind))
    }

    /// Undo [`adopt`](Self::adopt) for a node the owner no longer uses
    pub(crate) fn disown(&self, owner: &Weak<Program>) {
        {
            let mut owners = write(&self.owners);
            let before = owners.len();
            owners.retain(|o| !o.ptr_eq(owner));
            if owners.len() == before {
                return;
            }
        }
        for child in self.child_exprs() {
            child.disown(owner);
        }
    }

    /// Bind to a system and resolve names, recursively
    pub(crate) fn resolve(&self, ctx: &Arc<Context>) {
        *write(&self.ctx) = Arc::downgrade(ctx);
        for arg in write(&self.args).iter_mut() {
            arg.resolve(ctx);
        }
        for value in write(&self.kwargs).values_mut() {
            value.resolve(ctx);
        }
        *lock(&self.deps) = None;
        ctx.invalidate_deps();
    }

    pub fn is_resolved(&self) -> bool {
        read(&self.ctx).strong_count() > 0
    }

    pub(crate) fn context(&self) -> EvalResult<Arc<Context>> {
        read(&self.ctx).upgrade().ok_or(EvalError::NotReady)
    }

    /// Objects whose changes may alter this node's result
    pub fn triggers(&self) -> EvalResult<Vec<Arc<StatusObject>>> {
        self.dependencies(Which::Triggers)
    }

    /// Objects this node may change
    pub fn targets(&self) -> EvalResult<Vec<Arc<StatusObject>>> {
        self.dependencies(Which::Targets)
    }

    pub(crate) fn dependencies(&self, which: Which) -> EvalResult<Vec<Arc<StatusObject>>> {
        let ctx = self.context()?;
        let epoch = ctx.deps_epoch();
        if let Some(cache) = lock(&self.deps).as_ref().filter(|c| c.epoch == epoch) {
            return Ok(match which {
                Which::Triggers => cache.triggers.clone(),
                Which::Targets => cache.targets.clone(),
            });
        }

        let triggers = self.collect(Which::Triggers)?;
        let targets = self.collect(Which::Targets)?;
        let result = match which {
            Which::Triggers => triggers.clone(),
            Which::Targets => targets.clone(),
        };
        *lock(&self.deps) = Some(DepsCache {
            epoch,
            triggers,
            targets,
        });
        Ok(result)
    }

    fn collect(&self, which: Which) -> EvalResult<Vec<Arc<StatusObject>>> {
        if let Contribution::Query = self.kind.contribution(which) {
            return self.query_objects(Some(which));
        }
        let operands: Vec<Operand> = {
            let args = read(&self.args);
            let kwargs = read(&self.kwargs);
            match self.kind.contribution(which) {
                Contribution::Nothing | Contribution::Query => Vec::new(),
                Contribution::Named => kwargs.values().cloned().collect(),
                Contribution::Children => {
                    args.iter().chain(kwargs.values()).cloned().collect()
                }
                Contribution::Arg(i) => args.get(i).cloned().into_iter().collect(),
                Contribution::Branches => args
                    .iter()
                    .skip(1)
                    .chain(kwargs.values())
                    .cloned()
                    .collect(),
            }
        };
        let mut found = IndexMap::new();
        for operand in &operands {
            operand.gather(which, &mut found)?;
        }
        Ok(found.into_values().collect())
    }

    /// Evaluate without a caller: side effects are skipped
    pub fn status(&self) -> EvalResult<Value> {
        self.evaluate(&EvalContext::default())
    }

    fn child_exprs(&self) -> Vec<Arc<Expr>> {
        let mut out = Vec::new();
        for operand in read(&self.args).iter() {
            operand.collect_exprs(&mut out);
        }
        for operand in read(&self.kwargs).values() {
            operand.collect_exprs(&mut out);
        }
        out
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.kind)?;
        let args = read(&self.args);
        let kwargs = read(&self.kwargs);
        let mut first = true;
        for arg in args.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}", arg)?;
        }
        for (key, value) in kwargs.iter() {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            write!(f, "{}={}", key, value)?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expr({})", self)
    }
}
