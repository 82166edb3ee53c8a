//! Per-kind evaluation

use automate_core::sync::lock;
use automate_core::{DelayMode, Value, ValueKind};
use indexmap::IndexMap;
use regex::RegexBuilder;
use std::cmp::Ordering;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::background::duration_of;
use super::{Expr, ExprKind, Operand, Which};
use crate::error::{EngineError, EvalError, EvalResult};
use crate::program::Program;
use crate::status::StatusObject;

/// Who is evaluating, and which change caused it
///
/// Side-effecting nodes do nothing without a caller, so an empty context can
/// be used to inspect a condition without running anything.
#[derive(Clone, Default)]
pub struct EvalContext {
    pub caller: Option<Arc<Program>>,
    pub trigger: Option<Arc<StatusObject>>,
}

impl EvalContext {
    pub fn new(caller: Option<Arc<Program>>, trigger: Option<Arc<StatusObject>>) -> Self {
        Self { caller, trigger }
    }

    /// Evaluate on behalf of `program`
    pub fn for_program(program: &Arc<Program>) -> Self {
        Self::new(Some(program.clone()), None)
    }

    pub fn with_trigger(mut self, trigger: Option<Arc<StatusObject>>) -> Self {
        self.trigger = trigger;
        self
    }
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("caller", &self.caller.as_ref().map(|p| p.name().to_string()))
            .field("trigger", &self.trigger.as_ref().map(|o| o.name().to_string()))
            .finish()
    }
}

impl Expr {
    /// Evaluate this node
    ///
    /// Fails with [`EvalError::NotReady`] until the node is bound to a
    /// running system.
    pub fn evaluate(&self, cx: &EvalContext) -> EvalResult<Value> {
        self.context()?;
        let args = self.args();
        trace!(expr = %self, "Evaluating");

        match self.kind {
            ExprKind::Value => {
                self.expect_args(&args, 1, Some(1), "1")?;
                self.eval_operand(&args[0], cx)
            }
            ExprKind::Literal => {
                self.expect_args(&args, 1, Some(1), "1")?;
                Ok(literal_of(&args[0]))
            }
            ExprKind::Anything => Ok(Value::Bool(true)),
            ExprKind::And => {
                for arg in &args {
                    if !all_truthy(&self.eval_operand(arg, cx)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            ExprKind::Or => {
                for arg in &args {
                    if any_truthy(&self.eval_operand(arg, cx)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            ExprKind::Not => {
                self.expect_args(&args, 1, Some(1), "1")?;
                Ok(Value::Bool(!self.eval_operand(&args[0], cx)?.is_truthy()))
            }
            ExprKind::Neg => {
                self.expect_args(&args, 1, Some(1), "1")?;
                Ok(self.eval_operand(&args[0], cx)?.negate()?)
            }
            ExprKind::Equal => {
                self.expect_args(&args, 2, Some(2), "2")?;
                let (a, b) = self.eval_pair(&args, cx)?;
                Ok(Value::Bool(a == b))
            }
            ExprKind::Less | ExprKind::More => {
                self.expect_args(&args, 2, Some(2), "2")?;
                let (a, b) = self.eval_pair(&args, cx)?;
                let wanted = if self.kind == ExprKind::Less {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                Ok(Value::Bool(a.partial_cmp(&b) == Some(wanted)))
            }
            ExprKind::Min | ExprKind::Max => {
                let numbers = self.eval_numbers(&args, cx)?;
                let result = if self.kind == ExprKind::Min {
                    numbers.into_iter().fold(f64::INFINITY, f64::min)
                } else {
                    numbers.into_iter().fold(f64::NEG_INFINITY, f64::max)
                };
                Ok(Value::Float(result))
            }
            ExprKind::Sum => Ok(Value::Float(self.eval_numbers(&args, cx)?.into_iter().sum())),
            ExprKind::Product => Ok(Value::Float(
                self.eval_numbers(&args, cx)?.into_iter().product(),
            )),
            ExprKind::If => {
                self.expect_args(&args, 2, None, "at least 2")?;
                if !self.eval_operand(&args[0], cx)?.is_truthy() {
                    return Ok(Value::Bool(false));
                }
                if args.len() == 2 {
                    return self.eval_operand(&args[1], cx);
                }
                for arg in &args[1..] {
                    self.eval_operand(arg, cx)?;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfElse => {
                self.expect_args(&args, 2, Some(3), "2 or 3")?;
                if self.eval_operand(&args[0], cx)?.is_truthy() {
                    self.eval_operand(&args[1], cx)
                } else if let Some(otherwise) = args.get(2) {
                    self.eval_operand(otherwise, cx)
                } else {
                    Ok(Value::Bool(false))
                }
            }
            ExprKind::Switch => self.eval_switch(&args, cx),
            ExprKind::TryExcept => {
                self.expect_args(&args, 2, Some(2), "2")?;
                match self.eval_operand(&args[0], cx) {
                    Ok(v) => Ok(v),
                    Err(e) => {
                        debug!(expr = %self, error = %e, "Falling back after error");
                        self.eval_operand(&args[1], cx)
                    }
                }
            }
            ExprKind::Changed => {
                self.expect_args(&args, 1, Some(1), "1")?;
                if cx.caller.is_none() {
                    return Ok(Value::None);
                }
                let new = self.eval_operand(&args[0], cx)?;
                let mut last = lock(&self.last_value);
                let changed = last.as_ref().map_or(true, |old| *old != new);
                trace!(expr = %self, last = ?last.as_ref(), new = %new, changed, "Changed");
                *last = Some(new);
                Ok(Value::Bool(changed))
            }
            ExprKind::TriggeredBy => {
                let Some(trigger) = &cx.trigger else {
                    return Ok(if args.is_empty() {
                        Value::None
                    } else {
                        Value::Bool(false)
                    });
                };
                if args.is_empty() {
                    return Ok(Value::Str(trigger.name().to_string()));
                }
                for arg in &args {
                    if self
                        .objects_of(arg, cx)?
                        .iter()
                        .any(|o| o.id() == trigger.id())
                    {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            ExprKind::ToStr => self.eval_to_str(&args, cx),
            ExprKind::RegexSearch | ExprKind::RegexMatch => self.eval_regex(&args, cx),
            ExprKind::Attrib => self.eval_attrib(&args, cx),
            ExprKind::OfType => Ok(Value::List(
                self.query_objects(None)?
                    .iter()
                    .map(|o| Value::Str(o.name().to_string()))
                    .collect(),
            )),
            ExprKind::Empty => Ok(Value::None),
            ExprKind::Run => {
                if cx.caller.is_none() {
                    return Ok(Value::None);
                }
                for arg in &args {
                    self.eval_operand(arg, cx)?;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::SetStatus => self.eval_set_status(&args, cx),
            ExprKind::Swap => self.eval_swap(&args, cx),
            ExprKind::SetAttr => self.eval_set_attr(&args, cx),
            ExprKind::Log | ExprKind::Debug => self.eval_log(&args, cx),
            ExprKind::Shell => self.eval_shell(&args, cx),
            ExprKind::Func => self.eval_func(&args, cx),
            ExprKind::Delay | ExprKind::Threaded => match &cx.caller {
                Some(caller) => self.run_delay(&args, cx, caller),
                None => Ok(Value::None),
            },
            ExprKind::WaitUntil => match &cx.caller {
                Some(caller) => self.run_wait_until(&args, cx, caller),
                None => Ok(Value::None),
            },
            ExprKind::While => match &cx.caller {
                Some(caller) => self.run_while(&args, cx, caller),
                None => Ok(Value::None),
            },
        }
    }

    /// Current value of an operand
    pub(super) fn eval_operand(&self, operand: &Operand, cx: &EvalContext) -> EvalResult<Value> {
        match operand {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Name(n) => Ok(Value::Str(n.clone())),
            Operand::Object(o) => Ok(o.status()),
            Operand::Program(p) => Ok(p
                .upgrade()
                .map_or(Value::None, |p| Value::Bool(p.is_active()))),
            Operand::Expr(e) => e.evaluate(cx),
            Operand::List(items) => items
                .iter()
                .map(|i| self.eval_operand(i, cx))
                .collect::<EvalResult<Vec<_>>>()
                .map(Value::List),
        }
    }

    /// Status objects an operand designates
    ///
    /// Names are looked up late, so objects created after attach still work.
    pub(super) fn objects_of(
        &self,
        operand: &Operand,
        cx: &EvalContext,
    ) -> EvalResult<Vec<Arc<StatusObject>>> {
        match operand {
            Operand::Object(o) => Ok(vec![o.clone()]),
            Operand::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(self.objects_of(item, cx)?);
                }
                Ok(out)
            }
            Operand::Name(n) => Ok(vec![self.lookup_object(n)?]),
            Operand::Expr(e) => self.objects_of_value(&e.evaluate(cx)?),
            Operand::Literal(v) => self.objects_of_value(v),
            Operand::Program(_) => Err(EvalError::NotAnObject(operand.to_string())),
        }
    }

    fn objects_of_value(&self, value: &Value) -> EvalResult<Vec<Arc<StatusObject>>> {
        match value {
            Value::Str(name) => Ok(vec![self.lookup_object(name)?]),
            Value::List(items) => {
                let mut out = Vec::new();
                for item in items {
                    out.extend(self.objects_of_value(item)?);
                }
                Ok(out)
            }
            other => Err(EvalError::NotAnObject(other.to_string())),
        }
    }

    fn lookup_object(&self, name: &str) -> EvalResult<Arc<StatusObject>> {
        self.context()?
            .registry
            .object(name)
            .ok_or_else(|| EvalError::NotAnObject(name.to_string()))
    }

    fn expect_args(
        &self,
        args: &[Operand],
        min: usize,
        max: Option<usize>,
        expected: &'static str,
    ) -> EvalResult<()> {
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            return Err(EvalError::Arity {
                kind: self.kind.name(),
                expected,
                got: args.len(),
            });
        }
        Ok(())
    }

    fn eval_pair(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<(Value, Value)> {
        Ok((self.eval_operand(&args[0], cx)?, self.eval_operand(&args[1], cx)?))
    }

    fn eval_numbers(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Vec<f64>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            for v in self.eval_operand(arg, cx)?.flatten() {
                out.push(v.number()?);
            }
        }
        Ok(out)
    }

    fn eval_switch(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        self.expect_args(args, 1, None, "at least 1")?;
        let selector = self.eval_operand(&args[0], cx)?;
        let cases = self.kwargs();
        if !cases.is_empty() {
            return match cases.get(&selector.to_string()) {
                Some(case) => self.eval_operand(case, cx),
                None => Ok(Value::None),
            };
        }
        let case = selector
            .as_i64()
            .filter(|i| *i >= 0)
            .and_then(|i| args.get(i as usize + 1))
            .ok_or_else(|| EvalError::NoSuchCase(selector.to_string()))?;
        self.eval_operand(case, cx)
    }

    fn eval_to_str(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        let mut kwargs = self.kwargs();
        let no_sub = match kwargs.shift_remove("no_sub") {
            Some(op) => self.eval_operand(&op, cx)?.is_truthy(),
            None => false,
        };
        let values = args
            .iter()
            .map(|a| self.eval_operand(a, cx))
            .collect::<EvalResult<Vec<_>>>()?;
        if no_sub {
            let parts: Vec<String> = values.iter().map(Value::to_string).collect();
            return Ok(Value::Str(parts.join(" ")));
        }
        let Some((template, positional)) = values.split_first() else {
            return Err(EvalError::Arity {
                kind: self.kind.name(),
                expected: "at least 1",
                got: 0,
            });
        };
        let mut named = IndexMap::new();
        for (key, op) in &kwargs {
            named.insert(key.clone(), self.eval_operand(op, cx)?);
        }
        format_template(&template.to_string(), positional, &named).map(Value::Str)
    }

    fn eval_regex(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        self.expect_args(args, 2, Some(2), "2")?;
        let (pattern, text) = self.eval_pair(args, cx)?;
        let default_group = if self.kind == ExprKind::RegexSearch { 1 } else { 0 };
        let group = match self.kwarg("group") {
            Some(op) => {
                let v = self.eval_operand(&op, cx)?;
                v.as_i64()
                    .filter(|g| *g >= 0)
                    .ok_or_else(|| EvalError::Failed(format!("invalid regex group {}", v)))?
                    as usize
            }
            None => default_group,
        };

        let re = RegexBuilder::new(&pattern.to_string())
            .multi_line(true)
            .build()?;
        let text = text.to_string();
        let Some(caps) = re.captures(&text) else {
            return Ok(Value::Str(String::new()));
        };
        if self.kind == ExprKind::RegexMatch && caps.get(0).map_or(true, |m| m.start() != 0) {
            return Ok(Value::Str(String::new()));
        }
        if group >= caps.len() {
            return Err(EvalError::NoSuchGroup(group));
        }
        Ok(caps
            .get(group)
            .map_or(Value::None, |m| Value::Str(m.as_str().to_string())))
    }

    fn eval_attrib(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        self.expect_args(args, 2, Some(2), "2")?;
        let attr = self.eval_operand(&args[1], cx)?.to_string();

        let program = match &args[0] {
            Operand::Program(p) => p.upgrade(),
            Operand::Name(n) => self.context()?.registry.program(n),
            _ => None,
        };
        if let Some(program) = program {
            return match attr.as_str() {
                "name" => Ok(Value::Str(program.name().to_string())),
                "active" | "status" => Ok(Value::Bool(program.is_active())),
                "priority" => Ok(Value::Float(program.priority())),
                "description" => Ok(Value::Str(program.description())),
                _ => Err(EvalError::Failed(format!(
                    "program {} has no attribute {}",
                    program.name(),
                    attr
                ))),
            };
        }

        let objects = self.objects_of(&args[0], cx)?;
        let [object] = objects.as_slice() else {
            return Err(EvalError::NotAnObject(args[0].to_string()));
        };
        match attr.as_str() {
            "status" => Ok(object.status()),
            "changing" => Ok(Value::Bool(object.changing())),
            "name" => Ok(Value::Str(object.name().to_string())),
            "default" => Ok(object.default_value().clone()),
            "slave" => Ok(Value::Bool(object.is_slave())),
            "role" => Ok(Value::Str(object.role().to_string())),
            "kind" => Ok(Value::Str(object.kind().to_string())),
            "description" => Ok(Value::Str(object.description())),
            "program" => Ok(object.controlling_program().into()),
            _ => Err(EvalError::Failed(format!(
                "{} has no attribute {}",
                object.name(),
                attr
            ))),
        }
    }

    /// Objects an `of_type` node selects
    ///
    /// With `which`, the `type:` option (`triggers`, `targets` or `both`)
    /// decides whether the selection counts as that dependency set.
    pub(super) fn query_objects(&self, which: Option<Which>) -> EvalResult<Vec<Arc<StatusObject>>> {
        let ctx = self.context()?;
        let cx = EvalContext::default();
        let kwargs = self.kwargs();

        if let (Some(which), Some(op)) = (which, kwargs.get("type")) {
            let wanted = self.eval_operand(op, &cx)?.to_string();
            let contributes = match wanted.as_str() {
                "both" => true,
                "triggers" => which == Which::Triggers,
                "targets" => which == Which::Targets,
                other => {
                    return Err(EvalError::Failed(format!("of_type: unknown type {:?}", other)))
                }
            };
            if !contributes {
                return Ok(Vec::new());
            }
        }

        let mut selectors = Vec::new();
        for arg in self.args() {
            for v in self.eval_operand(&arg, &cx)?.flatten() {
                let selector = v.to_string();
                if !is_selector(&selector) {
                    return Err(EvalError::Failed(format!(
                        "of_type: unknown selector {:?}",
                        selector
                    )));
                }
                selectors.push(selector);
            }
        }
        let mut excluded = Vec::new();
        if let Some(op) = kwargs.get("exclude") {
            names_of(op, &mut excluded);
        }

        Ok(ctx
            .registry
            .objects()
            .into_iter()
            .filter(|o| selectors.is_empty() || selectors.iter().any(|s| selects(s, o)))
            .filter(|o| !excluded.iter().any(|n| n == o.name()))
            .collect())
    }

    fn eval_set_attr(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        self.expect_args(args, 1, Some(1), "1")?;
        if cx.caller.is_none() {
            return Ok(Value::None);
        }
        let program = match &args[0] {
            Operand::Program(p) => p.upgrade(),
            Operand::Name(n) => self.context()?.registry.program(n),
            _ => None,
        };
        let objects = match program {
            Some(_) => Vec::new(),
            None => self.objects_of(&args[0], cx)?,
        };

        for (attr, op) in self.kwargs() {
            let value = self.eval_operand(&op, cx)?;
            if let Some(program) = &program {
                set_program_attr(program, &attr, &value)?;
            }
            for object in &objects {
                set_object_attr(object, &attr, &value)?;
            }
            debug!(object = %args[0], attribute = %attr, value = %value, "SetAttr");
        }
        Ok(Value::Bool(true))
    }

    fn eval_set_status(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        self.expect_args(args, 2, Some(2), "2")?;
        let Some(caller) = &cx.caller else {
            return Ok(Value::None);
        };
        let force = match self.kwarg("force") {
            Some(op) => self.eval_operand(&op, cx)?.is_truthy(),
            None => false,
        };

        let targets = self.objects_of(&args[0], cx)?;
        let values = match (&args[1], self.eval_operand(&args[1], cx)?) {
            (Operand::List(_), Value::List(items)) => items,
            (_, Value::List(items)) if targets.len() > 1 => items,
            (_, value) => vec![value; targets.len()],
        };
        if values.len() != targets.len() {
            return Err(EvalError::LengthMismatch {
                targets: targets.len(),
                values: values.len(),
            });
        }

        for (target, value) in targets.iter().zip(values) {
            debug!(object = %target.name(), value = %value, program = %caller.name(), "SetStatus");
            match target.request_status(value, Some(&**caller), force) {
                // Logged where the actuator rejects it
                Ok(()) | Err(EngineError::Unauthorized { .. }) => {}
                Err(e) => {
                    error!(object = %target.name(), program = %caller.name(), error = %e, "SetStatus failed")
                }
            }
        }
        Ok(Value::Bool(true))
    }

    fn eval_swap(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        self.expect_args(args, 1, Some(1), "1")?;
        let Some(caller) = &cx.caller else {
            return Ok(Value::None);
        };
        let objects = self.objects_of(&args[0], cx)?;
        let [object] = objects.as_slice() else {
            return Err(EvalError::NotAnObject(args[0].to_string()));
        };
        if cx.trigger.as_ref().is_some_and(|t| t.id() == object.id()) {
            debug!(object = %object.name(), "Swap: ignoring own trigger");
            return Ok(Value::Bool(false));
        }
        let swapped = !object.status().is_truthy();
        if let Err(e) = object.request_status(Value::Bool(swapped), Some(&**caller), false) {
            error!(object = %object.name(), program = %caller.name(), error = %e, "Swap failed");
        }
        Ok(Value::Bool(swapped))
    }

    fn eval_log(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        let level = match self.kwarg("log_level") {
            Some(op) => self.eval_operand(&op, cx)?.to_string(),
            None if self.kind == ExprKind::Debug => "debug".to_string(),
            None => "info".to_string(),
        };
        let parts = args
            .iter()
            .map(|a| self.eval_operand(a, cx).map(|v| v.to_string()))
            .collect::<EvalResult<Vec<_>>>()?;
        let message = parts.join(" ");
        let program = cx.caller.as_ref().map(|p| p.name().to_string());
        match level.as_str() {
            "trace" => trace!(program = ?program, "{}", message),
            "debug" => debug!(program = ?program, "{}", message),
            "warn" | "warning" => warn!(program = ?program, "{}", message),
            "error" => error!(program = ?program, "{}", message),
            _ => info!(program = ?program, "{}", message),
        }
        Ok(Value::Bool(true))
    }

    fn eval_shell(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        self.expect_args(args, 1, Some(1), "1")?;
        let command = self.eval_operand(&args[0], cx)?.to_string();
        let input = match self.kwarg("input") {
            Some(op) => Some(self.eval_operand(&op, cx)?.to_string()),
            None => None,
        };
        if cx.caller.is_none() {
            return Ok(Value::None);
        }
        let flag = |key: &str| -> EvalResult<bool> {
            match self.kwarg(key) {
                Some(op) => Ok(self.eval_operand(&op, cx)?.is_truthy()),
                None => Ok(false),
            }
        };
        let (output, no_wait) = (flag("output")?, flag("no_wait")?);

        match run_shell(&command, input, output, no_wait) {
            Ok(v) => Ok(v),
            Err(e) => {
                error!(command = %command, error = %e, "Shell command failed");
                Ok(Value::Int(-1))
            }
        }
    }

    fn eval_func(&self, args: &[Operand], cx: &EvalContext) -> EvalResult<Value> {
        let Some(func) = &self.func else {
            return Err(EvalError::Failed("func node has no function".to_string()));
        };
        let values = args
            .iter()
            .map(|a| self.eval_operand(a, cx))
            .collect::<EvalResult<Vec<_>>>()?;
        match func(&values, cx) {
            Ok(v) => Ok(v),
            Err(e) => {
                error!(expr = %self, error = %e, "Function failed");
                Ok(Value::None)
            }
        }
    }
}

fn literal_of(operand: &Operand) -> Value {
    match operand {
        Operand::Literal(v) => v.clone(),
        Operand::List(items) => Value::List(items.iter().map(literal_of).collect()),
        other => Value::Str(other.to_string()),
    }
}

fn all_truthy(value: &Value) -> bool {
    match value {
        Value::List(items) => items.iter().all(all_truthy),
        other => other.is_truthy(),
    }
}

fn any_truthy(value: &Value) -> bool {
    match value {
        Value::List(items) => items.iter().any(any_truthy),
        other => other.is_truthy(),
    }
}

/// Fill `{}`, `{0}` and `{name}` fields; `{{` and `}}` are literal braces
///
/// A field may carry a `:.N` precision for numbers.
fn format_template(
    template: &str,
    positional: &[Value],
    named: &IndexMap<String, Value>,
) -> EvalResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_auto = 0;

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => {
                            return Err(EvalError::Failed(format!(
                                "unterminated field in format string {:?}",
                                template
                            )))
                        }
                    }
                }
                let (key, spec) = match field.split_once(':') {
                    Some((k, s)) => (k, Some(s)),
                    None => (field.as_str(), None),
                };
                let found = if key.is_empty() {
                    next_auto += 1;
                    positional.get(next_auto - 1)
                } else if let Ok(idx) = key.parse::<usize>() {
                    positional.get(idx)
                } else {
                    named.get(key)
                };
                let value = found.ok_or_else(|| {
                    EvalError::Failed(format!("no value for format field {{{}}}", field))
                })?;
                out.push_str(&apply_spec(value, spec)?);
            }
            '}' => {
                return Err(EvalError::Failed(format!(
                    "single '}}' in format string {:?}",
                    template
                )))
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn apply_spec(value: &Value, spec: Option<&str>) -> EvalResult<String> {
    let Some(spec) = spec.filter(|s| !s.is_empty()) else {
        return Ok(value.to_string());
    };
    let precision = spec
        .strip_prefix('.')
        .map(|p| p.trim_end_matches('f'))
        .and_then(|p| p.parse::<usize>().ok())
        .ok_or_else(|| EvalError::Failed(format!("unsupported format spec {:?}", spec)))?;
    let number = value.number()?;
    Ok(format!("{:.*}", precision, number))
}

fn is_selector(selector: &str) -> bool {
    matches!(selector, "object" | "sensor" | "actuator" | "slave")
        || ValueKind::from_name(selector).is_some()
}

fn selects(selector: &str, object: &StatusObject) -> bool {
    match selector {
        "object" => true,
        "sensor" => object.is_sensor(),
        "actuator" => object.is_actuator(),
        "slave" => object.is_slave(),
        kind => ValueKind::from_name(kind) == Some(object.kind()),
    }
}

/// Object names an operand mentions, without looking anything up
fn names_of(operand: &Operand, out: &mut Vec<String>) {
    match operand {
        Operand::Object(o) => out.push(o.name().to_string()),
        Operand::Name(n) | Operand::Literal(Value::Str(n)) => out.push(n.clone()),
        Operand::List(items) => items.iter().for_each(|i| names_of(i, out)),
        Operand::Program(_) | Operand::Expr(_) | Operand::Literal(_) => {}
    }
}

fn set_object_attr(object: &StatusObject, attr: &str, value: &Value) -> EvalResult<()> {
    let invalid = || {
        EvalError::Failed(format!(
            "cannot set {}.{} to {}",
            object.name(),
            attr,
            value
        ))
    };
    let bound = |value: &Value| match value {
        Value::None => Ok(None),
        other => other.number().map(Some),
    };
    match attr {
        "safety_delay" => {
            let delay = duration_of(value)?;
            object.configure(|s| s.safety_delay = delay);
        }
        "change_delay" => {
            let delay = duration_of(value)?;
            object.configure(|s| s.change_delay = delay);
        }
        "reset_delay" => {
            let delay = duration_of(value)?;
            object.configure(|s| s.reset_delay = delay);
        }
        "safety_mode" | "change_mode" => {
            let mode = value
                .as_str()
                .and_then(DelayMode::from_name)
                .ok_or_else(invalid)?;
            if attr == "safety_mode" {
                object.configure(|s| s.safety_mode = mode);
            } else {
                object.configure(|s| s.change_mode = mode);
            }
        }
        "value_min" => {
            let min = bound(value)?;
            object.configure(|s| s.value_min = min);
        }
        "value_max" => {
            let max = bound(value)?;
            object.configure(|s| s.value_max = max);
        }
        "silent" => object.configure(|s| s.silent = value.is_truthy()),
        "debug" => object.configure(|s| s.debug = value.is_truthy()),
        "description" => {
            let text = value.to_string();
            object.configure(|s| s.description = text);
        }
        "tags" => {
            let tags: Vec<String> = value.flatten().iter().map(Value::to_string).collect();
            object.configure(|s| s.tags = tags);
        }
        _ => return Err(invalid()),
    }
    Ok(())
}

fn set_program_attr(program: &Program, attr: &str, value: &Value) -> EvalResult<()> {
    match attr {
        "priority" => program.set_priority(value.number()?),
        "silent" => program.set_silent(value.is_truthy()),
        "debug" => program.set_debug(value.is_truthy()),
        "description" => program.set_description(value.to_string()),
        _ => {
            return Err(EvalError::Failed(format!(
                "cannot set {}.{} to {}",
                program.name(),
                attr,
                value
            )))
        }
    }
    Ok(())
}

/// Write `text` to a background command's stdin, then close it
fn feed_input(pid: u32, mut stdin: impl Write, text: &str) {
    if let Err(e) = stdin.write_all(text.as_bytes()) {
        warn!(pid, error = %e, "Cannot write input to background shell command");
    }
}

fn run_shell(
    command: &str,
    input: Option<String>,
    output: bool,
    no_wait: bool,
) -> std::io::Result<Value> {
    let mut child = Command::new("bash")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(if output || !no_wait {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .spawn()?;
    debug!(command = %command, pid = child.id(), "Shell command started");

    if no_wait {
        let pid = child.id();
        std::thread::Builder::new()
            .name("automate-shell".to_string())
            .spawn(move || {
                if let (Some(text), Some(stdin)) = (input, child.stdin.take()) {
                    feed_input(pid, stdin, &text);
                }
                if let Err(e) = child.wait_with_output() {
                    warn!(pid, error = %e, "Background shell command failed");
                }
            })?;
        return Ok(Value::Int(i64::from(pid)));
    }

    if let Some(mut stdin) = child.stdin.take() {
        if let Some(text) = input {
            stdin.write_all(text.as_bytes())?;
        }
    }
    let result = child.wait_with_output()?;
    if output {
        Ok(Value::Str(String::from_utf8_lossy(&result.stdout).into_owned()))
    } else {
        Ok(Value::Int(i64::from(result.status.code().unwrap_or(-1))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_format_template_fields() {
        let positional = vec![Value::Int(1), Value::Str("two".into())];
        let mut named = IndexMap::new();
        named.insert("unit".to_string(), Value::Str("C".into()));

        assert_eq!(
            format_template("{} and {}", &positional, &named).unwrap(),
            "1 and two"
        );
        assert_eq!(
            format_template("{1}/{0} {unit}", &positional, &named).unwrap(),
            "two/1 C"
        );
        assert_eq!(
            format_template("{{literal}}", &positional, &named).unwrap(),
            "{literal}"
        );
        assert_eq!(
            format_template("{:.2}", &[Value::Float(3.14159)], &named).unwrap(),
            "3.14"
        );
        assert!(format_template("{missing}", &positional, &named).is_err());
        assert!(format_template("{", &positional, &named).is_err());
    }

    #[test]
    fn test_nested_truthiness() {
        let nested = Value::List(vec![Value::Bool(true), Value::List(vec![Value::Int(0)])]);
        assert!(!all_truthy(&nested));
        assert!(any_truthy(&nested));
    }

    #[test]
    fn test_shell_output_and_status() {
        assert_eq!(
            run_shell("echo hello", None, true, false).unwrap(),
            Value::Str("hello\n".into())
        );
        assert_eq!(
            run_shell("cat", Some("piped".into()), true, false).unwrap(),
            Value::Str("piped".into())
        );
        assert_eq!(run_shell("exit 3", None, false, false).unwrap(), Value::Int(3));
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_background_input_is_logged() {
        let logs = Captured::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || feed_input(42, ClosedPipe, "data"));

        let text = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(text.contains("Cannot write input to background shell command"));
        assert!(text.contains("pid=42"));
    }
}
