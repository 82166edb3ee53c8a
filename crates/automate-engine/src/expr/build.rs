//! Shorthand constructors
//!
//! ```ignore
//! use automate_engine::expr::build::*;
//!
//! let on_activate = run(vec![
//!     set_status("lamp", true),
//!     delay(30, vec![set_status("lamp", false)]),
//! ]);
//! ```

use automate_core::Value;
use indexmap::IndexMap;
use std::sync::Arc;

use super::{EvalContext, Expr, ExprKind, Operand};
use crate::error::EvalResult;

fn node(kind: ExprKind, args: Vec<Operand>) -> Arc<Expr> {
    Expr::new(kind, args)
}

fn node_kw(kind: ExprKind, args: Vec<Operand>, kwargs: Vec<(&str, Operand)>) -> Arc<Expr> {
    let kwargs: IndexMap<String, Operand> =
        kwargs.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    Expr::with_kwargs(kind, args, kwargs)
}

fn ops<T: Into<Operand>>(items: Vec<T>) -> Vec<Operand> {
    items.into_iter().map(Into::into).collect()
}

pub fn value(x: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::Value, vec![x.into()])
}

/// A literal, including strings that would otherwise be names
pub fn literal(x: impl Into<Value>) -> Arc<Expr> {
    node(ExprKind::Literal, vec![Operand::Literal(x.into())])
}

pub fn anything() -> Arc<Expr> {
    node(ExprKind::Anything, Vec::new())
}

pub fn and<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::And, ops(items))
}

pub fn or<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Or, ops(items))
}

pub fn not(x: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::Not, vec![x.into()])
}

pub fn neg(x: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::Neg, vec![x.into()])
}

pub fn equal(a: impl Into<Operand>, b: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::Equal, vec![a.into(), b.into()])
}

pub fn less(a: impl Into<Operand>, b: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::Less, vec![a.into(), b.into()])
}

pub fn more(a: impl Into<Operand>, b: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::More, vec![a.into(), b.into()])
}

pub fn min<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Min, ops(items))
}

pub fn max<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Max, ops(items))
}

pub fn sum<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Sum, ops(items))
}

pub fn product<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Product, ops(items))
}

/// Run `then` when `condition` holds
pub fn if_<T: Into<Operand>>(condition: impl Into<Operand>, then: Vec<T>) -> Arc<Expr> {
    let mut args = vec![condition.into()];
    args.extend(ops(then));
    node(ExprKind::If, args)
}

pub fn if_else(
    condition: impl Into<Operand>,
    then: impl Into<Operand>,
    otherwise: impl Into<Operand>,
) -> Arc<Expr> {
    node(
        ExprKind::IfElse,
        vec![condition.into(), then.into(), otherwise.into()],
    )
}

/// Pick a case by zero-based index
pub fn switch<T: Into<Operand>>(selector: impl Into<Operand>, cases: Vec<T>) -> Arc<Expr> {
    let mut args = vec![selector.into()];
    args.extend(ops(cases));
    node(ExprKind::Switch, args)
}

/// Pick a case by the selector's text
pub fn switch_map(selector: impl Into<Operand>, cases: Vec<(&str, Operand)>) -> Arc<Expr> {
    node_kw(ExprKind::Switch, vec![selector.into()], cases)
}

pub fn try_except(x: impl Into<Operand>, fallback: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::TryExcept, vec![x.into(), fallback.into()])
}

pub fn changed(x: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::Changed, vec![x.into()])
}

pub fn triggered_by<T: Into<Operand>>(objects: Vec<T>) -> Arc<Expr> {
    node(ExprKind::TriggeredBy, ops(objects))
}

/// `format` with `{}` fields filled from `values`
pub fn to_str<T: Into<Operand>>(format: &str, values: Vec<T>) -> Arc<Expr> {
    let mut args = vec![Operand::Literal(Value::Str(format.to_string()))];
    args.extend(ops(values));
    node(ExprKind::ToStr, args)
}

pub fn regex_search(pattern: &str, text: impl Into<Operand>) -> Arc<Expr> {
    node(
        ExprKind::RegexSearch,
        vec![Operand::Literal(Value::Str(pattern.to_string())), text.into()],
    )
}

pub fn regex_match(pattern: &str, text: impl Into<Operand>) -> Arc<Expr> {
    node(
        ExprKind::RegexMatch,
        vec![Operand::Literal(Value::Str(pattern.to_string())), text.into()],
    )
}

pub fn attrib(object: impl Into<Operand>, attribute: &str) -> Arc<Expr> {
    node(
        ExprKind::Attrib,
        vec![
            object.into(),
            Operand::Literal(Value::Str(attribute.to_string())),
        ],
    )
}

/// Names of every object matching any of `selectors`: `sensor`, `actuator`,
/// `slave`, a value kind, or `object` for all
pub fn of_type(selectors: Vec<&str>) -> Arc<Expr> {
    node(ExprKind::OfType, selector_ops(selectors))
}

/// [`of_type`] without the objects in `exclude`
pub fn of_type_excluding<T: Into<Operand>>(selectors: Vec<&str>, exclude: Vec<T>) -> Arc<Expr> {
    node_kw(
        ExprKind::OfType,
        selector_ops(selectors),
        vec![("exclude", Operand::List(ops(exclude)))],
    )
}

fn selector_ops(selectors: Vec<&str>) -> Vec<Operand> {
    selectors
        .into_iter()
        .map(|s| Operand::Literal(Value::Str(s.to_string())))
        .collect()
}

pub fn empty() -> Arc<Expr> {
    node(ExprKind::Empty, Vec::new())
}

pub fn run<T: Into<Operand>>(actions: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Run, ops(actions))
}

pub fn set_status(target: impl Into<Operand>, value: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::SetStatus, vec![target.into(), value.into()])
}

/// `set_status` that notifies listeners even if nothing changes
pub fn force_status(target: impl Into<Operand>, value: impl Into<Operand>) -> Arc<Expr> {
    node_kw(
        ExprKind::SetStatus,
        vec![target.into(), value.into()],
        vec![("force", Operand::Literal(Value::Bool(true)))],
    )
}

pub fn swap(target: impl Into<Operand>) -> Arc<Expr> {
    node(ExprKind::Swap, vec![target.into()])
}

/// Change settings of an object or a program, e.g. `("change_delay", 5.into())`
pub fn set_attr(target: impl Into<Operand>, attributes: Vec<(&str, Operand)>) -> Arc<Expr> {
    node_kw(ExprKind::SetAttr, vec![target.into()], attributes)
}

pub fn log<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Log, ops(items))
}

pub fn debug<T: Into<Operand>>(items: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Debug, ops(items))
}

/// Run `command` with bash and return its exit code
pub fn shell(command: &str) -> Arc<Expr> {
    node(
        ExprKind::Shell,
        vec![Operand::Literal(Value::Str(command.to_string()))],
    )
}

/// Run `command` with bash and return its standard output
pub fn shell_output(command: &str) -> Arc<Expr> {
    node_kw(
        ExprKind::Shell,
        vec![Operand::Literal(Value::Str(command.to_string()))],
        vec![("output", Operand::Literal(Value::Bool(true)))],
    )
}

pub fn func<F, T>(f: F, args: Vec<T>) -> Arc<Expr>
where
    F: Fn(&[Value], &EvalContext) -> EvalResult<Value> + Send + Sync + 'static,
    T: Into<Operand>,
{
    Expr::native(f, ops(args))
}

/// Run `actions` after `seconds`
pub fn delay<T: Into<Operand>>(seconds: impl Into<Operand>, actions: Vec<T>) -> Arc<Expr> {
    let mut args = vec![seconds.into()];
    args.extend(ops(actions));
    node(ExprKind::Delay, args)
}

pub fn threaded<T: Into<Operand>>(actions: Vec<T>) -> Arc<Expr> {
    node(ExprKind::Threaded, ops(actions))
}

pub fn wait_until<T: Into<Operand>>(condition: impl Into<Operand>, actions: Vec<T>) -> Arc<Expr> {
    let mut args = vec![condition.into()];
    args.extend(ops(actions));
    node(ExprKind::WaitUntil, args)
}

pub fn while_<T: Into<Operand>>(condition: impl Into<Operand>, actions: Vec<T>) -> Arc<Expr> {
    let mut args = vec![condition.into()];
    args.extend(ops(actions));
    node(ExprKind::While, args)
}

/// `while_` with a final action once the condition fails
pub fn while_then<T: Into<Operand>>(
    condition: impl Into<Operand>,
    actions: Vec<T>,
    do_after: impl Into<Operand>,
) -> Arc<Expr> {
    let mut args = vec![condition.into()];
    args.extend(ops(actions));
    node_kw(ExprKind::While, args, vec![("do_after", do_after.into())])
}
