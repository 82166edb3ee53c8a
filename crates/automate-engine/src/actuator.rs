//! Priority-stack arbitration for actuators
//!
//! Every active program that targets an actuator sits in its stack, ordered
//! by effective priority (a per-actuator override by program name wins over
//! the program's own priority) and then by activation order. The program on
//! top owns the actuator; values asserted by the others are remembered and
//! take effect as soon as they reach the top.
//!
//! Lock order is always arbitration lock, then status lock.

use automate_core::sync::lock;
use automate_core::{ProgramId, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::program::Program;
use crate::status::{decision, StatusObject};

#[derive(Debug, Clone)]
pub(crate) struct StackEntry {
    pub(crate) program: ProgramId,
    pub(crate) name: String,
    priority: f64,
    seq: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Arbitration {
    stack: Vec<StackEntry>,
    asserted: HashMap<ProgramId, Value>,
    overrides: HashMap<String, f64>,
}

impl Arbitration {
    fn effective_priority(&self, entry: &StackEntry) -> f64 {
        self.overrides
            .get(&entry.name)
            .copied()
            .unwrap_or(entry.priority)
    }

    fn sort(&mut self) {
        let overrides = &self.overrides;
        let key = |e: &StackEntry| overrides.get(&e.name).copied().unwrap_or(e.priority);
        self.stack
            .sort_by(|a, b| key(a).total_cmp(&key(b)).then(a.seq.cmp(&b.seq)));
    }

    /// The controlling entry
    pub(crate) fn top(&self) -> Option<&StackEntry> {
        self.stack.last()
    }

    fn contains(&self, program: ProgramId) -> bool {
        self.stack.iter().any(|e| e.program == program)
    }
}

impl StatusObject {
    /// Record `origin`'s wish and apply it if `origin` is on top
    pub(crate) fn arbitrated_set(
        &self,
        value: Value,
        origin: Option<&Program>,
        force: bool,
    ) -> EngineResult<()> {
        let mut arb = lock(&self.arbitration);
        let program = match origin {
            Some(p) if arb.contains(p.id()) => p,
            _ => {
                let program = origin.map_or_else(|| "<none>".to_string(), |p| p.name().to_string());
                warn!(
                    object = %self.name(),
                    program = %program,
                    value = %value,
                    "Rejecting status from a program outside the stack"
                );
                return Err(EngineError::Unauthorized {
                    object: self.name().to_string(),
                    program,
                });
            }
        };

        decision!(
            self.settings().debug,
            object = %self.name(),
            program = %program.name(),
            value = %value,
            "Program asserts status"
        );
        arb.asserted.insert(program.id(), value.clone());
        if arb.top().map(|e| e.program) == Some(program.id()) {
            self.request(value, force, Some(program.id()))?;
        }
        Ok(())
    }

    /// Push a program onto the stack (no-op for sensors or if already there)
    pub fn activate_program(&self, program: &Program) {
        if !self.is_actuator() {
            return;
        }
        let seq = match self.context() {
            Ok(ctx) => ctx.sequence.next_value(),
            Err(_) => 0,
        };
        let mut arb = lock(&self.arbitration);
        if arb.contains(program.id()) {
            return;
        }
        debug!(object = %self.name(), program = %program.name(), "Program activated on actuator");
        arb.stack.push(StackEntry {
            program: program.id(),
            name: program.name().to_string(),
            priority: program.priority(),
            seq,
        });
        self.resort(&mut arb);
    }

    /// Remove a program and its asserted value from the stack
    pub fn deactivate_program(&self, program: ProgramId) {
        if !self.is_actuator() {
            return;
        }
        let mut arb = lock(&self.arbitration);
        let before = arb.stack.len();
        arb.stack.retain(|e| e.program != program);
        arb.asserted.remove(&program);
        if arb.stack.len() != before {
            debug!(object = %self.name(), %program, "Program deactivated on actuator");
            self.resort(&mut arb);
        }
    }

    /// Re-sort after a program's own priority changed
    pub(crate) fn update_program_priority(&self, program: ProgramId, priority: f64) {
        let mut arb = lock(&self.arbitration);
        let mut found = false;
        for entry in arb.stack.iter_mut().filter(|e| e.program == program) {
            entry.priority = priority;
            found = true;
        }
        if found {
            self.resort(&mut arb);
        }
    }

    /// Override the priority of a program (by name) for this actuator only
    pub fn set_priority_override(&self, program: &str, priority: Option<f64>) {
        let mut arb = lock(&self.arbitration);
        match priority {
            Some(p) => arb.overrides.insert(program.to_string(), p),
            None => arb.overrides.remove(program),
        };
        self.resort(&mut arb);
    }

    pub fn priority_overrides(&self) -> HashMap<String, f64> {
        lock(&self.arbitration).overrides.clone()
    }

    /// Program names from lowest to highest priority; the last one controls
    pub fn program_stack(&self) -> Vec<String> {
        lock(&self.arbitration)
            .stack
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    /// Effective priority of each stacked program, lowest first
    pub fn stack_priorities(&self) -> Vec<(String, f64)> {
        let arb = lock(&self.arbitration);
        arb.stack
            .iter()
            .map(|e| (e.name.clone(), arb.effective_priority(e)))
            .collect()
    }

    /// The program currently owning this actuator
    pub fn controlling_program(&self) -> Option<String> {
        lock(&self.arbitration).top().map(|e| e.name.clone())
    }

    /// The value `program` currently asserts, if any
    pub fn program_status(&self, program: ProgramId) -> Option<Value> {
        lock(&self.arbitration).asserted.get(&program).cloned()
    }

    fn resort(&self, arb: &mut Arbitration) {
        arb.sort();
        let Some(top) = arb.top() else {
            return;
        };
        let Some(value) = arb.asserted.get(&top.program).cloned() else {
            return;
        };
        let program = top.program;
        if let Err(e) = self.request(value, false, Some(program)) {
            warn!(object = %self.name(), error = %e, "Cannot apply new top of program stack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, name: &str, priority: f64, seq: u64) -> StackEntry {
        StackEntry {
            program: ProgramId(id),
            name: name.to_string(),
            priority,
            seq,
        }
    }

    #[test]
    fn test_sort_by_priority_then_activation_order() {
        let mut arb = Arbitration::default();
        arb.stack.push(entry(1, "high", 5.0, 1));
        arb.stack.push(entry(2, "low", 1.0, 2));
        arb.stack.push(entry(3, "high_later", 5.0, 3));
        arb.sort();

        let names: Vec<_> = arb.stack.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["low", "high", "high_later"]);
        assert_eq!(arb.top().unwrap().program, ProgramId(3));
    }

    #[test]
    fn test_override_beats_own_priority() {
        let mut arb = Arbitration::default();
        arb.stack.push(entry(1, "a", 1.0, 1));
        arb.stack.push(entry(2, "b", 2.0, 2));
        arb.overrides.insert("a".into(), 10.0);
        arb.sort();

        assert_eq!(arb.top().unwrap().name, "a");
        assert_eq!(arb.effective_priority(&arb.stack[0]), 2.0);
    }
}
