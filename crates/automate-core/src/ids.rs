//! Identifiers and the sequence counter they are drawn from

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identity of a status object within one system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Identity of a program within one system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProgramId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prog#{}", self.0)
    }
}

/// Monotonically increasing counter shared by everything in one system
///
/// Ids, listener handles and priority-stack insertion stamps are all drawn
/// from it, so a value handed out later always compares greater.
#[derive(Debug, Clone)]
pub struct Sequence(Arc<AtomicU64>);

impl Sequence {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    pub fn next_value(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_object_id(&self) -> ObjectId {
        ObjectId(self.next_value())
    }

    pub fn next_program_id(&self) -> ProgramId {
        ProgramId(self.next_value())
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic_and_shared() {
        let seq = Sequence::new();
        let clone = seq.clone();
        let a = seq.next_value();
        let b = clone.next_value();
        let c = seq.next_object_id();
        assert!(a < b);
        assert!(b < c.0);
    }
}
