//! Last-write-wins bookkeeping for optimistic local writes.
//!
//! Local writes apply immediately and are sent to the relay. Until the
//! relay echoes a write back, any remote write to the same register was
//! sequenced before it and would be overwritten by it on every other
//! client, so it is skipped here too. Every client therefore ends on the
//! relay's order.

use std::collections::HashMap;

/// A replicated last-write-wins register.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Register {
    SceneTree,
    ScenePointer,
    Broadcaster,
    GlobalField(String),
}

#[derive(Debug, Clone, Default)]
pub struct PendingWrites {
    outstanding: HashMap<Register, u32>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// A local write to `register` was sent.
    pub fn issue(&mut self, register: Register) {
        *self.outstanding.entry(register).or_insert(0) += 1;
    }

    /// The relay echoed one of our writes to `register`.
    pub fn retire(&mut self, register: &Register) {
        if let Some(count) = self.outstanding.get_mut(register) {
            *count -= 1;
            if *count == 0 {
                self.outstanding.remove(register);
            }
        }
    }

    pub fn is_pending(&self, register: &Register) -> bool {
        self.outstanding.contains_key(register)
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Forget everything, as after a snapshot.
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_retire() {
        let mut pending = PendingWrites::new();
        pending.issue(Register::SceneTree);
        pending.issue(Register::SceneTree);
        assert!(pending.is_pending(&Register::SceneTree));

        pending.retire(&Register::SceneTree);
        assert!(pending.is_pending(&Register::SceneTree));
        pending.retire(&Register::SceneTree);
        assert!(!pending.is_pending(&Register::SceneTree));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_global_fields_are_independent() {
        let mut pending = PendingWrites::new();
        pending.issue(Register::GlobalField("x".into()));
        assert!(pending.is_pending(&Register::GlobalField("x".into())));
        assert!(!pending.is_pending(&Register::GlobalField("y".into())));
    }

    #[test]
    fn test_retire_unknown_is_noop() {
        let mut pending = PendingWrites::new();
        pending.retire(&Register::ScenePointer);
        assert!(pending.is_empty());
    }
}
