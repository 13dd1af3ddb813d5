//! Registry of cancelled transfer task ids.
//!
//! Transfers poll it between chunks. Entries stay until the host forgets them, so
//! a cancel that lands before the transfer starts still takes effect.

use std::collections::HashSet;
use std::sync::RwLock;

use crate::ignore_poison::IgnorePoisonRw;

#[derive(Default)]
pub struct CancellationRegistry {
    cancelled: RwLock<HashSet<String>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a task as cancelled. Empty ids are ignored.
    pub fn mark(&self, task_id: &str) {
        if task_id.is_empty() {
            return;
        }
        self.cancelled.write_ignore_poison().insert(task_id.to_string());
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        !task_id.is_empty() && self.cancelled.read_ignore_poison().contains(task_id)
    }

    /// Drops a task id once its transfer is over.
    pub fn forget(&self, task_id: &str) {
        self.cancelled.write_ignore_poison().remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.cancelled.read_ignore_poison().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_only_affects_that_task() {
        let registry = CancellationRegistry::new();
        registry.mark("t1");
        assert!(registry.is_cancelled("t1"));
        assert!(!registry.is_cancelled("t2"));
    }

    #[test]
    fn test_empty_task_id_is_ignored() {
        let registry = CancellationRegistry::new();
        registry.mark("");
        assert!(registry.is_empty());
        assert!(!registry.is_cancelled(""));
    }

    #[test]
    fn test_forget() {
        let registry = CancellationRegistry::new();
        registry.mark("t1");
        registry.mark("t1");
        assert_eq!(registry.len(), 1);
        registry.forget("t1");
        assert!(!registry.is_cancelled("t1"));
    }
}
