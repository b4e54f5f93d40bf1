//! Compensating-action stack for partially applied file operations.
//!
//! Callers push one undo closure per completed step. On failure the stack is
//! rolled back in reverse order; every undo runs regardless of individual
//! failures, and all rollback errors are collected for the caller to join
//! onto the original error.

use std::io;

type UndoFn = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Ordered list of compensating actions.
#[derive(Default)]
pub struct UndoStack {
    actions: Vec<UndoFn>,
}

impl UndoStack {
    /// Creates an empty undo stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an undo action to the top of the stack.
    pub fn push(&mut self, action: impl FnOnce() -> io::Result<()> + Send + 'static) {
        self.actions.push(Box::new(action));
    }

    /// Removes and returns the most recently pushed action.
    pub fn pop(&mut self) -> Option<UndoFn> {
        self.actions.pop()
    }

    /// Returns true if no actions are pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Drops all pending actions without executing them.
    pub fn clear(&mut self) {
        self.actions.clear();
    }

    /// Executes all pending actions, most recent first.
    ///
    /// Every action runs even if earlier ones fail; the errors of failed
    /// actions are returned in execution order. The stack is empty afterwards.
    pub fn rollback(&mut self) -> Vec<io::Error> {
        let mut failures = Vec::new();
        while let Some(undo) = self.actions.pop() {
            if let Err(err) = undo() {
                failures.push(err);
            }
        }
        failures
    }
}

impl std::fmt::Debug for UndoStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoStack")
            .field("pending", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_rollback_runs_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = UndoStack::new();

        for i in 0..3 {
            let order = order.clone();
            stack.push(move || {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        let failures = stack.rollback();
        assert!(failures.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn test_rollback_continues_past_failures() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = UndoStack::new();

        for i in 0..4 {
            let ran = ran.clone();
            stack.push(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    Err(io::Error::other("undo failed"))
                } else {
                    Ok(())
                }
            });
        }

        let failures = stack.rollback();
        assert_eq!(failures.len(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_clear_discards_actions() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = UndoStack::new();
        let counter = ran.clone();
        stack.push(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        stack.clear();
        assert!(stack.is_empty());
        assert!(stack.rollback().is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pop_returns_last_pushed() {
        let mut stack = UndoStack::new();
        stack.push(|| Ok(()));
        stack.push(|| Err(io::Error::other("second")));

        let last = stack.pop().unwrap();
        assert!(last().is_err());
        assert_eq!(stack.len(), 1);
    }
}
