//! # Scope Guards
//!
//! Deferred compensation for multi-step operations. A guard runs its action
//! when dropped unless the happy path cancels it first.

/// Runs a closure on drop unless cancelled
#[must_use = "a scope guard runs its action as soon as it is dropped"]
pub struct ScopeExit<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> ScopeExit<F> {
    /// Arm a guard
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Disarm the guard
    pub fn cancel(mut self) {
        self.action = None;
    }

    /// Run the action now
    pub fn run(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl<F: FnOnce()> core::fmt::Debug for ScopeExit<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScopeExit")
            .field("armed", &self.action.is_some())
            .finish()
    }
}

impl<F: FnOnce()> Drop for ScopeExit<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
