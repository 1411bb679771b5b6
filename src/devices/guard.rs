//! Guaranteed restore actions for operations that move devices.

/// Runs a restore action when dropped unless it was already completed.
///
/// The action must be synchronous: device moves are issued and left to run
/// on their own, so the guard also fires during unwinding or when the owning
/// future is dropped mid-flight.
pub struct RestoreGuard<F: FnOnce()> {
    action: Option<F>,
}

impl<F: FnOnce()> RestoreGuard<F> {
    pub fn new(action: F) -> Self {
        Self {
            action: Some(action),
        }
    }

    /// Mark the restore as done through the normal path.
    pub fn disarm(mut self) {
        self.action = None;
    }
}

impl<F: FnOnce()> Drop for RestoreGuard<F> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            tracing::debug!("Restoring device state from guard");
            action();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_guard_fires_on_drop() {
        let fired = Cell::new(0);
        {
            let _guard = RestoreGuard::new(|| fired.set(fired.get() + 1));
        }
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_disarmed_guard_is_silent() {
        let fired = Cell::new(0);
        let guard = RestoreGuard::new(|| fired.set(fired.get() + 1));
        guard.disarm();
        assert_eq!(fired.get(), 0);
    }
}
