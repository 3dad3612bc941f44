//! Host global function slot
//!
//! The host's four scheduling functions live together in one swappable slot.
//! Installing and restoring a [`SchedulingApi`] set is the single deliberate
//! side effect of activation/deactivation, and this module is the only code
//! that touches the slot or the process-wide singleton.

use crate::{Coordinator, NativeTimers, SchedulingApi, TimerError, Value};
use std::sync::{Arc, Mutex, RwLock};
use wt_sched::TimerId;

/// The global scheduling function set of a host. Calls made through this
/// object observe whichever implementation is currently installed.
pub struct HostGlobals {
    installed: RwLock<Arc<dyn SchedulingApi>>,
}

impl HostGlobals {
    pub fn new(native: Arc<dyn SchedulingApi>) -> Self {
        Self {
            installed: RwLock::new(native),
        }
    }

    /// Swap in a new function set and return the previous one. The returned
    /// set is the snapshot a later restore passes back in, so a round trip
    /// leaves the slot reference-identical.
    pub fn install(&self, api: Arc<dyn SchedulingApi>) -> Arc<dyn SchedulingApi> {
        let mut slot = self.installed.write().unwrap();
        tracing::debug!("scheduling function set swapped");
        std::mem::replace(&mut *slot, api)
    }

    /// The currently installed function set.
    pub fn current(&self) -> Arc<dyn SchedulingApi> {
        self.installed.read().unwrap().clone()
    }

    // Call-site pass-throughs, signature-compatible with the host's own
    // global functions.

    pub fn set_interval(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError> {
        self.current().set_interval(callback, delay, args)
    }

    pub fn set_timeout(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError> {
        self.current().set_timeout(callback, delay, args)
    }

    pub fn clear_interval(&self, id: TimerId) {
        self.current().clear_interval(id)
    }

    pub fn clear_timeout(&self, id: TimerId) {
        self.current().clear_timeout(id)
    }
}

impl Default for HostGlobals {
    /// A host whose native functions are caller-thread [`NativeTimers`].
    fn default() -> Self {
        Self::new(Arc::new(NativeTimers::new()))
    }
}

/// Process-wide active coordinator, if any. Convenience layer only: the
/// coordinator itself never assumes singleton-ness.
static ACTIVE: Mutex<Option<Arc<Coordinator>>> = Mutex::new(None);

/// Activate worker-backed timers on `globals` and return the coordinator.
/// When one is already active, returns that instance instead of creating a
/// second one.
pub fn activate(globals: &Arc<HostGlobals>) -> Result<Arc<Coordinator>, TimerError> {
    let mut active = ACTIVE.lock().unwrap();
    if let Some(existing) = active.as_ref() {
        return Ok(existing.clone());
    }

    let coordinator = Arc::new(Coordinator::new(globals.clone()));
    coordinator.activate()?;
    *active = Some(coordinator.clone());
    Ok(coordinator)
}

/// Deactivate and discard the process-wide coordinator, if any.
pub fn deactivate() {
    if let Some(coordinator) = ACTIVE.lock().unwrap().take() {
        coordinator.deactivate();
    }
}

/// The currently active process-wide coordinator, if any.
pub fn current() -> Option<Arc<Coordinator>> {
    ACTIVE.lock().unwrap().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_returns_previous_set() {
        let globals = HostGlobals::default();
        let before = globals.current();

        let replacement: Arc<dyn SchedulingApi> = Arc::new(NativeTimers::new());
        let snapshot = globals.install(replacement.clone());

        assert!(Arc::ptr_eq(&snapshot, &before));
        assert!(Arc::ptr_eq(&globals.current(), &replacement));

        // Restore round-trips to reference-identical.
        globals.install(snapshot);
        assert!(Arc::ptr_eq(&globals.current(), &before));
    }

    #[test]
    fn test_singleton_lifecycle() {
        // One test owns the whole singleton lifecycle; tests run in one
        // process, so this cannot be split without racing.
        let globals = Arc::new(HostGlobals::default());

        assert!(current().is_none());

        let first = activate(&globals).unwrap();
        let second = activate(&globals).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(current().is_some());

        deactivate();
        assert!(current().is_none());
        assert!(!first.is_active());

        deactivate(); // no-op
    }
}
