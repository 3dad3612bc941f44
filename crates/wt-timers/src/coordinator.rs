//! Timer coordinator
//!
//! The stateful object at the center of the crate. While active it sits in
//! the host's global function slot, records callback state per [`TimerId`],
//! and translates scheduling calls into messages for the `wt-sched`
//! background thread; fired notifications coming back are resolved to the
//! stored callbacks by [`Coordinator::pump`].

use crate::api::{next_timer_id, require_function, sanitize_delay};
use crate::globals::HostGlobals;
use crate::{Callback, SchedulingApi, TimerError, Value};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use wt_sched::{SchedulerHandle, TimerId, TimerKind};

/// Park granularity for [`Coordinator::pump_wait`].
const PUMP_WAIT_POLL: Duration = Duration::from_millis(5);

/// Callback state recorded at registration, keyed by [`TimerId`].
struct TimerEntry {
    kind: TimerKind,
    callback: Callback,
    args: Vec<Value>,
    requested_delay: u64,
}

/// State that only exists while the coordinator is active.
struct ActiveState {
    sched: SchedulerHandle,
    timers: HashMap<TimerId, TimerEntry>,
    /// Latched once the scheduler thread is observed gone.
    faulted: bool,
}

struct Inner {
    /// Snapshot of the host's native function set. Captured at activation,
    /// restored verbatim at deactivation; backs deactivated operation.
    native: Arc<dyn SchedulingApi>,
    active: Option<ActiveState>,
}

/// Resolved dispatch: id, callback, captured arguments.
type Job = (TimerId, Callback, Vec<Value>);

/// The coordinator. Constructed inactive; [`activate`](Coordinator::activate)
/// swaps it into the given [`HostGlobals`] slot and spawns the background
/// scheduler thread.
pub struct Coordinator {
    globals: Arc<HostGlobals>,
    inner: Mutex<Inner>,
}

impl Coordinator {
    pub fn new(globals: Arc<HostGlobals>) -> Self {
        let native = globals.current();
        Self {
            globals,
            inner: Mutex::new(Inner {
                native,
                active: None,
            }),
        }
    }

    /// Snapshot the installed native function set, spawn the background
    /// scheduler and install this coordinator into the global slot.
    ///
    /// Returns `Ok(false)` without touching anything when already active.
    /// Fails with [`TimerError::Environment`] when the host cannot provide
    /// a background thread; nothing is installed in that case.
    pub fn activate(self: &Arc<Self>) -> Result<bool, TimerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.active.is_some() {
            tracing::debug!("activate: already active");
            return Ok(false);
        }

        let sched = wt_sched::spawn().map_err(|e| {
            TimerError::Environment(format!("cannot spawn background scheduler: {e}"))
        })?;

        // install() returns the previously installed set: that is the
        // native snapshot we restore at deactivation.
        inner.native = self.globals.install(self.clone());
        inner.active = Some(ActiveState {
            sched,
            timers: HashMap::new(),
            faulted: false,
        });

        tracing::info!("worker timers active");
        Ok(true)
    }

    /// Restore the native function set, cancel every armed timer
    /// (fire-and-forget) and shut the scheduler thread down.
    ///
    /// No-op when already inactive.
    pub fn deactivate(&self) {
        let mut inner = self.inner.lock().unwrap();
        let Some(active) = inner.active.take() else {
            return;
        };

        self.globals.install(inner.native.clone());
        for (id, entry) in &active.timers {
            active.sched.cancel(entry.kind, *id);
        }

        tracing::info!(armed = active.timers.len(), "worker timers deactivated");
        // Dropping ActiveState joins the scheduler thread.
    }

    /// Drain pending fired notifications and invoke the matching callbacks.
    /// Returns the number of callbacks dispatched.
    pub fn pump(&self) -> usize {
        let mut dispatched = 0;
        loop {
            let job = {
                let mut inner = self.inner.lock().unwrap();
                let Some(active) = inner.active.as_mut() else {
                    return dispatched;
                };
                match active.sched.try_fired() {
                    Ok(fired) => Self::take_dispatch(active, fired.id),
                    Err(TryRecvError::Empty) => return dispatched,
                    Err(TryRecvError::Disconnected) => {
                        Self::note_fault(active);
                        return dispatched;
                    }
                }
            };

            // Lock released: callbacks may re-enter the scheduling API,
            // including deactivate().
            if let Some((id, callback, args)) = job {
                Self::invoke(id, &callback, &args);
                dispatched += 1;
            }
        }
    }

    /// Park up to `timeout` for fired notifications and dispatch them like
    /// [`pump`](Coordinator::pump). The state lock is only held for the
    /// non-blocking drains, never across the park, so registrations and
    /// cancellations from other threads stay non-blocking throughout.
    pub fn pump_wait(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let dispatched = self.pump();
            if dispatched > 0 {
                return dispatched;
            }
            if !self.is_active() || self.is_faulted() {
                return 0;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            thread::sleep(PUMP_WAIT_POLL.min(deadline - now));
        }
    }

    /// Deliver a single fired notification by id, as if the scheduler had
    /// emitted it. Lets tests exercise firing without waiting on the clock.
    #[cfg(test)]
    fn deliver(&self, id: TimerId) -> bool {
        let job = {
            let mut inner = self.inner.lock().unwrap();
            let Some(active) = inner.active.as_mut() else {
                return false;
            };
            Self::take_dispatch(active, id)
        };
        match job {
            Some((id, callback, args)) => {
                Self::invoke(id, &callback, &args);
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().unwrap().active.is_some()
    }

    /// True once the scheduler thread has been observed gone. Armed timers
    /// will no longer fire; callers that care should deactivate.
    pub fn is_faulted(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .active
            .as_ref()
            .is_some_and(|a| a.faulted)
    }

    pub fn armed_timers(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .active
            .as_ref()
            .map_or(0, |a| a.timers.len())
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.inner
            .lock()
            .unwrap()
            .active
            .as_ref()
            .is_some_and(|a| a.timers.contains_key(&id))
    }

    /// Sanitized delay recorded for an armed timer.
    pub fn requested_delay(&self, id: TimerId) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .active
            .as_ref()
            .and_then(|a| a.timers.get(&id).map(|e| e.requested_delay))
    }

    fn register(
        &self,
        kind: TimerKind,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError> {
        // Validation happens before any state is touched or message sent.
        let callback = require_function(&callback)?;
        let delay_ms = sanitize_delay(&delay);

        let mut inner = self.inner.lock().unwrap();
        let Some(active) = inner.active.as_mut() else {
            // Deactivated between the caller grabbing a reference and the
            // call: degrade to the captured native set.
            let native = inner.native.clone();
            drop(inner);
            return match kind {
                TimerKind::Interval => {
                    native.set_interval(Value::Function(callback), delay, args)
                }
                TimerKind::Timeout => native.set_timeout(Value::Function(callback), delay, args),
            };
        };

        let id = next_timer_id();
        active.timers.insert(
            id,
            TimerEntry {
                kind,
                callback,
                args,
                requested_delay: delay_ms,
            },
        );

        if active.sched.start(kind, id, delay_ms) {
            tracing::debug!(id, delay_ms, ?kind, "timer armed");
        } else {
            // Registration stays pending but will never fire; reported,
            // not surfaced to the caller.
            Self::note_fault(active);
        }
        Ok(id)
    }

    fn unregister(&self, kind: TimerKind, id: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(active) = inner.active.as_mut() else {
            let native = inner.native.clone();
            drop(inner);
            Self::native_clear(&native, kind, id);
            return;
        };

        match active.timers.remove(&id) {
            Some(entry) => {
                // Cancel with the entry's recorded kind so the message
                // targets the map that actually holds the id.
                active.sched.cancel(entry.kind, id);
                tracing::debug!(id, "timer cancelled");
            }
            None => {
                // Id minted by the native functions (or already finished):
                // the native set owns it.
                let native = inner.native.clone();
                drop(inner);
                Self::native_clear(&native, kind, id);
            }
        }
    }

    fn native_clear(native: &Arc<dyn SchedulingApi>, kind: TimerKind, id: TimerId) {
        match kind {
            TimerKind::Interval => native.clear_interval(id),
            TimerKind::Timeout => native.clear_timeout(id),
        }
    }

    fn take_dispatch(active: &mut ActiveState, id: TimerId) -> Option<Job> {
        // Unknown id: a cancellation crossed the fired notification in
        // flight. Ignore silently.
        let entry = active.timers.get(&id)?;
        let callback = entry.callback.clone();
        let args = entry.args.clone();
        if entry.kind == TimerKind::Timeout {
            active.timers.remove(&id);
        }
        Some((id, callback, args))
    }

    /// A panicking callback must not corrupt coordinator state or silence
    /// other timers.
    fn invoke(id: TimerId, callback: &Callback, args: &[Value]) {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
            tracing::error!(id, "timer callback panicked");
        }
    }

    fn note_fault(active: &mut ActiveState) {
        if !active.faulted {
            active.faulted = true;
            tracing::error!(
                armed = active.timers.len(),
                "background scheduler gone; armed timers will not fire"
            );
        }
    }
}

impl SchedulingApi for Coordinator {
    fn set_interval(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError> {
        self.register(TimerKind::Interval, callback, delay, args)
    }

    fn set_timeout(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError> {
        self.register(TimerKind::Timeout, callback, delay, args)
    }

    fn clear_interval(&self, id: TimerId) {
        self.unregister(TimerKind::Interval, id)
    }

    fn clear_timeout(&self, id: TimerId) {
        self.unregister(TimerKind::Timeout, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NativeTimers;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> Arc<Coordinator> {
        let globals = Arc::new(HostGlobals::new(Arc::new(NativeTimers::new())));
        Arc::new(Coordinator::new(globals))
    }

    fn counting(hits: &Arc<AtomicUsize>) -> Value {
        let hits = hits.clone();
        Value::func(move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_timeout_fires_exactly_once() {
        let c = coordinator();
        c.activate().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let id = c
            .set_timeout(counting(&hits), Value::Number(1000.0), vec![])
            .unwrap();
        assert!(c.is_armed(id));

        assert!(c.deliver(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // One-shot: no longer resolvable.
        assert!(!c.is_armed(id));
        assert!(!c.deliver(id));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        c.deactivate();
    }

    #[test]
    fn test_timeout_forwards_arguments() {
        let c = coordinator();
        c.activate().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = c
            .set_timeout(
                Value::func(move |args| {
                    sink.lock().unwrap().extend_from_slice(args);
                }),
                Value::Number(5.0),
                vec![Value::Number(1.0), Value::String("two".into())],
            )
            .unwrap();

        c.deliver(id);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::Number(1.0), Value::String("two".into())]
        );

        c.deactivate();
    }

    #[test]
    fn test_interval_stays_armed_until_cancelled() {
        let c = coordinator();
        c.activate().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let id = c
            .set_interval(counting(&hits), Value::Number(1000.0), vec![])
            .unwrap();
        assert!(c.is_armed(id));

        c.deliver(id);
        c.deliver(id);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(c.is_armed(id));

        c.clear_interval(id);
        assert!(!c.deliver(id));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        c.deactivate();
    }

    #[test]
    fn test_activate_idempotent() {
        let c = coordinator();
        assert!(c.activate().unwrap());
        assert!(!c.activate().unwrap());
        c.deactivate();
        c.deactivate(); // second deactivate is a no-op
        assert!(c.activate().unwrap());
        c.deactivate();
    }

    #[test]
    fn test_ids_monotonic_across_reactivation() {
        let c = coordinator();
        c.activate().unwrap();
        let first = c
            .set_timeout(Value::func(|_| {}), Value::Number(50.0), vec![])
            .unwrap();
        c.deactivate();

        c.activate().unwrap();
        let second = c
            .set_timeout(Value::func(|_| {}), Value::Number(50.0), vec![])
            .unwrap();
        assert!(second > first);
        c.deactivate();
    }

    #[test]
    fn test_delay_sanitized_at_registration() {
        let c = coordinator();
        c.activate().unwrap();

        let negative = c
            .set_timeout(Value::func(|_| {}), Value::Number(-50.0), vec![])
            .unwrap();
        let non_numeric = c
            .set_timeout(Value::func(|_| {}), Value::String("abc".into()), vec![])
            .unwrap();

        assert_eq!(c.requested_delay(negative), Some(0));
        assert_eq!(c.requested_delay(non_numeric), Some(0));

        c.deactivate();
    }

    #[test]
    fn test_rejects_non_function_callback() {
        let c = coordinator();
        c.activate().unwrap();

        let err = c
            .set_interval(Value::String("not a function".into()), Value::Number(5.0), vec![])
            .unwrap_err();
        assert!(matches!(err, TimerError::TypeError(_)));
        assert_eq!(c.armed_timers(), 0);

        c.deactivate();
    }

    #[test]
    fn test_cancelled_then_fired_is_ignored() {
        let c = coordinator();
        c.activate().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let id = c
            .set_timeout(counting(&hits), Value::Number(1000.0), vec![])
            .unwrap();

        c.clear_timeout(id);
        // A fired notification already in flight arrives after the cancel.
        assert!(!c.deliver(id));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        c.deactivate();
    }

    #[test]
    fn test_panicking_callback_does_not_silence_others() {
        let c = coordinator();
        c.activate().unwrap();

        let bad = c
            .set_timeout(Value::func(|_| panic!("boom")), Value::Number(5.0), vec![])
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let good = c
            .set_timeout(counting(&hits), Value::Number(5.0), vec![])
            .unwrap();

        assert!(c.deliver(bad)); // caught and reported, not propagated
        assert!(c.deliver(good));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        c.deactivate();
    }

    #[test]
    fn test_deactivate_clears_armed_timers() {
        let c = coordinator();
        c.activate().unwrap();

        c.set_interval(Value::func(|_| {}), Value::Number(1000.0), vec![])
            .unwrap();
        c.set_timeout(Value::func(|_| {}), Value::Number(1000.0), vec![])
            .unwrap();
        assert_eq!(c.armed_timers(), 2);

        c.deactivate();
        assert_eq!(c.armed_timers(), 0);
        assert!(!c.is_active());
    }
}
