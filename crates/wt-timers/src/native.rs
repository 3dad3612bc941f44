//! Native (caller-thread) timers
//!
//! Baseline [`SchedulingApi`] implementation that arms deadlines in-process
//! and fires them from a `pump()` on the caller's own thread. This is the
//! stand-in for the host's native scheduling functions: it is what
//! [`HostGlobals`](crate::HostGlobals) holds before activation, what
//! deactivated coordinators degrade to, and what unknown-id cancellations
//! fall back to.

use crate::api::{next_timer_id, require_function, sanitize_delay};
use crate::{Callback, SchedulingApi, TimerError, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use wt_sched::TimerId;

struct NativeTimer {
    callback: Callback,
    args: Vec<Value>,
    deadline: Instant,
    /// Some for intervals, None for one-shots.
    period: Option<Duration>,
}

/// Caller-thread timer set, fired by [`NativeTimers::pump`].
pub struct NativeTimers {
    timers: Mutex<HashMap<TimerId, NativeTimer>>,
}

impl NativeTimers {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn register(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
        repeat: bool,
    ) -> Result<TimerId, TimerError> {
        let callback = require_function(&callback)?;
        let delay_ms = sanitize_delay(&delay);
        let period = Duration::from_millis(delay_ms);

        let id = next_timer_id();
        self.timers.lock().unwrap().insert(
            id,
            NativeTimer {
                callback,
                args,
                deadline: Instant::now() + period,
                period: repeat.then_some(period),
            },
        );
        Ok(id)
    }

    /// Fire every due timer on the calling thread. One-shots disarm,
    /// intervals re-arm. Returns the number of callbacks invoked.
    pub fn pump(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(TimerId, Callback, Vec<Value>)> = {
            let mut timers = self.timers.lock().unwrap();
            let ids: Vec<TimerId> = timers
                .iter()
                .filter(|(_, t)| t.deadline <= now)
                .map(|(id, _)| *id)
                .collect();

            let mut due = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(timer) = timers.get_mut(&id) else {
                    continue;
                };
                due.push((id, timer.callback.clone(), timer.args.clone()));
                match timer.period {
                    Some(period) => timer.deadline = now + period,
                    None => {
                        timers.remove(&id);
                    }
                }
            }
            due
        };

        // Lock released: callbacks may re-enter the scheduling API.
        let count = due.len();
        for (id, callback, args) in due {
            tracing::debug!(id, "native timer fired");
            callback(&args);
        }
        count
    }

    /// Time until the nearest armed deadline, if any.
    pub fn time_until_next(&self) -> Option<Duration> {
        let now = Instant::now();
        self.timers
            .lock()
            .unwrap()
            .values()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min()
    }

    pub fn pending(&self) -> usize {
        self.timers.lock().unwrap().len()
    }
}

impl Default for NativeTimers {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulingApi for NativeTimers {
    fn set_interval(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError> {
        self.register(callback, delay, args, true)
    }

    fn set_timeout(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError> {
        self.register(callback, delay, args, false)
    }

    // Host native cancellation clears by id alone, whichever kind it is.
    fn clear_interval(&self, id: TimerId) {
        self.timers.lock().unwrap().remove(&id);
    }

    fn clear_timeout(&self, id: TimerId) {
        self.timers.lock().unwrap().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_timeout_fires_from_pump() {
        let timers = NativeTimers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        timers
            .set_timeout(
                Value::func(move |args| {
                    assert_eq!(args, &[Value::Number(42.0)]);
                    h.fetch_add(1, Ordering::SeqCst);
                }),
                Value::Number(0.0),
                vec![Value::Number(42.0)],
            )
            .unwrap();

        assert_eq!(timers.pump(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // One-shot: disarmed after firing.
        assert_eq!(timers.pending(), 0);
        assert_eq!(timers.pump(), 0);
    }

    #[test]
    fn test_interval_stays_armed() {
        let timers = NativeTimers::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = timers
            .set_interval(
                Value::func(move |_| {
                    h.fetch_add(1, Ordering::SeqCst);
                }),
                Value::Number(0.0),
                vec![],
            )
            .unwrap();

        timers.pump();
        timers.pump();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(timers.pending(), 1);

        timers.clear_interval(id);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_not_due_not_fired() {
        let timers = NativeTimers::new();
        timers
            .set_timeout(Value::func(|_| {}), Value::Number(60_000.0), vec![])
            .unwrap();

        assert_eq!(timers.pump(), 0);
        assert_eq!(timers.pending(), 1);
        assert!(timers.time_until_next().unwrap() > Duration::from_secs(50));
    }

    #[test]
    fn test_clear_unknown_id_is_noop() {
        let timers = NativeTimers::new();
        timers.clear_timeout(999);
        timers.clear_interval(999);
    }

    #[test]
    fn test_rejects_non_function_callback() {
        let timers = NativeTimers::new();
        let err = timers
            .set_timeout(Value::Null, Value::Number(10.0), vec![])
            .unwrap_err();
        assert!(matches!(err, TimerError::TypeError(_)));
    }
}
