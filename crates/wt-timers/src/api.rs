//! Scheduling API seam
//!
//! The four host scheduling functions as one object, so implementations
//! (native, worker-backed) can be swapped behind a single trait.

use crate::{Callback, TimerError, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use wt_sched::TimerId;

static TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a [`TimerId`]. One process-wide monotonic counter shared by
/// every [`SchedulingApi`] implementation, so an id minted natively before
/// activation can never collide with one minted by a coordinator.
pub(crate) fn next_timer_id() -> TimerId {
    TIMER_ID.fetch_add(1, Ordering::SeqCst)
}

/// The host scheduling function set: periodic start, one-shot start, and
/// their cancellation functions. Signature-compatible with the host's
/// native versions: callback first, delay second (defaulting to 0 when
/// absent), trailing arguments forwarded to the callback at fire time.
pub trait SchedulingApi: Send + Sync {
    fn set_interval(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError>;

    fn set_timeout(
        &self,
        callback: Value,
        delay: Value,
        args: Vec<Value>,
    ) -> Result<TimerId, TimerError>;

    fn clear_interval(&self, id: TimerId);

    fn clear_timeout(&self, id: TimerId);
}

/// Reject non-invocable callbacks before any state is touched.
pub(crate) fn require_function(callback: &Value) -> Result<Callback, TimerError> {
    match callback {
        Value::Function(f) => Ok(f.clone()),
        other => Err(TimerError::TypeError(format!(
            "callback must be a function, got {other:?}"
        ))),
    }
}

/// Delay sanitization: non-numeric or absent input counts as 0, negatives
/// clamp to 0, fractional delays truncate.
pub fn sanitize_delay(delay: &Value) -> u64 {
    match delay {
        Value::Number(n) if n.is_finite() && *n > 0.0 => n.trunc() as u64,
        _ => 0,
    }
}
