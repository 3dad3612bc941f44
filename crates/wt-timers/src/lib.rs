//! Worker-backed timers
//!
//! Replacement for a host's setInterval/setTimeout family that relocates the
//! actual timing onto a dedicated background thread, so timers keep firing
//! when the host throttles its own main loop.
//!
//! Pieces:
//! - [`SchedulingApi`] - the four scheduling functions as one trait object
//! - [`HostGlobals`] - the global slot those functions are installed into
//! - [`NativeTimers`] - baseline caller-thread implementation (the stand-in
//!   for the host's native, throttle-prone functions)
//! - [`Coordinator`] - swaps itself into the slot and multiplexes timers
//!   onto the `wt-sched` background thread

mod api;
mod coordinator;
mod globals;
mod native;

pub use api::{sanitize_delay, SchedulingApi};
pub use coordinator::Coordinator;
pub use globals::{activate, current, deactivate, HostGlobals};
pub use native::NativeTimers;
pub use wt_sched::{TimerId, TimerKind};

use std::fmt;
use std::sync::Arc;

/// Callback invoked with the trailing arguments captured at registration.
pub type Callback = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Dynamic value crossing the scheduling API: callbacks, delays and the
/// trailing arguments forwarded to the callback at fire time.
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Function(Callback),
}

impl Value {
    /// Wrap a closure as a callback value.
    pub fn func(f: impl Fn(&[Value]) + Send + Sync + 'static) -> Self {
        Value::Function(Arc::new(f))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::Function(_) => write!(f, "Function"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Scheduling error
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("type error: {0}")]
    TypeError(String),

    #[error("environment error: {0}")]
    Environment(String),
}
