//! Background Timer Scheduler
//!
//! Owns native timer primitives on a dedicated thread so that timers keep
//! firing regardless of what the caller's own thread is doing. The scheduler
//! knows nothing about callbacks: it sees opaque [`TimerId`]s and delays in,
//! and emits one [`Fired`] notification per expiry out.
//!
//! Communication is two unidirectional mpsc channels: requests in, fired
//! notifications out.

use std::collections::HashMap;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Opaque timer handle, allocated by the caller, never reused.
pub type TimerId = u64;

/// Timer flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires every period until cancelled.
    Interval,
    /// Fires once, then disarms itself.
    Timeout,
}

/// Request message (caller -> scheduler)
#[derive(Debug, Clone)]
pub enum Request {
    Start {
        kind: TimerKind,
        id: TimerId,
        delay_ms: u64,
    },
    Cancel {
        kind: TimerKind,
        id: TimerId,
    },
    Shutdown,
}

/// Expiry notification (scheduler -> caller)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub id: TimerId,
}

/// Armed repeating timer
struct Repeating {
    deadline: Instant,
    period: Duration,
}

/// Caller-side handle to a running scheduler thread.
///
/// Dropping the handle shuts the thread down and joins it.
pub struct SchedulerHandle {
    requests: Sender<Request>,
    fired: Receiver<Fired>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Arm a timer under `id`. Returns false if the scheduler thread is gone.
    pub fn start(&self, kind: TimerKind, id: TimerId, delay_ms: u64) -> bool {
        self.requests
            .send(Request::Start { kind, id, delay_ms })
            .is_ok()
    }

    /// Disarm the timer under `id`, if armed. Fire-and-forget: unknown ids
    /// are ignored on the scheduler side, and a false return only means the
    /// scheduler thread is gone.
    pub fn cancel(&self, kind: TimerKind, id: TimerId) -> bool {
        self.requests.send(Request::Cancel { kind, id }).is_ok()
    }

    /// Poll for the next expiry notification without blocking.
    pub fn try_fired(&self) -> Result<Fired, TryRecvError> {
        self.fired.try_recv()
    }

    /// Block up to `timeout` for the next expiry notification.
    pub fn wait_fired(&self, timeout: Duration) -> Result<Fired, RecvTimeoutError> {
        self.fired.recv_timeout(timeout)
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("scheduler thread panicked before shutdown");
            }
        }
    }
}

/// Spawn the scheduler thread and return the caller-side handle.
///
/// Fails only if the host refuses to spawn a thread, which callers treat as
/// "no background execution context available".
pub fn spawn() -> io::Result<SchedulerHandle> {
    let (request_tx, request_rx) = mpsc::channel();
    let (fired_tx, fired_rx) = mpsc::channel();

    let thread = thread::Builder::new()
        .name("wt-sched".into())
        .spawn(move || run(request_rx, fired_tx))?;

    Ok(SchedulerHandle {
        requests: request_tx,
        fired: fired_rx,
        thread: Some(thread),
    })
}

/// Scheduler loop. Two independent maps, one per timer kind; the nearest
/// deadline bounds how long we wait for the next request.
fn run(requests: Receiver<Request>, fired: Sender<Fired>) {
    let mut intervals: HashMap<TimerId, Repeating> = HashMap::new();
    let mut timeouts: HashMap<TimerId, Instant> = HashMap::new();

    tracing::debug!("scheduler thread started");

    loop {
        let request = match next_deadline(&intervals, &timeouts) {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    // A permanently due timer (zero-delay interval) must not
                    // starve the request channel: service pending requests
                    // before firing, so cancel and shutdown always land.
                    match requests.try_recv() {
                        Ok(request) => request,
                        Err(TryRecvError::Empty) => {
                            if !fire_due(&mut intervals, &mut timeouts, &fired) {
                                break;
                            }
                            continue;
                        }
                        Err(TryRecvError::Disconnected) => break,
                    }
                } else {
                    match requests.recv_timeout(deadline - now) {
                        Ok(request) => request,
                        Err(RecvTimeoutError::Timeout) => {
                            if !fire_due(&mut intervals, &mut timeouts, &fired) {
                                break;
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            // Nothing armed: park until the next request.
            None => match requests.recv() {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        match request {
            Request::Start {
                kind: TimerKind::Interval,
                id,
                delay_ms,
            } => {
                let period = Duration::from_millis(delay_ms);
                intervals.insert(
                    id,
                    Repeating {
                        deadline: Instant::now() + period,
                        period,
                    },
                );
            }
            Request::Start {
                kind: TimerKind::Timeout,
                id,
                delay_ms,
            } => {
                timeouts.insert(id, Instant::now() + Duration::from_millis(delay_ms));
            }
            Request::Cancel {
                kind: TimerKind::Interval,
                id,
            } => {
                intervals.remove(&id);
            }
            Request::Cancel {
                kind: TimerKind::Timeout,
                id,
            } => {
                timeouts.remove(&id);
            }
            Request::Shutdown => break,
        }
    }

    tracing::debug!("scheduler thread exiting");
}

/// Send a notification for every due timer. One-shots disarm, repeating
/// timers re-arm one period from now (late periods coalesce rather than
/// burst). Returns false once the fired channel is closed.
fn fire_due(
    intervals: &mut HashMap<TimerId, Repeating>,
    timeouts: &mut HashMap<TimerId, Instant>,
    fired: &Sender<Fired>,
) -> bool {
    let now = Instant::now();

    let due: Vec<TimerId> = timeouts
        .iter()
        .filter(|(_, deadline)| **deadline <= now)
        .map(|(id, _)| *id)
        .collect();
    for id in due {
        timeouts.remove(&id);
        if fired.send(Fired { id }).is_err() {
            return false;
        }
    }

    for (id, timer) in intervals.iter_mut() {
        if timer.deadline <= now {
            if fired.send(Fired { id: *id }).is_err() {
                return false;
            }
            timer.deadline = now + timer.period;
        }
    }

    true
}

fn next_deadline(
    intervals: &HashMap<TimerId, Repeating>,
    timeouts: &HashMap<TimerId, Instant>,
) -> Option<Instant> {
    let interval = intervals.values().map(|t| t.deadline).min();
    let timeout = timeouts.values().copied().min();
    match (interval, timeout) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
