//! Periodic timers
//!
//! Cancellable repeating callbacks built on the event loop's one-shot
//! primitive. A failing callback never escapes into the host loop; what
//! happens instead is governed by the timer's [`FaultPolicy`].

use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::event_loop::{EventLoop, TimerId};
use crate::SchedError;

/// Error produced by a tick callback or fault handler
pub type TickError = Box<dyn Error + Send + Sync>;

type TickFn = Box<dyn FnMut() -> Result<(), TickError> + Send>;

/// Fault handler invoked with the tick error under [`FaultPolicy::Handler`]
pub type FaultHandler = Box<dyn FnMut(&TickError) -> Result<(), TickError> + Send>;

/// What a periodic timer does when its callback fails
pub enum FaultPolicy {
    /// Record the error, report it via `tracing::error!`, and cancel
    Cancel,
    /// Invoke a handler; ticking continues unless the handler itself fails
    Handler(FaultHandler),
    /// Record the error and cancel without reporting anything
    Silent,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self::Cancel
    }
}

impl std::fmt::Debug for FaultPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancel => write!(f, "Cancel"),
            Self::Handler(_) => write!(f, "Handler"),
            Self::Silent => write!(f, "Silent"),
        }
    }
}

struct PeriodicState {
    interval_ms: u64,
    // Taken out of the lock for the duration of each invocation
    callback: Option<TickFn>,
    policy: FaultPolicy,
    last_error: Option<Arc<dyn Error + Send + Sync>>,
    late_ticks: u64,
    cancelled: bool,
    expected_at: Instant,
    pending: Option<TimerId>,
}

/// Handle to a repeating callback on the event loop
///
/// Cloning returns another handle to the same timer. Dropping every
/// handle does not cancel the timer; it keeps ticking until [`cancel`]
/// or a fault policy stops it.
///
/// [`cancel`]: PeriodicTimer::cancel
#[derive(Clone)]
pub struct PeriodicTimer {
    state: Arc<Mutex<PeriodicState>>,
    event_loop: EventLoop,
}

impl EventLoop {
    /// Schedule a repeating callback every `interval_ms` milliseconds
    ///
    /// Fails before anything is scheduled when `interval_ms` is zero.
    pub fn schedule_periodic<F>(
        &self,
        interval_ms: u64,
        policy: FaultPolicy,
        callback: F,
    ) -> Result<PeriodicTimer, SchedError>
    where
        F: FnMut() -> Result<(), TickError> + Send + 'static,
    {
        if interval_ms == 0 {
            return Err(SchedError::InvalidInterval(interval_ms));
        }

        let state = Arc::new(Mutex::new(PeriodicState {
            interval_ms,
            callback: Some(Box::new(callback)),
            policy,
            last_error: None,
            late_ticks: 0,
            cancelled: false,
            expected_at: Instant::now() + Duration::from_millis(interval_ms),
            pending: None,
        }));

        let tick_state = Arc::clone(&state);
        let tick_loop = self.clone();
        let id = self.schedule_once(interval_ms, move || tick(tick_state, tick_loop));
        state.lock().unwrap().pending = Some(id);

        Ok(PeriodicTimer {
            state,
            event_loop: self.clone(),
        })
    }
}

impl PeriodicTimer {
    /// Cancel the timer; further ticks are no-ops. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if let Some(id) = state.pending.take() {
            self.event_loop.cancel(id);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Change the interval; takes effect from the next reschedule
    pub fn set_interval_ms(&self, interval_ms: u64) -> Result<(), SchedError> {
        if interval_ms == 0 {
            return Err(SchedError::InvalidInterval(interval_ms));
        }
        self.state.lock().unwrap().interval_ms = interval_ms;
        Ok(())
    }

    pub fn interval_ms(&self) -> u64 {
        self.state.lock().unwrap().interval_ms
    }

    /// The error that stopped the timer, if any
    pub fn last_error(&self) -> Option<Arc<dyn Error + Send + Sync>> {
        self.state.lock().unwrap().last_error.clone()
    }

    /// How many ticks fired more than one interval behind schedule
    pub fn late_tick_count(&self) -> u64 {
        self.state.lock().unwrap().late_ticks
    }
}

impl std::fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("PeriodicTimer")
            .field("interval_ms", &state.interval_ms)
            .field("cancelled", &state.cancelled)
            .field("late_ticks", &state.late_ticks)
            .finish()
    }
}

/// One tick: run the callback outside the state lock, apply the fault
/// policy on error, reschedule unless cancelled.
fn tick(state: Arc<Mutex<PeriodicState>>, event_loop: EventLoop) {
    let Some(mut callback) = begin_tick(&state) else {
        return;
    };

    let outcome = match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(result) => result,
        Err(payload) => Err(TickError::from(panic_message(payload))),
    };

    let fatal = match outcome {
        Ok(()) => None,
        Err(error) => apply_fault_policy(&state, error),
    };

    finish_tick(&state, &event_loop, callback, fatal);
}

fn begin_tick(state: &Arc<Mutex<PeriodicState>>) -> Option<TickFn> {
    let mut s = state.lock().unwrap();
    if s.cancelled {
        return None;
    }
    s.pending = None;
    if Instant::now().duration_since(s.expected_at) > Duration::from_millis(s.interval_ms) {
        s.late_ticks += 1;
    }
    // None means a tick is already mid-invocation; skip
    s.callback.take()
}

/// Returns the error that should cancel the timer, if any
fn apply_fault_policy(
    state: &Arc<Mutex<PeriodicState>>,
    error: TickError,
) -> Option<TickError> {
    let policy = std::mem::replace(&mut state.lock().unwrap().policy, FaultPolicy::Silent);
    match policy {
        FaultPolicy::Cancel => {
            tracing::error!("periodic timer callback failed: {error}");
            state.lock().unwrap().policy = FaultPolicy::Cancel;
            Some(error)
        }
        FaultPolicy::Silent => {
            state.lock().unwrap().policy = FaultPolicy::Silent;
            Some(error)
        }
        FaultPolicy::Handler(mut handler) => {
            // The handler is user code: run it outside the lock, contain
            // its panics just like the callback's
            let handled = panic::catch_unwind(AssertUnwindSafe(|| handler(&error)));
            state.lock().unwrap().policy = FaultPolicy::Handler(handler);
            match handled {
                Ok(Ok(())) => None,
                Ok(Err(handler_error)) => Some(handler_error),
                Err(payload) => Some(TickError::from(panic_message(payload))),
            }
        }
    }
}

fn finish_tick(
    state: &Arc<Mutex<PeriodicState>>,
    event_loop: &EventLoop,
    callback: TickFn,
    fatal: Option<TickError>,
) {
    let mut s = state.lock().unwrap();
    s.callback = Some(callback);

    if let Some(error) = fatal {
        s.last_error = Some(Arc::from(error));
        s.cancelled = true;
    }
    if s.cancelled {
        return;
    }

    let delay = s.interval_ms;
    s.expected_at = Instant::now() + Duration::from_millis(delay);
    let tick_state = Arc::clone(state);
    let tick_loop = event_loop.clone();
    s.pending = Some(event_loop.schedule_once(delay, move || tick(tick_state, tick_loop)));
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("callback panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("callback panicked: {s}")
    } else {
        "callback panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    fn pump_while<F: Fn() -> bool>(el: &EventLoop, keep_going: F) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while keep_going() && Instant::now() < deadline {
            el.pump();
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let el = EventLoop::new();
        let result = el.schedule_periodic(0, FaultPolicy::Cancel, || Ok(()));
        assert!(matches!(result, Err(SchedError::InvalidInterval(0))));
        assert_eq!(el.pending(), 0);
    }

    #[test]
    fn test_fires_repeatedly_until_cancelled() {
        let el = EventLoop::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let t = Arc::clone(&ticks);
        let timer = el
            .schedule_periodic(5, FaultPolicy::Cancel, move || {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        pump_while(&el, || ticks.load(Ordering::SeqCst) < 3);
        assert!(ticks.load(Ordering::SeqCst) >= 3);

        timer.cancel();
        assert!(timer.is_cancelled());
        let after = ticks.load(Ordering::SeqCst);

        thread::sleep(Duration::from_millis(30));
        el.pump();
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_cancel_idempotent() {
        let el = EventLoop::new();
        let timer = el
            .schedule_periodic(10, FaultPolicy::Cancel, || Ok(()))
            .unwrap();

        timer.cancel();
        timer.cancel();
        assert!(timer.is_cancelled());
    }

    #[test]
    fn test_cancel_policy_stops_on_error() {
        let el = EventLoop::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let t = Arc::clone(&ticks);
        let timer = el
            .schedule_periodic(5, FaultPolicy::Cancel, move || {
                let n = t.fetch_add(1, Ordering::SeqCst);
                if n == 1 {
                    return Err("boom".into());
                }
                Ok(())
            })
            .unwrap();

        pump_while(&el, || !timer.is_cancelled());

        // Tick 0 succeeded, tick 1 failed, no tick 2
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
        assert!(timer.is_cancelled());
        assert_eq!(timer.last_error().unwrap().to_string(), "boom");
    }

    #[test]
    fn test_panic_contained_at_tick_boundary() {
        let el = EventLoop::new();
        let timer = el
            .schedule_periodic(5, FaultPolicy::Silent, || panic!("bad tick"))
            .unwrap();

        pump_while(&el, || !timer.is_cancelled());

        assert!(timer.is_cancelled());
        assert!(timer
            .last_error()
            .unwrap()
            .to_string()
            .contains("bad tick"));
    }

    #[test]
    fn test_handler_policy_keeps_ticking() {
        let el = EventLoop::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let handled = Arc::new(AtomicU32::new(0));

        let t = Arc::clone(&ticks);
        let h = Arc::clone(&handled);
        let timer = el
            .schedule_periodic(
                5,
                FaultPolicy::Handler(Box::new(move |err| {
                    assert_eq!(err.to_string(), "flaky");
                    h.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                move || {
                    if t.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err("flaky".into());
                    }
                    Ok(())
                },
            )
            .unwrap();

        pump_while(&el, || ticks.load(Ordering::SeqCst) < 3);

        assert!(ticks.load(Ordering::SeqCst) >= 3);
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(!timer.is_cancelled());
        assert!(timer.last_error().is_none());
        timer.cancel();
    }

    #[test]
    fn test_failing_handler_cancels_with_handler_error() {
        let el = EventLoop::new();

        let timer = el
            .schedule_periodic(
                5,
                FaultPolicy::Handler(Box::new(|_err| Err("handler broke".into()))),
                || Err("original".into()),
            )
            .unwrap();

        pump_while(&el, || !timer.is_cancelled());

        assert!(timer.is_cancelled());
        assert_eq!(timer.last_error().unwrap().to_string(), "handler broke");
    }

    #[test]
    fn test_silent_policy_records_without_reporting() {
        let el = EventLoop::new();
        let timer = el
            .schedule_periodic(5, FaultPolicy::Silent, || Err("quiet".into()))
            .unwrap();

        pump_while(&el, || !timer.is_cancelled());

        assert!(timer.is_cancelled());
        assert_eq!(timer.last_error().unwrap().to_string(), "quiet");
    }

    #[test]
    fn test_set_interval_validation() {
        let el = EventLoop::new();
        let timer = el
            .schedule_periodic(10, FaultPolicy::Cancel, || Ok(()))
            .unwrap();

        assert!(matches!(
            timer.set_interval_ms(0),
            Err(SchedError::InvalidInterval(0))
        ));
        assert_eq!(timer.interval_ms(), 10);

        timer.set_interval_ms(25).unwrap();
        assert_eq!(timer.interval_ms(), 25);
        timer.cancel();
    }

    #[test]
    fn test_late_ticks_recorded_not_coalesced() {
        let el = EventLoop::new();
        let ticks = Arc::new(AtomicU32::new(0));

        let t = Arc::clone(&ticks);
        let timer = el
            .schedule_periodic(5, FaultPolicy::Cancel, move || {
                t.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        // Stall the loop for several intervals, then drain once
        thread::sleep(Duration::from_millis(40));
        el.pump();

        // One invocation for the whole stall, recorded as late
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(timer.late_tick_count() >= 1);
        timer.cancel();
    }

    #[test]
    fn test_cancel_from_inside_callback() {
        let el = EventLoop::new();
        let ticks = Arc::new(AtomicU32::new(0));
        let slot: Arc<Mutex<Option<PeriodicTimer>>> = Arc::new(Mutex::new(None));

        let t = Arc::clone(&ticks);
        let s = Arc::clone(&slot);
        let timer = el
            .schedule_periodic(5, FaultPolicy::Cancel, move || {
                t.fetch_add(1, Ordering::SeqCst);
                if let Some(me) = s.lock().unwrap().as_ref() {
                    me.cancel();
                }
                Ok(())
            })
            .unwrap();
        *slot.lock().unwrap() = Some(timer.clone());

        pump_while(&el, || !timer.is_cancelled());

        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert!(timer.is_cancelled());
    }
}
