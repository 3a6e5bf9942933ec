//! Task facade and main-loop bridge
//!
//! [`Task`] wraps a backend selected by mode name and wires its channels
//! to user callbacks through a periodic bridge on the host loop. The
//! backend starts lazily, on the first `on_progress` or `on_done`
//! registration; a task nobody listens to does no work.
//!
//! The bridge holds only non-owning handles (a weak backend reference
//! and the shared callback table), drains the channels each tick, and
//! cancels itself once completion has been delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use pulse_loop::{EventLoop, FaultPolicy, PeriodicTimer};

use crate::backend::{WorkResult, WorkerBackend};
use crate::context::TaskContext;
use crate::registry;
use crate::value::TaskValue;
use crate::TaskError;

/// Default bridge cadence (~60Hz)
const DEFAULT_BRIDGE_INTERVAL_MS: u64 = 16;

static DROP_INTERMEDIATE: AtomicBool = AtomicBool::new(false);

/// Process-wide switch: when enabled, each bridge tick delivers only the
/// newest pending progress value per task (never out of order)
pub fn set_drop_intermediate_progress(enabled: bool) {
    DROP_INTERMEDIATE.store(enabled, Ordering::Release);
}

pub fn drop_intermediate_progress() -> bool {
    DROP_INTERMEDIATE.load(Ordering::Acquire)
}

type ProgressFn = Box<dyn FnMut(TaskValue) + Send>;
type MessageFn = Box<dyn FnMut(TaskValue) + Send>;
type DoneFn = Box<dyn FnOnce(Option<TaskError>) + Send>;

#[derive(Default)]
struct Callbacks {
    progress: Option<ProgressFn>,
    message: Option<MessageFn>,
    done: Option<DoneFn>,
}

/// A background task bound to a host loop
///
/// Owns its backend exclusively; the backend lives as long as the task
/// unless [`close`] tears it down early. Not thread-safe: drive it from
/// the loop thread only, and let the worker talk through the channels.
///
/// [`close`]: Task::close
pub struct Task {
    mode: String,
    backend: Arc<dyn WorkerBackend>,
    callbacks: Arc<Mutex<Callbacks>>,
    event_loop: EventLoop,
    bridge: Arc<Mutex<Option<PeriodicTimer>>>,
    bridge_interval_ms: u64,
    started: bool,
}

impl Task {
    /// Construct a task without starting it
    ///
    /// Fails synchronously on an unknown mode, or (isolate mode) when
    /// `data` cannot cross the boundary.
    pub fn new<D, W>(
        event_loop: &EventLoop,
        data: D,
        mode: &str,
        work: W,
    ) -> Result<Self, TaskError>
    where
        D: Into<TaskValue>,
        W: FnOnce(&TaskContext, TaskValue) -> WorkResult + Send + 'static,
    {
        let Some(factory) = registry::backend_for(mode) else {
            return Err(TaskError::UnknownMode {
                mode: mode.to_string(),
                registered: registry::registered_modes().join(", "),
            });
        };
        let backend = factory(event_loop, data.into(), Box::new(work))?;

        Ok(Self {
            mode: mode.to_string(),
            backend: Arc::from(backend),
            callbacks: Arc::new(Mutex::new(Callbacks::default())),
            event_loop: event_loop.clone(),
            bridge: Arc::new(Mutex::new(None)),
            bridge_interval_ms: DEFAULT_BRIDGE_INTERVAL_MS,
            started: false,
        })
    }

    /// Override the bridge drain cadence; only effective before start
    pub fn bridge_interval_ms(mut self, interval_ms: u64) -> Self {
        if !self.started {
            self.bridge_interval_ms = interval_ms.max(1);
        }
        self
    }

    /// Register the progress callback and start the backend
    ///
    /// Progress values drained while no callback is registered are
    /// discarded, so attach this before (or together with) `on_done`.
    pub fn on_progress<F>(self, callback: F) -> Self
    where
        F: FnMut(TaskValue) + Send + 'static,
    {
        self.callbacks.lock().unwrap().progress = Some(Box::new(callback));
        self.start()
    }

    /// Register the message callback; does not start the backend
    pub fn on_message<F>(self, callback: F) -> Self
    where
        F: FnMut(TaskValue) + Send + 'static,
    {
        self.callbacks.lock().unwrap().message = Some(Box::new(callback));
        self
    }

    /// Register the completion callback and start the backend
    ///
    /// Fires exactly once per task, with `None` for a clean finish or
    /// the recorded error otherwise. If the task already completed, the
    /// callback fires immediately.
    pub fn on_done<F>(self, callback: F) -> Self
    where
        F: FnOnce(Option<TaskError>) + Send + 'static,
    {
        if self.started && self.backend.is_done() {
            if let Some(outcome) = self.backend.take_completion() {
                callback(outcome);
                return self;
            }
        }
        self.callbacks.lock().unwrap().done = Some(Box::new(callback));
        self.start()
    }

    fn start(mut self) -> Self {
        if self.started {
            return self;
        }
        self.started = true;

        let weak = Arc::downgrade(&self.backend);
        let callbacks = Arc::clone(&self.callbacks);
        let bridge_slot = Arc::clone(&self.bridge);
        match self.event_loop.schedule_periodic(
            self.bridge_interval_ms,
            FaultPolicy::Cancel,
            move || {
                bridge_tick(&weak, &callbacks, &bridge_slot);
                Ok(())
            },
        ) {
            Ok(timer) => *self.bridge.lock().unwrap() = Some(timer),
            Err(error) => tracing::error!("failed to schedule task bridge: {error}"),
        }

        tracing::debug!(mode = %self.mode, "starting task backend");
        // The sync backend blocks here until the work returns; the
        // bridge is already installed so pumped pause waits drain it
        self.backend.start();
        self
    }

    /// Post a pause token; the worker observes it at a control point
    pub fn pause(&self) {
        self.backend.pause();
    }

    pub fn resume(&self) {
        self.backend.resume();
    }

    /// Post a stop token; cooperative, not preemptive
    pub fn stop(&self) {
        self.backend.stop();
    }

    /// Send a user message to the worker
    pub fn send_message(&self, value: impl Into<TaskValue>) -> Result<(), TaskError> {
        self.backend.post_message(value.into())
    }

    /// Unconditional teardown, valid in any state; idempotent
    ///
    /// The bridge stays alive long enough to deliver the final
    /// completion, then cancels itself.
    pub fn close(&self) {
        self.backend.close();
    }

    pub fn is_done(&self) -> bool {
        self.backend.is_done()
    }

    pub fn is_paused(&self) -> bool {
        self.backend.is_paused()
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// A cloneable, non-owning control handle
    ///
    /// Usable from host-loop callbacks, which are the only way to resume or stop
    /// a sync-mode task, whose blocking run leaves nothing else running.
    pub fn controller(&self) -> TaskController {
        TaskController {
            backend: Arc::downgrade(&self.backend),
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        // Dropping abandons delivery; the worker is not killed; that
        // is close()'s job
        if let Some(timer) = self.bridge.lock().unwrap().take() {
            timer.cancel();
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("mode", &self.mode)
            .field("started", &self.started)
            .field("done", &self.backend.is_done())
            .finish()
    }
}

/// Non-owning control handle for a [`Task`]
///
/// Every operation is a no-op (or [`TaskError::Stopped`]) once the task
/// has been dropped.
#[derive(Clone)]
pub struct TaskController {
    backend: Weak<dyn WorkerBackend>,
}

impl TaskController {
    pub fn pause(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.pause();
        }
    }

    pub fn resume(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.resume();
        }
    }

    pub fn stop(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.stop();
        }
    }

    pub fn close(&self) {
        if let Some(backend) = self.backend.upgrade() {
            backend.close();
        }
    }

    pub fn send_message(&self, value: impl Into<TaskValue>) -> Result<(), TaskError> {
        match self.backend.upgrade() {
            Some(backend) => backend.post_message(value.into()),
            None => Err(TaskError::Stopped),
        }
    }

    pub fn is_done(&self) -> bool {
        self.backend.upgrade().map(|b| b.is_done()).unwrap_or(true)
    }

    pub fn is_paused(&self) -> bool {
        self.backend
            .upgrade()
            .map(|b| b.is_paused())
            .unwrap_or(false)
    }
}

/// One bridge tick: drain the backend into the callbacks, deliver
/// completion at most once, stop ticking when there is nothing left to
/// deliver.
fn bridge_tick(
    backend: &Weak<dyn WorkerBackend>,
    callbacks: &Arc<Mutex<Callbacks>>,
    bridge: &Arc<Mutex<Option<PeriodicTimer>>>,
) {
    let Some(backend) = backend.upgrade() else {
        cancel_bridge(bridge);
        return;
    };

    // Observe completion before draining: everything the worker emitted
    // before finishing is already queued, so nothing can be missed
    let finished = backend.is_done();
    let drained = backend.drain();

    dispatch(callbacks, drained.progress, Channel::Progress);
    dispatch(callbacks, drained.messages, Channel::Message);

    if finished {
        let done = callbacks.lock().unwrap().done.take();
        if let Some(done) = done {
            if let Some(outcome) = backend.take_completion() {
                done(outcome);
            }
        }
        cancel_bridge(bridge);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Channel {
    Progress,
    Message,
}

fn dispatch(callbacks: &Arc<Mutex<Callbacks>>, mut values: Vec<TaskValue>, channel: Channel) {
    if values.is_empty() {
        return;
    }

    if channel == Channel::Progress && drop_intermediate_progress() && values.len() > 1 {
        let dropped = values.len() - 1;
        tracing::trace!("dropping {dropped} intermediate progress values");
        values.drain(..dropped);
    }

    // Take the callback out so user code runs without the table locked
    let taken = {
        let mut cbs = callbacks.lock().unwrap();
        match channel {
            Channel::Progress => cbs.progress.take(),
            Channel::Message => cbs.message.take(),
        }
    };
    let Some(mut callback) = taken else {
        return;
    };

    for value in values {
        callback(value);
    }

    let mut cbs = callbacks.lock().unwrap();
    let slot = match channel {
        Channel::Progress => &mut cbs.progress,
        Channel::Message => &mut cbs.message,
    };
    if slot.is_none() {
        *slot = Some(callback);
    }
}

fn cancel_bridge(bridge: &Arc<Mutex<Option<PeriodicTimer>>>) {
    if let Some(timer) = bridge.lock().unwrap().take() {
        timer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn pump_until(el: &EventLoop, timeout_ms: u64, pred: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while !pred() {
            if Instant::now() >= deadline {
                return false;
            }
            el.pump();
            thread::sleep(Duration::from_millis(2));
        }
        true
    }

    #[test]
    fn test_unknown_mode_lists_registered() {
        let el = EventLoop::new();
        let result = Task::new(&el, TaskValue::Null, "fiber", |_ctx, _data| Ok(()));
        match result {
            Err(TaskError::UnknownMode { mode, registered }) => {
                assert_eq!(mode, "fiber");
                assert!(registered.contains("thread"));
                assert!(registered.contains("sync"));
            }
            other => panic!("expected UnknownMode, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_no_listeners_no_work() {
        let el = EventLoop::new();
        let task = Task::new(&el, TaskValue::Null, "thread", |ctx, _data| {
            ctx.emit(1)?;
            Ok(())
        })
        .unwrap();

        // No on_progress/on_done yet: nothing starts
        thread::sleep(Duration::from_millis(40));
        el.pump();
        assert!(!task.is_done());
        assert_eq!(el.pending(), 0);

        let task = task.on_done(|_| {});
        assert!(pump_until(&el, 3000, || task.is_done()));
    }

    #[test]
    fn test_on_message_alone_does_not_start() {
        let el = EventLoop::new();
        let task = Task::new(&el, TaskValue::Null, "thread", |_ctx, _data| Ok(()))
            .unwrap()
            .on_message(|_| {});

        thread::sleep(Duration::from_millis(40));
        assert!(!task.is_done());
        assert_eq!(el.pending(), 0);
    }

    #[test]
    fn test_mode_accessor_and_debug() {
        let el = EventLoop::new();
        let task = Task::new(&el, TaskValue::Null, "sync", |_ctx, _data| Ok(())).unwrap();
        assert_eq!(task.mode(), "sync");
        assert!(format!("{task:?}").contains("sync"));
    }

    #[test]
    fn test_controller_outlives_task_harmlessly() {
        let el = EventLoop::new();
        let task = Task::new(&el, TaskValue::Null, "thread", |_ctx, _data| Ok(())).unwrap();
        let controller = task.controller();
        drop(task);

        controller.pause();
        controller.stop();
        controller.close();
        assert!(controller.is_done());
        assert!(!controller.is_paused());
        assert!(matches!(
            controller.send_message(1),
            Err(TaskError::Stopped)
        ));
    }

    #[test]
    fn test_drop_intermediate_default_off() {
        assert!(!drop_intermediate_progress());
    }
}
