//! Worker backends
//!
//! Interchangeable execution strategies behind the task facade. Every
//! backend implements the same contract; what differs is where the work
//! callback runs and how values cross to it.

mod sync;
mod thread;

pub(crate) mod isolate;

pub(crate) use isolate::IsolateBackend;
pub(crate) use sync::SyncBackend;
pub(crate) use thread::ThreadBackend;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::TaskContext;
use crate::value::TaskValue;
use crate::TaskError;

/// Result of a work callback
pub type WorkResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// The user's work callback, boxed for dispatch through the registry
pub type WorkFn = Box<dyn FnOnce(&TaskContext, TaskValue) -> WorkResult + Send + 'static>;

/// Backend lifecycle; `Done` is terminal and entered exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Running,
    Stopping,
    Done,
}

/// Everything a bridge tick pulls out of a backend
#[derive(Debug, Default)]
pub struct Drained {
    /// Progress values, in emission order
    pub progress: Vec<TaskValue>,
    /// Worker-to-main user messages, in emission order
    pub messages: Vec<TaskValue>,
}

/// Execution strategy contract
///
/// Backends are driven from the main-loop thread; the worker side talks
/// only through the channels. `stop` is cooperative (it posts a stop
/// token the worker must observe at a control point); `close` is
/// unconditional best-effort teardown.
pub trait WorkerBackend: Send + Sync {
    /// Begin executing the work callback; a no-op after the first call
    fn start(&self);

    /// Post a pause token
    fn pause(&self);

    /// Post a resume token
    fn resume(&self);

    /// Post a stop token; the worker unwinds at its next control point
    fn stop(&self);

    /// Unconditional teardown: closes the channels, force-records a
    /// stopped completion, abandons the worker. Idempotent.
    fn close(&self);

    fn is_done(&self) -> bool;

    fn is_paused(&self) -> bool;

    /// Main-to-worker user message
    fn post_message(&self, value: TaskValue) -> Result<(), TaskError>;

    /// Non-blocking drain of pending progress and messages
    fn drain(&self) -> Drained;

    /// Consume the completion outcome; `Some` exactly once per task
    fn take_completion(&self) -> Option<Option<TaskError>>;
}

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Monotonic suffix for worker thread names
pub(crate) fn next_worker_id() -> u64 {
    WORKER_SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Run the user's work callback, containing every failure mode
///
/// Returns the outcome to record in the completion slot: `None` for
/// normal completion, `Some(Stopped)` for a cooperative stop, `Some` of
/// a failure otherwise. Nothing escapes toward the host loop.
pub(crate) fn execute_work(
    work: WorkFn,
    ctx: &TaskContext,
    data: TaskValue,
) -> Option<TaskError> {
    let result = panic::catch_unwind(AssertUnwindSafe(move || work(ctx, data)));

    match result {
        Ok(Ok(())) => None,
        Ok(Err(error)) => match error.downcast::<TaskError>() {
            Ok(task_error) => match *task_error {
                TaskError::Stopped => {
                    tracing::debug!("task work unwound after stop");
                    Some(TaskError::Stopped)
                }
                other => {
                    tracing::error!("task work failed: {other}");
                    Some(other)
                }
            },
            Err(error) => {
                tracing::error!("task work failed: {error}");
                Some(TaskError::Failed(error.to_string()))
            }
        },
        Err(payload) => {
            let message = panic_message(payload);
            tracing::error!("task work panicked: {message}");
            Some(TaskError::Panicked(message))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
