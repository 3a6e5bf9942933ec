//! Pulse Background Tasks
//!
//! Offloads long-running work from the cooperative host loop to an
//! interchangeable worker backend: a shared-memory thread, a
//! copy-isolated unit, or a same-thread diagnostic baseline. Workers
//! exchange progress values and control messages with the loop through
//! per-task channels. A periodic bridge on the host loop drains the channels
//! into registered callbacks and fires completion exactly once.
//!
//! # Example
//! ```rust,ignore
//! use pulse_loop::EventLoop;
//! use pulse_task::Task;
//!
//! let el = EventLoop::new();
//! let task = Task::new(&el, vec![1.into(), 2.into(), 3.into()], "thread", |ctx, data| {
//!     for item in data.as_list().unwrap() {
//!         ctx.check_pause()?;
//!         ctx.emit(item.as_int().unwrap() * 10)?;
//!     }
//!     Ok(())
//! })?
//! .on_progress(|value| println!("progress: {value:?}"))
//! .on_done(|outcome| println!("done: {outcome:?}"));
//!
//! // ... keep pumping the loop; the bridge delivers the callbacks
//! ```

mod backend;
mod channel;
mod context;
mod port;
mod registry;
mod task;
mod value;

pub use backend::{Drained, WorkFn, WorkResult, WorkerBackend};
pub use context::TaskContext;
pub use registry::{backend_for, register_mode, registered_modes, BackendFactory};
pub use task::{
    drop_intermediate_progress, set_drop_intermediate_progress, Task, TaskController,
};
pub use value::{BoundaryError, SharedValue, TaskValue};

/// Task-layer error
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("unknown task mode `{mode}`; registered modes: {registered}")]
    UnknownMode { mode: String, registered: String },

    /// Cooperative cancellation: a stop token was observed, or the task
    /// was closed
    #[error("task stopped")]
    Stopped,

    #[error("task work failed: {0}")]
    Failed(String),

    #[error("task work panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Boundary(#[from] BoundaryError),
}
