//! Pulse Event Loop
//!
//! Cooperative single-threaded scheduling for interactive applications:
//! one-shot callbacks drained by an explicit pump, and periodic timers
//! with configurable fault policies.
//!
//! Nothing here ever blocks or preempts: callbacks run to completion on
//! the pumping thread, in deadline order, once their delay has elapsed.

mod event_loop;
mod timer;

pub use event_loop::{EventLoop, TimerId};
pub use timer::{FaultHandler, FaultPolicy, PeriodicTimer, TickError};

/// Scheduling error
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("timer interval must be greater than zero (got {0}ms)")]
    InvalidInterval(u64),
}
