//! Worker-side task context
//!
//! The handle handed to user work callbacks: progress emission,
//! bidirectional messaging, and the cooperative pause/stop point.
//! One type serves every backend; what differs is the transport behind
//! it (shared queues or isolate ports) and how a pause wait passes the
//! time (blocking, or pumping the host loop).
//!
//! `check_pause`, `wait_message`, and `check_message` are the only
//! places a worker observes control tokens. Code that never calls them
//! cannot be paused or stopped cooperatively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pulse_loop::EventLoop;

use crate::channel::{ChannelSet, Control, ControlToken, Polled};
use crate::port::{IsolatePorts, PortKind, PortMessage};
use crate::value::TaskValue;
use crate::TaskError;

/// How long a blocked wait sleeps before re-checking for shutdown
const WAIT_SLICE: Duration = Duration::from_millis(50);
/// Pause-wait granularity for blocking backends
const PAUSE_SLICE: Duration = Duration::from_millis(10);
/// Pause-wait granularity when each iteration also pumps the host loop
const PUMP_SLICE: Duration = Duration::from_millis(5);

pub(crate) enum Transport {
    Shared(Arc<ChannelSet>),
    Isolated(Arc<IsolatePorts>),
}

pub(crate) enum PauseWait {
    /// Block on the control queue (thread and isolate backends)
    Block,
    /// Pump the host loop once per wait iteration (sync backend)
    Pump(EventLoop),
}

enum Inbound {
    Token(ControlToken),
    User(TaskValue),
    Empty,
    Closed,
}

/// Handle given to the work callback
pub struct TaskContext {
    transport: Transport,
    pause_wait: PauseWait,
}

impl TaskContext {
    pub(crate) fn shared(channels: Arc<ChannelSet>, pause_wait: PauseWait) -> Self {
        Self {
            transport: Transport::Shared(channels),
            pause_wait,
        }
    }

    pub(crate) fn isolated(ports: Arc<IsolatePorts>) -> Self {
        Self {
            transport: Transport::Isolated(ports),
            pause_wait: PauseWait::Block,
        }
    }

    /// Emit a progress value; never blocks
    ///
    /// Values reach `on_progress` in emission order. Across an isolate
    /// boundary the value is encoded here, so a non-transferable value
    /// fails fast at this call site.
    pub fn emit(&self, value: impl Into<TaskValue>) -> Result<(), TaskError> {
        let value = value.into();
        match &self.transport {
            Transport::Shared(channels) => {
                if channels.progress.push(value) {
                    Ok(())
                } else {
                    Err(TaskError::Stopped)
                }
            }
            Transport::Isolated(ports) => {
                let bytes = value.to_bytes()?;
                if ports.outbound.push(PortMessage::new(PortKind::Progress, bytes)) {
                    Ok(())
                } else {
                    Err(TaskError::Stopped)
                }
            }
        }
    }

    /// Send a user message to the main side
    pub fn send_message(&self, value: impl Into<TaskValue>) -> Result<(), TaskError> {
        let value = value.into();
        match &self.transport {
            Transport::Shared(channels) => {
                if channels.outbound.push(value) {
                    Ok(())
                } else {
                    Err(TaskError::Stopped)
                }
            }
            Transport::Isolated(ports) => {
                let bytes = value.to_bytes()?;
                if ports.outbound.push(PortMessage::new(PortKind::Message, bytes)) {
                    Ok(())
                } else {
                    Err(TaskError::Stopped)
                }
            }
        }
    }

    /// Block until a main-side message arrives
    ///
    /// Control tokens encountered on the way are intercepted: pause and
    /// resume update the paused flag, stop cancels with
    /// [`TaskError::Stopped`] instead of returning data.
    pub fn wait_message(&self) -> Result<TaskValue, TaskError> {
        loop {
            match self.next_inbound()? {
                Inbound::Closed => return Err(TaskError::Stopped),
                Inbound::Empty => self.wait_activity(WAIT_SLICE),
                Inbound::Token(token) => self.apply_token(token)?,
                Inbound::User(value) => return Ok(value),
            }
        }
    }

    /// Non-blocking variant of [`wait_message`]
    ///
    /// Returns `Ok(None)` when no user payload is immediately available.
    ///
    /// [`wait_message`]: TaskContext::wait_message
    pub fn check_message(&self) -> Result<Option<TaskValue>, TaskError> {
        loop {
            match self.next_inbound()? {
                Inbound::Closed => return Err(TaskError::Stopped),
                Inbound::Empty => return Ok(None),
                Inbound::Token(token) => self.apply_token(token)?,
                Inbound::User(value) => return Ok(Some(value)),
            }
        }
    }

    /// The cooperative pause and cancellation point
    ///
    /// Applies pending control tokens; while paused, alternately waits
    /// for new control messages and yields execution until resume clears
    /// the flag or stop cancels. Call this at every safe point in work
    /// that should be pausable.
    pub fn check_pause(&self) -> Result<(), TaskError> {
        self.intercept_tokens()?;
        while self.paused_flag().load(Ordering::Acquire) {
            match &self.pause_wait {
                PauseWait::Block => self.wait_activity(PAUSE_SLICE),
                PauseWait::Pump(event_loop) => {
                    event_loop.pump();
                    self.wait_activity(PUMP_SLICE);
                }
            }
            self.intercept_tokens()?;
        }
        Ok(())
    }

    /// Pop one inbound entry of any kind
    fn next_inbound(&self) -> Result<Inbound, TaskError> {
        match &self.transport {
            Transport::Shared(channels) => match channels.inbound.pop() {
                Polled::Closed => Ok(Inbound::Closed),
                Polled::Empty => Ok(Inbound::Empty),
                Polled::Item(Control::Token(token)) => Ok(Inbound::Token(token)),
                Polled::Item(Control::User(value)) => Ok(Inbound::User(value)),
            },
            Transport::Isolated(ports) => match ports.inbound.pop() {
                Polled::Closed => Ok(Inbound::Closed),
                Polled::Empty => Ok(Inbound::Empty),
                Polled::Item(frame) => {
                    if let Some(token) = frame.as_token() {
                        return Ok(Inbound::Token(token));
                    }
                    if frame.kind == PortKind::User {
                        return Ok(Inbound::User(TaskValue::from_bytes(&frame.payload)?));
                    }
                    tracing::error!("unexpected {:?} frame on isolate inbound port", frame.kind);
                    Ok(Inbound::Empty)
                }
            },
        }
    }

    /// Consume pending control tokens without disturbing user payloads
    fn intercept_tokens(&self) -> Result<(), TaskError> {
        loop {
            let polled = match &self.transport {
                Transport::Shared(channels) => channels.inbound.pop_token(),
                Transport::Isolated(ports) => ports.inbound.pop_token(),
            };
            match polled {
                Polled::Closed => return Err(TaskError::Stopped),
                Polled::Empty => return Ok(()),
                Polled::Item(token) => self.apply_token(token)?,
            }
        }
    }

    fn apply_token(&self, token: ControlToken) -> Result<(), TaskError> {
        match token {
            ControlToken::Pause => {
                self.paused_flag().store(true, Ordering::Release);
                Ok(())
            }
            ControlToken::Resume => {
                self.paused_flag().store(false, Ordering::Release);
                Ok(())
            }
            ControlToken::Stop => Err(TaskError::Stopped),
        }
    }

    fn paused_flag(&self) -> &AtomicBool {
        match &self.transport {
            Transport::Shared(channels) => &channels.paused,
            Transport::Isolated(ports) => &ports.paused,
        }
    }

    fn wait_activity(&self, timeout: Duration) {
        match &self.transport {
            Transport::Shared(channels) => channels.inbound.wait_activity(timeout),
            Transport::Isolated(ports) => ports.inbound.wait_activity(timeout),
        }
    }
}
