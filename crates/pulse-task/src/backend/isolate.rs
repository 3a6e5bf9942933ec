//! Isolate backend
//!
//! Runs the work callback in a copy-isolated execution unit: no value
//! crosses to or from it except through the port pair, and every
//! crossing is an encode/decode round trip, a deep copy with no
//! references into the sending side's heap. Task data is encoded at
//! construction, so a non-transferable value fails before any execution
//! starts.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;

use pulse_loop::EventLoop;

use super::{execute_work, next_worker_id, Drained, Lifecycle, WorkFn, WorkerBackend};
use crate::channel::ControlToken;
use crate::context::TaskContext;
use crate::port::{IsolatePorts, PortKind, PortMessage};
use crate::value::TaskValue;
use crate::TaskError;

/// Runtime probe for isolate support
///
/// When this fails, the mode registry leaves `isolate` unregistered and
/// only the thread and sync modes exist.
pub(crate) fn supported() -> bool {
    std::thread::available_parallelism().is_ok()
}

pub(crate) struct IsolateBackend {
    ports: Arc<IsolatePorts>,
    state: Arc<Mutex<Lifecycle>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    pending: Mutex<Option<(WorkFn, Vec<u8>)>>,
}

impl IsolateBackend {
    pub fn create(
        _event_loop: &EventLoop,
        data: TaskValue,
        work: WorkFn,
    ) -> Result<Box<dyn WorkerBackend>, TaskError> {
        // Fail fast at the construction call site
        let encoded = data.to_bytes()?;
        Ok(Box::new(Self {
            ports: Arc::new(IsolatePorts::new()),
            state: Arc::new(Mutex::new(Lifecycle::Created)),
            handle: Mutex::new(None),
            pending: Mutex::new(Some((work, encoded))),
        }))
    }
}

impl WorkerBackend for IsolateBackend {
    fn start(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != Lifecycle::Created {
                return;
            }
            *state = Lifecycle::Running;
        }
        let Some((work, encoded)) = self.pending.lock().unwrap().take() else {
            return;
        };

        let ports = Arc::clone(&self.ports);
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name(format!("pulse-isolate-{}", next_worker_id()))
            .spawn(move || {
                let outcome = match TaskValue::from_bytes(&encoded) {
                    Ok(data) => {
                        let ctx = TaskContext::isolated(Arc::clone(&ports));
                        execute_work(work, &ctx, data)
                    }
                    Err(error) => {
                        tracing::error!("isolate data failed to decode: {error}");
                        Some(TaskError::Boundary(error))
                    }
                };
                ports.completion.complete(outcome);
                ports.paused.store(false, Ordering::Release);
                *state.lock().unwrap() = Lifecycle::Done;
            })
            .expect("Failed to spawn isolate worker");

        *self.handle.lock().unwrap() = Some(handle);
    }

    fn pause(&self) {
        self.ports
            .inbound
            .push(PortMessage::token(ControlToken::Pause));
    }

    fn resume(&self) {
        self.ports
            .inbound
            .push(PortMessage::token(ControlToken::Resume));
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == Lifecycle::Running {
                *state = Lifecycle::Stopping;
            }
        }
        self.ports
            .inbound
            .push(PortMessage::token(ControlToken::Stop));
    }

    fn close(&self) {
        self.ports.close();
        self.ports.completion.complete(Some(TaskError::Stopped));
        *self.state.lock().unwrap() = Lifecycle::Done;
        let _ = self.handle.lock().unwrap().take();
    }

    fn is_done(&self) -> bool {
        *self.state.lock().unwrap() == Lifecycle::Done
    }

    fn is_paused(&self) -> bool {
        self.ports.paused.load(Ordering::Acquire)
    }

    fn post_message(&self, value: TaskValue) -> Result<(), TaskError> {
        // Fail fast at the send call site
        let bytes = value.to_bytes()?;
        if self
            .ports
            .inbound
            .push(PortMessage::new(PortKind::User, bytes))
        {
            Ok(())
        } else {
            Err(TaskError::Stopped)
        }
    }

    fn drain(&self) -> Drained {
        let mut drained = Drained::default();
        for frame in self.ports.outbound.drain() {
            let decoded = match TaskValue::from_bytes(&frame.payload) {
                Ok(value) => value,
                Err(error) => {
                    tracing::error!("dropping undecodable isolate frame: {error}");
                    continue;
                }
            };
            match frame.kind {
                PortKind::Progress => drained.progress.push(decoded),
                PortKind::Message => drained.messages.push(decoded),
                other => {
                    tracing::error!("unexpected {other:?} frame on isolate outbound port");
                }
            }
        }
        drained
    }

    fn take_completion(&self) -> Option<Option<TaskError>> {
        self.ports.completion.take()
    }
}
