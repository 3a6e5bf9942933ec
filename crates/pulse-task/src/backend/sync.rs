//! Synchronous backend
//!
//! Diagnostic baseline: runs the work callback immediately on the
//! caller's thread, blocking the host loop for its entire duration.
//! Only `check_pause` gives the loop air: each pause-wait iteration
//! pumps one loop iteration so the UI stays minimally alive. Never the
//! default; it exists to show by contrast why the other backends exist.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use pulse_loop::EventLoop;

use super::{execute_work, Drained, Lifecycle, WorkFn, WorkerBackend};
use crate::channel::{ChannelSet, Control, ControlToken};
use crate::context::{PauseWait, TaskContext};
use crate::value::TaskValue;
use crate::TaskError;

pub(crate) struct SyncBackend {
    channels: Arc<ChannelSet>,
    state: Arc<Mutex<Lifecycle>>,
    event_loop: EventLoop,
    pending: Mutex<Option<(WorkFn, TaskValue)>>,
}

impl SyncBackend {
    pub fn create(
        event_loop: &EventLoop,
        data: TaskValue,
        work: WorkFn,
    ) -> Result<Box<dyn WorkerBackend>, TaskError> {
        Ok(Box::new(Self {
            channels: Arc::new(ChannelSet::new()),
            state: Arc::new(Mutex::new(Lifecycle::Created)),
            event_loop: event_loop.clone(),
            pending: Mutex::new(Some((work, data))),
        }))
    }
}

impl WorkerBackend for SyncBackend {
    fn start(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != Lifecycle::Created {
                return;
            }
            *state = Lifecycle::Running;
        }
        let Some((work, data)) = self.pending.lock().unwrap().take() else {
            return;
        };

        // Blocks the caller until the work returns; no locks are held
        // so bridge ticks fired from pumped pause waits can drain
        let ctx = TaskContext::shared(
            Arc::clone(&self.channels),
            PauseWait::Pump(self.event_loop.clone()),
        );
        let outcome = execute_work(work, &ctx, data);
        self.channels.completion.complete(outcome);
        self.channels.paused.store(false, Ordering::Release);
        *self.state.lock().unwrap() = Lifecycle::Done;
    }

    fn pause(&self) {
        self.channels
            .inbound
            .push(Control::Token(ControlToken::Pause));
    }

    fn resume(&self) {
        self.channels
            .inbound
            .push(Control::Token(ControlToken::Resume));
    }

    fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == Lifecycle::Running {
                *state = Lifecycle::Stopping;
            }
        }
        self.channels
            .inbound
            .push(Control::Token(ControlToken::Stop));
    }

    fn close(&self) {
        self.channels.close();
        self.channels.completion.complete(Some(TaskError::Stopped));
        *self.state.lock().unwrap() = Lifecycle::Done;
    }

    fn is_done(&self) -> bool {
        *self.state.lock().unwrap() == Lifecycle::Done
    }

    fn is_paused(&self) -> bool {
        self.channels.paused.load(Ordering::Acquire)
    }

    fn post_message(&self, value: TaskValue) -> Result<(), TaskError> {
        if self.channels.inbound.push(Control::User(value)) {
            Ok(())
        } else {
            Err(TaskError::Stopped)
        }
    }

    fn drain(&self) -> Drained {
        Drained {
            progress: self.channels.progress.drain(),
            messages: self.channels.outbound.drain(),
        }
    }

    fn take_completion(&self) -> Option<Option<TaskError>> {
        self.channels.completion.take()
    }
}
