//! Thread backend
//!
//! Runs the work callback on a dedicated OS thread sharing memory with
//! the caller. Values cross the channels untransformed, including
//! [`TaskValue::Shared`]. This is the only backend family where worker
//! mutation of shared data is visible to the main side.
//!
//! [`TaskValue::Shared`]: crate::TaskValue::Shared

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;

use pulse_loop::EventLoop;

use super::{execute_work, next_worker_id, Drained, Lifecycle, WorkFn, WorkerBackend};
use crate::channel::{ChannelSet, Control, ControlToken};
use crate::context::{PauseWait, TaskContext};
use crate::value::TaskValue;
use crate::TaskError;

pub(crate) struct ThreadBackend {
    channels: Arc<ChannelSet>,
    state: Arc<Mutex<Lifecycle>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    pending: Mutex<Option<(WorkFn, TaskValue)>>,
}

impl ThreadBackend {
    pub fn create(
        _event_loop: &EventLoop,
        data: TaskValue,
        work: WorkFn,
    ) -> Result<Box<dyn WorkerBackend>, TaskError> {
        Ok(Box::new(Self {
            channels: Arc::new(ChannelSet::new()),
            state: Arc::new(Mutex::new(Lifecycle::Created)),
            handle: Mutex::new(None),
            pending: Mutex::new(Some((work, data))),
        }))
    }
}

impl WorkerBackend for ThreadBackend {
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

        let channels = Arc::clone(&self.channels);
        let state = Arc::clone(&self.state);
        let handle = thread::Builder::new()
            .name(format!("pulse-worker-{}", next_worker_id()))
            .spawn(move || {
                let ctx = TaskContext::shared(Arc::clone(&channels), PauseWait::Block);
                let outcome = execute_work(work, &ctx, data);
                channels.completion.complete(outcome);
                channels.paused.store(false, Ordering::Release);
                *state.lock().unwrap() = Lifecycle::Done;
            })
            .expect("Failed to spawn worker thread");

        *self.handle.lock().unwrap() = Some(handle);
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
        // The thread cannot be killed, only abandoned; the closed
        // channels cancel it at its next control point
        let _ = self.handle.lock().unwrap().take();
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_done(backend: &dyn WorkerBackend) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !backend.is_done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert!(backend.is_done());
    }

    #[test]
    fn test_runs_work_and_completes() {
        let el = EventLoop::new();
        let backend = ThreadBackend::create(
            &el,
            TaskValue::Int(5),
            Box::new(|ctx, data| {
                ctx.emit(data.as_int().unwrap() * 2)?;
                Ok(())
            }),
        )
        .unwrap();

        backend.start();
        wait_done(backend.as_ref());

        assert_eq!(backend.drain().progress, vec![TaskValue::Int(10)]);
        assert!(backend.take_completion().unwrap().is_none());
        assert!(backend.take_completion().is_none());
    }

    #[test]
    fn test_start_is_idempotent() {
        let el = EventLoop::new();
        let backend = ThreadBackend::create(
            &el,
            TaskValue::Null,
            Box::new(|ctx, _| {
                ctx.emit(1)?;
                Ok(())
            }),
        )
        .unwrap();

        backend.start();
        backend.start();
        wait_done(backend.as_ref());

        assert_eq!(backend.drain().progress.len(), 1);
    }

    #[test]
    fn test_shared_data_mutation_is_visible() {
        let el = EventLoop::new();
        let cell = Arc::new(Mutex::new(0u32));
        let backend = ThreadBackend::create(
            &el,
            TaskValue::shared(Arc::clone(&cell)),
            Box::new(|_ctx, data| {
                let shared = data.as_shared().unwrap();
                let cell: &Arc<Mutex<u32>> = shared.downcast_ref().unwrap();
                *cell.lock().unwrap() = 7;
                Ok(())
            }),
        )
        .unwrap();

        backend.start();
        wait_done(backend.as_ref());
        assert_eq!(*cell.lock().unwrap(), 7);
    }

    #[test]
    fn test_stop_cancels_waiting_worker() {
        let el = EventLoop::new();
        let backend = ThreadBackend::create(
            &el,
            TaskValue::Null,
            Box::new(|ctx, _| {
                // Blocks until the stop token arrives
                let _msg = ctx.wait_message()?;
                Ok(())
            }),
        )
        .unwrap();

        backend.start();
        backend.stop();
        wait_done(backend.as_ref());

        assert!(matches!(
            backend.take_completion(),
            Some(Some(TaskError::Stopped))
        ));
    }

    #[test]
    fn test_close_force_completes() {
        let el = EventLoop::new();
        let backend = ThreadBackend::create(
            &el,
            TaskValue::Null,
            Box::new(|ctx, _| loop {
                ctx.check_pause()?;
                thread::sleep(Duration::from_millis(1));
            }),
        )
        .unwrap();

        backend.start();
        backend.close();
        backend.close();

        assert!(backend.is_done());
        assert!(matches!(
            backend.take_completion(),
            Some(Some(TaskError::Stopped))
        ));
    }
}
