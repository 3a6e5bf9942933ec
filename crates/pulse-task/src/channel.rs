//! Task channels
//!
//! Per-task FIFO queues between the main loop and a worker: a progress
//! queue and a message queue (worker to main), a control queue (main to
//! worker, with blocking waits), and a one-shot completion slot.
//!
//! Closing a queue wakes blocked waiters; a closed control queue makes
//! every subsequent worker-side wait behave as a stop, which is how
//! `close()` cancels a cooperative worker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::value::TaskValue;
use crate::TaskError;

/// Control token posted by the main side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlToken {
    Pause,
    Resume,
    Stop,
}

/// Entry on the main-to-worker queue
#[derive(Debug)]
pub(crate) enum Control {
    Token(ControlToken),
    User(TaskValue),
}

/// Result of a non-blocking queue poll
#[derive(Debug)]
pub(crate) enum Polled<T> {
    Item(T),
    Empty,
    Closed,
}

struct QueueState {
    entries: VecDeque<Control>,
    closed: bool,
}

/// Main-to-worker queue with blocking waits
pub(crate) struct ControlQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl ControlQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Returns false if the queue is closed
    pub fn push(&self, entry: Control) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.entries.push_back(entry);
        self.condvar.notify_all();
        true
    }

    pub fn pop(&self) -> Polled<Control> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Polled::Closed;
        }
        match state.entries.pop_front() {
            Some(entry) => Polled::Item(entry),
            None => Polled::Empty,
        }
    }

    /// Remove the earliest control token, leaving user payloads queued
    /// in order for `wait_message`/`check_message`
    ///
    /// Tokens overtake payloads here so a resume or stop posted behind
    /// an unread message still reaches a paused worker.
    pub fn pop_token(&self) -> Polled<ControlToken> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Polled::Closed;
        }
        let position = state
            .entries
            .iter()
            .position(|e| matches!(e, Control::Token(_)));
        match position {
            Some(i) => {
                let Some(Control::Token(token)) = state.entries.remove(i) else {
                    unreachable!()
                };
                Polled::Item(token)
            }
            None => Polled::Empty,
        }
    }

    /// Block until the queue changes or the timeout elapses
    pub fn wait_activity(&self, timeout: Duration) {
        let state = self.state.lock().unwrap();
        if state.closed || !state.entries.is_empty() {
            return;
        }
        let _unused = self.condvar.wait_timeout(state, timeout).unwrap();
    }

    /// Close and discard pending entries; wakes blocked waiters
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.entries.clear();
        self.condvar.notify_all();
    }
}

/// Worker-to-main queue; never blocks the producer
pub(crate) struct ValueQueue {
    entries: Mutex<VecDeque<TaskValue>>,
    closed: AtomicBool,
}

impl ValueQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns false if the queue is closed
    pub fn push(&self, value: TaskValue) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.entries.lock().unwrap().push_back(value);
        true
    }

    /// Take every pending entry, oldest first
    pub fn drain(&self) -> Vec<TaskValue> {
        let mut entries = self.entries.lock().unwrap();
        entries.drain(..).collect()
    }

    /// Stop accepting pushes; pending entries remain drainable
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One-shot completion cell: first write wins, delivered at most once
pub(crate) struct CompletionSlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    set: bool,
    outcome: Option<Option<TaskError>>,
}

impl CompletionSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                set: false,
                outcome: None,
            }),
        }
    }

    /// Record the outcome; returns false if one was already recorded
    pub fn complete(&self, outcome: Option<TaskError>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.set {
            return false;
        }
        state.set = true;
        state.outcome = Some(outcome);
        true
    }

    /// Consume the outcome; subsequent calls return `None`
    pub fn take(&self) -> Option<Option<TaskError>> {
        self.state.lock().unwrap().outcome.take()
    }

    pub fn is_set(&self) -> bool {
        self.state.lock().unwrap().set
    }
}

/// The shared-memory channel bundle used by the thread and sync backends
pub(crate) struct ChannelSet {
    pub progress: ValueQueue,
    pub outbound: ValueQueue,
    pub inbound: ControlQueue,
    pub completion: CompletionSlot,
    pub paused: AtomicBool,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self {
            progress: ValueQueue::new(),
            outbound: ValueQueue::new(),
            inbound: ControlQueue::new(),
            completion: CompletionSlot::new(),
            paused: AtomicBool::new(false),
        }
    }

    /// Teardown for `close()`: wakes the worker and fails its next
    /// channel operation
    pub fn close(&self) {
        self.inbound.close();
        self.progress.close();
        self.outbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_control_queue_fifo() {
        let queue = ControlQueue::new();
        queue.push(Control::User(TaskValue::Int(1)));
        queue.push(Control::User(TaskValue::Int(2)));

        let Polled::Item(Control::User(first)) = queue.pop() else {
            panic!("expected entry");
        };
        assert_eq!(first, TaskValue::Int(1));
        let Polled::Item(Control::User(second)) = queue.pop() else {
            panic!("expected entry");
        };
        assert_eq!(second, TaskValue::Int(2));
        assert!(matches!(queue.pop(), Polled::Empty));
    }

    #[test]
    fn test_pop_token_overtakes_user_payloads() {
        let queue = ControlQueue::new();
        queue.push(Control::User(TaskValue::Int(7)));
        queue.push(Control::Token(ControlToken::Pause));

        assert!(matches!(
            queue.pop_token(),
            Polled::Item(ControlToken::Pause)
        ));
        assert!(matches!(queue.pop_token(), Polled::Empty));

        // The payload is still queued, in order
        let Polled::Item(Control::User(value)) = queue.pop() else {
            panic!("expected user entry");
        };
        assert_eq!(value, TaskValue::Int(7));
    }

    #[test]
    fn test_close_wakes_blocked_waiter() {
        let queue = Arc::new(ControlQueue::new());

        let q = Arc::clone(&queue);
        let waiter = thread::spawn(move || loop {
            match q.pop() {
                Polled::Closed => return true,
                Polled::Item(_) => return false,
                Polled::Empty => q.wait_activity(Duration::from_millis(50)),
            }
        });

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_value_queue_drain_order_and_close() {
        let queue = ValueQueue::new();
        assert!(queue.push(TaskValue::Int(1)));
        assert!(queue.push(TaskValue::Int(2)));

        queue.close();
        assert!(!queue.push(TaskValue::Int(3)));

        // Entries pushed before the close are still delivered
        assert_eq!(queue.drain(), vec![TaskValue::Int(1), TaskValue::Int(2)]);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_completion_first_write_wins() {
        let slot = CompletionSlot::new();
        assert!(slot.complete(None));
        assert!(!slot.complete(Some(TaskError::Stopped)));
        assert!(slot.is_set());

        let outcome = slot.take().unwrap();
        assert!(outcome.is_none());
        assert!(slot.take().is_none());
        assert!(slot.is_set());
    }
}
