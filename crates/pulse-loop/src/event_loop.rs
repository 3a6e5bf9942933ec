//! Host event loop
//!
//! One-shot timer entries drained by `pump()`. The loop is single-threaded
//! and cooperative: a long callback stalls everything behind it, which is
//! exactly why background task backends exist.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type OnceFn = Box<dyn FnOnce() + Send>;

/// Handle to a scheduled one-shot entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Entry {
    id: u64,
    deadline: Instant,
    callback: OnceFn,
}

/// Cooperative event loop
///
/// Cloning returns another handle to the same loop. Callbacks must be
/// `Send` so handles can be passed to worker code (the sync backend pumps
/// from inside a pause wait), but they are only ever invoked from the
/// pumping thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Mutex<LoopInner>>,
}

#[derive(Default)]
struct LoopInner {
    entries: Vec<Entry>,
    next_id: u64,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopInner::default())),
        }
    }

    /// Schedule a callback to run once, `delay_ms` from now
    pub fn schedule_once<F>(&self, delay_ms: u64, callback: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push(Entry {
            id,
            deadline: Instant::now() + Duration::from_millis(delay_ms),
            callback: Box::new(callback),
        });
        TimerId(id)
    }

    /// Cancel a scheduled entry
    ///
    /// A no-op for entries that already fired or were never scheduled.
    pub fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.retain(|e| e.id != id.0);
    }

    /// Run every due entry exactly once, returning how many fired
    ///
    /// Due entries are moved out of the lock before invocation, so
    /// callbacks may schedule, cancel, or pump again without deadlocking.
    pub fn pump(&self) -> usize {
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            let mut i = 0;
            while i < inner.entries.len() {
                if inner.entries[i].deadline <= now {
                    due.push(inner.entries.remove(i));
                } else {
                    i += 1;
                }
            }
        }

        due.sort_by_key(|e| (e.deadline, e.id));

        let fired = due.len();
        for entry in due {
            (entry.callback)();
        }
        fired
    }

    /// Number of entries still waiting
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;

    #[test]
    fn test_schedule_and_pump() {
        let el = EventLoop::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        el.schedule_once(0, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(el.pending(), 1);
        assert_eq!(el.pump(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(el.pending(), 0);

        // Fired entries do not fire again
        assert_eq!(el.pump(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_respected() {
        let el = EventLoop::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        el.schedule_once(40, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(el.pump(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(60));
        assert_eq!(el.pump(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel() {
        let el = EventLoop::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        let id = el.schedule_once(0, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        el.cancel(id);
        assert_eq!(el.pump(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // Cancelling again is a no-op
        el.cancel(id);
    }

    #[test]
    fn test_deadline_order() {
        let el = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay, tag) in [(20u64, 'b'), (0, 'a'), (40, 'c')] {
            let o = Arc::clone(&order);
            el.schedule_once(delay, move || o.lock().unwrap().push(tag));
        }

        thread::sleep(Duration::from_millis(60));
        assert_eq!(el.pump(), 3);
        assert_eq!(*order.lock().unwrap(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_reentrant_scheduling() {
        let el = EventLoop::new();
        let counter = Arc::new(AtomicU32::new(0));

        let el2 = el.clone();
        let c = Arc::clone(&counter);
        el.schedule_once(0, move || {
            let c2 = Arc::clone(&c);
            el2.schedule_once(0, move || {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        // First pump runs the outer callback, second runs the inner one
        assert_eq!(el.pump(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(el.pump(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
