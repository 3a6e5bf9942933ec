//! Mode registry
//!
//! Process-wide name-to-backend table enabling runtime backend selection
//! and third-party backend registration. The built-in thread and sync
//! modes always register; isolate registers only when runtime support is
//! detected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use pulse_loop::EventLoop;

use crate::backend::{isolate, IsolateBackend, SyncBackend, ThreadBackend, WorkFn, WorkerBackend};
use crate::value::TaskValue;
use crate::TaskError;

/// Constructs a backend for a task; returned errors fail `Task::new`
pub type BackendFactory = Arc<
    dyn Fn(&EventLoop, TaskValue, WorkFn) -> Result<Box<dyn WorkerBackend>, TaskError>
        + Send
        + Sync,
>;

static MODES: OnceLock<Mutex<HashMap<String, BackendFactory>>> = OnceLock::new();

fn modes() -> &'static Mutex<HashMap<String, BackendFactory>> {
    MODES.get_or_init(|| {
        let mut map: HashMap<String, BackendFactory> = HashMap::new();
        map.insert("thread".to_string(), Arc::new(ThreadBackend::create));
        map.insert("sync".to_string(), Arc::new(SyncBackend::create));
        if isolate::supported() {
            map.insert("isolate".to_string(), Arc::new(IsolateBackend::create));
        } else {
            tracing::warn!("isolate runtime support not detected; mode unavailable");
        }
        Mutex::new(map)
    })
}

/// Register a backend under `name`, replacing any previous registration
pub fn register_mode(name: &str, factory: BackendFactory) {
    modes().lock().unwrap().insert(name.to_string(), factory);
}

/// Look up the factory for `name`
pub fn backend_for(name: &str) -> Option<BackendFactory> {
    modes().lock().unwrap().get(name).cloned()
}

/// Registered mode names, sorted
pub fn registered_modes() -> Vec<String> {
    let mut names: Vec<String> = modes().lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}
