use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

/// Server lifecycle. Transitions only move forward around the cycle
/// stopped → starting → listening → stopping → stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Listening => "listening",
            LifecycleState::Stopping => "stopping",
        }
    }
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A list of callbacks for one signal. Registration and emission may race freely; emission runs
/// against a snapshot taken under the lock and calls listeners outside it.
pub struct Observers<T> {
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Observers<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<Listener<T>>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.lock().push(Arc::new(handler));
    }

    pub fn emit(&self, payload: &T) {
        let listeners = self.lock().clone();
        for listener in listeners {
            listener(payload);
        }
    }
}

/// Signals a server exposes to its embedder.
#[derive(Default)]
pub struct ServerEvents {
    pub start: Observers<SocketAddr>,
    pub stop: Observers<()>,
}
