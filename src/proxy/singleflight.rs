use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use http::{HeaderMap, StatusCode};
use tokio::sync::oneshot;

use crate::storage::CacheKey;

/// How a fill ended, as seen by the requests queued behind it.
#[derive(Clone, Debug)]
pub enum FillOutcome {
    /// The entry is now in the store; waiters serve it from disk with this status and header set.
    Published { status: StatusCode, headers: HeaderMap },
    /// Origin answered with a status that is not stored; waiters get the status line without a body.
    Passed { status: StatusCode, headers: HeaderMap },
    /// Transport, timeout or publish failure.
    Failed,
}

type IdleCallback = Box<dyn FnOnce() + Send>;

struct Flight {
    started_at: Instant,
    waiters: Vec<oneshot::Sender<FillOutcome>>,
}

#[derive(Default)]
struct Inner {
    flights: HashMap<PathBuf, Flight>,
    idle_callbacks: Vec<IdleCallback>,
}

/// Registry of in-flight fills keyed by store path.
///
/// At most one fill exists per key. Check-and-register happens under one lock, so two requests that
/// both missed the store cannot both become leaders.
#[derive(Clone, Default)]
pub struct Group {
    inner: Arc<Mutex<Inner>>,
}

/// Returned by [`Group::join`].
pub enum Join {
    /// Caller owns the fill and must resolve it through the guard.
    Leader(FlightGuard),
    /// A fill is already running; the receiver yields its outcome.
    Follower(oneshot::Receiver<FillOutcome>),
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking holder cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn join(&self, key: &CacheKey) -> Join {
        let mut inner = self.lock();
        if let Some(flight) = inner.flights.get_mut(key.path()) {
            let (tx, rx) = oneshot::channel();
            flight.waiters.push(tx);
            log::debug!(
                "joined fill for {} ({} waiting, running {:?})",
                key.path().display(),
                flight.waiters.len(),
                flight.started_at.elapsed()
            );
            return Join::Follower(rx);
        }
        inner.flights.insert(
            key.path().to_path_buf(),
            Flight {
                started_at: Instant::now(),
                waiters: Vec::new(),
            },
        );
        log::debug!("started fill for {}", key.path().display());
        Join::Leader(FlightGuard {
            group: self.clone(),
            key: key.path().to_path_buf(),
            done: false,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.lock().flights.len()
    }

    pub fn is_idle(&self) -> bool {
        self.lock().flights.is_empty()
    }

    /// Runs `callback` now if nothing is in flight, otherwise once at the next transition to idle.
    pub fn on_idle<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.lock();
        if inner.flights.is_empty() {
            drop(inner);
            callback();
            return;
        }
        inner.idle_callbacks.push(Box::new(callback));
    }

    /// Resolves at the next idle point.
    pub async fn idle(&self) {
        let (tx, rx) = oneshot::channel();
        self.on_idle(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    fn finish(&self, key: &Path, outcome: FillOutcome) -> (usize, Duration) {
        let (flight, idle_callbacks) = {
            let mut inner = self.lock();
            let flight = inner.flights.remove(key);
            let idle_callbacks = if inner.flights.is_empty() {
                std::mem::take(&mut inner.idle_callbacks)
            } else {
                Vec::new()
            };
            (flight, idle_callbacks)
        };

        let mut released = 0;
        let mut elapsed = Duration::ZERO;
        if let Some(flight) = flight {
            elapsed = flight.started_at.elapsed();
            for waiter in flight.waiters {
                if waiter.send(outcome.clone()).is_ok() {
                    released += 1;
                }
            }
        }
        for callback in idle_callbacks {
            callback();
        }
        (released, elapsed)
    }
}

/// Ownership of one fill. Dropping it unresolved releases all waiters with [`FillOutcome::Failed`].
pub struct FlightGuard {
    group: Group,
    key: PathBuf,
    done: bool,
}

impl FlightGuard {
    pub fn finish(mut self, outcome: FillOutcome) {
        self.done = true;
        let (released, elapsed) = self.group.finish(&self.key, outcome);
        log::debug!(
            "fill for {} resolved after {:?}, released {} waiters",
            self.key.display(),
            elapsed,
            released
        );
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.done {
            log::warn!("fill for {} abandoned", self.key.display());
            self.group.finish(&self.key, FillOutcome::Failed);
        }
    }
}
