//! Correlation of in-flight requests with their responses.
//!
//! Each outstanding request owns one entry keyed by its id. The entry is a
//! oneshot sender; removing it from the map and sending on it happen under
//! the same lock, so every response is handed over at most once.

use crate::error::{Result, TandemError};
use crate::protocol::Response;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// What a waiting call eventually receives.
pub(crate) type Delivery = Result<Response>;

#[derive(Debug, Default)]
struct RegistryState {
    waiting: HashMap<u64, oneshot::Sender<Delivery>>,
    /// Set once by `release_all`; later registrations fail with this error.
    released: Option<TandemError>,
}

/// Thread-safe map of request id to delivery slot.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    state: Mutex<RegistryState>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`.
    ///
    /// Fails once the registry has been released, so a request racing a
    /// connection teardown cannot end up waiting on an entry nobody will
    /// ever complete.
    pub(crate) fn register(&self, id: u64) -> Result<oneshot::Receiver<Delivery>> {
        let mut state = self.lock();
        if let Some(err) = &state.released {
            return Err(err.clone());
        }
        let (tx, rx) = oneshot::channel();
        state.waiting.insert(id, tx);
        Ok(rx)
    }

    /// Hand a response to its waiter.
    ///
    /// Returns `false` when no entry matches, e.g. the caller already gave up.
    pub(crate) fn deliver(&self, response: Response) -> bool {
        let mut state = self.lock();
        match state.waiting.remove(&response.id) {
            // A receiver dropped after removal is an abandoned call; nothing to do.
            Some(tx) => {
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `id` without delivering anything.
    pub(crate) fn remove(&self, id: u64) {
        self.lock().waiting.remove(&id);
    }

    /// Fail every outstanding entry with `err` and refuse new ones.
    ///
    /// Returns how many waiters were released.
    pub(crate) fn release_all(&self, err: TandemError) -> usize {
        let mut state = self.lock();
        let waiting = std::mem::take(&mut state.waiting);
        let released = waiting.len();
        for (_, tx) in waiting {
            let _ = tx.send(Err(err.clone()));
        }
        state.released = Some(err);
        released
    }

    /// Number of requests still waiting for a response.
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
