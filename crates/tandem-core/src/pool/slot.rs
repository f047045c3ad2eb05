//! Lazily created, generation-versioned connection slot.
//!
//! A slot holds at most one live caller. The caller is created on first use,
//! and a failure observed on it invalidates exactly the generation it was
//! created at:
//!
//! ```text
//! empty --get--> initializing --ok--> ready(g) --clear(g)--> empty (g+1)
//!                      |
//!                      +--err--> empty (nothing cached)
//! ```

use crate::cancel::CallContext;
use crate::client::{Caller, CallerFactory};
use crate::error::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::debug;

/// A caller tagged with the slot generation it was created at.
#[derive(Clone)]
pub struct VersionedCaller {
    pub caller: Arc<dyn Caller>,
    pub generation: u64,
}

impl std::fmt::Debug for VersionedCaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedCaller")
            .field("generation", &self.generation)
            .field("closed", &self.caller.is_closed())
            .finish()
    }
}

pub struct LazySlot {
    factory: Arc<dyn CallerFactory>,
    /// Bumped by every successful `clear`.
    generation: AtomicU64,
    current: RwLock<Option<VersionedCaller>>,
    /// Serializes creation and wiping.
    create_lock: Mutex<()>,
}

impl LazySlot {
    pub fn new(factory: Arc<dyn CallerFactory>) -> Self {
        Self {
            factory,
            generation: AtomicU64::new(0),
            current: RwLock::new(None),
            create_lock: Mutex::new(()),
        }
    }

    /// Current generation counter.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Cached caller, if it belongs to the current generation.
    fn load(&self) -> Option<VersionedCaller> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        match &*current {
            Some(handle) if handle.generation == self.generation() => Some(handle.clone()),
            _ => None,
        }
    }

    /// Return the live caller, creating one if the slot is empty.
    ///
    /// Concurrent callers on a cold slot wait behind one creation. A factory
    /// failure is returned as is and not remembered; the next `get` tries
    /// again.
    pub async fn get(&self, ctx: &CallContext) -> Result<VersionedCaller> {
        if let Some(handle) = self.load() {
            return Ok(handle);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(handle) = self.load() {
            return Ok(handle);
        }

        let generation = self.generation();
        let caller = self.factory.create(ctx).await?;
        let handle = VersionedCaller { caller, generation };
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        debug!("Slot created caller at generation {}", generation);

        Ok(handle)
    }

    /// Invalidate the caller created at `generation`.
    ///
    /// Returns `false` when the generation was already superseded, in which
    /// case nothing is touched. A newer caller is never wiped.
    pub async fn clear(&self, generation: u64) -> bool {
        if self
            .generation
            .compare_exchange(generation, generation + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let _guard = self.create_lock.lock().await;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(&*current, Some(handle) if handle.generation == generation) {
            *current = None;
        }
        debug!("Slot cleared generation {}", generation);

        true
    }
}

impl std::fmt::Debug for LazySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazySlot")
            .field("generation", &self.generation())
            .field("ready", &self.load().is_some())
            .finish()
    }
}
