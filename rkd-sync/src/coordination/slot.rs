//! Generation slot: supersession with a monotonically increasing counter
//!
//! Each logical slot owns a generation counter and the cancellation token of
//! its current operation. Starting a new operation (`supersede`) cancels the
//! previous token and bumps the generation. Every asynchronous continuation
//! writes shared state through [`Lease::commit`], which runs only while the
//! lease's generation is still current.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use super::debounce::cancellable;
use crate::error::SyncResult;

#[derive(Debug)]
struct SlotState {
    generation: u64,
    token: CancellationToken,
}

impl SlotState {
    fn invalidate(&mut self) {
        self.token.cancel();
        self.generation += 1;
        self.token = CancellationToken::new();
    }
}

/// One logical operation slot
#[derive(Debug, Clone)]
pub struct GenerationSlot {
    name: &'static str,
    state: Arc<Mutex<SlotState>>,
}

impl GenerationSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(SlotState {
                generation: 0,
                token: CancellationToken::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a new operation, cancelling whatever held the slot before
    pub fn supersede(&self) -> Lease {
        let mut state = self.lock();
        state.invalidate();
        tracing::trace!(slot = self.name, generation = state.generation, "Slot superseded");
        Lease {
            generation: state.generation,
            token: state.token.clone(),
            slot: self.clone(),
        }
    }

    /// Cancel the current operation without starting a new one
    pub fn cancel(&self) {
        self.cancel_with(|| ());
    }

    /// Cancel the current operation and run `apply` before any successor
    /// can commit
    pub fn cancel_with<R>(&self, apply: impl FnOnce() -> R) -> R {
        let mut state = self.lock();
        state.invalidate();
        tracing::trace!(slot = self.name, generation = state.generation, "Slot cancelled");
        apply()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Right to write shared state on behalf of one generation
#[derive(Debug, Clone)]
pub struct Lease {
    generation: u64,
    token: CancellationToken,
    slot: GenerationSlot,
}

impl Lease {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_current(&self) -> bool {
        let state = self.slot.lock();
        state.generation == self.generation && !self.token.is_cancelled()
    }

    /// Run `apply` only if this lease is still current
    ///
    /// The slot lock is held while `apply` runs, so a concurrent `supersede`
    /// cannot interleave between the check and the write. `apply` must not
    /// touch the same slot.
    pub fn commit<R>(&self, apply: impl FnOnce() -> R) -> Option<R> {
        let state = self.slot.lock();
        if state.generation == self.generation && !self.token.is_cancelled() {
            Some(apply())
        } else {
            None
        }
    }

    /// Cancel this operation (idempotent)
    ///
    /// Bumps the slot generation only if this lease still owns the slot, so a
    /// stale handle can never cancel its successor.
    pub fn cancel(&self) {
        self.cancel_with(|| ());
    }

    /// Cancel this operation, running `apply` first if it still owns the slot
    ///
    /// `apply` runs under the slot lock, so no commit of this generation can
    /// land after it.
    pub fn cancel_with<R>(&self, apply: impl FnOnce() -> R) -> Option<R> {
        let mut state = self.slot.lock();
        let applied = if state.generation == self.generation && !self.token.is_cancelled() {
            let applied = apply();
            state.invalidate();
            Some(applied)
        } else {
            None
        };
        self.token.cancel();
        applied
    }

    /// Await `fut` unless this lease is cancelled first
    pub async fn run<F: Future>(&self, fut: F) -> SyncResult<F::Output> {
        cancellable(&self.token, fut).await
    }
}
