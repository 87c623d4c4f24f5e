//! Debounced identity lookup
//!
//! Answers "does this typed candidate name a known remote account?" with:
//! - no network call below the minimum normalized length (`Idle`)
//! - a synchronous fast path for recent identities (`Exists`)
//! - otherwise a remote query issued only after a quiet interval
//!
//! Each `check` supersedes the previous one: the pending timer is cancelled,
//! an in-flight query is dropped and a late answer is discarded by the
//! generation check. A failed or cancelled query yields `Idle`, never
//! `NotFound`.

use rkd_common::events::{EventBus, SyncEvent};
use rkd_common::identity::normalize;
use rkd_common::{Identifier, RemoteEntitySummary};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};

use crate::coordination::{Debouncer, GenerationSlot};
use crate::preferences::PreferenceCache;
use crate::providers::IdentityProvider;

/// Lookup state for the current candidate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CheckResult {
    #[default]
    Idle,
    Checking,
    Exists(RemoteEntitySummary),
    NotFound,
}

/// Per-consumer debounced lookup
pub struct DebouncedLookup {
    provider: Arc<dyn IdentityProvider>,
    cache: PreferenceCache,
    events: EventBus,
    debouncer: Debouncer,
    min_len: usize,
    slot: GenerationSlot,
    state: Arc<watch::Sender<CheckResult>>,
}

impl DebouncedLookup {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        cache: PreferenceCache,
        events: EventBus,
        quiet: Duration,
        min_len: usize,
    ) -> Self {
        let (state, _) = watch::channel(CheckResult::Idle);
        Self {
            provider,
            cache,
            events,
            debouncer: Debouncer::new(quiet),
            min_len,
            slot: GenerationSlot::new("lookup"),
            state: Arc::new(state),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<CheckResult> {
        self.state.subscribe()
    }

    /// Stream of lookup states, starting with the current one
    pub fn updates(&self) -> WatchStream<CheckResult> {
        WatchStream::new(self.state.subscribe())
    }

    pub fn current(&self) -> CheckResult {
        self.state.borrow().clone()
    }

    /// Check a new candidate, returning the state it produced synchronously
    ///
    /// `Idle` is returned while a remote query is pending; the eventual
    /// `Checking` / `Exists` / `NotFound` arrive through [`Self::subscribe`].
    pub fn check(&self, candidate: &str) -> CheckResult {
        let lease = self.slot.supersede();
        let normalized = normalize(candidate);

        if normalized.chars().count() < self.min_len {
            lease.commit(|| self.state.send_replace(CheckResult::Idle));
            return CheckResult::Idle;
        }

        if let Some(summary) = self.cache.find_recent(&normalized) {
            debug!(candidate = %normalized, "Candidate found in recent identities");
            let result = CheckResult::Exists(summary);
            lease.commit(|| self.state.send_replace(result.clone()));
            return result;
        }

        let Some(identifier) = Identifier::parse(candidate) else {
            lease.commit(|| self.state.send_replace(CheckResult::Idle));
            return CheckResult::Idle;
        };

        lease.commit(|| self.state.send_replace(CheckResult::Idle));

        let provider = Arc::clone(&self.provider);
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let debouncer = self.debouncer;
        tokio::spawn(async move {
            if debouncer.settle(lease.token()).await.is_err() {
                return;
            }
            if lease.commit(|| state.send_replace(CheckResult::Checking)).is_none() {
                return;
            }

            debug!(candidate = %identifier, generation = lease.generation(), "Issuing remote existence query");
            let next = match lease.run(provider.lookup_identity(&identifier)).await {
                Ok(Ok(lookup)) if lookup.exists => CheckResult::Exists(RemoteEntitySummary::confirmed(
                    &identifier,
                    lookup.display_name,
                    lookup.avatar_url,
                )),
                Ok(Ok(_)) => CheckResult::NotFound,
                Ok(Err(e)) => {
                    warn!(candidate = %identifier, error = %e, "Existence query failed");
                    CheckResult::Idle
                }
                Err(_) => return,
            };

            let applied = lease.commit(|| {
                if let CheckResult::Exists(_) | CheckResult::NotFound = next {
                    events.emit_lossy(SyncEvent::LookupResolved {
                        candidate: identifier.normalized().to_string(),
                        exists: matches!(next, CheckResult::Exists(_)),
                        timestamp: chrono::Utc::now(),
                    });
                }
                state.send_replace(next)
            });
            if applied.is_none() {
                debug!(candidate = %identifier, "Discarding superseded existence answer");
            }
        });

        CheckResult::Idle
    }

    /// Cancel any pending query and return to `Idle`
    pub fn reset(&self) {
        let lease = self.slot.supersede();
        lease.commit(|| self.state.send_replace(CheckResult::Idle));
    }

    /// Cancel any pending query without touching the state
    pub fn cancel(&self) {
        self.slot.cancel();
    }
}
