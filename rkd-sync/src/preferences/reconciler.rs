//! Server reconciliation of the preference record
//!
//! Merge rules:
//! - `onboardingComplete` is monotonic: local `true` always survives.
//! - A field the local record is missing takes the server value.
//! - A field the local record already holds is replaced only when the server
//!   explicitly confirms onboarding completion.
//!
//! Reconciliation failures are swallowed: local state stays authoritative.

use futures::future::{BoxFuture, FutureExt, Shared};
use rkd_common::events::{EventBus, SyncEvent};
use rkd_common::Identifier;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::PreferenceCache;
use crate::coordination::GenerationSlot;
use crate::models::PreferenceRecord;
use crate::providers::{PreferenceProvider, ServerPreferences};

/// Pure merge of a server copy into the local record
pub fn merge_server_preferences(
    local: &PreferenceRecord,
    server: &ServerPreferences,
) -> PreferenceRecord {
    fn pick<T: Clone>(local: &Option<T>, server: &Option<T>, server_confirms: bool) -> Option<T> {
        match (local, server) {
            (None, server) => server.clone(),
            (Some(_), Some(server)) if server_confirms => Some(server.clone()),
            (Some(local), _) => Some(local.clone()),
        }
    }

    let confirms = server.onboarding_complete;
    PreferenceRecord {
        remembered_identifier: local.remembered_identifier.clone(),
        variant_preference: pick(&local.variant_preference, &server.variant_preference, confirms),
        onboarding_complete: local.onboarding_complete || server.onboarding_complete,
        goal: pick(&local.goal, &server.goal, confirms),
    }
}

struct InFlight {
    key: String,
    generation: u64,
    done: Shared<BoxFuture<'static, ()>>,
}

/// Reconciles the local record against the server copy
///
/// Concurrent calls for the same identifier share one network call; a call
/// for a different identifier supersedes the previous one, whose result is
/// then discarded.
pub struct Reconciler {
    cache: PreferenceCache,
    provider: Arc<dyn PreferenceProvider>,
    events: EventBus,
    slot: GenerationSlot,
    in_flight: Mutex<Option<InFlight>>,
}

impl Reconciler {
    pub fn new(cache: PreferenceCache, provider: Arc<dyn PreferenceProvider>, events: EventBus) -> Self {
        Self {
            cache,
            provider,
            events,
            slot: GenerationSlot::new("reconcile"),
            in_flight: Mutex::new(None),
        }
    }

    /// Reconcile only when local state says it is worth a network call
    pub async fn reconcile_if_needed(&self, identifier: &Identifier) {
        if self.cache.needs_reconcile() {
            self.reconcile(identifier).await;
        } else {
            debug!(identifier = %identifier, "Preferences complete locally, skipping reconciliation");
        }
    }

    /// Fetch the server record and merge it into the local one
    pub async fn reconcile(&self, identifier: &Identifier) {
        let done = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            match in_flight.as_ref() {
                Some(existing)
                    if existing.key == identifier.normalized()
                        && existing.generation == self.slot.generation()
                        && existing.done.peek().is_none() =>
                {
                    debug!(identifier = %identifier, "Joining in-flight reconciliation");
                    existing.done.clone()
                }
                _ => {
                    let lease = self.slot.supersede();
                    let generation = lease.generation();
                    let cache = self.cache.clone();
                    let provider = Arc::clone(&self.provider);
                    let events = self.events.clone();
                    let key = identifier.normalized().to_string();
                    let identifier = identifier.clone();

                    let done = async move {
                        let fetched = lease.run(provider.fetch_preferences(&identifier)).await;
                        let server = match fetched {
                            Ok(Ok(server)) => server,
                            Ok(Err(e)) => {
                                warn!(identifier = %identifier, error = %e, "Preference reconciliation failed, keeping local state");
                                return;
                            }
                            Err(_) => {
                                debug!(identifier = %identifier, "Reconciliation superseded");
                                return;
                            }
                        };

                        let applied = lease.commit(|| cache.merge_server(&server));
                        match applied {
                            Some(Ok(record)) => {
                                info!(
                                    identifier = %identifier,
                                    onboarding_complete = record.onboarding_complete,
                                    unconfirmed = ?cache.touched_fields(),
                                    "Preferences reconciled"
                                );
                                events.emit_lossy(SyncEvent::PreferencesReconciled {
                                    identifier: identifier.clone(),
                                    onboarding_complete: record.onboarding_complete,
                                    timestamp: chrono::Utc::now(),
                                });
                            }
                            Some(Err(e)) => {
                                warn!(identifier = %identifier, error = %e, "Reconciled record could not be stored");
                            }
                            None => {
                                debug!(identifier = %identifier, "Discarding superseded reconciliation result");
                            }
                        }
                    }
                    .boxed()
                    .shared();

                    *in_flight = Some(InFlight {
                        key,
                        generation,
                        done: done.clone(),
                    });
                    done
                }
            }
        };

        done.await;
    }

    /// Cancel any in-flight reconciliation
    pub fn cancel(&self) {
        self.slot.cancel();
    }
}
