//! Preference cache and reconciler
//!
//! [`PreferenceCache`] owns the in-memory copy of the durable
//! [`PreferenceRecord`] and [`RecentIdentities`] list. Every mutation is a
//! synchronous read-modify-write under one lock followed by a full
//! serialize-and-store, so interleaved writers in this process never lose
//! updates. Another process writing the same store is picked up by
//! [`PreferenceCache::reload`], which replaces rather than merges.
//!
//! The cache also remembers which fields this process wrote and the server
//! has not yet echoed back; server merges report them.

mod reconciler;
mod store;

pub use reconciler::{merge_server_preferences, Reconciler};
pub use store::{FileStore, MemoryStore, PreferenceStore};

use rkd_common::{Identifier, RemoteEntitySummary};
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::models::{PreferenceField, PreferencePatch, PreferenceRecord, RecentIdentities};
use crate::providers::ServerPreferences;

const PREFERENCES_KEY: &str = "preferences";
const RECENT_IDENTITIES_KEY: &str = "recent_identities";

#[derive(Debug, Default)]
struct CacheState {
    record: PreferenceRecord,
    recent: RecentIdentities,
    /// Written locally, not yet matched by a server copy
    touched: BTreeSet<PreferenceField>,
}

struct CacheInner {
    store: Arc<dyn PreferenceStore>,
    recent_limit: usize,
    state: Mutex<CacheState>,
}

/// Process-wide preference cache backed by a durable store
#[derive(Clone)]
pub struct PreferenceCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for PreferenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreferenceCache")
            .field("recent_limit", &self.inner.recent_limit)
            .finish_non_exhaustive()
    }
}

fn load_or_default<T: DeserializeOwned + Default>(store: &dyn PreferenceStore, key: &str) -> T {
    match store.load(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Stored value unreadable, starting from defaults");
                T::default()
            }
        },
        Ok(None) => T::default(),
        Err(e) => {
            warn!(key = key, error = %e, "Store read failed, starting from defaults");
            T::default()
        }
    }
}

impl PreferenceCache {
    /// Open the cache, reading both records from `store`
    ///
    /// Unreadable records fall back to defaults; local state is rebuilt on
    /// the next successful write.
    pub fn open(store: Arc<dyn PreferenceStore>, recent_limit: usize) -> Self {
        let record: PreferenceRecord = load_or_default(store.as_ref(), PREFERENCES_KEY);
        let recent: RecentIdentities = load_or_default(store.as_ref(), RECENT_IDENTITIES_KEY);
        let recent = recent.normalized(recent_limit);

        debug!(
            onboarding_complete = record.onboarding_complete,
            recent = recent.len(),
            "Preference cache opened"
        );

        Self {
            inner: Arc::new(CacheInner {
                store,
                recent_limit,
                state: Mutex::new(CacheState {
                    record,
                    recent,
                    touched: BTreeSet::new(),
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn persist_record(&self, record: &PreferenceRecord) -> SyncResult<()> {
        let raw = serde_json::to_string(record).map_err(rkd_common::Error::from)?;
        self.inner.store.save(PREFERENCES_KEY, &raw)?;
        Ok(())
    }

    fn persist_recent(&self, recent: &RecentIdentities) -> SyncResult<()> {
        let raw = serde_json::to_string(recent).map_err(rkd_common::Error::from)?;
        self.inner.store.save(RECENT_IDENTITIES_KEY, &raw)?;
        Ok(())
    }

    /// Current preference record
    pub fn read(&self) -> PreferenceRecord {
        self.lock().record.clone()
    }

    /// Shallow-merge `patch` into the record and persist it
    ///
    /// The in-memory copy only changes if the store accepted the write.
    pub fn write(&self, patch: PreferencePatch) -> SyncResult<PreferenceRecord> {
        let mut state = self.lock();
        let mut next = state.record.clone();
        let touched = patch.apply_to(&mut next);
        if next == state.record {
            return Ok(next);
        }
        self.persist_record(&next)?;
        debug!(fields = ?touched, "Preference record written");
        state.touched.extend(touched);
        state.record = next.clone();
        Ok(next)
    }

    /// Whether a server reconciliation is worth a network call
    ///
    /// Fully onboarded users with a variant preference are never reconciled.
    pub fn needs_reconcile(&self) -> bool {
        let state = self.lock();
        !state.record.onboarding_complete || state.record.variant_preference.is_none()
    }

    /// Merge the server copy into the local record (see
    /// [`merge_server_preferences`]) and persist if anything changed
    pub fn merge_server(&self, server: &ServerPreferences) -> SyncResult<PreferenceRecord> {
        let mut state = self.lock();
        let merged = merge_server_preferences(&state.record, server);
        if merged != state.record {
            self.persist_record(&merged)?;
        }

        let kept: Vec<PreferenceField> = state
            .touched
            .iter()
            .copied()
            .filter(|field| server_disagrees(*field, server, &merged))
            .collect();
        let replaced: Vec<PreferenceField> = state
            .touched
            .iter()
            .copied()
            .filter(|field| field_differs(*field, &state.record, &merged))
            .collect();
        if !kept.is_empty() {
            debug!(fields = ?kept, "Server values not applied over local choices");
        }
        if !replaced.is_empty() {
            info!(fields = ?replaced, "Server confirmation replaced local choices");
        }
        state
            .touched
            .retain(|field| server_disagrees(*field, server, &merged));

        state.record = merged.clone();
        Ok(merged)
    }

    /// Fields written in this process that the server copy does not match yet
    pub fn touched_fields(&self) -> Vec<PreferenceField> {
        self.lock().touched.iter().copied().collect()
    }

    /// Adopt `summary` as the remembered account if none is set yet
    ///
    /// Single idempotent entry point for both "first search becomes your
    /// account" and onboarding completion. Returns true if this call made
    /// the claim.
    pub fn claim_remembered_identity(&self, summary: &RemoteEntitySummary) -> SyncResult<bool> {
        if !summary.confirmed {
            return Ok(false);
        }
        let mut state = self.lock();
        if state.record.remembered_identifier.is_some() {
            return Ok(false);
        }
        let mut next = state.record.clone();
        next.remembered_identifier = Some(summary.identifier.clone());
        self.persist_record(&next)?;
        state.record = next;
        info!(identifier = %summary.identifier, "Remembered identity claimed");
        Ok(true)
    }

    /// Snapshot of recent identities
    pub fn recent(&self) -> RecentIdentities {
        self.lock().recent.clone()
    }

    /// Recent entry matching `candidate` case-insensitively
    pub fn find_recent(&self, candidate: &str) -> Option<RemoteEntitySummary> {
        self.lock().recent.find(candidate).cloned()
    }

    /// Add-or-promote a confirmed identity
    pub fn remember_recent(&self, summary: &RemoteEntitySummary) -> SyncResult<()> {
        if !summary.confirmed {
            return Ok(());
        }
        let mut state = self.lock();
        let mut next = state.recent.clone();
        next.promote(summary.clone(), self.inner.recent_limit);
        if next == state.recent {
            return Ok(());
        }
        self.persist_recent(&next)?;
        state.recent = next;
        Ok(())
    }

    /// Whether `identifier` is the remembered account
    pub fn is_remembered(&self, identifier: &Identifier) -> bool {
        self.lock().record.is_remembered(identifier)
    }

    /// Re-read both records after another writer changed the store
    pub fn reload(&self) {
        let record: PreferenceRecord = load_or_default(self.inner.store.as_ref(), PREFERENCES_KEY);
        let recent: RecentIdentities =
            load_or_default(self.inner.store.as_ref(), RECENT_IDENTITIES_KEY);
        let mut state = self.lock();
        state.record = record;
        state.recent = recent.normalized(self.inner.recent_limit);
        state.touched.clear();
        debug!("Preference cache reloaded from store");
    }
}

fn field_differs(field: PreferenceField, a: &PreferenceRecord, b: &PreferenceRecord) -> bool {
    match field {
        PreferenceField::RememberedIdentifier => a.remembered_identifier != b.remembered_identifier,
        PreferenceField::VariantPreference => a.variant_preference != b.variant_preference,
        PreferenceField::OnboardingComplete => a.onboarding_complete != b.onboarding_complete,
        PreferenceField::Goal => a.goal != b.goal,
    }
}

/// Whether the server holds a value for `field` other than the merged one
fn server_disagrees(
    field: PreferenceField,
    server: &ServerPreferences,
    merged: &PreferenceRecord,
) -> bool {
    match field {
        // Never sent by the server
        PreferenceField::RememberedIdentifier => true,
        PreferenceField::VariantPreference => server.variant_preference != merged.variant_preference,
        PreferenceField::OnboardingComplete => server.onboarding_complete != merged.onboarding_complete,
        PreferenceField::Goal => server.goal != merged.goal,
    }
}
