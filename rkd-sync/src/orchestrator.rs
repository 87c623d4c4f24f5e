//! Session orchestrator
//!
//! Composition root of the engine and the only surface the presentation
//! layer talks to: commands in, a reactive [`EngineView`] out.
//!
//! Flow:
//! ```text
//! set_candidate ──► DebouncedLookup ──────────────► view.lookup
//! submit ──► onboarded? ──yes──► StreamingSession ─► view.result/progress/loading/error
//!                 └──no──► reconcile + identity-only fetch ─► view.onboarding_summary
//! completion ──► RecentIdentities + remembered-identity claim ─► view.own_summary
//! ```

use rkd_common::events::EventBus;
use rkd_common::{Identifier, RemoteEntitySummary, Variant};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::coordination::GenerationSlot;
use crate::error::SyncResult;
use crate::heartbeat::{ActivityHeartbeat, ActivityMonitor, HeartbeatGuard};
use crate::lookup::{CheckResult, DebouncedLookup};
use crate::models::{CompletedStats, IngestionResult, PreferencePatch, ProgressState};
use crate::preferences::{PreferenceCache, PreferenceStore, Reconciler};
use crate::providers::http::HttpCollaborators;
use crate::providers::{IdentityProvider, PreferenceProvider, StatsStreamProvider, TelemetrySink};
use crate::session::{SessionOutcome, SessionPhase, SessionSnapshot, StreamingSession};

/// The four external collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityProvider>,
    pub stats: Arc<dyn StatsStreamProvider>,
    pub preferences: Arc<dyn PreferenceProvider>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl Collaborators {
    /// Use one HTTP client for every collaborator
    pub fn http(client: HttpCollaborators) -> Self {
        let client = Arc::new(client);
        Self {
            identity: client.clone(),
            stats: client.clone(),
            preferences: client.clone(),
            telemetry: client,
        }
    }
}

/// Reactive output consumed by the presentation layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineView {
    /// Result for the currently viewed identity
    pub result: IngestionResult,
    pub progress: Option<ProgressState>,
    pub loading: bool,
    /// User-visible error; never set for cancellations
    pub error: Option<String>,
    /// The user's own account, kept separately from the viewed one
    pub own_summary: Option<RemoteEntitySummary>,
    /// Raw text of the identifier input
    pub candidate: String,
    pub lookup: CheckResult,
    /// Identity shown during onboarding, before any stream was started
    pub onboarding_summary: Option<RemoteEntitySummary>,
    pub active: Option<Identifier>,
    pub variant: Variant,
    /// Identity-only onboarding fetch in flight; keeps `loading` set while
    /// no session is running
    pub onboarding_pending: bool,
}

impl EngineView {
    fn apply_session(&mut self, snapshot: &SessionSnapshot) {
        self.loading = self.onboarding_pending || snapshot.is_loading();
        if snapshot.cancelled {
            // Only the error this session put there is dropped
            self.progress = None;
            if snapshot.error.is_some() && self.error == snapshot.error {
                self.error = None;
            }
            return;
        }
        self.progress = snapshot.progress.clone();
        match snapshot.phase {
            SessionPhase::Idle => {}
            SessionPhase::Cancelled => {
                self.progress = None;
            }
            _ => {
                self.result = snapshot.result.clone();
                self.error = snapshot.error.clone();
            }
        }
    }
}

struct OrchestratorInner {
    settings: EngineSettings,
    cache: PreferenceCache,
    lookup: DebouncedLookup,
    session: StreamingSession,
    reconciler: Reconciler,
    heartbeat: ActivityHeartbeat,
    identity: Arc<dyn IdentityProvider>,
    events: EventBus,
    view: Arc<watch::Sender<EngineView>>,
    onboarding: GenerationSlot,
    heartbeat_guard: Mutex<Option<(Identifier, HeartbeatGuard)>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

/// Composition root; cheap to clone
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SessionOrchestrator {
    /// Wire the engine together
    ///
    /// Must be called from within a Tokio runtime: the view forwarders are
    /// spawned here.
    pub fn new(
        settings: EngineSettings,
        store: Arc<dyn PreferenceStore>,
        collaborators: Collaborators,
        events: EventBus,
    ) -> Self {
        let cache = PreferenceCache::open(store, settings.recent_identities_limit);
        let lookup = DebouncedLookup::new(
            Arc::clone(&collaborators.identity),
            cache.clone(),
            events.clone(),
            settings.debounce,
            settings.min_identifier_len,
        );
        let session = StreamingSession::new(Arc::clone(&collaborators.stats), events.clone());
        let reconciler = Reconciler::new(
            cache.clone(),
            Arc::clone(&collaborators.preferences),
            events.clone(),
        );
        let heartbeat = ActivityHeartbeat::new(
            Arc::clone(&collaborators.telemetry),
            ActivityMonitor::new(),
            events.clone(),
            settings.heartbeat_interval,
        );

        let record = cache.read();
        let initial = EngineView {
            variant: record.variant_preference.unwrap_or(settings.default_variant),
            own_summary: own_summary_from(&cache),
            ..Default::default()
        };
        let (view, _) = watch::channel(initial);
        let view = Arc::new(view);

        let forwarders = vec![
            tokio::spawn(forward_lookup(lookup.subscribe(), Arc::clone(&view))),
            tokio::spawn(forward_session(session.subscribe(), Arc::clone(&view))),
        ];

        Self {
            inner: Arc::new(OrchestratorInner {
                settings,
                cache,
                lookup,
                session,
                reconciler,
                heartbeat,
                identity: collaborators.identity,
                events,
                view,
                onboarding: GenerationSlot::new("onboarding"),
                heartbeat_guard: Mutex::new(None),
                forwarders: Mutex::new(forwarders),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineView> {
        self.inner.view.subscribe()
    }

    pub fn view(&self) -> EngineView {
        self.inner.view.borrow().clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn preferences(&self) -> &PreferenceCache {
        &self.inner.cache
    }

    /// Input/visibility feed for the heartbeat
    pub fn activity_monitor(&self) -> &ActivityMonitor {
        self.inner.heartbeat.monitor()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Engine start: reconcile the remembered account if needed and start
    /// its heartbeat
    pub async fn start(&self) {
        let Some(identifier) = self.inner.cache.read().remembered_identifier else {
            debug!("No remembered identity, skipping start-up reconciliation");
            return;
        };

        self.inner.reconciler.reconcile_if_needed(&identifier).await;

        let record = self.inner.cache.read();
        let variant = record.variant_preference.unwrap_or(self.inner.settings.default_variant);
        self.inner.view.send_modify(|view| view.variant = variant);
        self.inner.start_heartbeat(identifier, variant);
    }

    /// Update the identifier input
    pub fn set_candidate(&self, raw: &str) -> CheckResult {
        self.inner
            .view
            .send_modify(|view| view.candidate = raw.to_string());
        self.inner.lookup.check(raw)
    }

    /// Submit the current candidate; returns false for blank input
    pub fn submit(&self) -> bool {
        let candidate = self.inner.view.borrow().candidate.clone();
        let Some(identifier) = Identifier::parse(&candidate) else {
            return false;
        };
        self.inner.submit(identifier);
        true
    }

    /// Submit a remembered/recent identity picked from a list
    pub fn select_remembered(&self, summary: &RemoteEntitySummary) {
        self.inner.view.send_modify(|view| {
            view.candidate = summary.identifier.display().to_string();
        });
        self.inner.submit(summary.identifier.clone());
    }

    /// Persist the variant and restart the active session for it
    pub fn change_variant(&self, variant: Variant) -> SyncResult<()> {
        self.inner
            .cache
            .write(PreferencePatch::new().variant_preference(variant))?;
        self.inner.view.send_modify(|view| view.variant = variant);

        let active = self.inner.view.borrow().active.clone();
        if let Some(identifier) = active {
            info!(identifier = %identifier, variant = %variant, "Variant changed, restarting session");
            self.inner.start_session(identifier, variant);
        }

        let running = self
            .inner
            .heartbeat_guard
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|(identifier, _)| identifier.clone());
        if let Some(identifier) = running {
            self.inner.start_heartbeat(identifier, variant);
        }
        Ok(())
    }

    /// Finish onboarding: persist completion, claim the onboarding identity
    /// and start the full stream for it
    pub fn complete_onboarding(&self, goal: Option<String>) -> SyncResult<()> {
        let mut patch = PreferencePatch::new().onboarding_complete(true);
        if let Some(goal) = goal {
            patch = patch.goal(goal);
        }
        self.inner.cache.write(patch)?;

        let (summary, active, variant) = {
            let view = self.inner.view.borrow();
            (view.onboarding_summary.clone(), view.active.clone(), view.variant)
        };
        if let Some(summary) = &summary {
            self.inner.claim(summary)?;
        }

        info!("Onboarding completed");
        if let Some(identifier) = active {
            self.inner.start_session(identifier, variant);
        }
        Ok(())
    }

    /// Another writer changed the durable store: re-read, never merge
    pub fn storage_changed(&self) {
        self.inner.cache.reload();
        let record = self.inner.cache.read();
        let own = own_summary_from(&self.inner.cache);
        let default_variant = self.inner.settings.default_variant;
        self.inner.view.send_modify(|view| {
            view.variant = record.variant_preference.unwrap_or(default_variant);
            let still_own = match (&view.own_summary, &record.remembered_identifier) {
                (Some(summary), Some(remembered)) => summary.identifier == *remembered,
                _ => false,
            };
            if !still_own {
                view.own_summary = own;
            }
        });
    }

    /// Cancel every live component (idempotent)
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = &self.inner;
        inner.lookup.cancel();
        inner.session.cancel();
        inner.reconciler.cancel();
        inner.onboarding.cancel();
        // Forwarders are aborted below, so settle the view here
        let snapshot = inner.session.snapshot();
        inner.view.send_modify(|view| {
            view.onboarding_pending = false;
            view.apply_session(&snapshot);
        });
        if let Some((_, guard)) = inner
            .heartbeat_guard
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            guard.cancel();
        }
        for forwarder in inner
            .forwarders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
        {
            forwarder.abort();
        }
        info!("Orchestrator disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl OrchestratorInner {
    fn submit(self: &Arc<Self>, identifier: Identifier) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }

        self.lookup.reset();
        let variant = self.view.borrow().variant;
        self.view.send_modify(|view| {
            view.active = Some(identifier.clone());
            view.onboarding_summary = None;
            view.error = None;
        });

        if self.cache.read().onboarding_complete {
            self.start_session(identifier, variant);
        } else {
            self.start_onboarding(identifier, variant);
        }
    }

    fn start_session(self: &Arc<Self>, identifier: Identifier, variant: Variant) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.onboarding.cancel();

        let handle = self.session.start(identifier, variant);
        let snapshot = self.session.snapshot();
        self.view.send_modify(|view| {
            view.onboarding_pending = false;
            view.apply_session(&snapshot);
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let SessionOutcome::Completed(stats) = handle.outcome().await {
                inner.on_session_completed(&stats);
            }
        });
    }

    /// Lightweight identity-only path for users who have not finished onboarding
    ///
    /// The server copy of the preferences is reconciled first: if it says
    /// onboarding is already complete, the full stream starts straight away.
    fn start_onboarding(self: &Arc<Self>, identifier: Identifier, variant: Variant) {
        let lease = self.onboarding.supersede();
        self.view.send_modify(|view| {
            view.onboarding_pending = true;
            view.loading = true;
        });
        // The forwarder sees `onboarding_pending` when it applies this
        self.session.cancel();

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if lease.run(inner.reconciler.reconcile_if_needed(&identifier)).await.is_err() {
                return;
            }
            if inner.cache.read().onboarding_complete {
                let variant = inner.cache.read().variant_preference.unwrap_or(variant);
                if lease.commit(|| ()).is_some() {
                    inner.view.send_modify(|view| view.variant = variant);
                    inner.start_session(identifier, variant);
                }
                return;
            }

            let fetched = lease.run(inner.identity.lookup_identity(&identifier)).await;
            let update = match fetched {
                Err(_) => return,
                Ok(Ok(lookup)) if lookup.exists => Ok(RemoteEntitySummary::confirmed(
                    &identifier,
                    lookup.display_name,
                    lookup.avatar_url,
                )),
                Ok(Ok(_)) => Err(format!("No account named {} was found.", identifier)),
                Ok(Err(e)) => {
                    warn!(identifier = %identifier, error = %e, "Onboarding identity fetch failed");
                    Err(e.user_message())
                }
            };

            lease.commit(|| {
                inner.view.send_modify(|view| {
                    view.onboarding_pending = false;
                    view.loading = false;
                    match update {
                        Ok(summary) => {
                            debug!(identifier = %summary.identifier, "Onboarding summary ready");
                            view.onboarding_summary = Some(summary);
                        }
                        Err(message) => view.error = Some(message),
                    }
                })
            });
        });
    }

    fn on_session_completed(&self, stats: &CompletedStats) {
        let entity = &stats.entity;
        if let Err(e) = self.cache.remember_recent(entity) {
            warn!(identifier = %entity.identifier, error = %e, "Recent identities not stored");
        }
        if let Err(e) = self.claim(entity) {
            warn!(identifier = %entity.identifier, error = %e, "Remembered identity not stored");
        }
        if self.cache.is_remembered(&entity.identifier) {
            self.view
                .send_modify(|view| view.own_summary = Some(entity.clone()));
        }
    }

    /// Single entry point for adopting the user's own account
    fn claim(&self, summary: &RemoteEntitySummary) -> SyncResult<()> {
        if self.cache.claim_remembered_identity(summary)? {
            let variant = self.view.borrow().variant;
            self.start_heartbeat(summary.identifier.clone(), variant);
        }
        Ok(())
    }

    fn start_heartbeat(&self, identifier: Identifier, variant: Variant) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let guard = self
            .heartbeat
            .start(identifier.clone(), self.settings.heartbeat_context(variant));
        let previous = self
            .heartbeat_guard
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace((identifier, guard));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
    }
}

fn own_summary_from(cache: &PreferenceCache) -> Option<RemoteEntitySummary> {
    let remembered = cache.read().remembered_identifier?;
    cache.find_recent(remembered.normalized())
}

async fn forward_lookup(mut rx: watch::Receiver<CheckResult>, view: Arc<watch::Sender<EngineView>>) {
    while rx.changed().await.is_ok() {
        let lookup = rx.borrow_and_update().clone();
        view.send_modify(|view| view.lookup = lookup);
    }
}

async fn forward_session(
    mut rx: watch::Receiver<SessionSnapshot>,
    view: Arc<watch::Sender<EngineView>>,
) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        view.send_modify(|view| view.apply_session(&snapshot));
    }
}
