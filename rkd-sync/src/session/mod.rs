//! Streaming ingestion session
//!
//! [`StreamingSession`] owns one logical session slot. `start` supersedes the
//! previous session: its token is cancelled (dropping its transport) and the
//! new task waits for the old one to finish before opening its own stream, so
//! at most one transport is open per slot at any instant.
//!
//! Every write to the shared [`SessionSnapshot`] goes through the session's
//! lease; a superseded or cancelled session can never touch it again.

mod state;

pub use state::{SessionMachine, SessionPhase, SessionUpdate};

use futures::StreamExt;
use rkd_common::events::{EventBus, SyncEvent};
use rkd_common::{Identifier, RemoteEntitySummary, Variant};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordination::{GenerationSlot, Lease};
use crate::error::SyncError;
use crate::models::{CompletedStats, IngestionResult, ProgressState};
use crate::providers::StatsStreamProvider;

/// What the consumer sees of the current session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: Option<Uuid>,
    pub identifier: Option<Identifier>,
    pub variant: Option<Variant>,
    pub phase: SessionPhase,
    pub player: Option<RemoteEntitySummary>,
    pub progress: Option<ProgressState>,
    pub result: IngestionResult,
    /// User-visible error for a failed session
    pub error: Option<String>,
    /// Cancelled by the consumer, possibly after reaching a terminal phase
    pub cancelled: bool,
}

impl SessionSnapshot {
    fn of(machine: &SessionMachine) -> Self {
        Self {
            session_id: Some(machine.session_id()),
            identifier: Some(machine.identifier().clone()),
            variant: Some(machine.variant()),
            phase: machine.phase(),
            player: machine.entity().cloned(),
            progress: machine.progress().cloned(),
            result: machine.result().clone(),
            error: machine.error().map(SyncError::user_message),
            cancelled: false,
        }
    }

    /// Non-terminal and still receiving messages
    pub fn is_loading(&self) -> bool {
        self.session_id.is_some()
            && !self.cancelled
            && !self.phase.is_terminal()
            && self.phase != SessionPhase::Idle
    }

    fn mark_cancelled(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = SessionPhase::Cancelled;
        }
        self.progress = None;
        self.cancelled = true;
    }
}

/// Terminal outcome of one session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Completed(Box<CompletedStats>),
    Failed(SyncError),
    Cancelled,
}

/// Handle to one started session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    lease: Lease,
    state: Arc<watch::Sender<SessionSnapshot>>,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Whether this session still owns the slot
    pub fn is_current(&self) -> bool {
        self.lease.is_current()
    }

    /// Cancel the session (idempotent)
    ///
    /// Tears down the transport and clears progress. A handle for a session
    /// that was already superseded leaves its successor untouched.
    pub fn cancel(&self) {
        let state = &self.state;
        if self
            .lease
            .cancel_with(|| state.send_modify(SessionSnapshot::mark_cancelled))
            .is_some()
        {
            debug!(session_id = %self.session_id, "Session cancelled by handle");
        }
    }

    /// Subscribe to `{ player, progress, result }` of the slot
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    /// Wait for the session's terminal outcome
    pub async fn outcome(&self) -> SessionOutcome {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone().unwrap_or(SessionOutcome::Cancelled),
            Err(_) => SessionOutcome::Cancelled,
        };
        result
    }
}

/// One logical session slot
pub struct StreamingSession {
    provider: Arc<dyn StatsStreamProvider>,
    events: EventBus,
    slot: GenerationSlot,
    state: Arc<watch::Sender<SessionSnapshot>>,
    previous: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSession {
    pub fn new(provider: Arc<dyn StatsStreamProvider>, events: EventBus) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            provider,
            events,
            slot: GenerationSlot::new("session"),
            state: Arc::new(state),
            previous: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Start a session for `(identifier, variant)`, superseding any previous one
    pub fn start(&self, identifier: Identifier, variant: Variant) -> SessionHandle {
        let lease = self.slot.supersede();
        let mut machine = SessionMachine::new(identifier, variant);
        machine.connect();
        let session_id = machine.session_id();

        lease.commit(|| self.state.send_replace(SessionSnapshot::of(&machine)));

        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = SessionHandle {
            session_id,
            lease: lease.clone(),
            state: Arc::clone(&self.state),
            outcome: outcome_rx,
        };

        let run = SessionRun {
            provider: Arc::clone(&self.provider),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            lease,
            machine,
            outcome: outcome_tx,
        };

        let mut previous = self.previous.lock().unwrap_or_else(|p| p.into_inner());
        let prior = previous.take();
        *previous = Some(tokio::spawn(run.drive(prior)));

        handle
    }

    /// Cancel the active session, if any, and clear progress
    pub fn cancel(&self) {
        let state = &self.state;
        self.slot
            .cancel_with(|| state.send_modify(SessionSnapshot::mark_cancelled));
    }

    /// Cancel and wait until the active transport has been released
    pub async fn shutdown(&self) {
        self.cancel();
        let prior = self
            .previous
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(prior) = prior {
            let _ = prior.await;
        }
    }
}

struct SessionRun {
    provider: Arc<dyn StatsStreamProvider>,
    events: EventBus,
    state: Arc<watch::Sender<SessionSnapshot>>,
    lease: Lease,
    machine: SessionMachine,
    outcome: watch::Sender<Option<SessionOutcome>>,
}

impl SessionRun {
    async fn drive(mut self, prior: Option<JoinHandle<()>>) {
        // The prior session's token is already cancelled; wait for it to drop
        // its transport before opening ours.
        if let Some(prior) = prior {
            let _ = prior.await;
        }

        let session_id = self.machine.session_id();
        let identifier = self.machine.identifier().clone();
        let variant = self.machine.variant();

        let opened = self
            .lease
            .run(self.provider.open_stats_stream(&identifier, variant))
            .await
            .and_then(|opened| opened);
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let update = self.machine.fail(e);
                self.publish(update);
                return;
            }
        };

        info!(session_id = %session_id, identifier = %identifier, variant = %variant, "Session started");
        self.events.emit_lossy(SyncEvent::SessionStarted {
            session_id,
            identifier: identifier.clone(),
            variant,
            timestamp: chrono::Utc::now(),
        });

        while !self.machine.is_terminal() {
            let token = self.lease.token().clone();
            let update = tokio::select! {
                biased;
                _ = token.cancelled() => self.machine.cancel(),
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        debug!(session_id = %session_id, kind = message.kind(), "Stream message");
                        self.machine.apply(message)
                    }
                    Some(Err(e)) => self.machine.fail(e),
                    None => self.machine.fail(SyncError::NetworkFailure(
                        "stream ended before a terminal message".to_string(),
                    )),
                },
            };
            self.publish(update);
        }

        drop(stream);
        debug!(session_id = %session_id, phase = ?self.machine.phase(), "Session transport closed");
    }

    /// Apply `update` to shared state if this session still owns the slot
    fn publish(&self, update: SessionUpdate) {
        let session_id = self.machine.session_id();
        let snapshot = SessionSnapshot::of(&self.machine);
        let events = &self.events;
        let applied = self.lease.commit(|| {
            self.state.send_replace(snapshot);
            match &update {
                SessionUpdate::Identity(summary) => events.emit_lossy(SyncEvent::IdentityConfirmed {
                    session_id,
                    summary: summary.clone(),
                    timestamp: chrono::Utc::now(),
                }),
                SessionUpdate::Started(progress) | SessionUpdate::Progress(progress) => {
                    events.emit_lossy(SyncEvent::ProgressUpdated {
                        session_id,
                        current_unit: progress.current_unit,
                        total_units: progress.total_units,
                        label: progress.current_label.clone(),
                        from_cache: progress.from_cache,
                    })
                }
                SessionUpdate::Completed(stats) => events.emit_lossy(SyncEvent::SessionCompleted {
                    session_id,
                    identifier: stats.entity.identifier.clone(),
                    variant: stats.variant,
                    from_cache: stats.from_cache,
                    timestamp: chrono::Utc::now(),
                }),
                SessionUpdate::Failed(error) => events.emit_lossy(SyncEvent::SessionFailed {
                    session_id,
                    reason: error.user_message(),
                    timestamp: chrono::Utc::now(),
                }),
                SessionUpdate::Cancelled | SessionUpdate::Ignored => {}
            }
        });

        if !update.is_terminal() {
            return;
        }

        let outcome = match (update, applied) {
            (SessionUpdate::Completed(stats), Some(())) => {
                info!(session_id = %session_id, from_cache = stats.from_cache, "Session completed");
                SessionOutcome::Completed(stats)
            }
            (SessionUpdate::Failed(error), Some(())) => {
                match &error {
                    SyncError::ProtocolViolation(detail) => {
                        warn!(session_id = %session_id, detail = %detail, "Protocol violation, session terminated")
                    }
                    other => warn!(session_id = %session_id, error = %other, "Session failed"),
                }
                SessionOutcome::Failed(error)
            }
            _ => {
                debug!(session_id = %session_id, "Session cancelled");
                self.events.emit_lossy(SyncEvent::SessionCancelled {
                    session_id,
                    timestamp: chrono::Utc::now(),
                });
                SessionOutcome::Cancelled
            }
        };
        self.outcome.send_replace(Some(outcome));
    }
}
