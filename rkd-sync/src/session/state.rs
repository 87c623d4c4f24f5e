//! Ingestion session state machine
//!
//! Pure reducer over [`StreamMessage`]s; no transport, no clock-driven
//! behaviour. Phases:
//!
//! ```text
//! Idle → Connecting → [IdentityKnown] → InProgress → Complete (T)
//!                 any non-terminal phase → Failed (T) | Cancelled (T)
//! ```
//!
//! Once terminal, every further input is ignored.

use chrono::{DateTime, Utc};
use rkd_common::{Identifier, RemoteEntitySummary, Variant};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncError;
use crate::models::{CompletedStats, IngestionResult, ProgressState};
use crate::providers::{IdentityMessage, StreamMessage};

/// Session phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    /// Transport requested, nothing received yet
    Connecting,
    /// Entity confirmed, statistics not started
    IdentityKnown,
    /// Start-of-work received
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Complete | SessionPhase::Failed | SessionPhase::Cancelled
        )
    }
}

/// Observable effect of one reducer step
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Input arrived after a terminal phase (or was a no-op)
    Ignored,
    Identity(RemoteEntitySummary),
    Started(ProgressState),
    Progress(ProgressState),
    Completed(Box<CompletedStats>),
    Failed(SyncError),
    Cancelled,
}

impl SessionUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionUpdate::Completed(_) | SessionUpdate::Failed(_) | SessionUpdate::Cancelled
        )
    }
}

/// One run of the ingestion state machine for an (identifier, variant) pair
#[derive(Debug, Clone)]
pub struct SessionMachine {
    session_id: Uuid,
    identifier: Identifier,
    variant: Variant,
    phase: SessionPhase,
    entity: Option<RemoteEntitySummary>,
    progress: Option<ProgressState>,
    result: IngestionResult,
    error: Option<SyncError>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl SessionMachine {
    pub fn new(identifier: Identifier, variant: Variant) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            identifier,
            variant,
            phase: SessionPhase::Idle,
            entity: None,
            progress: None,
            result: IngestionResult::Empty,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn entity(&self) -> Option<&RemoteEntitySummary> {
        self.entity.as_ref()
    }

    pub fn progress(&self) -> Option<&ProgressState> {
        self.progress.as_ref()
    }

    pub fn result(&self) -> &IngestionResult {
        &self.result
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Idle → Connecting
    pub fn connect(&mut self) -> bool {
        if self.phase != SessionPhase::Idle {
            return false;
        }
        self.phase = SessionPhase::Connecting;
        self.progress = None;
        true
    }

    /// Apply one stream message
    pub fn apply(&mut self, message: StreamMessage) -> SessionUpdate {
        if self.is_terminal() {
            return SessionUpdate::Ignored;
        }

        match message {
            StreamMessage::Identity(identity) => self.on_identity(identity),
            StreamMessage::Start {
                total_units,
                from_cache,
            } => self.on_start(total_units, from_cache),
            StreamMessage::Progress {
                current_unit,
                label,
            } => self.on_progress(current_unit, label),
            StreamMessage::Complete { payload } => self.on_complete(payload),
            StreamMessage::Error { reason } => self.fail(SyncError::UpstreamError(reason)),
        }
    }

    /// Terminate with `error` (transport failure, protocol violation, upstream error)
    pub fn fail(&mut self, error: SyncError) -> SessionUpdate {
        if self.is_terminal() {
            return SessionUpdate::Ignored;
        }
        if error.is_cancelled() {
            return self.cancel();
        }
        self.finish(SessionPhase::Failed);
        self.result = IngestionResult::Failed(error.user_message());
        self.error = Some(error.clone());
        SessionUpdate::Failed(error)
    }

    /// Terminate as cancelled; returns `Ignored` if already terminal
    pub fn cancel(&mut self) -> SessionUpdate {
        if self.is_terminal() {
            return SessionUpdate::Ignored;
        }
        self.finish(SessionPhase::Cancelled);
        SessionUpdate::Cancelled
    }

    fn finish(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.progress = None;
        self.ended_at = Some(Utc::now());
    }

    fn violation(&mut self, detail: String) -> SessionUpdate {
        self.fail(SyncError::ProtocolViolation(detail))
    }

    fn on_identity(&mut self, identity: IdentityMessage) -> SessionUpdate {
        if self.phase != SessionPhase::Connecting {
            return self.violation(format!("identity message in phase {:?}", self.phase));
        }
        if !self.identifier.matches(&identity.identifier) {
            return self.violation(format!(
                "identity {:?} does not match requested {}",
                identity.identifier, self.identifier
            ));
        }

        let identifier = self.identifier.with_confirmed_display(&identity.identifier);
        let summary =
            RemoteEntitySummary::confirmed(&identifier, identity.display_name, identity.avatar_url);
        self.identifier = summary.identifier.clone();
        self.entity = Some(summary.clone());
        self.result = IngestionResult::Partial(summary.clone());
        self.phase = SessionPhase::IdentityKnown;
        SessionUpdate::Identity(summary)
    }

    fn on_start(&mut self, total_units: u32, from_cache: bool) -> SessionUpdate {
        match self.phase {
            SessionPhase::Connecting | SessionPhase::IdentityKnown => {
                let progress = ProgressState::started(total_units, from_cache);
                self.progress = Some(progress.clone());
                self.phase = SessionPhase::InProgress;
                SessionUpdate::Started(progress)
            }
            phase => self.violation(format!("start message in phase {:?}", phase)),
        }
    }

    fn on_progress(&mut self, current_unit: u32, label: String) -> SessionUpdate {
        let Some(progress) = self.progress.as_mut() else {
            return self.violation(format!("progress message in phase {:?}", self.phase));
        };

        // Non-decreasing, bounded by the announced total
        let bounded = current_unit.min(progress.total_units);
        progress.current_unit = progress.current_unit.max(bounded);
        if !label.is_empty() {
            progress.current_label = label;
        }
        SessionUpdate::Progress(progress.clone())
    }

    fn on_complete(&mut self, payload: serde_json::Value) -> SessionUpdate {
        let Some(entity) = self.entity.clone() else {
            return self.violation("completion without identity".to_string());
        };
        if !matches!(
            self.phase,
            SessionPhase::IdentityKnown | SessionPhase::InProgress
        ) {
            return self.violation(format!("completion in phase {:?}", self.phase));
        }

        let from_cache = self.progress.as_ref().is_some_and(|p| p.from_cache);
        let stats = Box::new(CompletedStats {
            entity,
            variant: self.variant,
            payload,
            from_cache,
            completed_at: Utc::now(),
        });
        self.finish(SessionPhase::Complete);
        self.result = IngestionResult::Complete(stats.clone());
        SessionUpdate::Completed(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn machine() -> SessionMachine {
        let mut machine = SessionMachine::new(Identifier::parse("magnus").unwrap(), Variant::Rapid);
        machine.connect();
        machine
    }

    fn identity(name: &str) -> StreamMessage {
        StreamMessage::Identity(IdentityMessage {
            identifier: name.to_string(),
            display_name: Some("Magnus C.".to_string()),
            avatar_url: None,
        })
    }

    fn progress(unit: u32) -> StreamMessage {
        StreamMessage::Progress {
            current_unit: unit,
            label: format!("month {}", unit),
        }
    }

    #[test]
    fn test_full_happy_path() {
        let mut m = machine();
        assert!(matches!(m.apply(identity("Magnus")), SessionUpdate::Identity(_)));
        assert_eq!(m.phase(), SessionPhase::IdentityKnown);
        assert!(matches!(m.result(), IngestionResult::Partial(_)));

        m.apply(StreamMessage::Start {
            total_units: 12,
            from_cache: false,
        });
        for unit in 1..=12 {
            m.apply(progress(unit));
        }
        assert_eq!(m.progress().unwrap().current_unit, 12);

        let update = m.apply(StreamMessage::Complete {
            payload: json!({"games": 340}),
        });
        let SessionUpdate::Completed(stats) = update else {
            panic!("expected completion, got {:?}", update);
        };
        assert_eq!(stats.entity.identifier.display(), "Magnus");
        assert_eq!(stats.payload["games"], 340);
        assert_eq!(m.phase(), SessionPhase::Complete);
        assert!(m.progress().is_none());
    }

    #[test]
    fn test_completion_without_identity_is_violation() {
        let mut m = machine();
        m.apply(StreamMessage::Start {
            total_units: 1,
            from_cache: true,
        });
        let update = m.apply(StreamMessage::Complete { payload: json!({}) });
        assert!(matches!(
            update,
            SessionUpdate::Failed(SyncError::ProtocolViolation(_))
        ));
        assert_eq!(m.phase(), SessionPhase::Failed);
        assert!(m.progress().is_none());
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut m = machine();
        m.apply(identity("magnus"));
        m.apply(StreamMessage::Start {
            total_units: 10,
            from_cache: false,
        });
        m.apply(progress(5));
        m.apply(progress(3));
        assert_eq!(m.progress().unwrap().current_unit, 5);
        m.apply(progress(40));
        assert_eq!(m.progress().unwrap().current_unit, 10);
    }

    #[test]
    fn test_progress_before_start_is_violation() {
        let mut m = machine();
        assert!(matches!(
            m.apply(progress(1)),
            SessionUpdate::Failed(SyncError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_mismatched_identity_is_violation() {
        let mut m = machine();
        assert!(matches!(
            m.apply(identity("hikaru")),
            SessionUpdate::Failed(SyncError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_upstream_error_surfaces_reason() {
        let mut m = machine();
        m.apply(identity("magnus"));
        let update = m.apply(StreamMessage::Error {
            reason: "No rapid games found".to_string(),
        });
        assert!(update.is_terminal());
        assert_eq!(
            m.result(),
            &IngestionResult::Failed("No rapid games found".to_string())
        );
    }

    #[test]
    fn test_no_transitions_after_cancel() {
        let mut m = machine();
        m.apply(identity("magnus"));
        assert_eq!(m.cancel(), SessionUpdate::Cancelled);
        assert_eq!(m.cancel(), SessionUpdate::Ignored);
        assert_eq!(
            m.apply(StreamMessage::Start {
                total_units: 3,
                from_cache: false
            }),
            SessionUpdate::Ignored
        );
        assert_eq!(m.phase(), SessionPhase::Cancelled);
        assert!(m.progress().is_none());
    }

    #[test]
    fn test_transport_failure_fails_session() {
        let mut m = machine();
        let update = m.fail(SyncError::NetworkFailure("connection reset".to_string()));
        assert!(matches!(update, SessionUpdate::Failed(SyncError::NetworkFailure(_))));
        assert!(m.ended_at().is_some());
    }
}
