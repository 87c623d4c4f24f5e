//! rkd-sync library interface
//!
//! Progressive remote-data sync engine: debounced identity lookup, streaming
//! statistics ingestion with live progress, preference cache reconciliation
//! and activity heartbeats, composed behind [`SessionOrchestrator`].

pub mod config;
pub mod coordination;
pub mod error;
pub mod heartbeat;
pub mod lookup;
pub mod models;
pub mod orchestrator;
pub mod preferences;
pub mod providers;
pub mod session;

pub use crate::config::EngineSettings;
pub use crate::error::{SyncError, SyncResult};
pub use crate::lookup::{CheckResult, DebouncedLookup};
pub use crate::orchestrator::{Collaborators, EngineView, SessionOrchestrator};
pub use crate::session::{SessionHandle, SessionOutcome, SessionSnapshot, StreamingSession};
