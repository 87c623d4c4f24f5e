//! Engine data model

mod ingestion;
mod preferences;

pub use ingestion::{CompletedStats, IngestionResult, ProgressState};
pub use preferences::{PreferenceField, PreferencePatch, PreferenceRecord, RecentIdentities};
