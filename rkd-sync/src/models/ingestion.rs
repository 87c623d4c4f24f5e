//! Ingestion result and progress types

use chrono::{DateTime, Utc};
use rkd_common::{RemoteEntitySummary, Variant};
use serde::{Deserialize, Serialize};

/// Live progress of the current session
///
/// Only ever associated with the active session; reset to `None` (the
/// absence of a value) whenever a session starts, completes, fails or is
/// cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub current_unit: u32,
    pub total_units: u32,
    /// Human-readable label, e.g. the time period being processed
    pub current_label: String,
    pub from_cache: bool,
}

impl ProgressState {
    pub fn started(total_units: u32, from_cache: bool) -> Self {
        Self {
            current_unit: 0,
            total_units,
            current_label: String::new(),
            from_cache,
        }
    }

    /// Percentage complete (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        if self.total_units == 0 {
            0.0
        } else {
            (self.current_unit as f64 / self.total_units as f64) * 100.0
        }
    }
}

/// Fully assembled statistics for one (identifier, variant) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedStats {
    pub entity: RemoteEntitySummary,
    pub variant: Variant,
    /// Opaque statistics payload from the stats provider
    pub payload: serde_json::Value,
    pub from_cache: bool,
    pub completed_at: DateTime<Utc>,
}

/// Result slot exposed to the presentation layer
///
/// `Empty` → `Partial` (identity confirmed) → `Complete` | `Failed`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "camelCase")]
pub enum IngestionResult {
    #[default]
    Empty,
    Partial(RemoteEntitySummary),
    Complete(Box<CompletedStats>),
    Failed(String),
}

impl IngestionResult {
    /// Entity known so far, if any
    pub fn entity(&self) -> Option<&RemoteEntitySummary> {
        match self {
            IngestionResult::Partial(entity) => Some(entity),
            IngestionResult::Complete(stats) => Some(&stats.entity),
            IngestionResult::Empty | IngestionResult::Failed(_) => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, IngestionResult::Complete(_))
    }

    pub fn completed(&self) -> Option<&CompletedStats> {
        match self {
            IngestionResult::Complete(stats) => Some(stats),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_handles_zero_total() {
        assert_eq!(ProgressState::started(0, false).percentage(), 0.0);
        let progress = ProgressState {
            current_unit: 3,
            total_units: 12,
            current_label: "2024-03".to_string(),
            from_cache: false,
        };
        assert_eq!(progress.percentage(), 25.0);
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let json = serde_json::to_value(IngestionResult::Failed("boom".to_string())).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["data"], "boom");
    }
}
