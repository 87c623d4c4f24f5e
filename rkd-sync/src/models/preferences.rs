//! Durable preference record and recent identities

use rkd_common::{identity::normalize, Identifier, RemoteEntitySummary, Variant};
use serde::{Deserialize, Serialize};

/// Durable user preferences and cached identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PreferenceRecord {
    /// The user's own account ("my account")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remembered_identifier: Option<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant_preference: Option<Variant>,
    pub onboarding_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
}

impl PreferenceRecord {
    /// Whether `identifier` is the remembered account
    pub fn is_remembered(&self, identifier: &Identifier) -> bool {
        self.remembered_identifier.as_ref() == Some(identifier)
    }
}

/// Individually tracked record fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PreferenceField {
    RememberedIdentifier,
    VariantPreference,
    OnboardingComplete,
    Goal,
}

/// Shallow partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreferencePatch {
    pub remembered_identifier: Option<Identifier>,
    pub variant_preference: Option<Variant>,
    pub onboarding_complete: Option<bool>,
    pub goal: Option<String>,
}

impl PreferencePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remembered_identifier(mut self, identifier: Identifier) -> Self {
        self.remembered_identifier = Some(identifier);
        self
    }

    pub fn variant_preference(mut self, variant: Variant) -> Self {
        self.variant_preference = Some(variant);
        self
    }

    pub fn onboarding_complete(mut self, complete: bool) -> Self {
        self.onboarding_complete = Some(complete);
        self
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &PreferencePatch::default()
    }

    /// Merge into `record`, returning the fields that were set
    pub fn apply_to(self, record: &mut PreferenceRecord) -> Vec<PreferenceField> {
        let mut touched = Vec::new();
        if let Some(identifier) = self.remembered_identifier {
            record.remembered_identifier = Some(identifier);
            touched.push(PreferenceField::RememberedIdentifier);
        }
        if let Some(variant) = self.variant_preference {
            record.variant_preference = Some(variant);
            touched.push(PreferenceField::VariantPreference);
        }
        if let Some(complete) = self.onboarding_complete {
            record.onboarding_complete = complete;
            touched.push(PreferenceField::OnboardingComplete);
        }
        if let Some(goal) = self.goal {
            record.goal = Some(goal);
            touched.push(PreferenceField::Goal);
        }
        touched
    }
}

/// Bounded, most-recent-first list of confirmed identities
///
/// Entries are unique by normalized identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecentIdentities {
    entries: Vec<RemoteEntitySummary>,
}

impl RecentIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `summary` at the front, removing any existing entry for the same
    /// identifier and truncating to `limit`
    pub fn promote(&mut self, summary: RemoteEntitySummary, limit: usize) {
        self.entries
            .retain(|entry| entry.identifier != summary.identifier);
        self.entries.insert(0, summary);
        self.entries.truncate(limit.max(1));
    }

    /// Find by raw candidate (case-insensitive)
    pub fn find(&self, candidate: &str) -> Option<&RemoteEntitySummary> {
        let key = normalize(candidate);
        self.entries
            .iter()
            .find(|entry| entry.identifier.normalized() == key)
    }

    /// Enforce uniqueness and bound after loading from storage
    pub fn normalized(self, limit: usize) -> Self {
        let mut out = RecentIdentities::new();
        for entry in self.entries.into_iter().rev() {
            out.promote(entry, limit);
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteEntitySummary> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
