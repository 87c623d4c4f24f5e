//! Identity types for linked remote accounts
//!
//! An identifier names a remote entity (the linked chess account). Comparison
//! is case-insensitive; the original casing is kept for display and replaced
//! by the remote source's casing once the entity is confirmed.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{Error, Result};

/// Normalize a raw candidate for comparison (trimmed, lowercase)
pub fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Case-insensitive identifier with a preserved display form
#[derive(Debug, Clone)]
pub struct Identifier {
    display: String,
    normalized: String,
}

impl Identifier {
    /// Parse a user-typed candidate
    ///
    /// Returns `None` when the trimmed candidate is empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let display = raw.trim();
        if display.is_empty() {
            return None;
        }
        Some(Self {
            display: display.to_string(),
            normalized: normalize(display),
        })
    }

    /// Lowercase comparison key
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Display form (original casing, or the remote casing once confirmed)
    pub fn display(&self) -> &str {
        &self.display
    }

    /// Number of characters in the normalized form
    pub fn len(&self) -> usize {
        self.normalized.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    /// Adopt the casing reported by the remote source
    ///
    /// Ignored if `confirmed` does not normalize to the same key.
    pub fn with_confirmed_display(&self, confirmed: &str) -> Self {
        let confirmed = confirmed.trim();
        if normalize(confirmed) == self.normalized {
            Self {
                display: confirmed.to_string(),
                normalized: self.normalized.clone(),
            }
        } else {
            self.clone()
        }
    }

    /// Case-insensitive comparison against a raw string
    pub fn matches(&self, raw: &str) -> bool {
        normalize(raw) == self.normalized
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl FromStr for Identifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Identifier::parse(s).ok_or_else(|| Error::InvalidInput("identifier is empty".to_string()))
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Identifier::parse(&raw).ok_or_else(|| serde::de::Error::custom("identifier is empty"))
    }
}

/// Statistics mode selector (game-speed category)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Rapid,
    Blitz,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Rapid => "rapid",
            Variant::Blitz => "blitz",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rapid" => Ok(Variant::Rapid),
            "blitz" => Ok(Variant::Blitz),
            other => Err(Error::InvalidInput(format!("unknown variant: {}", other))),
        }
    }
}

/// Summary of a remote entity
///
/// Immutable once created: a new lookup produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntitySummary {
    pub identifier: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub confirmed: bool,
}

impl RemoteEntitySummary {
    /// Summary confirmed by the remote source
    ///
    /// When the remote display name normalizes to the identifier, its casing
    /// becomes the identifier's display form.
    pub fn confirmed(
        identifier: &Identifier,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) -> Self {
        let identifier = match display_name.as_deref() {
            Some(name) => identifier.with_confirmed_display(name),
            None => identifier.clone(),
        };
        Self {
            identifier,
            display_name,
            avatar_url,
            confirmed: true,
        }
    }

    /// Summary for an identifier the remote source has not vouched for
    pub fn unconfirmed(identifier: &Identifier) -> Self {
        Self {
            identifier: identifier.clone(),
            display_name: None,
            avatar_url: None,
            confirmed: false,
        }
    }

    /// Name to show in the UI
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .unwrap_or_else(|| self.identifier.display())
    }
}
