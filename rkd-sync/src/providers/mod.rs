//! External collaborators consumed by the engine
//!
//! The engine never computes statistics itself; it decides when and how often
//! these collaborators are called. Each concern is a trait so tests can
//! substitute in-memory fakes; [`http::HttpCollaborators`] implements all four
//! against the stats server.

pub mod http;
pub mod messages;

use async_trait::async_trait;
use futures::stream::Stream;
use rkd_common::{Identifier, Variant};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use crate::error::SyncResult;

pub use messages::{IdentityMessage, SseDecoder, StreamMessage};

/// Incremental message channel for one stats stream
///
/// Dropping the stream tears down the underlying transport.
pub type MessageStream = Pin<Box<dyn Stream<Item = SyncResult<StreamMessage>> + Send>>;

/// Answer to a remote existence query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityLookup {
    pub exists: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl IdentityLookup {
    pub fn not_found() -> Self {
        Self::default()
    }
}

/// Authoritative server copy of the preference record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPreferences {
    #[serde(default)]
    pub onboarding_complete: bool,
    #[serde(default)]
    pub variant_preference: Option<Variant>,
    #[serde(default)]
    pub goal: Option<String>,
}

/// Coarse device category reported with heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    #[default]
    Desktop,
    Tablet,
    Mobile,
}

impl FromStr for DeviceClass {
    type Err = rkd_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceClass::Desktop),
            "tablet" => Ok(DeviceClass::Tablet),
            "mobile" => Ok(DeviceClass::Mobile),
            other => Err(rkd_common::Error::InvalidInput(format!(
                "unknown device class: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Mobile => "mobile",
        };
        f.write_str(name)
    }
}

/// Liveness report body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    pub identifier: Identifier,
    pub page: String,
    pub variant_or_locale: String,
    pub device_class: DeviceClass,
}

/// Remote identity source
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn lookup_identity(&self, candidate: &Identifier) -> SyncResult<IdentityLookup>;
}

/// Source of incremental statistics streams
#[async_trait]
pub trait StatsStreamProvider: Send + Sync {
    async fn open_stats_stream(
        &self,
        identifier: &Identifier,
        variant: Variant,
    ) -> SyncResult<MessageStream>;
}

/// Server-side preference store
#[async_trait]
pub trait PreferenceProvider: Send + Sync {
    async fn fetch_preferences(&self, identifier: &Identifier) -> SyncResult<ServerPreferences>;
}

/// Telemetry endpoint for heartbeats
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn post_heartbeat(&self, report: &HeartbeatReport) -> SyncResult<()>;
}
