//! HTTP implementations of the collaborator traits
//!
//! Endpoints (relative to the configured base URL):
//! - `GET  /api/players/{id}/exists`            existence check (404 = not found)
//! - `GET  /api/stats/stream?username=&variant=` SSE stats stream
//! - `GET  /api/preferences/{id}`               server preference record
//! - `POST /api/heartbeat`                      liveness report

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{StatusCode, Url};
use rkd_common::{Identifier, Variant};
use std::time::Duration;

use super::{
    HeartbeatReport, IdentityLookup, IdentityProvider, MessageStream, PreferenceProvider,
    ServerPreferences, SseDecoder, StatsStreamProvider, TelemetrySink,
};
use crate::error::{SyncError, SyncResult};

const USER_AGENT: &str = concat!("rookdash-sync/", env!("CARGO_PKG_VERSION"));

/// Keep error bodies short in logs and user-visible reasons
const MAX_ERROR_BODY_CHARS: usize = 200;

/// reqwest-backed client for all four collaborators
#[derive(Debug, Clone)]
pub struct HttpCollaborators {
    base_url: Url,
    /// Request/response calls (bounded by the configured timeout)
    client: reqwest::Client,
    /// Long-lived stats streams (connect timeout only)
    stream_client: reqwest::Client,
}

impl HttpCollaborators {
    pub fn new(base_url: &str, request_timeout: Duration) -> SyncResult<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| SyncError::NetworkFailure(format!("invalid base URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::NetworkFailure(format!(
                "base URL cannot carry paths: {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()?;
        let stream_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            client,
            stream_client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                SyncError::NetworkFailure(format!("base URL cannot carry paths: {}", self.base_url))
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }
}

fn sanitize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() > MAX_ERROR_BODY_CHARS {
        let cut: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{}...", cut)
    } else {
        trimmed.to_string()
    }
}

async fn upstream_error(response: reqwest::Response) -> SyncError {
    let status = response.status();
    let body = sanitize_error_body(&response.text().await.unwrap_or_default());
    if body.is_empty() {
        SyncError::UpstreamError(format!("server responded with status {}", status))
    } else {
        SyncError::UpstreamError(format!("server responded with status {}: {}", status, body))
    }
}

#[async_trait]
impl IdentityProvider for HttpCollaborators {
    async fn lookup_identity(&self, candidate: &Identifier) -> SyncResult<IdentityLookup> {
        let url = self.endpoint(&["api", "players", candidate.normalized(), "exists"])?;
        tracing::debug!(candidate = %candidate, "Querying identity existence");

        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(IdentityLookup::not_found());
        }
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(response.json::<IdentityLookup>().await?)
    }
}

#[async_trait]
impl StatsStreamProvider for HttpCollaborators {
    async fn open_stats_stream(
        &self,
        identifier: &Identifier,
        variant: Variant,
    ) -> SyncResult<MessageStream> {
        let mut url = self.endpoint(&["api", "stats", "stream"])?;
        url.query_pairs_mut()
            .append_pair("username", identifier.normalized())
            .append_pair("variant", variant.as_str());

        tracing::debug!(identifier = %identifier, variant = %variant, "Opening stats stream");
        let response = self
            .stream_client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        // The response body lives inside the generator: dropping the stream
        // drops the body and closes the connection.
        let mut bytes_stream = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes_stream.next().await {
                match chunk {
                    Ok(chunk) => {
                        for message in decoder.push(&chunk) {
                            yield message;
                        }
                    }
                    Err(e) => {
                        yield Err(SyncError::NetworkFailure(format!("stream read failed: {}", e)));
                        return;
                    }
                }
            }
            if let Some(message) = decoder.finish() {
                yield message;
            }
        };
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl PreferenceProvider for HttpCollaborators {
    async fn fetch_preferences(&self, identifier: &Identifier) -> SyncResult<ServerPreferences> {
        let url = self.endpoint(&["api", "preferences", identifier.normalized()])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ServerPreferences::default());
        }
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(response.json::<ServerPreferences>().await?)
    }
}

#[async_trait]
impl TelemetrySink for HttpCollaborators {
    async fn post_heartbeat(&self, report: &HeartbeatReport) -> SyncResult<()> {
        let url = self.endpoint(&["api", "heartbeat"])?;
        let response = self.client.post(url).json(report).send().await?;
        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(())
    }
}
