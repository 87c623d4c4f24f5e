//! In-memory collaborators for integration tests
//!
//! Each mock counts its calls; the stats mock additionally tracks how many
//! transports are open at once (a guard inside each stream decrements the
//! count when the stream is dropped).

#![allow(dead_code)]

use async_trait::async_trait;
use rkd_common::{Identifier, Variant};
use rkd_sync::providers::{
    HeartbeatReport, IdentityLookup, IdentityMessage, IdentityProvider, MessageStream,
    PreferenceProvider, ServerPreferences, StatsStreamProvider, StreamMessage, TelemetrySink,
};
use rkd_sync::{Collaborators, SyncError, SyncResult};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Identity
// ============================================================================

#[derive(Default)]
pub struct MockIdentity {
    known: Mutex<HashMap<String, IdentityLookup>>,
    delay: Mutex<Duration>,
    fail: Mutex<bool>,
    pub calls: AtomicUsize,
    pub queried: Mutex<Vec<String>>,
}

impl MockIdentity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_account(self: Arc<Self>, name: &str, display_name: &str) -> Arc<Self> {
        self.known.lock().unwrap().insert(
            name.to_lowercase(),
            IdentityLookup {
                exists: true,
                display_name: Some(display_name.to_string()),
                avatar_url: Some(format!("https://img.example.com/{}.png", name.to_lowercase())),
            },
        );
        self
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockIdentity {
    async fn lookup_identity(&self, candidate: &Identifier) -> SyncResult<IdentityLookup> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queried
            .lock()
            .unwrap()
            .push(candidate.normalized().to_string());
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        if *self.fail.lock().unwrap() {
            return Err(SyncError::NetworkFailure("connection refused".to_string()));
        }
        Ok(self
            .known
            .lock()
            .unwrap()
            .get(candidate.normalized())
            .cloned()
            .unwrap_or_else(IdentityLookup::not_found))
    }
}

// ============================================================================
// Stats stream
// ============================================================================

/// Scripted stream behaviour for one variant
#[derive(Clone)]
pub struct Script {
    pub messages: Vec<StreamMessage>,
    /// Pause before each message
    pub gap: Duration,
    /// Keep the transport open after the last message instead of ending it
    pub hold_open: bool,
}

impl Script {
    pub fn new(messages: Vec<StreamMessage>) -> Self {
        Self {
            messages,
            gap: Duration::from_millis(10),
            hold_open: false,
        }
    }

    pub fn gap(mut self, gap: Duration) -> Self {
        self.gap = gap;
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

/// identity → start(total) → `total` progress messages → complete
pub fn full_script(name: &str, total: u32) -> Script {
    let mut messages = vec![
        identity_message(name),
        StreamMessage::Start {
            total_units: total,
            from_cache: false,
        },
    ];
    for unit in 1..=total {
        messages.push(StreamMessage::Progress {
            current_unit: unit,
            label: format!("2024-{:02}", unit),
        });
    }
    messages.push(StreamMessage::Complete {
        payload: json!({ "games": 120, "variant_units": total }),
    });
    Script::new(messages)
}

pub fn identity_message(name: &str) -> StreamMessage {
    StreamMessage::Identity(IdentityMessage {
        identifier: name.to_string(),
        display_name: Some(format!("{} (GM)", name)),
        avatar_url: None,
    })
}

#[derive(Default)]
pub struct TransportCounter {
    pub open: AtomicUsize,
    pub max_open: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

struct TransportGuard(Arc<TransportCounter>);

impl TransportGuard {
    fn open(counter: &Arc<TransportCounter>) -> Self {
        counter.opened.fetch_add(1, Ordering::SeqCst);
        let now = counter.open.fetch_add(1, Ordering::SeqCst) + 1;
        counter.max_open.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockStats {
    scripts: Mutex<HashMap<Variant, Script>>,
    /// Overrides keyed by (normalized identifier, variant)
    identity_scripts: Mutex<HashMap<(String, Variant), Script>>,
    pub transports: Arc<TransportCounter>,
    /// (identifier, variant) per opened transport
    pub requests: Mutex<Vec<(String, Variant)>>,
    /// Messages actually yielded, tagged with their variant
    pub delivered: Arc<Mutex<Vec<(Variant, &'static str)>>>,
    open_error: Mutex<Option<SyncError>>,
}

impl MockStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(self: Arc<Self>, variant: Variant, script: Script) -> Arc<Self> {
        self.scripts.lock().unwrap().insert(variant, script);
        self
    }

    pub fn with_script_for(self: Arc<Self>, name: &str, variant: Variant, script: Script) -> Arc<Self> {
        self.identity_scripts
            .lock()
            .unwrap()
            .insert((name.to_lowercase(), variant), script);
        self
    }

    pub fn fail_open(&self, error: SyncError) {
        *self.open_error.lock().unwrap() = Some(error);
    }

    pub fn open_now(&self) -> usize {
        self.transports.open.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.transports.max_open.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.transports.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatsStreamProvider for MockStats {
    async fn open_stats_stream(
        &self,
        identifier: &Identifier,
        variant: Variant,
    ) -> SyncResult<MessageStream> {
        if let Some(error) = self.open_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.requests
            .lock()
            .unwrap()
            .push((identifier.normalized().to_string(), variant));

        let key = (identifier.normalized().to_string(), variant);
        let script = self
            .identity_scripts
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .or_else(|| self.scripts.lock().unwrap().get(&variant).cloned())
            .unwrap_or_else(|| Script::new(Vec::new()).hold_open());
        let guard = TransportGuard::open(&self.transports);
        let delivered = Arc::clone(&self.delivered);

        let stream = async_stream::stream! {
            let _guard = guard;
            for message in script.messages {
                tokio::time::sleep(script.gap).await;
                delivered.lock().unwrap().push((variant, message.kind()));
                yield Ok(message);
            }
            if script.hold_open {
                std::future::pending::<()>().await;
            }
        };
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Preferences
// ============================================================================

#[derive(Default)]
pub struct MockPreferences {
    response: Mutex<Option<ServerPreferences>>,
    delay: Mutex<Duration>,
    pub calls: AtomicUsize,
}

impl MockPreferences {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn responding(self: Arc<Self>, response: ServerPreferences) -> Arc<Self> {
        *self.response.lock().unwrap() = Some(response);
        self
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn set_response(&self, response: Option<ServerPreferences>) {
        *self.response.lock().unwrap() = response;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PreferenceProvider for MockPreferences {
    async fn fetch_preferences(&self, _identifier: &Identifier) -> SyncResult<ServerPreferences> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Answer is fixed when the request is issued
        let response = self.response.lock().unwrap().clone();
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        response.ok_or_else(|| SyncError::UpstreamError("preferences unavailable".to_string()))
    }
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Default)]
pub struct MockTelemetry {
    pub reports: Mutex<Vec<HeartbeatReport>>,
    fail: Mutex<bool>,
    pub attempts: AtomicUsize,
}

impl MockTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySink for MockTelemetry {
    async fn post_heartbeat(&self, report: &HeartbeatReport) -> SyncResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            return Err(SyncError::NetworkFailure("telemetry offline".to_string()));
        }
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub struct Mocks {
    pub identity: Arc<MockIdentity>,
    pub stats: Arc<MockStats>,
    pub preferences: Arc<MockPreferences>,
    pub telemetry: Arc<MockTelemetry>,
}

impl Mocks {
    pub fn new(
        identity: Arc<MockIdentity>,
        stats: Arc<MockStats>,
        preferences: Arc<MockPreferences>,
    ) -> Self {
        Self {
            identity,
            stats,
            preferences,
            telemetry: MockTelemetry::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            identity: self.identity.clone(),
            stats: self.stats.clone(),
            preferences: self.preferences.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}

pub fn id(raw: &str) -> Identifier {
    Identifier::parse(raw).unwrap()
}

/// Let spawned tasks run without advancing a paused clock past pending timers
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
