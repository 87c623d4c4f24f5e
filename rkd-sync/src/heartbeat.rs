//! Activity heartbeat
//!
//! Posts a liveness report immediately and then once per interval, but only
//! while the page is visible and some tracked input happened since the last
//! report. Ticks are evaluated independently: a hidden page skips ticks
//! without queueing a catch-up report. Post failures are swallowed.

use rkd_common::events::{EventBus, SyncEvent};
use rkd_common::Identifier;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordination::cancellable;
use crate::providers::{DeviceClass, HeartbeatReport, TelemetrySink};

/// Tracked user-input kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    PointerMove,
    Click,
    KeyPress,
    Scroll,
    Touch,
}

#[derive(Debug)]
struct MonitorInner {
    listeners: Mutex<Vec<Weak<AtomicBool>>>,
    visible: AtomicBool,
}

/// Page visibility plus input-listener registry fed by the presentation layer
#[derive(Debug, Clone)]
pub struct ActivityMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                listeners: Mutex::new(Vec::new()),
                visible: AtomicBool::new(true),
            }),
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, Vec<Weak<AtomicBool>>> {
        self.inner.listeners.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn register(&self) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.listeners().push(Arc::downgrade(&flag));
        flag
    }

    fn unregister(&self, flag: &Arc<AtomicBool>) {
        self.listeners().retain(|weak| match weak.upgrade() {
            Some(live) => !Arc::ptr_eq(&live, flag),
            None => false,
        });
    }

    /// Record one input event for every registered heartbeat
    pub fn record_input(&self, kind: InputKind) {
        let mut listeners = self.listeners();
        listeners.retain(|weak| match weak.upgrade() {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        });
        tracing::trace!(?kind, listeners = listeners.len(), "Input recorded");
    }

    pub fn set_visible(&self, visible: bool) {
        self.inner.visible.store(visible, Ordering::SeqCst);
    }

    pub fn is_visible(&self) -> bool {
        self.inner.visible.load(Ordering::SeqCst)
    }

    /// Number of live input listeners
    pub fn listener_count(&self) -> usize {
        self.listeners()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Static fields of every report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatContext {
    pub page: String,
    pub variant_or_locale: String,
    pub device_class: DeviceClass,
}

/// Heartbeat scheduler
#[derive(Clone)]
pub struct ActivityHeartbeat {
    sink: Arc<dyn TelemetrySink>,
    monitor: ActivityMonitor,
    events: EventBus,
    period: Duration,
}

impl ActivityHeartbeat {
    pub fn new(
        sink: Arc<dyn TelemetrySink>,
        monitor: ActivityMonitor,
        events: EventBus,
        period: Duration,
    ) -> Self {
        Self {
            sink,
            monitor,
            events,
            period,
        }
    }

    pub fn monitor(&self) -> &ActivityMonitor {
        &self.monitor
    }

    /// Start reporting for `identifier`; dropping or cancelling the guard stops it
    pub fn start(&self, identifier: Identifier, context: HeartbeatContext) -> HeartbeatGuard {
        let token = CancellationToken::new();
        let flag = self.monitor.register();
        let report = HeartbeatReport {
            identifier,
            page: context.page,
            variant_or_locale: context.variant_or_locale,
            device_class: context.device_class,
        };

        info!(identifier = %report.identifier, period_secs = self.period.as_secs(), "Heartbeat started");

        let task = HeartbeatTask {
            sink: Arc::clone(&self.sink),
            monitor: self.monitor.clone(),
            events: self.events.clone(),
            period: self.period,
            token: token.clone(),
            flag: Arc::clone(&flag),
            report,
        };
        tokio::spawn(task.run());

        HeartbeatGuard {
            token,
            monitor: self.monitor.clone(),
            flag: Mutex::new(Some(flag)),
        }
    }
}

struct HeartbeatTask {
    sink: Arc<dyn TelemetrySink>,
    monitor: ActivityMonitor,
    events: EventBus,
    period: Duration,
    token: CancellationToken,
    flag: Arc<AtomicBool>,
    report: HeartbeatReport,
}

impl HeartbeatTask {
    async fn run(self) {
        if self.monitor.is_visible() {
            self.flag.store(false, Ordering::SeqCst);
            self.post().await;
        }

        let mut timer = interval_at(Instant::now() + self.period, self.period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = timer.tick() => {}
            }

            if !self.monitor.is_visible() {
                debug!(identifier = %self.report.identifier, "Heartbeat skipped: page hidden");
                continue;
            }
            if !self.flag.swap(false, Ordering::SeqCst) {
                debug!(identifier = %self.report.identifier, "Heartbeat skipped: no activity");
                continue;
            }
            self.post().await;
        }

        debug!(identifier = %self.report.identifier, "Heartbeat stopped");
    }

    async fn post(&self) {
        match cancellable(&self.token, self.sink.post_heartbeat(&self.report)).await {
            Ok(Ok(())) => {
                debug!(identifier = %self.report.identifier, "Heartbeat sent");
                self.events.emit_lossy(SyncEvent::HeartbeatSent {
                    identifier: self.report.identifier.clone(),
                    timestamp: chrono::Utc::now(),
                });
            }
            Ok(Err(e)) => debug!(identifier = %self.report.identifier, error = %e, "Heartbeat failed"),
            Err(_) => {}
        }
    }
}

/// Stops a running heartbeat; cancelling twice is a no-op
#[derive(Debug)]
pub struct HeartbeatGuard {
    token: CancellationToken,
    monitor: ActivityMonitor,
    flag: Mutex<Option<Arc<AtomicBool>>>,
}

impl HeartbeatGuard {
    pub fn cancel(&self) {
        self.token.cancel();
        let flag = self.flag.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(flag) = flag {
            self.monitor.unregister(&flag);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_sets_registered_flags() {
        let monitor = ActivityMonitor::new();
        let flag = monitor.register();
        monitor.record_input(InputKind::Click);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_unregister_removes_listener() {
        let monitor = ActivityMonitor::new();
        let first = monitor.register();
        let _second = monitor.register();
        assert_eq!(monitor.listener_count(), 2);
        monitor.unregister(&first);
        assert_eq!(monitor.listener_count(), 1);
    }

    #[test]
    fn test_dropped_listener_not_counted() {
        let monitor = ActivityMonitor::new();
        drop(monitor.register());
        assert_eq!(monitor.listener_count(), 0);
        monitor.record_input(InputKind::Scroll);
    }
}
