//! Cancellable-future and debounce combinators

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

/// Await `fut` unless `token` is cancelled first
///
/// Cancellation wins ties, so an already-cancelled token never polls `fut`.
/// Dropping `fut` on cancellation drops whatever it owns (e.g. an in-flight
/// HTTP request).
pub async fn cancellable<F: Future>(token: &CancellationToken, fut: F) -> SyncResult<F::Output> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SyncError::Cancelled),
        output = fut => Ok(output),
    }
}

/// Quiet-interval timer
///
/// Restarting is expressed by cancelling the token of the pending wait (the
/// owning slot does this on supersede) and starting a new one.
#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    quiet: Duration,
}

impl Debouncer {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet }
    }

    pub fn quiet(&self) -> Duration {
        self.quiet
    }

    /// Wait for the quiet interval to elapse uninterrupted
    pub async fn settle(&self, token: &CancellationToken) -> SyncResult<()> {
        cancellable(token, tokio::time::sleep(self.quiet)).await
    }

    /// Wait for the quiet interval, then await `fut`; both phases cancellable
    pub async fn debounced<F: Future>(
        &self,
        token: &CancellationToken,
        fut: F,
    ) -> SyncResult<F::Output> {
        self.settle(token).await?;
        cancellable(token, fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_debounced_runs_after_quiet_interval() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let token = CancellationToken::new();
        let start = tokio::time::Instant::now();

        let value = debouncer.debounced(&token, async { 7 }).await.unwrap();

        assert_eq!(value, 7);
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_skips_future() {
        let debouncer = Debouncer::new(Duration::from_millis(400));
        let token = CancellationToken::new();
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = Arc::clone(&ran);
        let token_clone = token.clone();
        let task = tokio::spawn(async move {
            debouncer
                .debounced(&token_clone, async move {
                    ran_clone.store(true, Ordering::SeqCst);
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = cancellable(&token, async { 1 }).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
