//! Explicitly cancellable one-shot timer for use inside `tokio::select!` loops.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::Sleep;

/// A one-shot timer that is either idle or pending.
///
/// `fired()` never resolves while idle, so an idle timer can sit in a
/// `select!` branch without a guard.
#[derive(Debug, Default)]
pub struct Timer(Option<Pin<Box<Sleep>>>);

impl Timer {
    /// (Re)arm the timer, replacing any pending deadline.
    pub fn schedule(&mut self, after: Duration) {
        self.0 = Some(Box::pin(tokio::time::sleep(after)));
    }

    /// Disarm the timer. Returns whether it was pending.
    pub fn cancel(&mut self) -> bool {
        self.0.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }

    /// Resolves once when the deadline passes, leaving the timer idle.
    ///
    /// Cancel safe: dropping the future keeps the deadline armed.
    pub async fn fired(&mut self) {
        match self.0.as_mut() {
            Some(sleep) => {
                sleep.await;
                self.0 = None;
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_then_idles() {
        let mut timer = Timer::default();
        let start = Instant::now();
        timer.schedule(Duration::from_secs(5));
        assert!(timer.is_pending());

        timer.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(!timer.is_pending());

        let idle = tokio::time::timeout(Duration::from_secs(60), timer.fired()).await;
        assert!(idle.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_deadline() {
        let mut timer = Timer::default();
        let start = Instant::now();
        timer.schedule(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(3)).await;
        timer.schedule(Duration::from_secs(5));

        timer.fired().await;
        assert_eq!(start.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let mut timer = Timer::default();
        assert!(!timer.cancel());
        timer.schedule(Duration::from_secs(1));
        assert!(timer.cancel());
        assert!(!timer.is_pending());

        let idle = tokio::time::timeout(Duration::from_secs(10), timer.fired()).await;
        assert!(idle.is_err());
    }
}
