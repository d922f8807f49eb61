//! In-memory counters reported upstream as `metricsChange`.
//!
//! Counters only ever grow. Coalescing into a single message per quiet period
//! is done by the upstream client, which waits on [`Metrics::changed`].

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use strum::IntoEnumIterator;
use tokio::sync::Notify;

use crate::protocol::Counters;

/// Trailing-edge debounce applied before counters are pushed upstream.
pub const METRICS_DEBOUNCE: Duration = Duration::from_millis(1500);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, strum::EnumIter,
)]
#[strum(serialize_all = "camelCase")]
pub enum Metric {
    ConnectionCount,
    ConnectionErrors,
    ReconnectAttempts,
    BufferedMessages,
    InvalidServerMessages,
    InvalidClientMessages,
    #[strum(serialize = "setOK")]
    SetOk,
    SetIneffective,
    SetError,
    AutomationErrors,
    AutomationTimeouts,
    AutomationCrashes,
    InvalidAutomationMessages,
}

/// Shared handle to the process-wide counters.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    counters: Mutex<Counters>,
    changed: Notify,
}

impl Metrics {
    pub fn new() -> Self {
        let counters = Metric::iter()
            .map(|m| (m.to_string(), 0))
            .collect::<Counters>();
        Self {
            inner: Arc::new(Inner {
                counters: Mutex::new(counters),
                changed: Notify::new(),
            }),
        }
    }

    pub fn increment(&self, metric: Metric) {
        let name: &'static str = metric.into();
        {
            let mut counters = self
                .inner
                .counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *counters.entry(name.to_string()).or_default() += 1;
        }
        self.inner.changed.notify_one();
    }

    pub fn get(&self, metric: Metric) -> u64 {
        let name: &'static str = metric.into();
        self.inner
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Counters {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for the next increment.
    ///
    /// Increments made while nobody is waiting are remembered, so the next
    /// call returns immediately. Meant for a single consumer.
    pub async fn changed(&self) {
        self.inner.changed.notified().await
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert_eq!(Metric::SetOk.to_string(), "setOK");
        assert_eq!(Metric::InvalidServerMessages.to_string(), "invalidServerMessages");
        assert_eq!(Metric::ConnectionCount.to_string(), "connectionCount");
    }

    #[test]
    fn test_counters_start_at_zero_and_grow() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.len(), Metric::iter().count());
        assert!(snapshot.values().all(|v| *v == 0));

        let clone = metrics.clone();
        clone.increment(Metric::SetError);
        clone.increment(Metric::SetError);
        assert_eq!(metrics.get(Metric::SetError), 2);
        assert_eq!(metrics.snapshot()["setError"], 2);
    }

    #[tokio::test]
    async fn test_changed_remembers_increment() {
        let metrics = Metrics::new();
        metrics.increment(Metric::BufferedMessages);
        tokio::time::timeout(Duration::from_secs(1), metrics.changed())
            .await
            .unwrap();
    }
}
