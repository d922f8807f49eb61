//! Device bridge: discovery, snapshots and characteristic I/O for local
//! accessories.
//!
//! The upstream client and the automation sandbox only ever see the
//! [`DeviceBridge`] trait. [`HapBridge`] is the implementation used by the
//! daemon.

mod hap;
mod pin;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::Characteristic;
use crate::protocol::CharacteristicValue;
use crate::protocol::Service;

pub use hap::HapBridge;
pub use pin::find_config_pin;

/// A HAP accessory server reachable on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Accessory server id (`XX:XX:XX:XX:XX:XX`)
    pub username: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Request to {instance} failed: {source}")]
    Http {
        instance: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{instance} answered with HTTP {status}")]
    Status { instance: String, status: u16 },

    #[error("Unknown service {0}")]
    UnknownService(String),

    #[error("Characteristic {aid}.{iid} missing from response")]
    MissingCharacteristic { aid: u64, iid: u64 },

    #[error("Accessory rejected write with HAP status {0}")]
    Rejected(i64),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Subscription to characteristic changes.
///
/// Yields batches of services whose values changed. Dropping the monitor
/// stops it.
#[derive(Debug)]
pub struct Monitor {
    updates: mpsc::Receiver<Vec<Service>>,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn new(updates: mpsc::Receiver<Vec<Service>>, task: Option<JoinHandle<()>>) -> Self {
        Self { updates, task }
    }

    /// Next batch of changed services; None once the monitor stopped.
    pub async fn next(&mut self) -> Option<Vec<Service>> {
        self.updates.recv().await
    }

    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.updates.close();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Trait for local accessory operations
///
/// This trait allows the bridge to be mocked for testing purposes
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Stream of accessory servers as they are found
    fn discover_instances(&self) -> mpsc::Receiver<Instance>;

    /// Snapshot of every service on every known instance
    async fn get_all_services(&self) -> Result<Vec<Service>>;

    /// Write one characteristic and return it as read back afterwards
    async fn set_characteristic(
        &self,
        service: &Service,
        iid: u64,
        value: CharacteristicValue,
    ) -> Result<Characteristic>;

    /// Subscribe to characteristic changes on every known instance
    async fn monitor_characteristics(&self) -> Result<Monitor>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// How [`MockBridge`] answers writes.
    #[derive(Debug, Clone)]
    pub enum SetBehavior {
        /// Report the requested value back
        Echo,
        /// Report this value back regardless of the request
        Return(CharacteristicValue),
        Fail,
    }

    /// Mock bridge for testing
    #[derive(Debug)]
    pub struct MockBridge {
        pub instances: Vec<Instance>,
        services: Mutex<Vec<Service>>,
        behavior: Mutex<SetBehavior>,
        calls: Mutex<Vec<(String, u64, CharacteristicValue)>>,
        monitor: Mutex<Option<mpsc::Sender<Vec<Service>>>>,
        fetches: Mutex<usize>,
        monitors: Mutex<usize>,
        fetch_delay: Mutex<Duration>,
        fetch_failures: Mutex<usize>,
        monitor_failures: Mutex<usize>,
    }

    impl MockBridge {
        pub fn new(services: Vec<Service>) -> Self {
            Self {
                instances: Vec::new(),
                services: Mutex::new(services),
                behavior: Mutex::new(SetBehavior::Echo),
                calls: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
                fetches: Mutex::new(0),
                monitors: Mutex::new(0),
                fetch_delay: Mutex::new(Duration::ZERO),
                fetch_failures: Mutex::new(0),
                monitor_failures: Mutex::new(0),
            }
        }

        pub fn with_instances(mut self, instances: Vec<Instance>) -> Self {
            self.instances = instances;
            self
        }

        pub fn set_behavior(&self, behavior: SetBehavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        pub fn set_services(&self, services: Vec<Service>) {
            *self.services.lock().unwrap() = services;
        }

        /// Writes received so far as `(uniqueId, iid, value)`
        pub fn calls(&self) -> Vec<(String, u64, CharacteristicValue)> {
            self.calls.lock().unwrap().clone()
        }

        pub fn fetches(&self) -> usize {
            *self.fetches.lock().unwrap()
        }

        pub fn monitors(&self) -> usize {
            *self.monitors.lock().unwrap()
        }

        /// Snapshots take this long to answer.
        pub fn set_fetch_delay(&self, delay: Duration) {
            *self.fetch_delay.lock().unwrap() = delay;
        }

        /// The next `count` snapshots fail.
        pub fn fail_fetches(&self, count: usize) {
            *self.fetch_failures.lock().unwrap() = count;
        }

        /// The next `count` monitor subscriptions fail.
        pub fn fail_monitors(&self, count: usize) {
            *self.monitor_failures.lock().unwrap() = count;
        }

        fn take_failure(counter: &Mutex<usize>) -> bool {
            let mut remaining = counter.lock().unwrap();
            if *remaining == 0 {
                return false;
            }
            *remaining -= 1;
            true
        }

        /// Push a batch to the active monitor. Returns false without one.
        pub async fn push_update(&self, services: Vec<Service>) -> bool {
            let tx = self.monitor.lock().unwrap().clone();
            match tx {
                Some(tx) => tx.send(services).await.is_ok(),
                None => false,
            }
        }
    }

    #[async_trait]
    impl DeviceBridge for MockBridge {
        fn discover_instances(&self) -> mpsc::Receiver<Instance> {
            let (tx, rx) = mpsc::channel(self.instances.len().max(1));
            for instance in &self.instances {
                let _ = tx.try_send(instance.clone());
            }
            rx
        }

        async fn get_all_services(&self) -> Result<Vec<Service>> {
            *self.fetches.lock().unwrap() += 1;
            let delay = *self.fetch_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if Self::take_failure(&self.fetch_failures) {
                return Err(BridgeError::Status {
                    instance: "mock".to_string(),
                    status: 503,
                });
            }
            Ok(self.services.lock().unwrap().clone())
        }

        async fn set_characteristic(
            &self,
            service: &Service,
            iid: u64,
            value: CharacteristicValue,
        ) -> Result<Characteristic> {
            self.calls
                .lock()
                .unwrap()
                .push((service.unique_id.clone(), iid, value.clone()));

            let behavior = self.behavior.lock().unwrap().clone();
            let mut characteristic = service
                .characteristic(iid)
                .cloned()
                .ok_or(BridgeError::MissingCharacteristic { aid: service.aid, iid })?;
            characteristic.value = match behavior {
                SetBehavior::Echo => Some(value),
                SetBehavior::Return(actual) => Some(actual),
                SetBehavior::Fail => return Err(BridgeError::Rejected(-70402)),
            };
            Ok(characteristic)
        }

        async fn monitor_characteristics(&self) -> Result<Monitor> {
            *self.monitors.lock().unwrap() += 1;
            if Self::take_failure(&self.monitor_failures) {
                return Err(BridgeError::Status {
                    instance: "mock".to_string(),
                    status: 503,
                });
            }
            let (tx, rx) = mpsc::channel(16);
            *self.monitor.lock().unwrap() = Some(tx);
            Ok(Monitor::new(rx, None))
        }
    }
}
