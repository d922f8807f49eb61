//! Applying `SetCharacteristic` commands to local accessories.
//!
//! Commands come from the upstream service or from the automation sandbox
//! and are handled identically: resolve against the cached snapshot, write
//! through the device bridge, compare the value read back.

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::bridge::BridgeError;
use crate::bridge::DeviceBridge;
use crate::metrics::Metric;
use crate::metrics::Metrics;
use crate::protocol::CharacteristicValue;
use crate::protocol::Service;
use crate::protocol::SetCharacteristic;

/// Accepts characteristic writes for fulfillment.
pub trait CommandSink: Send + Sync {
    fn submit(&self, command: SetCharacteristic);
}

#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error("Unknown service {0}")]
    ServiceNotFound(String),

    #[error("Service {service_id} has no characteristic {iid}")]
    CharacteristicNotFound { service_id: String, iid: u64 },

    #[error("Characteristic {iid} of service {service_id} is not writable")]
    NotWritable { service_id: String, iid: u64 },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

#[derive(Debug)]
pub enum Outcome {
    /// The accessory reports the requested value
    Applied,
    /// The write went through but the accessory reports something else
    Ineffective {
        requested: CharacteristicValue,
        actual: Option<CharacteristicValue>,
    },
    Failed(FulfillmentError),
}

/// Find the target service and check the characteristic can be written.
pub fn resolve<'a>(
    services: &'a [Service],
    command: &SetCharacteristic,
) -> Result<&'a Service, FulfillmentError> {
    let service = services
        .iter()
        .find(|s| s.unique_id == command.service_id)
        .ok_or_else(|| FulfillmentError::ServiceNotFound(command.service_id.clone()))?;

    let characteristic = service.characteristic(command.iid).ok_or_else(|| {
        FulfillmentError::CharacteristicNotFound {
            service_id: command.service_id.clone(),
            iid: command.iid,
        }
    })?;

    if !characteristic.can_write {
        return Err(FulfillmentError::NotWritable {
            service_id: command.service_id.clone(),
            iid: command.iid,
        });
    }

    Ok(service)
}

/// Write through the bridge and classify the value read back.
pub async fn apply(
    bridge: &dyn DeviceBridge,
    service: &Service,
    command: &SetCharacteristic,
) -> Outcome {
    match bridge
        .set_characteristic(service, command.iid, command.value.clone())
        .await
    {
        Ok(characteristic) if characteristic.holds(&command.value) => Outcome::Applied,
        Ok(characteristic) => Outcome::Ineffective {
            requested: command.value.clone(),
            actual: characteristic.value,
        },
        Err(e) => Outcome::Failed(e.into()),
    }
}

/// Log an outcome and count it.
pub fn record(metrics: &Metrics, command: &SetCharacteristic, outcome: &Outcome) {
    match outcome {
        Outcome::Applied => {
            info!(
                "[fulfillment] Set {}.{} = {}",
                command.service_id, command.iid, command.value
            );
            metrics.increment(Metric::SetOk);
        }
        Outcome::Ineffective { requested, actual } => {
            warn!(
                "[fulfillment] Set {}.{} = {} had no effect (now {:?})",
                command.service_id, command.iid, requested, actual
            );
            metrics.increment(Metric::SetIneffective);
        }
        Outcome::Failed(e) => {
            warn!(
                "[fulfillment] Set {}.{} = {} failed: {}",
                command.service_id, command.iid, command.value, e
            );
            metrics.increment(Metric::SetError);
        }
    }
}

/// Resolve a command against `services` and, if it is valid, write it in
/// the background. Rejections are recorded immediately.
pub fn fulfill(
    services: &[Service],
    bridge: &std::sync::Arc<dyn DeviceBridge>,
    metrics: &Metrics,
    command: SetCharacteristic,
) {
    let service = match resolve(services, &command) {
        Ok(service) => service.clone(),
        Err(e) => {
            record(metrics, &command, &Outcome::Failed(e));
            return;
        }
    };

    debug!(
        "[fulfillment] Writing {}.{} on {}",
        command.service_id, command.iid, service.service_name
    );
    let bridge = bridge.clone();
    let metrics = metrics.clone();
    tokio::spawn(async move {
        let outcome = apply(bridge.as_ref(), &service, &command).await;
        record(&metrics, &command, &outcome);
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::bridge::mock::MockBridge;
    use crate::bridge::mock::SetBehavior;
    use crate::protocol::fixtures::lightbulb;

    fn command(service_id: &str, iid: u64, value: CharacteristicValue) -> SetCharacteristic {
        SetCharacteristic {
            service_id: service_id.to_string(),
            iid,
            value,
        }
    }

    #[test]
    fn test_resolve_rejections() {
        let mut services = vec![lightbulb("lamp", false)];
        services[0].service_characteristics[1].can_write = false;

        assert!(matches!(
            resolve(&services, &command("other", 10, true.into())),
            Err(FulfillmentError::ServiceNotFound(_))
        ));
        assert!(matches!(
            resolve(&services, &command("lamp", 99, true.into())),
            Err(FulfillmentError::CharacteristicNotFound { iid: 99, .. })
        ));
        assert!(matches!(
            resolve(&services, &command("lamp", 11, 50.into())),
            Err(FulfillmentError::NotWritable { iid: 11, .. })
        ));
        assert_eq!(
            resolve(&services, &command("lamp", 10, true.into()))
                .unwrap()
                .unique_id,
            "lamp"
        );
    }

    #[tokio::test]
    async fn test_apply_outcomes() {
        let service = lightbulb("lamp", false);
        let bridge = MockBridge::new(vec![service.clone()]);

        let outcome = apply(&bridge, &service, &command("lamp", 11, 75.into())).await;
        assert!(matches!(outcome, Outcome::Applied));

        // 75 read back as 75.0 still counts as applied
        bridge.set_behavior(SetBehavior::Return(serde_json::from_str("75.0").unwrap()));
        let outcome = apply(&bridge, &service, &command("lamp", 11, 75.into())).await;
        assert!(matches!(outcome, Outcome::Applied));

        bridge.set_behavior(SetBehavior::Return(40.into()));
        let outcome = apply(&bridge, &service, &command("lamp", 11, 75.into())).await;
        assert!(matches!(outcome, Outcome::Ineffective { .. }));

        // On read back as 1 after writing true
        bridge.set_behavior(SetBehavior::Return(1.into()));
        let outcome = apply(&bridge, &service, &command("lamp", 10, true.into())).await;
        assert!(matches!(outcome, Outcome::Applied));
        let outcome = apply(&bridge, &service, &command("lamp", 10, false.into())).await;
        assert!(matches!(outcome, Outcome::Ineffective { .. }));

        bridge.set_behavior(SetBehavior::Fail);
        let outcome = apply(&bridge, &service, &command("lamp", 10, true.into())).await;
        assert!(matches!(
            outcome,
            Outcome::Failed(FulfillmentError::Bridge(BridgeError::Rejected(_)))
        ));
    }

    #[tokio::test]
    async fn test_fulfill_counts_outcomes() {
        let services = vec![lightbulb("lamp", false)];
        let mock = Arc::new(MockBridge::new(services.clone()));
        let bridge: Arc<dyn DeviceBridge> = mock.clone();
        let metrics = Metrics::new();

        fulfill(&services, &bridge, &metrics, command("missing", 10, true.into()));
        assert_eq!(metrics.get(Metric::SetError), 1);
        assert!(mock.calls().is_empty());

        fulfill(&services, &bridge, &metrics, command("lamp", 10, true.into()));
        tokio::time::timeout(Duration::from_secs(1), async {
            while metrics.get(Metric::SetOk) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            mock.calls(),
            vec![("lamp".to_string(), 10u64, CharacteristicValue::Bool(true))]
        );
    }
}
