use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::CharacteristicValue;
use super::ProtocolError;
use super::Result;
use super::Service;

/// Protocol version stamped on every envelope in both directions.
pub const PROTOCOL_VERSION: u32 = 1;

/// Named metric -> count. Counts only ever grow.
pub type Counters = BTreeMap<String, u64>;

/// Versioned wrapper around a tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u32,
    #[serde(flatten)]
    pub message: T,
}

/// Messages FROM the bridge TO the upstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Full snapshot of every known service
    DeviceList(Vec<Service>),

    /// One service whose characteristics changed
    DeviceStatusChange(Service),

    /// Coalesced counters
    MetricsChange(Counters),
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::DeviceList(_) => "deviceList",
            ClientMessage::DeviceStatusChange(_) => "deviceStatusChange",
            ClientMessage::MetricsChange(_) => "metricsChange",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ClientMessage::DeviceList(services) => {
                services.iter().try_for_each(Service::validate)
            }
            ClientMessage::DeviceStatusChange(service) => service.validate(),
            ClientMessage::MetricsChange(_) => Ok(()),
        }
    }
}

/// Command to write one characteristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCharacteristic {
    /// `uniqueId` of the target service
    pub service_id: String,
    pub iid: u64,
    pub value: CharacteristicValue,
}

/// Messages FROM the upstream service TO the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    SetCharacteristic(SetCharacteristic),

    /// Informational only
    Notify(serde_json::Value),
}

impl ServerMessage {
    fn validate(&self) -> Result<()> {
        match self {
            ServerMessage::SetCharacteristic(cmd) if cmd.service_id.is_empty() => {
                Err(ProtocolError::EmptyServiceId)
            }
            ServerMessage::SetCharacteristic(_) | ServerMessage::Notify(_) => Ok(()),
        }
    }
}

/// Validate and serialize an outbound message.
pub fn encode_client(message: &ClientMessage) -> Result<String> {
    message.validate()?;
    Ok(serde_json::to_string(&Envelope {
        version: PROTOCOL_VERSION,
        message,
    })?)
}

/// Validate an outbound message and return its envelope as a JSON value.
pub fn envelope_value(message: &ClientMessage) -> Result<serde_json::Value> {
    message.validate()?;
    Ok(serde_json::to_value(Envelope {
        version: PROTOCOL_VERSION,
        message,
    })?)
}

/// Decode and validate a single inbound envelope.
pub fn decode_server_value(value: serde_json::Value) -> Result<ServerMessage> {
    let envelope: Envelope<ServerMessage> = serde_json::from_value(value)?;
    if envelope.version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: envelope.version,
        });
    }
    envelope.message.validate()?;
    Ok(envelope.message)
}

/// Decode an inbound frame holding either one envelope or an array of them.
///
/// Fails only when the frame is not JSON at all. Each element of a batch is
/// decoded independently, so one invalid envelope does not hide its siblings.
pub fn decode_server_frame(text: &str) -> Result<Vec<Result<ServerMessage>>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    Ok(match value {
        serde_json::Value::Array(items) => items.into_iter().map(decode_server_value).collect(),
        single => vec![decode_server_value(single)],
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::protocol::fixtures::lightbulb;
    use crate::protocol::Characteristic;
    use crate::protocol::Format;
    use crate::protocol::Perm;
    use crate::protocol::Unit;

    #[test]
    fn test_encode_metrics_change() {
        let mut counters = Counters::new();
        counters.insert("connectionCount".to_string(), 2);
        let text = encode_client(&ClientMessage::MetricsChange(counters)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"version": 1, "type": "metricsChange", "data": {"connectionCount": 2}})
        );
    }

    #[test]
    fn test_encode_device_list_shape() {
        let value = envelope_value(&ClientMessage::DeviceList(vec![lightbulb("a", true)])).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["type"], "deviceList");
        assert_eq!(value["data"][0]["uniqueId"], "a");
        assert_eq!(value["data"][0]["serviceCharacteristics"][0]["iid"], 10);
    }

    #[test]
    fn test_encode_rejects_invalid_service() {
        let err = encode_client(&ClientMessage::DeviceStatusChange(lightbulb("", true)));
        assert!(matches!(err, Err(ProtocolError::MissingUniqueId { .. })));
    }

    #[test]
    fn test_decode_set_characteristic() {
        let msg = decode_server_value(json!({
            "version": 1,
            "type": "SetCharacteristic",
            "data": {"serviceId": "abc", "iid": 10, "value": true}
        }))
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::SetCharacteristic(SetCharacteristic {
                service_id: "abc".to_string(),
                iid: 10,
                value: CharacteristicValue::Bool(true),
            })
        );
    }

    #[test]
    fn test_decode_notify() {
        let msg = decode_server_value(json!({
            "version": 1,
            "type": "Notify",
            "data": {"text": "maintenance at noon"}
        }))
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::Notify(json!({"text": "maintenance at noon"}))
        );
    }

    #[test]
    fn test_decode_rejects_wrong_version() {
        let err = decode_server_value(json!({
            "version": 2,
            "type": "Notify",
            "data": null
        }));
        assert!(matches!(
            err,
            Err(ProtocolError::VersionMismatch {
                expected: 1,
                found: 2
            })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_null_value() {
        assert!(decode_server_value(json!({"version": 1, "type": "Reboot", "data": {}})).is_err());
        assert!(decode_server_value(json!({
            "version": 1,
            "type": "SetCharacteristic",
            "data": {"serviceId": "abc", "iid": 10, "value": null}
        }))
        .is_err());
        assert!(matches!(
            decode_server_value(json!({
                "version": 1,
                "type": "SetCharacteristic",
                "data": {"serviceId": "", "iid": 10, "value": 1}
            })),
            Err(ProtocolError::EmptyServiceId)
        ));
    }

    #[test]
    fn test_decode_batch_keeps_valid_siblings() {
        let frame = json!([
            {"version": 1, "type": "Notify", "data": 1},
            {"version": 1, "type": "Bogus", "data": 2},
            {"version": 1, "type": "Notify", "data": 3}
        ])
        .to_string();
        let decoded = decode_server_frame(&frame).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded[0].is_ok());
        assert!(decoded[1].is_err());
        assert_eq!(decoded[2].as_ref().unwrap(), &ServerMessage::Notify(json!(3)));
    }

    #[test]
    fn test_decode_frame_rejects_malformed_json() {
        assert!(matches!(
            decode_server_frame("{not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    fn value_strategy() -> impl Strategy<Value = CharacteristicValue> {
        prop_oneof![
            any::<bool>().prop_map(CharacteristicValue::Bool),
            any::<i64>().prop_map(CharacteristicValue::from),
            "[a-zA-Z0-9 ]{0,12}".prop_map(CharacteristicValue::String),
        ]
    }

    // Halves are exactly representable, so they survive a JSON round trip.
    fn half() -> impl Strategy<Value = f64> {
        (-2000i32..2000).prop_map(|v| f64::from(v) / 2.0)
    }

    fn characteristic_strategy() -> impl Strategy<Value = Characteristic> {
        (
            prop::option::of(value_strategy()),
            prop::sample::select(vec![
                Format::Bool,
                Format::Int,
                Format::Float,
                Format::String,
                Format::Uint8,
                Format::Tlv8,
                Format::Dictionary,
            ]),
            prop::collection::vec(
                prop::sample::select(vec![Perm::Pr, Perm::Pw, Perm::Ev, Perm::Hd]),
                0..4,
            ),
            prop::option::of(prop::sample::select(vec![
                Unit::Percentage,
                Unit::Celsius,
                Unit::Lux,
            ])),
            (
                prop::option::of(half()),
                prop::option::of(half()),
                prop::option::of(half()),
            ),
            prop::option::of(0u64..4096),
            prop::option::of(prop::collection::vec(half(), 0..4)),
            prop::option::of((half(), half())),
            (any::<bool>(), any::<bool>(), any::<bool>()),
        )
            .prop_map(
                |(
                    value,
                    format,
                    perms,
                    unit,
                    (max_value, min_value, min_step),
                    max_len,
                    valid_values,
                    valid_value_ranges,
                    (can_read, can_write, ev),
                )| Characteristic {
                    aid: 1,
                    iid: 0,
                    uuid: "00000025-0000-1000-8000-0026BB765291".to_string(),
                    kind: "On".to_string(),
                    service_type: "Switch".to_string(),
                    service_name: "Switch".to_string(),
                    description: "On".to_string(),
                    value,
                    format,
                    perms,
                    unit,
                    max_value,
                    min_value,
                    min_step,
                    max_len,
                    valid_values,
                    valid_value_ranges,
                    can_read,
                    can_write,
                    ev,
                },
            )
    }

    fn service_strategy() -> impl Strategy<Value = Service> {
        (
            "[a-f0-9]{1,16}",
            prop::option::of(prop::collection::vec(0u64..64, 0..3)),
            prop::option::of(any::<bool>()),
            prop::collection::vec(characteristic_strategy(), 0..6),
        )
            .prop_map(|(unique_id, linked, hidden, mut characteristics)| {
                for (i, c) in characteristics.iter_mut().enumerate() {
                    c.iid = 10 + i as u64;
                }
                Service {
                    unique_id,
                    aid: 1,
                    iid: 9,
                    uuid: "00000049-0000-1000-8000-0026BB765291".to_string(),
                    kind: "Switch".to_string(),
                    human_type: "Switch".to_string(),
                    service_name: "Switch".to_string(),
                    linked,
                    hidden,
                    service_characteristics: characteristics,
                }
            })
    }

    proptest! {
        #[test]
        fn prop_service_round_trips(service in service_strategy()) {
            let message = ClientMessage::DeviceStatusChange(service);
            let text = encode_client(&message).unwrap();
            let decoded: Envelope<ClientMessage> = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(decoded.version, PROTOCOL_VERSION);
            prop_assert!(decoded.message.validate().is_ok());
            prop_assert_eq!(decoded.message, message);
        }
    }
}
