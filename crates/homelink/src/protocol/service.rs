//! Accessory data model as it crosses the wire.
//!
//! A [`Service`] is a capability group of one accessory (a lightbulb, a
//! thermostat, ...) holding an ordered list of typed [`Characteristic`]s.
//! Field names follow the camelCase JSON shape produced by HAP clients.

use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use super::ProtocolError;

/// Value carried by a characteristic.
///
/// Commands may never carry `null`; a characteristic whose value is unknown
/// uses `Option::None` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CharacteristicValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl CharacteristicValue {
    /// Whether `other` represents the same value.
    ///
    /// Numbers compare numerically so that `1` and `1.0` match.
    pub fn matches(&self, other: &CharacteristicValue) -> bool {
        match (self, other) {
            (CharacteristicValue::Number(a), CharacteristicValue::Number(b)) => {
                match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => a == b,
                }
            }
            (a, b) => a == b,
        }
    }

    /// Booleans, and the numbers `0` and `1` that some accessories report
    /// for them.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CharacteristicValue::Bool(b) => Some(*b),
            CharacteristicValue::Number(n) => match n.as_f64() {
                Some(v) if v == 0.0 => Some(false),
                Some(v) if v == 1.0 => Some(true),
                _ => None,
            },
            CharacteristicValue::String(_) => None,
        }
    }
}

impl fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharacteristicValue::Bool(b) => write!(f, "{}", b),
            CharacteristicValue::Number(n) => write!(f, "{}", n),
            CharacteristicValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for CharacteristicValue {
    fn from(value: bool) -> Self {
        CharacteristicValue::Bool(value)
    }
}

impl From<i64> for CharacteristicValue {
    fn from(value: i64) -> Self {
        CharacteristicValue::Number(value.into())
    }
}

impl From<&str> for CharacteristicValue {
    fn from(value: &str) -> Self {
        CharacteristicValue::String(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Bool,
    Int,
    Float,
    String,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Data,
    Tlv8,
    Array,
    Dictionary,
}

/// HAP permission flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Perm {
    /// Paired read
    Pr,
    /// Paired write
    Pw,
    /// Events
    Ev,
    /// Additional authorization
    Aa,
    /// Timed write
    Tw,
    /// Hidden
    Hd,
    /// Write response
    Wr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Unit,
    Percentage,
    Celsius,
    Arcdegrees,
    Lux,
    Seconds,
}

/// A single typed property of a service, e.g. `On` or `Brightness`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Characteristic {
    pub aid: u64,
    pub iid: u64,
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub service_type: String,
    pub service_name: String,
    pub description: String,

    /// Missing for write-only characteristics such as remote buttons.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<CharacteristicValue>,
    pub format: Format,
    pub perms: Vec<Perm>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_value_ranges: Option<(f64, f64)>,

    pub can_read: bool,
    pub can_write: bool,
    pub ev: bool,
}

impl Characteristic {
    /// Whether the current value is `requested`, taking the format into
    /// account.
    pub fn holds(&self, requested: &CharacteristicValue) -> bool {
        let Some(actual) = &self.value else {
            return false;
        };
        if self.format == Format::Bool {
            if let (Some(a), Some(b)) = (actual.as_bool(), requested.as_bool()) {
                return a == b;
            }
        }
        actual.matches(requested)
    }
}

/// A capability group of one accessory.
///
/// `unique_id` is the only identity that is stable across messages; `iid`
/// values are unique only within one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub unique_id: String,
    pub aid: u64,
    pub iid: u64,
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub human_type: String,
    pub service_name: String,

    /// iids of services on the same accessory related to this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,

    pub service_characteristics: Vec<Characteristic>,
}

impl Service {
    pub fn characteristic(&self, iid: u64) -> Option<&Characteristic> {
        self.service_characteristics.iter().find(|c| c.iid == iid)
    }

    pub fn characteristic_mut(&mut self, iid: u64) -> Option<&mut Characteristic> {
        self.service_characteristics
            .iter_mut()
            .find(|c| c.iid == iid)
    }

    /// Check the identity invariants that typed construction cannot express.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.unique_id.is_empty() {
            return Err(ProtocolError::MissingUniqueId {
                service_name: self.service_name.clone(),
            });
        }

        let mut seen = HashSet::new();
        for c in &self.service_characteristics {
            if !seen.insert(c.iid) {
                return Err(ProtocolError::DuplicateIid {
                    unique_id: self.unique_id.clone(),
                    iid: c.iid,
                });
            }
        }

        Ok(())
    }

    /// Whether any characteristic value differs from `previous`.
    pub fn values_differ(&self, previous: &Service) -> bool {
        self.service_characteristics.len() != previous.service_characteristics.len()
            || self
                .service_characteristics
                .iter()
                .zip(&previous.service_characteristics)
                .any(|(a, b)| a.iid != b.iid || a.value != b.value)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_numbers_match_numerically() {
        let int: CharacteristicValue = serde_json::from_str("1").unwrap();
        let float: CharacteristicValue = serde_json::from_str("1.0").unwrap();
        assert!(int.matches(&float));
        assert!(!int.matches(&CharacteristicValue::Bool(true)));
        assert!(!CharacteristicValue::from("a").matches(&"b".into()));
    }

    #[test]
    fn test_bool_characteristic_holds_numeric_read_back() {
        let mut on = on_characteristic(2, 10, false);
        on.value = Some(1.into());
        assert!(on.holds(&true.into()));
        assert!(!on.holds(&false.into()));

        on.value = Some(0.into());
        assert!(on.holds(&false.into()));

        // Only bool characteristics get the 0/1 treatment
        let brightness = brightness_characteristic(2, 11, 1);
        assert!(!brightness.holds(&true.into()));
        assert!(brightness.holds(&1.into()));

        on.value = None;
        assert!(!on.holds(&false.into()));
    }

    #[test]
    fn test_value_rejects_null_and_objects() {
        assert!(serde_json::from_str::<CharacteristicValue>("null").is_err());
        assert!(serde_json::from_str::<CharacteristicValue>("{}").is_err());
    }

    #[test]
    fn test_missing_value_is_none() {
        let mut json = serde_json::to_value(on_characteristic(1, 9, true)).unwrap();
        json.as_object_mut().unwrap().remove("value");
        let c: Characteristic = serde_json::from_value(json).unwrap();
        assert_eq!(c.value, None);
    }

    #[test]
    fn test_validate_duplicate_iid() {
        let mut service = lightbulb("abc", true);
        service.service_characteristics[1].iid = 10;
        assert!(matches!(
            service.validate(),
            Err(ProtocolError::DuplicateIid { iid: 10, .. })
        ));
    }

    #[test]
    fn test_validate_missing_unique_id() {
        let service = lightbulb("", true);
        assert!(matches!(
            service.validate(),
            Err(ProtocolError::MissingUniqueId { .. })
        ));
    }

    #[test]
    fn test_values_differ() {
        let a = lightbulb("abc", true);
        let b = lightbulb("abc", false);
        assert!(a.values_differ(&b));
        assert!(!a.values_differ(&a.clone()));
    }

    #[test]
    fn test_wire_shape_snapshot() {
        let mut service = lightbulb("abc", true);
        service.service_characteristics.truncate(1);
        insta::assert_json_snapshot!("lightbulb_service", service);
    }
}
