//! [`DeviceBridge`] over the HAP HTTP API of statically configured accessory
//! servers (Homebridge in insecure mode and compatible servers).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::BridgeError;
use super::DeviceBridge;
use super::Instance;
use super::Monitor;
use super::Result;
use crate::protocol::Characteristic;
use crate::protocol::CharacteristicValue;
use crate::protocol::Format;
use crate::protocol::Perm;
use crate::protocol::Service;

const HAP_UUID_SUFFIX: &str = "-0000-1000-8000-0026BB765291";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Short types of services that describe the accessory rather than a device
const SKIPPED_SERVICES: &[&str] = &["3E", "A2"];

const SERVICE_TYPES: &[(&str, &str)] = &[
    ("3E", "AccessoryInformation"),
    ("40", "Fan"),
    ("41", "GarageDoorOpener"),
    ("43", "Lightbulb"),
    ("44", "LockManagement"),
    ("45", "LockMechanism"),
    ("47", "Outlet"),
    ("49", "Switch"),
    ("4A", "Thermostat"),
    ("7E", "SecuritySystem"),
    ("80", "ContactSensor"),
    ("82", "HumiditySensor"),
    ("83", "LeakSensor"),
    ("84", "LightSensor"),
    ("85", "MotionSensor"),
    ("86", "OccupancySensor"),
    ("87", "SmokeSensor"),
    ("89", "StatelessProgrammableSwitch"),
    ("8A", "TemperatureSensor"),
    ("8B", "Window"),
    ("8C", "WindowCovering"),
    ("8D", "AirQualitySensor"),
    ("96", "Battery"),
    ("97", "CarbonMonoxideSensor"),
    ("A2", "ProtocolInformation"),
    ("B7", "Fanv2"),
    ("BC", "HeaterCooler"),
    ("D0", "Valve"),
    ("D8", "Television"),
];

const CHARACTERISTIC_TYPES: &[(&str, &str)] = &[
    ("8", "Brightness"),
    ("E", "CurrentDoorState"),
    ("10", "CurrentRelativeHumidity"),
    ("11", "CurrentTemperature"),
    ("13", "Hue"),
    ("14", "Identify"),
    ("1D", "LockCurrentState"),
    ("1E", "LockTargetState"),
    ("20", "Manufacturer"),
    ("21", "Model"),
    ("22", "MotionDetected"),
    ("23", "Name"),
    ("25", "On"),
    ("29", "RotationSpeed"),
    ("2F", "Saturation"),
    ("30", "SerialNumber"),
    ("32", "TargetDoorState"),
    ("35", "TargetTemperature"),
    ("52", "FirmwareRevision"),
    ("68", "BatteryLevel"),
    ("6A", "ContactSensorState"),
    ("6B", "CurrentAmbientLightLevel"),
    ("6D", "CurrentPosition"),
    ("71", "OccupancyDetected"),
    ("73", "ProgrammableSwitchEvent"),
    ("79", "StatusLowBattery"),
    ("7C", "TargetPosition"),
    ("8F", "ChargingState"),
    ("B0", "Active"),
    ("CE", "ColorTemperature"),
];

/// Accessory servers answer with this on partial failure of a write
const MULTI_STATUS: u16 = 207;

#[derive(Debug, Deserialize)]
struct AccessoriesResponse {
    accessories: Vec<RawAccessory>,
}

#[derive(Debug, Deserialize)]
struct RawAccessory {
    aid: u64,
    services: Vec<RawService>,
}

#[derive(Debug, Deserialize)]
struct RawService {
    iid: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    characteristics: Vec<RawCharacteristic>,
    #[serde(default)]
    linked: Option<Vec<u64>>,
    #[serde(default)]
    hidden: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCharacteristic {
    iid: u64,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: serde_json::Value,
    format: Format,
    #[serde(default)]
    perms: Vec<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    unit: Option<serde_json::Value>,
    #[serde(default)]
    max_value: Option<f64>,
    #[serde(default)]
    min_value: Option<f64>,
    #[serde(default)]
    min_step: Option<f64>,
    #[serde(default)]
    max_len: Option<u64>,
    #[serde(default, rename = "valid-values")]
    valid_values: Option<Vec<f64>>,
    #[serde(default, rename = "valid-values-range")]
    valid_values_range: Option<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct CharacteristicsResponse {
    characteristics: Vec<CharacteristicStatus>,
}

#[derive(Debug, Deserialize)]
struct CharacteristicStatus {
    aid: u64,
    iid: u64,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    status: Option<i64>,
}

/// Bridge to HAP accessory servers
#[derive(Debug, Clone)]
pub struct HapBridge {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    http: reqwest::Client,
    pin: String,
    instances: Vec<Instance>,
    poll_interval: Duration,
    /// uniqueId -> owning instance, refreshed by every snapshot
    owners: Mutex<HashMap<String, Instance>>,
}

impl HapBridge {
    pub fn new(instances: Vec<Instance>, pin: String, poll_interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(BridgeError::Client)?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                pin,
                instances,
                poll_interval,
                owners: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl Inner {
    fn base_url(instance: &Instance) -> String {
        format!("http://{}:{}", instance.host, instance.port)
    }

    async fn check(instance: &Instance, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(BridgeError::Status {
                instance: instance.name.clone(),
                status: status.as_u16(),
            })
        }
    }

    fn http_error(instance: &Instance) -> impl FnOnce(reqwest::Error) -> BridgeError + '_ {
        move |source| BridgeError::Http {
            instance: instance.name.clone(),
            source,
        }
    }

    async fn fetch_instance(&self, instance: &Instance) -> Result<Vec<Service>> {
        let response = self
            .http
            .get(format!("{}/accessories", Self::base_url(instance)))
            .header("Authorization", &self.pin)
            .send()
            .await
            .map_err(Self::http_error(instance))?;
        let body: AccessoriesResponse = Self::check(instance, response)
            .await?
            .json()
            .await
            .map_err(Self::http_error(instance))?;
        Ok(flatten_accessories(instance, body))
    }

    async fn fetch_all(&self) -> Result<Vec<Service>> {
        let mut services = Vec::new();
        let mut owners = HashMap::new();
        let mut first_error = None;

        for instance in &self.instances {
            match self.fetch_instance(instance).await {
                Ok(found) => {
                    debug!(
                        "[hap] {} services on {}",
                        found.len(),
                        instance.name
                    );
                    for service in &found {
                        owners.insert(service.unique_id.clone(), instance.clone());
                    }
                    services.extend(found);
                }
                Err(e) => {
                    warn!("[hap] Failed to fetch accessories from {}: {}", instance.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let (Some(e), true) = (first_error, services.is_empty()) {
            return Err(e);
        }

        *self.owners.lock().unwrap_or_else(PoisonError::into_inner) = owners;
        Ok(services)
    }

    fn owner(&self, unique_id: &str) -> Option<Instance> {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unique_id)
            .cloned()
    }

    async fn write(&self, instance: &Instance, aid: u64, iid: u64, value: &CharacteristicValue) -> Result<()> {
        let response = self
            .http
            .put(format!("{}/characteristics", Self::base_url(instance)))
            .header("Authorization", &self.pin)
            .json(&json!({"characteristics": [{"aid": aid, "iid": iid, "value": value}]}))
            .send()
            .await
            .map_err(Self::http_error(instance))?;

        if response.status().as_u16() == MULTI_STATUS {
            let body: CharacteristicsResponse =
                response.json().await.map_err(Self::http_error(instance))?;
            if let Some(status) = body
                .characteristics
                .iter()
                .filter(|c| c.aid == aid && c.iid == iid)
                .find_map(|c| c.status.filter(|s| *s != 0))
            {
                return Err(BridgeError::Rejected(status));
            }
            return Ok(());
        }

        Self::check(instance, response).await.map(|_| ())
    }

    async fn read(&self, instance: &Instance, aid: u64, iid: u64) -> Result<Option<CharacteristicValue>> {
        let response = self
            .http
            .get(format!("{}/characteristics", Self::base_url(instance)))
            .query(&[("id", format!("{}.{}", aid, iid))])
            .header("Authorization", &self.pin)
            .send()
            .await
            .map_err(Self::http_error(instance))?;
        let body: CharacteristicsResponse = Self::check(instance, response)
            .await?
            .json()
            .await
            .map_err(Self::http_error(instance))?;

        body.characteristics
            .into_iter()
            .find(|c| c.aid == aid && c.iid == iid)
            .map(|c| to_value(c.value))
            .ok_or(BridgeError::MissingCharacteristic { aid, iid })
    }
}

#[async_trait]
impl DeviceBridge for HapBridge {
    fn discover_instances(&self) -> mpsc::Receiver<Instance> {
        let (tx, rx) = mpsc::channel(self.inner.instances.len().max(1));
        for instance in &self.inner.instances {
            info!(
                "[hap] Using instance {} at {}:{}",
                instance.name, instance.host, instance.port
            );
            let _ = tx.try_send(instance.clone());
        }
        rx
    }

    async fn get_all_services(&self) -> Result<Vec<Service>> {
        self.inner.fetch_all().await
    }

    async fn set_characteristic(
        &self,
        service: &Service,
        iid: u64,
        value: CharacteristicValue,
    ) -> Result<Characteristic> {
        let instance = self
            .inner
            .owner(&service.unique_id)
            .ok_or_else(|| BridgeError::UnknownService(service.unique_id.clone()))?;
        let mut characteristic = service
            .characteristic(iid)
            .cloned()
            .ok_or(BridgeError::MissingCharacteristic { aid: service.aid, iid })?;

        self.inner
            .write(&instance, service.aid, iid, &value)
            .await?;
        characteristic.value = self.inner.read(&instance, service.aid, iid).await?;
        Ok(characteristic)
    }

    async fn monitor_characteristics(&self) -> Result<Monitor> {
        let inner = self.inner.clone();
        let (tx, rx) = mpsc::channel(16);
        let baseline = inner.fetch_all().await?;
        info!(
            "[hap] Monitoring {} services every {:?}",
            baseline.len(),
            inner.poll_interval
        );

        let task = tokio::spawn(async move {
            let mut previous: HashMap<String, Service> = baseline
                .into_iter()
                .map(|s| (s.unique_id.clone(), s))
                .collect();
            let mut interval = tokio::time::interval(inner.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the first immediate tick
            interval.tick().await;

            loop {
                interval.tick().await;
                let current = match inner.fetch_all().await {
                    Ok(current) => current,
                    Err(e) => {
                        debug!("[hap] Poll failed: {}", e);
                        continue;
                    }
                };

                let changed = changed_services(&previous, &current);
                previous = current
                    .into_iter()
                    .map(|s| (s.unique_id.clone(), s))
                    .collect();

                if !changed.is_empty() && tx.send(changed).await.is_err() {
                    break;
                }
            }
        });

        Ok(Monitor::new(rx, Some(task)))
    }
}

/// Services that are new or whose values differ from `previous`.
fn changed_services(previous: &HashMap<String, Service>, current: &[Service]) -> Vec<Service> {
    current
        .iter()
        .filter(|s| {
            previous
                .get(&s.unique_id)
                .map_or(true, |old| s.values_differ(old))
        })
        .cloned()
        .collect()
}

/// Turn an `/accessories` response into wire services.
fn flatten_accessories(instance: &Instance, response: AccessoriesResponse) -> Vec<Service> {
    let mut services = Vec::new();

    for accessory in response.accessories {
        for raw in accessory.services {
            let short = short_type(&raw.kind);
            if SKIPPED_SERVICES.contains(&short.as_str()) {
                continue;
            }

            let uuid = full_uuid(&raw.kind);
            let kind = type_name(SERVICE_TYPES, &short).unwrap_or(&short).to_string();
            let human_type = humanize(&kind);
            let service_name = raw
                .characteristics
                .iter()
                .find(|c| short_type(&c.kind) == "23")
                .and_then(|c| c.value.as_str().map(str::to_string))
                .unwrap_or_else(|| human_type.clone());

            let service_characteristics = raw
                .characteristics
                .into_iter()
                .map(|c| convert_characteristic(accessory.aid, &kind, &service_name, c))
                .collect();

            services.push(Service {
                unique_id: unique_id(&instance.username, accessory.aid, raw.iid, &uuid),
                aid: accessory.aid,
                iid: raw.iid,
                uuid,
                kind,
                human_type,
                service_name,
                linked: raw.linked,
                hidden: raw.hidden,
                service_characteristics,
            });
        }
    }

    services
}

fn convert_characteristic(
    aid: u64,
    service_type: &str,
    service_name: &str,
    raw: RawCharacteristic,
) -> Characteristic {
    let short = short_type(&raw.kind);
    let kind = type_name(CHARACTERISTIC_TYPES, &short)
        .unwrap_or(&short)
        .to_string();
    let perms: Vec<Perm> = raw.perms.into_iter().filter_map(lenient).collect();

    Characteristic {
        aid,
        iid: raw.iid,
        uuid: full_uuid(&raw.kind),
        description: raw.description.unwrap_or_else(|| humanize(&kind)),
        kind,
        service_type: service_type.to_string(),
        service_name: service_name.to_string(),
        value: to_value(raw.value),
        format: raw.format,
        can_read: perms.contains(&Perm::Pr),
        can_write: perms.contains(&Perm::Pw),
        ev: perms.contains(&Perm::Ev),
        perms,
        unit: raw.unit.and_then(lenient),
        max_value: raw.max_value,
        min_value: raw.min_value,
        min_step: raw.min_step,
        max_len: raw.max_len,
        valid_values: raw.valid_values,
        valid_value_ranges: raw.valid_values_range,
    }
}

/// Values outside the wire model (null, arrays, objects) become `None`.
fn to_value(value: serde_json::Value) -> Option<CharacteristicValue> {
    lenient(value)
}

fn lenient<T: DeserializeOwned>(value: serde_json::Value) -> Option<T> {
    serde_json::from_value(value).ok()
}

/// `sha256(username + aid + iid + type)`, stable across restarts.
fn unique_id(username: &str, aid: u64, iid: u64, uuid: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}{}{}{}", username, aid, iid, uuid));
    hex::encode(hasher.finalize())
}

/// `0000003E-0000-1000-8000-0026BB765291` -> `3E`
fn short_type(kind: &str) -> String {
    let upper = kind.to_ascii_uppercase();
    match upper.strip_suffix(HAP_UUID_SUFFIX) {
        Some(prefix) => {
            let trimmed = prefix.trim_start_matches('0');
            if trimmed.is_empty() {
                "0".to_string()
            } else {
                trimmed.to_string()
            }
        }
        None => upper,
    }
}

/// `3E` -> `0000003E-0000-1000-8000-0026BB765291`; custom UUIDs pass through.
fn full_uuid(kind: &str) -> String {
    let upper = kind.to_ascii_uppercase();
    if upper.len() <= 8 && upper.chars().all(|c| c.is_ascii_hexdigit()) {
        format!("{:0>8}{}", upper, HAP_UUID_SUFFIX)
    } else {
        upper
    }
}

fn type_name(table: &'static [(&'static str, &'static str)], short: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(id, _)| *id == short)
        .map(|(_, name)| *name)
}

/// `TemperatureSensor` -> `Temperature Sensor`
fn humanize(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() && prev_lower {
            out.push(' ');
        }
        prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        out.push(c);
    }
    out
}
