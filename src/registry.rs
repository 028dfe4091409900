//! Sensor Registry — persistent catalog of enrolled sensors and their
//! per-datatype settings, plus the last-seen history sidecar.
//!
//! Owns `Sensor` and `SensorLastSeen` exclusively; every other component
//! reaches these only through the operations below, never by shared
//! mutable reference (SPEC_FULL §3).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::codec::{self, Mac};
use crate::error::RegistryError;

/// Hardware model reported in the pairing capability payload (byte 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareModel {
    Machmo,
    MachmoMini,
    Unknown,
}

impl HardwareModel {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => HardwareModel::Machmo,
            2 => HardwareModel::MachmoMini,
            _ => HardwareModel::Unknown,
        }
    }
}

/// A measurement type a sensor can report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Vibration,
    Audio,
    Temperature,
    Flux,
}

impl Datatype {
    /// Wire-level byte size of one sample of this datatype, used by the
    /// collection-capacity invariant.
    pub fn sample_size_bytes(self) -> u64 {
        match self {
            Datatype::Vibration => 6, // three little-endian i16 samples
            Datatype::Audio => 3,     // one 24-bit packed sample
            Datatype::Flux => 3,
            Datatype::Temperature => 2, // one i16 ADC code
        }
    }

    fn from_setting_prefix(s: &str) -> Option<Self> {
        match s {
            "vibration" => Some(Datatype::Vibration),
            "audio" => Some(Datatype::Audio),
            "temperature" => Some(Datatype::Temperature),
            "flux" => Some(Datatype::Flux),
            _ => None,
        }
    }
}

/// Per-datatype sampling configuration. Temperature only ever uses `active`;
/// `sampling_frequency_hz`/`sampling_duration_s` are carried as zero for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatatypeSetting {
    pub active: bool,
    pub sampling_frequency_hz: u32,
    pub sampling_duration_s: u16,
}

impl DatatypeSetting {
    fn vibration_default() -> Self {
        Self { active: true, sampling_frequency_hz: 8000, sampling_duration_s: 1 }
    }

    fn audio_default() -> Self {
        Self { active: true, sampling_frequency_hz: 22110, sampling_duration_s: 1 }
    }

    fn temperature_default() -> Self {
        Self { active: true, sampling_frequency_hz: 0, sampling_duration_s: 0 }
    }
}

mod mac_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mac: &Mac, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&codec::mac_to_string(mac))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Mac, D::Error> {
        let s = String::deserialize(d)?;
        codec::mac_from_string(&s).map_err(serde::de::Error::custom)
    }
}

/// An enrolled sensor, owned exclusively by the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sensor {
    #[serde(with = "mac_serde")]
    pub address: Mac,
    pub display_name: String,
    pub hardware_model: HardwareModel,
    pub capabilities: BTreeSet<Datatype>,
    pub collection_capacity_bytes: u64,
    pub wake_up_interval_s: u32,
    pub wake_up_interval_max_offset_s: u32,
    #[serde(skip)]
    pub next_wake_up: Option<DateTime<Utc>>,
    pub device_active: bool,
    pub per_type_settings: std::collections::BTreeMap<Datatype, DatatypeSetting>,
    pub battery_level: i32,
}

impl Sensor {
    /// Human-readable multi-line rendering, the direct analogue of the
    /// original's `Sensor.ToString()` — backs the CLI's `VIEW`/`LIST`
    /// obligations even though the CLI itself is out of scope here.
    pub fn to_display_string(&self) -> String {
        let mut out = format!(
            "Sensor {} ({})\n  model: {:?}\n  active: {}\n  capacity: {} bytes\n  wake interval: {}s (+/- {}s)\n  battery: {}\n",
            self.display_name,
            codec::mac_to_string(&self.address),
            self.hardware_model,
            self.device_active,
            self.collection_capacity_bytes,
            self.wake_up_interval_s,
            self.wake_up_interval_max_offset_s,
            if self.battery_level < 0 { "unknown".to_string() } else { self.battery_level.to_string() },
        );
        for (datatype, setting) in &self.per_type_settings {
            out.push_str(&format!(
                "  {:?}: active={} freq={}Hz duration={}s\n",
                datatype, setting.active, setting.sampling_frequency_hz, setting.sampling_duration_s
            ));
        }
        out
    }

    /// Collection-capacity invariant (SPEC_FULL §3): the sum, over enabled
    /// non-temperature datatypes, of `sample_size * freq * duration`, plus
    /// the flat sample size of temperature if enabled, must not exceed
    /// `collection_capacity_bytes`.
    fn projected_usage(&self) -> u64 {
        self.per_type_settings
            .iter()
            .filter(|(_, setting)| setting.active)
            .map(|(datatype, setting)| match datatype {
                Datatype::Temperature => datatype.sample_size_bytes(),
                _ => {
                    datatype.sample_size_bytes()
                        * setting.sampling_frequency_hz as u64
                        * setting.sampling_duration_s as u64
                }
            })
            .sum()
    }

    fn check_capacity(&self) -> Result<(), RegistryError> {
        let used = self.projected_usage();
        if used > self.collection_capacity_bytes {
            return Err(RegistryError::CapacityExceeded { used, capacity: self.collection_capacity_bytes });
        }
        Ok(())
    }

    fn reset_to_defaults(&mut self) {
        self.device_active = false;
        self.wake_up_interval_s = 3600;
        self.wake_up_interval_max_offset_s = 300;
        self.battery_level = -1;
        self.per_type_settings = default_settings_for(&self.capabilities);
    }
}

fn default_settings_for(capabilities: &BTreeSet<Datatype>) -> std::collections::BTreeMap<Datatype, DatatypeSetting> {
    let mut settings = std::collections::BTreeMap::new();
    if capabilities.contains(&Datatype::Vibration) {
        settings.insert(Datatype::Vibration, DatatypeSetting::vibration_default());
    }
    if capabilities.contains(&Datatype::Audio) {
        settings.insert(Datatype::Audio, DatatypeSetting::audio_default());
    }
    if capabilities.contains(&Datatype::Temperature) {
        settings.insert(Datatype::Temperature, DatatypeSetting::temperature_default());
    }
    settings
}

/// Last-seen history sidecar, keyed by address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Idle,
    Collecting,
    Transmitting,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorLastSeen {
    #[serde(with = "mac_serde")]
    pub address: Mac,
    pub last_seen: DateTime<Utc>,
    pub last_activity: Activity,
}

const SENSORS_FILE: &str = "sensors.json";
const HISTORY_FILE: &str = "sensor_history.json";

struct RegistryState {
    sensors: Vec<Sensor>,
    history: Vec<SensorLastSeen>,
}

/// Shared, lock-guarded handle to the sensor catalog. Cloning is cheap — all
/// clones refer to the same underlying state.
#[derive(Clone)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
    config_dir: PathBuf,
}

impl Registry {
    /// Load the registry from `config_dir`, tolerating missing files by
    /// starting empty (SPEC_FULL §4.B).
    pub async fn load(config_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let sensors = read_json_or_default(&config_dir.join(SENSORS_FILE)).await?;
        let history = read_json_or_default(&config_dir.join(HISTORY_FILE)).await?;
        Ok(Self { state: Arc::new(RwLock::new(RegistryState { sensors, history })), config_dir })
    }

    async fn save(&self) -> std::io::Result<()> {
        let state = self.state.read().await;
        let sensors = state.sensors.clone();
        let history = state.history.clone();
        drop(state);
        atomic_write_json(&self.config_dir.join(SENSORS_FILE), &sensors).await?;
        atomic_write_json(&self.config_dir.join(HISTORY_FILE), &history).await?;
        Ok(())
    }

    pub async fn get_all(&self) -> Vec<Sensor> {
        self.state.read().await.sensors.clone()
    }

    pub async fn get_by_address(&self, address: &Mac) -> Option<Sensor> {
        self.state.read().await.sensors.iter().find(|s| &s.address == address).cloned()
    }

    /// Creates a default sensor and persists it. See SPEC_FULL §4.B for the
    /// exact defaults.
    pub async fn add(
        &self,
        address: Mac,
        capabilities: BTreeSet<Datatype>,
        capacity: u64,
        model: HardwareModel,
    ) -> Sensor {
        let sensor = Sensor {
            address,
            display_name: format!("Sensor {}", codec::mac_to_string(&address)),
            hardware_model: model,
            per_type_settings: default_settings_for(&capabilities),
            capabilities,
            collection_capacity_bytes: capacity,
            wake_up_interval_s: 3600,
            wake_up_interval_max_offset_s: 300,
            next_wake_up: None,
            device_active: false,
            battery_level: -1,
        };
        {
            let mut state = self.state.write().await;
            state.sensors.retain(|s| s.address != address);
            state.sensors.push(sensor.clone());
        }
        let _ = self.save().await;
        sensor
    }

    pub async fn remove(&self, address: &Mac) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let before = state.sensors.len();
        state.sensors.retain(|s| &s.address != address);
        if state.sensors.len() == before {
            return Err(RegistryError::NotFound(codec::mac_to_string(address)));
        }
        drop(state);
        self.save().await.map_err(|e| RegistryError::InvalidSetting(e.to_string()))
    }

    /// Update one setting path. See SPEC_FULL §4.B for the accepted paths.
    /// Every successful mutation triggers `save` (a single `save`, even for
    /// `SET-SENSOR-SETTINGS`'s per-pair application — see control.rs).
    pub async fn update_setting(&self, address: &Mac, path: &str, value_text: &str) -> Result<(), RegistryError> {
        let mut state = self.state.write().await;
        let sensor = state
            .sensors
            .iter_mut()
            .find(|s| &s.address == address)
            .ok_or_else(|| RegistryError::NotFound(codec::mac_to_string(address)))?;
        apply_setting(sensor, path, value_text)?;
        drop(state);
        self.save().await.map_err(|e| RegistryError::InvalidSetting(e.to_string()))
    }

    pub async fn touch_last_seen(&self, address: &Mac, activity: Activity) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.history.iter_mut().find(|h| &h.address == address) {
            entry.last_seen = Utc::now();
            entry.last_activity = activity;
        } else {
            state.history.push(SensorLastSeen { address: *address, last_seen: Utc::now(), last_activity: activity });
        }
        drop(state);
        let _ = self.save().await;
    }

    pub async fn last_seen(&self, address: &Mac) -> Option<SensorLastSeen> {
        self.state.read().await.history.iter().find(|h| &h.address == address).cloned()
    }
}

fn apply_setting(sensor: &mut Sensor, path: &str, value_text: &str) -> Result<(), RegistryError> {
    match path {
        "auto" => {
            sensor.reset_to_defaults();
            return Ok(());
        }
        "name" => {
            sensor.display_name = value_text.to_string();
            return Ok(());
        }
        "device_active" => {
            sensor.device_active = parse_bool(path, value_text)?;
            return Ok(());
        }
        "wake_up_interval" => {
            let new_interval = parse_u32(path, value_text)?;
            if sensor.wake_up_interval_max_offset_s >= new_interval {
                return Err(RegistryError::RangeError {
                    path: path.to_string(),
                    value: value_text.to_string(),
                    reason: "wake_up_interval must exceed wake_up_interval_max_offset".to_string(),
                });
            }
            sensor.wake_up_interval_s = new_interval;
            return Ok(());
        }
        "wake_up_interval_max_offset" => {
            let new_offset = parse_u32(path, value_text)?;
            if new_offset >= sensor.wake_up_interval_s {
                return Err(RegistryError::RangeError {
                    path: path.to_string(),
                    value: value_text.to_string(),
                    reason: "wake_up_interval_max_offset must be less than wake_up_interval".to_string(),
                });
            }
            sensor.wake_up_interval_max_offset_s = new_offset;
            return Ok(());
        }
        _ => {}
    }

    let (prefix, field) = path.split_once('_').ok_or_else(|| RegistryError::InvalidSetting(path.to_string()))?;
    let datatype = Datatype::from_setting_prefix(prefix).ok_or_else(|| RegistryError::InvalidSetting(path.to_string()))?;
    if datatype == Datatype::Temperature && field != "active" {
        return Err(RegistryError::InvalidSetting(path.to_string()));
    }
    let setting = sensor
        .per_type_settings
        .get_mut(&datatype)
        .ok_or_else(|| RegistryError::InvalidSetting(path.to_string()))?;
    match field {
        "active" => setting.active = parse_bool(path, value_text)?,
        "sampling_frequency" => setting.sampling_frequency_hz = parse_u32(path, value_text)?,
        "sampling_duration" => {
            setting.sampling_duration_s = parse_u32(path, value_text)?
                .try_into()
                .map_err(|_| RegistryError::RangeError {
                    path: path.to_string(),
                    value: value_text.to_string(),
                    reason: "sampling_duration overflows u16".to_string(),
                })?;
        }
        _ => return Err(RegistryError::InvalidSetting(path.to_string())),
    }
    sensor.check_capacity()?;
    Ok(())
}

fn parse_bool(path: &str, value_text: &str) -> Result<bool, RegistryError> {
    match value_text {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(RegistryError::RangeError {
            path: path.to_string(),
            value: value_text.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_u32(path: &str, value_text: &str) -> Result<u32, RegistryError> {
    value_text.parse().map_err(|_| RegistryError::RangeError {
        path: path.to_string(),
        value: value_text.to_string(),
        reason: "expected an unsigned integer".to_string(),
    })
}

async fn read_json_or_default<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> std::io::Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e),
    }
}

/// Serialize-then-replace: write to a sibling `.tmp` file, then rename over
/// the destination, so a crash never leaves a half-written file. Group-
/// readable permissions per SPEC_FULL §6.
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp_path, &json).await?;
    set_group_readable(&tmp_path).await;
    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(unix)]
async fn set_group_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mut perms = metadata.permissions();
        perms.set_mode(0o664);
        let _ = tokio::fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn set_group_readable(_path: &Path) {}
