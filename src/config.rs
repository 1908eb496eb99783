//! Station configuration
//!
//! Values live in a key/value [`ConfigStore`]. [`Settings::load`] resolves every key once
//! at boot, falling back to compile-time defaults (see `build.rs`) and logging each
//! substitution.

use core::fmt::Write;

use embassy_time::Duration;
use heapless::{FnvIndexMap, String};
use log::{info, warn};

/// Topic of the one-shot registration message
pub const AUTH_TOPIC: &str = "/testauth";
/// Topic of periodic telemetry
pub const TELEMETRY_TOPIC: &str = "/testsamples";

/// Longest string value held by a store
pub const MAX_VALUE_LEN: usize = 64;

pub type ConfigString = String<MAX_VALUE_LEN>;

/// Compile-time defaults, injected by `build.rs`
pub mod defaults {
    pub const WIFI_SSID: &str = env!("WIFI_SSID");
    pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");
    pub const BROKER_HOST: &str = env!("WLAB_MQTT_BROKER");
    pub const BROKER_PORT: &str = env!("WLAB_MQTT_PORT");
    pub const STATION_NAME: &str = env!("WLAB_NAME");
    pub const TIMEZONE: &str = env!("WLAB_TIMEZONE");
    pub const LATITUDE: &str = env!("WLAB_LATITUDE");
    pub const LONGITUDE: &str = env!("WLAB_LONGITUDE");

    pub const DESCRIPTION: &str = "DHT22";
    pub const PING_INTERVAL_SECS: u32 = 60;
    pub const MAX_SILENCE_MINS: u32 = 120;
    pub const PUBLISH_PERIOD_MINS: u32 = 10;
    pub const MEASURE_PERIOD_SECS: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    WifiSsid,
    WifiPassword,
    BrokerHost,
    BrokerPort,
    PingIntervalSecs,
    MaxSilenceMins,
    /// Empty means "derive from the MAC address"
    DeviceId,
    StationName,
    Description,
    Timezone,
    Latitude,
    Longitude,
    PublishPeriodMins,
    MeasurePeriodSecs,
    BootCount,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 15] = [
        ConfigKey::WifiSsid,
        ConfigKey::WifiPassword,
        ConfigKey::BrokerHost,
        ConfigKey::BrokerPort,
        ConfigKey::PingIntervalSecs,
        ConfigKey::MaxSilenceMins,
        ConfigKey::DeviceId,
        ConfigKey::StationName,
        ConfigKey::Description,
        ConfigKey::Timezone,
        ConfigKey::Latitude,
        ConfigKey::Longitude,
        ConfigKey::PublishPeriodMins,
        ConfigKey::MeasurePeriodSecs,
        ConfigKey::BootCount,
    ];

    /// Storage name of the key
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::WifiSsid => "wifi.ssid",
            ConfigKey::WifiPassword => "wifi.password",
            ConfigKey::BrokerHost => "mqtt.broker",
            ConfigKey::BrokerPort => "mqtt.port",
            ConfigKey::PingIntervalSecs => "mqtt.ping_interval",
            ConfigKey::MaxSilenceMins => "mqtt.max_silence",
            ConfigKey::DeviceId => "wlab.device_id",
            ConfigKey::StationName => "wlab.name",
            ConfigKey::Description => "wlab.description",
            ConfigKey::Timezone => "wlab.timezone",
            ConfigKey::Latitude => "wlab.latitude",
            ConfigKey::Longitude => "wlab.longitude",
            ConfigKey::PublishPeriodMins => "wlab.publish_period",
            ConfigKey::MeasurePeriodSecs => "wlab.measure_period",
            ConfigKey::BootCount => "sys.boot_count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("config key not found")]
    NotFound,
    #[error("config value too long")]
    ValueTooLong,
    #[error("config store full")]
    StoreFull,
}

/// Typed key/value storage for configuration
pub trait ConfigStore {
    fn get_str(&self, key: ConfigKey) -> Result<ConfigString, ConfigError>;
    fn get_u32(&self, key: ConfigKey) -> Result<u32, ConfigError>;
    fn set_str(&mut self, key: ConfigKey, value: &str) -> Result<(), ConfigError>;
    fn set_u32(&mut self, key: ConfigKey, value: u32) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredValue {
    Str(ConfigString),
    U32(u32),
}

/// RAM-backed store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: FnvIndexMap<ConfigKey, StoredValue, 16>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn put(&mut self, key: ConfigKey, value: StoredValue) -> Result<(), ConfigError> {
        self.entries
            .insert(key, value)
            .map(|_| ())
            .map_err(|_| ConfigError::StoreFull)
    }
}

impl ConfigStore for MemoryStore {
    fn get_str(&self, key: ConfigKey) -> Result<ConfigString, ConfigError> {
        match self.entries.get(&key) {
            Some(StoredValue::Str(value)) => Ok(value.clone()),
            _ => Err(ConfigError::NotFound),
        }
    }

    fn get_u32(&self, key: ConfigKey) -> Result<u32, ConfigError> {
        match self.entries.get(&key) {
            Some(StoredValue::U32(value)) => Ok(*value),
            _ => Err(ConfigError::NotFound),
        }
    }

    fn set_str(&mut self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        let value = ConfigString::try_from(value).map_err(|_| ConfigError::ValueTooLong)?;
        self.put(key, StoredValue::Str(value))
    }

    fn set_u32(&mut self, key: ConfigKey, value: u32) -> Result<(), ConfigError> {
        self.put(key, StoredValue::U32(value))
    }
}

/// Bump the stored boot counter and return the new value
pub fn record_boot(store: &mut impl ConfigStore) -> Result<u32, ConfigError> {
    let count = match store.get_u32(ConfigKey::BootCount) {
        Ok(count) => count.wrapping_add(1),
        Err(ConfigError::NotFound) => 1,
        Err(e) => return Err(e),
    };
    store.set_u32(ConfigKey::BootCount, count)?;
    Ok(count)
}

/// Fully resolved station settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub wifi_ssid: ConfigString,
    pub wifi_password: ConfigString,
    pub broker_host: ConfigString,
    pub broker_port: u16,
    pub ping_interval_secs: u32,
    pub max_silence_mins: u32,
    pub device_id: ConfigString,
    pub station_name: ConfigString,
    pub description: ConfigString,
    pub timezone: ConfigString,
    pub latitude: f32,
    pub longitude: f32,
    /// Always a divisor of 60
    pub publish_period_mins: u32,
    pub measure_period_secs: u32,
}

fn text(value: &str) -> ConfigString {
    let mut out = ConfigString::new();
    for c in value.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

fn load_str<S: ConfigStore>(store: &S, key: ConfigKey, default: &str) -> ConfigString {
    match store.get_str(key) {
        Ok(value) => value,
        Err(e) => {
            warn!("[CFG] {}: {}, using default {:?}", key.name(), e, default);
            text(default)
        }
    }
}

fn load_u32<S: ConfigStore>(store: &S, key: ConfigKey, default: u32) -> u32 {
    match store.get_u32(key) {
        Ok(value) => value,
        Err(e) => {
            warn!("[CFG] {}: {}, using default {}", key.name(), e, default);
            default
        }
    }
}

fn load_coordinate<S: ConfigStore>(store: &S, key: ConfigKey, default: &str) -> f32 {
    let raw = load_str(store, key, default);
    raw.trim()
        .parse::<f32>()
        .or_else(|_| {
            warn!("[CFG] {}: cannot parse {:?}, using default {}", key.name(), raw, default);
            default.trim().parse::<f32>()
        })
        .unwrap_or(0.0)
}

impl Settings {
    /// Resolve every key from `store`
    pub fn load<S: ConfigStore>(store: &S) -> Self {
        let default_port = defaults::BROKER_PORT.parse::<u16>().unwrap_or(1883);
        let broker_port = load_u32(store, ConfigKey::BrokerPort, u32::from(default_port));
        let broker_port = u16::try_from(broker_port).unwrap_or_else(|_| {
            warn!("[CFG] mqtt.port {} out of range, using {}", broker_port, default_port);
            default_port
        });

        let publish_period_mins = load_u32(
            store,
            ConfigKey::PublishPeriodMins,
            defaults::PUBLISH_PERIOD_MINS,
        );
        let publish_period_mins = if publish_period_mins == 0 || 60 % publish_period_mins != 0 {
            warn!(
                "[CFG] Publish period {} does not divide an hour, using {}",
                publish_period_mins,
                defaults::PUBLISH_PERIOD_MINS
            );
            defaults::PUBLISH_PERIOD_MINS
        } else {
            publish_period_mins
        };

        let measure_period_secs = load_u32(
            store,
            ConfigKey::MeasurePeriodSecs,
            defaults::MEASURE_PERIOD_SECS,
        )
        .max(1);

        let settings = Self {
            wifi_ssid: load_str(store, ConfigKey::WifiSsid, defaults::WIFI_SSID),
            wifi_password: load_str(store, ConfigKey::WifiPassword, defaults::WIFI_PASSWORD),
            broker_host: load_str(store, ConfigKey::BrokerHost, defaults::BROKER_HOST),
            broker_port,
            ping_interval_secs: load_u32(
                store,
                ConfigKey::PingIntervalSecs,
                defaults::PING_INTERVAL_SECS,
            )
            .max(1),
            max_silence_mins: load_u32(store, ConfigKey::MaxSilenceMins, defaults::MAX_SILENCE_MINS),
            device_id: load_str(store, ConfigKey::DeviceId, ""),
            station_name: load_str(store, ConfigKey::StationName, defaults::STATION_NAME),
            description: load_str(store, ConfigKey::Description, defaults::DESCRIPTION),
            timezone: load_str(store, ConfigKey::Timezone, defaults::TIMEZONE),
            latitude: load_coordinate(store, ConfigKey::Latitude, defaults::LATITUDE),
            longitude: load_coordinate(store, ConfigKey::Longitude, defaults::LONGITUDE),
            publish_period_mins,
            measure_period_secs,
        };

        info!(
            "[CFG] Broker {}:{}, publish every {} min, sample every {} s",
            settings.broker_host,
            settings.broker_port,
            settings.publish_period_mins,
            settings.measure_period_secs
        );
        settings
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.ping_interval_secs))
    }

    pub fn max_silence(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_silence_mins) * 60)
    }

    /// Station uid: the configured device id, or the MAC-derived id when empty
    pub fn station_uid(&self, mac: [u8; 6]) -> ConfigString {
        if self.device_id.is_empty() {
            let mut uid = ConfigString::new();
            // 12 hex digits always fit
            let _ = uid.push_str(&mac_id_string(mac));
            uid
        } else {
            self.device_id.clone()
        }
    }
}

/// MAC address as 12 upper-case hex digits
pub fn mac_id_string(mac: [u8; 6]) -> String<12> {
    let mut out = String::new();
    for byte in mac {
        let _ = write!(out, "{:02X}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_resolves_to_defaults() {
        let settings = Settings::load(&MemoryStore::new());

        assert_eq!(settings.broker_host.as_str(), defaults::BROKER_HOST);
        assert_eq!(settings.broker_port, 1883);
        assert_eq!(settings.ping_interval_secs, 60);
        assert_eq!(settings.max_silence_mins, 120);
        assert_eq!(settings.publish_period_mins, 10);
        assert_eq!(settings.measure_period_secs, 4);
        assert_eq!(settings.description.as_str(), "DHT22");
        assert_eq!(settings.station_name.as_str(), defaults::STATION_NAME);
        assert!(settings.device_id.is_empty());
        assert_eq!(settings.max_silence(), Duration::from_secs(7200));
    }

    #[test]
    fn stored_values_win() {
        let mut store = MemoryStore::new();
        store.set_str(ConfigKey::BrokerHost, "10.0.0.2").unwrap();
        store.set_u32(ConfigKey::BrokerPort, 8883).unwrap();
        store.set_u32(ConfigKey::PublishPeriodMins, 15).unwrap();
        store.set_str(ConfigKey::Latitude, "52.23").unwrap();
        store.set_str(ConfigKey::DeviceId, "station-7").unwrap();

        let settings = Settings::load(&store);
        assert_eq!(settings.broker_host.as_str(), "10.0.0.2");
        assert_eq!(settings.broker_port, 8883);
        assert_eq!(settings.publish_period_mins, 15);
        assert!((settings.latitude - 52.23).abs() < 1e-4);
        assert_eq!(settings.station_uid([0; 6]).as_str(), "station-7");
    }

    #[test]
    fn invalid_values_fall_back() {
        let mut store = MemoryStore::new();
        store.set_u32(ConfigKey::PublishPeriodMins, 7).unwrap();
        store.set_u32(ConfigKey::BrokerPort, 70_000).unwrap();
        store.set_str(ConfigKey::Longitude, "east").unwrap();
        store.set_u32(ConfigKey::MeasurePeriodSecs, 0).unwrap();

        let settings = Settings::load(&store);
        assert_eq!(settings.publish_period_mins, 10);
        assert_eq!(settings.broker_port, 1883);
        assert_eq!(settings.longitude, defaults::LONGITUDE.parse::<f32>().unwrap());
        assert_eq!(settings.measure_period_secs, 1);
    }

    #[test]
    fn mismatched_type_reads_as_missing() {
        let mut store = MemoryStore::new();
        store.set_str(ConfigKey::BrokerPort, "1883").unwrap();
        assert_eq!(store.get_u32(ConfigKey::BrokerPort), Err(ConfigError::NotFound));
        assert_eq!(store.get_str(ConfigKey::WifiSsid), Err(ConfigError::NotFound));
    }

    #[test]
    fn store_rejects_long_values_and_overwrites_in_place() {
        let mut store = MemoryStore::new();
        let long = [b'a'; MAX_VALUE_LEN + 1];
        let long = core::str::from_utf8(&long).unwrap();
        assert_eq!(
            store.set_str(ConfigKey::StationName, long),
            Err(ConfigError::ValueTooLong)
        );

        store.set_u32(ConfigKey::BrokerPort, 1).unwrap();
        store.set_u32(ConfigKey::BrokerPort, 2).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_u32(ConfigKey::BrokerPort), Ok(2));
    }

    #[test]
    fn every_key_fits_the_store() {
        let mut store = MemoryStore::new();
        for key in ConfigKey::ALL {
            store.set_u32(key, 1).unwrap();
        }
        assert_eq!(store.len(), ConfigKey::ALL.len());
    }

    #[test]
    fn boot_count_starts_at_one_and_increments() {
        let mut store = MemoryStore::new();
        assert_eq!(record_boot(&mut store), Ok(1));
        assert_eq!(record_boot(&mut store), Ok(2));
        assert_eq!(store.get_u32(ConfigKey::BootCount), Ok(2));

        store.set_u32(ConfigKey::BootCount, u32::MAX).unwrap();
        assert_eq!(record_boot(&mut store), Ok(0));
    }

    #[test]
    fn mac_id_is_upper_hex() {
        let mac = [0xa0, 0xb1, 0xc2, 0x03, 0xe4, 0xf5];
        assert_eq!(mac_id_string(mac).as_str(), "A0B1C203E4F5");

        let settings = Settings::load(&MemoryStore::new());
        assert_eq!(settings.station_uid(mac).as_str(), "A0B1C203E4F5");
    }
}
