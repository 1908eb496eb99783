//! Station orchestration
//!
//! One [`Station::tick`] per main-loop round: sample the sensor when the measure period
//! has elapsed, feed both aggregation buffers, and publish the cycle summary once per
//! publish-period boundary minute.

use log::{error, info, warn};

use crate::aggregator::{AggregationBuffer, HUMIDITY_THRESHOLD, TEMPERATURE_THRESHOLD};
use crate::config::{Settings, AUTH_TOPIC, TELEMETRY_TOPIC};
use crate::dht::{DecodeError, SensorReading};
use crate::mqtt::{PublishError, TelemetryClient};
use crate::payload::{self, AuthPayload, SerieIds, TelemetryPayload};

/// Registration attempts before the station resets
pub const AUTHORIZE_ATTEMPTS: u32 = 8;
/// Startup window for the first broker session
pub const FIRST_CONNECT_WINDOW_SECS: u64 = 30;

/// Source of temperature/humidity readings
#[allow(async_fn_in_trait)]
pub trait Sensor {
    async fn read(&mut self) -> Result<SensorReading, DecodeError>;
}

/// Sink for outbound messages
#[allow(async_fn_in_trait)]
pub trait Publisher {
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

impl Publisher for TelemetryClient<'_> {
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        TelemetryClient::publish(self, topic, payload).await
    }
}

/// Fires once in every minute that is a multiple of the publish period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleBoundary {
    period_minutes: u32,
    /// Absolute minute (epoch seconds / 60) of the last boundary that fired
    last_minute: Option<u64>,
}

impl CycleBoundary {
    pub const fn new(period_minutes: u32) -> Self {
        Self {
            period_minutes: if period_minutes == 0 { 1 } else { period_minutes },
            last_minute: None,
        }
    }

    /// `true` the first time `now` (epoch seconds) falls into a boundary minute
    pub fn check(&mut self, now: u64) -> bool {
        let minute = now / 60;
        let minute_of_hour = minute % 60;
        if minute_of_hour % u64::from(self.period_minutes) != 0 || self.last_minute == Some(minute) {
            return false;
        }
        self.last_minute = Some(minute);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Measure period not elapsed yet
    Throttled,
    SensorFailed(DecodeError),
    Sampled {
        temperature_accepted: bool,
        humidity_accepted: bool,
    },
    /// Boundary reached and the summary was handed to the publisher
    Published(Result<(), PublishError>),
    /// Boundary reached with empty buffers
    NothingToPublish,
}

pub struct Station<'a, S: Sensor, P: Publisher> {
    sensor: S,
    publisher: P,
    settings: &'a Settings,
    uid: &'a str,
    temperature: AggregationBuffer,
    humidity: AggregationBuffer,
    boundary: CycleBoundary,
    last_sample: Option<u64>,
}

impl<'a, S: Sensor, P: Publisher> Station<'a, S, P> {
    pub fn new(sensor: S, publisher: P, settings: &'a Settings, uid: &'a str) -> Self {
        let period = settings.publish_period_mins;
        Self {
            sensor,
            publisher,
            settings,
            uid,
            temperature: AggregationBuffer::new(period),
            humidity: AggregationBuffer::new(period),
            boundary: CycleBoundary::new(period),
            last_sample: None,
        }
    }

    pub fn temperature(&self) -> &AggregationBuffer {
        &self.temperature
    }

    pub fn humidity(&self) -> &AggregationBuffer {
        &self.humidity
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publisher_mut(&mut self) -> &mut P {
        &mut self.publisher
    }

    /// Publish the registration message
    pub async fn authorize(&mut self) -> Result<(), PublishError> {
        let settings = self.settings;
        let auth = AuthPayload {
            timezone: &settings.timezone,
            longitude: settings.longitude,
            latitude: settings.latitude,
            serie: SerieIds::default(),
            name: &settings.station_name,
            description: &settings.description,
            uid: self.uid,
        };
        let bytes = payload::to_json(&auth)?;

        info!("[WLAB] Registering station {}", self.uid);
        self.publisher.publish(AUTH_TOPIC, &bytes).await
    }

    /// One orchestration round at `now` (epoch seconds)
    pub async fn tick(&mut self, now: u64) -> TickOutcome {
        let measure_period = u64::from(self.settings.measure_period_secs);
        if self
            .last_sample
            .is_some_and(|last| now.saturating_sub(last) < measure_period)
        {
            return TickOutcome::Throttled;
        }
        self.last_sample = Some(now);

        let reading = match self.sensor.read().await {
            Ok(reading) => reading,
            Err(e) => {
                error!("[WLAB] Sensor read failed: {}", e);
                return TickOutcome::SensorFailed(e);
            }
        };

        let ts = u32::try_from(now).unwrap_or(u32::MAX);
        let temperature_accepted =
            self.temperature
                .commit(i32::from(reading.temperature), ts, TEMPERATURE_THRESHOLD);
        let humidity_accepted =
            self.humidity
                .commit(i32::from(reading.humidity), ts, HUMIDITY_THRESHOLD);

        if !self.boundary.check(now) {
            return TickOutcome::Sampled {
                temperature_accepted,
                humidity_accepted,
            };
        }

        self.publish_cycle().await
    }

    async fn publish_cycle(&mut self) -> TickOutcome {
        let temperature = self.temperature.flush();
        let humidity = self.humidity.flush();

        let (Some(temperature), Some(humidity)) = (temperature, humidity) else {
            warn!("[WLAB] Cycle boundary with nothing to publish");
            return TickOutcome::NothingToPublish;
        };

        let telemetry = TelemetryPayload::new(self.uid, &temperature, &humidity);
        let result = match payload::to_json(&telemetry) {
            Ok(bytes) => self.publisher.publish(TELEMETRY_TOPIC, &bytes).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => info!(
                "[WLAB] Published cycle {}: {} temperature / {} humidity samples",
                telemetry.ts, temperature.count, humidity.count
            ),
            Err(e) => error!("[WLAB] Cycle {} not published: {}", telemetry.ts, e),
        }
        TickOutcome::Published(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigStore, MemoryStore};
    use embassy_futures::block_on;
    use std::string::String;
    use std::vec::Vec;

    // 2023-11-14 22:20:00 UTC, minute 20
    const T0: u64 = 1_700_000_400;

    struct Constant(SensorReading);

    impl Sensor for Constant {
        async fn read(&mut self) -> Result<SensorReading, DecodeError> {
            Ok(self.0)
        }
    }

    /// Replays `readings` in order, repeating the last one
    struct Scripted(Vec<SensorReading>);

    impl Sensor for Scripted {
        async fn read(&mut self) -> Result<SensorReading, DecodeError> {
            if self.0.len() > 1 {
                Ok(self.0.remove(0))
            } else {
                self.0.first().copied().ok_or(DecodeError::Timeout)
            }
        }
    }

    struct Failing;

    impl Sensor for Failing {
        async fn read(&mut self) -> Result<SensorReading, DecodeError> {
            Err(DecodeError::ChecksumInvalid)
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(String, String)>,
        fail: Option<PublishError>,
    }

    impl Publisher for Recorder {
        async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
            if let Some(e) = self.fail {
                return Err(e);
            }
            let text = core::str::from_utf8(payload).unwrap();
            self.sent.push((topic.into(), text.into()));
            Ok(())
        }
    }

    fn settings(period: u32) -> Settings {
        let mut store = MemoryStore::new();
        store
            .set_u32(crate::config::ConfigKey::PublishPeriodMins, period)
            .unwrap();
        Settings::load(&store)
    }

    fn reading(temperature: i16, humidity: u16) -> SensorReading {
        SensorReading {
            temperature,
            humidity,
        }
    }

    #[test]
    fn boundary_fires_once_per_boundary_minute() {
        let mut boundary = CycleBoundary::new(10);
        assert!(boundary.check(T0));
        assert!(!boundary.check(T0 + 30));
        assert!(!boundary.check(T0 + 59));
        assert!(!boundary.check(T0 + 60));
        assert!(!boundary.check(T0 + 599));
        assert!(boundary.check(T0 + 600));
    }

    #[test]
    fn boundary_fires_at_minute_zero() {
        let mut boundary = CycleBoundary::new(10);
        let top_of_hour = T0 - 20 * 60;
        assert!(boundary.check(top_of_hour));
        assert!(!boundary.check(top_of_hour + 1));
    }

    #[test]
    fn hourly_period_fires_every_hour() {
        let mut boundary = CycleBoundary::new(60);
        let top_of_hour = T0 - 20 * 60;
        assert!(boundary.check(top_of_hour));
        assert!(!boundary.check(top_of_hour + 59));
        assert!(!boundary.check(top_of_hour + 1800));
        assert!(boundary.check(top_of_hour + 3600));
        assert!(!boundary.check(top_of_hour + 3630));
        assert!(boundary.check(top_of_hour + 7200));
    }

    #[test]
    fn missed_boundary_does_not_block_the_next_one() {
        let mut boundary = CycleBoundary::new(30);
        let top_of_hour = T0 - 20 * 60;
        assert!(boundary.check(top_of_hour));
        // No tick lands in the :30 minute
        assert!(!boundary.check(top_of_hour + 31 * 60));
        assert!(boundary.check(top_of_hour + 3600));
    }

    #[test]
    fn summary_carries_minute_truncated_extrema_timestamps() {
        let settings = settings(10);
        let sensor = Scripted(vec![
            reading(230, 450),
            reading(228, 440),
            reading(236, 470),
            reading(232, 455),
        ]);
        let mut station = Station::new(sensor, Recorder::default(), &settings, "uid");

        block_on(async {
            // 22:21:15, 22:22:17, 22:24:10, then the 22:30 boundary
            station.tick(T0 + 75).await;
            station.tick(T0 + 137).await;
            station.tick(T0 + 250).await;
            assert_eq!(station.tick(T0 + 607).await, TickOutcome::Published(Ok(())));
        });

        let (_, json) = &station.publisher().sent[0];
        assert!(json.contains(r#""TS":1700000400,"#));
        assert!(json.contains(
            r#""Temperature":{"f_avg":"23.1","f_act":"23.0","f_min":"22.8","f_max":"23.6","i_min_ts":1700000520,"i_max_ts":1700000640}"#
        ));
        assert!(json.contains(
            r#""Humidity":{"f_avg":"45.3","f_act":"45.0","f_min":"44.0","f_max":"47.0","i_min_ts":1700000520,"i_max_ts":1700000640}"#
        ));
    }

    #[test]
    fn hourly_period_publishes_every_hour() {
        let settings = settings(60);
        assert_eq!(settings.publish_period_mins, 60);
        let mut station = Station::new(Constant(reading(210, 600)), Recorder::default(), &settings, "uid");
        let top_of_hour = T0 - 20 * 60;

        block_on(async {
            for now in top_of_hour + 60..top_of_hour + 3 * 3600 + 30 {
                station.tick(now).await;
            }
        });

        let stamps: Vec<&str> = station
            .publisher()
            .sent
            .iter()
            .map(|(_, json)| &json[json.find("\"TS\":").unwrap() + 5..json.find(",\"SERIE\"").unwrap()])
            .collect();
        assert_eq!(stamps, ["1699999200", "1700002800", "1700006400"]);
    }

    #[test]
    fn constant_readings_publish_one_summary_per_period() {
        let settings = settings(10);
        let mut station = Station::new(Constant(reading(235, 450)), Recorder::default(), &settings, "A0B1C2D3E4F5");

        block_on(async {
            let mut now = T0 + 60;
            while now < T0 + 660 {
                station.tick(now).await;
                now += 1;
            }
        });

        let sent = &station.publisher().sent;
        assert_eq!(sent.len(), 1);
        let (topic, json) = &sent[0];
        assert_eq!(topic, TELEMETRY_TOPIC);
        assert!(json.starts_with(r#"{"UID":"A0B1C2D3E4F5","TS":1700000400,"#));
        assert!(json.contains(
            r#""Temperature":{"f_avg":"23.5","f_act":"23.5","f_min":"23.5","f_max":"23.5","#
        ));
        assert!(json.contains(
            r#""Humidity":{"f_avg":"45.0","f_act":"45.0","f_min":"45.0","f_max":"45.0","#
        ));
    }

    #[test]
    fn at_most_one_publish_per_minute() {
        let settings = settings(1);
        let mut station = Station::new(Constant(reading(200, 500)), Recorder::default(), &settings, "uid");

        let published = block_on(async {
            let mut published = 0;
            for now in T0..T0 + 180 {
                if let TickOutcome::Published(Ok(())) = station.tick(now).await {
                    published += 1;
                }
            }
            published
        });

        assert_eq!(published, 3);
        assert_eq!(station.publisher().sent.len(), 3);
    }

    #[test]
    fn sampling_is_throttled_by_measure_period() {
        let settings = settings(10);
        let mut station = Station::new(Constant(reading(200, 500)), Recorder::default(), &settings, "uid");

        block_on(async {
            assert!(matches!(station.tick(T0 + 61).await, TickOutcome::Sampled { .. }));
            assert_eq!(station.tick(T0 + 62).await, TickOutcome::Throttled);
            assert_eq!(station.tick(T0 + 64).await, TickOutcome::Throttled);
            assert!(matches!(station.tick(T0 + 65).await, TickOutcome::Sampled { .. }));
        });
        assert_eq!(station.temperature().count(), 2);
    }

    #[test]
    fn sensor_failure_contributes_nothing() {
        let settings = settings(10);
        let mut station = Station::new(Failing, Recorder::default(), &settings, "uid");

        let outcome = block_on(station.tick(T0));
        assert_eq!(outcome, TickOutcome::SensorFailed(DecodeError::ChecksumInvalid));
        assert!(station.temperature().is_empty());
        assert!(station.humidity().is_empty());
        assert!(station.publisher().sent.is_empty());
    }

    #[test]
    fn failed_publish_still_starts_a_new_cycle() {
        let settings = settings(10);
        let recorder = Recorder {
            fail: Some(PublishError::NotConnected),
            ..Recorder::default()
        };
        let mut station = Station::new(Constant(reading(200, 500)), recorder, &settings, "uid");

        let outcome = block_on(station.tick(T0));
        assert_eq!(outcome, TickOutcome::Published(Err(PublishError::NotConnected)));
        assert!(station.temperature().is_empty());
    }

    #[test]
    fn outliers_are_reported_per_channel() {
        let settings = settings(10);
        let mut station = Station::new(Constant(reading(200, 500)), Recorder::default(), &settings, "uid");

        block_on(async {
            for i in 0..5 {
                station.tick(T0 + 60 + 4 * i).await;
            }
            station.sensor.0 = reading(300, 510);
            assert_eq!(
                station.tick(T0 + 100).await,
                TickOutcome::Sampled {
                    temperature_accepted: false,
                    humidity_accepted: true
                }
            );
        });
        assert_eq!(station.temperature().rejected(), 1);
    }

    #[test]
    fn authorize_publishes_registration() {
        let settings = settings(10);
        let mut station = Station::new(Constant(reading(0, 0)), Recorder::default(), &settings, "A0B1C2D3E4F5");

        block_on(station.authorize()).unwrap();

        let (topic, json) = &station.publisher().sent[0];
        assert_eq!(topic, AUTH_TOPIC);
        assert!(json.contains(r#""serie":{"Temperature":1,"Humidity":2}"#));
        assert!(json.contains(r#""description":"DHT22","uid":"A0B1C2D3E4F5""#));
    }
}
