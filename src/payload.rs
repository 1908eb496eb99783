//! JSON payloads understood by the wlab backend
//!
//! Field names and ordering are part of the wire contract. Aggregated values travel
//! as one-decimal strings (`"-17.0"`), never as raw floats.

use alloc::vec::Vec;
use core::fmt::{self, Write};

use heapless::String;
use serde::{Serialize, Serializer};

use crate::aggregator::FlushSummary;
use crate::mqtt::PublishError;

/// Series id of the temperature channel at registration
pub const TEMPERATURE_SERIE: u8 = 1;
/// Series id of the humidity channel at registration
pub const HUMIDITY_SERIE: u8 = 2;

/// Fixed-point value in tenths, rendered with exactly one decimal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tenths(pub i32);

impl fmt::Display for Tenths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(f, "{}{}.{}", sign, magnitude / 10, magnitude % 10)
    }
}

impl Serialize for Tenths {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // "-214748364.8" is the longest rendering
        let mut text: String<16> = String::new();
        write!(text, "{}", self).map_err(|_| serde::ser::Error::custom("tenths overflow"))?;
        serializer.serialize_str(&text)
    }
}

/// Series ids announced at registration
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SerieIds {
    #[serde(rename = "Temperature")]
    pub temperature: u8,
    #[serde(rename = "Humidity")]
    pub humidity: u8,
}

impl Default for SerieIds {
    fn default() -> Self {
        Self {
            temperature: TEMPERATURE_SERIE,
            humidity: HUMIDITY_SERIE,
        }
    }
}

/// Station registration message
#[derive(Debug, Clone, Serialize)]
pub struct AuthPayload<'a> {
    pub timezone: &'a str,
    pub longitude: f32,
    pub latitude: f32,
    pub serie: SerieIds,
    pub name: &'a str,
    pub description: &'a str,
    pub uid: &'a str,
}

/// Statistics of one channel over a publish period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub f_avg: Tenths,
    pub f_act: Tenths,
    pub f_min: Tenths,
    pub f_max: Tenths,
    pub i_min_ts: u32,
    pub i_max_ts: u32,
}

impl From<&FlushSummary> for ChannelStats {
    fn from(summary: &FlushSummary) -> Self {
        Self {
            f_avg: Tenths(summary.avg),
            f_act: Tenths(summary.first_value),
            f_min: Tenths(summary.min),
            f_max: Tenths(summary.max),
            i_min_ts: summary.min_ts,
            i_max_ts: summary.max_ts,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TelemetrySerie {
    #[serde(rename = "Temperature")]
    pub temperature: ChannelStats,
    #[serde(rename = "Humidity")]
    pub humidity: ChannelStats,
}

/// Periodic telemetry message
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryPayload<'a> {
    #[serde(rename = "UID")]
    pub uid: &'a str,
    /// Start of the publish period the statistics cover
    #[serde(rename = "TS")]
    pub ts: u32,
    #[serde(rename = "SERIE")]
    pub serie: TelemetrySerie,
}

impl<'a> TelemetryPayload<'a> {
    /// Assemble from the flushed temperature and humidity buffers
    pub fn new(uid: &'a str, temperature: &FlushSummary, humidity: &FlushSummary) -> Self {
        Self {
            uid,
            ts: temperature.first_ts,
            serie: TelemetrySerie {
                temperature: temperature.into(),
                humidity: humidity.into(),
            },
        }
    }
}

/// Serialize a payload into publish bytes
pub fn to_json<T: Serialize>(payload: &T) -> Result<Vec<u8>, PublishError> {
    serde_json::to_vec(payload).map_err(|_| PublishError::EncodeOverflow)
}
