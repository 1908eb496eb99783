#![cfg_attr(not(test), no_std)]

//! WLAB weather station firmware library
//!
//! Samples a DHT22 temperature/humidity sensor, aggregates the readings over a publish
//! period and ships the statistics to an MQTT broker. Everything except the `esp32c3`
//! modules is hardware independent and runs under the host test harness.

extern crate alloc;

pub mod aggregator;
pub mod config;
pub mod dht;
pub mod mqtt;
pub mod payload;
pub mod station;
pub mod timestamp;
pub mod watchdog;

#[cfg(feature = "esp32c3")]
pub mod hw;
#[cfg(feature = "esp32c3")]
pub mod wifi;

/// Project version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
