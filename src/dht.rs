//! DHT22 / AM2302 single-wire sensor driver
//!
//! The host pulls the data line low for 18 ms, releases it and timestamps every
//! falling edge from the GPIO interrupt. The sensor answers with a preamble and
//! 40 data bits; each bit is the interval between two falling edges (~78 µs for
//! a 0, ~120 µs for a 1). [`EdgeCapture`] is the handoff between the interrupt
//! handler and the awaiting [`Dht22::read`] call.

use core::cell::RefCell;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer, with_timeout};
use embedded_hal::digital::OutputPin;
use log::{debug, error, info};

use crate::station::Sensor;

/// Host start pulse length
pub const START_PULSE_MS: u64 = 18;
/// Time allowed for the sensor to deliver the whole frame
pub const READ_TIMEOUT_MS: u64 = 50;
/// Falling edges of the sensor response preamble, discarded
pub const PREAMBLE_EDGES: u32 = 2;
/// Data bits per frame, checksum included
pub const DATA_BITS: u32 = 40;
/// Falling edges that make up a complete frame
pub const EXPECTED_EDGES: u32 = PREAMBLE_EDGES + DATA_BITS;
/// An edge interval above this closes the preamble (80 µs low + 80 µs high)
pub const PREAMBLE_MIN_US: u32 = 100;
/// Falling-to-falling interval at or above this is a 1 bit
pub const BIT_ONE_MIN_US: u32 = 110;

/// Sensor decode failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// GPIO line could not be driven
    #[error("sensor line not ready")]
    NotReady,
    /// Not enough edges arrived inside the read window
    #[error("sensor frame timed out")]
    Timeout,
    /// Checksum mismatch or degenerate all-zero checksum
    #[error("sensor frame checksum invalid")]
    ChecksumInvalid,
}

impl DecodeError {
    /// Whether the next read has a chance of succeeding
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DecodeError::NotReady)
    }
}

/// One sensor sample, both channels in tenths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorReading {
    /// Temperature in tenths of a degree Celsius
    pub temperature: i16,
    /// Relative humidity in tenths of a percent
    pub humidity: u16,
}

/// Raw frame as accumulated by the edge interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecodedFrame {
    /// Data bits, most significant first, checksum in the low byte
    pub bits: u64,
    /// Falling edges counted so far, preamble included
    pub edges: u32,
    /// Interval of the most recent edge, kept for diagnostics
    pub last_interval_us: u32,
}

impl DecodedFrame {
    /// Build a complete frame from its five bytes
    pub fn from_bytes(bytes: [u8; 5]) -> Self {
        let bits = bytes
            .iter()
            .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte));
        Self {
            bits,
            edges: EXPECTED_EDGES,
            last_interval_us: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.edges == EXPECTED_EDGES
    }

    /// Humidity hi/lo, temperature hi/lo, checksum
    pub fn bytes(&self) -> [u8; 5] {
        let b = self.bits.to_be_bytes();
        [b[3], b[4], b[5], b[6], b[7]]
    }

    pub fn checksum(&self) -> u8 {
        self.bits as u8
    }

    /// Checksum is the low byte of the sum of the four data bytes; zero is noise.
    pub fn checksum_valid(&self) -> bool {
        let [h_hi, h_lo, t_hi, t_lo, checksum] = self.bytes();
        let sum = u16::from(h_hi) + u16::from(h_lo) + u16::from(t_hi) + u16::from(t_lo);
        checksum != 0 && (sum & 0xFF) as u8 == checksum
    }

    /// Validate the frame and convert it into a reading
    pub fn decode(&self) -> Result<SensorReading, DecodeError> {
        if !self.is_complete() {
            return Err(DecodeError::Timeout);
        }

        if !self.checksum_valid() {
            return Err(DecodeError::ChecksumInvalid);
        }

        let humidity = ((self.bits >> 24) & 0xFFFF) as u16;
        let raw_temperature = ((self.bits >> 8) & 0xFFFF) as u16;

        // Sign-magnitude, not two's complement
        let magnitude = (raw_temperature & 0x7FFF) as i16;
        let temperature = if raw_temperature & 0x8000 != 0 {
            -magnitude
        } else {
            magnitude
        };

        Ok(SensorReading {
            temperature,
            humidity,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CaptureState {
    frame: DecodedFrame,
    last_edge_us: u32,
    armed: bool,
}

impl CaptureState {
    const fn new() -> Self {
        Self {
            frame: DecodedFrame {
                bits: 0,
                edges: 0,
                last_interval_us: 0,
            },
            last_edge_us: 0,
            armed: false,
        }
    }
}

/// Single-producer / single-consumer handoff between the edge interrupt and the reader.
///
/// The interrupt side only ever calls [`EdgeCapture::on_falling_edge`]; the reader arms
/// the capture, awaits completion and takes the frame back with [`EdgeCapture::disarm`].
pub struct EdgeCapture {
    state: Mutex<RefCell<CaptureState>>,
    done: Signal<CriticalSectionRawMutex, ()>,
}

impl EdgeCapture {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(CaptureState::new())),
            done: Signal::new(),
        }
    }

    /// Clear the accumulator and start timing edges from `now_us`
    pub fn arm(&self, now_us: u32) {
        self.done.reset();
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            *state = CaptureState::new();
            state.last_edge_us = now_us;
            state.armed = true;
        });
    }

    /// Edge interrupt entry point. Never blocks.
    pub fn on_falling_edge(&self, now_us: u32) {
        let complete = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if !state.armed || state.frame.edges >= EXPECTED_EDGES {
                return false;
            }

            let elapsed = now_us.wrapping_sub(state.last_edge_us);
            state.last_edge_us = now_us;
            state.frame.last_interval_us = elapsed;

            if state.frame.edges < PREAMBLE_EDGES {
                // The first falling edge comes ~30 µs after release and is sometimes
                // missed; either way the preamble ends on the first long interval.
                if elapsed > PREAMBLE_MIN_US {
                    state.frame.edges = PREAMBLE_EDGES;
                }
            } else {
                state.frame.bits = (state.frame.bits << 1) | u64::from(elapsed >= BIT_ONE_MIN_US);
                state.frame.edges += 1;
            }

            state.frame.edges == EXPECTED_EDGES
        });

        if complete {
            self.done.signal(());
        }
    }

    /// Wait until the interrupt side has seen a complete frame
    pub async fn wait_complete(&self) {
        self.done.wait().await
    }

    /// Stop accepting edges and return what was captured
    pub fn disarm(&self) -> DecodedFrame {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.armed = false;
            state.frame
        })
    }
}

impl Default for EdgeCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// Open-drain data line of the sensor.
///
/// `set_low` asserts the start pulse, `set_high` releases the line to the pull-up.
pub trait SensorLine: OutputPin {
    /// Microsecond clock used to timestamp edges
    fn now_us(&self) -> u32;
    /// Switch to input and enable the falling edge interrupt
    fn listen(&mut self);
    /// Disable the edge interrupt and return the line to idle
    fn unlisten(&mut self);
}

/// DHT22 driver. Reads take `&mut self`, so they cannot overlap.
pub struct Dht22<'a, L: SensorLine> {
    line: L,
    capture: &'a EdgeCapture,
}

impl<'a, L: SensorLine> Dht22<'a, L> {
    /// Take ownership of the line and park it released
    pub fn new(mut line: L, capture: &'a EdgeCapture) -> Result<Self, DecodeError> {
        line.set_high().map_err(|_| {
            error!("[DHT] Sensor gpio not ready");
            DecodeError::NotReady
        })?;
        Ok(Self { line, capture })
    }

    /// Run one start pulse / capture / decode cycle
    pub async fn read(&mut self) -> Result<SensorReading, DecodeError> {
        self.capture.disarm();

        self.line.set_low().map_err(|_| DecodeError::NotReady)?;
        Timer::after(Duration::from_millis(START_PULSE_MS)).await;

        self.line.set_high().map_err(|_| DecodeError::NotReady)?;
        self.capture.arm(self.line.now_us());
        self.line.listen();

        let waited = with_timeout(
            Duration::from_millis(READ_TIMEOUT_MS),
            self.capture.wait_complete(),
        )
        .await;

        self.line.unlisten();
        let frame = self.capture.disarm();

        if waited.is_err() {
            error!(
                "[DHT] Read failed, edges {}, last interval {}us",
                frame.edges, frame.last_interval_us
            );
            return Err(DecodeError::Timeout);
        }

        debug!("[DHT] Read done, edges {}, data {:010X}", frame.edges, frame.bits);

        match frame.decode() {
            Ok(reading) => {
                info!(
                    "[DHT] Temp {}, RH {}",
                    reading.temperature, reading.humidity
                );
                Ok(reading)
            }
            Err(e) => {
                error!("[DHT] Invalid checksum in fetched sample {:02X?}", frame.bytes());
                Err(e)
            }
        }
    }

    /// Give the line back
    pub fn release(self) -> L {
        self.line
    }
}

impl<L: SensorLine> Sensor for Dht22<'_, L> {
    async fn read(&mut self) -> Result<SensorReading, DecodeError> {
        Dht22::read(self).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::convert::Infallible;
    use std::vec::Vec;

    /// Falling-edge intervals a healthy sensor produces for `bytes`
    pub(crate) fn edge_intervals(bytes: [u8; 5], catch_first_edge: bool) -> Vec<u32> {
        let mut intervals = Vec::new();
        if catch_first_edge {
            intervals.push(30);
            intervals.push(160);
        } else {
            intervals.push(190);
        }
        for byte in bytes {
            for bit in (0..8).rev() {
                intervals.push(if byte & (1 << bit) != 0 { 120 } else { 78 });
            }
        }
        intervals
    }

    /// Line that replays recorded edge intervals into the capture when armed
    pub(crate) struct ReplayLine<'a> {
        pub capture: &'a EdgeCapture,
        pub intervals: Vec<u32>,
        pub pulses: u32,
    }

    impl embedded_hal::digital::ErrorType for ReplayLine<'_> {
        type Error = Infallible;
    }

    impl OutputPin for ReplayLine<'_> {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            self.pulses += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            Ok(())
        }
    }

    impl SensorLine for ReplayLine<'_> {
        fn now_us(&self) -> u32 {
            1_000
        }

        fn listen(&mut self) {
            let mut t = self.now_us();
            for interval in &self.intervals {
                t = t.wrapping_add(*interval);
                self.capture.on_falling_edge(t);
            }
        }

        fn unlisten(&mut self) {}
    }

    struct BrokenLine;

    impl embedded_hal::digital::ErrorType for BrokenLine {
        type Error = embedded_hal::digital::ErrorKind;
    }

    impl OutputPin for BrokenLine {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            Err(embedded_hal::digital::ErrorKind::Other)
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            Err(embedded_hal::digital::ErrorKind::Other)
        }
    }

    impl SensorLine for BrokenLine {
        fn now_us(&self) -> u32 {
            0
        }
        fn listen(&mut self) {}
        fn unlisten(&mut self) {}
    }

    fn with_checksum(data: [u8; 4]) -> [u8; 5] {
        let sum = data.iter().map(|&b| u16::from(b)).sum::<u16>();
        [data[0], data[1], data[2], data[3], sum as u8]
    }

    #[test]
    fn negative_temperature_is_sign_magnitude() {
        let frame = DecodedFrame::from_bytes(with_checksum([0x02, 0x08, 0x80, 0xAA]));
        assert_eq!(frame.checksum(), 0x34);
        assert_eq!(
            frame.decode(),
            Ok(SensorReading {
                temperature: -170,
                humidity: 520
            })
        );
    }

    #[test]
    fn positive_temperature() {
        let frame = DecodedFrame::from_bytes(with_checksum([0x01, 0xC2, 0x00, 0xEB]));
        assert_eq!(
            frame.decode(),
            Ok(SensorReading {
                temperature: 235,
                humidity: 450
            })
        );
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let mut bytes = with_checksum([0x02, 0x08, 0x80, 0xAA]);
        bytes[4] = bytes[4].wrapping_add(1);
        let frame = DecodedFrame::from_bytes(bytes);
        assert_eq!(frame.decode(), Err(DecodeError::ChecksumInvalid));
    }

    #[test]
    fn zero_checksum_is_rejected() {
        // Sums to 0x100, so the low byte matches but is zero
        let frame = DecodedFrame::from_bytes([0x80, 0x80, 0x00, 0x00, 0x00]);
        assert_eq!(frame.decode(), Err(DecodeError::ChecksumInvalid));

        let silent = DecodedFrame::from_bytes([0; 5]);
        assert_eq!(silent.decode(), Err(DecodeError::ChecksumInvalid));
    }

    #[test]
    fn incomplete_frame_is_a_timeout() {
        let mut frame = DecodedFrame::from_bytes(with_checksum([0x02, 0x08, 0x00, 0xAA]));
        frame.edges = 30;
        assert_eq!(frame.decode(), Err(DecodeError::Timeout));
    }

    #[test]
    fn capture_decodes_edge_intervals() {
        let bytes = with_checksum([0x02, 0x08, 0x80, 0xAA]);
        for catch_first_edge in [true, false] {
            let capture = EdgeCapture::new();
            capture.arm(500);
            let mut t = 500u32;
            for interval in edge_intervals(bytes, catch_first_edge) {
                t += interval;
                capture.on_falling_edge(t);
            }
            let frame = capture.disarm();
            assert!(frame.is_complete());
            assert_eq!(frame.bytes(), bytes);
        }
    }

    #[test]
    fn capture_ignores_edges_when_disarmed_or_full() {
        let capture = EdgeCapture::new();
        capture.on_falling_edge(200);
        assert_eq!(capture.disarm().edges, 0);

        let bytes = with_checksum([0x01, 0x02, 0x03, 0x04]);
        capture.arm(0);
        let mut t = 0u32;
        for interval in edge_intervals(bytes, true) {
            t += interval;
            capture.on_falling_edge(t);
        }
        // Trailing noise after the frame is complete
        capture.on_falling_edge(t + 120);
        capture.on_falling_edge(t + 240);
        let frame = capture.disarm();
        assert_eq!(frame.edges, EXPECTED_EDGES);
        assert_eq!(frame.bytes(), bytes);
    }

    #[test]
    fn capture_survives_timer_wraparound() {
        let bytes = with_checksum([0x02, 0x08, 0x80, 0xAA]);
        let capture = EdgeCapture::new();
        let start = u32::MAX - 1_000;
        capture.arm(start);
        let mut t = start;
        for interval in edge_intervals(bytes, true) {
            t = t.wrapping_add(interval);
            capture.on_falling_edge(t);
        }
        assert_eq!(capture.disarm().bytes(), bytes);
    }

    #[test]
    fn read_decodes_replayed_frame() {
        let capture = EdgeCapture::new();
        let bytes = with_checksum([0x02, 0x08, 0x80, 0xAA]);
        let line = ReplayLine {
            capture: &capture,
            intervals: edge_intervals(bytes, true),
            pulses: 0,
        };
        let mut dht = Dht22::new(line, &capture).unwrap();
        let reading = embassy_futures::block_on(dht.read()).unwrap();
        assert_eq!(reading.humidity, 520);
        assert_eq!(reading.temperature, -170);
        assert_eq!(dht.release().pulses, 1);
    }

    #[test]
    fn read_times_out_on_short_frame() {
        let capture = EdgeCapture::new();
        let bytes = with_checksum([0x02, 0x08, 0x80, 0xAA]);
        let mut intervals = edge_intervals(bytes, true);
        intervals.truncate(20);
        let line = ReplayLine {
            capture: &capture,
            intervals,
            pulses: 0,
        };
        let mut dht = Dht22::new(line, &capture).unwrap();
        assert_eq!(
            embassy_futures::block_on(dht.read()),
            Err(DecodeError::Timeout)
        );
    }

    #[test]
    fn broken_line_is_not_ready() {
        let capture = EdgeCapture::new();
        assert_eq!(
            Dht22::new(BrokenLine, &capture).err(),
            Some(DecodeError::NotReady)
        );
        assert!(!DecodeError::NotReady.is_retryable());
        assert!(DecodeError::Timeout.is_retryable());
    }
}
