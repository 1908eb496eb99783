//! Per-channel running statistics for one publish cycle
//!
//! Each channel keeps sum/count, extrema with their minute timestamps and the first
//! sample of the cycle. After a short warm-up, samples that jump further than a
//! channel threshold beyond the current extrema are rejected as sensor glitches.

use log::warn;

/// Samples accepted unconditionally before outlier rejection starts
pub const WARM_UP_SAMPLES: u32 = 4;

/// Outlier threshold for temperature, tenths of a degree
pub const TEMPERATURE_THRESHOLD: u32 = 8;

/// Outlier threshold for humidity, tenths of a percent
pub const HUMIDITY_THRESHOLD: u32 = 40;

/// First accepted sample of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirstSample {
    pub value: i32,
    /// Timestamp truncated to the publish-period boundary
    pub ts: u32,
}

/// Statistics handed out by [`AggregationBuffer::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// `sum / count`, truncated toward zero
    pub avg: i32,
    pub first_value: i32,
    pub first_ts: u32,
    pub min: i32,
    pub min_ts: u32,
    pub max: i32,
    pub max_ts: u32,
    pub count: u32,
}

/// Running statistics of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationBuffer {
    period_minutes: u32,
    sum: i64,
    count: u32,
    min: i32,
    min_ts: u32,
    max: i32,
    max_ts: u32,
    first: Option<FirstSample>,
    rejected: u32,
}

impl AggregationBuffer {
    /// Empty buffer for a publish period of `period_minutes`
    pub const fn new(period_minutes: u32) -> Self {
        Self {
            period_minutes: if period_minutes == 0 { 1 } else { period_minutes },
            sum: 0,
            count: 0,
            min: i32::MAX,
            min_ts: 0,
            max: i32::MIN,
            max_ts: 0,
            first: None,
            rejected: 0,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn sum(&self) -> i64 {
        self.sum
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current extrema, `None` until the first sample
    pub fn extrema(&self) -> Option<(i32, i32)> {
        (self.count > 0).then_some((self.min, self.max))
    }

    pub fn first(&self) -> Option<FirstSample> {
        self.first
    }

    /// Samples rejected as outliers in this cycle
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    /// Add a sample taken at `ts` (epoch seconds).
    ///
    /// Returns `false` and leaves the statistics untouched when the sample is an outlier.
    pub fn commit(&mut self, value: i32, ts: u32, threshold: u32) -> bool {
        if self.count > WARM_UP_SAMPLES {
            let value = i64::from(value);
            let threshold = i64::from(threshold);

            if value - threshold > i64::from(self.max) {
                warn!(
                    "[AGG] Value {} exceeds max {} by more than {}",
                    value, self.max, threshold
                );
                self.rejected += 1;
                return false;
            }

            if value + threshold < i64::from(self.min) {
                warn!(
                    "[AGG] Value {} below min {} by more than {}",
                    value, self.min, threshold
                );
                self.rejected += 1;
                return false;
            }
        }

        if self.first.is_none() {
            self.first = Some(FirstSample {
                value,
                ts: ts - ts % (60 * self.period_minutes),
            });
        }

        if value > self.max {
            self.max = value;
            self.max_ts = ts - ts % 60;
        }

        if value < self.min {
            self.min = value;
            self.min_ts = ts - ts % 60;
        }

        self.sum += i64::from(value);
        self.count += 1;
        true
    }

    /// Take the cycle statistics and reset to the empty state.
    ///
    /// Returns `None` when nothing was committed in this cycle.
    pub fn flush(&mut self) -> Option<FlushSummary> {
        let summary = self.first.filter(|_| self.count > 0).map(|first| FlushSummary {
            avg: (self.sum / i64::from(self.count)) as i32,
            first_value: first.value,
            first_ts: first.ts,
            min: self.min,
            min_ts: self.min_ts,
            max: self.max,
            max_ts: self.max_ts,
            count: self.count,
        });

        self.reset();
        summary
    }

    /// Drop everything committed in this cycle
    pub fn reset(&mut self) {
        *self = Self::new(self.period_minutes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: u32 = 10;
    const TS: u32 = 1_700_000_123;

    #[test]
    fn flush_reports_average_and_extrema() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        let samples = [231, 229, 236, 233, 230, 232, 228];
        for (i, value) in samples.iter().enumerate() {
            assert!(buffer.commit(*value, TS + 4 * i as u32, TEMPERATURE_THRESHOLD));
        }

        let summary = buffer.flush().unwrap();
        let sum: i32 = samples.iter().sum();
        assert_eq!(summary.avg, sum / samples.len() as i32);
        assert_eq!(summary.min, 228);
        assert_eq!(summary.max, 236);
        assert_eq!(summary.first_value, 231);
        assert_eq!(summary.count, samples.len() as u32);
    }

    #[test]
    fn average_truncates_toward_zero() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        buffer.commit(-5, TS, 100);
        buffer.commit(-6, TS, 100);
        assert_eq!(buffer.flush().unwrap().avg, -5);

        buffer.commit(5, TS, 100);
        buffer.commit(6, TS, 100);
        assert_eq!(buffer.flush().unwrap().avg, 5);
    }

    #[test]
    fn flush_restores_fresh_state() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        for i in 0..8 {
            buffer.commit(450 + i, TS + i as u32, HUMIDITY_THRESHOLD);
        }
        buffer.commit(900, TS, HUMIDITY_THRESHOLD);
        assert_eq!(buffer.rejected(), 1);

        buffer.flush();
        assert_eq!(buffer, AggregationBuffer::new(PERIOD));
        assert_eq!(buffer.extrema(), None);
        assert_eq!(buffer.first(), None);
    }

    #[test]
    fn empty_flush_yields_nothing() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        assert_eq!(buffer.flush(), None);
        assert_eq!(buffer, AggregationBuffer::new(PERIOD));
    }

    #[test]
    fn outlier_after_warm_up_is_rejected() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        for value in [230, 231, 232, 231, 230] {
            assert!(buffer.commit(value, TS, TEMPERATURE_THRESHOLD));
        }
        let before = buffer;

        assert!(!buffer.commit(232 + TEMPERATURE_THRESHOLD as i32 + 1, TS + 60, TEMPERATURE_THRESHOLD));
        assert!(!buffer.commit(230 - TEMPERATURE_THRESHOLD as i32 - 1, TS + 60, TEMPERATURE_THRESHOLD));

        assert_eq!(buffer.sum(), before.sum());
        assert_eq!(buffer.count(), before.count());
        assert_eq!(buffer.extrema(), before.extrema());
        assert_eq!(buffer.rejected(), 2);
    }

    #[test]
    fn values_within_threshold_are_accepted_after_warm_up() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        for value in [230, 231, 232, 231, 230] {
            buffer.commit(value, TS, TEMPERATURE_THRESHOLD);
        }
        assert!(buffer.commit(232 + TEMPERATURE_THRESHOLD as i32, TS, TEMPERATURE_THRESHOLD));
        assert_eq!(buffer.extrema(), Some((230, 240)));
    }

    #[test]
    fn warm_up_accepts_anything() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        for value in [0, 1000, -400, 20, 5] {
            assert!(buffer.commit(value, TS, TEMPERATURE_THRESHOLD));
        }
        assert_eq!(buffer.extrema(), Some((-400, 1000)));
    }

    #[test]
    fn timestamps_are_truncated() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        // 2023-11-14 22:15:23 UTC
        buffer.commit(10, TS, 100);
        buffer.commit(20, TS + 100, 100);
        buffer.commit(5, TS + 200, 100);

        let summary = buffer.flush().unwrap();
        assert_eq!(summary.first_ts, TS - TS % 600);
        assert_eq!(summary.first_ts % 600, 0);
        assert_eq!(summary.max_ts, (TS + 100) - (TS + 100) % 60);
        assert_eq!(summary.min_ts, (TS + 200) - (TS + 200) % 60);
    }

    #[test]
    fn first_sample_is_recorded_once() {
        let mut buffer = AggregationBuffer::new(PERIOD);
        buffer.commit(7, TS, 100);
        buffer.commit(9, TS + 700, 100);
        assert_eq!(
            buffer.first(),
            Some(FirstSample {
                value: 7,
                ts: TS - TS % 600
            })
        );
    }
}
