//! Wall-clock time from SNTP plus uptime
//!
//! The epoch is fetched once and then extrapolated from the monotonic uptime clock until
//! the next periodic resync.

use log::{info, warn};

pub const SNTP_PORT: u16 = 123;
/// Boot-time sync attempts before the station resets
pub const SYNC_ATTEMPTS: u32 = 8;
/// Resync period in seconds
pub const RESYNC_PERIOD_SECS: u64 = 60 * 60;

/// Source of the current Unix time
#[allow(async_fn_in_trait)]
pub trait TimeSource {
    type Error: core::fmt::Debug;

    async fn fetch_epoch(&mut self) -> Result<u64, Self::Error>;
}

/// Epoch anchored to an uptime instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    sync_epoch: u64,
    sync_uptime_ms: u64,
    synced: bool,
}

impl Timestamp {
    pub const fn new() -> Self {
        Self {
            sync_epoch: 0,
            sync_uptime_ms: 0,
            synced: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn apply_sync(&mut self, epoch_secs: u64, uptime_ms: u64) {
        self.sync_epoch = epoch_secs;
        self.sync_uptime_ms = uptime_ms;
        self.synced = true;
    }

    /// Unix seconds at `uptime_ms`
    pub fn now(&self, uptime_ms: u64) -> u64 {
        self.sync_epoch + uptime_ms.saturating_sub(self.sync_uptime_ms) / 1000
    }

    pub fn needs_resync(&self, uptime_ms: u64, period_secs: u64) -> bool {
        !self.synced || uptime_ms.saturating_sub(self.sync_uptime_ms) >= period_secs * 1000
    }

    /// One sync attempt; returns whether the epoch was updated
    pub async fn sync<T: TimeSource>(&mut self, source: &mut T, uptime_ms: u64) -> bool {
        match source.fetch_epoch().await {
            Ok(epoch) => {
                self.apply_sync(epoch, uptime_ms);
                info!("[TIME] Synchronized, epoch {}", epoch);
                true
            }
            Err(e) => {
                warn!("[TIME] Sync failed: {:?}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_extrapolates_from_uptime() {
        let mut ts = Timestamp::new();
        assert!(ts.needs_resync(0, RESYNC_PERIOD_SECS));

        ts.apply_sync(1_700_000_000, 5_000);
        assert_eq!(ts.now(5_000), 1_700_000_000);
        assert_eq!(ts.now(7_999), 1_700_000_002);
        assert_eq!(ts.now(65_000), 1_700_000_060);
        assert!(!ts.needs_resync(65_000, RESYNC_PERIOD_SECS));
        assert!(ts.needs_resync(5_000 + RESYNC_PERIOD_SECS * 1000, RESYNC_PERIOD_SECS));
    }

    struct Fixed(Option<u64>);

    impl TimeSource for Fixed {
        type Error = ();

        async fn fetch_epoch(&mut self) -> Result<u64, ()> {
            self.0.ok_or(())
        }
    }

    #[test]
    fn sync_applies_only_on_success() {
        let mut ts = Timestamp::new();
        assert!(!embassy_futures::block_on(ts.sync(&mut Fixed(None), 100)));
        assert!(!ts.is_synced());

        assert!(embassy_futures::block_on(ts.sync(&mut Fixed(Some(42)), 100)));
        assert_eq!(ts.now(1_100), 43);
    }
}
