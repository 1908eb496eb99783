//! Hardware watchdog seam and liveness supervision

use log::error;

use crate::mqtt::Liveness;

/// Hardware watchdog window in seconds
pub const WATCHDOG_TIMEOUT_SECS: u64 = 32;
/// Main loop period; the watchdog is fed once per round
pub const FEED_PERIOD_MS: u64 = 100;

pub trait Watchdog {
    fn feed(&mut self);

    /// Reset the chip; used for unrecoverable conditions
    fn hard_reset(&mut self) -> !;
}

/// Feed the watchdog while the broker answers, reset once it has been silent too long
pub fn supervise<W: Watchdog>(watchdog: &mut W, liveness: Liveness) {
    match liveness {
        Liveness::Alive => watchdog.feed(),
        Liveness::Silent { silent_for } => {
            error!(
                "[WLAB] No broker response for {} s, resetting",
                silent_for.as_secs()
            );
            watchdog.hard_reset()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Duration;

    #[derive(Default)]
    struct CountingWatchdog {
        feeds: u32,
    }

    impl Watchdog for CountingWatchdog {
        fn feed(&mut self) {
            self.feeds += 1;
        }

        fn hard_reset(&mut self) -> ! {
            panic!("reset");
        }
    }

    #[test]
    fn alive_feeds() {
        let mut wdg = CountingWatchdog::default();
        supervise(&mut wdg, Liveness::Alive);
        supervise(&mut wdg, Liveness::Alive);
        assert_eq!(wdg.feeds, 2);
    }

    #[test]
    #[should_panic(expected = "reset")]
    fn silence_resets() {
        let mut wdg = CountingWatchdog::default();
        supervise(
            &mut wdg,
            Liveness::Silent {
                silent_for: Duration::from_secs(7201),
            },
        );
    }
}
