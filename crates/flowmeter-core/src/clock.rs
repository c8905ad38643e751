//! Wall-clock service consumed by the sync layer
//!
//! The device's real-time clock starts at an arbitrary instant after power-up
//! and is only corrected later by NTP, so the core treats it as an adjustable
//! naive local time source.

use core::cell::Cell;

use chrono::{DateTime, NaiveDateTime, TimeDelta};

/// 2000-01-01 00:00:00 plus one million seconds. A clock reading earlier
/// than this has never been set since power-up.
pub const DEFAULT_SANITY_EPOCH_SECS: i64 = 947_684_800;

/// Adjustable wall clock.
///
/// Methods take `&self` so the same clock can be shared between the sync
/// coordinator and a time-resync task.
pub trait Clock {
    /// Current naive local time
    fn now(&self) -> NaiveDateTime;

    /// Move the clock to `now`.
    fn set(&self, now: NaiveDateTime);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> NaiveDateTime {
        (**self).now()
    }

    fn set(&self, now: NaiveDateTime) {
        (**self).set(now)
    }
}

/// Convert Unix seconds to a naive timestamp, clamping unrepresentable values
/// to the Unix epoch.
pub fn from_unix_secs(secs: i64) -> NaiveDateTime {
    DateTime::from_timestamp(secs, 0)
        .map(|t| t.naive_utc())
        .unwrap_or_default()
}

/// A clock that only moves when told to, for tests and accelerated simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Cell<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(start: NaiveDateTime) -> Self {
        Self {
            now: Cell::new(start),
        }
    }

    /// Move the clock forward by `secs` seconds.
    pub fn advance_secs(&self, secs: i64) {
        self.now.set(self.now.get() + TimeDelta::seconds(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        self.now.get()
    }

    fn set(&self, now: NaiveDateTime) {
        self.now.set(now);
    }
}

#[cfg(feature = "std")]
pub use system::SystemClock;

#[cfg(feature = "std")]
mod system {
    use core::cell::Cell;

    use chrono::{Local, NaiveDateTime, TimeDelta};

    use super::Clock;

    /// Host local time plus an adjustable offset.
    ///
    /// `set` never touches the operating system clock; it only shifts what
    /// this instance reports.
    #[derive(Debug)]
    pub struct SystemClock {
        offset: Cell<TimeDelta>,
    }

    impl SystemClock {
        pub fn new() -> Self {
            Self {
                offset: Cell::new(TimeDelta::zero()),
            }
        }
    }

    impl Default for SystemClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Clock for SystemClock {
        fn now(&self) -> NaiveDateTime {
            Local::now().naive_local() + self.offset.get()
        }

        fn set(&self, now: NaiveDateTime) {
            self.offset
                .set(now.signed_duration_since(Local::now().naive_local()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sanity_epoch_is_early_january_2000() {
        let epoch = from_unix_secs(DEFAULT_SANITY_EPOCH_SECS);
        assert_eq!(
            crate::time_codec::encode(epoch),
            "2000 1 12 13 46 40"
        );
    }

    #[test]
    fn manual_clock_only_moves_when_told() {
        let clock = ManualClock::new(from_unix_secs(1_700_000_000));
        let start = clock.now();
        clock.advance_secs(65);
        assert_eq!(clock.now().signed_duration_since(start).num_seconds(), 65);

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[cfg(feature = "std")]
    #[test]
    fn system_clock_can_be_shifted() {
        let clock = SystemClock::new();
        let target = from_unix_secs(DEFAULT_SANITY_EPOCH_SECS);
        clock.set(target);
        let drift = clock.now().signed_duration_since(target).num_seconds();
        assert!((0..=1).contains(&drift));
    }
}
