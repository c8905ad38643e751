//! Wall clock derived from the embassy uptime timer

use core::cell::Cell;

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike};
use critical_section::Mutex;
use embassy_time::Instant;
use flowmeter_core::Clock;

/// Uptime plus an offset. Starts at the Unix epoch on power-up, below any
/// sane date, until the sync coordinator or a time service sets it.
pub struct RtcClock {
    offset_ms: Mutex<Cell<i64>>,
}

impl RtcClock {
    pub const fn new() -> Self {
        Self {
            offset_ms: Mutex::new(Cell::new(0)),
        }
    }

    fn uptime_ms() -> i64 {
        Instant::now().as_millis() as i64
    }
}

impl Default for RtcClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RtcClock {
    fn now(&self) -> NaiveDateTime {
        let offset = critical_section::with(|cs| self.offset_ms.borrow(cs).get());
        DateTime::from_timestamp_millis(offset + Self::uptime_ms())
            .map(|t| t.naive_utc())
            .unwrap_or_default()
    }

    fn set(&self, now: NaiveDateTime) {
        let offset = now.and_utc().timestamp_millis() - Self::uptime_ms();
        critical_section::with(|cs| self.offset_ms.borrow(cs).set(offset));
    }
}

/// File timestamps for the SD card, taken from an [`RtcClock`]
#[derive(Clone, Copy)]
pub struct SdTime(pub &'static RtcClock);

impl embedded_sdmmc::TimeSource for SdTime {
    fn get_timestamp(&self) -> embedded_sdmmc::Timestamp {
        let now = self.0.now();
        // FAT dates start in 1980
        let year = now.year().clamp(1980, 2107);
        embedded_sdmmc::Timestamp {
            year_since_1970: (year - 1970) as u8,
            zero_indexed_month: now.month0() as u8,
            zero_indexed_day: now.day0() as u8,
            hours: now.hour() as u8,
            minutes: now.minute() as u8,
            seconds: now.second() as u8,
        }
    }
}
