//! Live pulse counter shared with the sensor interrupt

use core::sync::atomic::{AtomicU32, Ordering};

/// Count of sensor pulses since the medium was initialized.
///
/// The interrupt handler owns the write side through [`PulseCounter::record_pulse`],
/// which is a single atomic add: O(1), allocation-free and non-blocking.
/// Everything else only reads it, except the sync coordinator which
/// re-seeds it from the persisted usage after a load or reset.
///
/// # Preconditions
///
/// The device is single-core and the pulse interrupt does not re-enter
/// itself. Under that assumption a re-seed from the main context can only
/// race with whole increments, never with half of one; a pulse landing
/// between a load and the re-seed is lost, which is acceptable at boot.
///
/// Counting wraps at `u32::MAX` pulses.
#[derive(Debug, Default)]
pub struct PulseCounter {
    count: AtomicU32,
}

impl PulseCounter {
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Count one pulse. Safe to call from interrupt context.
    #[inline]
    pub fn record_pulse(&self) -> u32 {
        self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Current count
    #[inline]
    pub fn get(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_to(&self, value: u32) {
        self.count.store(value, Ordering::Relaxed);
    }
}
