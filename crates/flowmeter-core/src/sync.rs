//! Write-back synchronization of the live pulse counter
//!
//! The [`SyncCoordinator`] owns the canonical [`StateRecord`] and decides
//! when the pulse counter is copied into it and handed to the backend:
//!
//! - **Clean**: the counter equals the persisted `usage` and no setting is
//!   waiting to be written. Ticks do nothing.
//! - **Dirty**: pulses arrived, or a setting changed but its save failed.
//!   A tick saves once the flush interval has elapsed since the last
//!   successful save; a pending setting is saved on the next tick
//!   regardless of the interval.
//!
//! Explicit requests ([`SyncCoordinator::save_now`]) and calibration changes
//! bypass the interval and save immediately.
//!
//! Saving is synchronous and may block on slow media. Call the coordinator
//! from the main execution context only, never from the pulse interrupt.

use alloc::string::ToString;
use alloc::vec::Vec;

use chrono::{NaiveDateTime, TimeDelta};
use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{CalibrationError, StoreError};
use crate::pulse::PulseCounter;
use crate::record::{Indicator, StateRecord, is_valid_calibration};
use crate::storage::{Backend, Entry};
use crate::volume::UsageReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Clean,
    Dirty,
}

/// What a periodic tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to save
    Clean,
    /// Dirty, but the flush interval has not elapsed yet
    Throttled,
    Saved,
    /// The save failed; the next tick tries again
    Failed,
}

/// How an immediate settings save went wrong
enum SettingFailure {
    /// The medium refused the new record; the old setting is back
    RolledBack(StoreError),
    /// Still in effect, saved again on the next tick
    Pending(StoreError),
}

impl SettingFailure {
    fn into_store_error(self) -> StoreError {
        match self {
            Self::RolledBack(e) | Self::Pending(e) => e,
        }
    }
}

pub struct SyncCoordinator<'a, B: Backend, C: Clock> {
    backend: B,
    clock: C,
    pulses: &'a PulseCounter,
    /// Last record handed to the backend; `usage` is the persisted count
    record: StateRecord,
    config: SyncConfig,
    /// Clock reading at the last successful save, drives the throttle
    last_flush: NaiveDateTime,
    /// A setting changed and has not been persisted yet
    settings_dirty: bool,
}

impl<'a, B: Backend, C: Clock> SyncCoordinator<'a, B, C> {
    /// Create a coordinator holding the compiled defaults. Nothing is read
    /// until [`boot`](Self::boot) or [`load`](Self::load).
    pub fn new(backend: B, clock: C, pulses: &'a PulseCounter, config: SyncConfig) -> Self {
        Self {
            backend,
            clock,
            pulses,
            record: StateRecord::default(),
            config,
            last_flush: NaiveDateTime::default(),
            settings_dirty: false,
        }
    }

    /// Startup sequence: load the record, bring an unset or lagging clock up
    /// to the last save time, then write the record back once.
    ///
    /// The initial save confirms the medium is writable and stamps the
    /// record with the (possibly recovered) clock. Its failure is logged and
    /// otherwise ignored.
    pub fn boot(&mut self) -> &StateRecord {
        let unset = self.clock.now() < self.config.sanity_epoch();
        self.load();
        self.recover_clock(unset);

        if let Err(e) = self.save_now() {
            warn!("Initial save to {} failed: {}", self.backend.name(), e);
        }
        &self.record
    }

    fn recover_clock(&mut self, unset: bool) {
        let now = self.clock.now();
        if self.record.last_save_time > now {
            if unset {
                info!(
                    "Clock not set, bootstrapping from last save time {}",
                    self.record.last_save_time
                );
            } else {
                warn!(
                    "Clock at {} is behind last save time {}, advancing",
                    now, self.record.last_save_time
                );
            }
            self.clock.set(self.record.last_save_time);
        } else if unset {
            warn!("Clock not set and no later save time to recover from");
        }
    }

    /// Replace the in-memory record with what the backend holds and restart
    /// the pulse counter from its `usage`.
    ///
    /// Pulses counted since the last save are discarded.
    pub fn load(&mut self) -> &StateRecord {
        self.record = self.backend.load();
        self.pulses.reset_to(self.record.usage);
        self.last_flush = self.record.last_save_time;
        self.settings_dirty = false;
        info!(
            "Loaded state from {}: usage={} ml_per_pulse={} last_save_time={}",
            self.backend.name(),
            self.record.usage,
            self.record.ml_per_pulse,
            self.record.last_save_time
        );
        &self.record
    }

    pub fn current_counter(&self) -> u32 {
        self.pulses.get()
    }

    pub fn state(&self) -> SyncState {
        if self.settings_dirty || self.pulses.get() != self.record.usage {
            SyncState::Dirty
        } else {
            SyncState::Clean
        }
    }

    /// The record as it would be saved right now, live counter included.
    pub fn snapshot(&self) -> StateRecord {
        StateRecord {
            usage: self.pulses.get(),
            ..self.record.clone()
        }
    }

    /// The record as last handed to the backend
    pub fn persisted(&self) -> &StateRecord {
        &self.record
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Periodic flush check.
    pub fn tick(&mut self) -> TickOutcome {
        if self.state() == SyncState::Clean {
            return TickOutcome::Clean;
        }

        let now = self.clock.now();
        if !self.settings_dirty {
            let elapsed = now - self.last_flush;
            if elapsed < TimeDelta::zero() {
                warn!(
                    "Clock moved back from {} to {}, restarting flush interval",
                    self.last_flush, now
                );
                self.last_flush = now;
                return TickOutcome::Throttled;
            }
            if elapsed < self.config.flush_interval() {
                return TickOutcome::Throttled;
            }
        }

        match self.persist(now) {
            Ok(()) => TickOutcome::Saved,
            Err(e) => {
                error!("Periodic save to {} failed: {}", self.backend.name(), e);
                TickOutcome::Failed
            }
        }
    }

    /// Save immediately, whatever the state and the flush interval.
    pub fn save_now(&mut self) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.persist(now)
    }

    fn persist(&mut self, now: NaiveDateTime) -> Result<(), StoreError> {
        // last_save_time never goes backwards, even if the clock does
        let stamp = now.max(self.record.last_save_time);
        let persisted_usage = self.record.usage;
        self.record.usage = self.pulses.get();

        match self.backend.save(&mut self.record, stamp) {
            Ok(()) => {
                self.last_flush = now;
                self.settings_dirty = false;
                debug!(
                    "Saved usage={} to {} at {}",
                    self.record.usage,
                    self.backend.name(),
                    stamp
                );
                Ok(())
            }
            Err(e) => {
                self.record.usage = persisted_usage;
                Err(e)
            }
        }
    }

    /// Change a setting and save it right away.
    ///
    /// A save the medium can never accept (the record no longer encodes)
    /// rolls the change back. Any other failure keeps the change in effect
    /// and leaves it for the next tick.
    fn apply_setting(&mut self, apply: impl FnOnce(&mut StateRecord)) -> Result<(), SettingFailure> {
        let previous = self.record.clone();
        let was_dirty = self.settings_dirty;
        apply(&mut self.record);
        self.settings_dirty = true;

        match self.save_now() {
            Ok(()) => Ok(()),
            Err(e @ (StoreError::SchemaViolation(_) | StoreError::RecordTooLarge { .. })) => {
                warn!("{} cannot store the new setting: {}", self.backend.name(), e);
                self.record = previous;
                self.settings_dirty = was_dirty;
                Err(SettingFailure::RolledBack(e))
            }
            Err(e) => Err(SettingFailure::Pending(e)),
        }
    }

    /// Set the calibration and persist it immediately.
    ///
    /// Non-positive and non-finite values are refused without touching any
    /// state, as are values the medium cannot represent.
    pub fn set_calibration(&mut self, ml_per_pulse: f32) -> Result<(), CalibrationError> {
        if !is_valid_calibration(ml_per_pulse) {
            return Err(CalibrationError::OutOfRange(ml_per_pulse));
        }
        info!(
            "Calibration {} -> {} ml/pulse",
            self.record.ml_per_pulse, ml_per_pulse
        );
        self.apply_setting(|record| record.ml_per_pulse = ml_per_pulse)
            .map_err(|failure| match failure {
                SettingFailure::RolledBack(e) => CalibrationError::Unstorable(e),
                SettingFailure::Pending(e) => CalibrationError::NotPersisted(e),
            })
    }

    /// [`set_calibration`](Self::set_calibration) from user input.
    pub fn calibrate_from_str(&mut self, input: &str) -> Result<(), CalibrationError> {
        let ml_per_pulse = input
            .trim()
            .parse::<f32>()
            .map_err(|_| CalibrationError::NotNumeric(input.to_string()))?;
        self.set_calibration(ml_per_pulse)
    }

    /// Calibrate from a measured run: `ml` of fluid produced `pulses` pulses.
    pub fn calibrate_from_measurement(&mut self, ml: f32, pulses: u32) -> Result<(), CalibrationError> {
        if pulses == 0 {
            return Err(CalibrationError::ZeroPulses);
        }
        self.set_calibration(ml / pulses as f32)
    }

    /// Switch between litres and US gallons.
    pub fn set_metric(&mut self, metric: bool) -> Result<(), StoreError> {
        if self.record.metric == metric {
            return Ok(());
        }
        self.apply_setting(|record| record.metric = metric)
            .map_err(SettingFailure::into_store_error)
    }

    pub fn set_indicator(&mut self, indicator: Indicator) -> Result<(), StoreError> {
        if self.record.indicator == indicator {
            return Ok(());
        }
        self.apply_setting(|record| record.indicator = indicator)
            .map_err(SettingFailure::into_store_error)
    }

    /// Administrative reset of the cumulative usage to zero.
    pub fn reset_usage(&mut self) -> Result<(), StoreError> {
        info!("Resetting usage (was {})", self.pulses.get());
        self.pulses.reset_to(0);
        self.save_now()
    }

    /// Volume summary of the live counter
    pub fn report(&self) -> UsageReport {
        UsageReport::new(&self.record, self.pulses.get(), self.clock.now())
    }

    /// Raw persisted entries, for diagnostics
    pub fn dump(&mut self) -> Result<Vec<Entry>, StoreError> {
        self.backend.dump()
    }

    /// Write the compiled defaults to the medium and reload them.
    pub fn initialize(&mut self) -> Result<&StateRecord, StoreError> {
        self.backend.initialize(self.clock.now())?;
        Ok(self.load())
    }

    /// Edit one persisted field without validation, then reload.
    ///
    /// An edit that breaks the record makes the reload fall back to the
    /// compiled defaults.
    pub fn raw_edit(&mut self, key: &str, value: Option<&str>) -> Result<&StateRecord, StoreError> {
        self.backend.raw_edit(key, value)?;
        Ok(self.load())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }
}
