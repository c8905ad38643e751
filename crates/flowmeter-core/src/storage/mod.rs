//! Storage backends for the state record
//!
//! Every physical medium implements [`Backend`]. Backends are selected when
//! the sync coordinator is constructed, either as a concrete type parameter
//! or boxed behind `dyn Backend`.
//!
//! | Backend | Medium | Crash safety |
//! |---|---|---|
//! | [`FlatFileBackend`] | fixed-width record in a file | temp file + atomic rename |
//! | [`PagedKvBackend`] | one entry per field on 512-byte pages | none, entries land one by one |
//! | [`JsonBackend`] | validated JSON object in a file | temp file + atomic rename |
//! | [`NvmBackend`] | fixed-width record at a fixed NVM offset | none, in-place overwrite |
//!
//! ## Load policy
//!
//! Loading never fails: whatever `try_load` reports, be it a missing medium,
//! a malformed buffer or a record failing validation, [`Backend::load`] logs
//! it and substitutes the compiled defaults. Losing persisted state is an
//! accepted outcome; refusing to boot is not.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use chrono::NaiveDateTime;
use log::warn;

use crate::error::StoreError;
use crate::record::StateRecord;

pub mod fixed_record;
pub mod flat_file;
pub mod fs;
pub mod json;
pub mod nvm;
pub mod paged_kv;

pub use flat_file::FlatFileBackend;
pub use fs::{FileSystem, MemoryFs};
pub use json::JsonBackend;
pub use nvm::{FramError, I2cFram, MemoryNvm, NvmBackend, NvmDevice};
pub use paged_kv::{MemoryBlockDevice, PagedKvBackend, PagedKvStore};

#[cfg(feature = "std")]
pub use fs::StdFs;

/// One persisted key and its value as stored, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: String,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.value)
    }
}

/// Load/save contract implemented once per storage medium.
pub trait Backend {
    /// Short medium name for log lines
    fn name(&self) -> &'static str;

    /// Read and validate the persisted record.
    fn try_load(&mut self) -> Result<StateRecord, StoreError>;

    /// Encode and write `record` as-is.
    fn write_record(&mut self, record: &StateRecord) -> Result<(), StoreError>;

    /// Every persisted key/value pair exactly as the medium holds it.
    fn dump(&mut self) -> Result<Vec<Entry>, StoreError>;

    /// Overwrite (`Some`) or clear (`None`) one persisted field directly.
    ///
    /// No schema check of any kind is applied: a bad value here is only
    /// noticed by the next load, which will then fall back to defaults.
    /// Meant for manual recovery of a device, never for normal operation.
    fn raw_edit(&mut self, key: &str, value: Option<&str>) -> Result<(), StoreError>;

    /// Load the persisted record, falling back to compiled defaults on any error.
    fn load(&mut self) -> StateRecord {
        match self.try_load() {
            Ok(record) => record,
            Err(e) => {
                warn!("{}: {}; using compiled defaults", self.name(), e);
                StateRecord::default()
            }
        }
    }

    /// Save `record`, stamping `last_save_time` with `now`.
    ///
    /// The stamp is rolled back when the write fails so the caller's copy
    /// keeps describing what the medium actually holds.
    fn save(&mut self, record: &mut StateRecord, now: NaiveDateTime) -> Result<(), StoreError> {
        let previous = record.last_save_time;
        record.last_save_time = now;
        self.write_record(record).inspect_err(|_| {
            record.last_save_time = previous;
        })
    }

    /// Write the compiled defaults to a blank medium.
    fn initialize(&mut self, now: NaiveDateTime) -> Result<StateRecord, StoreError> {
        let mut record = StateRecord::default();
        self.save(&mut record, now)?;
        Ok(record)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn try_load(&mut self) -> Result<StateRecord, StoreError> {
        (**self).try_load()
    }

    fn write_record(&mut self, record: &StateRecord) -> Result<(), StoreError> {
        (**self).write_record(record)
    }

    fn dump(&mut self) -> Result<Vec<Entry>, StoreError> {
        (**self).dump()
    }

    fn raw_edit(&mut self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        (**self).raw_edit(key, value)
    }
}

fn check_record(record: &StateRecord) -> Result<(), StoreError> {
    record.validate().map_err(StoreError::SchemaViolation)
}
