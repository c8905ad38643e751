//! Error types shared by the codecs, the storage backends and the sync layer

use alloc::string::String;
use thiserror_no_std::Error;

/// A persisted value could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("timestamp field {index} is not numeric")]
    NotNumeric { index: usize },
    #[error("timestamp is not a valid calendar date and time")]
    OutOfRange,
    #[error("field `{field}` has an invalid value `{value}`")]
    InvalidField { field: &'static str, value: String },
    #[error("record is not terminated by the EOF sentinel")]
    MissingSentinel,
    #[error("buffer is not valid UTF-8")]
    NotUtf8,
}

/// Failure of a storage backend.
///
/// [`crate::storage::Backend::load`] turns every one of these into the
/// compiled default record; only `try_load` and `save` surface them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("storage medium unavailable: {0}")]
    MediaUnavailable(String),
    #[error("record failed validation: {0}")]
    SchemaViolation(&'static str),
    #[error("malformed record: {0}")]
    Format(FormatError),
    #[error("write to storage medium failed: {0}")]
    Write(String),
    #[error("encoded record needs {len} bytes but the medium holds {capacity}")]
    RecordTooLarge { len: usize, capacity: usize },
    #[error("unknown field `{0}`")]
    UnknownField(String),
}

impl From<FormatError> for StoreError {
    fn from(value: FormatError) -> Self {
        Self::Format(value)
    }
}

/// A calibration update was refused or could not be persisted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("calibration `{0}` is not a number")]
    NotNumeric(String),
    #[error("calibration must be positive and finite, got {0}")]
    OutOfRange(f32),
    #[error("a measured calibration needs a non-zero pulse count")]
    ZeroPulses,
    /// The medium cannot hold the new value; the previous calibration stays.
    #[error("calibration refused by the storage medium: {0}")]
    Unstorable(StoreError),
    /// The new value is in effect but the save failed; the next tick retries.
    #[error("calibration applied but not persisted: {0}")]
    NotPersisted(StoreError),
}
