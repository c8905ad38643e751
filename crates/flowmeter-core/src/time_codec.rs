//! Textual form of timestamps used by every persisted format
//!
//! A timestamp is written as six space-separated integers:
//! `year month day hour minute second`, without zero padding and without any
//! timezone information. All timestamps are naive local time.

use alloc::string::{String, ToString};
use core::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::FormatError;

/// Number of integer fields in an encoded timestamp
pub const FIELD_COUNT: usize = 6;

/// Display adapter writing a timestamp in its persisted form.
///
/// Lets fixed-size buffers be filled with `write!` without allocating.
#[derive(Debug, Clone, Copy)]
pub struct Encoded(pub NaiveDateTime);

impl fmt::Display for Encoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.0;
        write!(
            f,
            "{} {} {} {} {} {}",
            t.year(),
            t.month(),
            t.day(),
            t.hour(),
            t.minute(),
            t.second()
        )
    }
}

/// Encode a timestamp, dropping sub-second precision.
pub fn encode(timestamp: NaiveDateTime) -> String {
    Encoded(timestamp).to_string()
}

/// Decode the six-field form produced by [`encode`].
///
/// Fails when the field count is not exactly six, when a field is not an
/// integer, or when the fields do not name a real calendar instant.
pub fn decode(text: &str) -> Result<NaiveDateTime, FormatError> {
    let found = text.split_whitespace().count();
    if found != FIELD_COUNT {
        return Err(FormatError::FieldCount {
            expected: FIELD_COUNT,
            found,
        });
    }

    let mut fields = [0i64; FIELD_COUNT];
    for (index, token) in text.split_whitespace().enumerate() {
        fields[index] = token
            .parse()
            .map_err(|_| FormatError::NotNumeric { index })?;
    }

    let [year, month, day, hour, minute, second] = fields;
    let year = i32::try_from(year).map_err(|_| FormatError::OutOfRange)?;
    let unsigned = |v: i64| u32::try_from(v).map_err(|_| FormatError::OutOfRange);

    let (month, day) = (unsigned(month)?, unsigned(day)?);
    let (hour, minute, second) = (unsigned(hour)?, unsigned(minute)?, unsigned(second)?);

    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or(FormatError::OutOfRange)
}
