//! Fixed-width, comma-delimited record shared by the flat file and NVM media
//!
//! Layout, in this exact order:
//!
//! ```text
//! metric,usage,ml_per_pulse,last_save_time,indicator,hostname,EOF
//! 1,2731,1.50,2024 3 9 7 5 2,blnk,watermeter,EOF
//! ```
//!
//! - `metric`: `0` or `1`
//! - `usage`: decimal pulse count
//! - `ml_per_pulse`: two decimal places
//! - `last_save_time`: six space-separated integers (see [`crate::time_codec`])
//! - `indicator`: `none`, `blnk` or `oled`
//! - `hostname`: free text without commas
//!
//! Readers take a fixed-size buffer, strip surrounding whitespace (and NUL
//! padding) and split on commas positionally.

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt::{self, Write};

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{FormatError, StoreError};
use crate::record::{self, Indicator, StateRecord};
use crate::storage::{Entry, check_record};
use crate::time_codec;

/// Buffer size of the flat file medium
pub const FLAT_FILE_RECORD_LEN: usize = 72;
/// Buffer size of the NVM medium
pub const NVM_RECORD_LEN: usize = 64;

pub const SENTINEL: &str = "EOF";

/// Field names in wire order, followed by the sentinel
pub const FIELD_ORDER: [&str; 6] = [
    "metric",
    "usage",
    "ml_per_pulse",
    "last_save_time",
    "indicator",
    "hostname",
];

const FIELD_COUNT: usize = FIELD_ORDER.len() + 1;

struct Wire<'a>(&'a StateRecord);

impl fmt::Display for Wire<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.0;
        write!(
            f,
            "{},{},{:.2},{},{},{},{}",
            u8::from(r.metric),
            r.usage,
            r.ml_per_pulse,
            time_codec::Encoded(r.last_save_time),
            r.indicator.token(),
            r.hostname,
            SENTINEL
        )
    }
}

/// Counts bytes instead of storing them
struct Measure(usize);

impl Write for Measure {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

/// Encode `record` into a buffer of at most `N` bytes.
pub fn encode<const N: usize>(record: &StateRecord) -> Result<heapless::String<N>, StoreError> {
    check_record(record)?;
    if format_calibration(record.ml_per_pulse).as_str() == "0.00" {
        return Err(StoreError::SchemaViolation(
            "ml_per_pulse rounds to zero at two decimal places",
        ));
    }
    check_budget::<N>(record)?;

    let mut out = heapless::String::<N>::new();
    write!(out, "{}", Wire(record)).map_err(|_| StoreError::RecordTooLarge {
        len: wire_len(record),
        capacity: N,
    })?;
    Ok(out)
}

fn wire_len(record: &StateRecord) -> usize {
    let mut measure = Measure(0);
    let _ = write!(measure, "{}", Wire(record));
    measure.0
}

/// Latest timestamp with a four-digit year, the widest the format writes
fn widest_timestamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|date| date.and_hms_opt(23, 59, 59))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Check that `record` keeps fitting `N` bytes as it ages.
///
/// `usage` and `last_save_time` only grow wider, so the record is measured
/// with both at their widest. A record passing this check today can be
/// saved for as long as the device runs.
pub fn check_budget<const N: usize>(record: &StateRecord) -> Result<(), StoreError> {
    let widest = StateRecord {
        usage: u32::MAX,
        last_save_time: widest_timestamp(),
        ..record.clone()
    };
    let len = wire_len(&widest);
    if len > N {
        return Err(StoreError::RecordTooLarge { len, capacity: N });
    }
    Ok(())
}

fn format_calibration(ml_per_pulse: f32) -> heapless::String<32> {
    let mut out = heapless::String::new();
    let _ = write!(out, "{:.2}", ml_per_pulse);
    out
}

/// Split a raw buffer into its positional fields, sentinel included.
fn split(buf: &[u8]) -> Result<Vec<&str>, FormatError> {
    let text = core::str::from_utf8(buf).map_err(|_| FormatError::NotUtf8)?;
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    Ok(text.split(',').collect())
}

/// Decode a raw buffer, validating every field.
pub fn decode(buf: &[u8]) -> Result<StateRecord, StoreError> {
    let fields = split(buf)?;
    if fields.len() != FIELD_COUNT {
        return Err(FormatError::FieldCount {
            expected: FIELD_COUNT,
            found: fields.len(),
        }
        .into());
    }
    if fields[FIELD_COUNT - 1] != SENTINEL {
        return Err(FormatError::MissingSentinel.into());
    }

    Ok(StateRecord {
        metric: record::parse_metric(fields[0])?,
        usage: record::parse_usage(fields[1])?,
        ml_per_pulse: record::parse_ml_per_pulse(fields[2])?,
        last_save_time: time_codec::decode(fields[3])?,
        indicator: Indicator::from_token_or_first(fields[4]),
        hostname: record::parse_hostname(fields[5])?,
    })
}

/// Name the fields of a raw buffer for diagnostics. Missing fields are
/// omitted; anything after the sentinel position is listed as `extra`.
pub fn dump(buf: &[u8]) -> Result<Vec<Entry>, StoreError> {
    let fields = split(buf)?;
    Ok(fields
        .iter()
        .enumerate()
        .map(|(i, value)| match FIELD_ORDER.get(i) {
            Some(key) => Entry::new(*key, *value),
            None if i == FIELD_ORDER.len() => Entry::new("sentinel", *value),
            None => Entry::new("extra", *value),
        })
        .collect())
}

/// Replace one positional field of a raw buffer, without schema validation.
///
/// Missing fields are filled with empty strings and the sentinel is
/// restored. The result must fit `N` bytes, and when it still parses as a
/// record it must pass [`check_budget`], so an edit cannot leave a record
/// that later saves would have to refuse.
pub fn edit_field<const N: usize>(
    buf: &[u8],
    key: &str,
    value: Option<&str>,
) -> Result<String, StoreError> {
    let index = FIELD_ORDER
        .iter()
        .position(|field| *field == key)
        .ok_or_else(|| StoreError::UnknownField(key.to_string()))?;

    // A blank or unreadable medium is edited as if it were empty.
    let mut fields: Vec<String> = split(buf)
        .map(|fields| fields.into_iter().map(str::to_string).collect())
        .unwrap_or_default();
    fields.truncate(FIELD_ORDER.len());
    fields.resize(FIELD_ORDER.len(), String::new());
    fields[index] = value.unwrap_or_default().to_string();
    fields.push(SENTINEL.to_string());

    let text = fields.join(",");
    if text.len() > N {
        return Err(StoreError::RecordTooLarge {
            len: text.len(),
            capacity: N,
        });
    }
    if let Ok(record) = decode(text.as_bytes()) {
        check_budget::<N>(&record)?;
    }
    Ok(text)
}
