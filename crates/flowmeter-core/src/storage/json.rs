//! Structured text backend: one JSON object holding exactly the record's keys
//!
//! ```json
//! {
//!   "hostname": "watermeter",
//!   "indicator": "blnk",
//!   "last_save_time": "2024 3 9 7 5 2",
//!   "metric": true,
//!   "ml_per_pulse": 1.5,
//!   "usage": 2731
//! }
//! ```
//!
//! Loading validates the whole object: the key set must match exactly and
//! every value must coerce to its field's type and range. Any failure
//! discards the entire record; there is no partial recovery.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use log::debug;
use serde::Serialize;
use serde_json::{Map, Value};

use super::fs::{FileSystem, replace_file};
use super::{Backend, Entry, check_record};
use crate::config::JSON_FILE_NAME;
use crate::error::StoreError;
use crate::record::{self, FIELD_NAMES, Indicator, StateRecord, is_valid_calibration};
use crate::time_codec;

/// Serialized form, keys in schema order
#[derive(Serialize)]
struct JsonRecord<'a> {
    hostname: &'a str,
    indicator: &'static str,
    last_save_time: String,
    metric: bool,
    ml_per_pulse: f32,
    usage: u32,
}

impl<'a> From<&'a StateRecord> for JsonRecord<'a> {
    fn from(record: &'a StateRecord) -> Self {
        Self {
            hostname: &record.hostname,
            indicator: record.indicator.token(),
            last_save_time: time_codec::encode(record.last_save_time),
            metric: record.metric,
            ml_per_pulse: record.ml_per_pulse,
            usage: record.usage,
        }
    }
}

pub struct JsonBackend<F: FileSystem> {
    fs: F,
    path: String,
}

impl<F: FileSystem> JsonBackend<F> {
    pub fn new(fs: F, path: &str) -> Self {
        Self {
            fs,
            path: path.to_string(),
        }
    }

    /// Backend on the conventional `watermeter.json` file
    pub fn with_default_path(fs: F) -> Self {
        Self::new(fs, JSON_FILE_NAME)
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    fn read_object(&mut self) -> Result<Map<String, Value>, StoreError> {
        let bytes = self.fs.read(&self.path)?;
        match serde_json::from_slice(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::SchemaViolation("record is not a JSON object")),
            Err(e) => {
                debug!("{}: {}", self.path, e);
                Err(StoreError::SchemaViolation("record is not valid JSON"))
            }
        }
    }

    fn write_value<T: Serialize>(&mut self, value: &T) -> Result<(), StoreError> {
        let text = serde_json::to_vec_pretty(value)
            .map_err(|e| StoreError::Write(alloc::format!("encoding JSON: {e}")))?;
        replace_file(&mut self.fs, &self.path, &text)
    }
}

fn coerce_usage(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u32::try_from(u).ok()
            } else if n.as_i64().is_some() {
                // negative integer
                None
            } else {
                let f = n.as_f64()?;
                (f.is_finite() && f >= 0.0 && f <= f64::from(u32::MAX)).then_some(f as u32)
            }
        }
        Value::String(s) => record::parse_usage(s).ok(),
        _ => None,
    }
}

fn coerce_ml_per_pulse(value: &Value) -> Option<f32> {
    let ml = match value {
        Value::Number(n) => n.as_f64()? as f32,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    is_valid_calibration(ml).then_some(ml)
}

fn coerce_metric(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        _ => None,
    }
}

fn record_from_object(map: &Map<String, Value>) -> Result<StateRecord, StoreError> {
    let keys_match =
        map.len() == FIELD_NAMES.len() && FIELD_NAMES.iter().all(|k| map.contains_key(*k));
    if !keys_match {
        return Err(StoreError::SchemaViolation("key set differs from the record schema"));
    }
    static NULL: Value = Value::Null;
    let field = |key: &str| map.get(key).unwrap_or(&NULL);

    let usage = coerce_usage(field("usage"))
        .ok_or(StoreError::SchemaViolation("usage is not a non-negative integer"))?;
    let ml_per_pulse = coerce_ml_per_pulse(field("ml_per_pulse"))
        .ok_or(StoreError::SchemaViolation("ml_per_pulse is not a positive number"))?;
    let metric = coerce_metric(field("metric"))
        .ok_or(StoreError::SchemaViolation("metric is not a boolean"))?;
    let last_save_time = match field("last_save_time") {
        Value::String(s) => time_codec::decode(s)?,
        _ => return Err(StoreError::SchemaViolation("last_save_time is not a string")),
    };
    let indicator = field("indicator")
        .as_str()
        .and_then(Indicator::from_token)
        .ok_or(StoreError::SchemaViolation("indicator is not a known variant"))?;
    let hostname = match field("hostname") {
        Value::String(s) => record::parse_hostname(s)?,
        _ => return Err(StoreError::SchemaViolation("hostname is not a string")),
    };

    let record = StateRecord {
        hostname,
        indicator,
        last_save_time,
        metric,
        ml_per_pulse,
        usage,
    };
    check_record(&record)?;
    Ok(record)
}

/// JSON value of a raw edit: valid JSON is taken as is, anything else as a string.
fn parse_raw_value(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

impl<F: FileSystem> Backend for JsonBackend<F> {
    fn name(&self) -> &'static str {
        "json"
    }

    fn try_load(&mut self) -> Result<StateRecord, StoreError> {
        let map = self.read_object()?;
        record_from_object(&map)
    }

    fn write_record(&mut self, record: &StateRecord) -> Result<(), StoreError> {
        check_record(record)?;
        self.write_value(&JsonRecord::from(record))?;
        debug!("Wrote {}", self.path);
        Ok(())
    }

    fn dump(&mut self) -> Result<Vec<Entry>, StoreError> {
        let map = self.read_object()?;
        Ok(map
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => Entry { key, value: s },
                other => Entry {
                    key,
                    value: other.to_string(),
                },
            })
            .collect())
    }

    fn raw_edit(&mut self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let mut map = match self.read_object() {
            Ok(map) => map,
            Err(e) => {
                debug!("{}: {}; editing the defaults instead", self.path, e);
                let defaults = StateRecord::default();
                match serde_json::to_value(JsonRecord::from(&defaults)) {
                    Ok(Value::Object(map)) => map,
                    _ => Map::new(),
                }
            }
        };
        match value {
            Some(value) => {
                map.insert(key.to_string(), parse_raw_value(value));
            }
            None => {
                map.remove(key);
            }
        }
        self.write_value(&Value::Object(map))
    }
}
