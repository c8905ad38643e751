//! The persisted device state record and its compiled defaults

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;

use chrono::NaiveDateTime;
use log::debug;

use crate::error::FormatError;
use crate::time_codec;

pub const DEFAULT_HOSTNAME: &str = "watermeter";
pub const DEFAULT_INDICATOR: Indicator = Indicator::Blink;
pub const DEFAULT_METRIC: bool = true;
/// YF-S402B sensor; an FL-308 is closer to 0.875657
pub const DEFAULT_ML_PER_PULSE: f32 = 1.5;

/// Every key of the persisted schema, in sorted order.
pub const FIELD_NAMES: [&str; 6] = [
    "hostname",
    "indicator",
    "last_save_time",
    "metric",
    "ml_per_pulse",
    "usage",
];

/// How a pulse is made visible on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// No visual feedback
    None,
    /// Toggle the status LED on every pulse
    Blink,
    /// Show readings on the OLED panel
    Oled,
}

impl Indicator {
    /// All variants; the first one is what unknown tokens coerce to.
    pub const ALL: [Indicator; 3] = [Self::None, Self::Blink, Self::Oled];

    /// Token written to storage
    pub const fn token(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Blink => "blnk",
            Self::Oled => "oled",
        }
    }

    /// Parse a stored token. `blink` is accepted as an alias of `blnk`.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "none" => Some(Self::None),
            "blnk" | "blink" => Some(Self::Blink),
            "oled" => Some(Self::Oled),
            _ => None,
        }
    }

    /// Parse a stored token, coercing anything unrecognized to the first variant.
    pub fn from_token_or_first(token: &str) -> Self {
        Self::from_token(token).unwrap_or_else(|| {
            debug!("Unknown indicator `{}`, using `{}`", token, Self::ALL[0]);
            Self::ALL[0]
        })
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Canonical in-memory snapshot of everything that survives a power cycle.
///
/// Built from compiled constants at startup, then replaced wholesale by
/// whatever the storage backend loads. Only the sync coordinator mutates it.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    pub hostname: String,
    pub indicator: Indicator,
    /// Naive local time of the last successful save
    pub last_save_time: NaiveDateTime,
    /// Report litres when true, US gallons otherwise
    pub metric: bool,
    /// Calibration: millilitres of fluid per sensor pulse
    pub ml_per_pulse: f32,
    /// Cumulative pulse count
    pub usage: u32,
}

impl Default for StateRecord {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            indicator: DEFAULT_INDICATOR,
            last_save_time: NaiveDateTime::default(),
            metric: DEFAULT_METRIC,
            ml_per_pulse: DEFAULT_ML_PER_PULSE,
            usage: 0,
        }
    }
}

impl StateRecord {
    /// Check the invariants every backend relies on before encoding.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !is_valid_calibration(self.ml_per_pulse) {
            return Err("ml_per_pulse must be positive and finite");
        }
        if self.hostname.is_empty() {
            return Err("hostname must not be empty");
        }
        if self.hostname.contains([',', '\n', '\r']) {
            return Err("hostname must not contain commas or line breaks");
        }
        Ok(())
    }

    /// The record as string-valued `(key, value)` pairs in schema order.
    ///
    /// `metric` is spelled `True`/`False`, matching what older key-value
    /// stores on deployed devices contain.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        alloc::vec![
            ("hostname", self.hostname.clone()),
            ("indicator", self.indicator.token().to_string()),
            ("last_save_time", time_codec::encode(self.last_save_time)),
            ("metric", String::from(if self.metric { "True" } else { "False" })),
            ("ml_per_pulse", self.ml_per_pulse.to_string()),
            ("usage", self.usage.to_string()),
        ]
    }
}

/// Calibration values must be strictly positive and finite.
pub fn is_valid_calibration(ml_per_pulse: f32) -> bool {
    ml_per_pulse.is_finite() && ml_per_pulse > 0.0
}

pub(crate) fn parse_metric(value: &str) -> Result<bool, FormatError> {
    match value.trim() {
        "1" | "True" | "true" => Ok(true),
        "0" | "False" | "false" => Ok(false),
        other => Err(invalid("metric", other)),
    }
}

pub(crate) fn parse_usage(value: &str) -> Result<u32, FormatError> {
    value.trim().parse().map_err(|_| invalid("usage", value))
}

pub(crate) fn parse_ml_per_pulse(value: &str) -> Result<f32, FormatError> {
    value
        .trim()
        .parse()
        .ok()
        .filter(|v| is_valid_calibration(*v))
        .ok_or_else(|| invalid("ml_per_pulse", value))
}

pub(crate) fn parse_hostname(value: &str) -> Result<String, FormatError> {
    if value.is_empty() {
        return Err(invalid("hostname", value));
    }
    Ok(value.to_string())
}

fn invalid(field: &'static str, value: &str) -> FormatError {
    FormatError::InvalidField {
        field,
        value: value.to_string(),
    }
}
