//! Conversion of pulse counts into fluid volume for reporting

use alloc::format;
use alloc::string::String;

use chrono::{Datelike, NaiveDateTime, Timelike};
use serde::Serialize;

use crate::record::StateRecord;

pub const ML_PER_LITRE: f64 = 1000.0;
pub const LITRES_PER_GALLON: f64 = 3.78541;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VolumeUnit {
    #[serde(rename = "litre")]
    Litre,
    /// US gallon
    #[serde(rename = "gal")]
    Gallon,
}

/// Volume represented by `pulses` at the given calibration.
pub fn volume(pulses: u32, ml_per_pulse: f32, metric: bool) -> (f64, VolumeUnit) {
    let litres = f64::from(pulses) * f64::from(ml_per_pulse) / ML_PER_LITRE;
    if metric {
        (litres, VolumeUnit::Litre)
    } else {
        (litres / LITRES_PER_GALLON, VolumeUnit::Gallon)
    }
}

/// Usage payload served to the API collaborator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    /// `YYYY-MM-DD hh:mm:ss.mmm`, naive local time
    pub timestamp: String,
    pub unit: VolumeUnit,
    pub volume: f64,
    pub pulses: u32,
    /// Calibration in millilitres per pulse
    pub k: f32,
}

impl UsageReport {
    pub fn new(record: &StateRecord, pulses: u32, now: NaiveDateTime) -> Self {
        let (volume, unit) = volume(pulses, record.ml_per_pulse, record.metric);
        Self {
            timestamp: format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
                now.year(),
                now.month(),
                now.day(),
                now.hour(),
                now.minute(),
                now.second(),
                now.nanosecond() / 1_000_000 % 1000
            ),
            unit,
            volume,
            pulses,
            k: record.ml_per_pulse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn metric_volume_is_litres() {
        let (v, unit) = volume(1000, 1.5, true);
        assert_eq!(unit, VolumeUnit::Litre);
        assert!((v - 1.5).abs() < 1e-9);
    }

    #[test]
    fn imperial_volume_is_us_gallons() {
        let (v, unit) = volume(2_523_607, 1.5, false);
        assert_eq!(unit, VolumeUnit::Gallon);
        assert!((v - 1000.0).abs() < 0.01);
    }

    #[test]
    fn report_serializes_like_the_usage_endpoint() {
        let record = StateRecord::default();
        let now = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(7, 5, 2, 40)
            .unwrap();
        let report = UsageReport::new(&record, 200, now);
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["timestamp"], "2024-03-09 07:05:02.040");
        assert_eq!(json["unit"], "litre");
        assert_eq!(json["pulses"], 200);
        assert_eq!(json["k"], 1.5);
        assert!((json["volume"].as_f64().unwrap() - 0.3).abs() < 1e-9);
    }
}
