//! ==============================================================================
//! domain.rs - readings, thresholds, warnings and chart records
//! ==============================================================================
//!
//! purpose:
//!     the shared vocabulary of the host. everything downstream of the store
//!     (window filter, evaluator, projection, export, http api) speaks in
//!     these types.
//!
//! relationships:
//!     - used by: source.rs (raw records -> readings)
//!     - used by: evaluator.rs (threshold table, warnings)
//!     - used by: projection.rs (chart points, device data)
//!
//! ==============================================================================

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// one record as it appears in the readings file
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// name of the timestamp field in a raw record
pub const TIMESTAMP_FIELD: &str = "timestamp";

// ==============================================================================
// parameters
// ==============================================================================

/// the nine measured parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parameter {
    Temperature,
    Humidity,
    Pm25,
    Voc,
    O3,
    Co,
    Co2,
    No2,
    So2,
}

impl Parameter {
    pub const ALL: [Parameter; 9] = [
        Parameter::Temperature,
        Parameter::Humidity,
        Parameter::Pm25,
        Parameter::Voc,
        Parameter::O3,
        Parameter::Co,
        Parameter::Co2,
        Parameter::No2,
        Parameter::So2,
    ];

    /// short key used in query strings, json fields and warning keys
    pub fn key(self) -> &'static str {
        match self {
            Parameter::Temperature => "temperature",
            Parameter::Humidity => "humidity",
            Parameter::Pm25 => "pm25",
            Parameter::Voc => "voc",
            Parameter::O3 => "o3",
            Parameter::Co => "co",
            Parameter::Co2 => "co2",
            Parameter::No2 => "no2",
            Parameter::So2 => "so2",
        }
    }

    /// label used by the sensor logger when it writes the readings file
    pub fn source_label(self) -> &'static str {
        match self {
            Parameter::Temperature => "Temperature (°C)",
            Parameter::Humidity => "Humidity (%)",
            Parameter::Pm25 => "PM2.5 (ug/m3)",
            Parameter::Voc => "VOCs (ppm)",
            Parameter::O3 => "O3 (ppm)",
            Parameter::Co => "CO (ppm)",
            Parameter::Co2 => "CO2 (ppm)",
            Parameter::No2 => "NO2 (ppm)",
            Parameter::So2 => "SO2 (ppm)",
        }
    }

    /// human label used for export headers
    pub fn display_label(self) -> &'static str {
        match self {
            Parameter::Temperature => "Temperature (°C)",
            Parameter::Humidity => "Humidity (%)",
            Parameter::Pm25 => "PM2.5 (µg/m³)",
            Parameter::Voc => "VOC (ppm)",
            Parameter::O3 => "Ozone (O₃) (ppm)",
            Parameter::Co => "Carbon Monoxide (CO) (ppm)",
            Parameter::Co2 => "Carbon Dioxide (CO₂) (ppm)",
            Parameter::No2 => "Nitrogen Dioxide (NO₂) (ppm)",
            Parameter::So2 => "Sulfur Dioxide (SO₂) (ppm)",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Parameter::Temperature => "°C",
            Parameter::Humidity => "%",
            Parameter::Pm25 => "µg/m³",
            _ => "ppm",
        }
    }

    /// match a raw record field name, either the source label or the short key
    pub fn from_field(field: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.source_label() == field || p.key() == field)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Parameter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.key() == s)
            .ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

// ==============================================================================
// readings
// ==============================================================================

/// one timestamped observation across any subset of the parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<Parameter, f64>,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            values: BTreeMap::new(),
        }
    }

    /// builder-style setter, mostly for tests and the synthetic generator
    pub fn with(mut self, parameter: Parameter, value: f64) -> Self {
        self.values.insert(parameter, value);
        self
    }

    pub fn value(&self, parameter: Parameter) -> Option<f64> {
        self.values.get(&parameter).copied()
    }

    /// Parse a raw record.
    ///
    /// Returns `None` when the record has no parseable timestamp. Fields that
    /// are not one of the nine parameters are ignored; values that are neither
    /// numbers nor numeric strings are dropped.
    pub fn from_record(record: &RawRecord) -> Option<Self> {
        let timestamp = record
            .get(TIMESTAMP_FIELD)
            .and_then(|v| v.as_str())
            .and_then(parse_timestamp)?;

        let mut reading = Reading::new(timestamp);
        for (field, value) in record {
            let Some(parameter) = Parameter::from_field(field) else {
                continue;
            };
            let number = match value {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            if let Some(number) = number {
                reading.values.insert(parameter, number);
            }
        }
        Some(reading)
    }

    /// Inverse of `from_record`, using the source labels.
    pub fn to_record(&self) -> RawRecord {
        let mut record = RawRecord::new();
        for (parameter, value) in &self.values {
            if let Some(number) = serde_json::Number::from_f64(*value) {
                record.insert(
                    parameter.source_label().to_string(),
                    serde_json::Value::Number(number),
                );
            }
        }
        record.insert(
            TIMESTAMP_FIELD.to_string(),
            serde_json::Value::String(format_timestamp(&self.timestamp)),
        );
        record
    }
}

/// parse an iso-8601 timestamp; naive timestamps are taken as utc
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// canonical timestamp rendering: rfc 3339, millisecond precision, `Z`
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ==============================================================================
// thresholds
// ==============================================================================

/// warning bounds for one parameter; `low <= 0` disables the low check
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub low: f64,
    pub high: f64,
}

impl Threshold {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn has_low_bound(&self) -> bool {
        self.low > 0.0
    }
}

/// The one threshold lookup shared by the evaluator and status formatting.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    entries: BTreeMap<Parameter, Threshold>,
}

impl ThresholdTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, parameter: Parameter) -> Option<&Threshold> {
        self.entries.get(&parameter)
    }

    pub fn set(&mut self, parameter: Parameter, threshold: Threshold) {
        self.entries.insert(parameter, threshold);
    }

    /// entries in parameter order
    pub fn iter(&self) -> impl Iterator<Item = (Parameter, &Threshold)> {
        self.entries.iter().map(|(p, t)| (*p, t))
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.set(Parameter::Temperature, Threshold::new(22.0, 28.0));
        table.set(Parameter::Humidity, Threshold::new(40.0, 60.0));
        table.set(Parameter::Pm25, Threshold::new(0.0, 4.0));
        table.set(Parameter::Voc, Threshold::new(0.0, 0.05));
        table.set(Parameter::O3, Threshold::new(0.0, 0.3));
        table.set(Parameter::Co, Threshold::new(0.0, 8.73));
        table.set(Parameter::Co2, Threshold::new(0.0, 500.0));
        table.set(Parameter::No2, Threshold::new(0.0, 5.0));
        table.set(Parameter::So2, Threshold::new(0.0, 5.0));
        table
    }
}

// ==============================================================================
// warnings
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    High,
    Low,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::High => f.write_str("high"),
            Direction::Low => f.write_str("low"),
        }
    }
}

/// A threshold breach. Created by the evaluator, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub parameter: Parameter,
    pub direction: Direction,
    pub observed_value: f64,
    pub threshold_value: f64,
    pub timestamp: DateTime<Utc>,
    pub unit: &'static str,
}

impl Warning {
    /// stable identity: `parameter|direction|timestamp`
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.parameter,
            self.direction,
            format_timestamp(&self.timestamp)
        )
    }

    /// e.g. "High CO2"
    pub fn title(&self) -> String {
        let direction = match self.direction {
            Direction::High => "High",
            Direction::Low => "Low",
        };
        format!("{} {}", direction, self.parameter.key().to_uppercase())
    }

    /// e.g. "Value: 600.0ppm (Threshold: 500ppm)"
    pub fn message(&self) -> String {
        format!(
            "Value: {:.1}{} (Threshold: {}{})",
            self.observed_value, self.unit, self.threshold_value, self.unit
        )
    }
}

// ==============================================================================
// chart-ready records
// ==============================================================================

/// one reading, denormalized for charts and export
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartPoint {
    /// display label produced by the time formatter
    pub time: String,
    /// canonical timestamp for machine consumers
    pub timestamp: String,
    pub temperature: f64,
    pub humidity: f64,
    pub pm25: f64,
    pub voc: f64,
    pub o3: f64,
    pub co: f64,
    pub co2: f64,
    pub no2: f64,
    pub so2: f64,
}

impl ChartPoint {
    pub fn value(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::Temperature => self.temperature,
            Parameter::Humidity => self.humidity,
            Parameter::Pm25 => self.pm25,
            Parameter::Voc => self.voc,
            Parameter::O3 => self.o3,
            Parameter::Co => self.co,
            Parameter::Co2 => self.co2,
            Parameter::No2 => self.no2,
            Parameter::So2 => self.so2,
        }
    }
}

/// Parallel per-parameter series, index-aligned with `timestamp`.
///
/// This is the payload of the readings endpoint: `temperature[i]` was
/// observed at `timestamp[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    pub temperature: Vec<f64>,
    pub humidity: Vec<f64>,
    pub pm25: Vec<f64>,
    pub voc: Vec<f64>,
    pub o3: Vec<f64>,
    pub co: Vec<f64>,
    pub co2: Vec<f64>,
    pub no2: Vec<f64>,
    pub so2: Vec<f64>,
    pub timestamp: Vec<String>,
}

impl DeviceData {
    pub fn series(&self, parameter: Parameter) -> &[f64] {
        match parameter {
            Parameter::Temperature => &self.temperature,
            Parameter::Humidity => &self.humidity,
            Parameter::Pm25 => &self.pm25,
            Parameter::Voc => &self.voc,
            Parameter::O3 => &self.o3,
            Parameter::Co => &self.co,
            Parameter::Co2 => &self.co2,
            Parameter::No2 => &self.no2,
            Parameter::So2 => &self.so2,
        }
    }

    pub fn series_mut(&mut self, parameter: Parameter) -> &mut Vec<f64> {
        match parameter {
            Parameter::Temperature => &mut self.temperature,
            Parameter::Humidity => &mut self.humidity,
            Parameter::Pm25 => &mut self.pm25,
            Parameter::Voc => &mut self.voc,
            Parameter::O3 => &mut self.o3,
            Parameter::Co => &mut self.co,
            Parameter::Co2 => &mut self.co2,
            Parameter::No2 => &mut self.no2,
            Parameter::So2 => &mut self.so2,
        }
    }

    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(value: serde_json::Value) -> RawRecord {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_record_with_source_labels() {
        let r = Reading::from_record(&record(json!({
            "CO2 (ppm)": 612.5,
            "PM2.5 (ug/m3)": 3.1,
            "VOCs (ppm)": "0.02",
            "timestamp": "2025-04-18T16:22:00.000Z"
        })))
        .unwrap();

        assert_eq!(r.timestamp, Utc.with_ymd_and_hms(2025, 4, 18, 16, 22, 0).unwrap());
        assert_eq!(r.value(Parameter::Co2), Some(612.5));
        assert_eq!(r.value(Parameter::Pm25), Some(3.1));
        assert_eq!(r.value(Parameter::Voc), Some(0.02));
        assert_eq!(r.value(Parameter::Temperature), None);
    }

    #[test]
    fn test_parse_record_accepts_keys_and_drops_junk() {
        let r = Reading::from_record(&record(json!({
            "co2": 450,
            "humidity": null,
            "o3": "n/a",
            "device": "abc",
            "timestamp": "2025-04-18T16:22:00"
        })))
        .unwrap();

        assert_eq!(r.value(Parameter::Co2), Some(450.0));
        assert_eq!(r.values.len(), 1);
    }

    #[test]
    fn test_record_without_timestamp_is_invalid() {
        assert!(Reading::from_record(&record(json!({ "co2": 450 }))).is_none());
        assert!(Reading::from_record(&record(json!({ "co2": 450, "timestamp": "yesterday" }))).is_none());
        assert!(Reading::from_record(&record(json!({ "co2": 450, "timestamp": 12 }))).is_none());
    }

    #[test]
    fn test_parse_timestamp_offsets_normalize_to_utc() {
        let ts = parse_timestamp("2025-04-18T18:22:00+02:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2025-04-18T16:22:00.000Z");
    }

    #[test]
    fn test_to_record_uses_source_labels() {
        let ts = Utc.with_ymd_and_hms(2025, 4, 18, 16, 22, 0).unwrap();
        let reading = Reading::new(ts).with(Parameter::Pm25, 2.5);
        let rec = reading.to_record();
        assert_eq!(rec.get("PM2.5 (ug/m3)"), Some(&json!(2.5)));
        assert_eq!(Reading::from_record(&rec), Some(reading));
    }

    #[test]
    fn test_default_thresholds() {
        let table = ThresholdTable::default();
        assert_eq!(table.iter().count(), 9);
        assert_eq!(table.get(Parameter::Co), Some(&Threshold::new(0.0, 8.73)));
        assert!(table.get(Parameter::Temperature).unwrap().has_low_bound());
        assert!(!table.get(Parameter::Co2).unwrap().has_low_bound());
    }

    #[test]
    fn test_warning_presentation() {
        let w = Warning {
            parameter: Parameter::Co2,
            direction: Direction::High,
            observed_value: 600.0,
            threshold_value: 500.0,
            timestamp: Utc.with_ymd_and_hms(2025, 4, 18, 16, 22, 30).unwrap(),
            unit: "ppm",
        };
        assert_eq!(w.key(), "co2|high|2025-04-18T16:22:30.000Z");
        assert_eq!(w.title(), "High CO2");
        assert_eq!(w.message(), "Value: 600.0ppm (Threshold: 500ppm)");
    }

    #[test]
    fn test_parameter_lookup() {
        assert_eq!("pm25".parse::<Parameter>(), Ok(Parameter::Pm25));
        assert!("PM2.5".parse::<Parameter>().is_err());
        assert_eq!(Parameter::from_field("SO2 (ppm)"), Some(Parameter::So2));
        assert_eq!(serde_json::to_string(&Parameter::No2).unwrap(), "\"no2\"");
    }
}
