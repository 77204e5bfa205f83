//! ==============================================================================
//! projection.rs - chart points and index-aligned device data
//! ==============================================================================
//!
//! purpose:
//!     turns a filtered reading window into what the dashboard draws:
//!     - chart points: one per reading, values rounded to one decimal,
//!       with a full time label at a fixed utc offset
//!     - device data: parallel series, one entry per reading per parameter,
//!       values passed through unrounded
//!
//!     everything here is pure. no clock, no randomness: the same window
//!     always produces the same output.
//!
//! relationships:
//!     - uses: domain.rs (Reading, ChartPoint, DeviceData)
//!     - used by: server.rs (chart, readings and latest routes)
//!
//! ==============================================================================

use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::domain::{format_timestamp, ChartPoint, DeviceData, Parameter, Reading};

/// Formats reading timestamps for display at a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct TimeLabels {
    offset: FixedOffset,
}

impl TimeLabels {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    /// `offset_minutes` east of UTC; out-of-range offsets fall back to UTC
    pub fn from_offset_minutes(offset_minutes: i32) -> Self {
        let offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(utc_offset);
        Self::new(offset)
    }

    /// e.g. "Apr 18, 2025, 04:22:00 PM"
    pub fn full(&self, ts: &DateTime<Utc>) -> String {
        ts.with_timezone(&self.offset)
            .format("%b %-d, %Y, %I:%M:%S %p")
            .to_string()
    }

    /// e.g. "16:22", for axis ticks
    pub fn short(&self, ts: &DateTime<Utc>) -> String {
        ts.with_timezone(&self.offset).format("%H:%M").to_string()
    }
}

impl Default for TimeLabels {
    fn default() -> Self {
        Self::new(utc_offset())
    }
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// Round to one decimal; non-finite values become 0.
fn display_value(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => {
            let rounded = (v * 10.0).round() / 10.0;
            if !rounded.is_finite() {
                // v * 10 overflows near f64::MAX; such values have no decimals anyway
                v
            } else if rounded == 0.0 {
                // avoid "-0.0" in the json output
                0.0
            } else {
                rounded
            }
        }
        _ => 0.0,
    }
}

fn raw_value(value: Option<f64>) -> f64 {
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

pub fn chart_point(reading: &Reading, labels: &TimeLabels) -> ChartPoint {
    let v = |p: Parameter| display_value(reading.value(p));
    ChartPoint {
        time: labels.full(&reading.timestamp),
        timestamp: format_timestamp(&reading.timestamp),
        temperature: v(Parameter::Temperature),
        humidity: v(Parameter::Humidity),
        pm25: v(Parameter::Pm25),
        voc: v(Parameter::Voc),
        o3: v(Parameter::O3),
        co: v(Parameter::Co),
        co2: v(Parameter::Co2),
        no2: v(Parameter::No2),
        so2: v(Parameter::So2),
    }
}

/// One chart point per reading, same order.
pub fn chart_points(readings: &[Reading], labels: &TimeLabels) -> Vec<ChartPoint> {
    readings.iter().map(|r| chart_point(r, labels)).collect()
}

/// Parallel series for the readings endpoint. Values are not rounded.
pub fn device_data(readings: &[Reading]) -> DeviceData {
    let mut data = DeviceData::default();
    for reading in readings {
        data.timestamp.push(format_timestamp(&reading.timestamp));
        for parameter in Parameter::ALL {
            data.series_mut(parameter)
                .push(raw_value(reading.value(parameter)));
        }
    }
    data
}
