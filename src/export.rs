//! ==============================================================================
//! export.rs - csv / excel download artifacts
//! ==============================================================================
//!
//! purpose:
//!     turns a chart point sequence into a tabular download. header row is
//!     `Timestamp, <metric labels...>` in the caller's metric order, each row
//!     is the point's time label followed by the selected values.
//!
//! ==============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_xlsxwriter::{Format, Workbook};

use crate::domain::{ChartPoint, Parameter};
use crate::error::ExportError;

pub const FILE_NAME_PREFIX: &str = "air_quality_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Excel,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Excel => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "xlsx",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Csv => f.write_str("csv"),
            ExportFormat::Excel => f.write_str("excel"),
        }
    }
}

/// A finished download.
#[derive(Debug, Clone)]
pub struct Export {
    pub format: ExportFormat,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub fn headers(metrics: &[Parameter]) -> Vec<String> {
    std::iter::once("Timestamp".to_string())
        .chain(metrics.iter().map(|m| m.display_label().to_string()))
        .collect()
}

/// Build the artifact. `created_at` only feeds the file name.
pub fn export(
    points: &[ChartPoint],
    metrics: &[Parameter],
    format: ExportFormat,
    created_at: DateTime<Utc>,
) -> Result<Export, ExportError> {
    if points.is_empty() || metrics.is_empty() {
        return Err(ExportError::NothingToExport);
    }

    let bytes = match format {
        ExportFormat::Csv => to_csv(points, metrics).into_bytes(),
        ExportFormat::Excel => to_excel(points, metrics)?,
    };

    Ok(Export {
        format,
        file_name: format!(
            "{}_{}.{}",
            FILE_NAME_PREFIX,
            created_at.format("%Y-%m-%dT%H-%M-%S"),
            format.extension()
        ),
        bytes,
    })
}

fn quote(cell: &str) -> String {
    format!("\"{}\"", cell.replace('"', "\"\""))
}

pub fn to_csv(points: &[ChartPoint], metrics: &[Parameter]) -> String {
    let mut lines = Vec::with_capacity(points.len() + 1);
    lines.push(headers(metrics).join(","));
    for point in points {
        let row: Vec<String> = std::iter::once(quote(&point.time))
            .chain(metrics.iter().map(|m| quote(&point.value(*m).to_string())))
            .collect();
        lines.push(row.join(","));
    }
    lines.join("\n")
}

pub fn to_excel(points: &[ChartPoint], metrics: &[Parameter]) -> Result<Vec<u8>, ExportError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();

    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Data")?;

    for (col, header) in headers(metrics).iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, header.as_str(), &header_format)?;
    }

    for (i, point) in points.iter().enumerate() {
        let row = (i + 1) as u32;
        worksheet.write_string(row, 0, point.time.as_str())?;
        for (j, metric) in metrics.iter().enumerate() {
            worksheet.write_number(row, (j + 1) as u16, point.value(*metric))?;
        }
    }

    Ok(workbook.save_to_buffer()?)
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(time: &str, co2: f64, pm25: f64) -> ChartPoint {
        ChartPoint {
            time: time.to_string(),
            timestamp: "2025-04-18T16:22:00.000Z".to_string(),
            temperature: 0.0,
            humidity: 0.0,
            pm25,
            voc: 0.0,
            o3: 0.0,
            co: 0.0,
            co2,
            no2: 0.0,
            so2: 0.0,
        }
    }

    fn created_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 18, 17, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("csv".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("Excel".parse::<ExportFormat>().unwrap(), ExportFormat::Excel);
        assert!(matches!(
            "pdf".parse::<ExportFormat>(),
            Err(ExportError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_csv_layout() {
        let points = vec![
            point("Apr 18, 2025, 04:22:00 PM", 612.0, 3.2),
            point("Apr 18, 2025, 04:22:30 PM", 450.5, 0.0),
        ];
        let csv = to_csv(&points, &[Parameter::Co2, Parameter::Pm25]);
        let lines: Vec<&str> = csv.lines().collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Timestamp,Carbon Dioxide (CO₂) (ppm),PM2.5 (µg/m³)");
        assert_eq!(lines[1], r#""Apr 18, 2025, 04:22:00 PM","612","3.2""#);
        assert_eq!(lines[2], r#""Apr 18, 2025, 04:22:30 PM","450.5","0""#);
    }

    #[test]
    fn test_csv_respects_metric_order() {
        let points = vec![point("t", 1.0, 2.0)];
        let csv = to_csv(&points, &[Parameter::Pm25, Parameter::Co2]);
        assert!(csv.ends_with(r#""t","2","1""#));
    }

    #[test]
    fn test_csv_escapes_quotes() {
        let points = vec![point(r#"odd "label""#, 1.0, 2.0)];
        let csv = to_csv(&points, &[Parameter::Co2]);
        assert!(csv.ends_with(r#""odd ""label""","1""#));
    }

    #[test]
    fn test_export_file_name() {
        let points = vec![point("t", 1.0, 2.0)];
        let out = export(&points, &[Parameter::Co2], ExportFormat::Csv, created_at()).unwrap();
        assert_eq!(out.file_name, "air_quality_data_2025-04-18T17-00-00.csv");
        assert_eq!(out.format.content_type(), "text/csv; charset=utf-8");
    }

    #[test]
    fn test_nothing_to_export() {
        let points = vec![point("t", 1.0, 2.0)];
        assert!(matches!(
            export(&points, &[], ExportFormat::Csv, created_at()),
            Err(ExportError::NothingToExport)
        ));
        assert!(matches!(
            export(&[], &[Parameter::Co2], ExportFormat::Excel, created_at()),
            Err(ExportError::NothingToExport)
        ));
    }

    #[test]
    fn test_excel_is_a_zip_container() {
        let points = vec![point("t", 1.0, 2.0), point("u", 3.0, 4.0)];
        let out = export(
            &points,
            &Parameter::ALL,
            ExportFormat::Excel,
            created_at(),
        )
        .unwrap();
        assert!(out.file_name.ends_with(".xlsx"));
        assert_eq!(&out.bytes[..2], b"PK");
    }
}
