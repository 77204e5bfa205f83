//! ==============================================================================
//! error.rs - error types for each layer of the host
//! ==============================================================================
//!
//! purpose:
//!     one enum per layer, so callers match on what actually went wrong:
//!     - SourceError: unavailable vs corrupt source (the store treats them
//!       differently)
//!     - StoreError, WindowError, ExportError: store, window and export layers
//!     - ApiError: the http edge, which knows its own status codes and
//!       renders as {"error": "..."}
//!
//!     main.rs and config loading use anyhow instead.
//!
//! relationships:
//!     - used by: source.rs, store.rs, window.rs, export.rs, server.rs
//!
//! ==============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failure to load records from a backing source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source could not be read right now (I/O, permissions).
    #[error("Read error: {0}")]
    Unavailable(String),

    /// The source was read but its content is not a readings array.
    #[error("Parse error: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading store is closed")]
    Closed,

    #[error("refresh task failed: {0}")]
    Join(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum WindowError {
    #[error("unknown time filter '{0}' (expected 10, 30, 1h, 6h, 24h or all)")]
    Unknown(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unknown export format '{0}' (expected csv or excel)")]
    UnknownFormat(String),

    #[error("Nothing to export")]
    NothingToExport,

    #[error("excel export failed: {0}")]
    Excel(#[from] rust_xlsxwriter::XlsxError),
}

/// Errors surfaced by the http handlers. Every variant renders as
/// `{"error": "..."}` with the matching status code.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Device code is required")]
    MissingDeviceCode,

    #[error("Invalid device code")]
    InvalidDeviceCode,

    #[error("{0}")]
    BadRequest(String),

    #[error("No readings available")]
    NoReadings,

    #[error(transparent)]
    Export(#[from] ExportError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingDeviceCode | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidDeviceCode => StatusCode::UNAUTHORIZED,
            ApiError::NoReadings => StatusCode::NOT_FOUND,
            ApiError::Export(ExportError::Excel(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Export(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
