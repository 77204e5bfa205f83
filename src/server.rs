//! ==============================================================================
//! server.rs - http api and status page
//! ==============================================================================
//!
//! purpose:
//!     serves the reading store to the browser. every device request runs
//!     the same pipeline over one snapshot:
//!
//!         snapshot -> window filter -> evaluator / projection / export
//!
//!     so the chart, the warnings and an export made at the same moment all
//!     describe the same readings.
//!
//! routes:
//!     POST /api/device/validate   device code check
//!     GET  /api/device/readings   index-aligned series
//!     GET  /api/device/chart      chart points
//!     GET  /api/device/warnings   active / window history / recent log
//!     GET  /api/device/latest     newest value + status per parameter
//!     GET  /api/device/export     csv or xlsx attachment
//!     GET  /api/status            store status
//!     GET  /                      server-rendered status page
//!
//! relationships:
//!     - uses: store.rs, window.rs, evaluator.rs, projection.rs, export.rs
//!     - used by: main.rs (router is served with graceful shutdown)
//!
//! ==============================================================================

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::domain::{Parameter, Threshold, Warning};
use crate::error::ApiError;
use crate::evaluator::{Status, ThresholdEvaluator, WarningHistory};
use crate::export::{self, ExportFormat};
use crate::projection::{self, TimeLabels};
use crate::store::{ReadingStore, Snapshot};
use crate::window::{EmptyWindowPolicy, WindowSpec};

// ==============================================================================
// shared state
// ==============================================================================
// the store already shares its snapshot behind an Arc, so cloning AppState
// per request is cheap. the warning history is the only other mutable state.

#[derive(Clone)]
pub struct AppState {
    pub store: ReadingStore,
    pub evaluator: ThresholdEvaluator,
    pub history: Arc<Mutex<WarningHistory>>,
    pub labels: TimeLabels,
    pub empty_policy: EmptyWindowPolicy,
    /// allow-list; empty accepts any non-blank code
    pub device_codes: Arc<Vec<String>>,
}

impl AppState {
    fn authorize(&self, code: Option<&str>) -> Result<(), ApiError> {
        let code = code.map(str::trim).unwrap_or_default();
        if code.is_empty() {
            return Err(ApiError::MissingDeviceCode);
        }
        if !self.device_codes.is_empty() && !self.device_codes.iter().any(|c| c == code) {
            return Err(ApiError::InvalidDeviceCode);
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Arc<Snapshot>, ApiError> {
        let snapshot = self.store.get_all();
        if snapshot.is_empty() {
            return Err(ApiError::NoReadings);
        }
        Ok(snapshot)
    }
}

/// Query string shared by the device endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceQuery {
    device_code: Option<String>,
    time_filter: Option<String>,
    format: Option<String>,
    metrics: Option<String>,
}

impl DeviceQuery {
    /// missing, blank or unrecognised means "all"
    fn window(&self) -> WindowSpec {
        match self.time_filter.as_deref().map(str::trim) {
            None | Some("") => WindowSpec::All,
            Some(token) => token.parse().unwrap_or_else(|e| {
                tracing::debug!(error = %e, "unrecognised time filter, using all");
                WindowSpec::All
            }),
        }
    }

    /// missing means every parameter, in parameter order
    fn metrics(&self) -> Result<Vec<Parameter>, ApiError> {
        let Some(list) = self.metrics.as_deref() else {
            return Ok(Parameter::ALL.to_vec());
        };
        list.split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|m| m.parse::<Parameter>().map_err(ApiError::BadRequest))
            .collect()
    }

    fn format(&self) -> Result<ExportFormat, ApiError> {
        match self.format.as_deref() {
            None => Ok(ExportFormat::Csv),
            Some(f) => Ok(f.parse()?),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    #[serde(rename = "deviceCode", default)]
    device_code: Option<String>,
}

/// Warning plus its derived presentation fields.
#[derive(Debug, Serialize)]
struct WarningView {
    id: String,
    title: String,
    message: String,
    #[serde(flatten)]
    warning: Warning,
}

impl From<Warning> for WarningView {
    fn from(warning: Warning) -> Self {
        Self {
            id: warning.key(),
            title: warning.title(),
            message: warning.message(),
            warning,
        }
    }
}

fn views(warnings: Vec<Warning>) -> Vec<WarningView> {
    warnings.into_iter().map(WarningView::from).collect()
}

#[derive(Debug, Serialize)]
struct WarningsResponse {
    active: Vec<WarningView>,
    history: Vec<WarningView>,
    recent: Vec<WarningView>,
}

#[derive(Debug, Serialize)]
struct MetricSummary {
    parameter: Parameter,
    label: &'static str,
    unit: &'static str,
    value: Option<f64>,
    status: Option<Status>,
    threshold: Option<Threshold>,
}

#[derive(Debug, Serialize)]
struct LatestResponse {
    timestamp: String,
    time: String,
    synthetic: bool,
    metrics: Vec<MetricSummary>,
    warnings: Vec<WarningView>,
}

// ==============================================================================
// router
// ==============================================================================

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/device/validate", post(validate_handler))
        .route("/api/device/readings", get(readings_handler))
        .route("/api/device/chart", get(chart_handler))
        .route("/api/device/warnings", get(warnings_handler))
        .route("/api/device/latest", get(latest_handler))
        .route("/api/device/export", get(export_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then let in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// readings responses must never be served from a cache
fn no_store<T: IntoResponse>(body: T) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response()
}

// ==============================================================================
// handlers
// ==============================================================================

/// POST /api/device/validate {"deviceCode": "..."}
async fn validate_handler(
    State(state): State<AppState>,
    Json(request): Json<ValidateRequest>,
) -> Result<Response, ApiError> {
    match state.authorize(request.device_code.as_deref()) {
        Ok(()) => Ok(Json(json!({ "success": true })).into_response()),
        Err(ApiError::InvalidDeviceCode) => Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "Invalid device code" })),
        )
            .into_response()),
        Err(e) => Err(e),
    }
}

async fn readings_handler(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.authorize(query.device_code.as_deref())?;
    let spec = query.window();
    let snapshot = state.snapshot()?;
    let readings = spec.apply(snapshot.readings(), Utc::now(), state.empty_policy);

    tracing::debug!(window = %spec, readings = readings.len(), "serving readings");
    Ok(no_store(Json(projection::device_data(readings))))
}

async fn chart_handler(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.authorize(query.device_code.as_deref())?;
    let spec = query.window();
    let snapshot = state.snapshot()?;
    let readings = spec.apply(snapshot.readings(), Utc::now(), state.empty_policy);

    Ok(no_store(Json(projection::chart_points(readings, &state.labels))))
}

async fn warnings_handler(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.authorize(query.device_code.as_deref())?;
    let spec = query.window();
    let snapshot = state.snapshot()?;
    let now = Utc::now();
    let readings = spec.apply(snapshot.readings(), now, state.empty_policy);

    let active = state.evaluator.evaluate_latest(readings);
    let history = state.evaluator.evaluate_history(readings);
    let recent = {
        let mut log = state.history.lock();
        let added = log.record(history.iter().cloned(), now);
        if added > 0 {
            tracing::debug!(added, total = log.len(), "warning history updated");
        }
        log.recent(now)
    };

    Ok(no_store(Json(WarningsResponse {
        active: views(active),
        history: views(history),
        recent: views(recent),
    })))
}

async fn latest_handler(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.authorize(query.device_code.as_deref())?;
    let snapshot = state.snapshot()?;
    let latest = latest_summary(&state, &snapshot).ok_or(ApiError::NoReadings)?;
    Ok(no_store(Json(latest)))
}

fn latest_summary(state: &AppState, snapshot: &Snapshot) -> Option<LatestResponse> {
    let reading = snapshot.latest()?;
    let evaluator = &state.evaluator;

    let metrics = Parameter::ALL
        .iter()
        .map(|&parameter| {
            let value = reading.value(parameter).filter(|v| v.is_finite());
            MetricSummary {
                parameter,
                label: parameter.display_label(),
                unit: parameter.unit(),
                value,
                status: value.map(|v| evaluator.classify(parameter, v)),
                threshold: evaluator.table().get(parameter).copied(),
            }
        })
        .collect();

    Some(LatestResponse {
        timestamp: crate::domain::format_timestamp(&reading.timestamp),
        time: state.labels.full(&reading.timestamp),
        synthetic: snapshot.is_synthetic(),
        metrics,
        warnings: views(evaluator.evaluate_latest(snapshot.readings())),
    })
}

async fn export_handler(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Result<Response, ApiError> {
    state.authorize(query.device_code.as_deref())?;
    let spec = query.window();
    let format = query.format()?;
    let metrics = query.metrics()?;
    let snapshot = state.snapshot()?;
    let now = Utc::now();
    let readings = spec.apply(snapshot.readings(), now, state.empty_policy);

    let points = projection::chart_points(readings, &state.labels);
    let artifact = export::export(&points, &metrics, format, now)?;
    tracing::info!(
        file = %artifact.file_name,
        rows = points.len(),
        bytes = artifact.bytes.len(),
        "export created"
    );

    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);
    Ok((
        [
            (header::CONTENT_TYPE, artifact.format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response())
}

async fn status_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let history = state.history.lock().len();
    Json(json!({
        "store": state.store.status(),
        "warning_history": history,
    }))
}

/// minimal page for a quick look without the browser app
async fn index_handler(State(state): State<AppState>) -> Html<String> {
    let snapshot = state.store.get_all();
    let Some(latest) = latest_summary(&state, &snapshot) else {
        return Html(page(
            "<p>No readings available.</p>".to_string(),
            state.store.description(),
        ));
    };

    let rows: String = latest
        .metrics
        .iter()
        .map(|m| {
            let value = m
                .value
                .map(|v| format!("{:.2} {}", v, m.unit))
                .unwrap_or_else(|| "-".to_string());
            let status = match m.status {
                Some(Status::High) => "high",
                Some(Status::Low) => "low",
                Some(Status::Normal) => "normal",
                None => "",
            };
            format!(
                "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td></tr>",
                status,
                html_escape(m.label),
                html_escape(&value),
                status
            )
        })
        .collect();

    let warnings: String = if latest.warnings.is_empty() {
        "<p>No active warnings.</p>".to_string()
    } else {
        let items: String = latest
            .warnings
            .iter()
            .map(|w| {
                format!(
                    "<li><strong>{}</strong> {}</li>",
                    html_escape(&w.title),
                    html_escape(&w.message)
                )
            })
            .collect();
        format!("<ul>{}</ul>", items)
    };

    let body = format!(
        "<p>Latest reading: {}{}</p>\n<table>{}</table>\n<h2>Active warnings</h2>\n{}",
        html_escape(&latest.time),
        if latest.synthetic { " (synthetic)" } else { "" },
        rows,
        warnings
    );
    Html(page(body, state.store.description()))
}

fn page(body: String, source: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>air quality</title></head>
<body style="font-family: system-ui; padding: 2rem; background: #1a1a2e; color: #eee;">
    <h1>air quality</h1>
    <p style="color: #888;">source: {}</p>
    {}
</body>
</html>"#,
        html_escape(source),
        body
    )
}

/// escape html special characters to prevent xss
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
