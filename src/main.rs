//! ==============================================================================
//! main.rs - air quality host entry point
//! ==============================================================================
//!
//! purpose:
//!     serves air-quality readings to the dashboard. readings come from a
//!     json file written by a logger, or from the built-in synthetic
//!     generator when no logger is attached.
//!
//! responsibilities:
//!     - load host.toml (or defaults) and set up tracing
//!     - open the reading store on the configured source
//!     - start the refresh driver (poll timer + file watcher)
//!     - serve the http api until ctrl-c, then close the store
//!
//! relationships:
//!     - uses: config.rs (host.toml schema)
//!     - uses: store.rs, source.rs (reading store and its backing source)
//!     - uses: refresh.rs (background refresh, file watcher)
//!     - uses: server.rs (axum router)
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    rust host (this file)                     │
//!     │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//!     │  │ refresh     │  │ web server  │  │ file watcher        │  │
//!     │  │ (timer)     │  │ (port 3000) │  │ (notify, debounced) │  │
//!     │  └──────┬──────┘  └──────┬──────┘  └──────────┬──────────┘  │
//!     │         │                │                    │             │
//!     │         └────────────────┼────────────────────┘             │
//!     │                          │                                  │
//!     │                    ┌─────┴─────┐                            │
//!     │                    │   store   │ <- store.rs                │
//!     │                    └─────┬─────┘                            │
//!     │          (Clone-able handle to the current snapshot)        │
//!     └──────────────────────────┼──────────────────────────────────┘
//!                                │
//!                    ┌───────────┴───────────┐
//!                    ▼                       ▼
//!             ┌─────────────┐         ┌─────────────┐
//!             │ readings    │         │ synthetic   │
//!             │   .json     │         │ generator   │
//!             └─────────────┘         └─────────────┘
//!
//! ==============================================================================

mod config;
mod domain;
mod error;
mod evaluator;
mod export;
mod projection;
mod refresh;
mod server;
mod source;
mod store;
mod window;

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::{HostConfig, SourceKind};
use crate::evaluator::{ThresholdEvaluator, WarningHistory};
use crate::projection::TimeLabels;
use crate::source::{FileSource, ReadingSource, SyntheticGenerator, SyntheticSource};
use crate::store::{ReadingStore, StoreOptions};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Air Quality Host");
    println!("  readings -> thresholds -> charts");
    println!("===========================================================");

    // step 1: load configuration (explicit path as first argument wins)
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = HostConfig::load(&path)?;
            println!("[CONFIG] Loaded from {}", path);
            config
        }
        None => HostConfig::load_or_default(),
    };
    config.print_summary();

    // RUST_LOG overrides logging.level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // step 2: threshold table and the source behind the store
    let thresholds = config.threshold_table()?;
    let generator = || {
        SyntheticGenerator::new(
            config.source.synthetic_parameters.clone(),
            thresholds.clone(),
            config.source.seed,
        )
    };

    let source: Box<dyn ReadingSource> = match config.source.kind {
        SourceKind::File => Box::new(FileSource::new(&config.source.path)),
        SourceKind::Synthetic => Box::new(SyntheticSource::new(
            generator(),
            config.source.synthetic_capacity,
        )),
    };

    // step 3: open the store (first load happens here)
    println!("\n[STARTUP] Opening reading store...");
    let store = ReadingStore::open(
        source,
        generator(),
        StoreOptions {
            synthetic_fallback: config.store.synthetic_fallback,
        },
    )
    .await?;
    let status = store.status();
    println!(
        "[STARTUP] ✓ {} readings from {}{}",
        status.readings,
        status.source,
        if status.synthetic_fallback { " (synthetic fallback)" } else { "" }
    );

    // step 4: refresh driver, fed by the file watcher when enabled
    let (events_tx, events_rx) = mpsc::channel(refresh::EVENT_BUFFER);
    let _watcher = match config.source.kind {
        SourceKind::File if config.source.watch => {
            match refresh::watch_file(&config.source.path, events_tx) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    println!("[STARTUP] ⚠ File watcher unavailable, polling only: {}", e);
                    None
                }
            }
        }
        _ => None,
    };
    let driver = refresh::spawn(
        store.clone(),
        refresh::RefreshOptions {
            interval: config.poll_interval(),
            debounce: config.debounce(),
            show_sensor_data: config.logging.show_sensor_data,
        },
        events_rx,
    );

    // step 5: web server until ctrl-c
    let state = server::AppState {
        store: store.clone(),
        evaluator: ThresholdEvaluator::new(Arc::new(thresholds)),
        history: Arc::new(Mutex::new(WarningHistory::new(config.warning_retention()?))),
        labels: TimeLabels::from_offset_minutes(config.display.utc_offset_minutes),
        empty_policy: config.window.policy(),
        device_codes: Arc::new(config.access.device_codes.clone()),
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("[STARTUP] ✓ API live at http://{}", config.server.bind);
    println!("────────────────────────────────────────────────────────────");

    let shutdown_store = store.clone();
    server::serve(listener, state, async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c, running until killed");
            std::future::pending::<()>().await;
        }
        println!("\n[SHUTDOWN] Closing reading store...");
        shutdown_store.close();
    })
    .await?;

    store.close();
    driver.await?;
    println!("[SHUTDOWN] ✓ Done");
    Ok(())
}
