//! ==============================================================================
//! refresh.rs - background refresh driver and file watcher
//! ==============================================================================
//!
//! purpose:
//!     keeps the store current. one task waits on three things at once:
//!     - the poll timer (polling.interval_seconds)
//!     - invalidation events (file changed), debounced
//!     - store closure, which ends the task
//!
//!     the watcher only turns filesystem events into `()` messages on a
//!     channel. the store never learns where invalidations come from.
//!
//! relationships:
//!     - uses: store.rs (refresh / invalidate / closed)
//!     - used by: main.rs (spawned once at startup)
//!
//! ==============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::StoreError;
use crate::store::{ReadingStore, RefreshOutcome};

/// Capacity of the invalidation channel. One pending event is enough.
pub const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct RefreshOptions {
    pub interval: Duration,
    pub debounce: Duration,
    /// log the newest reading after each applied refresh
    pub show_sensor_data: bool,
}

pub fn spawn(
    store: ReadingStore,
    options: RefreshOptions,
    events: mpsc::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(run(store, options, events))
}

/// Drive refreshes until the store is closed.
pub async fn run(store: ReadingStore, options: RefreshOptions, mut events: mpsc::Receiver<()>) {
    // the store is loaded on open, so the first tick is one period out
    let mut ticker = tokio::time::interval_at(Instant::now() + options.interval, options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    tracing::info!(
        interval_secs = options.interval.as_secs(),
        debounce_ms = options.debounce.as_millis() as u64,
        "refresh driver started"
    );

    loop {
        tokio::select! {
            _ = store.closed() => break,
            _ = ticker.tick() => {
                apply(&store, false, options.show_sensor_data).await;
            }
            event = events.recv(), if events_open => match event {
                Some(()) => {
                    tokio::time::sleep(options.debounce).await;
                    let mut coalesced = 0;
                    while events.try_recv().is_ok() {
                        coalesced += 1;
                    }
                    tracing::debug!(coalesced, "source change detected");
                    apply(&store, true, options.show_sensor_data).await;
                }
                None => {
                    tracing::debug!("invalidation channel closed");
                    events_open = false;
                }
            },
        }
    }

    tracing::info!("refresh driver stopped");
}

async fn apply(store: &ReadingStore, invalidate: bool, show_sensor_data: bool) {
    let result = if invalidate {
        store.invalidate().await
    } else {
        store.refresh().await
    };

    match result {
        Ok(RefreshOutcome::Updated { readings }) => {
            tracing::debug!(readings, "snapshot updated");
            if show_sensor_data {
                log_latest(store);
            }
        }
        Ok(RefreshOutcome::Unchanged) => tracing::trace!("source unchanged"),
        Ok(outcome) => tracing::debug!(?outcome, "refresh finished"),
        Err(StoreError::Closed) => {}
        Err(e) => tracing::warn!(error = %e, "refresh failed, retrying next tick"),
    }
}

fn log_latest(store: &ReadingStore) {
    let snapshot = store.get_all();
    if let Some(latest) = snapshot.latest() {
        let values: Vec<String> = latest
            .values
            .iter()
            .map(|(p, v)| format!("{}={}", p, v))
            .collect();
        tracing::info!(
            timestamp = %latest.timestamp,
            synthetic = snapshot.is_synthetic(),
            "[SENSOR] {}",
            values.join(" ")
        );
    }
}

// ==============================================================================
// file watcher
// ==============================================================================

/// Watch `path` and send `()` on every create/modify/remove touching it.
///
/// The parent directory is watched rather than the file, so editors that
/// replace the file by rename are still seen. Keep the returned watcher
/// alive for as long as events are wanted.
pub fn watch_file(path: &Path, events: mpsc::Sender<()>) -> notify::Result<RecommendedWatcher> {
    let file_name = path.file_name().map(|n| n.to_os_string());
    let dir: PathBuf = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            );
            let ours = event
                .paths
                .iter()
                .any(|p| p.file_name() == file_name.as_deref());
            if relevant && ours {
                // a full channel already has an event pending
                let _ = events.try_send(());
            }
        }
        Err(e) => tracing::warn!(error = %e, "file watch error"),
    })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %path.display(), "watching readings file");
    Ok(watcher)
}
