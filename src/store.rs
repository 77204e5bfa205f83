//! ==============================================================================
//! store.rs - reading store with immutable snapshots
//! ==============================================================================
//!
//! purpose:
//!     owns the backing source and the current snapshot of readings. every
//!     applied refresh builds a new sorted snapshot and swaps it in whole,
//!     so readers never see a half-updated collection.
//!
//! lifecycle:
//!     open -> refresh / invalidate (any number of times) -> close
//!
//! recovery rules:
//!     - corrupt source      -> reset to empty (fallback applies), log
//!     - unavailable source  -> keep the previous snapshot, log
//!     - empty source        -> one synthetic reading, generated once per
//!                              snapshot so repeated reads agree
//!
//! ordering:
//!     each refresh takes a ticket when it starts. a result is applied only
//!     if no newer refresh has started since; otherwise it is abandoned and
//!     the source is invalidated, so the newer refresh reads the change again.
//!
//! relationships:
//!     - uses: source.rs (ReadingSource, SyntheticGenerator)
//!     - used by: refresh.rs (timer / watcher driven refreshes)
//!     - used by: server.rs (get_all on every request)
//!
//! ==============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;

use crate::domain::{format_timestamp, RawRecord, Reading};
use crate::error::{SourceError, StoreError};
use crate::source::{ReadingSource, SyntheticGenerator};

/// One applied refresh: readings sorted ascending by timestamp.
#[derive(Debug, Clone)]
pub struct Snapshot {
    readings: Vec<Reading>,
    /// ticket of the refresh that produced this snapshot; 0 before the first
    generation: u64,
    loaded_at: DateTime<Utc>,
    rejected: usize,
    synthetic: bool,
}

impl Snapshot {
    fn initial() -> Self {
        Self {
            readings: Vec::new(),
            generation: 0,
            loaded_at: Utc::now(),
            rejected: 0,
            synthetic: false,
        }
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn latest(&self) -> Option<&Reading> {
        self.readings.last()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// true when the source had nothing and this holds the synthetic stand-in
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// a new snapshot was applied
    Updated { readings: usize },
    /// the source reported no change
    Unchanged,
    /// the source was corrupt; the store was reset to empty
    Recovered,
    /// the source could not be read; the previous snapshot stays
    KeptPrevious,
    /// a newer refresh started before this one finished
    Superseded,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// stand in one synthetic reading when the source is empty
    pub synthetic_fallback: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            synthetic_fallback: true,
        }
    }
}

/// Status payload for the api.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub source: String,
    pub generation: u64,
    pub readings: usize,
    pub rejected: usize,
    pub synthetic_fallback: bool,
    pub loaded_at: String,
    pub last_refresh: Option<String>,
    pub last_error: Option<String>,
    pub closed: bool,
}

struct StoreInner {
    source: Mutex<Box<dyn ReadingSource>>,
    fallback: Mutex<SyntheticGenerator>,
    options: StoreOptions,
    description: String,
    snapshot: RwLock<Arc<Snapshot>>,
    /// last ticket handed out
    tickets: AtomicU64,
    closed: AtomicBool,
    close_notify: Notify,
    last_error: RwLock<Option<String>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
}

/// Clone-able handle to the shared store.
#[derive(Clone)]
pub struct ReadingStore {
    inner: Arc<StoreInner>,
}

impl ReadingStore {
    /// Build a store around `source` without loading anything yet.
    pub fn new(
        source: Box<dyn ReadingSource>,
        fallback: SyntheticGenerator,
        options: StoreOptions,
    ) -> Self {
        let description = source.description().to_string();
        Self {
            inner: Arc::new(StoreInner {
                source: Mutex::new(source),
                fallback: Mutex::new(fallback),
                options,
                description,
                snapshot: RwLock::new(Arc::new(Snapshot::initial())),
                tickets: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                close_notify: Notify::new(),
                last_error: RwLock::new(None),
                last_refresh: RwLock::new(None),
            }),
        }
    }

    /// Build the store and load the first snapshot.
    pub async fn open(
        source: Box<dyn ReadingSource>,
        fallback: SyntheticGenerator,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let store = Self::new(source, fallback, options);
        let outcome = store.refresh().await?;
        tracing::info!(source = %store.inner.description, ?outcome, "reading store opened");
        Ok(store)
    }

    /// The current snapshot. Never blocks on a running refresh.
    pub fn get_all(&self) -> Arc<Snapshot> {
        self.inner.snapshot.read().clone()
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Poll the source and apply the result.
    pub async fn refresh(&self) -> Result<RefreshOutcome, StoreError> {
        self.run_refresh(false).await
    }

    /// Drop the source's change tracking, then refresh. Fed by watcher events.
    pub async fn invalidate(&self) -> Result<RefreshOutcome, StoreError> {
        self.run_refresh(true).await
    }

    async fn run_refresh(&self, invalidate: bool) -> Result<RefreshOutcome, StoreError> {
        let ticket = self.begin_refresh()?;
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.poll_and_apply(ticket, invalidate))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))
    }

    /// Poll and apply under the source lock, so polls complete in the order
    /// they read the source.
    fn poll_and_apply(&self, ticket: u64, invalidate: bool) -> RefreshOutcome {
        let mut source = self.inner.source.lock();
        if invalidate {
            source.invalidate();
        }
        let result = source.poll();
        let consumed_change = !matches!(result, Ok(None));

        let outcome = self.complete(ticket, result);
        if outcome == RefreshOutcome::Superseded && consumed_change {
            // hand the change back so the newer refresh still loads it
            source.invalidate();
        }
        outcome
    }

    /// Take a ticket for a refresh that is about to start.
    pub fn begin_refresh(&self) -> Result<u64, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(self.inner.tickets.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Apply the result of the refresh holding `ticket`.
    pub fn complete(
        &self,
        ticket: u64,
        result: Result<Option<Vec<RawRecord>>, SourceError>,
    ) -> RefreshOutcome {
        let now = Utc::now();
        let mut slot = self.inner.snapshot.write();

        if ticket < self.inner.tickets.load(Ordering::SeqCst) || ticket <= slot.generation {
            tracing::debug!(ticket, "refresh superseded by a newer request");
            return RefreshOutcome::Superseded;
        }
        *self.inner.last_refresh.write() = Some(now);

        match result {
            Ok(None) => RefreshOutcome::Unchanged,
            Ok(Some(records)) => {
                let snapshot = self.build(ticket, records, now);
                let count = snapshot.len();
                if snapshot.rejected > 0 {
                    tracing::warn!(
                        rejected = snapshot.rejected,
                        "dropped records without a valid timestamp"
                    );
                }
                *slot = Arc::new(snapshot);
                *self.inner.last_error.write() = None;
                RefreshOutcome::Updated { readings: count }
            }
            Err(SourceError::Corrupt(msg)) => {
                tracing::warn!(source = %self.inner.description, error = %msg, "source corrupt, resetting to empty");
                *self.inner.last_error.write() = Some(format!("Parse error: {}", msg));
                *slot = Arc::new(self.build(ticket, Vec::new(), now));
                RefreshOutcome::Recovered
            }
            Err(SourceError::Unavailable(msg)) => {
                tracing::warn!(source = %self.inner.description, error = %msg, "source unavailable, keeping last snapshot");
                *self.inner.last_error.write() = Some(format!("Read error: {}", msg));
                if slot.generation == 0 {
                    *slot = Arc::new(self.build(ticket, Vec::new(), now));
                }
                RefreshOutcome::KeptPrevious
            }
        }
    }

    fn build(&self, ticket: u64, records: Vec<RawRecord>, now: DateTime<Utc>) -> Snapshot {
        let total = records.len();
        let mut readings: Vec<Reading> = records.iter().filter_map(Reading::from_record).collect();
        let rejected = total - readings.len();
        readings.sort_by_key(|r| r.timestamp);

        let synthetic = readings.is_empty() && self.inner.options.synthetic_fallback;
        if synthetic {
            readings.push(self.inner.fallback.lock().generate(now));
        }

        Snapshot {
            readings,
            generation: ticket,
            loaded_at: now,
            rejected,
            synthetic,
        }
    }

    /// Stop accepting refreshes and wake anyone waiting in `closed()`.
    /// The last snapshot stays readable.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(source = %self.inner.description, "reading store closed");
        }
        self.inner.close_notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let notified = self.inner.close_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    pub fn status(&self) -> StoreStatus {
        let snapshot = self.get_all();
        StoreStatus {
            source: self.inner.description.clone(),
            generation: snapshot.generation,
            readings: snapshot.len(),
            rejected: snapshot.rejected,
            synthetic_fallback: snapshot.synthetic,
            loaded_at: format_timestamp(&snapshot.loaded_at),
            last_refresh: self.inner.last_refresh.read().as_ref().map(format_timestamp),
            last_error: self.inner.last_error.read().clone(),
            closed: self.is_closed(),
        }
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Parameter, ThresholdTable};
    use crate::source::FileSource;
    use crate::window::{EmptyWindowPolicy, WindowSpec};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::io::Write;
    use tempfile::NamedTempFile;

    type PollResult = Result<Option<Vec<RawRecord>>, SourceError>;

    /// replays scripted poll results, then reports "unchanged"
    #[derive(Debug)]
    struct ScriptedSource {
        script: VecDeque<PollResult>,
        invalidations: Arc<AtomicU64>,
    }

    impl ScriptedSource {
        fn boxed(script: Vec<PollResult>) -> Box<dyn ReadingSource> {
            Box::new(Self {
                script: script.into(),
                invalidations: Arc::new(AtomicU64::new(0)),
            })
        }
    }

    impl ReadingSource for ScriptedSource {
        fn poll(&mut self) -> PollResult {
            self.script.pop_front().unwrap_or(Ok(None))
        }

        fn invalidate(&mut self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }

        fn description(&self) -> &str {
            "scripted"
        }
    }

    fn records(value: serde_json::Value) -> Vec<RawRecord> {
        serde_json::from_value(value).unwrap()
    }

    fn generator() -> SyntheticGenerator {
        SyntheticGenerator::new(Parameter::ALL.to_vec(), ThresholdTable::default(), Some(11))
    }

    fn file_with(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[tokio::test]
    async fn test_get_all_is_sorted_and_drops_invalid() {
        let file = file_with(
            r#"[
                { "CO2 (ppm)": 3, "timestamp": "2025-04-18T16:23:00Z" },
                { "CO2 (ppm)": 1, "timestamp": "2025-04-18T16:21:00Z" },
                { "CO2 (ppm)": 9, "timestamp": "not a time" },
                { "CO2 (ppm)": 2, "timestamp": "2025-04-18T16:22:00Z" }
            ]"#,
        );
        let store = ReadingStore::open(
            Box::new(FileSource::new(file.path())),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();

        let snapshot = store.get_all();
        let values: Vec<f64> = snapshot
            .readings()
            .iter()
            .map(|r| r.value(Parameter::Co2).unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert!(snapshot
            .readings()
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(snapshot.rejected(), 1);
        assert!(!snapshot.is_synthetic());
    }

    #[tokio::test]
    async fn test_empty_source_yields_one_stable_synthetic_reading() {
        let file = file_with("[]");
        let store = ReadingStore::open(
            Box::new(FileSource::new(file.path())),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();

        let first = store.get_all();
        let second = store.get_all();
        assert_eq!(first.len(), 1);
        assert!(first.is_synthetic());
        assert_eq!(first.readings(), second.readings());

        // a relative window over the fallback yields that same reading
        let window = WindowSpec::Within(86400).apply(
            first.readings(),
            Utc::now(),
            EmptyWindowPolicy::MostRecent,
        );
        assert_eq!(window, first.readings());
    }

    #[tokio::test]
    async fn test_empty_source_without_fallback() {
        let store = ReadingStore::open(
            ScriptedSource::boxed(vec![Ok(Some(Vec::new()))]),
            generator(),
            StoreOptions {
                synthetic_fallback: false,
            },
        )
        .await
        .unwrap();
        assert!(store.get_all().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_source_resets_to_fallback() {
        let store = ReadingStore::open(
            ScriptedSource::boxed(vec![
                Ok(Some(records(json!([{ "co2": 450, "timestamp": "2025-04-18T16:22:00Z" }])))),
                Err(SourceError::Corrupt("expected value".into())),
            ]),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();
        assert!(!store.get_all().is_synthetic());

        assert_eq!(store.refresh().await.unwrap(), RefreshOutcome::Recovered);
        let snapshot = store.get_all();
        assert!(snapshot.is_synthetic());
        assert_eq!(snapshot.len(), 1);
        assert!(store.status().last_error.unwrap().contains("Parse error"));
    }

    #[tokio::test]
    async fn test_unavailable_source_keeps_previous_snapshot() {
        let store = ReadingStore::open(
            ScriptedSource::boxed(vec![
                Ok(Some(records(json!([
                    { "co2": 450, "timestamp": "2025-04-18T16:22:00Z" },
                    { "co2": 460, "timestamp": "2025-04-18T16:22:30Z" }
                ])))),
                Err(SourceError::Unavailable("permission denied".into())),
            ]),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();
        let before = store.get_all();

        assert_eq!(store.refresh().await.unwrap(), RefreshOutcome::KeptPrevious);
        let after = store.get_all();
        assert_eq!(after.readings(), before.readings());
        assert_eq!(after.generation(), before.generation());
        assert!(store.status().last_error.is_some());

        // unchanged afterwards; the error clears on the next real update
        assert_eq!(store.refresh().await.unwrap(), RefreshOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_unavailable_on_first_load_uses_fallback() {
        let store = ReadingStore::open(
            ScriptedSource::boxed(vec![Err(SourceError::Unavailable("gone".into()))]),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();
        let snapshot = store.get_all();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.is_synthetic());
    }

    #[tokio::test]
    async fn test_stale_refresh_is_superseded() {
        let store = ReadingStore::new(
            ScriptedSource::boxed(Vec::new()),
            generator(),
            StoreOptions::default(),
        );

        let older = store.begin_refresh().unwrap();
        let newer = store.begin_refresh().unwrap();
        assert!(newer > older);

        let newer_outcome = store.complete(
            newer,
            Ok(Some(records(json!([{ "co2": 2, "timestamp": "2025-04-18T16:22:30Z" }])))),
        );
        assert_eq!(newer_outcome, RefreshOutcome::Updated { readings: 1 });

        // the older request finishes last but must not overwrite
        let older_outcome = store.complete(
            older,
            Ok(Some(records(json!([{ "co2": 1, "timestamp": "2025-04-18T16:22:00Z" }])))),
        );
        assert_eq!(older_outcome, RefreshOutcome::Superseded);
        assert_eq!(store.get_all().readings()[0].value(Parameter::Co2), Some(2.0));
        assert_eq!(store.get_all().generation(), newer);
    }

    #[tokio::test]
    async fn test_pending_refresh_abandoned_when_newer_started() {
        let store = ReadingStore::new(
            ScriptedSource::boxed(Vec::new()),
            generator(),
            StoreOptions::default(),
        );
        let first = store.begin_refresh().unwrap();
        let _second = store.begin_refresh().unwrap();

        let outcome = store.complete(
            first,
            Ok(Some(records(json!([{ "co2": 1, "timestamp": "2025-04-18T16:22:00Z" }])))),
        );
        assert_eq!(outcome, RefreshOutcome::Superseded);
        assert_eq!(store.get_all().generation(), 0);
    }

    /// overwrite `path` with one co2 reading and a distinct mtime
    fn rewrite(path: &std::path::Path, co2: u32) {
        std::fs::write(
            path,
            format!(r#"[{{ "co2": {}, "timestamp": "2025-04-18T16:22:00Z" }}]"#, co2),
        )
        .unwrap();
        let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000 + co2 as u64);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();
    }

    fn co2(store: &ReadingStore) -> Option<f64> {
        store.get_all().latest().and_then(|r| r.value(Parameter::Co2))
    }

    #[tokio::test]
    async fn test_superseded_poll_does_not_swallow_file_change() {
        let file = NamedTempFile::new().unwrap();
        rewrite(file.path(), 1);
        let store = ReadingStore::open(
            Box::new(FileSource::new(file.path())),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(co2(&store), Some(1.0));

        rewrite(file.path(), 2);
        let older = store.begin_refresh().unwrap();
        let newer = store.begin_refresh().unwrap();

        // the older refresh reads the change first, then loses the race
        assert_eq!(store.poll_and_apply(older, false), RefreshOutcome::Superseded);
        assert_eq!(
            store.poll_and_apply(newer, false),
            RefreshOutcome::Updated { readings: 1 }
        );
        assert_eq!(co2(&store), Some(2.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_refreshes_apply_latest_file() {
        let file = NamedTempFile::new().unwrap();
        rewrite(file.path(), 1);
        let store = ReadingStore::open(
            Box::new(FileSource::new(file.path())),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();

        for value in 2..22 {
            rewrite(file.path(), value);
            let (a, b) = tokio::join!(store.refresh(), store.refresh());
            let outcomes = [a.unwrap(), b.unwrap()];
            assert!(outcomes.contains(&RefreshOutcome::Updated { readings: 1 }));
            assert_eq!(co2(&store), Some(value as f64));

            // nothing left pending afterwards
            assert_eq!(store.refresh().await.unwrap(), RefreshOutcome::Unchanged);
        }
    }

    #[tokio::test]
    async fn test_invalidate_reaches_source() {
        let invalidations = Arc::new(AtomicU64::new(0));
        let source = ScriptedSource {
            script: VecDeque::new(),
            invalidations: invalidations.clone(),
        };
        let store = ReadingStore::new(Box::new(source), generator(), StoreOptions::default());

        store.invalidate().await.unwrap();
        assert_eq!(invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close() {
        let store = ReadingStore::open(
            ScriptedSource::boxed(vec![Ok(Some(Vec::new()))]),
            generator(),
            StoreOptions::default(),
        )
        .await
        .unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.closed().await })
        };
        store.close();
        waiter.await.unwrap();

        assert!(matches!(store.refresh().await, Err(StoreError::Closed)));
        assert_eq!(store.get_all().len(), 1);
        assert!(store.status().closed);

        // already closed: returns immediately
        store.closed().await;
    }
}
