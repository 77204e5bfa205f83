//! ==============================================================================
//! source.rs - backing sources for the reading store
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for where readings come from. the store
//!     does not care whether records come from a json file written by a
//!     logger or from the in-memory dummy generator.
//!
//! implementations:
//!     - FileSource: json array on disk, re-parsed only when its mtime moves
//!       or when the store invalidates it (watcher event)
//!     - SyntheticSource: rolling buffer of generated readings, one new
//!       reading per poll
//!
//! relationships:
//!     - used by: store.rs (polls a boxed source on every refresh)
//!     - uses: SyntheticGenerator (also used by the store for its fallback)
//!
//! ==============================================================================

use std::collections::VecDeque;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Parameter, RawRecord, Reading, ThresholdTable};
use crate::error::SourceError;

/// Trait for loading raw records from a backing source.
pub trait ReadingSource: Send + Debug {
    /// Load the current records.
    ///
    /// Returns `Ok(None)` when nothing changed since the last successful
    /// load, so the store can keep its snapshot without re-parsing.
    fn poll(&mut self) -> Result<Option<Vec<RawRecord>>, SourceError>;

    /// Forget any change-tracking state so the next poll reloads.
    fn invalidate(&mut self) {}

    /// Human-readable description, shown in the status endpoint.
    fn description(&self) -> &str;
}

// ==============================================================================
// file source
// ==============================================================================

/// Reads a JSON array of records from a file.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    description: String,
    last_modified: Option<SystemTime>,
    create_if_missing: bool,
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let description = format!("file: {}", path.display());
        Self {
            path,
            description,
            last_modified: None,
            create_if_missing: true,
        }
    }

    /// Leave a missing file alone instead of creating an empty one.
    pub fn without_create(mut self) -> Self {
        self.create_if_missing = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn modified_time(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).ok()?.modified().ok()
    }

    fn parse(content: &str) -> Result<Vec<RawRecord>, SourceError> {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(content).map_err(|e| SourceError::Corrupt(e.to_string()))
    }
}

impl ReadingSource for FileSource {
    fn poll(&mut self) -> Result<Option<Vec<RawRecord>>, SourceError> {
        if !self.path.exists() {
            if self.create_if_missing {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .map_err(|e| SourceError::Unavailable(e.to_string()))?;
                }
                fs::write(&self.path, "[]")
                    .map_err(|e| SourceError::Unavailable(e.to_string()))?;
                tracing::info!(path = %self.path.display(), "created empty readings file");
            }
            self.last_modified = self.modified_time();
            return Ok(Some(Vec::new()));
        }

        let current = self.modified_time();
        let changed = match (&self.last_modified, &current) {
            (None, _) => true,
            (Some(_), None) => true,
            // any move counts: `cp -p` or `rsync -t` can install an older mtime
            (Some(last), Some(current)) => current != last,
        };
        if !changed {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;

        // a corrupt file counts as "seen" so it is not re-parsed every tick
        self.last_modified = current;
        Self::parse(&content).map(Some)
    }

    fn invalidate(&mut self) {
        self.last_modified = None;
    }

    fn description(&self) -> &str {
        &self.description
    }
}

// ==============================================================================
// synthetic source
// ==============================================================================

/// Generates plausible dummy readings for the enabled parameters.
#[derive(Debug)]
pub struct SyntheticGenerator {
    rng: StdRng,
    parameters: Vec<Parameter>,
    thresholds: ThresholdTable,
}

impl SyntheticGenerator {
    pub fn new(parameters: Vec<Parameter>, thresholds: ThresholdTable, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            parameters,
            thresholds,
        }
    }

    pub fn generate(&mut self, timestamp: DateTime<Utc>) -> Reading {
        let mut reading = Reading::new(timestamp);
        for &parameter in &self.parameters {
            let (low, high) = self.range(parameter);
            let value = low + self.rng.gen::<f64>() * (high - low);
            reading.values.insert(parameter, (value * 100.0).round() / 100.0);
        }
        reading
    }

    /// Value range per parameter. Temperature and humidity stay inside their
    /// comfort band so dummy data does not light up the warnings panel.
    fn range(&self, parameter: Parameter) -> (f64, f64) {
        let band = |fallback: (f64, f64)| {
            self.thresholds
                .get(parameter)
                .map(|t| (t.low, t.high))
                .unwrap_or(fallback)
        };
        match parameter {
            Parameter::Temperature => band((22.0, 28.0)),
            Parameter::Humidity => band((40.0, 60.0)),
            Parameter::Pm25 => {
                let (low, high) = band((0.0, 4.0));
                (low, low + high)
            }
            Parameter::Co2 => (400.0, 500.0),
            Parameter::Co => (0.0, 0.5),
            Parameter::Voc => (0.0, 0.2),
            Parameter::O3 | Parameter::No2 | Parameter::So2 => (0.0, 0.1),
        }
    }
}

/// Rolling buffer of synthetic readings; each poll appends one at "now".
#[derive(Debug)]
pub struct SyntheticSource {
    generator: SyntheticGenerator,
    buffer: VecDeque<Reading>,
    capacity: usize,
    description: String,
}

impl SyntheticSource {
    pub fn new(generator: SyntheticGenerator, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            generator,
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            description: format!("synthetic ({} readings max)", capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

impl ReadingSource for SyntheticSource {
    fn poll(&mut self) -> Result<Option<Vec<RawRecord>>, SourceError> {
        let reading = self.generator.generate(Utc::now());
        self.buffer.push_back(reading);
        while self.buffer.len() > self.capacity {
            self.buffer.pop_front();
        }
        Ok(Some(self.buffer.iter().map(Reading::to_record).collect()))
    }

    fn description(&self) -> &str {
        &self.description
    }
}
