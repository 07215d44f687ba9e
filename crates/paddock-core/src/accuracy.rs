//! Durable prediction history.
//!
//! The store is a single JSON document:
//!
//! ```json
//! { "version": 1, "records": { "2024-R05": { "event": ..., "prediction": ..., "actual": null } } }
//! ```
//!
//! Every write serializes the whole document to `<path>.tmp`, syncs it,
//! renames it over `<path>`, and syncs the directory. Readers therefore only
//! ever see a complete document; an interrupted write leaves at most a stray
//! `.tmp` file, which readers ignore and the next write replaces.
//!
//! All operations are blocking file I/O. Async callers run them on the
//! blocking pool.
//!
//! Records are decoded one at a time. A malformed record is skipped with a
//! warning and its raw JSON is carried through later writes untouched.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::model::{EventKey, PredictionSet};

/// Current on-disk format version.
pub const HISTORY_VERSION: u32 = 1;

/// A stored prediction paired with its eventual outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracyRecord {
    pub event: EventKey,
    /// The prediction as it was served.
    pub prediction: PredictionSet,
    /// Driver codes in actual finishing order; `None` until the race is graded.
    #[serde(default)]
    pub actual: Option<Vec<String>>,
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub graded_at: Option<DateTime<Utc>>,
}

impl AccuracyRecord {
    pub fn is_graded(&self) -> bool {
        self.actual.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDocument {
    version: u32,
    #[serde(default)]
    records: BTreeMap<String, serde_json::Value>,
}

impl Default for HistoryDocument {
    fn default() -> Self {
        Self {
            version: HISTORY_VERSION,
            records: BTreeMap::new(),
        }
    }
}

/// File-backed store of [`AccuracyRecord`]s keyed by event.
///
/// Writers are serialized by an internal lock so `save_prediction` and
/// `record_actual_result` cannot lose each other's updates. Readers take no
/// lock.
#[derive(Debug)]
pub struct AccuracyStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AccuracyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Store a prediction snapshot, replacing any earlier snapshot for the
    /// same event. An actual result already recorded for the event is kept.
    pub fn save_prediction(&self, prediction: &PredictionSet) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read_document()?;
        let key = prediction.event.to_string();

        let previous = doc.records.get(&key).and_then(|raw| decode(&key, raw));
        let record = AccuracyRecord {
            event: prediction.event,
            prediction: prediction.clone(),
            actual: previous.as_ref().and_then(|r| r.actual.clone()),
            recorded_at: Utc::now(),
            graded_at: previous.and_then(|r| r.graded_at),
        };
        doc.records.insert(key, serde_json::to_value(&record)?);
        self.write_document(&doc)?;
        tracing::debug!(event = %prediction.event, path = %self.path.display(), "prediction saved");
        Ok(())
    }

    /// Attach the actual finishing order to an existing record.
    ///
    /// Returns `Ok(false)` without writing when the event was never
    /// predicted (or its record is unreadable): there is nothing to grade.
    /// An empty order is rejected.
    pub fn record_actual_result(&self, event: EventKey, order: &[String]) -> Result<bool, StoreError> {
        if order.is_empty() {
            return Err(StoreError::EmptyResult(event));
        }
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut doc = self.read_document()?;
        let key = event.to_string();

        let Some(mut record) = doc.records.get(&key).and_then(|raw| decode(&key, raw)) else {
            tracing::debug!(%event, "no prior prediction; nothing to grade");
            return Ok(false);
        };
        record.actual = Some(order.to_vec());
        record.graded_at = Some(Utc::now());
        doc.records.insert(key, serde_json::to_value(&record)?);
        self.write_document(&doc)?;
        tracing::info!(%event, finishers = order.len(), "actual result recorded");
        Ok(true)
    }

    /// All readable records in event order.
    ///
    /// Never fails: an unreadable document is logged and read as empty.
    pub fn records(&self) -> Vec<AccuracyRecord> {
        match self.read_document() {
            Ok(doc) => {
                let mut records: Vec<AccuracyRecord> = doc
                    .records
                    .iter()
                    .filter_map(|(key, raw)| decode(key, raw))
                    .collect();
                records.sort_by_key(|r| r.event);
                records
            }
            Err(e) => {
                tracing::error!(error = %e, "accuracy history unreadable; treating as empty");
                Vec::new()
            }
        }
    }

    /// The last `n` records by event order, graded or not.
    pub fn window(&self, n: usize) -> Vec<AccuracyRecord> {
        let mut records = self.records();
        let skip = records.len().saturating_sub(n);
        records.drain(..skip);
        records
    }

    pub fn get(&self, event: EventKey) -> Option<AccuracyRecord> {
        self.records().into_iter().find(|r| r.event == event)
    }

    /// Number of stored records, including unreadable ones.
    pub fn len(&self) -> usize {
        self.read_document().map(|doc| doc.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_document(&self) -> Result<HistoryDocument, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HistoryDocument::default()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        let doc: HistoryDocument = serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            message: e.to_string(),
        })?;
        if doc.version != HISTORY_VERSION {
            tracing::warn!(version = doc.version, "unexpected accuracy history version");
        }
        Ok(doc)
    }

    fn write_document(&self, doc: &HistoryDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let json = serde_json::to_vec_pretty(doc)?;
        let tmp = self.tmp_path();

        // Atomic write: tmp file, sync, rename.
        let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::io(&self.path, e))?;
        self.sync_dir()
    }

    /// Persist the rename itself.
    #[cfg(unix)]
    fn sync_dir(&self) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        File::open(dir)
            .and_then(|d| d.sync_all())
            .map_err(|e| StoreError::io(dir, e))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn decode(key: &str, raw: &serde_json::Value) -> Option<AccuracyRecord> {
    match AccuracyRecord::deserialize(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(record = key, error = %e, "skipping malformed accuracy record");
            None
        }
    }
}
