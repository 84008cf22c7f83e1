//! Per-subject rolling baselines
//!
//! Each record keeps a running mean and sample standard deviation of one
//! metric for one subject. New values are folded in with Welford's update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::MetricObservation;

const BASELINE_FILE_NAME: &str = "baselines.json";

#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    #[error("Baseline storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Baseline file is not valid JSON: {0}")]
    Format(#[from] serde_json::Error),
    #[error("Baseline store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub subject_id: String,
    pub metric_type: String,
    pub mean: f64,
    pub stddev: f64,
    pub sample_count: u64,
    #[serde(default)]
    pub last_value: Option<f64>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BaselineRecord {
    pub fn empty(subject_id: &str, metric_type: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            metric_type: metric_type.to_string(),
            mean: 0.0,
            stddev: 0.0,
            sample_count: 0,
            last_value: None,
            updated_at: None,
        }
    }

    /// Fold one value into the running statistics.
    ///
    /// The sum of squared deviations is recovered from the stored sample
    /// standard deviation, so only mean/stddev/count need persisting.
    pub fn fold(&mut self, value: f64, at: DateTime<Utc>) {
        if !value.is_finite() {
            log::warn!("Ignoring non-finite {} value", self.metric_type);
            return;
        }
        let n = self.sample_count;
        let mut m2 = if n > 1 {
            self.stddev * self.stddev * (n - 1) as f64
        } else {
            0.0
        };

        let count = n + 1;
        let delta = value - self.mean;
        self.mean += delta / count as f64;
        m2 += delta * (value - self.mean);

        self.sample_count = count;
        self.stddev = if count > 1 {
            (m2 / (count - 1) as f64).sqrt()
        } else {
            0.0
        };
        self.last_value = Some(value);
        self.updated_at = Some(at);
    }
}

/// Fold observations into a subject's records, creating missing ones
pub fn fold_observations(
    records: &mut Vec<BaselineRecord>,
    subject_id: &str,
    observations: &[MetricObservation],
    at: DateTime<Utc>,
) {
    for obs in observations {
        match records.iter_mut().find(|r| r.metric_type == obs.metric_type) {
            Some(record) => record.fold(obs.value, at),
            None => {
                let mut record = BaselineRecord::empty(subject_id, &obs.metric_type);
                record.fold(obs.value, at);
                records.push(record);
            }
        }
    }
}

/// Supplies and accepts per-subject baselines
#[async_trait]
pub trait BaselineStore: Send + Sync {
    async fn load(&self, subject_id: &str) -> Result<Vec<BaselineRecord>, BaselineError>;

    /// Fold observations into the subject's baselines and persist them
    async fn record(
        &self,
        subject_id: &str,
        observations: &[MetricObservation],
    ) -> Result<Vec<BaselineRecord>, BaselineError>;
}

type BaselineMap = HashMap<String, Vec<BaselineRecord>>;

#[derive(Debug, Default)]
pub struct InMemoryBaselineStore {
    records: Mutex<BaselineMap>,
}

impl InMemoryBaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<BaselineRecord>) -> Self {
        let mut map = BaselineMap::new();
        for record in records {
            map.entry(record.subject_id.clone()).or_default().push(record);
        }
        Self {
            records: Mutex::new(map),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BaselineMap>, BaselineError> {
        self.records
            .lock()
            .map_err(|e| BaselineError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl BaselineStore for InMemoryBaselineStore {
    async fn load(&self, subject_id: &str) -> Result<Vec<BaselineRecord>, BaselineError> {
        Ok(self.lock()?.get(subject_id).cloned().unwrap_or_default())
    }

    async fn record(
        &self,
        subject_id: &str,
        observations: &[MetricObservation],
    ) -> Result<Vec<BaselineRecord>, BaselineError> {
        let mut map = self.lock()?;
        let records = map.entry(subject_id.to_string()).or_default();
        fold_observations(records, subject_id, observations, Utc::now());
        Ok(records.clone())
    }
}

/// JSON file of all subjects' baselines, rewritten atomically on update
#[derive(Debug)]
pub struct FileBaselineStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileBaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/guardian-checkin/baselines.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_dir().map(|d| d.join(crate::settings::APP_DIR_NAME).join(BASELINE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BaselineMap, BaselineError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BaselineMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, map: &BaselineMap) -> Result<(), BaselineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, contents)?;
        if cfg!(windows) && self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

#[async_trait]
impl BaselineStore for FileBaselineStore {
    async fn load(&self, subject_id: &str) -> Result<Vec<BaselineRecord>, BaselineError> {
        Ok(self.read_all()?.remove(subject_id).unwrap_or_default())
    }

    async fn record(
        &self,
        subject_id: &str,
        observations: &[MetricObservation],
    ) -> Result<Vec<BaselineRecord>, BaselineError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| BaselineError::Unavailable(e.to_string()))?;
        let mut map = self.read_all()?;
        let records = map.entry(subject_id.to_string()).or_default();
        fold_observations(records, subject_id, observations, Utc::now());
        let updated = records.clone();
        self.write_all(&map)?;
        log::info!(
            "Baselines updated for {} ({} metrics)",
            subject_id,
            updated.len()
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triage::METRIC_HEART_RATE;

    fn sample_stddev(values: &[f64]) -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        var.sqrt()
    }

    #[test]
    fn test_fold_matches_batch_statistics() {
        let values = [72.0, 68.0, 75.0, 71.0, 64.0];
        let mut record = BaselineRecord::empty("s", METRIC_HEART_RATE);
        for v in values {
            record.fold(v, Utc::now());
        }
        assert_eq!(record.sample_count, 5);
        assert!((record.mean - 70.0).abs() < 1e-9);
        assert!((record.stddev - sample_stddev(&values)).abs() < 1e-9);
        assert_eq!(record.last_value, Some(64.0));
        assert!(record.updated_at.is_some());
    }

    #[test]
    fn test_single_sample_has_zero_spread() {
        let mut record = BaselineRecord::empty("s", METRIC_HEART_RATE);
        record.fold(80.0, Utc::now());
        assert_eq!(record.stddev, 0.0);
        assert_eq!(record.mean, 80.0);
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let mut record = BaselineRecord::empty("s", METRIC_HEART_RATE);
        record.fold(f64::NAN, Utc::now());
        assert_eq!(record.sample_count, 0);
    }

    #[tokio::test]
    async fn test_in_memory_store_folds_per_subject() {
        let store = InMemoryBaselineStore::new();
        let obs = [MetricObservation::new(METRIC_HEART_RATE, 70.0)];
        store.record("a", &obs).await.unwrap();
        store.record("a", &obs).await.unwrap();

        let a = store.load("a").await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].sample_count, 2);
        assert!(store.load("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(BASELINE_FILE_NAME);
        let store = FileBaselineStore::new(&path);

        assert!(store.load("a").await.unwrap().is_empty());
        store
            .record("a", &[MetricObservation::new(METRIC_HEART_RATE, 60.0)])
            .await
            .unwrap();
        store
            .record("a", &[MetricObservation::new(METRIC_HEART_RATE, 80.0)])
            .await
            .unwrap();

        let reopened = FileBaselineStore::new(&path);
        let records = reopened.load("a").await.unwrap();
        assert_eq!(records[0].sample_count, 2);
        assert!((records[0].mean - 70.0).abs() < 1e-9);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BASELINE_FILE_NAME);
        std::fs::write(&path, "{not json").unwrap();
        let store = FileBaselineStore::new(&path);
        assert!(matches!(store.load("a").await, Err(BaselineError::Format(_))));
    }
}
