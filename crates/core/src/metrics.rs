use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::paths::DataPaths;

const MAX_SNAPSHOTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub timestamp: String,
    #[serde(rename = "avgResponseMs")]
    pub avg_response_ms: f64,
    #[serde(rename = "p95Ms")]
    pub p95_ms: f64,
    #[serde(rename = "requestCount")]
    pub request_count: u64,
    #[serde(rename = "errorCount")]
    pub error_count: u64,
}

impl MetricSnapshot {
    pub fn now(avg_response_ms: f64, p95_ms: f64, request_count: u64, error_count: u64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            avg_response_ms,
            p95_ms,
            request_count,
            error_count,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetricsFile {
    snapshots: Vec<MetricSnapshot>,
}

/// Bounded ring of host performance snapshots (`metrics.json`, last 100).
pub struct MetricsStore {
    paths: DataPaths,
}

impl MetricsStore {
    pub fn new(paths: &DataPaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    fn load(&self) -> MetricsFile {
        let path = self.paths.metrics();
        if !path.exists() {
            return MetricsFile::default();
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    pub fn push(&self, snapshot: MetricSnapshot) -> Result<()> {
        let mut file = self.load();
        file.snapshots.push(snapshot);
        if file.snapshots.len() > MAX_SNAPSHOTS {
            let overflow = file.snapshots.len() - MAX_SNAPSHOTS;
            file.snapshots.drain(..overflow);
        }
        std::fs::create_dir_all(self.paths.root())?;
        std::fs::write(self.paths.metrics(), serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    pub fn recent(&self, n: usize) -> Vec<MetricSnapshot> {
        let file = self.load();
        let skip = file.snapshots.len().saturating_sub(n);
        file.snapshots.into_iter().skip(skip).collect()
    }

    /// True when the latest snapshots trend meaningfully slower than the
    /// older half of the window.
    pub fn degradation(&self, window: usize) -> Option<f64> {
        let recent = self.recent(window);
        if recent.len() < 4 {
            return None;
        }
        let mid = recent.len() / 2;
        let older_avg: f64 =
            recent[..mid].iter().map(|s| s.avg_response_ms).sum::<f64>() / mid as f64;
        let newer_avg: f64 = recent[mid..].iter().map(|s| s.avg_response_ms).sum::<f64>()
            / (recent.len() - mid) as f64;
        if older_avg > 0.0 && newer_avg > older_avg * 1.5 {
            Some(newer_avg / older_avg)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, MetricsStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        (dir, MetricsStore::new(&paths))
    }

    #[test]
    fn test_ring_capped_at_100() {
        let (_dir, store) = setup();
        for i in 0..110 {
            store
                .push(MetricSnapshot::now(i as f64, i as f64, 100, 1))
                .unwrap();
        }
        let recent = store.recent(200);
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0].avg_response_ms, 10.0);
    }

    #[test]
    fn test_degradation_detection() {
        let (_dir, store) = setup();
        for _ in 0..5 {
            store.push(MetricSnapshot::now(100.0, 150.0, 100, 0)).unwrap();
        }
        for _ in 0..5 {
            store.push(MetricSnapshot::now(400.0, 600.0, 100, 0)).unwrap();
        }
        assert!(store.degradation(10).is_some());
    }

    #[test]
    fn test_no_degradation_when_flat() {
        let (_dir, store) = setup();
        for _ in 0..10 {
            store.push(MetricSnapshot::now(100.0, 150.0, 100, 0)).unwrap();
        }
        assert!(store.degradation(10).is_none());
    }

    #[test]
    fn test_error_rate() {
        let snap = MetricSnapshot::now(10.0, 20.0, 200, 10);
        assert!((snap.error_rate() - 0.05).abs() < 1e-9);
    }
}
