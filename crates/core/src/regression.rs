use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths::DataPaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecord {
    #[serde(rename = "totalAttempts")]
    pub total_attempts: u64,
    #[serde(rename = "totalFailures")]
    pub total_failures: u64,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u64,
    #[serde(rename = "firstFailureAt", default, skip_serializing_if = "Option::is_none")]
    pub first_failure_at: Option<String>,
    #[serde(rename = "lastSeen")]
    pub last_seen: String,
}

impl CheckRecord {
    /// `consecutive × (failures/attempts) × min(days_since_first_failure/7, 3)`
    pub fn escalation_score(&self, now: DateTime<Utc>) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        let failure_rate = self.total_failures as f64 / self.total_attempts as f64;
        let age_factor = match &self.first_failure_at {
            Some(ts) => match DateTime::parse_from_rfc3339(ts) {
                Ok(first) => {
                    let days = (now - first.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0;
                    (days / 7.0).min(3.0)
                }
                Err(_) => 0.0,
            },
            None => 0.0,
        };
        self.consecutive_failures as f64 * failure_rate * age_factor
    }
}

/// Persistent per-check failure counters (`regression-tracker.json`).
pub struct RegressionTracker {
    paths: DataPaths,
}

impl RegressionTracker {
    pub fn new(paths: &DataPaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    fn load(&self) -> BTreeMap<String, CheckRecord> {
        let path = self.paths.regression_tracker();
        if !path.exists() {
            return BTreeMap::new();
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    fn save(&self, records: &BTreeMap<String, CheckRecord>) -> Result<()> {
        std::fs::create_dir_all(self.paths.root())?;
        std::fs::write(
            self.paths.regression_tracker(),
            serde_json::to_string_pretty(records)?,
        )?;
        Ok(())
    }

    pub fn record(&self, check: &str, passed: bool) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut records = self.load();
        let record = records.entry(check.to_string()).or_insert(CheckRecord {
            total_attempts: 0,
            total_failures: 0,
            consecutive_failures: 0,
            first_failure_at: None,
            last_seen: now.clone(),
        });
        record.total_attempts += 1;
        record.last_seen = now.clone();
        if passed {
            record.consecutive_failures = 0;
        } else {
            record.total_failures += 1;
            record.consecutive_failures += 1;
            if record.first_failure_at.is_none() {
                record.first_failure_at = Some(now);
            }
        }
        self.save(&records)
    }

    pub fn snapshot(&self) -> BTreeMap<String, CheckRecord> {
        self.load()
    }

    /// Checks sorted by descending escalation score, highest first.
    pub fn escalations(&self) -> Vec<(String, f64)> {
        let now = Utc::now();
        let mut scored: Vec<(String, f64)> = self
            .load()
            .into_iter()
            .map(|(name, record)| {
                let score = record.escalation_score(now);
                (name, score)
            })
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_escalation_score_formula() {
        let now = Utc::now();
        let record = CheckRecord {
            total_attempts: 10,
            total_failures: 5,
            consecutive_failures: 4,
            first_failure_at: Some((now - Duration::days(7)).to_rfc3339()),
            last_seen: now.to_rfc3339(),
        };
        // 4 × 0.5 × 1.0 = 2.0
        assert!((record.escalation_score(now) - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_age_factor_caps_at_three() {
        let now = Utc::now();
        let record = CheckRecord {
            total_attempts: 10,
            total_failures: 10,
            consecutive_failures: 1,
            first_failure_at: Some((now - Duration::days(365)).to_rfc3339()),
            last_seen: now.to_rfc3339(),
        };
        assert!((record.escalation_score(now) - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_pass_resets_consecutive() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        let tracker = RegressionTracker::new(&paths);
        tracker.record("home-page", false).unwrap();
        tracker.record("home-page", false).unwrap();
        tracker.record("home-page", true).unwrap();
        let snap = tracker.snapshot();
        let record = &snap["home-page"];
        assert_eq!(record.total_attempts, 3);
        assert_eq!(record.total_failures, 2);
        assert_eq!(record.consecutive_failures, 0);
    }

    #[test]
    fn test_healthy_check_not_escalated() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        let tracker = RegressionTracker::new(&paths);
        tracker.record("about-page", true).unwrap();
        assert!(tracker.escalations().is_empty());
    }
}
