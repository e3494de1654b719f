use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::paths::DataPaths;

const SIGNATURE_MAX_LEN: usize = 100;
const LOCK_WAIT: Duration = Duration::from_secs(5);

/// Normalise an error message into a stable fingerprint: integers become
/// `N`, quoted string literals become `S`, whitespace collapses, and the
/// result is truncated to 100 chars.
pub fn signature(message: &str) -> String {
    let strings = regex::Regex::new(r#""[^"]*"|'[^']*'"#).unwrap();
    let without_strings = strings.replace_all(message, "S");
    let integers = regex::Regex::new(r"\d+").unwrap();
    let without_numbers = integers.replace_all(&without_strings, "N");
    let collapsed = without_numbers.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(SIGNATURE_MAX_LEN).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownError {
    pub signature: String,
    pub message: String,
    #[serde(rename = "firstSeen")]
    pub first_seen: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: String,
    pub occurrences: u64,
    #[serde(rename = "resolvedAt", default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    #[serde(
        rename = "resolvingSpecId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resolving_spec_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    errors: Vec<KnownError>,
}

/// A single line of the host-emitted error log.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorLogLine {
    pub message: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

/// Deduplicating registry of runtime errors, keyed by signature.
pub struct KnownErrorRegistry {
    paths: DataPaths,
}

impl KnownErrorRegistry {
    pub fn new(paths: &DataPaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, KnownError>> {
        let path = self.paths.known_errors();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&path).context("Failed to read known errors")?;
        let file: RegistryFile = serde_json::from_str(&content).unwrap_or_default();
        Ok(file
            .errors
            .into_iter()
            .map(|e| (e.signature.clone(), e))
            .collect())
    }

    fn save(&self, errors: &BTreeMap<String, KnownError>) -> Result<()> {
        let file = RegistryFile {
            errors: errors.values().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        std::fs::create_dir_all(self.paths.root())?;
        std::fs::write(self.paths.known_errors(), content)?;
        Ok(())
    }

    /// Record one occurrence; returns the signature and whether it was new.
    pub fn record(&self, message: &str) -> Result<(String, bool)> {
        let sig = signature(message);
        let now = Utc::now().to_rfc3339();
        let mut errors = self.load()?;
        let is_new = match errors.get_mut(&sig) {
            Some(known) => {
                known.occurrences += 1;
                known.last_seen = now;
                false
            }
            None => {
                errors.insert(
                    sig.clone(),
                    KnownError {
                        signature: sig.clone(),
                        message: message.chars().take(500).collect(),
                        first_seen: now.clone(),
                        last_seen: now,
                        occurrences: 1,
                        resolved_at: None,
                        resolving_spec_id: None,
                    },
                );
                true
            }
        };
        self.save(&errors)?;
        Ok((sig, is_new))
    }

    pub fn mark_resolved(&self, sig: &str, spec_id: &str) -> Result<()> {
        let mut errors = self.load()?;
        if let Some(known) = errors.get_mut(sig) {
            known.resolved_at = Some(Utc::now().to_rfc3339());
            known.resolving_spec_id = Some(spec_id.to_string());
            self.save(&errors)?;
        }
        Ok(())
    }

    /// Unresolved errors, most recently seen first.
    pub fn unresolved(&self) -> Result<Vec<KnownError>> {
        let mut errors: Vec<KnownError> = self
            .load()?
            .into_values()
            .filter(|e| e.resolved_at.is_none())
            .collect();
        errors.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(errors)
    }

    pub fn get(&self, sig: &str) -> Result<Option<KnownError>> {
        Ok(self.load()?.remove(sig))
    }

    /// Drain `error-log.jsonl` into the registry under an advisory file
    /// lock. Under contention the pass waits up to a bounded timeout and
    /// otherwise skips. Returns how many lines were absorbed; an empty or
    /// missing log is a no-op.
    pub fn drain_error_log(&self) -> Result<usize> {
        let log_path = self.paths.error_log();
        if !log_path.exists() {
            return Ok(0);
        }

        std::fs::create_dir_all(self.paths.root())?;
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.paths.error_log_lock())?;

        let deadline = std::time::Instant::now() + LOCK_WAIT;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(_) => {
                    tracing::warn!("error-log drain skipped: lock contention");
                    return Ok(0);
                }
            }
        }

        let result = self.drain_locked(&log_path);
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn drain_locked(&self, log_path: &std::path::Path) -> Result<usize> {
        let content = std::fs::read_to_string(log_path)?;
        if content.trim().is_empty() {
            return Ok(0);
        }

        let mut absorbed = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ErrorLogLine>(line) {
                Ok(entry) => {
                    self.record(&entry.message)?;
                    absorbed += 1;
                }
                Err(_) => {
                    // Unstructured lines are still worth registering.
                    self.record(line)?;
                    absorbed += 1;
                }
            }
        }

        std::fs::write(log_path, "")?;
        Ok(absorbed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_normalises_numbers_and_strings() {
        let a = signature("TypeError: cannot read 'name' of user 42");
        let b = signature("TypeError: cannot read 'email' of user 777");
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_collapses_whitespace() {
        let a = signature("boom   at \t line 3");
        let b = signature("boom at line 9");
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_truncates() {
        let long = "x".repeat(500);
        assert_eq!(signature(&long).len(), 100);
    }

    fn setup() -> (tempfile::TempDir, KnownErrorRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        (dir, KnownErrorRegistry::new(&paths))
    }

    #[test]
    fn test_record_dedupes() {
        let (_dir, registry) = setup();
        let (sig1, new1) = registry.record("boom at line 3").unwrap();
        let (sig2, new2) = registry.record("boom at line 99").unwrap();
        assert_eq!(sig1, sig2);
        assert!(new1);
        assert!(!new2);
        let known = registry.get(&sig1).unwrap().unwrap();
        assert_eq!(known.occurrences, 2);
    }

    #[test]
    fn test_mark_resolved() {
        let (_dir, registry) = setup();
        let (sig, _) = registry.record("boom").unwrap();
        registry.mark_resolved(&sig, "spec-1").unwrap();
        assert!(registry.unresolved().unwrap().is_empty());
        let known = registry.get(&sig).unwrap().unwrap();
        assert_eq!(known.resolving_spec_id.as_deref(), Some("spec-1"));
    }

    #[test]
    fn test_drain_error_log() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        let registry = KnownErrorRegistry::new(&paths);
        std::fs::write(
            paths.error_log(),
            "{\"message\":\"boom at 3\"}\n{\"message\":\"boom at 4\"}\nplain text error\n",
        )
        .unwrap();
        let absorbed = registry.drain_error_log().unwrap();
        assert_eq!(absorbed, 3);
        // Log truncated after the drain.
        assert!(std::fs::read_to_string(paths.error_log())
            .unwrap()
            .is_empty());
        // Two of the three collapse into one signature.
        assert_eq!(registry.unresolved().unwrap().len(), 2);
    }

    #[test]
    fn test_drain_empty_log_noop() {
        let (_dir, registry) = setup();
        assert_eq!(registry.drain_error_log().unwrap(), 0);
        std::fs::write(registry.paths.error_log(), "").unwrap();
        assert_eq!(registry.drain_error_log().unwrap(), 0);
    }
}
