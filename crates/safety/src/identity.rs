use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Owner-authored identity files. Hashed at init, re-verified on every
/// heartbeat, never writable by any autonomous operation.
pub const IDENTITY_FILES: &[&str] = &[
    "SOUL.md",
    "AGENTS.md",
    "IDENTITY.md",
    "USER.md",
    "TOOLS.md",
    "HEARTBEAT.md",
    "GOALS.md",
];

/// True if `name` (a bare file name) is one of the identity files, with or
/// without the `.md` extension.
pub fn is_identity_file(name: &str) -> bool {
    IDENTITY_FILES
        .iter()
        .any(|f| name.eq_ignore_ascii_case(f) || name.eq_ignore_ascii_case(f.trim_end_matches(".md")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityChange {
    pub file: String,
    pub expected: String,
    /// None when the file is missing on disk.
    pub actual: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IdentityReport {
    pub valid: bool,
    pub changes: Vec<IdentityChange>,
}

pub struct IdentityGuard {
    identity_dir: PathBuf,
    checksum_path: PathBuf,
}

impl IdentityGuard {
    pub fn new(identity_dir: &Path, data_dir: &Path) -> Self {
        Self {
            identity_dir: identity_dir.to_path_buf(),
            checksum_path: data_dir.join("identity-checksums.json"),
        }
    }

    fn hash_file(path: &Path) -> Result<String> {
        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read identity file {}", path.display()))?;
        Ok(hex::encode(Sha256::digest(&content)))
    }

    fn current_checksums(&self) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for name in IDENTITY_FILES {
            let path = self.identity_dir.join(name);
            if path.exists() {
                map.insert(name.to_string(), Self::hash_file(&path)?);
            }
        }
        Ok(map)
    }

    fn load_baseline(&self) -> Result<Option<BTreeMap<String, String>>> {
        if !self.checksum_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.checksum_path)
            .context("Failed to read identity checksums")?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn persist(&self, checksums: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.checksum_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(checksums)?;
        std::fs::write(&self.checksum_path, content)?;
        Ok(())
    }

    /// Compute and persist the baseline if none exists yet. Returns true
    /// when a new baseline was written.
    pub fn initialize(&self) -> Result<bool> {
        if self.load_baseline()?.is_some() {
            return Ok(false);
        }
        let checksums = self.current_checksums()?;
        self.persist(&checksums)?;
        tracing::info!(files = checksums.len(), "Identity baseline recorded");
        Ok(true)
    }

    /// Recompute every hash and compare against the baseline. A missing
    /// baseline counts as valid (nothing to compare against yet).
    pub fn verify(&self) -> Result<IdentityReport> {
        let baseline = match self.load_baseline()? {
            Some(b) => b,
            None => {
                return Ok(IdentityReport {
                    valid: true,
                    changes: vec![],
                })
            }
        };

        let mut changes = vec![];
        for (file, expected) in &baseline {
            let path = self.identity_dir.join(file);
            let actual = if path.exists() {
                Some(Self::hash_file(&path)?)
            } else {
                None
            };
            if actual.as_deref() != Some(expected.as_str()) {
                changes.push(IdentityChange {
                    file: file.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(IdentityReport {
            valid: changes.is_empty(),
            changes,
        })
    }

    /// Owner-acknowledged refresh: recompute and overwrite the baseline.
    pub fn acknowledge_changes(&self) -> Result<()> {
        let checksums = self.current_checksums()?;
        self.persist(&checksums)?;
        tracing::info!("Identity baseline refreshed by owner acknowledgement");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, IdentityGuard) {
        let dir = tempfile::tempdir().unwrap();
        let identity = dir.path().join("identity");
        let data = dir.path().join(".sneebly");
        std::fs::create_dir_all(&identity).unwrap();
        std::fs::write(identity.join("SOUL.md"), "be helpful").unwrap();
        std::fs::write(identity.join("AGENTS.md"), "agents").unwrap();
        let guard = IdentityGuard::new(&identity, &data);
        (dir, guard)
    }

    #[test]
    fn test_initialize_then_verify_clean() {
        let (_dir, guard) = setup();
        assert!(guard.initialize().unwrap());
        assert!(!guard.initialize().unwrap());
        let report = guard.verify().unwrap();
        assert!(report.valid);
        assert!(report.changes.is_empty());
    }

    #[test]
    fn test_tamper_detected() {
        let (dir, guard) = setup();
        guard.initialize().unwrap();
        std::fs::write(dir.path().join("identity/AGENTS.md"), "agents!").unwrap();
        let report = guard.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].file, "AGENTS.md");
    }

    #[test]
    fn test_missing_file_detected() {
        let (dir, guard) = setup();
        guard.initialize().unwrap();
        std::fs::remove_file(dir.path().join("identity/SOUL.md")).unwrap();
        let report = guard.verify().unwrap();
        assert!(!report.valid);
        assert!(report.changes.iter().any(|c| c.actual.is_none()));
    }

    #[test]
    fn test_acknowledge_restores_validity() {
        let (dir, guard) = setup();
        guard.initialize().unwrap();
        std::fs::write(dir.path().join("identity/SOUL.md"), "changed").unwrap();
        assert!(!guard.verify().unwrap().valid);
        guard.acknowledge_changes().unwrap();
        assert!(guard.verify().unwrap().valid);
    }

    #[test]
    fn test_is_identity_file() {
        assert!(is_identity_file("SOUL.md"));
        assert!(is_identity_file("soul"));
        assert!(is_identity_file("GOALS"));
        assert!(!is_identity_file("routes.js"));
    }
}
