use std::path::{Path, PathBuf};

use anyhow::Result;

/// Layout of the persistent state directory (`.sneebly/`). All components
/// resolve their files through this handle; nothing else hardcodes paths.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn approved_queue(&self) -> PathBuf {
        self.root.join("approved-queue")
    }

    pub fn pending_queue(&self) -> PathBuf {
        self.root.join("queue").join("pending")
    }

    pub fn completed(&self) -> PathBuf {
        self.root.join("completed")
    }

    pub fn failed(&self) -> PathBuf {
        self.root.join("failed")
    }

    pub fn backups(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn decisions(&self) -> PathBuf {
        self.root.join("decisions")
    }

    pub fn daily(&self) -> PathBuf {
        self.root.join("daily")
    }

    pub fn known_errors(&self) -> PathBuf {
        self.root.join("known-errors.json")
    }

    pub fn error_log(&self) -> PathBuf {
        self.root.join("error-log.jsonl")
    }

    pub fn error_log_lock(&self) -> PathBuf {
        self.root.join("error-log.lock")
    }

    pub fn metrics(&self) -> PathBuf {
        self.root.join("metrics.json")
    }

    pub fn identity_checksums(&self) -> PathBuf {
        self.root.join("identity-checksums.json")
    }

    pub fn elon_log(&self) -> PathBuf {
        self.root.join("elon-log.json")
    }

    pub fn elon_report(&self) -> PathBuf {
        self.root.join("elon-report.json")
    }

    pub fn blockers(&self) -> PathBuf {
        self.root.join("blockers.json")
    }

    pub fn auto_fixer_log(&self) -> PathBuf {
        self.root.join("auto-fixer-log.jsonl")
    }

    pub fn regression_tracker(&self) -> PathBuf {
        self.root.join("regression-tracker.json")
    }

    pub fn dev_mode(&self) -> PathBuf {
        self.root.join("dev-mode.json")
    }

    /// Create every directory the core writes into.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.approved_queue(),
            self.pending_queue(),
            self.completed(),
            self.failed(),
            self.backups(),
            self.decisions(),
            self.daily(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}
