use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;

use crate::paths::DataPaths;
use crate::spec::{ExecStatus, IterationRecord, Spec, SpecOutcome};

/// Queue a spec lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Pending,
    Approved,
    Completed,
    Failed,
}

/// Spec queues on disk. One writer per transition; every move is
/// write-to-temp + rename so observers never see torn state.
pub struct SpecStore {
    paths: DataPaths,
}

impl SpecStore {
    pub fn new(paths: &DataPaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    fn dir(&self, queue: Queue) -> PathBuf {
        match queue {
            Queue::Pending => self.paths.pending_queue(),
            Queue::Approved => self.paths.approved_queue(),
            Queue::Completed => self.paths.completed(),
            Queue::Failed => self.paths.failed(),
        }
    }

    fn spec_path(&self, queue: Queue, id: &str) -> PathBuf {
        self.dir(queue).join(format!("{id}.json"))
    }

    /// Atomic write: temp file in the target directory, then rename.
    fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let dir = path
            .parent()
            .context("spec path has no parent directory")?;
        std::fs::create_dir_all(dir)?;
        let tmp = dir.join(format!(
            ".{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy()
        ));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Write a new spec into `pending` or `approved`. Exactly one file per
    /// id across all queues.
    pub fn enqueue(&self, spec: &Spec, queue: Queue) -> Result<()> {
        if !matches!(queue, Queue::Pending | Queue::Approved) {
            bail!("specs can only be enqueued to pending or approved");
        }
        if self.locate(&spec.id).is_some() {
            bail!("spec {} already exists", spec.id);
        }
        let content = serde_json::to_string_pretty(spec)?;
        Self::write_atomic(&self.spec_path(queue, &spec.id), &content)
    }

    /// Find which queue currently holds the id.
    pub fn locate(&self, id: &str) -> Option<Queue> {
        for queue in [Queue::Pending, Queue::Approved, Queue::Completed, Queue::Failed] {
            if self.spec_path(queue, id).exists() {
                return Some(queue);
            }
        }
        None
    }

    pub fn load(&self, queue: Queue, id: &str) -> Result<Spec> {
        let content = std::fs::read_to_string(self.spec_path(queue, id))
            .with_context(|| format!("Failed to read spec {id}"))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Specs in a queue, oldest first. Tolerates a transiently missing
    /// directory.
    pub fn list(&self, queue: Queue) -> Vec<Spec> {
        let dir = self.dir(queue);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return vec![],
        };
        let mut specs: Vec<Spec> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path().extension().map(|x| x == "json").unwrap_or(false)
            })
            .filter_map(|e| {
                let content = std::fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&content).ok()
            })
            .collect();
        specs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        specs
    }

    /// Owner approval: move a spec from pending to approved.
    pub fn approve(&self, id: &str) -> Result<()> {
        let from = self.spec_path(Queue::Pending, id);
        if !from.exists() {
            bail!("spec {id} is not pending");
        }
        let to = self.spec_path(Queue::Approved, id);
        std::fs::create_dir_all(self.dir(Queue::Approved))?;
        std::fs::rename(&from, &to)?;
        Ok(())
    }

    /// Move a spec to its terminal queue with the outcome envelope.
    /// Terminal spec files are immutable: a second finalize for the same id
    /// is an error.
    pub fn finalize(
        &self,
        spec: &Spec,
        status: ExecStatus,
        iterations: Vec<IterationRecord>,
    ) -> Result<()> {
        let target = if status.is_success() {
            Queue::Completed
        } else {
            Queue::Failed
        };
        let target_path = self.spec_path(target, &spec.id);
        if target_path.exists() {
            bail!("spec {} already finalized", spec.id);
        }

        let outcome = SpecOutcome {
            spec: spec.clone(),
            status,
            iterations,
            finished_at: Utc::now().to_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&outcome)?;
        Self::write_atomic(&target_path, &content)?;

        // Drop the source file from whichever working queue held it.
        for queue in [Queue::Pending, Queue::Approved] {
            let path = self.spec_path(queue, &spec.id);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    pub fn load_outcome(&self, id: &str) -> Result<Option<SpecOutcome>> {
        for queue in [Queue::Completed, Queue::Failed] {
            let path = self.spec_path(queue, id);
            if path.exists() {
                let content = std::fs::read_to_string(&path)?;
                return Ok(Some(serde_json::from_str(&content)?));
            }
        }
        Ok(None)
    }

    /// Outcomes for all step specs of a constraint.
    pub fn outcomes_for_constraint(&self, constraint_id: &str) -> Vec<SpecOutcome> {
        let mut outcomes = vec![];
        for queue in [Queue::Completed, Queue::Failed] {
            let dir = self.dir(queue);
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for entry in entries.filter_map(|e| e.ok()) {
                if let Ok(content) = std::fs::read_to_string(entry.path()) {
                    if let Ok(outcome) = serde_json::from_str::<SpecOutcome>(&content) {
                        if outcome.spec.constraint_id.as_deref() == Some(constraint_id) {
                            outcomes.push(outcome);
                        }
                    }
                }
            }
        }
        outcomes
    }
}
