use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::paths::DataPaths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockerStatus {
    Active,
    Resolved,
    Dismissed,
}

/// A spec the loop gave up on, escalated for owner review. Spec relations
/// are stored as ids only and dereferenced from disk on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blocker {
    pub id: String,
    #[serde(rename = "specId")]
    pub spec_id: String,
    #[serde(rename = "targetFile")]
    pub target_file: String,
    pub reason: String,
    pub attempts: u32,
    #[serde(rename = "userInstructions", default)]
    pub user_instructions: Vec<String>,
    #[serde(rename = "suggestedSkill", default, skip_serializing_if = "Option::is_none")]
    pub suggested_skill: Option<String>,
    pub status: BlockerStatus,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BlockersFile {
    blockers: Vec<Blocker>,
}

pub struct BlockerStore {
    paths: DataPaths,
}

impl BlockerStore {
    pub fn new(paths: &DataPaths) -> Self {
        Self {
            paths: paths.clone(),
        }
    }

    fn load(&self) -> BlockersFile {
        let path = self.paths.blockers();
        if !path.exists() {
            return BlockersFile::default();
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    fn save(&self, file: &BlockersFile) -> Result<()> {
        std::fs::create_dir_all(self.paths.root())?;
        std::fs::write(self.paths.blockers(), serde_json::to_string_pretty(file)?)?;
        Ok(())
    }

    pub fn raise(
        &self,
        spec_id: &str,
        target_file: &str,
        reason: &str,
        attempts: u32,
        suggested_skill: Option<String>,
    ) -> Result<Blocker> {
        let blocker = Blocker {
            id: uuid::Uuid::new_v4().to_string(),
            spec_id: spec_id.to_string(),
            target_file: target_file.to_string(),
            reason: reason.to_string(),
            attempts,
            user_instructions: vec![],
            suggested_skill,
            status: BlockerStatus::Active,
            created_at: Utc::now().to_rfc3339(),
        };
        let mut file = self.load();
        file.blockers.push(blocker.clone());
        self.save(&file)?;
        tracing::warn!(spec_id, reason, attempts, "Blocker raised");
        Ok(blocker)
    }

    pub fn active(&self) -> Vec<Blocker> {
        self.load()
            .blockers
            .into_iter()
            .filter(|b| b.status == BlockerStatus::Active)
            .collect()
    }

    pub fn set_status(&self, id: &str, status: BlockerStatus) -> Result<bool> {
        let mut file = self.load();
        let mut found = false;
        for blocker in &mut file.blockers {
            if blocker.id == id {
                blocker.status = status;
                found = true;
            }
        }
        if found {
            self.save(&file)?;
        }
        Ok(found)
    }

    pub fn add_instruction(&self, id: &str, instruction: &str) -> Result<bool> {
        let mut file = self.load();
        let mut found = false;
        for blocker in &mut file.blockers {
            if blocker.id == id {
                blocker.user_instructions.push(instruction.to_string());
                found = true;
            }
        }
        if found {
            self.save(&file)?;
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BlockerStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        (dir, BlockerStore::new(&paths))
    }

    #[test]
    fn test_raise_and_list_active() {
        let (_dir, store) = setup();
        let blocker = store
            .raise("spec-1", "routes/a.js", "stuck", 3, None)
            .unwrap();
        assert_eq!(blocker.attempts, 3);
        assert_eq!(store.active().len(), 1);
    }

    #[test]
    fn test_resolve_removes_from_active() {
        let (_dir, store) = setup();
        let blocker = store
            .raise("spec-1", "routes/a.js", "stuck", 3, None)
            .unwrap();
        assert!(store
            .set_status(&blocker.id, BlockerStatus::Resolved)
            .unwrap());
        assert!(store.active().is_empty());
    }

    #[test]
    fn test_add_instruction() {
        let (_dir, store) = setup();
        let blocker = store
            .raise("spec-1", "routes/a.js", "stuck", 3, None)
            .unwrap();
        store
            .add_instruction(&blocker.id, "try the v2 endpoint")
            .unwrap();
        let active = store.active();
        assert_eq!(active[0].user_instructions.len(), 1);
    }
}
