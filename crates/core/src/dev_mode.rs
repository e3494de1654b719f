use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::paths::DataPaths;

/// Development-mode gate (`dev-mode.json`). While enabled, autonomous
/// mutation is paused so a developer can work on the host app without the
/// core editing files underneath them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevMode {
    pub enabled: bool,
    #[serde(rename = "enabledBy", default, skip_serializing_if = "Option::is_none")]
    pub enabled_by: Option<String>,
    #[serde(rename = "enabledAt", default, skip_serializing_if = "Option::is_none")]
    pub enabled_at: Option<String>,
}

pub fn load(paths: &DataPaths) -> DevMode {
    let path = paths.dev_mode();
    if !path.exists() {
        return DevMode::default();
    }
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|c| serde_json::from_str(&c).ok())
        .unwrap_or_default()
}

pub fn set(paths: &DataPaths, enabled: bool, by: &str) -> Result<DevMode> {
    let mode = DevMode {
        enabled,
        enabled_by: enabled.then(|| by.to_string()),
        enabled_at: enabled.then(|| Utc::now().to_rfc3339()),
    };
    std::fs::create_dir_all(paths.root())?;
    std::fs::write(paths.dev_mode(), serde_json::to_string_pretty(&mode)?)?;
    Ok(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        assert!(!load(&paths).enabled);
    }

    #[test]
    fn test_enable_and_disable() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();
        set(&paths, true, "owner@example.com").unwrap();
        let mode = load(&paths);
        assert!(mode.enabled);
        assert_eq!(mode.enabled_by.as_deref(), Some("owner@example.com"));
        set(&paths, false, "owner@example.com").unwrap();
        assert!(!load(&paths).enabled);
    }
}
