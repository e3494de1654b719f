use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from `sneebly.toml` in the data directory
/// and overridden by environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub elon: ElonConfig,
    #[serde(default)]
    pub paths: PathPolicyConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Model ids per tier; defaults are filled in by the provider crate.
    #[serde(default)]
    pub haiku_model: Option<String>,
    #[serde(default)]
    pub sonnet_model: Option<String>,
    #[serde(default)]
    pub opus_model: Option<String>,
}

fn default_app_url() -> String {
    "http://localhost:5000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the host application under management.
    #[serde(default = "default_app_url")]
    pub url: String,
    #[serde(default)]
    pub dashboard_secret: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            url: default_app_url(),
            dashboard_secret: None,
            owner_email: None,
        }
    }
}

fn default_max_per_cycle() -> f64 {
    1.0
}

fn default_warning() -> f64 {
    0.75
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Hard dollar cap per cycle; LLM work stops once spent reaches it.
    #[serde(default = "default_max_per_cycle")]
    pub max_per_cycle: f64,
    /// Soft threshold; crossing it logs a warning.
    #[serde(default = "default_warning")]
    pub warning: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_per_cycle: default_max_per_cycle(),
            warning: default_warning(),
        }
    }
}

fn default_interval_minutes() -> u64 {
    30
}

fn default_discovery_interval_hours() -> u64 {
    24
}

fn default_deep_analysis_day() -> String {
    "sunday".to_string()
}

fn default_self_improve_day() -> String {
    "wednesday".to_string()
}

fn default_triage_batch() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default)]
    pub crawl_enabled: bool,
    #[serde(default = "default_discovery_interval_hours")]
    pub discovery_interval_hours: u64,
    /// Weekday names for the weekly jobs, lowercase English.
    #[serde(default = "default_deep_analysis_day")]
    pub deep_analysis_day: String,
    #[serde(default = "default_self_improve_day")]
    pub self_improve_day: String,
    #[serde(default = "default_triage_batch")]
    pub triage_batch: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_minutes: default_interval_minutes(),
            crawl_enabled: false,
            discovery_interval_hours: default_discovery_interval_hours(),
            deep_analysis_day: default_deep_analysis_day(),
            self_improve_day: default_self_improve_day(),
            triage_batch: default_triage_batch(),
        }
    }
}

fn default_max_constraints() -> u32 {
    3
}

fn default_elon_budget() -> f64 {
    2.0
}

fn default_cycle_pause_secs() -> u64 {
    10
}

fn default_max_dismissals() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElonConfig {
    #[serde(default = "default_max_constraints")]
    pub max_constraints_per_run: u32,
    #[serde(default = "default_elon_budget")]
    pub budget: f64,
    #[serde(default = "default_cycle_pause_secs")]
    pub cycle_pause_secs: u64,
    #[serde(default = "default_max_dismissals")]
    pub max_consecutive_dismissals: u32,
    /// Prefer direct backend HTTP probes over a browser crawl.
    #[serde(default)]
    pub backend_only: bool,
}

impl Default for ElonConfig {
    fn default() -> Self {
        Self {
            max_constraints_per_run: default_max_constraints(),
            budget: default_elon_budget(),
            cycle_pause_secs: default_cycle_pause_secs(),
            max_consecutive_dismissals: default_max_dismissals(),
            backend_only: false,
        }
    }
}

fn default_safe_paths() -> Vec<String> {
    vec![
        "public/**".to_string(),
        "views/**".to_string(),
        "routes/**".to_string(),
        "src/**".to_string(),
        "templates/**".to_string(),
    ]
}

fn default_protected_paths() -> Vec<String> {
    vec![
        "node_modules/**".to_string(),
        ".git/**".to_string(),
        "sneebly/**".to_string(),
        ".sneebly/**".to_string(),
    ]
}

/// Glob sets deciding where autonomous writes are auto-approved or denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathPolicyConfig {
    #[serde(default = "default_safe_paths")]
    pub safe: Vec<String>,
    #[serde(default = "default_protected_paths")]
    pub protected: Vec<String>,
}

impl Default for PathPolicyConfig {
    fn default() -> Self {
        Self {
            safe: default_safe_paths(),
            protected: default_protected_paths(),
        }
    }
}

fn default_shell_timeout_secs() -> u64 {
    60
}

fn default_health_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shell_timeout_secs: default_shell_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
        }
    }
}

fn default_completion_patterns() -> Vec<String> {
    vec![
        "already satisfied".to_string(),
        "already implemented".to_string(),
        "already exists".to_string(),
        "no changes needed".to_string(),
        "no changes are needed".to_string(),
        "nothing to change".to_string(),
        "already complete".to_string(),
        "requirement is met".to_string(),
    ]
}

/// Knobs for the response parser's last-resort heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Natural-language phrases treated as "spec already satisfied".
    #[serde(default = "default_completion_patterns")]
    pub completion_patterns: Vec<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            completion_patterns: default_completion_patterns(),
        }
    }
}

impl Config {
    /// Load from `<data_dir>/sneebly.toml` if present, then apply env
    /// overrides. Missing file is not an error.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("sneebly.toml");
        let mut config = if path.exists() {
            let content =
                std::fs::read_to_string(&path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables take precedence over file values.
    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("SNEEBLY_API_KEY") {
            if !key.is_empty() {
                self.provider.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("SNEEBLY_BASE_URL") {
            if !url.is_empty() {
                self.provider.base_url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("SNEEBLY_APP_URL") {
            if !url.is_empty() {
                self.app.url = url;
            }
        }
        if let Ok(secret) = std::env::var("SNEEBLY_DASHBOARD_SECRET") {
            if !secret.is_empty() {
                self.app.dashboard_secret = Some(secret);
            }
        }
        if let Ok(email) = std::env::var("SNEEBLY_OWNER_EMAIL") {
            if !email.is_empty() {
                self.app.owner_email = Some(email);
            }
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(data_dir.join("sneebly.toml"), content)
            .context("Failed to write config file")?;
        Ok(())
    }
}

/// Default data directory: `.sneebly/` under the host project root.
pub fn data_dir(project_root: &Path) -> PathBuf {
    project_root.join(".sneebly")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.app.url, "http://localhost:5000");
        assert_eq!(config.budget.max_per_cycle, 1.0);
        assert_eq!(config.heartbeat.interval_minutes, 30);
        assert_eq!(config.elon.max_consecutive_dismissals, 5);
        assert_eq!(config.runtime.shell_timeout_secs, 60);
        assert_eq!(config.parser.completion_patterns.len(), 8);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.heartbeat.triage_batch, 5);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sneebly.toml"),
            "[budget]\nmax_per_cycle = 0.5\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.budget.max_per_cycle, 0.5);
        assert_eq!(config.budget.warning, 0.75);
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.elon.budget = 3.5;
        config.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.elon.budget, 3.5);
    }

    #[test]
    fn test_data_dir_layout() {
        let dir = data_dir(Path::new("/srv/app"));
        assert_eq!(dir, PathBuf::from("/srv/app/.sneebly"));
    }
}
