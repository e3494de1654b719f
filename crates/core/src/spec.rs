use chrono::Utc;
use serde::{Deserialize, Serialize};

/// What produced a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecKind {
    Fix,
    Optimize,
    IntelFinding,
    ConstraintStep,
    BuildStep,
}

/// The mutation shape a spec requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecAction {
    Create,
    Replace,
    Append,
    MultiChange,
    MultiCreate,
}

/// One substring replacement inside a multi-change set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    #[serde(rename = "filePath")]
    pub file_path: String,
    #[serde(rename = "oldCode")]
    pub old_code: String,
    #[serde(rename = "newCode")]
    pub new_code: String,
}

/// One file inside a multi-create set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFile {
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub content: String,
}

/// A persisted unit of intended change; the only thing the execution loop
/// consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spec {
    pub id: String,
    pub kind: SpecKind,
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub description: String,
    #[serde(rename = "successCriteria", default)]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<SpecAction>,
    #[serde(rename = "oldCode", default, skip_serializing_if = "Option::is_none")]
    pub old_code: Option<String>,
    #[serde(rename = "newCode", default, skip_serializing_if = "Option::is_none")]
    pub new_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<Change>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<NewFile>,
    #[serde(rename = "relatedFiles", default, skip_serializing_if = "Vec::is_empty")]
    pub related_files: Vec<String>,
    #[serde(rename = "testCommand", default, skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    #[serde(
        rename = "verificationPages",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub verification_pages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "constraintId", default, skip_serializing_if = "Option::is_none")]
    pub constraint_id: Option<String>,
}

impl Spec {
    pub fn new(kind: SpecKind, file_path: &str, description: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            file_path: file_path.to_string(),
            description: description.to_string(),
            success_criteria: vec![],
            action: None,
            old_code: None,
            new_code: None,
            content: None,
            changes: vec![],
            files: vec![],
            related_files: vec![],
            test_command: None,
            verification_pages: vec![],
            priority: None,
            category: None,
            created_at: Utc::now().to_rfc3339(),
            constraint_id: None,
        }
    }
}

/// How a spec run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecStatus {
    Completed,
    Stuck,
    MaxIterations,
    TestFailed,
    RuntimeFailed,
    ValidationFailed,
}

impl ExecStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecStatus::Completed)
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecStatus::Completed => write!(f, "completed"),
            ExecStatus::Stuck => write!(f, "stuck"),
            ExecStatus::MaxIterations => write!(f, "max-iterations"),
            ExecStatus::TestFailed => write!(f, "test-failed"),
            ExecStatus::RuntimeFailed => write!(f, "runtime-failed"),
            ExecStatus::ValidationFailed => write!(f, "validation-failed"),
        }
    }
}

/// One iteration of the execution loop, persisted with the terminal spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub action: String,
    pub ok: bool,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_ids: Vec<String>,
}

/// Terminal envelope written next to the spec in `completed/` or `failed/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecOutcome {
    pub spec: Spec,
    pub status: ExecStatus,
    pub iterations: Vec<IterationRecord>,
    #[serde(rename = "finishedAt")]
    pub finished_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_json_field_names() {
        let mut spec = Spec::new(SpecKind::Fix, "routes/users.js", "fix null deref");
        spec.success_criteria.push("page loads".to_string());
        spec.old_code = Some("a".to_string());
        spec.new_code = Some("b".to_string());
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "fix");
        assert_eq!(json["filePath"], "routes/users.js");
        assert_eq!(json["successCriteria"][0], "page loads");
        assert_eq!(json["oldCode"], "a");
        assert!(json.get("content").is_none());
    }

    #[test]
    fn test_spec_round_trip() {
        let spec = Spec::new(SpecKind::ConstraintStep, "views/home.ejs", "add banner");
        let json = serde_json::to_string(&spec).unwrap();
        let back: Spec = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, spec.id);
        assert_eq!(back.kind, SpecKind::ConstraintStep);
    }

    #[test]
    fn test_exec_status_display() {
        assert_eq!(ExecStatus::MaxIterations.to_string(), "max-iterations");
        assert!(ExecStatus::Completed.is_success());
        assert!(!ExecStatus::Stuck.is_success());
    }
}
