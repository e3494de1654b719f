//! Alternative planner/builder pipeline, used when the goals declare
//! discrete roadmap milestones instead of a single constraint to hunt.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use sneebly_provider::ModelTier;

use crate::budget::BudgetLedger;
use crate::dispatch::{DispatchOutcome, Parsed, SubagentKind, SubagentTask};
use crate::engine::{syntax, FileOp};
use crate::exec::SpecRunner;
use crate::paths::DataPaths;
use crate::probes;
use crate::shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub id: String,
    pub action: String,
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub description: String,
    #[serde(rename = "dependsOn", default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default = "default_status")]
    pub status: StepStatus,
}

fn default_status() -> StepStatus {
    StepStatus::Pending
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    pub steps: Vec<BuildStep>,
}

impl BuildPlan {
    /// DFS cycle detection over the dependency graph. Returns one step id
    /// on a cycle, if any.
    pub fn find_cycle(&self) -> Option<String> {
        let index: HashMap<&str, &BuildStep> =
            self.steps.iter().map(|s| (s.id.as_str(), s)).collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            id: &'a str,
            index: &HashMap<&'a str, &'a BuildStep>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Option<String> {
            match marks.get(id) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => return Some(id.to_string()),
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(step) = index.get(id) {
                for dep in &step.depends_on {
                    if let Some(cycle) = visit(dep.as_str(), index, marks) {
                        return Some(cycle);
                    }
                }
            }
            marks.insert(id, Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for step in &self.steps {
            if let Some(cycle) = visit(step.id.as_str(), &index, &mut marks) {
                return Some(cycle);
            }
        }
        None
    }

    /// Steps whose dependencies are all done, in declaration order.
    pub fn ready_steps(&self) -> Vec<&BuildStep> {
        let done: HashSet<&str> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Done)
            .map(|s| s.id.as_str())
            .collect();
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .filter(|s| s.depends_on.iter().all(|d| done.contains(d.as_str())))
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.status != StepStatus::Pending)
    }

    fn set_status(&mut self, id: &str, status: StepStatus) {
        for step in &mut self.steps {
            if step.id == id {
                step.status = status;
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: String,
    pub file: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One auto-fixer pass over a blocker, appended to `auto-fixer-log.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResult {
    #[serde(rename = "blockerId")]
    pub blocker_id: String,
    pub diagnosis: String,
    /// "edit", "redirect" (work already done elsewhere), or "none".
    pub action: String,
    pub ok: bool,
    pub at: String,
}

pub struct PlannerBuilder<'a> {
    pub runner: &'a SpecRunner<'a>,
    pub paths: &'a DataPaths,
    pub app_url: String,
}

impl<'a> PlannerBuilder<'a> {
    /// Ask the planner (higher tier) for a step graph. A cyclic graph is
    /// rejected outright.
    pub async fn plan(
        &self,
        goals: &str,
        budget: &mut BudgetLedger,
    ) -> Result<Option<BuildPlan>> {
        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::ElonBuilder,
                    payload: json!({"goals": goals}),
                },
                budget,
                "",
                Some(ModelTier::Opus),
                false,
            )
            .await?;

        let DispatchOutcome::Completed {
            parsed: Parsed::Object(value),
            ..
        } = outcome
        else {
            return Ok(None);
        };

        let steps: Vec<BuildStep> = match value.get("steps") {
            Some(steps) => serde_json::from_value(steps.clone())?,
            None => return Ok(None),
        };
        let plan = BuildPlan { steps };

        if let Some(cycle) = plan.find_cycle() {
            tracing::warn!(step = cycle, "Planner produced a cyclic graph, rejecting");
            return Ok(None);
        }
        Ok(Some(plan))
    }

    /// Execute every dependency-ready step until the plan stalls or
    /// completes. The second attempt for a step that came back empty uses
    /// the higher-effort tier.
    pub async fn build(&self, plan: &mut BuildPlan, budget: &mut BudgetLedger) -> Result<()> {
        loop {
            let ready: Vec<String> = plan.ready_steps().iter().map(|s| s.id.clone()).collect();
            if ready.is_empty() {
                break;
            }
            for id in ready {
                if budget.exhausted() {
                    return Ok(());
                }
                let Some(step) = plan.steps.iter().find(|s| s.id == id).cloned() else {
                    continue;
                };
                let ok = self.execute_step(&step, budget).await?;
                plan.set_status(&id, if ok { StepStatus::Done } else { StepStatus::Failed });
            }
        }
        Ok(())
    }

    async fn execute_step(&self, step: &BuildStep, budget: &mut BudgetLedger) -> Result<bool> {
        let payload = json!({
            "step": step,
            "currentCode": self.read_target(&step.file_path),
        });

        let mut ops: Option<Vec<FileOp>> = None;
        for (attempt, tier) in [(1u32, None), (2, Some(ModelTier::Opus))] {
            let outcome = self
                .runner
                .dispatcher
                .dispatch(
                    &SubagentTask {
                        kind: SubagentKind::SpecExecutor,
                        payload: payload.clone(),
                    },
                    budget,
                    "",
                    tier,
                    false,
                )
                .await?;

            match outcome {
                DispatchOutcome::Completed { parsed, raw, .. } => {
                    if raw.trim().is_empty() {
                        tracing::info!(step = %step.id, attempt, "Empty builder response");
                        continue;
                    }
                    match parsed {
                        Parsed::Complete => return Ok(true),
                        Parsed::Object(value) => {
                            ops = Some(ops_from_response(step, &value));
                            break;
                        }
                        Parsed::Queue { .. } => continue,
                    }
                }
                _ => return Ok(false),
            }
        }

        let Some(ops) = ops else {
            return Ok(false);
        };
        if !ops.is_empty() && self.runner.engine.apply_transaction(&ops).is_err() {
            return Ok(false);
        }

        for command in &step.commands {
            let output = shell::run_whitelisted(
                command,
                &self.runner.config.project_root,
                self.runner.config.shell_timeout,
            )
            .await;
            match output {
                Ok(out) if out.success() => {}
                _ => return Ok(false),
            }
        }

        let checks = self.verify_files(&[step.file_path.clone()]).await;
        Ok(checks.iter().all(|c| c.passed))
    }

    fn read_target(&self, rel: &str) -> String {
        std::fs::read_to_string(self.runner.config.project_root.join(rel)).unwrap_or_default()
    }

    /// The six verifier checks over modified files.
    pub async fn verify_files(&self, files: &[String]) -> Vec<CheckOutcome> {
        let mut outcomes = vec![];
        let root = &self.runner.config.project_root;

        for rel in files {
            let path = root.join(rel);

            // 1. Existence.
            let exists = path.is_file();
            outcomes.push(CheckOutcome {
                check: "exists".into(),
                file: rel.clone(),
                passed: exists,
                detail: None,
            });
            if !exists {
                continue;
            }

            // 2. Balanced syntax.
            if syntax::is_checkable(&path) {
                let passed = std::fs::read_to_string(&path)
                    .map(|c| syntax::verify_balanced(&c).is_ok())
                    .unwrap_or(false);
                outcomes.push(CheckOutcome {
                    check: "syntax".into(),
                    file: rel.clone(),
                    passed,
                    detail: None,
                });
            }

            // 3. Type check, restricted to the modified file.
            if matches!(path.extension().and_then(|e| e.to_str()), Some("ts" | "tsx")) {
                let output = shell::run_whitelisted(
                    &format!("npx tsc --noEmit {rel}"),
                    root,
                    self.runner.config.shell_timeout,
                )
                .await;
                outcomes.push(CheckOutcome {
                    check: "types".into(),
                    file: rel.clone(),
                    passed: output.map(|o| o.success()).unwrap_or(false),
                    detail: None,
                });
            }

            // 4. Affected API endpoint: 401/403 still means the route
            //    exists.
            if let Some(endpoint) = endpoint_for(rel) {
                let crawl = probes::probe_pages(
                    &self.app_url,
                    &[endpoint.clone()],
                    Duration::from_secs(10),
                )
                .await;
                let passed = crawl
                    .pages
                    .first()
                    .map(|p| p.status < 500 && p.status != 0)
                    .unwrap_or(false);
                outcomes.push(CheckOutcome {
                    check: "endpoint".into(),
                    file: rel.clone(),
                    passed,
                    detail: Some(endpoint),
                });
            }

            // 5. Filename-keyed invariants.
            if let Some((invariant, passed)) = check_invariant(rel, &path) {
                outcomes.push(CheckOutcome {
                    check: "invariant".into(),
                    file: rel.clone(),
                    passed,
                    detail: Some(invariant),
                });
            }
        }

        // 6. Headless smoke probe over the app root: a blank page or a
        //    console flood fails. The browser itself is external; the
        //    backend probe supplies the same result shape.
        let smoke = probes::probe_pages(&self.app_url, &["/".into()], Duration::from_secs(10)).await;
        if let Some(page) = smoke.pages.first() {
            outcomes.push(CheckOutcome {
                check: "smoke".into(),
                file: "/".into(),
                passed: !page.blank_page && page.console_errors.len() <= 3 && page.status < 500,
                detail: None,
            });
        }

        outcomes
    }

    /// React to one active blocker: diagnose, recognise work already done
    /// elsewhere, or emit a fix change set through the engine.
    pub async fn auto_fix(
        &self,
        blocker: &crate::blockers::Blocker,
        budget: &mut BudgetLedger,
    ) -> Result<FixResult> {
        let failed_outcome = self.runner.store.load_outcome(&blocker.spec_id)?;

        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::SpecExecutor,
                    payload: json!({
                        "blocker": blocker,
                        "failedSpec": failed_outcome,
                        "currentCode": self.read_target(&blocker.target_file),
                        "instructions": blocker.user_instructions,
                    }),
                },
                budget,
                "",
                None,
                false,
            )
            .await?;

        let result = match outcome {
            DispatchOutcome::Completed { parsed, .. } => match parsed {
                Parsed::Complete => FixResult {
                    blocker_id: blocker.id.clone(),
                    diagnosis: "work already done elsewhere".into(),
                    action: "redirect".into(),
                    ok: true,
                    at: Utc::now().to_rfc3339(),
                },
                Parsed::Object(value) => {
                    let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
                    if status == "redirect" {
                        FixResult {
                            blocker_id: blocker.id.clone(),
                            diagnosis: value
                                .get("reason")
                                .and_then(|v| v.as_str())
                                .unwrap_or("already handled")
                                .into(),
                            action: "redirect".into(),
                            ok: true,
                            at: Utc::now().to_rfc3339(),
                        }
                    } else {
                        let ops = ops_from_value(&value, &blocker.target_file);
                        let ok = !ops.is_empty()
                            && self.runner.engine.apply_transaction(&ops).is_ok();
                        FixResult {
                            blocker_id: blocker.id.clone(),
                            diagnosis: value
                                .get("reason")
                                .and_then(|v| v.as_str())
                                .unwrap_or("fix attempted")
                                .into(),
                            action: "edit".into(),
                            ok,
                            at: Utc::now().to_rfc3339(),
                        }
                    }
                }
                Parsed::Queue { reason, .. } => FixResult {
                    blocker_id: blocker.id.clone(),
                    diagnosis: reason,
                    action: "none".into(),
                    ok: false,
                    at: Utc::now().to_rfc3339(),
                },
            },
            _ => FixResult {
                blocker_id: blocker.id.clone(),
                diagnosis: "dispatch unavailable".into(),
                action: "none".into(),
                ok: false,
                at: Utc::now().to_rfc3339(),
            },
        };

        self.append_fix_log(&result)?;
        Ok(result)
    }

    fn append_fix_log(&self, result: &FixResult) -> Result<()> {
        use std::io::Write;
        std::fs::create_dir_all(self.paths.root())?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.paths.auto_fixer_log())?;
        writeln!(file, "{}", serde_json::to_string(result)?)?;
        Ok(())
    }
}

fn endpoint_for(rel: &str) -> Option<String> {
    let name = rel.strip_prefix("routes/")?;
    let stem = name.strip_suffix(".js").unwrap_or(name);
    Some(format!("/{stem}"))
}

/// Filename-pattern invariants over file content.
fn check_invariant(rel: &str, path: &std::path::Path) -> Option<(String, bool)> {
    let content = std::fs::read_to_string(path).ok()?;
    if rel.starts_with("routes/") && rel.ends_with(".js") {
        let passed = content.contains("module.exports")
            || content.contains("router.")
            || content.contains("app.");
        return Some(("route-exports".into(), passed));
    }
    if rel.starts_with("models/") && rel.ends_with(".js") {
        let passed = content.contains("Schema") || content.contains("module.exports");
        return Some(("model-schema".into(), passed));
    }
    None
}

fn ops_from_response(step: &BuildStep, value: &Value) -> Vec<FileOp> {
    ops_from_value(value, &step.file_path)
}

fn ops_from_value(value: &Value, default_path: &str) -> Vec<FileOp> {
    let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");
    let path = value
        .get("filePath")
        .and_then(|v| v.as_str())
        .unwrap_or(default_path)
        .to_string();

    match status {
        "change" => {
            let old = value.get("oldCode").and_then(|v| v.as_str());
            let new = value.get("newCode").and_then(|v| v.as_str());
            match (old, new) {
                (Some(old), Some(new)) => vec![FileOp::Change {
                    file_path: path,
                    old_code: old.to_string(),
                    new_code: new.to_string(),
                }],
                _ => vec![],
            }
        }
        "create" => value
            .get("content")
            .and_then(|v| v.as_str())
            .map(|content| {
                vec![FileOp::Create {
                    file_path: path,
                    content: content.to_string(),
                }]
            })
            .unwrap_or_default(),
        "multi-change" => value
            .get("changes")
            .and_then(|v| v.as_array())
            .map(|changes| {
                changes
                    .iter()
                    .filter_map(|c| {
                        Some(FileOp::Change {
                            file_path: c.get("filePath")?.as_str()?.to_string(),
                            old_code: c.get("oldCode")?.as_str()?.to_string(),
                            new_code: c.get("newCode")?.as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        _ => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> BuildStep {
        BuildStep {
            id: id.into(),
            action: "create".into(),
            file_path: format!("routes/{id}.js"),
            description: format!("build {id}"),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            commands: vec![],
            status: StepStatus::Pending,
        }
    }

    #[test]
    fn test_cycle_detection() {
        let plan = BuildPlan {
            steps: vec![step("a", &["b"]), step("b", &["c"]), step("c", &["a"])],
        };
        assert!(plan.find_cycle().is_some());

        let acyclic = BuildPlan {
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["a", "b"])],
        };
        assert!(acyclic.find_cycle().is_none());
    }

    #[test]
    fn test_ready_steps_honour_dependencies() {
        let mut plan = BuildPlan {
            steps: vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])],
        };
        let ready: Vec<&str> = plan.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        plan.set_status("a", StepStatus::Done);
        let ready: Vec<&str> = plan.ready_steps().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn test_failed_dependency_blocks_downstream() {
        let mut plan = BuildPlan {
            steps: vec![step("a", &[]), step("b", &["a"])],
        };
        plan.set_status("a", StepStatus::Failed);
        assert!(plan.ready_steps().is_empty());
        assert!(!plan.is_complete());
    }

    #[test]
    fn test_endpoint_mapping() {
        assert_eq!(endpoint_for("routes/users.js").as_deref(), Some("/users"));
        assert_eq!(endpoint_for("lib/db.js"), None);
    }

    #[test]
    fn test_route_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.js");
        std::fs::write(&good, "module.exports = router;\n").unwrap();
        let (name, passed) = check_invariant("routes/users.js", &good).unwrap();
        assert_eq!(name, "route-exports");
        assert!(passed);

        let bad = dir.path().join("bad.js");
        std::fs::write(&bad, "const x = 1;\n").unwrap();
        let (_, passed) = check_invariant("routes/users.js", &bad).unwrap();
        assert!(!passed);
    }

    #[test]
    fn test_ops_from_value_shapes() {
        let change = serde_json::json!({
            "status": "change", "oldCode": "a", "newCode": "b"
        });
        let ops = ops_from_value(&change, "routes/x.js");
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].file_path(), "routes/x.js");

        let create = serde_json::json!({
            "status": "create", "filePath": "routes/y.js", "content": "let y;"
        });
        let ops = ops_from_value(&create, "routes/x.js");
        assert_eq!(ops[0].file_path(), "routes/y.js");

        let junk = serde_json::json!({"status": "???"});
        assert!(ops_from_value(&junk, "routes/x.js").is_empty());
    }

    #[test]
    fn test_plan_step_deserialization() {
        let value = serde_json::json!([
            {"id": "s1", "action": "create", "filePath": "routes/a.js",
             "description": "scaffold", "dependsOn": []}
        ]);
        let steps: Vec<BuildStep> = serde_json::from_value(value).unwrap();
        assert_eq!(steps[0].status, StepStatus::Pending);
    }
}
