//! Strategic constraint-solver loop: observe the host, ask the analyst for
//! the single most-blocking constraint, decompose it into step specs, drive
//! them through the execution loop, then evaluate against fresh evidence.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::budget::BudgetLedger;
use crate::decisions::DecisionLog;
use crate::dispatch::{DispatchOutcome, Parsed, SubagentKind, SubagentTask};
use crate::exec::{RunEnd, SpecRunner};
use crate::paths::DataPaths;
use crate::probes::{self, CrawlReport, IntegrationHealth, ScenarioResult};
use crate::regression::CheckRecord;
use crate::spec::{Spec, SpecKind};
use crate::store::Queue;

use sneebly_safety::PathPolicy;

const CODE_EXCERPT_MAX_CHARS: usize = 25_000;
const DUPLICATE_SIMILARITY: f64 = 0.6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitingFactor {
    pub description: String,
    pub why: String,
    #[serde(default)]
    pub unblocks: Vec<String>,
    pub score: u8,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub description: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(rename = "successCriteria", default)]
    pub success_criteria: Vec<String>,
    #[serde(rename = "oldCode", default)]
    pub old_code: Option<String>,
    #[serde(rename = "newCode", default)]
    pub new_code: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// The analyst's answer for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintReport {
    #[serde(rename = "currentGoal", default)]
    pub current_goal: String,
    #[serde(rename = "limitingFactor")]
    pub limiting_factor: LimitingFactor,
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    #[serde(rename = "verificationPages", default)]
    pub verification_pages: Vec<String>,
    #[serde(rename = "completionCriteria", default)]
    pub completion_criteria: String,
    #[serde(rename = "previousConstraints", default)]
    pub previous_constraints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintRecord {
    pub id: String,
    pub report: ConstraintReport,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "resolvedAt", default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry {
    #[serde(rename = "constraintId")]
    pub constraint_id: String,
    pub description: String,
    pub reason: String,
    /// Files the failed plan touched; prioritised in later analyst payloads.
    #[serde(rename = "touchedFiles", default)]
    pub touched_files: Vec<String>,
    pub at: String,
}

/// Failure memory persisted across cycles (`elon-log.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElonLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<ConstraintRecord>,
    #[serde(default)]
    pub solved: Vec<ConstraintRecord>,
    #[serde(rename = "blockedConstraints", default)]
    pub blocked_constraints: Vec<String>,
    #[serde(rename = "failedHistory", default)]
    pub failed_history: Vec<FailedEntry>,
    #[serde(rename = "modeOverride", default, skip_serializing_if = "Option::is_none")]
    pub mode_override: Option<String>,
}

impl ElonLog {
    pub fn load(paths: &DataPaths) -> Self {
        let path = paths.elon_log();
        if !path.exists() {
            return Self::default();
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, paths: &DataPaths) -> Result<()> {
        std::fs::create_dir_all(paths.root())?;
        std::fs::write(paths.elon_log(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Everything the analyst sees for one cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationBundle {
    pub crawl: CrawlReport,
    #[serde(default)]
    pub integrations: Vec<IntegrationHealth>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioResult>,
    #[serde(default)]
    pub regressions: BTreeMap<String, CheckRecord>,
    #[serde(rename = "sourceFiles", default)]
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Resolved,
    Active,
    InProgress,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Analyst found nothing actionable.
    NoConstraint,
    /// Candidate dismissed (auth-framed or near-duplicate).
    Dismissed(String),
    /// A constraint was planned and its steps executed.
    Finished {
        constraint_id: String,
        resolved: bool,
    },
    /// LLM work stopped early (budget or vendor failure).
    Halted(String),
}

#[derive(Debug, Default)]
pub struct ElonSummary {
    pub cycles: u32,
    pub solved: u32,
    pub dismissed: u32,
    pub halted: Option<String>,
}

/// Drop expected auth rejections from a crawl: 401/403 on protected API
/// paths are what an unauthenticated crawler should see.
pub fn prefilter_crawl(report: &CrawlReport) -> CrawlReport {
    CrawlReport {
        pages: report
            .pages
            .iter()
            .filter(|p| {
                !(matches!(p.status, 401 | 403) && p.url.contains("/api/"))
            })
            .cloned()
            .collect(),
    }
}

/// A candidate framed as "authentication is broken" is noise from
/// unauthenticated probing, never the limiting factor.
pub fn is_auth_framed(factor: &LimitingFactor) -> bool {
    let text = format!("{} {}", factor.description, factor.why).to_lowercase();
    let auth = ["auth", "login", "unauthorized", "401", "403"];
    let broken = ["broken", "fail", "blocked", "reject", "error"];
    auth.iter().any(|kw| text.contains(kw)) && broken.iter().any(|kw| text.contains(kw))
}

/// Word-overlap similarity for constraint dedup.
fn similarity(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> std::collections::HashSet<String> {
        s.to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(String::from)
            .collect()
    };
    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() || wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    intersection / union
}

/// True when the candidate near-duplicates a solved or blocked constraint.
pub fn is_duplicate(candidate: &str, log: &ElonLog) -> bool {
    log.solved
        .iter()
        .map(|r| r.report.limiting_factor.description.as_str())
        .chain(log.blocked_constraints.iter().map(String::as_str))
        .any(|known| similarity(candidate, known) >= DUPLICATE_SIMILARITY)
}

/// Code excerpts for the analyst payload: priority files first (those
/// touched by already-identified constraints), then other source files,
/// capped at 25 KB.
pub fn gather_code_excerpts(
    project_root: &Path,
    priority_files: &[String],
    source_files: &[String],
) -> String {
    let mut out = String::new();
    let mut seen = std::collections::HashSet::new();

    for rel in priority_files.iter().chain(source_files.iter()) {
        if out.chars().count() >= CODE_EXCERPT_MAX_CHARS {
            break;
        }
        if !seen.insert(rel.clone()) {
            continue;
        }
        let path = project_root.join(rel);
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let remaining = CODE_EXCERPT_MAX_CHARS - out.chars().count();
        let excerpt: String = content.chars().take(remaining.min(4000)).collect();
        out.push_str(&format!("// ==== {rel} ====\n{excerpt}\n"));
    }
    out
}

/// Shallow source-file index refresh, dependency stores excluded.
pub fn refresh_source_index(project_root: &Path) -> Vec<String> {
    let mut files = vec![];
    let mut stack = vec![project_root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_dir() {
                if !matches!(
                    name.as_str(),
                    "node_modules" | ".git" | ".sneebly" | "target" | "vendor"
                ) {
                    stack.push(path);
                }
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("js" | "ts" | "jsx" | "tsx" | "ejs" | "css" | "html")
            ) {
                if let Ok(rel) = path.strip_prefix(project_root) {
                    files.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        if files.len() > 500 {
            break;
        }
    }
    files.sort();
    files
}

pub struct ElonSolver<'a> {
    pub runner: &'a SpecRunner<'a>,
    pub policy: &'a PathPolicy,
    pub paths: &'a DataPaths,
    pub decisions: &'a DecisionLog,
    pub app_url: String,
    pub elon: sneebly_config::ElonConfig,
}

impl<'a> ElonSolver<'a> {
    /// Observe the host: crawl (backend probes here; a browser crawler
    /// feeds the same schema), regression snapshot, source index refresh.
    pub async fn observe(&self, extra_pages: &[String]) -> ObservationBundle {
        let mut pages: Vec<String> = vec!["/".into(), "/health".into()];
        pages.extend(extra_pages.iter().cloned());
        let crawl = probes::probe_pages(&self.app_url, &pages, Duration::from_secs(10)).await;

        ObservationBundle {
            crawl,
            integrations: vec![],
            scenarios: vec![],
            regressions: crate::regression::RegressionTracker::new(self.paths).snapshot(),
            source_files: refresh_source_index(&self.runner.config.project_root),
        }
    }

    /// One full constraint cycle.
    pub async fn cycle(
        &self,
        bundle: &ObservationBundle,
        budget: &mut BudgetLedger,
    ) -> Result<CycleOutcome> {
        let mut log = ElonLog::load(self.paths);
        let filtered = prefilter_crawl(&bundle.crawl);

        let priority: Vec<String> = log
            .failed_history
            .iter()
            .flat_map(|f| f.touched_files.iter().cloned())
            .collect();
        let excerpts = gather_code_excerpts(
            &self.runner.config.project_root,
            &priority,
            &bundle.source_files,
        );

        let payload = json!({
            "crawl": filtered,
            "integrations": bundle.integrations,
            "scenarios": bundle.scenarios,
            "regressions": bundle.regressions,
            "codeExcerpts": excerpts,
            "blockedConstraints": log.blocked_constraints,
            "failedHistory": log.failed_history,
            "previouslySolved": log.solved.iter()
                .map(|r| r.report.limiting_factor.description.clone())
                .collect::<Vec<_>>(),
        });

        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::ElonAnalyst,
                    payload,
                },
                budget,
                &self.decisions.memory_tail(crate::dispatch::prompt::MEMORY_TAIL_MAX),
                None,
                false,
            )
            .await?;

        let value = match outcome {
            DispatchOutcome::Skipped { reason } => return Ok(CycleOutcome::Halted(reason)),
            DispatchOutcome::Failed { kind, .. } => return Ok(CycleOutcome::Halted(kind)),
            DispatchOutcome::DryRun { .. } => return Ok(CycleOutcome::Halted("dry-run".into())),
            DispatchOutcome::Completed { parsed, .. } => match parsed {
                Parsed::Object(value) => value,
                _ => return Ok(CycleOutcome::NoConstraint),
            },
        };

        // Strict shape: any response without the exact keys is rejected.
        let report: ConstraintReport = match serde_json::from_value(value.clone()) {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Analyst response rejected: wrong shape");
                return Ok(CycleOutcome::NoConstraint);
            }
        };

        // Persist the latest analyst output regardless of what happens next.
        std::fs::write(
            self.paths.elon_report(),
            serde_json::to_string_pretty(&report)?,
        )?;

        if !(1..=10).contains(&report.limiting_factor.score) {
            return Ok(CycleOutcome::Dismissed("score out of range".into()));
        }
        if is_auth_framed(&report.limiting_factor) {
            self.decisions.record(
                "constraint-dismissed",
                json!({"reason": "auth-framed", "description": report.limiting_factor.description}),
            )?;
            return Ok(CycleOutcome::Dismissed("auth-framed".into()));
        }
        if is_duplicate(&report.limiting_factor.description, &log) {
            self.decisions.record(
                "constraint-dismissed",
                json!({"reason": "duplicate", "description": report.limiting_factor.description}),
            )?;
            return Ok(CycleOutcome::Dismissed("duplicate".into()));
        }

        let record = ConstraintRecord {
            id: uuid::Uuid::new_v4().to_string(),
            report: report.clone(),
            created_at: Utc::now().to_rfc3339(),
            resolved_at: None,
        };
        log.current = Some(record.clone());
        log.save(self.paths)?;

        // One spec per plan step; safe paths skip owner review.
        let mut step_ids = vec![];
        for step in &report.plan {
            let mut spec = Spec::new(SpecKind::ConstraintStep, &step.file_path, &step.description);
            spec.success_criteria = step.success_criteria.clone();
            spec.old_code = step.old_code.clone();
            spec.new_code = step.new_code.clone();
            spec.content = step.content.clone();
            spec.verification_pages = report.verification_pages.clone();
            spec.constraint_id = Some(record.id.clone());

            let queue = if self.policy.is_safe(&step.file_path) {
                Queue::Approved
            } else {
                Queue::Pending
            };
            self.runner.store.enqueue(&spec, queue)?;
            if queue == Queue::Approved {
                step_ids.push(spec.id.clone());
            }
        }

        self.decisions.record(
            "constraint-planned",
            json!({
                "id": record.id,
                "description": report.limiting_factor.description,
                "steps": report.plan.len(),
                "autoApproved": step_ids.len(),
            }),
        )?;

        // Execute the auto-approved steps now; pending ones wait for the
        // owner and get picked up by a later heartbeat.
        for id in &step_ids {
            if budget.exhausted() {
                break;
            }
            let spec = self.runner.store.load(Queue::Approved, id)?;
            match self.runner.run(&spec, budget).await? {
                RunEnd::Deferred(reason) => {
                    tracing::info!(spec = %id, reason, "Step deferred");
                    break;
                }
                RunEnd::Terminal(_) => {}
            }
        }

        let verdict = self.evaluate(&record, budget).await?;
        let record_id = record.id.clone();
        let mut log = ElonLog::load(self.paths);
        match verdict {
            Verdict::Resolved => {
                log.current = None;
                let mut record = record;
                record.resolved_at = Some(Utc::now().to_rfc3339());
                log.solved.push(record.clone());
                self.decisions
                    .record("constraint-resolved", json!({"id": record.id}))?;
            }
            Verdict::Active => {
                log.current = None;
                log.failed_history.push(FailedEntry {
                    constraint_id: record.id.clone(),
                    description: record.report.limiting_factor.description.clone(),
                    reason: "evaluation returned active".into(),
                    touched_files: record
                        .report
                        .plan
                        .iter()
                        .map(|s| s.file_path.clone())
                        .collect(),
                    at: Utc::now().to_rfc3339(),
                });
                self.decisions
                    .record("constraint-still-active", json!({"id": record.id}))?;
            }
            // Steps still waiting on owner approval: the constraint stays
            // current and a later run re-evaluates it.
            Verdict::InProgress => {}
        }
        log.save(self.paths)?;

        Ok(CycleOutcome::Finished {
            constraint_id: record_id,
            resolved: verdict == Verdict::Resolved,
        })
    }

    /// Evaluate a constraint: tally step outcomes, re-crawl, ask the
    /// evaluator (lower tier) for a verdict.
    async fn evaluate(
        &self,
        record: &ConstraintRecord,
        budget: &mut BudgetLedger,
    ) -> Result<Verdict> {
        let outcomes = self
            .runner
            .store
            .outcomes_for_constraint(&record.id);
        let completed = outcomes.iter().filter(|o| o.status.is_success()).count();
        let failed = outcomes.len() - completed;
        let planned = record.report.plan.len();

        // Steps still waiting in a queue mean the constraint is in
        // progress; no point burning an evaluator call yet.
        if outcomes.len() < planned {
            tracing::info!(
                constraint = %record.id,
                completed, failed, planned,
                "Constraint still in progress"
            );
            return Ok(Verdict::InProgress);
        }

        let targeted = probes::probe_pages(
            &self.app_url,
            &record.report.verification_pages,
            Duration::from_secs(10),
        )
        .await;
        let full = self.observe(&[]).await;

        let payload = json!({
            "completionCriteria": record.report.completion_criteria,
            "stepsCompleted": completed,
            "stepsFailed": failed,
            "targetedCrawl": targeted,
            "fullCrawl": full.crawl,
        });

        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::ElonEvaluator,
                    payload,
                },
                budget,
                "",
                None,
                false,
            )
            .await?;

        let resolved = match outcome {
            DispatchOutcome::Completed {
                parsed: Parsed::Object(value),
                ..
            } => value.get("status").and_then(|v| v.as_str()) == Some("resolved"),
            _ => false,
        };
        Ok(if resolved {
            Verdict::Resolved
        } else {
            Verdict::Active
        })
    }

    /// Full run: up to `max_constraints_per_run` cycles, its own dollar
    /// budget, a consecutive-dismissal stop, and a pause between cycles.
    pub async fn run(&self) -> Result<ElonSummary> {
        let mut budget = BudgetLedger::new(self.elon.budget, self.elon.budget * 0.8);
        let mut summary = ElonSummary::default();
        let mut dismissals = 0u32;

        for _ in 0..self.elon.max_constraints_per_run {
            if budget.exhausted() {
                summary.halted = Some("budget-exceeded".into());
                break;
            }

            let bundle = self.observe(&[]).await;
            summary.cycles += 1;

            match self.cycle(&bundle, &mut budget).await? {
                CycleOutcome::NoConstraint => {
                    tracing::info!("Solver run finished: no-constraints-found");
                    break;
                }
                CycleOutcome::Dismissed(reason) => {
                    summary.dismissed += 1;
                    dismissals += 1;
                    tracing::info!(reason, dismissals, "Constraint dismissed");
                    if dismissals >= self.elon.max_consecutive_dismissals {
                        break;
                    }
                }
                CycleOutcome::Finished { resolved, .. } => {
                    dismissals = 0;
                    if resolved {
                        summary.solved += 1;
                    }
                }
                CycleOutcome::Halted(reason) => {
                    summary.halted = Some(reason);
                    break;
                }
            }

            tokio::time::sleep(Duration::from_secs(self.elon.cycle_pause_secs)).await;
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::PageResult;

    fn page(url: &str, status: u16) -> PageResult {
        PageResult {
            url: url.into(),
            status,
            console_errors: vec![],
            load_ms: 10,
            blank_page: false,
        }
    }

    #[test]
    fn test_prefilter_drops_auth_on_api() {
        let report = CrawlReport {
            pages: vec![
                page("http://localhost:5000/api/users", 401),
                page("http://localhost:5000/api/admin", 403),
                page("http://localhost:5000/about", 500),
                page("http://localhost:5000/api/public", 200),
            ],
        };
        let filtered = prefilter_crawl(&report);
        assert_eq!(filtered.pages.len(), 2);
        assert!(filtered.pages.iter().all(|p| !matches!(p.status, 401 | 403)));
    }

    #[test]
    fn test_prefilter_keeps_auth_outside_api() {
        let report = CrawlReport {
            pages: vec![page("http://localhost:5000/profile", 403)],
        };
        assert_eq!(prefilter_crawl(&report).pages.len(), 1);
    }

    #[test]
    fn test_auth_framed_dismissed() {
        let factor = LimitingFactor {
            description: "Authentication is broken: API returns 401".into(),
            why: "all api endpoints reject requests".into(),
            unblocks: vec![],
            score: 9,
            category: "auth".into(),
            evidence: vec![],
        };
        assert!(is_auth_framed(&factor));

        let genuine = LimitingFactor {
            description: "Checkout page renders a blank screen".into(),
            why: "template crash on missing cart".into(),
            unblocks: vec![],
            score: 8,
            category: "frontend".into(),
            evidence: vec![],
        };
        assert!(!is_auth_framed(&genuine));
    }

    #[test]
    fn test_duplicate_detection() {
        let mut log = ElonLog::default();
        log.blocked_constraints
            .push("The checkout page crashes when the cart is empty".into());
        assert!(is_duplicate(
            "checkout page crashes when cart is empty",
            &log
        ));
        assert!(!is_duplicate("search results load slowly", &log));
    }

    #[test]
    fn test_elon_log_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_layout().unwrap();

        let mut log = ElonLog::default();
        log.blocked_constraints.push("stuck thing".into());
        log.failed_history.push(FailedEntry {
            constraint_id: "c1".into(),
            description: "d".into(),
            reason: "r".into(),
            touched_files: vec!["routes/a.js".into()],
            at: Utc::now().to_rfc3339(),
        });
        log.save(&paths).unwrap();

        let loaded = ElonLog::load(&paths);
        assert_eq!(loaded.blocked_constraints.len(), 1);
        assert_eq!(loaded.failed_history.len(), 1);
    }

    #[test]
    fn test_report_shape_strictness() {
        // Missing limitingFactor must fail deserialization.
        let bad = json!({"currentGoal": "g", "plan": []});
        assert!(serde_json::from_value::<ConstraintReport>(bad).is_err());

        let good = json!({
            "currentGoal": "grow signups",
            "limitingFactor": {
                "description": "broken signup form",
                "why": "submit handler throws",
                "unblocks": ["signups"],
                "score": 9,
                "category": "frontend",
                "evidence": ["POST /signup returns 500"]
            },
            "plan": [{"filePath": "routes/signup.js", "description": "fix handler"}],
            "verificationPages": ["/signup"],
            "completionCriteria": "signup succeeds"
        });
        let report: ConstraintReport = serde_json::from_value(good).unwrap();
        assert_eq!(report.limiting_factor.score, 9);
        assert_eq!(report.plan.len(), 1);
    }

    #[test]
    fn test_source_index_skips_dependency_stores() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("routes")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/lib")).unwrap();
        std::fs::write(dir.path().join("routes/a.js"), "x").unwrap();
        std::fs::write(dir.path().join("node_modules/lib/b.js"), "y").unwrap();

        let index = refresh_source_index(dir.path());
        assert_eq!(index, vec!["routes/a.js".to_string()]);
    }

    #[test]
    fn test_code_excerpts_prioritise_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hot.js"), "priority content").unwrap();
        std::fs::write(dir.path().join("other.js"), "x".repeat(30_000)).unwrap();

        let excerpts = gather_code_excerpts(
            dir.path(),
            &["hot.js".into()],
            &["other.js".into()],
        );
        assert!(excerpts.starts_with("// ==== hot.js ===="));
        assert!(excerpts.chars().count() <= CODE_EXCERPT_MAX_CHARS + 100);
    }
}
