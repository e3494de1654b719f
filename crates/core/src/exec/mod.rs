pub mod window;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use crate::blockers::BlockerStore;
use crate::budget::BudgetLedger;
use crate::decisions::DecisionLog;
use crate::dispatch::{DispatchOutcome, Dispatcher, Parsed, SubagentKind, SubagentTask};
use crate::engine::{runtime, CodeEngine, EngineError, FileOp};
use crate::shell;
use crate::spec::{ExecStatus, IterationRecord, Spec, SpecAction};
use crate::store::SpecStore;

const MAX_ITERATIONS: u32 = 10;
const MAX_CONSECUTIVE_STUCK: u32 = 3;
const MAX_PREVIOUS_ATTEMPTS: usize = 3;

/// How one run ended: a terminal status (the spec was moved), or deferred
/// back to its queue for a later cycle (budget or vendor trouble).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Terminal(ExecStatus),
    Deferred(String),
}

pub struct ExecConfig {
    pub project_root: PathBuf,
    pub app_url: String,
    pub shell_timeout: Duration,
    pub health_timeout: Duration,
    /// Poll the host health endpoint after each applied change set.
    pub verify_runtime: bool,
}

/// Drives a single spec toward completion via at most ten iterations of
/// edit, verify, rollback.
pub struct SpecRunner<'a> {
    pub engine: &'a CodeEngine,
    pub dispatcher: &'a Dispatcher,
    pub store: &'a SpecStore,
    pub blockers: &'a BlockerStore,
    pub decisions: &'a DecisionLog,
    pub config: &'a ExecConfig,
}

impl<'a> SpecRunner<'a> {
    pub async fn run(&self, spec: &Spec, budget: &mut BudgetLedger) -> Result<RunEnd> {
        let mut iterations: Vec<IterationRecord> = vec![];
        let mut consecutive_stuck = 0u32;
        let mut last_failure: Option<ExecStatus> = None;

        for iteration in 1..=MAX_ITERATIONS {
            let payload = self.build_payload(spec, &iterations, consecutive_stuck)?;
            let task = SubagentTask {
                kind: SubagentKind::SpecExecutor,
                payload,
            };
            let memory_tail = self.decisions.memory_tail(crate::dispatch::prompt::MEMORY_TAIL_MAX);
            let outcome = self
                .dispatcher
                .dispatch(&task, budget, &memory_tail, None, false)
                .await?;

            let parsed = match outcome {
                DispatchOutcome::Skipped { reason } => return Ok(RunEnd::Deferred(reason)),
                DispatchOutcome::Failed { kind, message } => {
                    tracing::warn!(spec = %spec.id, kind, message, "Executor call failed, deferring spec");
                    return Ok(RunEnd::Deferred(kind));
                }
                DispatchOutcome::DryRun { .. } => return Ok(RunEnd::Deferred("dry-run".into())),
                DispatchOutcome::Completed { parsed, .. } => parsed,
            };

            match self.interpret(spec, parsed, iteration, &mut iterations).await? {
                StepVerdict::Done => {
                    return self.finish(spec, ExecStatus::Completed, iterations).await;
                }
                StepVerdict::Applied => {
                    consecutive_stuck = 0;
                    last_failure = None;
                }
                StepVerdict::FailedIteration(hint) => {
                    consecutive_stuck = 0;
                    last_failure = hint;
                }
                StepVerdict::Stuck => {
                    consecutive_stuck += 1;
                    if consecutive_stuck >= MAX_CONSECUTIVE_STUCK {
                        return self.finish(spec, ExecStatus::Stuck, iterations).await;
                    }
                }
            }
        }

        let status = last_failure.unwrap_or(ExecStatus::MaxIterations);
        self.finish(spec, status, iterations).await
    }

    fn build_payload(
        &self,
        spec: &Spec,
        iterations: &[IterationRecord],
        consecutive_stuck: u32,
    ) -> Result<Value> {
        let target = self.config.project_root.join(&spec.file_path);
        let spec_text = format!("{} {}", spec.description, spec.success_criteria.join(" "));

        let current_code = if target.is_file() {
            let content = std::fs::read_to_string(&target)?;
            window::focus_window(&content, &spec_text)
        } else {
            String::new()
        };

        let related = window::related_context(
            &self.config.project_root,
            &spec.file_path,
            &current_code,
            &spec.related_files,
        );

        let previous: Vec<Value> = iterations
            .iter()
            .rev()
            .take(MAX_PREVIOUS_ATTEMPTS)
            .map(|record| {
                json!({
                    "iteration": record.iteration,
                    "action": record.action,
                    "ok": record.ok,
                    "detail": record.detail,
                })
            })
            .collect();

        let retry_guidance = if consecutive_stuck > 0 || iterations.iter().any(|i| !i.ok) {
            Some(
                "Previous attempts did not land. Take a different approach: \
                 re-read the current code carefully and keep the change minimal.",
            )
        } else {
            None
        };

        Ok(json!({
            "spec": spec,
            "currentCode": current_code,
            "relatedContext": related,
            "previousAttempts": previous,
            "retryGuidance": retry_guidance,
        }))
    }

    async fn interpret(
        &self,
        spec: &Spec,
        parsed: Parsed,
        iteration: u32,
        iterations: &mut Vec<IterationRecord>,
    ) -> Result<StepVerdict> {
        match parsed {
            Parsed::Complete => {
                iterations.push(IterationRecord {
                    iteration,
                    action: "complete".into(),
                    ok: true,
                    detail: "executor reported spec satisfied".into(),
                    backup_ids: vec![],
                });
                Ok(StepVerdict::Done)
            }
            Parsed::Queue { reason, .. } => {
                let verdict = if reason.starts_with("validation-failed") {
                    iterations.push(IterationRecord {
                        iteration,
                        action: "rejected".into(),
                        ok: false,
                        detail: reason,
                        backup_ids: vec![],
                    });
                    StepVerdict::FailedIteration(Some(ExecStatus::ValidationFailed))
                } else {
                    iterations.push(IterationRecord {
                        iteration,
                        action: "stuck".into(),
                        ok: false,
                        detail: reason,
                        backup_ids: vec![],
                    });
                    StepVerdict::Stuck
                };
                Ok(verdict)
            }
            Parsed::Object(value) => self.apply_object(spec, value, iteration, iterations).await,
        }
    }

    async fn apply_object(
        &self,
        spec: &Spec,
        value: Value,
        iteration: u32,
        iterations: &mut Vec<IterationRecord>,
    ) -> Result<StepVerdict> {
        let status = value.get("status").and_then(|v| v.as_str()).unwrap_or("");

        let ops = match status {
            "complete" => {
                iterations.push(IterationRecord {
                    iteration,
                    action: "complete".into(),
                    ok: true,
                    detail: "executor reported spec satisfied".into(),
                    backup_ids: vec![],
                });
                return Ok(StepVerdict::Done);
            }
            "stuck" => {
                let reason = value
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unspecified");
                iterations.push(IterationRecord {
                    iteration,
                    action: "stuck".into(),
                    ok: false,
                    detail: reason.to_string(),
                    backup_ids: vec![],
                });
                return Ok(StepVerdict::Stuck);
            }
            "change" | "append" => match self.single_change_op(spec, &value, status) {
                Some(op) => vec![op],
                None => {
                    iterations.push(IterationRecord {
                        iteration,
                        action: "stuck".into(),
                        ok: false,
                        detail: "change response missing fields".into(),
                        backup_ids: vec![],
                    });
                    return Ok(StepVerdict::Stuck);
                }
            },
            "multi-change" => collect_changes(&value),
            "create" => match single_create_op(spec, &value) {
                Some(op) => vec![op],
                None => {
                    iterations.push(IterationRecord {
                        iteration,
                        action: "stuck".into(),
                        ok: false,
                        detail: "create response missing content".into(),
                        backup_ids: vec![],
                    });
                    return Ok(StepVerdict::Stuck);
                }
            },
            "multi-create" => collect_creates(&value),
            _ => {
                iterations.push(IterationRecord {
                    iteration,
                    action: "stuck".into(),
                    ok: false,
                    detail: format!("unrecognised response status: {status}"),
                    backup_ids: vec![],
                });
                return Ok(StepVerdict::Stuck);
            }
        };

        if ops.is_empty() {
            iterations.push(IterationRecord {
                iteration,
                action: "stuck".into(),
                ok: false,
                detail: "response carried no applicable operations".into(),
                backup_ids: vec![],
            });
            return Ok(StepVerdict::Stuck);
        }

        // Atomic apply with per-file syntax verification.
        let receipt = match self.engine.apply_transaction(&ops) {
            Ok(receipt) => receipt,
            Err(e) => {
                let status = match &e {
                    EngineError::Syntax { .. } => "syntax-failed",
                    EngineError::Safety(_) => "validation-failed",
                    _ => "apply-failed",
                };
                iterations.push(IterationRecord {
                    iteration,
                    action: status.into(),
                    ok: false,
                    detail: e.to_string(),
                    backup_ids: vec![],
                });
                let verdict = if matches!(e, EngineError::Safety(_)) {
                    StepVerdict::FailedIteration(Some(ExecStatus::ValidationFailed))
                } else {
                    StepVerdict::FailedIteration(None)
                };
                return Ok(verdict);
            }
        };

        // Spec-provided test command.
        if let Some(test_command) = &spec.test_command {
            let output = shell::run_whitelisted(
                test_command,
                &self.config.project_root,
                self.config.shell_timeout,
            )
            .await;
            let failed = match output {
                Ok(out) => !out.success(),
                Err(_) => true,
            };
            if failed {
                self.engine.rollback(&receipt.records)?;
                iterations.push(IterationRecord {
                    iteration,
                    action: "test-failed".into(),
                    ok: false,
                    detail: format!("test command failed: {test_command}"),
                    backup_ids: receipt.backup_ids(),
                });
                return Ok(StepVerdict::FailedIteration(Some(ExecStatus::TestFailed)));
            }
        }

        // Runtime probe.
        if self.config.verify_runtime {
            let verdict =
                runtime::verify_running(&self.config.app_url, self.config.health_timeout).await;
            if verdict != runtime::RuntimeVerdict::Healthy {
                self.engine.rollback(&receipt.records)?;
                iterations.push(IterationRecord {
                    iteration,
                    action: "runtime-failed".into(),
                    ok: false,
                    detail: format!("{verdict:?}"),
                    backup_ids: receipt.backup_ids(),
                });
                return Ok(StepVerdict::FailedIteration(Some(ExecStatus::RuntimeFailed)));
            }
        }

        iterations.push(IterationRecord {
            iteration,
            action: status.into(),
            ok: true,
            detail: format!("applied {} file(s)", receipt.files.len()),
            backup_ids: receipt.backup_ids(),
        });
        Ok(StepVerdict::Applied)
    }

    fn single_change_op(&self, spec: &Spec, value: &Value, status: &str) -> Option<FileOp> {
        let file_path = value
            .get("filePath")
            .and_then(|v| v.as_str())
            .unwrap_or(&spec.file_path)
            .to_string();

        if status == "append" || spec.action == Some(SpecAction::Append) {
            let content = value
                .get("content")
                .and_then(|v| v.as_str())
                .or(spec.content.as_deref())?
                .to_string();
            return Some(FileOp::Append { file_path, content });
        }

        let old_code = value.get("oldCode").and_then(|v| v.as_str())?.to_string();
        let new_code = value.get("newCode").and_then(|v| v.as_str())?.to_string();
        Some(FileOp::Change {
            file_path,
            old_code,
            new_code,
        })
    }

    async fn finish(
        &self,
        spec: &Spec,
        status: ExecStatus,
        iterations: Vec<IterationRecord>,
    ) -> Result<RunEnd> {
        let attempts = iterations.len() as u32;
        self.store.finalize(spec, status, iterations)?;
        self.decisions.record(
            "spec-finished",
            json!({"id": spec.id, "status": status.to_string(), "attempts": attempts}),
        )?;

        if !status.is_success() {
            self.blockers.raise(
                &spec.id,
                &spec.file_path,
                &status.to_string(),
                attempts,
                None,
            )?;
        }

        tracing::info!(spec = %spec.id, %status, attempts, "Spec run finished");
        Ok(RunEnd::Terminal(status))
    }
}

enum StepVerdict {
    Done,
    Applied,
    /// The iteration failed and was rolled back. The optional status is a
    /// hint for the terminal state if the loop exhausts its iterations.
    FailedIteration(Option<ExecStatus>),
    Stuck,
}

fn collect_changes(value: &Value) -> Vec<FileOp> {
    value
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
        .unwrap_or_default()
}

fn collect_creates(value: &Value) -> Vec<FileOp> {
    value
        .get("files")
        .and_then(|v| v.as_array())
        .map(|files| {
            files
                .iter()
                .filter_map(|f| {
                    Some(FileOp::Create {
                        file_path: f.get("filePath")?.as_str()?.to_string(),
                        content: f.get("content")?.as_str()?.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn single_create_op(spec: &Spec, value: &Value) -> Option<FileOp> {
    let file_path = value
        .get("filePath")
        .and_then(|v| v.as_str())
        .unwrap_or(&spec.file_path)
        .to_string();
    let content = value
        .get("content")
        .and_then(|v| v.as_str())
        .or(spec.content.as_deref())?
        .to_string();
    Some(FileOp::Create { file_path, content })
}
