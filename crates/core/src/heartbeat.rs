//! Periodic monitoring pipeline. The step order is fixed and never
//! reordered: identity first, cheap local work next, LLM work last.

use std::time::Duration;

use anyhow::Result;
use chrono::{Datelike, Utc};
use rand::Rng;
use serde_json::json;

use sneebly_safety::{IdentityGuard, PathPolicy};

use crate::budget::BudgetLedger;
use crate::decisions::DecisionLog;
use crate::dev_mode;
use crate::dispatch::{DispatchOutcome, Parsed, SubagentKind, SubagentTask};
use crate::exec::{RunEnd, SpecRunner};
use crate::metrics::MetricsStore;
use crate::paths::DataPaths;
use crate::probes;
use crate::registry::KnownErrorRegistry;
use crate::spec::{Spec, SpecKind};
use crate::store::Queue;

#[derive(Debug, Default)]
pub struct TickReport {
    pub identity_ok: bool,
    pub host_up: bool,
    pub errors_drained: usize,
    pub errors_triaged: usize,
    pub specs_run: usize,
    pub steps_skipped_for_budget: bool,
}

pub struct Heartbeat<'a> {
    pub runner: &'a SpecRunner<'a>,
    pub identity: &'a IdentityGuard,
    pub registry: &'a KnownErrorRegistry,
    pub metrics: &'a MetricsStore,
    pub decisions: &'a DecisionLog,
    pub policy: &'a PathPolicy,
    pub paths: &'a DataPaths,
    pub app_url: String,
    pub config: sneebly_config::HeartbeatConfig,
    /// Disabled in tests; otherwise 3-5 s after every subagent call.
    pub rate_pause: bool,
}

impl<'a> Heartbeat<'a> {
    async fn pause(&self) {
        if self.rate_pause {
            let ms = rand::rng().random_range(3000..5000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn memory_tail(&self) -> String {
        self.decisions
            .memory_tail(crate::dispatch::prompt::MEMORY_TAIL_MAX)
    }

    /// One tick of the monitoring pipeline.
    pub async fn tick(&self, budget: &mut BudgetLedger) -> Result<TickReport> {
        let mut report = TickReport::default();

        // 1. Identity checksums. A mismatch halts everything autonomous.
        let identity = self.identity.verify()?;
        if !identity.valid {
            self.decisions.record_security(json!({
                "event": "identity-mismatch",
                "changes": identity.changes.iter().map(|c| c.file.clone()).collect::<Vec<_>>(),
            }))?;
            tracing::error!("Identity mismatch: heartbeat aborted");
            return Ok(report);
        }
        report.identity_ok = true;

        // 2. Fold the host error log into the registry.
        report.errors_drained = self.registry.drain_error_log()?;

        // 3. The system prompt (identity + memory) is assembled per call by
        //    the dispatcher; refresh the memory tail once for this tick.
        let memory_tail = self.memory_tail();

        // 4. Host health. Down means triage and nothing else.
        report.host_up = probes::health_check(&self.app_url, Duration::from_secs(5)).await;
        if !report.host_up {
            self.triage_host_down(budget, &memory_tail).await?;
            return Ok(report);
        }

        // 5. Optional crawl pass; new failures feed the registry.
        if self.config.crawl_enabled {
            let crawl =
                probes::probe_pages(&self.app_url, &["/".into()], Duration::from_secs(10)).await;
            for page in crawl.error_pages() {
                self.registry
                    .record(&format!("crawl: {} returned {}", page.url, page.status))?;
            }
        }

        if dev_mode::load(self.paths).enabled {
            tracing::info!("Dev mode enabled: skipping autonomous mutation steps");
            return Ok(report);
        }

        // 6. Error triage, bounded per tick.
        report.errors_triaged = self.triage_errors(budget, &memory_tail).await?;

        // 7. Performance analysis over recent snapshots.
        if !budget.exhausted() {
            self.analyse_performance(budget, &memory_tail).await?;
        }

        // 8. Codebase discovery, interval-gated.
        if !budget.exhausted() && self.stamp_due("discovery", self.config.discovery_interval_hours)
        {
            self.discover(budget, &memory_tail).await?;
            self.touch_stamp("discovery")?;
        }

        // 9. Drain the approved queue through the execution loop.
        report.specs_run = self.drain_approved(budget).await?;

        // 10. Weekly jobs.
        let today = weekday_name(Utc::now().weekday());
        if !budget.exhausted()
            && today == self.config.deep_analysis_day
            && self.stamp_due("deep-analysis", 24 * 6)
        {
            self.discover(budget, &memory_tail).await?;
            self.touch_stamp("deep-analysis")?;
        }
        if !budget.exhausted()
            && today == self.config.self_improve_day
            && self.stamp_due("self-improve", 24 * 6)
        {
            self.self_improve(budget, &memory_tail).await?;
            self.touch_stamp("self-improve")?;
        }

        report.steps_skipped_for_budget = budget.exhausted();
        Ok(report)
    }

    async fn triage_host_down(
        &self,
        budget: &mut BudgetLedger,
        memory_tail: &str,
    ) -> Result<()> {
        tracing::warn!("Host down; running error triage only");
        let recent: Vec<_> = self
            .registry
            .unresolved()?
            .into_iter()
            .take(self.config.triage_batch)
            .collect();
        let wrapped: Vec<String> = recent
            .iter()
            .map(|e| sneebly_safety::sanitize_external("error-registry", &e.message).text)
            .collect();

        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::ErrorResolver,
                    payload: json!({"hostDown": true, "recentErrors": wrapped}),
                },
                budget,
                memory_tail,
                None,
                false,
            )
            .await?;
        self.pause().await;

        if let DispatchOutcome::Completed { parsed, .. } = outcome {
            self.enqueue_from_response(parsed, SpecKind::Fix)?;
        }
        Ok(())
    }

    async fn triage_errors(
        &self,
        budget: &mut BudgetLedger,
        memory_tail: &str,
    ) -> Result<usize> {
        let unresolved = self.registry.unresolved()?;
        let mut triaged = 0;

        for error in unresolved.into_iter().take(self.config.triage_batch) {
            if budget.exhausted() {
                break;
            }
            let wrapped = sneebly_safety::sanitize_external("error-registry", &error.message);
            let outcome = self
                .runner
                .dispatcher
                .dispatch(
                    &SubagentTask {
                        kind: SubagentKind::ErrorResolver,
                        payload: json!({
                            "signature": error.signature,
                            "message": wrapped.text,
                            "occurrences": error.occurrences,
                            "firstSeen": error.first_seen,
                            "lastSeen": error.last_seen,
                        }),
                    },
                    budget,
                    memory_tail,
                    None,
                    false,
                )
                .await?;
            self.pause().await;

            if let DispatchOutcome::Completed { parsed, .. } = outcome {
                if let Some(spec_id) = self.enqueue_from_response(parsed, SpecKind::Fix)? {
                    self.registry.mark_resolved(&error.signature, &spec_id)?;
                    triaged += 1;
                }
            }
        }
        Ok(triaged)
    }

    async fn analyse_performance(
        &self,
        budget: &mut BudgetLedger,
        memory_tail: &str,
    ) -> Result<()> {
        let Some(factor) = self.metrics.degradation(20) else {
            return Ok(());
        };
        tracing::info!(factor, "Performance degradation detected");

        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::PerfOptimizer,
                    payload: json!({
                        "degradationFactor": factor,
                        "snapshots": self.metrics.recent(20),
                    }),
                },
                budget,
                memory_tail,
                None,
                false,
            )
            .await?;
        self.pause().await;

        if let DispatchOutcome::Completed { parsed, .. } = outcome {
            self.enqueue_from_response(parsed, SpecKind::Optimize)?;
        }
        Ok(())
    }

    async fn discover(&self, budget: &mut BudgetLedger, memory_tail: &str) -> Result<()> {
        let index = crate::elon::refresh_source_index(&self.runner.config.project_root);
        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::CodebaseIntel,
                    payload: json!({"sourceFiles": index}),
                },
                budget,
                memory_tail,
                None,
                false,
            )
            .await?;
        self.pause().await;

        if let DispatchOutcome::Completed {
            parsed: Parsed::Object(value),
            ..
        } = outcome
        {
            if let Some(findings) = value.get("findings").and_then(|v| v.as_array()) {
                for finding in findings {
                    self.enqueue_from_response(
                        Parsed::Object(finding.clone()),
                        SpecKind::IntelFinding,
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn self_improve(&self, budget: &mut BudgetLedger, memory_tail: &str) -> Result<()> {
        let blockers = crate::blockers::BlockerStore::new(self.paths).active();
        let outcome = self
            .runner
            .dispatcher
            .dispatch(
                &SubagentTask {
                    kind: SubagentKind::SelfImprover,
                    payload: json!({"activeBlockers": blockers}),
                },
                budget,
                memory_tail,
                None,
                false,
            )
            .await?;
        self.pause().await;

        if let DispatchOutcome::Completed {
            parsed: Parsed::Object(value),
            ..
        } = outcome
        {
            self.decisions.record("self-improvement", value)?;
        }
        Ok(())
    }

    async fn drain_approved(&self, budget: &mut BudgetLedger) -> Result<usize> {
        let mut run = 0;
        for spec in self.runner.store.list(Queue::Approved) {
            if budget.exhausted() {
                break;
            }
            match self.runner.run(&spec, budget).await? {
                RunEnd::Terminal(_) => run += 1,
                RunEnd::Deferred(reason) => {
                    tracing::info!(spec = %spec.id, reason, "Queue drain stopped");
                    break;
                }
            }
            self.pause().await;
        }
        Ok(run)
    }

    /// Turn an actionable executor/resolver reply into a queued spec.
    /// Returns the spec id if one was written.
    fn enqueue_from_response(
        &self,
        parsed: Parsed,
        kind: SpecKind,
    ) -> Result<Option<String>> {
        let Parsed::Object(value) = parsed else {
            return Ok(None);
        };
        let Some(file_path) = value.get("filePath").and_then(|v| v.as_str()) else {
            return Ok(None);
        };
        let description = value
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("proposed improvement");

        let mut spec = Spec::new(kind, file_path, description);
        if let Some(criteria) = value.get("successCriteria").and_then(|v| v.as_array()) {
            spec.success_criteria = criteria
                .iter()
                .filter_map(|c| c.as_str().map(String::from))
                .collect();
        }
        spec.old_code = value
            .get("oldCode")
            .and_then(|v| v.as_str())
            .map(String::from);
        spec.new_code = value
            .get("newCode")
            .and_then(|v| v.as_str())
            .map(String::from);
        spec.content = value
            .get("content")
            .and_then(|v| v.as_str())
            .map(String::from);

        let queue = if self.policy.is_safe(file_path) {
            Queue::Approved
        } else {
            Queue::Pending
        };
        let id = spec.id.clone();
        self.runner.store.enqueue(&spec, queue)?;
        self.decisions.record(
            "spec-queued",
            json!({"id": id, "filePath": file_path, "queue": format!("{queue:?}")}),
        )?;
        Ok(Some(id))
    }

    fn stamp_path(&self, name: &str) -> std::path::PathBuf {
        self.paths.root().join(format!(".{name}-stamp"))
    }

    fn stamp_due(&self, name: &str, interval_hours: u64) -> bool {
        let path = self.stamp_path(name);
        match std::fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(modified) => match modified.elapsed() {
                Ok(elapsed) => elapsed.as_secs() >= interval_hours * 3600,
                Err(_) => true,
            },
            Err(_) => true,
        }
    }

    fn touch_stamp(&self, name: &str) -> Result<()> {
        std::fs::write(self.stamp_path(name), Utc::now().to_rfc3339())?;
        Ok(())
    }
}

fn weekday_name(day: chrono::Weekday) -> &'static str {
    match day {
        chrono::Weekday::Mon => "monday",
        chrono::Weekday::Tue => "tuesday",
        chrono::Weekday::Wed => "wednesday",
        chrono::Weekday::Thu => "thursday",
        chrono::Weekday::Fri => "friday",
        chrono::Weekday::Sat => "saturday",
        chrono::Weekday::Sun => "sunday",
    }
}
