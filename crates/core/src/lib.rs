//! Autonomous code-improvement core: a closed control loop that observes a
//! host web service, plans constrained changes through LLM subagents, and
//! drives each change through an edit, verify, rollback micro-loop.

pub mod blockers;
pub mod budget;
pub mod decisions;
pub mod dev_mode;
pub mod dispatch;
pub mod elon;
pub mod engine;
pub mod exec;
pub mod heartbeat;
pub mod metrics;
pub mod paths;
pub mod planner;
pub mod probes;
pub mod registry;
pub mod regression;
pub mod shell;
pub mod spec;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use sneebly_config::Config;
use sneebly_provider::Provider;
use sneebly_safety::{IdentityGuard, PathPolicy};

use crate::budget::BudgetLedger;
use crate::paths::DataPaths;

/// The single handle threaded through every component. Process-wide state
/// is restricted to this, the lock file registry on disk, and the data
/// directory itself.
pub struct Engine {
    pub config: Config,
    pub project_root: PathBuf,
    pub paths: DataPaths,
    pub provider: Arc<dyn Provider>,
    pub policy: PathPolicy,
    pub identity: IdentityGuard,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(project_root: &Path, config: Config, provider: Arc<dyn Provider>) -> Self {
        let data_dir = sneebly_config::data_dir(project_root);
        let paths = DataPaths::new(&data_dir);
        let policy = PathPolicy::new(&config.paths.safe, &config.paths.protected);
        let identity = IdentityGuard::new(&identity_dir(project_root), &data_dir);

        Self {
            config,
            project_root: project_root.to_path_buf(),
            paths,
            provider,
            policy,
            identity,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// First-run setup: state directory layout and the identity baseline.
    pub fn initialize(&self) -> Result<()> {
        self.paths.ensure_layout()?;
        self.identity.initialize()?;
        Ok(())
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn dispatcher(&self) -> dispatch::Dispatcher {
        dispatch::Dispatcher::new(
            self.provider.clone(),
            identity_dir(&self.project_root),
            self.config.parser.completion_patterns.clone(),
        )
    }

    fn exec_config(&self) -> exec::ExecConfig {
        exec::ExecConfig {
            project_root: self.project_root.clone(),
            app_url: self.config.app.url.clone(),
            shell_timeout: Duration::from_secs(self.config.runtime.shell_timeout_secs),
            health_timeout: Duration::from_secs(self.config.runtime.health_timeout_secs),
            verify_runtime: true,
        }
    }

    fn cycle_budget(&self) -> BudgetLedger {
        BudgetLedger::new(
            self.config.budget.max_per_cycle,
            self.config.budget.warning,
        )
    }

    /// One heartbeat tick with a fresh per-cycle budget.
    pub async fn heartbeat_tick(&self) -> Result<heartbeat::TickReport> {
        let dispatcher = self.dispatcher();
        let engine = engine::CodeEngine::new(&self.project_root, &self.paths);
        let store = store::SpecStore::new(&self.paths);
        let blockers = blockers::BlockerStore::new(&self.paths);
        let decisions = decisions::DecisionLog::new(&self.paths);
        let registry = registry::KnownErrorRegistry::new(&self.paths);
        let metrics = metrics::MetricsStore::new(&self.paths);
        let exec_config = self.exec_config();

        let runner = exec::SpecRunner {
            engine: &engine,
            dispatcher: &dispatcher,
            store: &store,
            blockers: &blockers,
            decisions: &decisions,
            config: &exec_config,
        };
        let hb = heartbeat::Heartbeat {
            runner: &runner,
            identity: &self.identity,
            registry: &registry,
            metrics: &metrics,
            decisions: &decisions,
            policy: &self.policy,
            paths: &self.paths,
            app_url: self.config.app.url.clone(),
            config: self.config.heartbeat.clone(),
            rate_pause: true,
        };

        let mut budget = self.cycle_budget();
        hb.tick(&mut budget).await
    }

    /// One constraint-solver run with its own dollar budget.
    pub async fn elon_run(&self) -> Result<elon::ElonSummary> {
        let dispatcher = self.dispatcher();
        let engine = engine::CodeEngine::new(&self.project_root, &self.paths);
        let store = store::SpecStore::new(&self.paths);
        let blockers = blockers::BlockerStore::new(&self.paths);
        let decisions = decisions::DecisionLog::new(&self.paths);
        let exec_config = self.exec_config();

        let runner = exec::SpecRunner {
            engine: &engine,
            dispatcher: &dispatcher,
            store: &store,
            blockers: &blockers,
            decisions: &decisions,
            config: &exec_config,
        };
        let solver = elon::ElonSolver {
            runner: &runner,
            policy: &self.policy,
            paths: &self.paths,
            decisions: &decisions,
            app_url: self.config.app.url.clone(),
            elon: self.config.elon.clone(),
        };

        solver.run().await
    }

    /// Planner/builder dual: used when the goals declare discrete roadmap
    /// milestones instead of a constraint to hunt. Plans a step graph,
    /// executes dependency-ready steps, verifies as it goes.
    pub async fn planner_run(&self, goals: &str) -> Result<Option<planner::BuildPlan>> {
        let dispatcher = self.dispatcher();
        let engine = engine::CodeEngine::new(&self.project_root, &self.paths);
        let store = store::SpecStore::new(&self.paths);
        let blockers = blockers::BlockerStore::new(&self.paths);
        let decisions = decisions::DecisionLog::new(&self.paths);
        let exec_config = self.exec_config();

        let runner = exec::SpecRunner {
            engine: &engine,
            dispatcher: &dispatcher,
            store: &store,
            blockers: &blockers,
            decisions: &decisions,
            config: &exec_config,
        };
        let builder = planner::PlannerBuilder {
            runner: &runner,
            paths: &self.paths,
            app_url: self.config.app.url.clone(),
        };

        let mut budget = self.cycle_budget();
        let Some(mut plan) = builder.plan(goals, &mut budget).await? else {
            return Ok(None);
        };
        builder.build(&mut plan, &mut budget).await?;
        Ok(Some(plan))
    }

    /// React to active blockers through the auto-fixer.
    pub async fn auto_fix_pass(&self) -> Result<Vec<planner::FixResult>> {
        let dispatcher = self.dispatcher();
        let engine = engine::CodeEngine::new(&self.project_root, &self.paths);
        let store = store::SpecStore::new(&self.paths);
        let blockers = blockers::BlockerStore::new(&self.paths);
        let decisions = decisions::DecisionLog::new(&self.paths);
        let exec_config = self.exec_config();

        let runner = exec::SpecRunner {
            engine: &engine,
            dispatcher: &dispatcher,
            store: &store,
            blockers: &blockers,
            decisions: &decisions,
            config: &exec_config,
        };
        let builder = planner::PlannerBuilder {
            runner: &runner,
            paths: &self.paths,
            app_url: self.config.app.url.clone(),
        };

        let mut budget = self.cycle_budget();
        let mut results = vec![];
        for blocker in blockers.active() {
            if budget.exhausted() || self.is_shutting_down() {
                break;
            }
            let result = builder.auto_fix(&blocker, &mut budget).await?;
            if result.ok {
                blockers.set_status(&blocker.id, blockers::BlockerStatus::Resolved)?;
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Continuous operation: heartbeat ticks and auto-fix passes on the
    /// configured interval until the shutdown flag flips. Cycles are
    /// strictly sequential; the only parallelism lives in the host's own
    /// request handling.
    pub async fn run_forever(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.heartbeat.interval_minutes * 60);
        self.initialize()?;

        loop {
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.heartbeat_tick().await {
                tracing::error!(error = %e, "Heartbeat tick failed");
            }
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.auto_fix_pass().await {
                tracing::error!(error = %e, "Auto-fix pass failed");
            }
            tokio::time::sleep(interval).await;
        }
        Ok(())
    }
}

fn identity_dir(project_root: &Path) -> PathBuf {
    let dedicated = project_root.join("identity");
    if dedicated.is_dir() {
        dedicated
    } else {
        project_root.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_dir_prefers_dedicated() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(identity_dir(dir.path()), dir.path());
        std::fs::create_dir_all(dir.path().join("identity")).unwrap();
        assert_eq!(identity_dir(dir.path()), dir.path().join("identity"));
    }
}
