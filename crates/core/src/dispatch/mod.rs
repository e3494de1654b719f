pub mod parse;
pub mod prompt;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde_json::Value;

use sneebly_provider::{ChatRequest, Message, ModelTier, Provider};

use crate::budget::BudgetLedger;
pub use parse::Parsed;

const MAX_RETRIES: u32 = 2;
const INITIAL_BACKOFF_MS: u64 = 2_000;
const MAX_BACKOFF_MS: u64 = 120_000;

/// Closed set of subagents. Each variant fixes its task framing, its reply
/// contract, and its default model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubagentKind {
    ErrorResolver,
    PerfOptimizer,
    CodebaseIntel,
    SelfImprover,
    SpecExecutor,
    ElonAnalyst,
    ElonEvaluator,
    ElonBuilder,
}

impl SubagentKind {
    pub fn name(&self) -> &'static str {
        match self {
            SubagentKind::ErrorResolver => "error-resolver",
            SubagentKind::PerfOptimizer => "perf-optimizer",
            SubagentKind::CodebaseIntel => "codebase-intel",
            SubagentKind::SelfImprover => "self-improver",
            SubagentKind::SpecExecutor => "spec-executor",
            SubagentKind::ElonAnalyst => "elon-analyst",
            SubagentKind::ElonEvaluator => "elon-evaluator",
            SubagentKind::ElonBuilder => "elon-builder",
        }
    }

    pub fn default_tier(&self) -> ModelTier {
        match self {
            SubagentKind::ErrorResolver => ModelTier::Sonnet,
            SubagentKind::PerfOptimizer => ModelTier::Sonnet,
            SubagentKind::CodebaseIntel => ModelTier::Haiku,
            SubagentKind::SelfImprover => ModelTier::Sonnet,
            SubagentKind::SpecExecutor => ModelTier::Sonnet,
            SubagentKind::ElonAnalyst => ModelTier::Opus,
            SubagentKind::ElonEvaluator => ModelTier::Haiku,
            SubagentKind::ElonBuilder => ModelTier::Sonnet,
        }
    }

    pub fn definition(&self) -> &'static str {
        match self {
            SubagentKind::ErrorResolver => {
                "You resolve runtime errors in the host application. The task \
                 payload contains a deduplicated error with its signature and \
                 occurrence counts. Reply with a single JSON object describing \
                 a fix spec: {\"status\", \"filePath\", \"description\", \
                 \"successCriteria\", and the change fields your action needs}. \
                 If the error cannot be fixed from the given context, reply \
                 {\"status\": \"stuck\", \"reason\": \"...\"}."
            }
            SubagentKind::PerfOptimizer => {
                "You analyse performance snapshots of the host application and \
                 propose one optimisation spec as a JSON object with \"status\", \
                 \"filePath\", \"description\", and \"successCriteria\". Only \
                 propose changes with a measurable effect on response times."
            }
            SubagentKind::CodebaseIntel => {
                "You survey the host codebase and report findings worth turning \
                 into improvement specs. Reply with a JSON object \
                 {\"status\": \"findings\", \"findings\": [...]}, each finding \
                 naming a file, an observation, and a suggested action."
            }
            SubagentKind::SelfImprover => {
                "You review recent decisions, blockers, and failed specs, and \
                 propose process adjustments. Reply with a JSON object \
                 {\"status\": \"findings\", \"findings\": [...]}. You never \
                 propose edits to identity files."
            }
            SubagentKind::SpecExecutor => {
                "You execute one change spec against the current code. Reply \
                 with exactly one of: the token SPEC_COMPLETE when the spec's \
                 success criteria are already met; a JSON object \
                 {\"status\": \"change\", \"filePath\", \"oldCode\", \"newCode\"}; \
                 {\"status\": \"multi-change\", \"changes\": [...]}; \
                 {\"status\": \"create\", \"filePath\", \"content\"}; \
                 {\"status\": \"multi-create\", \"files\": [...]}; or \
                 {\"status\": \"stuck\", \"reason\": \"...\"}. oldCode must be \
                 copied exactly from the current code."
            }
            SubagentKind::ElonAnalyst => {
                "You identify the single most-blocking constraint on the \
                 declared goals. Reply with one JSON object containing \
                 \"currentGoal\", \"limitingFactor\" {\"description\", \"why\", \
                 \"unblocks\", \"score\" (1-10), \"category\", \"evidence\"}, an \
                 ordered \"plan\" of step specs, \"verificationPages\", and \
                 \"completionCriteria\". Never name authentication-gated API \
                 responses as the constraint."
            }
            SubagentKind::ElonEvaluator => {
                "You judge whether a constraint has been resolved. The payload \
                 contains the completion criteria and fresh crawl evidence. \
                 Reply with {\"status\": \"resolved\"} or {\"status\": \"active\"}, \
                 plus an \"evidence\" list supporting the verdict."
            }
            SubagentKind::ElonBuilder => {
                "You turn goals and current state into an ordered build plan. \
                 Reply with a JSON object {\"status\": \"plan\", \"steps\": \
                 [{\"id\", \"action\", \"filePath\", \"description\", \
                 \"dependsOn\"}]}. Steps must form a dependency graph with no \
                 cycles."
            }
        }
    }
}

/// A structured task for one subagent call. The payload is data the core
/// assembled itself; external fragments inside it were already sanitised
/// and wrapped at the point of capture.
#[derive(Debug, Clone)]
pub struct SubagentTask {
    pub kind: SubagentKind,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Budget gate refused the call; nothing was sent.
    Skipped { reason: String },
    /// Dry-run: the assembled prompt, nothing was sent.
    DryRun {
        system_prompt: String,
        user_message: String,
    },
    /// Vendor error after retries were exhausted.
    Failed { kind: String, message: String },
    /// A reply came back and was parsed.
    Completed {
        parsed: Parsed,
        raw: String,
        cost: f64,
    },
}

/// Single entry point for every LLM call.
pub struct Dispatcher {
    provider: Arc<dyn Provider>,
    identity_dir: PathBuf,
    completion_patterns: Vec<String>,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn Provider>,
        identity_dir: PathBuf,
        completion_patterns: Vec<String>,
    ) -> Self {
        Self {
            provider,
            identity_dir,
            completion_patterns,
        }
    }

    pub async fn dispatch(
        &self,
        task: &SubagentTask,
        budget: &mut BudgetLedger,
        memory_tail: &str,
        tier_override: Option<ModelTier>,
        dry_run: bool,
    ) -> Result<DispatchOutcome> {
        let tier = tier_override.unwrap_or_else(|| task.kind.default_tier());
        let model = self.provider.model_for_tier(tier).clone();

        if budget.would_exceed(tier.flat_cost()) {
            tracing::info!(agent = task.kind.name(), "Dispatch skipped: budget exceeded");
            return Ok(DispatchOutcome::Skipped {
                reason: "budget-exceeded".to_string(),
            });
        }

        let system_prompt =
            prompt::assemble_system_prompt(&self.identity_dir, memory_tail, task.kind.definition());
        let user_message = serde_json::to_string_pretty(&task.payload)?;

        if dry_run {
            return Ok(DispatchOutcome::DryRun {
                system_prompt,
                user_message,
            });
        }

        let request = ChatRequest {
            model: model.id.to_string(),
            system: Some(system_prompt),
            messages: vec![Message::user(user_message)],
            max_tokens: Some(model.max_output_tokens.min(8192)),
            temperature: None,
        };

        let mut attempt = 0u32;
        let response = loop {
            match self.provider.chat(&request).await {
                Ok(response) => break response,
                Err(e) => {
                    let allowed = e.max_retries().min(MAX_RETRIES);
                    if e.is_retryable() && attempt < allowed {
                        let wait = e.retry_after_ms().unwrap_or_else(|| {
                            (INITIAL_BACKOFF_MS << attempt).min(MAX_BACKOFF_MS)
                        });
                        let jitter = rand::rng().random_range(0..500);
                        tracing::warn!(
                            agent = task.kind.name(),
                            kind = e.kind(),
                            attempt,
                            wait_ms = wait + jitter,
                            "Vendor error, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(wait + jitter)).await;
                        attempt += 1;
                        continue;
                    }
                    tracing::error!(agent = task.kind.name(), kind = e.kind(), "Vendor error");
                    return Ok(DispatchOutcome::Failed {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        };

        let cost = BudgetLedger::cost_of(&model, tier, response.usage.as_ref());
        budget.charge(cost);

        let parsed = parse::parse_response(&response.content, &self.completion_patterns);
        let parsed = validate_actionable(parsed);

        Ok(DispatchOutcome::Completed {
            parsed,
            raw: response.content,
            cost,
        })
    }
}

/// Safety-kernel validation of parsed actionable objects. A failure
/// downgrades the action to queued with the validation reason.
fn validate_actionable(parsed: Parsed) -> Parsed {
    let Parsed::Object(value) = &parsed else {
        return parsed;
    };

    let mut problems = vec![];

    let mut check_path = |path: Option<&str>| {
        if let Some(path) = path {
            if let Err(e) = sneebly_safety::validate_write_path(path) {
                problems.push(e.to_string());
            }
        }
    };

    check_path(value.get("filePath").and_then(|v| v.as_str()));
    if let Some(changes) = value.get("changes").and_then(|v| v.as_array()) {
        for change in changes {
            check_path(change.get("filePath").and_then(|v| v.as_str()));
        }
    }
    if let Some(files) = value.get("files").and_then(|v| v.as_array()) {
        for file in files {
            check_path(file.get("filePath").and_then(|v| v.as_str()));
        }
    }

    for key in ["newCode", "content"] {
        if let Some(code) = value.get(key).and_then(|v| v.as_str()) {
            if let Err(e) = sneebly_safety::validate_code(code) {
                problems.push(e.to_string());
            }
        }
    }

    if problems.is_empty() {
        parsed
    } else {
        tracing::warn!(?problems, "Actionable response failed validation");
        Parsed::Queue {
            reason: format!("validation-failed: {}", problems.join("; ")),
            raw: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sneebly_provider::{ChatResponse, ModelInfo, Usage, VendorError};

    struct MockProvider {
        calls: AtomicUsize,
        responses: Mutex<Vec<Result<ChatResponse, VendorError>>>,
    }

    impl MockProvider {
        fn with(responses: Vec<Result<ChatResponse, VendorError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                responses: Mutex::new(responses),
            })
        }

        fn reply(text: &str) -> Result<ChatResponse, VendorError> {
            Ok(ChatResponse {
                content: text.to_string(),
                usage: Some(Usage {
                    input_tokens: 100,
                    output_tokens: 50,
                }),
                stop_reason: None,
            })
        }
    }

    static MOCK_MODELS: &[ModelInfo] = &[
        ModelInfo {
            id: "mock-haiku",
            name: "mock haiku",
            tier: ModelTier::Haiku,
            context_window: 100_000,
            max_output_tokens: 4096,
            input_price_per_m: 1.0,
            output_price_per_m: 1.0,
        },
        ModelInfo {
            id: "mock-sonnet",
            name: "mock sonnet",
            tier: ModelTier::Sonnet,
            context_window: 100_000,
            max_output_tokens: 4096,
            input_price_per_m: 3.0,
            output_price_per_m: 15.0,
        },
        ModelInfo {
            id: "mock-opus",
            name: "mock opus",
            tier: ModelTier::Opus,
            context_window: 100_000,
            max_output_tokens: 4096,
            input_price_per_m: 15.0,
            output_price_per_m: 75.0,
        },
    ];

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn supported_models(&self) -> &[ModelInfo] {
            MOCK_MODELS
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse, VendorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .remove(0)
        }
    }

    fn dispatcher(provider: Arc<MockProvider>) -> (tempfile::TempDir, Dispatcher) {
        let dir = tempfile::tempdir().unwrap();
        let patterns = sneebly_config::Config::default().parser.completion_patterns;
        let d = Dispatcher::new(provider, dir.path().to_path_buf(), patterns);
        (dir, d)
    }

    fn task() -> SubagentTask {
        SubagentTask {
            kind: SubagentKind::SpecExecutor,
            payload: serde_json::json!({"spec": {"id": "s1"}}),
        }
    }

    #[tokio::test]
    async fn test_budget_gate_blocks_without_calling() {
        let provider = MockProvider::with(vec![]);
        let (_dir, dispatcher) = dispatcher(provider.clone());
        let mut budget = BudgetLedger::new(0.02, 0.01);

        let task = SubagentTask {
            kind: SubagentKind::ElonAnalyst, // opus tier, flat $0.10
            payload: serde_json::json!({}),
        };
        let outcome = dispatcher
            .dispatch(&task, &mut budget, "", None, false)
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Skipped { reason } => assert_eq!(reason, "budget-exceeded"),
            other => panic!("expected skip, got {other:?}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(budget.spent, 0.0);
    }

    #[tokio::test]
    async fn test_successful_dispatch_charges_real_cost() {
        let provider = MockProvider::with(vec![MockProvider::reply("SPEC_COMPLETE")]);
        let (_dir, dispatcher) = dispatcher(provider);
        let mut budget = BudgetLedger::new(1.0, 0.75);

        let outcome = dispatcher
            .dispatch(&task(), &mut budget, "", None, false)
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Completed { parsed, cost, .. } => {
                assert_eq!(parsed, Parsed::Complete);
                // 100 in @ $3/M + 50 out @ $15/M.
                assert!((cost - 0.00105).abs() < 1e-9);
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(budget.spent > 0.0);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let provider = MockProvider::with(vec![Err(VendorError::Auth("bad key".into()))]);
        let (_dir, dispatcher) = dispatcher(provider.clone());
        let mut budget = BudgetLedger::new(1.0, 0.75);

        let outcome = dispatcher
            .dispatch(&task(), &mut budget, "", None, false)
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Failed { kind, .. } => assert_eq!(kind, "auth"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(budget.spent, 0.0);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_with_retry_after() {
        let provider = MockProvider::with(vec![
            Err(VendorError::RateLimit {
                retry_after_ms: Some(10),
            }),
            MockProvider::reply("SPEC_COMPLETE"),
        ]);
        let (_dir, dispatcher) = dispatcher(provider.clone());
        let mut budget = BudgetLedger::new(1.0, 0.75);

        let outcome = dispatcher
            .dispatch(&task(), &mut budget, "", None, false)
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Completed { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_retried_once_then_fails() {
        let provider = MockProvider::with(vec![
            Err(VendorError::Unreachable("refused".into())),
            Err(VendorError::Unreachable("refused".into())),
            MockProvider::reply("never reached"),
        ]);
        let (_dir, dispatcher) = dispatcher(provider.clone());
        let mut budget = BudgetLedger::new(1.0, 0.75);

        let outcome = dispatcher
            .dispatch(&task(), &mut budget, "", None, false)
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Failed { kind, .. } => assert_eq!(kind, "unreachable"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let provider = MockProvider::with(vec![]);
        let (_dir, dispatcher) = dispatcher(provider.clone());
        let mut budget = BudgetLedger::new(1.0, 0.75);

        let outcome = dispatcher
            .dispatch(&task(), &mut budget, "", None, true)
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::DryRun { system_prompt, .. } => {
                assert!(system_prompt.contains("SECURITY"));
            }
            other => panic!("expected dry run, got {other:?}"),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_traversal_response_downgraded() {
        let provider = MockProvider::with(vec![MockProvider::reply(
            r#"{"status": "change", "filePath": "../secrets.txt", "oldCode": "a", "newCode": "b"}"#,
        )]);
        let (_dir, dispatcher) = dispatcher(provider);
        let mut budget = BudgetLedger::new(1.0, 0.75);

        let outcome = dispatcher
            .dispatch(&task(), &mut budget, "", None, false)
            .await
            .unwrap();
        match outcome {
            DispatchOutcome::Completed { parsed, .. } => match parsed {
                Parsed::Queue { reason, .. } => assert!(reason.starts_with("validation-failed")),
                other => panic!("expected queue, got {other:?}"),
            },
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
