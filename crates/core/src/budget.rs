use chrono::Utc;
use serde::{Deserialize, Serialize};

use sneebly_provider::{ModelInfo, ModelTier, Usage};

/// Per-cycle dollar ledger. Mutated only by the dispatcher; read by the
/// orchestrator between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub max: f64,
    pub warning: f64,
    pub spent: f64,
    #[serde(rename = "warnedAt", default, skip_serializing_if = "Option::is_none")]
    pub warned_at: Option<String>,
}

impl BudgetLedger {
    pub fn new(max: f64, warning: f64) -> Self {
        Self {
            max,
            warning,
            spent: 0.0,
            warned_at: None,
        }
    }

    /// Gate a call before it happens: the estimated cost must fit under
    /// the hard cap.
    pub fn would_exceed(&self, estimated_cost: f64) -> bool {
        self.spent + estimated_cost > self.max
    }

    /// Cost of a completed call: real token accounting when available,
    /// otherwise the tier-flat estimate.
    pub fn cost_of(model: &ModelInfo, tier: ModelTier, usage: Option<&Usage>) -> f64 {
        match usage {
            Some(usage) if usage.input_tokens + usage.output_tokens > 0 => model.cost(usage),
            _ => tier.flat_cost(),
        }
    }

    /// Deduct after a successful call. Spending only ever increases.
    pub fn charge(&mut self, cost: f64) {
        self.spent += cost.max(0.0);
        if self.spent >= self.warning && self.warned_at.is_none() {
            self.warned_at = Some(Utc::now().to_rfc3339());
            tracing::warn!(spent = self.spent, warning = self.warning, "Budget warning threshold crossed");
        }
    }

    pub fn exhausted(&self) -> bool {
        self.spent >= self.max
    }

    pub fn remaining(&self) -> f64 {
        (self.max - self.spent).max(0.0)
    }

    /// Fresh ledger for the next cycle.
    pub fn reset(&mut self) {
        self.spent = 0.0;
        self.warned_at = None;
    }
}
