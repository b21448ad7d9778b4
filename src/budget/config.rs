//! Budget configuration.
//!
//! Loaded from `~/.crewly/budgets.yaml` with global, per-project, and
//! per-agent blocks. Resolution is most-specific-wins per limit
//! (agent > project > global); a limit no block specifies is
//! unbounded. The model rate table ships with defaults and can be
//! overridden in the same file.

use crate::constants::DEFAULT_WARNING_THRESHOLD;
use crate::{CrewlyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Limits for one budget scope. Every field optional; absent means
/// unbounded (or the default threshold).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BudgetLimits {
    pub daily_limit: Option<f64>,
    pub weekly_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub warning_threshold: Option<f64>,
    pub max_tokens_per_task: Option<u64>,
}

/// Per-model token pricing, USD per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRates {
    pub input_rate: f64,
    pub output_rate: f64,
}

/// Wire shape of `budgets.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BudgetsConfig {
    #[serde(default)]
    pub global: BudgetLimits,
    #[serde(default)]
    pub projects: HashMap<String, BudgetLimits>,
    #[serde(default)]
    pub agents: HashMap<String, BudgetLimits>,
    /// Overrides and additions to the built-in rate table.
    #[serde(default)]
    pub rates: HashMap<String, ModelRates>,
}

/// Effective limits after scope resolution.
#[derive(Debug, Clone)]
pub struct EffectiveBudget {
    pub daily_limit: Option<f64>,
    pub weekly_limit: Option<f64>,
    pub monthly_limit: Option<f64>,
    pub warning_threshold: f64,
    pub max_tokens_per_task: Option<u64>,
}

impl BudgetsConfig {
    /// Load from `path`; a missing file yields the empty (unbounded)
    /// configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("[Budget] No budgets file at {}", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|e| CrewlyError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Resolve the effective budget for an agent working in a project.
    /// Each limit cascades agent > project > global independently.
    pub fn effective(&self, agent_id: &str, project_path: &str) -> EffectiveBudget {
        let agent = self.agents.get(agent_id);
        let project = self.projects.get(project_path);
        let chain = [agent, project, Some(&self.global)];

        fn first<T: Copy>(
            chain: &[Option<&BudgetLimits>; 3],
            pick: impl Fn(&BudgetLimits) -> Option<T>,
        ) -> Option<T> {
            chain.iter().flatten().find_map(|limits| pick(limits))
        }

        EffectiveBudget {
            daily_limit: first(&chain, |l| l.daily_limit),
            weekly_limit: first(&chain, |l| l.weekly_limit),
            monthly_limit: first(&chain, |l| l.monthly_limit),
            warning_threshold: first(&chain, |l| l.warning_threshold)
                .unwrap_or(DEFAULT_WARNING_THRESHOLD),
            max_tokens_per_task: first(&chain, |l| l.max_tokens_per_task),
        }
    }

    /// Cost rates for `model`, falling back to the `default` entry.
    pub fn rates_for(&self, model: &str) -> ModelRates {
        if let Some(rates) = self.rates.get(model) {
            return *rates;
        }
        if let Some(rates) = builtin_rates(model) {
            return rates;
        }
        self.rates
            .get("default")
            .copied()
            .unwrap_or(DEFAULT_MODEL_RATES)
    }
}

const DEFAULT_MODEL_RATES: ModelRates = ModelRates {
    input_rate: 3.0,
    output_rate: 15.0,
};

fn builtin_rates(model: &str) -> Option<ModelRates> {
    // Matched on substring so dated model ids resolve without listing
    // every release
    if model.contains("opus") {
        Some(ModelRates {
            input_rate: 15.0,
            output_rate: 75.0,
        })
    } else if model.contains("sonnet") {
        Some(ModelRates {
            input_rate: 3.0,
            output_rate: 15.0,
        })
    } else if model.contains("haiku") {
        Some(ModelRates {
            input_rate: 0.8,
            output_rate: 4.0,
        })
    } else {
        None
    }
}
